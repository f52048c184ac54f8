// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Seat reservation keyed by seat id.
//!
//! ```text
//!   Available ──reserve──► Reserved ──mark_as_sold──► Sold
//!       ▲                     │
//!       └─────unreserve───────┘
//! ```

use keel_core::error::CoreError;
use keel_core::{HandlerRegistry, HandlerResult, ObjectContext};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Service name.
pub const SERVICE: &str = "TicketService";

const STATUS: &str = "status";

/// Stored status of a seat. An absent slot means [`TicketStatus::Available`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketStatus {
    Available,
    Reserved,
    Sold,
}

async fn status(ctx: &ObjectContext) -> HandlerResult<TicketStatus> {
    Ok(ctx.get(STATUS).await?.unwrap_or(TicketStatus::Available))
}

/// Reserve an available seat. Returns whether the reservation succeeded.
pub async fn reserve(ctx: ObjectContext) -> HandlerResult<bool> {
    if status(&ctx).await? != TicketStatus::Available {
        return Ok(false);
    }

    ctx.set(STATUS, &TicketStatus::Reserved).await?;
    info!(seat = ctx.key(), "seat reserved");
    Ok(true)
}

/// Release a reservation. A sold seat stays sold. A stored value this
/// version does not understand is left alone.
pub async fn unreserve(ctx: ObjectContext) -> HandlerResult<()> {
    let Some(raw) = ctx.get_raw(STATUS).await? else {
        return Ok(());
    };

    match serde_json::from_slice::<TicketStatus>(&raw) {
        Ok(TicketStatus::Sold) => Ok(()),
        Ok(TicketStatus::Reserved | TicketStatus::Available) => {
            ctx.clear(STATUS).await?;
            info!(seat = ctx.key(), "seat released");
            Ok(())
        }
        Err(e) => {
            warn!(seat = ctx.key(), error = %e, "unknown seat status, not releasing");
            Ok(())
        }
    }
}

/// Turn a reservation into a sale. Anything but a reserved seat is unchanged.
pub async fn mark_as_sold(ctx: ObjectContext) -> HandlerResult<()> {
    if status(&ctx).await? == TicketStatus::Reserved {
        ctx.set(STATUS, &TicketStatus::Sold).await?;
        info!(seat = ctx.key(), "seat sold");
    }
    Ok(())
}

/// Register `reserve`, `unreserve` and `mark_as_sold`.
pub fn register(registry: &mut HandlerRegistry) -> Result<(), CoreError> {
    registry.keyed(SERVICE, "reserve", |ctx, _input| async move {
        keel_core::json::to_bytes(&reserve(ctx).await?)
    })?;
    registry.keyed(SERVICE, "unreserve", |ctx, _input| async move {
        unreserve(ctx).await?;
        Ok(Vec::new())
    })?;
    registry.keyed(SERVICE, "mark_as_sold", |ctx, _input| async move {
        mark_as_sold(ctx).await?;
        Ok(Vec::new())
    })?;
    Ok(())
}
