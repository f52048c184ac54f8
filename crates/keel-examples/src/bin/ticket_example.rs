// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ticket Example - Serialized access to one seat.
//!
//! Two reservations for the same seat are submitted back to back; the second
//! one runs only after the first finished and sees the seat taken.
//!
//! Run with: cargo run -p keel-examples --bin ticket_example

use keel_core::{Engine, EntityKey, HandlerRegistry, InvocationRequest};
use keel_examples::ticket;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    keel_examples::init_tracing();
    let config = keel_examples::load_config();

    info!("=== Ticket Example: per-seat serialization ===");

    let mut registry = HandlerRegistry::new();
    ticket::register(&mut registry)?;

    let engine = Engine::builder()
        .registry(registry)
        .config(config)
        .build()?
        .start()
        .await?;

    let seat = "seat-42";
    let request = |handler: &str| InvocationRequest::new(ticket::SERVICE, handler, vec![]).with_key(seat);

    let first = engine.submit(request("reserve")).await?;
    let second = engine.submit(request("reserve")).await?;

    let first: bool = serde_json::from_slice(&engine.attach(&first).await?.map_err(anyhow::Error::new)?)?;
    let second: bool = serde_json::from_slice(&engine.attach(&second).await?.map_err(anyhow::Error::new)?)?;
    info!(first, second, "reservations");

    engine
        .invoke(request("mark_as_sold"))
        .await?
        .map_err(anyhow::Error::new)?;
    engine
        .invoke(request("unreserve"))
        .await?
        .map_err(anyhow::Error::new)?;

    let state = engine.state(&EntityKey::new(ticket::SERVICE, seat)).await?;
    for (slot, value) in &state {
        info!(slot = %slot, value = %String::from_utf8_lossy(value), "final state");
    }

    engine.shutdown().await;
    info!("=== Ticket Example Complete ===");
    Ok(())
}
