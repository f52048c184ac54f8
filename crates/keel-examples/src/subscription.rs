// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Subscription sign-up keyed by user.
//!
//! One recurring payment is created, then one subscription per product.
//! Every call to the billing backend is journaled, so a retry after a crash
//! only repeats the calls that had not finished.

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::error::CoreError;
use keel_core::{HandlerRegistry, HandlerResult, ObjectContext};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Service name.
pub const SERVICE: &str = "SubscriptionService";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub user_id: String,
    pub credit_card: String,
    pub subscriptions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResult {
    pub success: bool,
    pub payment_ref: String,
}

/// Billing backend the service calls out to.
#[async_trait]
pub trait Billing: Send + Sync {
    /// Create a recurring payment and return its reference.
    async fn create_recurring_payment(
        &self,
        credit_card: &str,
        payment_id: &str,
    ) -> HandlerResult<String>;

    /// Subscribe `user_id` to `subscription`, paid through `payment_ref`.
    async fn create_subscription(
        &self,
        user_id: &str,
        subscription: &str,
        payment_ref: &str,
    ) -> HandlerResult<()>;
}

/// Billing stand-in that only logs.
#[derive(Debug, Default, Clone)]
pub struct LoggingBilling;

#[async_trait]
impl Billing for LoggingBilling {
    async fn create_recurring_payment(
        &self,
        credit_card: &str,
        payment_id: &str,
    ) -> HandlerResult<String> {
        info!(payment_id, card_len = credit_card.len(), "created recurring payment");
        Ok(format!("payref-{}", payment_id))
    }

    async fn create_subscription(
        &self,
        user_id: &str,
        subscription: &str,
        payment_ref: &str,
    ) -> HandlerResult<()> {
        info!(user_id, subscription, payment_ref, "created subscription");
        Ok(())
    }
}

/// Create the recurring payment and every requested subscription.
pub async fn add(
    ctx: ObjectContext,
    billing: Arc<dyn Billing>,
    request: SubscriptionRequest,
) -> HandlerResult<SubscriptionResult> {
    let payment_id = ctx.random_uuid().await?.to_string();

    let payment_ref = ctx
        .run("recurring payment", || {
            let billing = billing.clone();
            let card = request.credit_card.clone();
            async move { billing.create_recurring_payment(&card, &payment_id).await }
        })
        .await?;

    for subscription in &request.subscriptions {
        let name = format!("create subscription {}", subscription);
        ctx.run(&name, || {
            let billing = billing.clone();
            let user = ctx.key().to_string();
            let payment_ref = payment_ref.clone();
            async move {
                billing
                    .create_subscription(&user, subscription, &payment_ref)
                    .await
            }
        })
        .await?;
    }

    Ok(SubscriptionResult {
        success: true,
        payment_ref,
    })
}

/// Register `add`, calling out to `billing`.
pub fn register(registry: &mut HandlerRegistry, billing: Arc<dyn Billing>) -> Result<(), CoreError> {
    registry.keyed(SERVICE, "add", move |ctx, input| {
        let billing = billing.clone();
        async move {
            let request: SubscriptionRequest = keel_core::json::from_bytes(&input)?;
            keel_core::json::to_bytes(&add(ctx, billing, request).await?)
        }
    })
}
