// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Subscription Example - Journaled calls to a billing backend.
//!
//! The backend fails once on the second subscription. The retry replays the
//! journal: the payment and the first subscription are not created again.
//!
//! Run with: cargo run -p keel-examples --bin subscription_example

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use keel_core::{Engine, HandlerError, HandlerRegistry, HandlerResult, InvocationRequest};
use keel_examples::subscription::{self, Billing, LoggingBilling, SubscriptionRequest, SubscriptionResult};
use tracing::{info, warn};

/// Billing that drops the connection once.
struct FlakyBilling {
    inner: LoggingBilling,
    failed: AtomicBool,
}

#[async_trait]
impl Billing for FlakyBilling {
    async fn create_recurring_payment(&self, credit_card: &str, payment_id: &str) -> HandlerResult<String> {
        self.inner.create_recurring_payment(credit_card, payment_id).await
    }

    async fn create_subscription(&self, user_id: &str, subscription: &str, payment_ref: &str) -> HandlerResult<()> {
        if subscription == "Disney+" && !self.failed.swap(true, Ordering::SeqCst) {
            warn!(subscription, "billing backend connection reset");
            return Err(HandlerError::retryable("connection reset"));
        }
        self.inner
            .create_subscription(user_id, subscription, payment_ref)
            .await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    keel_examples::init_tracing();
    let config = keel_examples::load_config();

    info!("=== Subscription Example: replay skips finished calls ===");

    let billing = Arc::new(FlakyBilling {
        inner: LoggingBilling,
        failed: AtomicBool::new(false),
    });
    let mut registry = HandlerRegistry::new();
    subscription::register(&mut registry, billing)?;

    let engine = Engine::builder()
        .registry(registry)
        .config(config)
        .build()?
        .start()
        .await?;

    let request = SubscriptionRequest {
        user_id: "sam-beckett".to_string(),
        credit_card: "1234-5678-9012-3456".to_string(),
        subscriptions: vec!["Netflix".into(), "Disney+".into(), "HBO Max".into()],
    };
    let input = serde_json::to_vec(&request)?;

    let id = engine
        .submit(InvocationRequest::new(subscription::SERVICE, "add", input).with_key(&request.user_id))
        .await?;
    let output = engine.attach(&id).await?.map_err(anyhow::Error::new)?;
    let result: SubscriptionResult = serde_json::from_slice(&output)?;
    info!(payment_ref = %result.payment_ref, "subscriptions created");

    for entry in engine.journal(&id).await? {
        info!(index = entry.index(), action = %entry.describe(), "journal");
    }

    engine.shutdown().await;
    info!("=== Subscription Example Complete ===");
    Ok(())
}
