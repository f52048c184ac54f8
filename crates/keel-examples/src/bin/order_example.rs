// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Order Example - Waiting on external callbacks.
//!
//! Orders suspend while the restaurant cooks and while a driver is found.
//! With `RESTAURANT_ENDPOINT` set the restaurant is called over HTTP and is
//! expected to complete the callback itself; otherwise a simulated kitchen
//! and driver pool answer in random order.
//!
//! Run with: cargo run -p keel-examples --bin order_example

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{CallbackId, Engine, HandlerRegistry, HandlerResult, InvocationRequest};
use keel_examples::delivery::{
    self, Dispatch, Order, OrderReceipt, Restaurant, RestaurantClient, RestaurantConfig,
};
use tokio::sync::mpsc;
use tracing::info;

/// Forwards every request to the simulator loop in `main`.
struct Simulated {
    tx: mpsc::UnboundedSender<(String, CallbackId, Duration)>,
}

#[async_trait]
impl Restaurant for Simulated {
    async fn prepare(&self, order_id: &str, callback_id: &CallbackId) -> HandlerResult<()> {
        let cook_time = Duration::from_millis(200 + 100 * (order_id.len() as u64 % 5));
        let _ = self
            .tx
            .send((format!("{} ready", order_id), callback_id.clone(), cook_time));
        Ok(())
    }
}

#[async_trait]
impl Dispatch for Simulated {
    async fn request_driver(&self, order: &Order, callback_id: &CallbackId) -> HandlerResult<()> {
        let driver = format!("driver-{}", order.delivery_address.len() % 7);
        let _ = self
            .tx
            .send((driver, callback_id.clone(), Duration::from_millis(150)));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    keel_examples::init_tracing();
    let config = keel_examples::load_config();

    info!("=== Order Example: suspended orders and callbacks ===");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let simulated = Arc::new(Simulated { tx });
    let restaurant: Arc<dyn Restaurant> = match std::env::var("RESTAURANT_ENDPOINT") {
        Ok(_) => Arc::new(RestaurantClient::new(RestaurantConfig::from_env())?),
        Err(_) => simulated.clone(),
    };

    let mut registry = HandlerRegistry::new();
    delivery::register(&mut registry, restaurant, simulated)?;

    let engine = Engine::builder()
        .registry(registry)
        .config(config)
        .build()?
        .start()
        .await?;

    let simulator = engine.clone();
    tokio::spawn(async move {
        while let Some((payload, callback_id, delay)) = rx.recv().await {
            let engine = simulator.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                match engine.complete_callback(&callback_id, Ok(payload.into_bytes())).await {
                    Ok(completion) => info!(callback_id = %callback_id, ?completion, "callback delivered"),
                    Err(e) => tracing::error!(callback_id = %callback_id, error = %e, "callback failed"),
                }
            });
        }
    });

    let mut ids = Vec::new();
    for (order_id, address) in [("order-1", "Main St 1"), ("order-22", "Harbour Rd 14"), ("order-333", "Elm 3")] {
        let order = Order {
            order_id: order_id.to_string(),
            restaurant_id: "pizzeria".to_string(),
            items: vec!["margherita".to_string()],
            delivery_address: address.to_string(),
        };
        let request = InvocationRequest::new(delivery::SERVICE, "process", serde_json::to_vec(&order)?)
            .with_key(order_id);
        ids.push(engine.submit(request).await?);
    }

    for id in &ids {
        let output = engine.attach(id).await?.map_err(anyhow::Error::new)?;
        let receipt: OrderReceipt = serde_json::from_slice(&output)?;
        info!(order_id = %receipt.order_id, preparation = %receipt.preparation, driver = %receipt.driver, "order delivered");
    }

    engine.shutdown().await;
    info!("=== Order Example Complete ===");
    Ok(())
}
