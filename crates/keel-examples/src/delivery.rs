// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Food order workflow.
//!
//! The order asks the restaurant to prepare the food and waits for the
//! restaurant's callback, then asks for a driver and waits for a driver to
//! accept. Both waits may take minutes; the invocation is suspended in
//! between and survives restarts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::error::CoreError;
use keel_core::{CallbackId, Context, HandlerError, HandlerRegistry, HandlerResult, TerminalError};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Service name.
pub const SERVICE: &str = "OrderWorkflow";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub restaurant_id: String,
    pub items: Vec<String>,
    pub delivery_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderReceipt {
    pub order_id: String,
    /// What the restaurant reported when the food was ready.
    pub preparation: String,
    /// Driver that accepted the delivery.
    pub driver: String,
}

/// The restaurant kitchen. It completes `callback_id` once the order is ready.
#[async_trait]
pub trait Restaurant: Send + Sync {
    async fn prepare(&self, order_id: &str, callback_id: &CallbackId) -> HandlerResult<()>;
}

/// Driver matching. It completes `callback_id` with the driver id once a
/// driver accepts.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn request_driver(
        &self,
        order: &Order,
        callback_id: &CallbackId,
    ) -> HandlerResult<()>;
}

/// Restaurant endpoint configuration.
#[derive(Debug, Clone)]
pub struct RestaurantConfig {
    /// Base URL of the restaurant service.
    pub endpoint: String,
    /// Request timeout.
    pub timeout: Duration,
}

impl Default for RestaurantConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:5050".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl RestaurantConfig {
    /// Read `RESTAURANT_ENDPOINT`, keeping the default when unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(endpoint) = std::env::var("RESTAURANT_ENDPOINT") {
            config.endpoint = endpoint;
        }
        config
    }
}

#[derive(Serialize)]
struct PrepareRequest<'a> {
    cb: &'a str,
    #[serde(rename = "orderId")]
    order_id: &'a str,
}

/// HTTP client for the restaurant service.
#[derive(Debug, Clone)]
pub struct RestaurantClient {
    http: reqwest::Client,
    config: RestaurantConfig,
}

impl RestaurantClient {
    pub fn new(config: RestaurantConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl Restaurant for RestaurantClient {
    async fn prepare(&self, order_id: &str, callback_id: &CallbackId) -> HandlerResult<()> {
        let url = format!("{}/prepare", self.config.endpoint.trim_end_matches('/'));
        info!(order_id, callback_id = %callback_id, %url, "calling restaurant");

        let response = self
            .http
            .post(&url)
            .json(&PrepareRequest {
                cb: callback_id.as_str(),
                order_id,
            })
            .send()
            .await
            .map_err(|e| HandlerError::retryable(format!("restaurant unreachable: {}", e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(HandlerError::retryable(format!(
                "restaurant responded with {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(TerminalError::new(format!(
                "Prepare request to restaurant failed with status code: {}",
                status.as_u16()
            ))
            .into());
        }

        info!(order_id, %status, "restaurant accepted order");
        Ok(())
    }
}

/// Run an order to delivery.
pub async fn process(
    ctx: Context,
    restaurant: Arc<dyn Restaurant>,
    dispatch: Arc<dyn Dispatch>,
    order: Order,
) -> HandlerResult<OrderReceipt> {
    let prepared = ctx.awakeable().await?;
    ctx.run("request preparation", || {
        let (restaurant, order_id, id) = (restaurant.clone(), order.order_id.clone(), prepared.id.clone());
        async move { restaurant.prepare(&order_id, &id).await }
    })
    .await?;
    let preparation = ctx.await_awakeable(&prepared).await?;
    info!(order_id = %order.order_id, "order prepared");

    let accepted = ctx.awakeable().await?;
    ctx.run("request driver", || {
        let (dispatch, order, id) = (dispatch.clone(), order.clone(), accepted.id.clone());
        async move { dispatch.request_driver(&order, &id).await }
    })
    .await?;
    let driver = ctx.await_awakeable(&accepted).await?;
    info!(order_id = %order.order_id, "driver assigned");

    Ok(OrderReceipt {
        order_id: order.order_id,
        preparation: String::from_utf8_lossy(&preparation).into_owned(),
        driver: String::from_utf8_lossy(&driver).into_owned(),
    })
}

/// Register `process`. Submit it with the order id as key.
pub fn register(
    registry: &mut HandlerRegistry,
    restaurant: Arc<dyn Restaurant>,
    dispatch: Arc<dyn Dispatch>,
) -> Result<(), CoreError> {
    registry.workflow(SERVICE, "process", move |ctx, input| {
        let (restaurant, dispatch) = (restaurant.clone(), dispatch.clone());
        async move {
            let order: Order = keel_core::json::from_bytes(&input)?;
            keel_core::json::to_bytes(&process(ctx, restaurant, dispatch, order).await?)
        }
    })
}
