// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Food order scenario: callbacks arrive out of order across orders and each
//! order resumes with exactly the payload meant for it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{
    CallbackId, Completion, Engine, HandlerError, HandlerRegistry, HandlerResult, InvocationId,
    InvocationRequest, InvocationStatus, TerminalError,
};
use keel_examples::delivery::{
    self, Dispatch, Order, OrderReceipt, Restaurant, RestaurantClient, RestaurantConfig,
};
use tokio::sync::mpsc;

#[derive(Debug)]
enum Request {
    Prepare { order_id: String, callback_id: CallbackId },
    Driver { order_id: String, callback_id: CallbackId },
}

struct Recorder {
    tx: mpsc::UnboundedSender<Request>,
    reject: Option<String>,
}

#[async_trait]
impl Restaurant for Recorder {
    async fn prepare(&self, order_id: &str, callback_id: &CallbackId) -> HandlerResult<()> {
        if self.reject.as_deref() == Some(order_id) {
            return Err(TerminalError::with_code(422, "kitchen closed").into());
        }
        let _ = self.tx.send(Request::Prepare {
            order_id: order_id.to_string(),
            callback_id: callback_id.clone(),
        });
        Ok(())
    }
}

#[async_trait]
impl Dispatch for Recorder {
    async fn request_driver(&self, order: &Order, callback_id: &CallbackId) -> HandlerResult<()> {
        let _ = self.tx.send(Request::Driver {
            order_id: order.order_id.clone(),
            callback_id: callback_id.clone(),
        });
        Ok(())
    }
}

async fn engine(reject: Option<&str>) -> (Engine, mpsc::UnboundedReceiver<Request>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let recorder = Arc::new(Recorder {
        tx,
        reject: reject.map(str::to_string),
    });

    let mut registry = HandlerRegistry::new();
    delivery::register(&mut registry, recorder.clone(), recorder).unwrap();
    let engine = Engine::builder()
        .registry(registry)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    (engine, rx)
}

async fn submit(engine: &Engine, order_id: &str) -> InvocationId {
    let order = Order {
        order_id: order_id.to_string(),
        restaurant_id: "trattoria".to_string(),
        items: vec!["lasagne".to_string()],
        delivery_address: "Canal St 5".to_string(),
    };
    engine
        .submit(
            InvocationRequest::new(delivery::SERVICE, "process", serde_json::to_vec(&order).unwrap())
                .with_key(order_id),
        )
        .await
        .unwrap()
}

async fn wait_suspended(engine: &Engine, id: &InvocationId) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = engine.invocation(id).await.unwrap().unwrap();
        if record.status().unwrap() == InvocationStatus::Suspended {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "order never suspended");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Receive one request of each order, keyed by order id.
async fn collect(rx: &mut mpsc::UnboundedReceiver<Request>, n: usize) -> Vec<(String, CallbackId)> {
    let mut out = Vec::new();
    for _ in 0..n {
        match rx.recv().await.unwrap() {
            Request::Prepare { order_id, callback_id } | Request::Driver { order_id, callback_id } => {
                out.push((order_id, callback_id))
            }
        }
    }
    out.sort_by(|x, y| x.0.cmp(&y.0));
    out
}

#[tokio::test]
async fn test_out_of_order_callbacks() {
    let (engine, mut rx) = engine(None).await;

    let a = submit(&engine, "order-a").await;
    let b = submit(&engine, "order-b").await;
    let kitchen = collect(&mut rx, 2).await;
    wait_suspended(&engine, &a).await;
    wait_suspended(&engine, &b).await;

    // The kitchen finishes b first.
    for (order_id, callback_id) in kitchen.iter().rev() {
        let completion = engine
            .complete_callback(callback_id, Ok(format!("{} cooked", order_id).into_bytes()))
            .await
            .unwrap();
        assert!(matches!(completion, Completion::Accepted { .. }));
    }

    let drivers = collect(&mut rx, 2).await;
    for (order_id, callback_id) in &drivers {
        let driver = if order_id == "order-a" { "anna" } else { "bob" };
        engine
            .complete_callback(callback_id, Ok(driver.as_bytes().to_vec()))
            .await
            .unwrap();
    }

    let receipt_a: OrderReceipt =
        serde_json::from_slice(&engine.attach(&a).await.unwrap().unwrap()).unwrap();
    let receipt_b: OrderReceipt =
        serde_json::from_slice(&engine.attach(&b).await.unwrap().unwrap()).unwrap();

    assert_eq!(receipt_a.preparation, "order-a cooked");
    assert_eq!(receipt_a.driver, "anna");
    assert_eq!(receipt_b.preparation, "order-b cooked");
    assert_eq!(receipt_b.driver, "bob");

    // After each resume the handler continued at the next journal index.
    let journal = engine.journal(&a).await.unwrap();
    let shape: Vec<(u32, String)> = journal.iter().map(|e| (e.index(), e.describe())).collect();
    assert_eq!(shape.len(), 6);
    assert_eq!(shape[0], (0, "awakeable".to_string()));
    assert_eq!(shape[1], (1, "run(request preparation)".to_string()));
    assert_eq!(shape[2].0, 2);
    assert!(shape[2].1.starts_with("await("));
    assert_eq!(shape[3], (3, "awakeable".to_string()));
    assert_eq!(shape[4], (4, "run(request driver)".to_string()));
    assert_eq!(shape[5].0, 5);

    // Late duplicate from the kitchen.
    assert_eq!(
        engine
            .complete_callback(&kitchen[0].1, Ok(b"cooked again".to_vec()))
            .await
            .unwrap(),
        Completion::Duplicate
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_rejected_order_fails() {
    let (engine, _rx) = engine(Some("order-x")).await;

    let id = submit(&engine, "order-x").await;
    let err = engine.attach(&id).await.unwrap().unwrap_err();
    assert_eq!(err.code, 422);
    assert_eq!(err.message, "kitchen closed");

    engine.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_restaurant_is_retryable() {
    let client = RestaurantClient::new(RestaurantConfig {
        endpoint: "http://127.0.0.1:1".to_string(),
        timeout: Duration::from_secs(2),
    })
    .unwrap();

    let err = client
        .prepare("order-1", &CallbackId::from("cb_test"))
        .await
        .unwrap_err();
    assert!(matches!(err, HandlerError::Retryable(_)));
}

#[test]
fn test_restaurant_config_default() {
    let config = RestaurantConfig::default();
    assert_eq!(config.endpoint, "http://localhost:5050");
}
