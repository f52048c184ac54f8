// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request/response calls between invocations: the caller suspends until the
//! callee finishes and continues with its outcome.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::*;
use keel_core::journal::JournalEntry;
use keel_core::{CallbackId, InvocationId, InvocationRequest, InvocationStatus, TerminalError};
use tokio::sync::mpsc;

/// `Checkout/run` calls `Warehouse/pick` on the key given as input and
/// wraps its answer.
fn checkout(r: &mut keel_core::HandlerRegistry) {
    r.workflow("Checkout", "run", |ctx, input| async move {
        let sku = String::from_utf8_lossy(&input).to_string();
        let picked = ctx
            .call(InvocationRequest::new("Warehouse", "pick", input).with_key(sku))
            .await?;
        let mut output = b"checkout:".to_vec();
        output.extend(picked);
        Ok(output)
    })
    .unwrap();
}

#[tokio::test]
async fn test_call_returns_callee_output() {
    let picks = Arc::new(AtomicUsize::new(0));
    let counter = picks.clone();
    let ctx = TestContext::new(registry_with(move |r| {
        checkout(r);
        r.keyed("Warehouse", "pick", move |wh, _input| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let left: u32 = wh.get("stock").await?.unwrap_or(3);
                wh.set("stock", &(left - 1)).await?;
                Ok(format!("{}", left - 1).into_bytes())
            }
        })
        .unwrap();
    }))
    .await;

    let id = ctx
        .engine
        .submit(InvocationRequest::new("Checkout", "run", b"sku-1".to_vec()))
        .await
        .unwrap();
    assert_eq!(ctx.engine.attach(&id).await.unwrap().unwrap(), b"checkout:2");
    assert_eq!(picks.load(Ordering::SeqCst), 1);

    let callee = InvocationId::derived(&id, 0);
    let record = ctx.engine.invocation(&callee).await.unwrap().unwrap();
    assert_eq!(record.parent_invocation_id.as_deref(), Some(id.as_str()));
    assert_eq!(record.entity_key, "sku-1");

    let journal = ctx.engine.journal(&id).await.unwrap();
    let shape: Vec<String> = journal.iter().map(|e| e.describe()).collect();
    assert_eq!(
        shape,
        vec![
            "call(Warehouse/pick)".to_string(),
            format!("result({})", callee),
        ]
    );
    assert!(matches!(
        &journal[0],
        JournalEntry::CallScheduled { awaited: true, invocation_id, .. } if *invocation_id == callee
    ));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_caller_waits_for_suspended_callee() {
    let (tx, mut rx) = mpsc::unbounded_channel::<CallbackId>();
    let ctx = TestContext::new(registry_with(move |r| {
        checkout(r);
        r.keyed("Warehouse", "pick", move |wh, _input| {
            let tx = tx.clone();
            async move {
                let awakeable = wh.awakeable().await?;
                let _ = tx.send(awakeable.id.clone());
                wh.await_awakeable(&awakeable).await
            }
        })
        .unwrap();
    }))
    .await;

    let id = ctx
        .engine
        .submit(InvocationRequest::new("Checkout", "run", b"sku-9".to_vec()))
        .await
        .unwrap();
    let callback_id = rx.recv().await.unwrap();
    let callee = InvocationId::derived(&id, 0);
    ctx.wait_for_status(&callee, InvocationStatus::Suspended).await;
    ctx.wait_for_status(&id, InvocationStatus::Suspended).await;

    ctx.engine
        .complete_callback(&callback_id, Ok(b"shelf-4".to_vec()))
        .await
        .unwrap();
    assert_eq!(
        ctx.engine.attach(&id).await.unwrap().unwrap(),
        b"checkout:shelf-4"
    );

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_callee_failure_reaches_caller() {
    let ctx = TestContext::new(registry_with(|r| {
        checkout(r);
        r.keyed("Warehouse", "pick", |_wh, _input| async {
            Err(TerminalError::with_code(422, "out of stock").into())
        })
        .unwrap();
    }))
    .await;

    let id = ctx
        .engine
        .submit(InvocationRequest::new("Checkout", "run", b"sku-0".to_vec()))
        .await
        .unwrap();
    let err = ctx.engine.attach(&id).await.unwrap().unwrap_err();
    assert_eq!(err.code, 422);
    assert_eq!(err.message, "out of stock");

    // The failure is journaled for the caller like any result.
    let journal = ctx.engine.journal(&id).await.unwrap();
    assert!(matches!(
        &journal[1],
        JournalEntry::CallCompleted { outcome: keel_core::Outcome::Failure(e), .. } if e.code == 422
    ));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_callee_fails_the_call() {
    let (tx, mut rx) = mpsc::unbounded_channel::<CallbackId>();
    let ctx = TestContext::new(registry_with(move |r| {
        checkout(r);
        r.keyed("Warehouse", "pick", move |wh, _input| {
            let tx = tx.clone();
            async move {
                let awakeable = wh.awakeable().await?;
                let _ = tx.send(awakeable.id.clone());
                wh.await_awakeable(&awakeable).await
            }
        })
        .unwrap();
    }))
    .await;

    let id = ctx
        .engine
        .submit(InvocationRequest::new("Checkout", "run", b"sku-3".to_vec()))
        .await
        .unwrap();
    rx.recv().await.unwrap();
    let callee = InvocationId::derived(&id, 0);
    ctx.wait_for_status(&callee, InvocationStatus::Suspended).await;

    assert!(ctx.engine.cancel(&callee).await.unwrap());
    let err = ctx.engine.attach(&id).await.unwrap().unwrap_err();
    assert_eq!(err, TerminalError::cancelled());

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_call_to_own_key_is_rejected() {
    let ctx = TestContext::new(registry_with(|r| {
        r.keyed("Account", "transfer", |acct, input| async move {
            let own = acct.key().to_string();
            let result = acct
                .call(InvocationRequest::new("Account", "balance", input).with_key(own))
                .await;
            match result {
                Err(keel_core::HandlerError::Terminal(err)) => Ok(err.code.to_string().into_bytes()),
                other => panic!("expected a terminal rejection, got {:?}", other),
            }
        })
        .unwrap();
        r.keyed("Account", "balance", |_acct, _input| async { Ok(b"0".to_vec()) })
            .unwrap();
    }))
    .await;

    let output = ctx
        .engine
        .invoke(InvocationRequest::new("Account", "transfer", vec![]).with_key("acct-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(output, b"400");

    let id = ctx
        .engine
        .submit(InvocationRequest::new("Account", "transfer", vec![]).with_key("acct-2"))
        .await
        .unwrap();
    ctx.engine.attach(&id).await.unwrap().unwrap();
    assert!(ctx.engine.journal(&id).await.unwrap().is_empty());
    assert!(
        ctx.engine
            .invocation(&InvocationId::derived(&id, 0))
            .await
            .unwrap()
            .is_none()
    );

    ctx.shutdown().await;
}
