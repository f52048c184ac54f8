// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Restart tests: an engine started on the storage of a stopped one picks up
//! every unfinished invocation where its journal left off.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use common::*;
use keel_core::journal::JournalEntry;
use keel_core::{CallbackId, InvocationId, InvocationRequest, InvocationStatus};
use tokio::sync::mpsc;

#[tokio::test]
async fn test_suspended_invocation_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keel.db");

    let charges = Arc::new(AtomicUsize::new(0));
    let registry = |tx: mpsc::UnboundedSender<CallbackId>| {
        let charges = charges.clone();
        registry_with(move |r| {
            r.workflow("Order", "place", move |ctx, _input| {
                let (tx, charges) = (tx.clone(), charges.clone());
                async move {
                    ctx.run("charge", || async move {
                        charges.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await?;
                    let awakeable = ctx.awakeable().await?;
                    let _ = tx.send(awakeable.id.clone());
                    ctx.await_awakeable(&awakeable).await
                }
            })
            .unwrap();
        })
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let first = TestContext::open(&path, registry(tx)).await;
    let id = first
        .engine
        .submit(InvocationRequest::new("Order", "place", vec![]))
        .await
        .unwrap();
    let callback_id = rx.recv().await.unwrap();
    first.wait_for_status(&id, InvocationStatus::Suspended).await;
    first.shutdown().await;

    let (tx, _rx) = mpsc::unbounded_channel();
    let second = TestContext::open(&path, registry(tx)).await;
    assert_eq!(second.status(&id).await, InvocationStatus::Suspended);

    second
        .engine
        .complete_callback(&callback_id, Ok(b"shipped".to_vec()))
        .await
        .unwrap();
    assert_eq!(second.engine.attach(&id).await.unwrap().unwrap(), b"shipped");
    assert_eq!(charges.load(Ordering::SeqCst), 1);

    second.shutdown().await;
}

#[tokio::test]
async fn test_interrupted_attempt_replays_from_journal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keel.db");

    let step_one = Arc::new(AtomicUsize::new(0));
    let step_two = Arc::new(AtomicUsize::new(0));
    let hang = Arc::new(AtomicBool::new(true));

    let registry = || {
        let (one, two, hang) = (step_one.clone(), step_two.clone(), hang.clone());
        registry_with(move |r| {
            r.workflow("Import", "run", move |ctx, _input| {
                let (one, two, hang) = (one.clone(), two.clone(), hang.clone());
                async move {
                    ctx.run("download", || async move {
                        one.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await?;
                    ctx.run("transform", || async move {
                        two.fetch_add(1, Ordering::SeqCst);
                        if hang.load(Ordering::SeqCst) {
                            std::future::pending::<()>().await;
                        }
                        Ok(())
                    })
                    .await?;
                    Ok(b"imported".to_vec())
                }
            })
            .unwrap();
        })
    };

    let first = TestContext::open(&path, registry()).await;
    let id = first
        .engine
        .submit(InvocationRequest::new("Import", "run", vec![]))
        .await
        .unwrap();
    wait_until(|| async { step_two.load(Ordering::SeqCst) == 1 }).await;
    // Process dies mid-action.
    first.shutdown().await;
    assert_eq!(first_status(&path, &id).await, InvocationStatus::Running);

    hang.store(false, Ordering::SeqCst);
    let second = TestContext::open(&path, registry()).await;
    assert_eq!(second.engine.attach(&id).await.unwrap().unwrap(), b"imported");

    assert_eq!(step_one.load(Ordering::SeqCst), 1);
    assert_eq!(step_two.load(Ordering::SeqCst), 2);

    second.shutdown().await;
}

async fn first_status(path: &std::path::Path, id: &InvocationId) -> InvocationStatus {
    use keel_core::persistence::{Persistence, SqlitePersistence};
    let persistence = SqlitePersistence::from_path(path).await.unwrap();
    persistence
        .get_invocation(id.as_str())
        .await
        .unwrap()
        .unwrap()
        .status()
        .unwrap()
}

#[tokio::test]
async fn test_durable_sleep_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keel.db");

    let registry = || {
        registry_with(|r| {
            r.workflow("Reminder", "later", |ctx, input| async move {
                ctx.sleep(Duration::from_millis(300)).await?;
                Ok(input)
            })
            .unwrap();
        })
    };

    let started = Instant::now();
    let first = TestContext::open(&path, registry()).await;
    let id = first
        .engine
        .submit(InvocationRequest::new("Reminder", "later", b"ping".to_vec()))
        .await
        .unwrap();
    first.wait_for_status(&id, InvocationStatus::Suspended).await;
    first.shutdown().await;

    let second = TestContext::open(&path, registry()).await;
    assert_eq!(second.engine.attach(&id).await.unwrap().unwrap(), b"ping");
    assert!(started.elapsed() >= Duration::from_millis(300));

    let journal = second.engine.journal(&id).await.unwrap();
    assert_eq!(journal.len(), 1);
    assert!(matches!(journal[0], JournalEntry::TimerScheduled { index: 0, .. }));

    second.shutdown().await;
}

#[tokio::test]
async fn test_delayed_send_creates_one_child() {
    let parents = Arc::new(AtomicUsize::new(0));

    let counter = parents.clone();
    let registry = registry_with(move |r| {
        r.workflow("Trial", "start", move |ctx, input| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let child = ctx
                    .send(
                        InvocationRequest::new("Trial", "expire", input)
                            .with_key(format!("{}-expiry", ctx.key()))
                            .with_delay(Duration::from_millis(100)),
                    )
                    .await?;
                Ok(child.to_string().into_bytes())
            }
        })
        .unwrap();
        r.workflow("Trial", "expire", |_ctx, input| async move { Ok(input) })
            .unwrap();
    });

    let ctx = TestContext::new(registry).await;
    let parent = ctx
        .engine
        .submit(InvocationRequest::new("Trial", "start", b"acct-1".to_vec()).with_key("acct-1"))
        .await
        .unwrap();
    let child = InvocationId::from(
        String::from_utf8(ctx.engine.attach(&parent).await.unwrap().unwrap()).unwrap(),
    );

    assert_eq!(child, InvocationId::derived(&parent, 0));
    let record = ctx.engine.invocation(&child).await.unwrap().unwrap();
    assert_eq!(record.parent_invocation_id.as_deref(), Some(parent.as_str()));
    assert!(record.run_at.is_some());

    assert_eq!(ctx.engine.attach(&child).await.unwrap().unwrap(), b"acct-1");
    assert_eq!(parents.load(Ordering::SeqCst), 1);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_pending_invocations_recovered_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keel.db");
    let (tx, mut rx) = mpsc::unbounded_channel::<u8>();

    let registry = |tx: mpsc::UnboundedSender<u8>| {
        registry_with(move |r| {
            r.keyed("Queue", "push", move |_ctx, input| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(input[0]);
                    Ok(vec![])
                }
            })
            .unwrap();
            r.keyed("Queue", "block", |ctx, _input| async move {
                let awakeable = ctx.awakeable().await?;
                ctx.await_awakeable(&awakeable).await
            })
            .unwrap();
        })
    };

    let first = TestContext::open(&path, registry(tx.clone())).await;
    let blocker = first
        .engine
        .submit(InvocationRequest::new("Queue", "block", vec![]).with_key("q"))
        .await
        .unwrap();
    first.wait_for_status(&blocker, InvocationStatus::Suspended).await;
    let mut pushed = Vec::new();
    for i in 0..5u8 {
        let request = InvocationRequest::new("Queue", "push", vec![i]).with_key("q");
        pushed.push(first.engine.submit(request).await.unwrap());
    }
    first.shutdown().await;

    let second = TestContext::open(&path, registry(tx)).await;
    // The suspended blocker still owns the key after restart.
    assert!(second.engine.cancel(&blocker).await.unwrap());
    for id in &pushed {
        second.engine.attach(id).await.unwrap().unwrap();
    }

    let mut order = Vec::new();
    while let Ok(i) = rx.try_recv() {
        order.push(i);
    }
    assert_eq!(order, vec![0, 1, 2, 3, 4]);

    second.shutdown().await;
}

#[tokio::test]
async fn test_call_survives_restart_with_one_callee() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keel.db");

    let hang = Arc::new(AtomicBool::new(true));
    let callees = Arc::new(std::sync::Mutex::new(Vec::<InvocationId>::new()));
    let callers = Arc::new(AtomicUsize::new(0));

    let registry = || {
        let (hang, callees, callers) = (hang.clone(), callees.clone(), callers.clone());
        registry_with(move |r| {
            r.workflow("Invoice", "issue", move |ctx, input| {
                let callers = callers.clone();
                async move {
                    ctx.run("open", || async move {
                        callers.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await?;
                    let number = ctx
                        .call(InvocationRequest::new("Ledger", "next_number", input).with_key("2025"))
                        .await?;
                    Ok(number)
                }
            })
            .unwrap();
            r.keyed("Ledger", "next_number", move |ledger, _input| {
                let (hang, callees) = (hang.clone(), callees.clone());
                async move {
                    callees.lock().unwrap().push(ledger.invocation_id().clone());
                    if hang.load(Ordering::SeqCst) {
                        std::future::pending::<()>().await;
                    }
                    Ok(b"INV-0001".to_vec())
                }
            })
            .unwrap();
        })
    };

    let first = TestContext::open(&path, registry()).await;
    let id = first
        .engine
        .submit(InvocationRequest::new("Invoice", "issue", vec![]))
        .await
        .unwrap();
    wait_until(|| async { !callees.lock().unwrap().is_empty() }).await;
    first.wait_for_status(&id, InvocationStatus::Suspended).await;
    // Process dies while the callee runs.
    first.shutdown().await;

    hang.store(false, Ordering::SeqCst);
    let second = TestContext::open(&path, registry()).await;
    assert_eq!(second.engine.attach(&id).await.unwrap().unwrap(), b"INV-0001");

    let callee = InvocationId::derived(&id, 1);
    let seen = callees.lock().unwrap().clone();
    assert_eq!(seen, vec![callee.clone(), callee.clone()]);
    assert_eq!(callers.load(Ordering::SeqCst), 1);

    let journal = second.engine.journal(&id).await.unwrap();
    let scheduled: Vec<_> = journal
        .iter()
        .filter(|e| matches!(e, JournalEntry::CallScheduled { .. }))
        .collect();
    assert_eq!(scheduled.len(), 1);
    assert!(matches!(
        journal.last(),
        Some(JournalEntry::CallCompleted { invocation_id, .. }) if *invocation_id == callee
    ));
    assert_eq!(
        second
            .engine
            .invocation(&callee)
            .await
            .unwrap()
            .unwrap()
            .parent_invocation_id
            .as_deref(),
        Some(id.as_str())
    );

    second.shutdown().await;
}
