// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for keel-core integration tests.
//!
//! Provides [`TestContext`] for starting an engine over in-memory or file
//! backed SQLite, and [`FaultyPersistence`] for simulating a crash between a
//! side effect and its journal write.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use keel_core::config::Config;
use keel_core::error::CoreError;
use keel_core::ids::{EntityKey, InvocationId};
use keel_core::persistence::{
    AppendOutcome, CallbackRecord, InvocationRecord, JournalAppend, JournalRecord, NewInvocation,
    Persistence, SqlitePersistence, StateMutation, StateRecord,
};
use keel_core::retry::RetryPolicy;
use keel_core::types::{InvocationStatus, Outcome};
use keel_core::{Engine, HandlerRegistry};

/// Retry policy that keeps tests fast.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
        max_attempts: None,
    }
}

/// Engine configuration for tests.
pub fn test_config() -> Config {
    Config {
        retry: fast_retry(),
        ..Config::default()
    }
}

/// Engine plus the storage it runs on.
pub struct TestContext {
    pub engine: Engine,
    pub persistence: Arc<FaultyPersistence>,
}

impl TestContext {
    /// Start an engine over a fresh in-memory database.
    pub async fn new(registry: HandlerRegistry) -> Self {
        Self::with_config(registry, test_config()).await
    }

    /// Start an engine over a fresh in-memory database with `config`.
    pub async fn with_config(registry: HandlerRegistry, config: Config) -> Self {
        let sqlite = SqlitePersistence::in_memory()
            .await
            .expect("Failed to open in-memory database");
        Self::start(Arc::new(FaultyPersistence::new(sqlite)), registry, config).await
    }

    /// Start an engine over a database file, recovering whatever a previous
    /// engine left there.
    pub async fn open(path: &Path, registry: HandlerRegistry) -> Self {
        let sqlite = SqlitePersistence::from_path(path)
            .await
            .expect("Failed to open database file");
        Self::start(Arc::new(FaultyPersistence::new(sqlite)), registry, test_config()).await
    }

    async fn start(persistence: Arc<FaultyPersistence>, registry: HandlerRegistry, config: Config) -> Self {
        let engine = Engine::builder()
            .persistence(persistence.clone())
            .registry(registry)
            .config(config)
            .build()
            .expect("Failed to build engine")
            .start()
            .await
            .expect("Failed to start engine");

        Self {
            engine,
            persistence,
        }
    }

    /// Current status of an invocation.
    pub async fn status(&self, invocation_id: &InvocationId) -> InvocationStatus {
        self.engine
            .invocation(invocation_id)
            .await
            .expect("Failed to read invocation")
            .expect("Invocation not found")
            .status()
            .expect("Invalid status")
    }

    /// Poll until the invocation reaches `status`.
    pub async fn wait_for_status(&self, invocation_id: &InvocationId, status: InvocationStatus) {
        wait_until(|| async { self.status(invocation_id).await == status }).await;
    }

    /// Stop background work.
    pub async fn shutdown(self) {
        self.engine.shutdown().await;
    }
}

/// Poll `condition` every 5ms for up to five seconds.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Registers `handler` and returns the registry, for one-liners.
pub fn registry_with(f: impl FnOnce(&mut HandlerRegistry)) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    f(&mut registry);
    registry
}

struct Fault {
    kind: String,
    skip: usize,
}

/// Persistence wrapper that fails one chosen journal append.
///
/// The failure happens before anything is written, the way a process crash
/// right after a side effect would lose its journal entry.
pub struct FaultyPersistence {
    inner: SqlitePersistence,
    fault: Mutex<Option<Fault>>,
    injected: AtomicUsize,
}

impl FaultyPersistence {
    pub fn new(inner: SqlitePersistence) -> Self {
        Self {
            inner,
            fault: Mutex::new(None),
            injected: AtomicUsize::new(0),
        }
    }

    /// Fail the append of the `nth` (0-based) new entry of `kind`, once.
    pub fn fail_append(&self, kind: &str, nth: usize) {
        *self.fault.lock().unwrap() = Some(Fault {
            kind: kind.to_string(),
            skip: nth,
        });
    }

    /// How many failures were injected so far.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    pub fn sqlite(&self) -> &SqlitePersistence {
        &self.inner
    }

    fn check(&self, entry: &JournalAppend<'_>) -> Result<(), CoreError> {
        let mut fault = self.fault.lock().unwrap();
        let Some(f) = fault.as_mut() else {
            return Ok(());
        };
        if f.kind != entry.kind {
            return Ok(());
        }
        if f.skip > 0 {
            f.skip -= 1;
            return Ok(());
        }

        *fault = None;
        self.injected.fetch_add(1, Ordering::SeqCst);
        Err(CoreError::DatabaseError {
            operation: "append_journal_entry".to_string(),
            details: format!("injected failure at index {}", entry.index),
        })
    }
}

#[async_trait]
impl Persistence for FaultyPersistence {
    async fn insert_invocation(&self, invocation: &NewInvocation) -> Result<bool, CoreError> {
        self.inner.insert_invocation(invocation).await
    }

    async fn get_invocation(
        &self,
        invocation_id: &str,
    ) -> Result<Option<InvocationRecord>, CoreError> {
        self.inner.get_invocation(invocation_id).await
    }

    async fn find_workflow_run(
        &self,
        service: &str,
        workflow_id: &str,
    ) -> Result<Option<InvocationRecord>, CoreError> {
        self.inner.find_workflow_run(service, workflow_id).await
    }

    async fn update_invocation_status(
        &self,
        invocation_id: &str,
        status: InvocationStatus,
    ) -> Result<(), CoreError> {
        self.inner.update_invocation_status(invocation_id, status).await
    }

    async fn record_attempt(&self, invocation_id: &str, attempt: u32) -> Result<(), CoreError> {
        self.inner.record_attempt(invocation_id, attempt).await
    }

    async fn record_failure(&self, invocation_id: &str, message: &str) -> Result<u32, CoreError> {
        self.inner.record_failure(invocation_id, message).await
    }

    async fn complete_invocation(
        &self,
        invocation_id: &str,
        outcome: &Outcome,
    ) -> Result<bool, CoreError> {
        self.inner.complete_invocation(invocation_id, outcome).await
    }

    async fn request_cancellation(&self, invocation_id: &str) -> Result<bool, CoreError> {
        self.inner.request_cancellation(invocation_id).await
    }

    async fn list_unfinished_invocations(&self) -> Result<Vec<InvocationRecord>, CoreError> {
        self.inner.list_unfinished_invocations().await
    }

    async fn append_journal_entry(
        &self,
        entry: JournalAppend<'_>,
    ) -> Result<AppendOutcome, CoreError> {
        self.check(&entry)?;
        self.inner.append_journal_entry(entry).await
    }

    async fn append_state_write(
        &self,
        entry: JournalAppend<'_>,
        mutation: StateMutation<'_>,
    ) -> Result<AppendOutcome, CoreError> {
        self.check(&entry)?;
        self.inner.append_state_write(entry, mutation).await
    }

    async fn read_journal(&self, invocation_id: &str) -> Result<Vec<JournalRecord>, CoreError> {
        self.inner.read_journal(invocation_id).await
    }

    async fn get_state(
        &self,
        entity: &EntityKey,
        slot: &str,
    ) -> Result<Option<Vec<u8>>, CoreError> {
        self.inner.get_state(entity, slot).await
    }

    async fn set_state(
        &self,
        entity: &EntityKey,
        slot: &str,
        value: &[u8],
    ) -> Result<(), CoreError> {
        self.inner.set_state(entity, slot, value).await
    }

    async fn clear_state(&self, entity: &EntityKey, slot: &str) -> Result<(), CoreError> {
        self.inner.clear_state(entity, slot).await
    }

    async fn list_state(&self, entity: &EntityKey) -> Result<Vec<StateRecord>, CoreError> {
        self.inner.list_state(entity).await
    }

    async fn insert_callback(
        &self,
        callback_id: &str,
        invocation_id: &str,
        entry_index: u32,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        self.inner
            .insert_callback(callback_id, invocation_id, entry_index, deadline)
            .await
    }

    async fn get_callback(&self, callback_id: &str) -> Result<Option<CallbackRecord>, CoreError> {
        self.inner.get_callback(callback_id).await
    }

    async fn complete_callback(
        &self,
        callback_id: &str,
        outcome_json: &str,
    ) -> Result<bool, CoreError> {
        self.inner.complete_callback(callback_id, outcome_json).await
    }

    async fn set_callback_deadline(
        &self,
        callback_id: &str,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        self.inner.set_callback_deadline(callback_id, deadline).await
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        self.inner.health_check_db().await
    }
}
