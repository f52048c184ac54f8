// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable engine runtime.
//!
//! [`Engine`] wires persistence, the replay engine, the scheduler and the
//! callback correlator together. Starting it recovers every invocation left
//! unfinished by a previous process.
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_core::{Engine, HandlerRegistry, InvocationRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut registry = HandlerRegistry::new();
//!     registry.keyed("Counter", "add", |ctx, input| async move {
//!         let n: u64 = ctx.get("count").await?.unwrap_or(0);
//!         ctx.set("count", &(n + 1)).await?;
//!         Ok(input)
//!     })?;
//!
//!     let engine = Engine::builder()
//!         .registry(registry)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let output = engine
//!         .invoke(InvocationRequest::new("Counter", "add", vec![]).with_key("a"))
//!         .await?;
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, instrument};

use crate::callbacks::{CallbackCorrelator, CallbackResult, Completion};
use crate::config::Config;
use crate::error::{CoreError, TerminalError};
use crate::ids::{CallbackId, EntityKey, InvocationId};
use crate::journal::JournalEntry;
use crate::persistence::{InvocationRecord, Persistence, SqlitePersistence};
use crate::registry::HandlerRegistry;
use crate::replay::ReplayEngine;
use crate::scheduler::Scheduler;
use crate::types::InvocationRequest;

/// Builder for an [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    registry: HandlerRegistry,
    config: Config,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl EngineBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing persistence layer. Without one, the engine connects
    /// to `config.database_url` on start.
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the handlers the engine can run.
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the engine configuration.
    ///
    /// Default: [`Config::default`] (in-memory database).
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration.
    pub fn build(self) -> Result<EngineConfig> {
        if self.config.max_concurrent_invocations == 0 {
            anyhow::bail!("max_concurrent_invocations must be greater than 0");
        }
        if self.config.retry.max_attempts == Some(0) {
            anyhow::bail!("retry.max_attempts must be greater than 0");
        }

        Ok(EngineConfig {
            persistence: self.persistence,
            registry: self.registry,
            config: self.config,
        })
    }
}

/// Validated configuration for an [`Engine`].
pub struct EngineConfig {
    persistence: Option<Arc<dyn Persistence>>,
    registry: HandlerRegistry,
    config: Config,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("persistence", &"...")
            .field("config", &self.config)
            .finish()
    }
}

impl EngineConfig {
    /// Connect storage if needed, start the scheduler and recover unfinished
    /// invocations.
    pub async fn start(self) -> Result<Engine> {
        let persistence = match self.persistence {
            Some(persistence) => persistence,
            None => Arc::new(SqlitePersistence::connect(&self.config.database_url).await?)
                as Arc<dyn Persistence>,
        };

        let callbacks = CallbackCorrelator::new(persistence.clone(), self.config.callback_timeout);
        let replay = Arc::new(ReplayEngine::new(
            persistence.clone(),
            self.registry,
            callbacks.clone(),
            self.config.callback_timeout_policy,
        ));
        let scheduler = Scheduler::new(
            replay,
            self.config.retry.clone(),
            self.config.max_concurrent_invocations as usize,
        );

        let recovered = scheduler.recover().await?;
        info!(
            recovered,
            max_concurrent = self.config.max_concurrent_invocations,
            "Engine started"
        );

        Ok(Engine {
            persistence,
            scheduler,
            callbacks,
        })
    }
}

/// A running engine.
///
/// Cheap to clone; all clones drive the same scheduler. Call
/// [`shutdown`](Self::shutdown) to stop background work.
#[derive(Clone)]
pub struct Engine {
    persistence: Arc<dyn Persistence>,
    scheduler: Scheduler,
    callbacks: CallbackCorrelator,
}

impl Engine {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Submit an invocation without waiting for it.
    pub async fn submit(&self, request: InvocationRequest) -> Result<InvocationId, CoreError> {
        self.scheduler.submit(request).await
    }

    /// Wait for an invocation's outcome.
    pub async fn attach(
        &self,
        invocation_id: &InvocationId,
    ) -> Result<std::result::Result<Vec<u8>, TerminalError>, CoreError> {
        Ok(self.scheduler.attach(invocation_id).await?.into_result())
    }

    /// Submit an invocation and wait for its outcome.
    ///
    /// The outer error is an engine fault; the inner one is the handler's
    /// terminal failure.
    #[instrument(skip(self, request), fields(service = %request.service, handler = %request.handler))]
    pub async fn invoke(
        &self,
        request: InvocationRequest,
    ) -> Result<std::result::Result<Vec<u8>, TerminalError>, CoreError> {
        let invocation_id = self.submit(request).await?;
        self.attach(&invocation_id).await
    }

    /// Deliver the result of an external operation. An accepted completion
    /// resumes the invocation waiting on it.
    pub async fn complete_callback(
        &self,
        callback_id: &CallbackId,
        result: CallbackResult,
    ) -> Result<Completion, CoreError> {
        let completion = self.callbacks.complete(callback_id, result).await?;
        if let Completion::Accepted { invocation_id } = &completion {
            self.scheduler.resume(invocation_id);
        }
        Ok(completion)
    }

    /// Complete a callback with a terminal `cancelled` error.
    pub async fn cancel_callback(&self, callback_id: &CallbackId) -> Result<Completion, CoreError> {
        let completion = self.callbacks.cancel(callback_id).await?;
        if let Completion::Accepted { invocation_id } = &completion {
            self.scheduler.resume(invocation_id);
        }
        Ok(completion)
    }

    /// Cancel an invocation. It ends FAILED with code 409 the next time it
    /// is scheduled. Returns `false` if it is unknown or already finished.
    pub async fn cancel(&self, invocation_id: &InvocationId) -> Result<bool, CoreError> {
        self.scheduler.cancel(invocation_id).await
    }

    /// Current record of an invocation.
    pub async fn invocation(
        &self,
        invocation_id: &InvocationId,
    ) -> Result<Option<InvocationRecord>, CoreError> {
        self.persistence.get_invocation(invocation_id.as_str()).await
    }

    /// Journal of an invocation, ordered by index.
    pub async fn journal(&self, invocation_id: &InvocationId) -> Result<Vec<JournalEntry>, CoreError> {
        crate::journal::JournalStore::new(self.persistence.clone())
            .read_all(invocation_id)
            .await
    }

    /// All state slots of an entity.
    pub async fn state(&self, entity: &EntityKey) -> Result<BTreeMap<String, Vec<u8>>, CoreError> {
        crate::state::StateStore::new(self.persistence.clone())
            .entries(entity)
            .await
    }

    /// Whether the storage backend answers queries.
    pub async fn health_check(&self) -> Result<bool, CoreError> {
        self.persistence.health_check_db().await
    }

    /// Get a reference to the persistence layer.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Stop timers and abandon running attempts. Unfinished invocations are
    /// recovered by the next engine started on the same storage.
    pub async fn shutdown(&self) {
        info!("Engine shutting down...");
        self.scheduler.shutdown().await;
        info!("Engine shutdown complete");
    }

    /// Check if the engine still accepts work.
    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }
}
