// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handler registry: the closed table of `(service, handler) -> function`
//! built before the engine starts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::context::{Context, ObjectContext};
use crate::error::{CoreError, HandlerResult};
use crate::types::ServiceKind;

/// Handler of a keyed service.
pub type KeyedHandler =
    Arc<dyn Fn(ObjectContext, Vec<u8>) -> BoxFuture<'static, HandlerResult<Vec<u8>>> + Send + Sync>;

/// Handler of a workflow service.
pub type WorkflowHandler =
    Arc<dyn Fn(Context, Vec<u8>) -> BoxFuture<'static, HandlerResult<Vec<u8>>> + Send + Sync>;

/// A registered handler, tagged with the capabilities it receives.
#[derive(Clone)]
pub enum HandlerFn {
    /// Receives [`ObjectContext`] with access to the entity's state.
    Keyed(KeyedHandler),
    /// Receives [`Context`]; no keyed state.
    Workflow(WorkflowHandler),
}

impl HandlerFn {
    /// Service kind this handler belongs to.
    pub fn kind(&self) -> ServiceKind {
        match self {
            Self::Keyed(_) => ServiceKind::Keyed,
            Self::Workflow(_) => ServiceKind::Workflow,
        }
    }
}

impl std::fmt::Debug for HandlerFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HandlerFn").field(&self.kind()).finish()
    }
}

#[derive(Debug, Clone)]
struct Service {
    kind: ServiceKind,
    handlers: HashMap<String, HandlerFn>,
}

/// All services known to an engine.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    services: HashMap<String, Service>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler of a keyed service.
    pub fn keyed<F, Fut>(&mut self, service: &str, handler: &str, f: F) -> Result<(), CoreError>
    where
        F: Fn(ObjectContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Vec<u8>>> + Send + 'static,
    {
        let f: KeyedHandler = Arc::new(move |ctx, input| f(ctx, input).boxed());
        self.insert(service, handler, HandlerFn::Keyed(f))
    }

    /// Register a handler of a workflow service.
    pub fn workflow<F, Fut>(&mut self, service: &str, handler: &str, f: F) -> Result<(), CoreError>
    where
        F: Fn(Context, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Vec<u8>>> + Send + 'static,
    {
        let f: WorkflowHandler = Arc::new(move |ctx, input| f(ctx, input).boxed());
        self.insert(service, handler, HandlerFn::Workflow(f))
    }

    fn insert(&mut self, service: &str, handler: &str, f: HandlerFn) -> Result<(), CoreError> {
        let kind = f.kind();
        let entry = self
            .services
            .entry(service.to_string())
            .or_insert_with(|| Service {
                kind,
                handlers: HashMap::new(),
            });

        if entry.kind != kind {
            return Err(CoreError::ValidationError {
                field: "service".to_string(),
                message: format!(
                    "service '{}' is {} and cannot take a {} handler",
                    service,
                    entry.kind.as_str(),
                    kind.as_str()
                ),
            });
        }
        if entry.handlers.contains_key(handler) {
            return Err(CoreError::ValidationError {
                field: "handler".to_string(),
                message: format!("'{}/{}' is already registered", service, handler),
            });
        }

        entry.handlers.insert(handler.to_string(), f);
        Ok(())
    }

    /// Resolve a handler.
    pub fn get(&self, service: &str, handler: &str) -> Result<&HandlerFn, CoreError> {
        self.services
            .get(service)
            .and_then(|s| s.handlers.get(handler))
            .ok_or_else(|| CoreError::HandlerNotFound {
                service: service.to_string(),
                handler: handler.to_string(),
            })
    }

    /// Kind of a registered service.
    pub fn kind(&self, service: &str) -> Option<ServiceKind> {
        self.services.get(service).map(|s| s.kind)
    }
}
