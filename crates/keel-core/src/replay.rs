// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deterministic replay engine.
//!
//! One call to [`ReplayEngine::execute`] is one attempt: load the journal,
//! run the handler from the top against it, and classify what happened.
//! The engine never loops; retrying and resuming are the scheduler's job.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tracing::{info, instrument, warn};

use crate::callbacks::CallbackCorrelator;
use crate::config::TimeoutPolicy;
use crate::context::{Context, ObjectContext, SuspendReason};
use crate::error::{CoreError, HandlerError, TerminalError};
use crate::ids::{EntityKey, InvocationId};
use crate::journal::JournalStore;
use crate::persistence::{InvocationRecord, NewInvocation, Persistence};
use crate::registry::{HandlerFn, HandlerRegistry};
use crate::state::StateStore;
use crate::types::{InvocationRequest, ServiceKind};

/// Classified result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The handler returned a value.
    Completed(Vec<u8>),
    /// The invocation ends with a terminal error.
    Failed(TerminalError),
    /// The invocation waits for a callback or a timer.
    Suspended(SuspendReason),
    /// Transient failure; run the invocation again later.
    Retry(String),
}

/// One attempt's outcome plus the invocations it sent.
#[derive(Debug)]
pub struct Attempt {
    /// What happened.
    pub outcome: AttemptOutcome,
    /// Invocations created by `send` during this attempt.
    pub spawned: Vec<InvocationId>,
}

impl Attempt {
    fn alone(outcome: AttemptOutcome) -> Self {
        Self {
            outcome,
            spawned: Vec::new(),
        }
    }
}

/// Invocation accepted by [`ReplayEngine::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    /// Id the invocation is stored under. For a resubmitted workflow this
    /// is the id of the original run.
    pub invocation_id: InvocationId,
    /// Entity it is serialized on.
    pub entity: EntityKey,
    /// `false` when an existing invocation was returned.
    pub created: bool,
}

/// Runs handler attempts against their journals.
pub struct ReplayEngine {
    pub(crate) persistence: Arc<dyn Persistence>,
    pub(crate) journal: JournalStore,
    pub(crate) state: StateStore,
    pub(crate) callbacks: CallbackCorrelator,
    pub(crate) registry: HandlerRegistry,
    pub(crate) timeout_policy: TimeoutPolicy,
}

impl ReplayEngine {
    /// Wire an engine over one persistence backend.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        registry: HandlerRegistry,
        callbacks: CallbackCorrelator,
        timeout_policy: TimeoutPolicy,
    ) -> Self {
        Self {
            journal: JournalStore::new(persistence.clone()),
            state: StateStore::new(persistence.clone()),
            persistence,
            callbacks,
            registry,
            timeout_policy,
        }
    }

    /// Validate a request against the registry and store it as a pending
    /// invocation under `invocation_id`.
    ///
    /// Keyed services require a key. Workflows default their id to the
    /// invocation id and run once per id: submitting an existing workflow id
    /// returns the original run. Re-admitting an existing invocation id is a
    /// no-op.
    #[instrument(skip(self, request), fields(service = %request.service, handler = %request.handler))]
    pub async fn admit(
        &self,
        request: InvocationRequest,
        invocation_id: InvocationId,
        parent: Option<InvocationId>,
    ) -> Result<Admitted, CoreError> {
        let kind = self.registry.get(&request.service, &request.handler)?.kind();
        let key = match (kind, request.key) {
            (ServiceKind::Keyed, Some(key)) => key,
            (ServiceKind::Keyed, None) => {
                return Err(CoreError::ValidationError {
                    field: "key".to_string(),
                    message: format!("keyed service '{}' requires a key", request.service),
                });
            }
            (ServiceKind::Workflow, key) => key.unwrap_or_else(|| invocation_id.to_string()),
        };
        let entity = EntityKey::new(request.service, key);

        let run_at = request
            .delay
            .and_then(|delay| chrono::Duration::from_std(delay).ok())
            .and_then(|delay| Utc::now().checked_add_signed(delay));

        let created = self
            .persistence
            .insert_invocation(&NewInvocation {
                invocation_id: invocation_id.clone(),
                entity: entity.clone(),
                handler: request.handler,
                kind,
                input: request.input,
                run_at,
                parent,
            })
            .await?;

        if created {
            info!(invocation_id = %invocation_id, entity = %entity, "invocation accepted");
            return Ok(Admitted {
                invocation_id,
                entity,
                created,
            });
        }

        if let Some(existing) = self.persistence.get_invocation(invocation_id.as_str()).await? {
            return Ok(Admitted {
                invocation_id: existing.id(),
                entity: existing.entity(),
                created,
            });
        }

        if kind == ServiceKind::Workflow
            && let Some(existing) = self
                .persistence
                .find_workflow_run(&entity.service, &entity.key)
                .await?
        {
            info!(invocation_id = %existing.invocation_id, entity = %entity, "workflow already submitted");
            return Ok(Admitted {
                invocation_id: existing.id(),
                entity,
                created,
            });
        }

        Err(CoreError::DatabaseError {
            operation: "insert_invocation".to_string(),
            details: format!("invocation '{}' was neither inserted nor found", invocation_id),
        })
    }

    /// Run one attempt of `record`.
    #[instrument(skip(self, record), fields(invocation_id = %record.invocation_id, service = %record.service, handler = %record.handler))]
    pub async fn execute(self: &Arc<Self>, record: &InvocationRecord) -> Attempt {
        if record.cancel_requested {
            info!("invocation cancelled");
            return Attempt::alone(AttemptOutcome::Failed(TerminalError::cancelled()));
        }

        let handler = match self.registry.get(&record.service, &record.handler) {
            Ok(handler) => handler.clone(),
            Err(e) => {
                return Attempt::alone(AttemptOutcome::Failed(TerminalError::with_code(
                    TerminalError::NOT_FOUND,
                    e.to_string(),
                )));
            }
        };

        let id = record.id();
        let entries = match self.journal.read_all(&id).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to load journal");
                return Attempt::alone(AttemptOutcome::Retry(e.to_string()));
            }
        };

        let ctx = Context::new(self.clone(), id, record.entity(), entries);
        let input = record.input.clone();
        let future = match handler {
            HandlerFn::Keyed(f) => f(ObjectContext::new(ctx.clone()), input),
            HandlerFn::Workflow(f) => f(ctx.clone(), input),
        };
        let result = AssertUnwindSafe(future).catch_unwind().await;
        let effects = ctx.take_effects();

        let outcome = match (effects.poisoned, effects.suspension, result) {
            (Some(poison), _, _) => classify(poison),
            (None, Some(reason), _) => AttemptOutcome::Suspended(reason),
            (None, None, Err(panic)) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(%message, "handler panicked");
                AttemptOutcome::Retry(format!("handler panicked: {}", message))
            }
            (None, None, Ok(Ok(output))) => AttemptOutcome::Completed(output),
            (None, None, Ok(Err(HandlerError::Suspended))) => AttemptOutcome::Retry(
                "handler reported suspension without awaiting a callback or timer".to_string(),
            ),
            (None, None, Ok(Err(err))) => classify(err),
        };

        Attempt {
            outcome,
            spawned: effects.spawned,
        }
    }
}

fn classify(err: HandlerError) -> AttemptOutcome {
    match err {
        HandlerError::Terminal(err) => AttemptOutcome::Failed(err),
        HandlerError::Retryable(message) => AttemptOutcome::Retry(message),
        HandlerError::Divergence { .. } => AttemptOutcome::Failed(TerminalError::with_code(
            TerminalError::JOURNAL_MISMATCH,
            err.to_string(),
        )),
        HandlerError::Suspended => {
            AttemptOutcome::Retry("suspended without a pending wait".to_string())
        }
    }
}
