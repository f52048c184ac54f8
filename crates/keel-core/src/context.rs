// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handler-facing context.
//!
//! Every method that observes the outside world or produces a
//! nondeterministic value claims the next journal index. On the first
//! execution the work is done and the result appended before the method
//! returns; on replay the recorded result is returned instead and nothing is
//! executed again.
//!
//! Handlers must request actions in the same order on every attempt and must
//! await each action before starting the next one. Asking for something other
//! than what the journal recorded at that position is a divergence and fails
//! the invocation.
//!
//! Once an attempt is poisoned (divergence, retryable failure of an action,
//! storage error) or suspended, every further action returns the same error,
//! so a handler that swallows the error cannot make progress on a stale view.

use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::callbacks::CallbackState;
use crate::config::TimeoutPolicy;
use crate::error::{CoreError, HandlerError, HandlerResult, TerminalError};
use crate::ids::{CallbackId, EntityKey, InvocationId};
use crate::journal::JournalEntry;
use crate::json;
use crate::replay::ReplayEngine;
use crate::types::{InvocationRequest, Outcome};

/// Why an attempt stopped without an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuspendReason {
    /// Waiting for a callback completion.
    Callback {
        /// Awaited callback.
        callback_id: CallbackId,
        /// Deadline after which the timeout policy applies.
        deadline: Option<DateTime<Utc>>,
    },
    /// Waiting for a durable sleep to end.
    Timer {
        /// End of the sleep.
        wake_at: DateTime<Utc>,
    },
    /// Waiting for a called invocation to finish.
    Call {
        /// Called invocation.
        invocation_id: InvocationId,
    },
}

/// Handle to a callback created with [`Context::awakeable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Awakeable {
    /// Id to hand to the external system.
    pub id: CallbackId,
    /// Journal index that created it.
    pub index: u32,
}

/// What an attempt left behind besides the handler's return value.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub poisoned: Option<HandlerError>,
    pub suspension: Option<SuspendReason>,
    pub spawned: Vec<InvocationId>,
}

struct Cursor {
    entries: Vec<JournalEntry>,
    next: u32,
    effects: Effects,
}

struct ContextInner {
    engine: Arc<ReplayEngine>,
    invocation_id: InvocationId,
    entity: EntityKey,
    cursor: Mutex<Cursor>,
}

/// Durable context handed to every handler.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("invocation_id", &self.inner.invocation_id)
            .field("entity", &self.inner.entity)
            .finish()
    }
}

impl Context {
    pub(crate) fn new(
        engine: Arc<ReplayEngine>,
        invocation_id: InvocationId,
        entity: EntityKey,
        entries: Vec<JournalEntry>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                engine,
                invocation_id,
                entity,
                cursor: Mutex::new(Cursor {
                    entries,
                    next: 0,
                    effects: Effects::default(),
                }),
            }),
        }
    }

    /// Id of the running invocation.
    pub fn invocation_id(&self) -> &InvocationId {
        &self.inner.invocation_id
    }

    /// Key of the running invocation (workflow id for workflows).
    pub fn key(&self) -> &str {
        &self.inner.entity.key
    }

    pub(crate) fn take_effects(&self) -> Effects {
        std::mem::take(&mut self.lock().effects)
    }

    /// Run a side effect exactly once and journal its result.
    ///
    /// A terminal failure is journaled like a success and returned on every
    /// replay. Any other failure is not journaled: the attempt is abandoned
    /// and the invocation retried, re-executing `action`.
    pub async fn run<T, F, Fut>(&self, name: &str, action: F) -> HandlerResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = HandlerResult<T>>,
    {
        let (index, recorded) = self.claim()?;
        if let Some(entry) = recorded {
            return match entry {
                JournalEntry::SideEffectResult {
                    name: recorded_name,
                    outcome,
                    ..
                } if recorded_name == name => {
                    debug!(index, name, "side effect replayed from journal");
                    match outcome {
                        Outcome::Success(bytes) => json::from_bytes(&bytes),
                        Outcome::Failure(err) => Err(HandlerError::Terminal(err)),
                    }
                }
                other => Err(self.diverged(index, format!("run({})", name), &other)),
            };
        }

        match action().await {
            Ok(value) => {
                let bytes = json::to_bytes(&value)?;
                self.record(JournalEntry::SideEffectResult {
                    index,
                    name: name.to_string(),
                    outcome: Outcome::Success(bytes),
                })
                .await?;
                Ok(value)
            }
            Err(HandlerError::Terminal(err)) => {
                self.record(JournalEntry::SideEffectResult {
                    index,
                    name: name.to_string(),
                    outcome: Outcome::Failure(err.clone()),
                })
                .await?;
                Err(HandlerError::Terminal(err))
            }
            Err(HandlerError::Retryable(message)) => {
                warn!(index, name, %message, "side effect failed, attempt will be retried");
                Err(self.poison(HandlerError::Retryable(message)))
            }
            Err(other) => Err(self.poison(other)),
        }
    }

    /// Journaled random `u64`.
    pub async fn random_u64(&self) -> HandlerResult<u64> {
        let bytes = self.random_bytes().await?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[..8]);
        Ok(u64::from_be_bytes(word))
    }

    /// Journaled random v4 UUID.
    pub async fn random_uuid(&self) -> HandlerResult<Uuid> {
        let bytes = self.random_bytes().await?;
        Ok(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }

    async fn random_bytes(&self) -> HandlerResult<[u8; 16]> {
        let (index, recorded) = self.claim()?;
        let value = match recorded {
            Some(JournalEntry::RandomDraw { value, .. }) => value,
            Some(other) => return Err(self.diverged(index, "random".to_string(), &other)),
            None => {
                let mut value = vec![0u8; 16];
                rand::thread_rng().fill_bytes(&mut value);
                self.record(JournalEntry::RandomDraw {
                    index,
                    value: value.clone(),
                })
                .await?;
                value
            }
        };

        value.try_into().map_err(|_| {
            self.poison(HandlerError::Divergence {
                index,
                requested: "random".to_string(),
                recorded: "random draw of unexpected length".to_string(),
            })
        })
    }

    /// Create a callback that an external system can complete later.
    pub async fn awakeable(&self) -> HandlerResult<Awakeable> {
        let (index, recorded) = self.claim()?;
        match recorded {
            Some(JournalEntry::AwakeableCreated { callback_id, .. }) => Ok(Awakeable {
                id: callback_id,
                index,
            }),
            Some(other) => Err(self.diverged(index, "awakeable".to_string(), &other)),
            None => {
                let callback_id = self
                    .inner
                    .engine
                    .callbacks
                    .create_callback(&self.inner.invocation_id, index)
                    .await
                    .map_err(|e| self.storage_failure(e))?;
                self.record(JournalEntry::AwakeableCreated {
                    index,
                    callback_id: callback_id.clone(),
                })
                .await?;
                Ok(Awakeable {
                    id: callback_id,
                    index,
                })
            }
        }
    }

    /// Wait for an awakeable's completion.
    ///
    /// Suspends the invocation (returns [`HandlerError::Suspended`]) while
    /// the callback is pending; the invocation is re-run from the top once
    /// the completion arrives.
    pub async fn await_awakeable(&self, awakeable: &Awakeable) -> HandlerResult<Vec<u8>> {
        let (index, recorded) = self.claim()?;
        let requested = format!("await({})", awakeable.id);
        match recorded {
            Some(JournalEntry::AwakeableCompleted {
                callback_id,
                outcome,
                ..
            }) if callback_id == awakeable.id => {
                debug!(index, callback_id = %callback_id, "callback result replayed from journal");
                return outcome.into_result().map_err(HandlerError::Terminal);
            }
            Some(other) => return Err(self.diverged(index, requested, &other)),
            None => {}
        }

        let callbacks = &self.inner.engine.callbacks;
        let mut state = callbacks
            .poll(&awakeable.id)
            .await
            .map_err(|e| self.storage_failure(e))?;

        if let CallbackState::Pending {
            deadline: Some(deadline),
        } = &state
            && *deadline <= Utc::now()
        {
            match self.inner.engine.timeout_policy {
                TimeoutPolicy::Terminal => {
                    callbacks
                        .expire(&awakeable.id)
                        .await
                        .map_err(|e| self.storage_failure(e))?;
                    state = callbacks
                        .poll(&awakeable.id)
                        .await
                        .map_err(|e| self.storage_failure(e))?;
                }
                TimeoutPolicy::Retryable => {
                    callbacks
                        .rearm(&awakeable.id)
                        .await
                        .map_err(|e| self.storage_failure(e))?;
                    return Err(self.poison(HandlerError::Retryable(format!(
                        "callback {} timed out",
                        awakeable.id
                    ))));
                }
            }
        }

        match state {
            CallbackState::Completed(outcome) => {
                self.record(JournalEntry::AwakeableCompleted {
                    index,
                    callback_id: awakeable.id.clone(),
                    outcome: outcome.clone(),
                })
                .await?;
                outcome.into_result().map_err(HandlerError::Terminal)
            }
            CallbackState::Pending { deadline } => Err(self.suspend(SuspendReason::Callback {
                callback_id: awakeable.id.clone(),
                deadline,
            })),
            CallbackState::Unknown => Err(self.poison(HandlerError::Terminal(
                TerminalError::with_code(
                    TerminalError::NOT_FOUND,
                    format!("callback {} was never issued", awakeable.id),
                ),
            ))),
        }
    }

    /// Durable sleep. The wake-up time is journaled, so a replay after a
    /// restart sleeps only for what is left.
    pub async fn sleep(&self, duration: Duration) -> HandlerResult<()> {
        let (index, recorded) = self.claim()?;
        let wake_at = match recorded {
            Some(JournalEntry::TimerScheduled { wake_at, .. }) => wake_at,
            Some(other) => return Err(self.diverged(index, "sleep".to_string(), &other)),
            None => {
                let wake_at = chrono::Duration::from_std(duration)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                self.record(JournalEntry::TimerScheduled { index, wake_at })
                    .await?;
                wake_at
            }
        };

        if Utc::now() >= wake_at {
            return Ok(());
        }
        Err(self.suspend(SuspendReason::Timer { wake_at }))
    }

    /// One-way send of a new invocation, optionally delayed.
    ///
    /// The target's id is derived from this invocation and the journal
    /// index, so retrying a send never creates a second target.
    pub async fn send(&self, request: InvocationRequest) -> HandlerResult<InvocationId> {
        self.schedule(request, false).await
    }

    /// Invoke another handler and wait for its outcome.
    ///
    /// The callee is created the way [`Context::send`] creates its target.
    /// This invocation suspends until the callee completes or fails; the
    /// callee's output, or its terminal error, is the result of the call.
    ///
    /// A call to the caller's own entity is rejected with a terminal error:
    /// the callee would queue behind the caller, which keeps its key while
    /// it waits.
    pub async fn call(&self, request: InvocationRequest) -> HandlerResult<Vec<u8>> {
        if request.service == self.inner.entity.service
            && request.key.as_deref() == Some(self.inner.entity.key.as_str())
        {
            return Err(HandlerError::Terminal(TerminalError::with_code(
                TerminalError::BAD_REQUEST,
                format!("{} cannot call its own key", self.inner.entity),
            )));
        }

        let callee = self.schedule(request, true).await?;
        self.await_call(&callee).await
    }

    async fn await_call(&self, callee: &InvocationId) -> HandlerResult<Vec<u8>> {
        let (index, recorded) = self.claim()?;
        match recorded {
            Some(JournalEntry::CallCompleted {
                invocation_id,
                outcome,
                ..
            }) if invocation_id == *callee => {
                debug!(index, callee = %callee, "call result replayed from journal");
                return outcome.into_result().map_err(HandlerError::Terminal);
            }
            Some(other) => return Err(self.diverged(index, format!("result({})", callee), &other)),
            None => {}
        }

        let record = self
            .inner
            .engine
            .persistence
            .get_invocation(callee.as_str())
            .await
            .map_err(|e| self.storage_failure(e))?;
        let Some(record) = record else {
            return Err(self.poison(HandlerError::Terminal(TerminalError::with_code(
                TerminalError::NOT_FOUND,
                format!("called invocation {} does not exist", callee),
            ))));
        };

        match record.outcome() {
            Some(outcome) => {
                self.record(JournalEntry::CallCompleted {
                    index,
                    invocation_id: callee.clone(),
                    outcome: outcome.clone(),
                })
                .await?;
                outcome.into_result().map_err(HandlerError::Terminal)
            }
            None => Err(self.suspend(SuspendReason::Call {
                invocation_id: callee.clone(),
            })),
        }
    }

    async fn schedule(&self, request: InvocationRequest, awaited: bool) -> HandlerResult<InvocationId> {
        let (index, recorded) = self.claim()?;
        if let Some(entry) = recorded {
            return match entry {
                JournalEntry::CallScheduled {
                    service,
                    handler,
                    invocation_id,
                    awaited: recorded_awaited,
                    ..
                } if service == request.service
                    && handler == request.handler
                    && recorded_awaited == awaited =>
                {
                    Ok(invocation_id)
                }
                other => {
                    let verb = if awaited { "call" } else { "send" };
                    Err(self.diverged(
                        index,
                        format!("{}({}/{})", verb, request.service, request.handler),
                        &other,
                    ))
                }
            };
        }

        let child = InvocationId::derived(&self.inner.invocation_id, index);
        let service = request.service.clone();
        let handler = request.handler.clone();
        let admitted = self
            .inner
            .engine
            .admit(request, child, Some(self.inner.invocation_id.clone()))
            .await
            .map_err(|e| match e {
                CoreError::HandlerNotFound { .. } | CoreError::ValidationError { .. } => {
                    HandlerError::Terminal(TerminalError::with_code(
                        TerminalError::NOT_FOUND,
                        e.to_string(),
                    ))
                }
                other => self.storage_failure(other),
            })?;

        self.record(JournalEntry::CallScheduled {
            index,
            service,
            handler,
            key: admitted.entity.key.clone(),
            invocation_id: admitted.invocation_id.clone(),
            awaited,
        })
        .await?;

        self.lock()
            .effects
            .spawned
            .push(admitted.invocation_id.clone());
        Ok(admitted.invocation_id)
    }

    fn lock(&self) -> MutexGuard<'_, Cursor> {
        self.inner
            .cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the next journal index, returning what was recorded there.
    fn claim(&self) -> HandlerResult<(u32, Option<JournalEntry>)> {
        let mut cursor = self.lock();
        if let Some(err) = &cursor.effects.poisoned {
            return Err(err.clone());
        }
        if cursor.effects.suspension.is_some() {
            return Err(HandlerError::Suspended);
        }

        let index = cursor.next;
        cursor.next += 1;
        let recorded = cursor.entries.get(index as usize).cloned();
        Ok((index, recorded))
    }

    async fn record(&self, entry: JournalEntry) -> HandlerResult<()> {
        let result = match &entry {
            JournalEntry::StateWrite { .. } => {
                self.inner
                    .engine
                    .journal
                    .append_state_write(&self.inner.invocation_id, &self.inner.entity, &entry)
                    .await
            }
            _ => {
                self.inner
                    .engine
                    .journal
                    .append(&self.inner.invocation_id, &entry)
                    .await
            }
        };

        result.map(|_| ()).map_err(|e| self.storage_failure(e))
    }

    fn poison(&self, err: HandlerError) -> HandlerError {
        let mut cursor = self.lock();
        cursor.effects.poisoned.get_or_insert(err).clone()
    }

    fn storage_failure(&self, err: CoreError) -> HandlerError {
        warn!(
            invocation_id = %self.inner.invocation_id,
            error = %err,
            "journal or state access failed, attempt will be retried"
        );
        self.poison(HandlerError::Retryable(err.to_string()))
    }

    fn diverged(&self, index: u32, requested: String, recorded: &JournalEntry) -> HandlerError {
        warn!(
            invocation_id = %self.inner.invocation_id,
            index,
            %requested,
            recorded = %recorded.describe(),
            "replay diverged from journal"
        );
        self.poison(HandlerError::Divergence {
            index,
            requested,
            recorded: recorded.describe(),
        })
    }

    fn suspend(&self, reason: SuspendReason) -> HandlerError {
        debug!(invocation_id = %self.inner.invocation_id, ?reason, "suspending");
        self.lock().effects.suspension.get_or_insert(reason);
        HandlerError::Suspended
    }
}

/// Context of a keyed handler: everything [`Context`] offers plus journaled
/// access to the entity's state.
#[derive(Clone, Debug)]
pub struct ObjectContext {
    ctx: Context,
}

impl Deref for ObjectContext {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.ctx
    }
}

impl ObjectContext {
    pub(crate) fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Read and decode a JSON state slot.
    pub async fn get<T: DeserializeOwned>(&self, slot: &str) -> HandlerResult<Option<T>> {
        self.get_raw(slot)
            .await?
            .map(|bytes| json::from_bytes(&bytes))
            .transpose()
    }

    /// Encode and write a JSON state slot.
    pub async fn set<T: Serialize + ?Sized>(&self, slot: &str, value: &T) -> HandlerResult<()> {
        let bytes = json::to_bytes(value)?;
        self.write(slot, Some(bytes)).await
    }

    /// Read raw bytes of a state slot.
    pub async fn get_raw(&self, slot: &str) -> HandlerResult<Option<Vec<u8>>> {
        let ctx = &self.ctx;
        let (index, recorded) = ctx.claim()?;
        match recorded {
            Some(JournalEntry::StateRead {
                slot: recorded_slot,
                value,
                ..
            }) if recorded_slot == slot => Ok(value),
            Some(other) => Err(ctx.diverged(index, format!("get({})", slot), &other)),
            None => {
                let value = ctx
                    .inner
                    .engine
                    .state
                    .get(&ctx.inner.entity, slot)
                    .await
                    .map_err(|e| ctx.storage_failure(e))?;
                ctx.record(JournalEntry::StateRead {
                    index,
                    slot: slot.to_string(),
                    value: value.clone(),
                })
                .await?;
                Ok(value)
            }
        }
    }

    /// Write raw bytes to a state slot.
    pub async fn set_raw(&self, slot: &str, value: Vec<u8>) -> HandlerResult<()> {
        self.write(slot, Some(value)).await
    }

    /// Delete a state slot.
    pub async fn clear(&self, slot: &str) -> HandlerResult<()> {
        self.write(slot, None).await
    }

    async fn write(&self, slot: &str, value: Option<Vec<u8>>) -> HandlerResult<()> {
        let ctx = &self.ctx;
        let (index, recorded) = ctx.claim()?;
        let requested = match value {
            Some(_) => format!("set({})", slot),
            None => format!("clear({})", slot),
        };
        match recorded {
            Some(JournalEntry::StateWrite {
                slot: recorded_slot,
                value: recorded_value,
                ..
            }) if recorded_slot == slot && recorded_value.is_some() == value.is_some() => Ok(()),
            Some(other) => Err(ctx.diverged(index, requested, &other)),
            None => {
                ctx.record(JournalEntry::StateWrite {
                    index,
                    slot: slot.to_string(),
                    value,
                })
                .await
            }
        }
    }
}
