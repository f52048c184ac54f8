// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity scheduler.
//!
//! Every invocation is serialized on its [`EntityKey`]: per key there is at
//! most one active invocation and a FIFO of waiting ones. The active
//! invocation keeps the key while it runs, while it waits for a retry, and
//! while it is suspended; the next one starts only after it finishes.
//! Distinct keys run in parallel, bounded by a semaphore of worker permits.
//!
//! ```text
//!   submit ──► admit ──► queue(key) ──► attempt ──┬─► finish ──► next in queue
//!                           ▲                     ├─► park (suspended) ──► resume
//!                           │                     └─► backoff ──► timer
//!                           └────────── resume / timer ───────────┘
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::context::SuspendReason;
use crate::error::{CoreError, TerminalError};
use crate::ids::{EntityKey, InvocationId};
use crate::persistence::InvocationRecord;
use crate::replay::{AttemptOutcome, ReplayEngine};
use crate::retry::RetryPolicy;
use crate::types::{InvocationRequest, InvocationStatus, Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// An attempt is queued for a permit or executing.
    Running,
    /// Parked on a callback or timer.
    Suspended,
    /// Waiting for the retry timer.
    BackingOff,
}

#[derive(Debug)]
struct Active {
    id: InvocationId,
    phase: Phase,
    /// A resume arrived while an attempt was executing.
    wake_pending: bool,
    /// Invocation this one is suspended on by a call.
    awaiting: Option<InvocationId>,
    /// Bumped whenever a timer is armed so stale timers can be ignored.
    generation: u64,
}

impl Active {
    fn running(id: InvocationId) -> Self {
        Self {
            id,
            phase: Phase::Running,
            wake_pending: false,
            awaiting: None,
            generation: 0,
        }
    }
}

#[derive(Debug, Default)]
struct KeyQueue {
    active: Option<Active>,
    waiting: VecDeque<InvocationId>,
}

#[derive(Debug, Default)]
struct Queues {
    by_key: HashMap<EntityKey, KeyQueue>,
    /// Invocations that are active or waiting, with their key.
    known: HashMap<InvocationId, EntityKey>,
    /// Invocations whose start time has not come yet.
    delayed: HashSet<InvocationId>,
}

struct Inner {
    engine: Arc<ReplayEngine>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    queues: Mutex<Queues>,
    watchers: Mutex<HashMap<InvocationId, watch::Sender<Option<Outcome>>>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Per-key FIFO scheduler driving invocations through the replay engine.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler running at most `max_concurrent` attempts at once.
    pub fn new(engine: Arc<ReplayEngine>, retry: RetryPolicy, max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                retry,
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
                queues: Mutex::new(Queues::default()),
                watchers: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Accept a request and queue it on its key. Returns the invocation id
    /// (the original one for a resubmitted workflow).
    pub async fn submit(&self, request: InvocationRequest) -> Result<InvocationId, CoreError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CoreError::ShuttingDown);
        }

        let admitted = self
            .inner
            .engine
            .admit(request, InvocationId::new(), None)
            .await?;
        self.inner.schedule_by_id(&admitted.invocation_id).await?;
        Ok(admitted.invocation_id)
    }

    /// Queue an already stored invocation. Terminal and already queued
    /// invocations are ignored.
    pub fn schedule(&self, record: &InvocationRecord) {
        self.inner.schedule(record);
    }

    /// Re-queue every unfinished invocation found in storage. Invocations
    /// that had already started go first so they get their key back before
    /// anything that was still pending.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, CoreError> {
        let mut unfinished = self
            .inner
            .engine
            .persistence
            .list_unfinished_invocations()
            .await?;
        unfinished.sort_by_key(|record| (record.status != "running" && record.status != "suspended", record.seq));

        for record in &unfinished {
            self.inner.schedule(record);
        }

        info!(count = unfinished.len(), "recovered unfinished invocations");
        Ok(unfinished.len())
    }

    /// Wake a suspended invocation. A wake-up that arrives while an attempt
    /// is still executing re-runs the invocation right after it parks.
    pub fn resume(&self, invocation_id: &InvocationId) {
        self.inner.wake(invocation_id, None);
    }

    /// Request cancellation. Returns `false` if the invocation is unknown or
    /// already finished. A suspended invocation is woken to observe it.
    #[instrument(skip(self), fields(invocation_id = %invocation_id))]
    pub async fn cancel(&self, invocation_id: &InvocationId) -> Result<bool, CoreError> {
        if !self
            .inner
            .engine
            .persistence
            .request_cancellation(invocation_id.as_str())
            .await?
        {
            return Ok(false);
        }

        info!("cancellation requested");
        self.inner.wake(invocation_id, None);
        Ok(true)
    }

    /// Wait for the outcome of an invocation.
    pub async fn attach(&self, invocation_id: &InvocationId) -> Result<Outcome, CoreError> {
        let persistence = &self.inner.engine.persistence;
        let stored = |record: Option<InvocationRecord>| match record {
            Some(record) => Ok(record.outcome()),
            None => Err(CoreError::InvocationNotFound {
                invocation_id: invocation_id.to_string(),
            }),
        };

        if let Some(outcome) = stored(persistence.get_invocation(invocation_id.as_str()).await?)? {
            return Ok(outcome);
        }

        let mut rx = {
            let mut watchers = lock(&self.inner.watchers);
            watchers
                .entry(invocation_id.clone())
                .or_insert_with(|| watch::channel(None).0)
                .subscribe()
        };

        // The invocation may have finished, and its watchers been notified,
        // between the read above and the subscription.
        let recheck = persistence
            .get_invocation(invocation_id.as_str())
            .await
            .and_then(stored);
        match recheck {
            Ok(None) => {}
            done => {
                lock(&self.inner.watchers).remove(invocation_id);
                if let Some(outcome) = done? {
                    return Ok(outcome);
                }
            }
        }

        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return Ok(outcome);
            }
            if rx.changed().await.is_err() {
                // Sender dropped: either finished or shutting down.
                return persistence
                    .get_invocation(invocation_id.as_str())
                    .await?
                    .and_then(|record| record.outcome())
                    .ok_or(CoreError::ShuttingDown);
            }
        }
    }

    /// Whether the scheduler still accepts work.
    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    /// Stop all timers and abandon executing attempts. Abandoned attempts
    /// are replayed from their journals by the next [`Scheduler::recover`].
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        lock(&self.inner.watchers).clear();
        debug!("scheduler stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

impl Inner {
    async fn schedule_by_id(self: &Arc<Self>, invocation_id: &InvocationId) -> Result<(), CoreError> {
        let record = self
            .engine
            .persistence
            .get_invocation(invocation_id.as_str())
            .await?
            .ok_or_else(|| CoreError::InvocationNotFound {
                invocation_id: invocation_id.to_string(),
            })?;
        self.schedule(&record);
        Ok(())
    }

    fn schedule(self: &Arc<Self>, record: &InvocationRecord) {
        match record.status() {
            Ok(status) if status.is_terminal() => return,
            Ok(_) => {}
            Err(e) => {
                warn!(invocation_id = %record.invocation_id, error = %e, "not scheduling invocation");
                return;
            }
        }

        let id = record.id();
        let entity = record.entity();

        if let Some(run_at) = record.run_at
            && run_at > Utc::now()
        {
            {
                let mut queues = lock(&self.queues);
                if queues.known.contains_key(&id) || !queues.delayed.insert(id.clone()) {
                    return;
                }
            }

            debug!(invocation_id = %id, %run_at, "invocation delayed");
            let inner = self.clone();
            self.tasks.spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(until(run_at)) => {
                        lock(&inner.queues).delayed.remove(&id);
                        inner.enqueue(id, entity);
                    }
                    _ = inner.shutdown.cancelled() => {}
                }
            });
            return;
        }

        self.enqueue(id, entity);
    }

    fn enqueue(self: &Arc<Self>, id: InvocationId, entity: EntityKey) {
        let start = {
            let mut queues = lock(&self.queues);
            if queues.known.contains_key(&id) {
                return;
            }
            queues.known.insert(id.clone(), entity.clone());

            let queue = queues.by_key.entry(entity.clone()).or_default();
            if queue.active.is_none() {
                queue.active = Some(Active::running(id.clone()));
                true
            } else {
                queue.waiting.push_back(id.clone());
                false
            }
        };

        if start {
            debug!(invocation_id = %id, entity = %entity, "invocation takes its key");
            self.start_attempt(id);
        } else {
            debug!(invocation_id = %id, entity = %entity, "invocation queued behind active one");
        }
    }

    fn start_attempt(self: &Arc<Self>, id: InvocationId) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let inner = self.clone();
        self.tasks.spawn(inner.run_attempt(id));
    }

    #[instrument(skip(self), fields(invocation_id = %id))]
    async fn run_attempt(self: Arc<Self>, id: InvocationId) {
        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = self.shutdown.cancelled() => return,
        };

        let persistence = &self.engine.persistence;
        let record = match persistence.get_invocation(id.as_str()).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                error!("invocation missing from storage, dropping it");
                self.release(&id);
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to load invocation");
                drop(permit);
                self.retry_after(&id, self.retry.next_delay(1));
                return;
            }
        };

        if let Some(outcome) = record.outcome() {
            self.notify(&id, outcome);
            self.release(&id);
            return;
        }

        let attempt = u32::try_from(record.attempt).unwrap_or(0).saturating_add(1);
        let started = async {
            persistence
                .update_invocation_status(id.as_str(), InvocationStatus::Running)
                .await?;
            persistence.record_attempt(id.as_str(), attempt).await
        };
        match started.await {
            Ok(()) => {}
            Err(e @ (CoreError::InvalidInvocationState { .. } | CoreError::InvocationNotFound { .. })) => {
                warn!(error = %e, "invocation cannot start");
                drop(permit);
                self.settle(&id).await;
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to mark invocation running");
                drop(permit);
                self.retry_after(&id, self.retry.next_delay(1));
                return;
            }
        }

        debug!(attempt, "attempt started");
        let result = tokio::select! {
            result = self.engine.execute(&record) => result,
            _ = self.shutdown.cancelled() => {
                info!(attempt, "attempt abandoned on shutdown");
                return;
            }
        };
        drop(permit);

        for child in &result.spawned {
            if let Err(e) = self.schedule_by_id(child).await {
                // Recovery picks it up on the next start.
                warn!(child = %child, error = %e, "failed to schedule sent invocation");
            }
        }

        match result.outcome {
            AttemptOutcome::Completed(output) => self.finish(&id, Outcome::Success(output)).await,
            AttemptOutcome::Failed(err) => self.finish(&id, Outcome::Failure(err)).await,
            AttemptOutcome::Suspended(reason) => self.park(&id, reason).await,
            AttemptOutcome::Retry(message) => self.backoff(&id, message).await,
        }
    }

    async fn finish(self: &Arc<Self>, id: &InvocationId, outcome: Outcome) {
        let persistence = &self.engine.persistence;
        let outcome = match persistence.complete_invocation(id.as_str(), &outcome).await {
            Ok(true) => outcome,
            Ok(false) => match persistence.get_invocation(id.as_str()).await {
                Ok(Some(record)) => record.outcome().unwrap_or(outcome),
                _ => outcome,
            },
            Err(e) => {
                error!(invocation_id = %id, error = %e, "failed to store outcome, will replay");
                self.retry_after(id, self.retry.next_delay(1));
                return;
            }
        };

        match &outcome {
            Outcome::Success(_) => info!(invocation_id = %id, "invocation completed"),
            Outcome::Failure(err) => {
                info!(invocation_id = %id, code = err.code, message = %err.message, "invocation failed")
            }
        }
        self.notify(id, outcome);
        self.release(id);
        self.wake_caller(id).await;
    }

    /// Finish bookkeeping for an invocation whose stored status can no
    /// longer change.
    async fn settle(self: &Arc<Self>, id: &InvocationId) {
        match self.engine.persistence.get_invocation(id.as_str()).await {
            Ok(Some(record)) => match record.outcome() {
                Some(outcome) => {
                    self.notify(id, outcome);
                    self.release(id);
                    self.wake_caller(id).await;
                }
                None => self.retry_after(id, self.retry.next_delay(1)),
            },
            Ok(None) => {
                error!(invocation_id = %id, "invocation missing from storage, dropping it");
                self.release(id);
            }
            Err(e) => {
                error!(invocation_id = %id, error = %e, "failed to load invocation");
                self.retry_after(id, self.retry.next_delay(1));
            }
        }
    }

    /// Resume the invocation that is waiting on `id` through a call.
    async fn wake_caller(self: &Arc<Self>, id: &InvocationId) {
        let parent = match self.engine.persistence.get_invocation(id.as_str()).await {
            Ok(record) => record.and_then(|record| record.parent_invocation_id),
            Err(e) => {
                // The caller finds the outcome when it next runs.
                warn!(invocation_id = %id, error = %e, "failed to look up caller");
                return;
            }
        };
        let Some(parent) = parent.map(InvocationId::from) else {
            return;
        };

        let start = self
            .with_active(&parent, |active| match active.phase {
                Phase::Suspended if active.awaiting.as_ref() == Some(id) => {
                    active.phase = Phase::Running;
                    active.awaiting = None;
                    true
                }
                // It may be about to park on this very call.
                Phase::Running => {
                    active.wake_pending = true;
                    false
                }
                Phase::Suspended | Phase::BackingOff => false,
            })
            .unwrap_or(false);

        if start {
            debug!(invocation_id = %parent, callee = %id, "caller resumed");
            self.start_attempt(parent);
        }
    }

    async fn park(self: &Arc<Self>, id: &InvocationId, reason: SuspendReason) {
        match self
            .engine
            .persistence
            .update_invocation_status(id.as_str(), InvocationStatus::Suspended)
            .await
        {
            Ok(()) => {}
            Err(e @ (CoreError::InvalidInvocationState { .. } | CoreError::InvocationNotFound { .. })) => {
                warn!(invocation_id = %id, error = %e, "invocation cannot be suspended");
                self.settle(id).await;
                return;
            }
            Err(e) => {
                error!(invocation_id = %id, error = %e, "failed to mark invocation suspended");
                self.retry_after(id, self.retry.next_delay(1));
                return;
            }
        }

        let awaiting = match &reason {
            SuspendReason::Call { invocation_id } => Some(invocation_id.clone()),
            _ => None,
        };
        let parked = self.with_active(id, |active| {
            active.generation += 1;
            if active.wake_pending {
                active.wake_pending = false;
                active.phase = Phase::Running;
                None
            } else {
                active.phase = Phase::Suspended;
                active.awaiting = awaiting;
                Some(active.generation)
            }
        });

        match parked {
            Some(None) => {
                debug!(invocation_id = %id, "woken while running, re-running now");
                self.start_attempt(id.clone());
            }
            Some(Some(generation)) => {
                info!(invocation_id = %id, ?reason, "invocation suspended");
                let wake_at = match reason {
                    SuspendReason::Timer { wake_at } => Some(wake_at),
                    SuspendReason::Callback { deadline, .. } => deadline,
                    SuspendReason::Call { .. } => None,
                };
                if let Some(wake_at) = wake_at {
                    self.arm_timer(id.clone(), until(wake_at), generation);
                }
            }
            None => {}
        }
    }

    async fn backoff(self: &Arc<Self>, id: &InvocationId, message: String) {
        let failures = match self
            .engine
            .persistence
            .record_failure(id.as_str(), &message)
            .await
        {
            Ok(failures) => failures,
            Err(e) => {
                error!(invocation_id = %id, error = %e, "failed to record failure");
                self.retry_after(id, self.retry.next_delay(1));
                return;
            }
        };

        if !self.retry.allows_retry(failures) {
            warn!(invocation_id = %id, failures, %message, "retries exhausted");
            let err = TerminalError::new(format!(
                "retries exhausted after {} attempts: {}",
                failures, message
            ));
            self.finish(id, Outcome::Failure(err)).await;
            return;
        }

        let delay = self.retry.next_delay(failures);
        warn!(invocation_id = %id, failures, ?delay, %message, "attempt failed, retrying");
        self.retry_after(id, delay);
    }

    fn retry_after(self: &Arc<Self>, id: &InvocationId, delay: Duration) {
        let generation = self.with_active(id, |active| {
            active.phase = Phase::BackingOff;
            active.wake_pending = false;
            active.generation += 1;
            active.generation
        });

        if let Some(generation) = generation {
            self.arm_timer(id.clone(), delay, generation);
        }
    }

    fn arm_timer(self: &Arc<Self>, id: InvocationId, delay: Duration, generation: u64) {
        let inner = self.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => inner.wake(&id, Some(generation)),
                _ = inner.shutdown.cancelled() => {}
            }
        });
    }

    /// `generation` is set by timers; external wake-ups pass `None`.
    fn wake(self: &Arc<Self>, id: &InvocationId, generation: Option<u64>) {
        let start = self
            .with_active(id, |active| match (active.phase, generation) {
                (_, Some(g)) if g != active.generation => false,
                (Phase::Suspended, _) | (Phase::BackingOff, Some(_)) => {
                    active.phase = Phase::Running;
                    active.awaiting = None;
                    true
                }
                (Phase::Running, None) => {
                    active.wake_pending = true;
                    false
                }
                (Phase::BackingOff, None) | (Phase::Running, Some(_)) => false,
            })
            .unwrap_or(false);

        if start {
            debug!(invocation_id = %id, "invocation resumed");
            self.start_attempt(id.clone());
        }
    }

    fn release(self: &Arc<Self>, id: &InvocationId) {
        let next = {
            let mut queues = lock(&self.queues);
            let Some(entity) = queues.known.remove(id) else {
                return;
            };
            let Some(queue) = queues.by_key.get_mut(&entity) else {
                return;
            };

            if queue.active.as_ref().is_some_and(|active| &active.id == id) {
                queue.active = None;
            } else {
                queue.waiting.retain(|waiting| waiting != id);
            }

            if queue.active.is_some() {
                None
            } else if let Some(next) = queue.waiting.pop_front() {
                queue.active = Some(Active::running(next.clone()));
                Some(next)
            } else {
                queues.by_key.remove(&entity);
                None
            }
        };

        if let Some(next) = next {
            self.start_attempt(next);
        }
    }

    fn notify(&self, id: &InvocationId, outcome: Outcome) {
        if let Some(tx) = lock(&self.watchers).remove(id) {
            let _ = tx.send(Some(outcome));
        }
    }

    fn with_active<R>(&self, id: &InvocationId, f: impl FnOnce(&mut Active) -> R) -> Option<R> {
        let mut queues = lock(&self.queues);
        let entity = queues.known.get(id)?.clone();
        let active = queues.by_key.get_mut(&entity)?.active.as_mut()?;
        if &active.id != id {
            return None;
        }
        Some(f(active))
    }
}
