// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for keel-core.
//!
//! Everything the engine must not lose goes through [`Persistence`]:
//! invocations, journals, entity state and callback registrations.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use chrono::{DateTime, Utc};

use crate::error::{CoreError, TerminalError};
use crate::ids::{EntityKey, InvocationId};
use crate::types::{InvocationStatus, Outcome, ServiceKind};

/// Invocation record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InvocationRecord {
    /// Submission order. Per-key FIFO follows it across restarts.
    pub seq: i64,
    /// Stable identifier of the invocation.
    pub invocation_id: String,
    /// Target service.
    pub service: String,
    /// Target handler.
    pub handler: String,
    /// Entity key, or workflow id for workflow services.
    pub entity_key: String,
    /// `keyed` or `workflow`.
    pub kind: String,
    /// Input payload.
    pub input: Vec<u8>,
    /// Current status (pending, running, suspended, completed, failed).
    pub status: String,
    /// Number of attempts started so far.
    pub attempt: i32,
    /// Number of attempts that failed retryably.
    pub failures: i32,
    /// Set once cancellation was requested.
    pub cancel_requested: bool,
    /// Earliest start time for delayed invocations.
    pub run_at: Option<DateTime<Utc>>,
    /// Invocation that sent this one, if any.
    pub parent_invocation_id: Option<String>,
    /// When the invocation was accepted.
    pub created_at: DateTime<Utc>,
    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When a final outcome was recorded.
    pub finished_at: Option<DateTime<Utc>>,
    /// Success payload.
    pub output: Option<Vec<u8>>,
    /// Terminal error code.
    pub error_code: Option<i64>,
    /// Terminal error message.
    pub error_message: Option<String>,
    /// Message of the latest retryable failure.
    pub last_failure: Option<String>,
}

impl InvocationRecord {
    /// Typed invocation id.
    pub fn id(&self) -> InvocationId {
        InvocationId::from(self.invocation_id.as_str())
    }

    /// Entity this invocation is serialized on.
    pub fn entity(&self) -> EntityKey {
        EntityKey::new(&self.service, &self.entity_key)
    }

    /// Parsed status.
    pub fn status(&self) -> Result<InvocationStatus, CoreError> {
        self.status.parse()
    }

    /// Parsed service kind.
    pub fn service_kind(&self) -> Result<ServiceKind, CoreError> {
        self.kind.parse()
    }

    /// Final outcome, if the invocation has one.
    pub fn outcome(&self) -> Option<Outcome> {
        match self.status() {
            Ok(InvocationStatus::Completed) => {
                Some(Outcome::Success(self.output.clone().unwrap_or_default()))
            }
            Ok(InvocationStatus::Failed) => Some(Outcome::Failure(TerminalError::with_code(
                self.error_code
                    .and_then(|c| u16::try_from(c).ok())
                    .unwrap_or(TerminalError::INTERNAL),
                self.error_message.clone().unwrap_or_default(),
            ))),
            _ => None,
        }
    }
}

/// Data needed to accept a new invocation.
#[derive(Debug, Clone)]
pub struct NewInvocation {
    /// Identifier to store it under.
    pub invocation_id: InvocationId,
    /// Entity the invocation is serialized on.
    pub entity: EntityKey,
    /// Target handler.
    pub handler: String,
    /// Service kind.
    pub kind: ServiceKind,
    /// Input payload.
    pub input: Vec<u8>,
    /// Earliest start time.
    pub run_at: Option<DateTime<Utc>>,
    /// Sending invocation.
    pub parent: Option<InvocationId>,
}

/// Raw journal row. `payload` is the JSON-encoded entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JournalRecord {
    /// Owning invocation.
    pub invocation_id: String,
    /// Position in the journal, from 0.
    pub entry_index: i64,
    /// Entry discriminator, duplicated for queries.
    pub kind: String,
    /// JSON payload.
    pub payload: String,
    /// When the entry was appended.
    pub created_at: DateTime<Utc>,
}

/// One journal append as handed to the backend.
#[derive(Debug, Clone, Copy)]
pub struct JournalAppend<'a> {
    /// Owning invocation.
    pub invocation_id: &'a str,
    /// Position in the journal.
    pub index: u32,
    /// Entry discriminator.
    pub kind: &'a str,
    /// JSON payload.
    pub payload: &'a str,
}

/// A state mutation committed together with its journal entry.
#[derive(Debug, Clone, Copy)]
pub struct StateMutation<'a> {
    /// Entity whose state changes.
    pub entity: &'a EntityKey,
    /// Slot name.
    pub slot: &'a str,
    /// New value, or `None` to delete the slot.
    pub value: Option<&'a [u8]>,
}

/// Result of an idempotent journal append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The entry was written now.
    Appended,
    /// An identical entry already existed at that index.
    AlreadyPresent,
}

/// Entity state row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StateRecord {
    /// Slot name.
    pub slot: String,
    /// Stored bytes.
    pub value: Vec<u8>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

/// Callback registration row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CallbackRecord {
    /// Opaque callback id.
    pub callback_id: String,
    /// Invocation waiting on it.
    pub invocation_id: String,
    /// Journal index of the awakeable that created it.
    pub entry_index: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Optional deadline.
    pub deadline: Option<DateTime<Utc>>,
    /// When the first completion was accepted.
    pub completed_at: Option<DateTime<Utc>>,
    /// JSON-encoded [`Outcome`] of the first completion.
    pub outcome: Option<String>,
}

/// Durable storage backend used by every engine component.
#[allow(missing_docs)]
#[async_trait::async_trait]
pub trait Persistence: Send + Sync {
    /// Insert a new invocation. Returns `false` if the id (or, for
    /// workflows, the `(service, workflow id)` pair) already exists.
    async fn insert_invocation(&self, invocation: &NewInvocation) -> Result<bool, CoreError>;

    async fn get_invocation(
        &self,
        invocation_id: &str,
    ) -> Result<Option<InvocationRecord>, CoreError>;

    /// Look up the single run of a workflow.
    async fn find_workflow_run(
        &self,
        service: &str,
        workflow_id: &str,
    ) -> Result<Option<InvocationRecord>, CoreError>;

    /// Move a non-terminal invocation to `status`. `started_at` is set on
    /// the first transition to running.
    async fn update_invocation_status(
        &self,
        invocation_id: &str,
        status: InvocationStatus,
    ) -> Result<(), CoreError>;

    /// Record that attempt number `attempt` started.
    async fn record_attempt(&self, invocation_id: &str, attempt: u32) -> Result<(), CoreError>;

    /// Record a retryable failure and return how many have happened so far.
    async fn record_failure(&self, invocation_id: &str, message: &str) -> Result<u32, CoreError>;

    /// Store the final outcome. Returns `false` if the invocation was
    /// already terminal, in which case nothing changes.
    async fn complete_invocation(
        &self,
        invocation_id: &str,
        outcome: &Outcome,
    ) -> Result<bool, CoreError>;

    /// Flag a non-terminal invocation as cancelled. Returns `false` if it is
    /// unknown or already terminal.
    async fn request_cancellation(&self, invocation_id: &str) -> Result<bool, CoreError>;

    /// All non-terminal invocations in submission order.
    async fn list_unfinished_invocations(&self) -> Result<Vec<InvocationRecord>, CoreError>;

    /// Durably append one journal entry. Re-appending identical content is a
    /// no-op; different content at an existing index is a conflict.
    async fn append_journal_entry(
        &self,
        entry: JournalAppend<'_>,
    ) -> Result<AppendOutcome, CoreError>;

    /// Append a state-write entry and apply the mutation in one transaction.
    async fn append_state_write(
        &self,
        entry: JournalAppend<'_>,
        mutation: StateMutation<'_>,
    ) -> Result<AppendOutcome, CoreError>;

    /// Journal rows of an invocation ordered by index.
    async fn read_journal(&self, invocation_id: &str) -> Result<Vec<JournalRecord>, CoreError>;

    async fn get_state(&self, entity: &EntityKey, slot: &str)
    -> Result<Option<Vec<u8>>, CoreError>;

    async fn set_state(&self, entity: &EntityKey, slot: &str, value: &[u8])
    -> Result<(), CoreError>;

    async fn clear_state(&self, entity: &EntityKey, slot: &str) -> Result<(), CoreError>;

    /// All slots of an entity ordered by name.
    async fn list_state(&self, entity: &EntityKey) -> Result<Vec<StateRecord>, CoreError>;

    async fn insert_callback(
        &self,
        callback_id: &str,
        invocation_id: &str,
        entry_index: u32,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError>;

    async fn get_callback(&self, callback_id: &str) -> Result<Option<CallbackRecord>, CoreError>;

    /// Record the first completion. Returns `false` if one was already recorded.
    async fn complete_callback(
        &self,
        callback_id: &str,
        outcome_json: &str,
    ) -> Result<bool, CoreError>;

    /// Replace the deadline of an uncompleted callback.
    async fn set_callback_deadline(
        &self,
        callback_id: &str,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError>;

    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
