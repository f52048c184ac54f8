// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Journal store: the ordered record of everything an invocation did that
//! must not be redone on replay.
//!
//! Entries are indexed densely from 0 per invocation. An append is durable
//! once it returns. Appending byte-identical content at the same index again
//! is a no-op. Entries whose content is produced fresh on every attempt (the
//! wake-up time of a sleep, the id of a new awakeable) never match a lost
//! earlier write, so re-appending them ends in a conflict and the attempt is
//! retried against the journal as stored.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::CoreError;
use crate::ids::{CallbackId, EntityKey, InvocationId};
use crate::persistence::{AppendOutcome, JournalAppend, Persistence, StateMutation};
use crate::types::{Outcome, base64_bytes};

/// One recorded action of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalEntry {
    /// Result of a named side effect, success or terminal failure.
    SideEffectResult {
        /// Journal index.
        index: u32,
        /// Name the handler gave the side effect.
        name: String,
        /// What the side effect produced.
        outcome: Outcome,
    },
    /// Write (or delete, when `value` is `None`) of one state slot.
    StateWrite {
        /// Journal index.
        index: u32,
        /// Slot name.
        slot: String,
        /// New value; `None` is a tombstone.
        #[serde(with = "base64_bytes::option")]
        value: Option<Vec<u8>>,
    },
    /// Snapshot of a state slot as the handler observed it.
    StateRead {
        /// Journal index.
        index: u32,
        /// Slot name.
        slot: String,
        /// Value read; `None` if the slot was empty.
        #[serde(with = "base64_bytes::option")]
        value: Option<Vec<u8>>,
    },
    /// 16 random bytes drawn by the handler.
    RandomDraw {
        /// Journal index.
        index: u32,
        /// The drawn bytes.
        #[serde(with = "base64_bytes")]
        value: Vec<u8>,
    },
    /// A callback id was issued to the handler.
    AwakeableCreated {
        /// Journal index.
        index: u32,
        /// Issued id.
        callback_id: CallbackId,
    },
    /// The handler consumed the completion of a callback.
    AwakeableCompleted {
        /// Journal index.
        index: u32,
        /// Completed id.
        callback_id: CallbackId,
        /// Delivered result.
        outcome: Outcome,
    },
    /// A durable sleep that ends at `wake_at`.
    TimerScheduled {
        /// Journal index.
        index: u32,
        /// Wall-clock end of the sleep.
        wake_at: DateTime<Utc>,
    },
    /// A send or call that created another invocation.
    CallScheduled {
        /// Journal index.
        index: u32,
        /// Target service.
        service: String,
        /// Target handler.
        handler: String,
        /// Entity key or workflow id of the target.
        key: String,
        /// Id of the created invocation.
        invocation_id: InvocationId,
        /// Whether the caller waits for the result.
        #[serde(default)]
        awaited: bool,
    },
    /// The caller consumed the final outcome of a called invocation.
    CallCompleted {
        /// Journal index.
        index: u32,
        /// Called invocation.
        invocation_id: InvocationId,
        /// Its outcome.
        outcome: Outcome,
    },
}

impl JournalEntry {
    /// Position of the entry in its journal.
    pub fn index(&self) -> u32 {
        match self {
            Self::SideEffectResult { index, .. }
            | Self::StateWrite { index, .. }
            | Self::StateRead { index, .. }
            | Self::RandomDraw { index, .. }
            | Self::AwakeableCreated { index, .. }
            | Self::AwakeableCompleted { index, .. }
            | Self::TimerScheduled { index, .. }
            | Self::CallScheduled { index, .. }
            | Self::CallCompleted { index, .. } => *index,
        }
    }

    /// Stable discriminator, identical to the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SideEffectResult { .. } => "side_effect_result",
            Self::StateWrite { .. } => "state_write",
            Self::StateRead { .. } => "state_read",
            Self::RandomDraw { .. } => "random_draw",
            Self::AwakeableCreated { .. } => "awakeable_created",
            Self::AwakeableCompleted { .. } => "awakeable_completed",
            Self::TimerScheduled { .. } => "timer_scheduled",
            Self::CallScheduled { .. } => "call_scheduled",
            Self::CallCompleted { .. } => "call_completed",
        }
    }

    /// Short description used in divergence reports, e.g. `run(charge)`.
    pub fn describe(&self) -> String {
        match self {
            Self::SideEffectResult { name, .. } => format!("run({})", name),
            Self::StateWrite { slot, value: None, .. } => format!("clear({})", slot),
            Self::StateWrite { slot, .. } => format!("set({})", slot),
            Self::StateRead { slot, .. } => format!("get({})", slot),
            Self::RandomDraw { .. } => "random".to_string(),
            Self::AwakeableCreated { .. } => "awakeable".to_string(),
            Self::AwakeableCompleted { callback_id, .. } => format!("await({})", callback_id),
            Self::TimerScheduled { .. } => "sleep".to_string(),
            Self::CallScheduled {
                service,
                handler,
                awaited: false,
                ..
            } => format!("send({}/{})", service, handler),
            Self::CallScheduled {
                service, handler, ..
            } => format!("call({}/{})", service, handler),
            Self::CallCompleted { invocation_id, .. } => format!("result({})", invocation_id),
        }
    }
}

/// Durable, ordered journal per invocation.
#[derive(Clone)]
pub struct JournalStore {
    persistence: Arc<dyn Persistence>,
}

impl JournalStore {
    /// Create a journal store over a persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Durably append `entry`. Byte-identical re-appends are accepted; any
    /// other entry at an existing index fails with
    /// [`CoreError::JournalConflict`].
    #[instrument(skip(self, entry), fields(invocation_id = %invocation_id, index = entry.index(), kind = entry.kind()))]
    pub async fn append(
        &self,
        invocation_id: &InvocationId,
        entry: &JournalEntry,
    ) -> Result<AppendOutcome, CoreError> {
        let payload = serde_json::to_string(entry)?;
        let outcome = self
            .persistence
            .append_journal_entry(JournalAppend {
                invocation_id: invocation_id.as_str(),
                index: entry.index(),
                kind: entry.kind(),
                payload: &payload,
            })
            .await?;

        debug!(?outcome, "journal append");
        Ok(outcome)
    }

    /// Append a [`JournalEntry::StateWrite`] and apply it to `entity`'s
    /// state in the same transaction.
    #[instrument(skip(self, entry), fields(invocation_id = %invocation_id, entity = %entity, index = entry.index()))]
    pub async fn append_state_write(
        &self,
        invocation_id: &InvocationId,
        entity: &EntityKey,
        entry: &JournalEntry,
    ) -> Result<AppendOutcome, CoreError> {
        let JournalEntry::StateWrite { slot, value, .. } = entry else {
            return Err(CoreError::ValidationError {
                field: "entry".to_string(),
                message: format!("expected a state_write entry, got {}", entry.kind()),
            });
        };

        let payload = serde_json::to_string(entry)?;
        let outcome = self
            .persistence
            .append_state_write(
                JournalAppend {
                    invocation_id: invocation_id.as_str(),
                    index: entry.index(),
                    kind: entry.kind(),
                    payload: &payload,
                },
                StateMutation {
                    entity,
                    slot,
                    value: value.as_deref(),
                },
            )
            .await?;

        debug!(?outcome, slot = %slot, "state write");
        Ok(outcome)
    }

    /// All entries of an invocation ordered by index.
    ///
    /// Fails with [`CoreError::CorruptJournal`] if an entry cannot be decoded
    /// or the indices are not exactly `0..n`.
    pub async fn read_all(&self, invocation_id: &InvocationId) -> Result<Vec<JournalEntry>, CoreError> {
        let rows = self.persistence.read_journal(invocation_id.as_str()).await?;
        let mut entries = Vec::with_capacity(rows.len());

        for (position, row) in rows.into_iter().enumerate() {
            let entry: JournalEntry =
                serde_json::from_str(&row.payload).map_err(|e| CoreError::CorruptJournal {
                    invocation_id: invocation_id.to_string(),
                    details: format!("entry {} does not decode: {}", row.entry_index, e),
                })?;

            if row.entry_index != position as i64 || i64::from(entry.index()) != row.entry_index {
                return Err(CoreError::CorruptJournal {
                    invocation_id: invocation_id.to_string(),
                    details: format!(
                        "expected entry {} but found stored index {} (payload index {})",
                        position,
                        row.entry_index,
                        entry.index()
                    ),
                });
            }
            entries.push(entry);
        }

        Ok(entries)
    }
}
