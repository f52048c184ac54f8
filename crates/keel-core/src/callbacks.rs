// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Callback correlator.
//!
//! A handler that waits for an external system obtains a [`CallbackId`],
//! hands it out, and suspends. Whoever holds the id later completes it; the
//! first completion is stored and every later one is reported as a
//! duplicate. Completions may arrive before the handler gets around to
//! awaiting, or after the invocation was already parked.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::error::{CoreError, TerminalError};
use crate::ids::{CallbackId, InvocationId};
use crate::persistence::Persistence;
use crate::types::Outcome;

/// What an external system reports back through a callback.
pub type CallbackResult = Result<Vec<u8>, TerminalError>;

/// Result of delivering a completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// First completion for this id; the waiting invocation should resume.
    Accepted {
        /// Invocation that owns the callback.
        invocation_id: InvocationId,
    },
    /// The callback was already completed; nothing changed.
    Duplicate,
    /// No callback with this id exists.
    Unknown,
}

/// Current state of a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackState {
    /// Not completed yet.
    Pending {
        /// When the wait times out, if ever.
        deadline: Option<DateTime<Utc>>,
    },
    /// Completed with this outcome.
    Completed(Outcome),
    /// Never issued.
    Unknown,
}

/// Issues callback ids and records their completions.
#[derive(Clone)]
pub struct CallbackCorrelator {
    persistence: Arc<dyn Persistence>,
    timeout: Option<Duration>,
}

impl CallbackCorrelator {
    /// Create a correlator. With `timeout` set, every callback gets a deadline.
    pub fn new(persistence: Arc<dyn Persistence>, timeout: Option<Duration>) -> Self {
        Self {
            persistence,
            timeout,
        }
    }

    /// Register a new callback owned by journal entry `index` of `invocation_id`.
    #[instrument(skip(self), fields(invocation_id = %invocation_id))]
    pub async fn create_callback(
        &self,
        invocation_id: &InvocationId,
        index: u32,
    ) -> Result<CallbackId, CoreError> {
        let callback_id = CallbackId::generate();
        self.persistence
            .insert_callback(
                callback_id.as_str(),
                invocation_id.as_str(),
                index,
                self.next_deadline(),
            )
            .await?;

        info!(callback_id = %callback_id, "callback registered");
        Ok(callback_id)
    }

    /// Deliver a completion. Only the first one for an id is kept.
    #[instrument(skip(self, result), fields(callback_id = %callback_id, ok = result.is_ok()))]
    pub async fn complete(
        &self,
        callback_id: &CallbackId,
        result: CallbackResult,
    ) -> Result<Completion, CoreError> {
        let Some(record) = self.persistence.get_callback(callback_id.as_str()).await? else {
            warn!("completion for unknown callback");
            return Ok(Completion::Unknown);
        };

        let outcome = serde_json::to_string(&Outcome::from(result))?;
        if self
            .persistence
            .complete_callback(callback_id.as_str(), &outcome)
            .await?
        {
            info!(invocation_id = %record.invocation_id, "callback completed");
            Ok(Completion::Accepted {
                invocation_id: InvocationId::from(record.invocation_id),
            })
        } else {
            info!("duplicate callback completion ignored");
            Ok(Completion::Duplicate)
        }
    }

    /// Complete a callback with a terminal `cancelled` error.
    pub async fn cancel(&self, callback_id: &CallbackId) -> Result<Completion, CoreError> {
        self.complete(callback_id, Err(TerminalError::cancelled()))
            .await
    }

    /// Complete a callback with a terminal timeout error. Loses to any
    /// completion that already arrived.
    pub async fn expire(&self, callback_id: &CallbackId) -> Result<Completion, CoreError> {
        self.complete(callback_id, Err(TerminalError::timeout())).await
    }

    /// Push the deadline of a pending callback one timeout period into the future.
    pub async fn rearm(&self, callback_id: &CallbackId) -> Result<Option<DateTime<Utc>>, CoreError> {
        let deadline = self.next_deadline();
        self.persistence
            .set_callback_deadline(callback_id.as_str(), deadline)
            .await?;
        Ok(deadline)
    }

    /// Look up the state of a callback.
    pub async fn poll(&self, callback_id: &CallbackId) -> Result<CallbackState, CoreError> {
        let Some(record) = self.persistence.get_callback(callback_id.as_str()).await? else {
            return Ok(CallbackState::Unknown);
        };

        match record.outcome {
            Some(json) => Ok(CallbackState::Completed(serde_json::from_str(&json)?)),
            None => Ok(CallbackState::Pending {
                deadline: record.deadline,
            }),
        }
    }

    fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.timeout
            .and_then(|timeout| chrono::Duration::from_std(timeout).ok())
            .map(|timeout| Utc::now() + timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;

    async fn correlator(timeout: Option<Duration>) -> CallbackCorrelator {
        let persistence = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        CallbackCorrelator::new(persistence, timeout)
    }

    #[tokio::test]
    async fn test_first_completion_wins() {
        let correlator = correlator(None).await;
        let owner = InvocationId::new();
        let id = correlator.create_callback(&owner, 0).await.unwrap();

        assert_eq!(
            correlator.poll(&id).await.unwrap(),
            CallbackState::Pending { deadline: None }
        );
        assert_eq!(
            correlator.complete(&id, Ok(b"first".to_vec())).await.unwrap(),
            Completion::Accepted {
                invocation_id: owner.clone()
            }
        );
        assert_eq!(
            correlator.complete(&id, Ok(b"second".to_vec())).await.unwrap(),
            Completion::Duplicate
        );
        assert_eq!(correlator.cancel(&id).await.unwrap(), Completion::Duplicate);
        assert_eq!(
            correlator.poll(&id).await.unwrap(),
            CallbackState::Completed(Outcome::Success(b"first".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_unknown_callback() {
        let correlator = correlator(None).await;
        let id = CallbackId::from("cb_doesnotexist");

        assert_eq!(
            correlator.complete(&id, Ok(vec![])).await.unwrap(),
            Completion::Unknown
        );
        assert_eq!(correlator.poll(&id).await.unwrap(), CallbackState::Unknown);
    }

    #[tokio::test]
    async fn test_cancel_completes_with_terminal_error() {
        let correlator = correlator(None).await;
        let id = correlator
            .create_callback(&InvocationId::new(), 2)
            .await
            .unwrap();

        assert!(matches!(
            correlator.cancel(&id).await.unwrap(),
            Completion::Accepted { .. }
        ));
        assert_eq!(
            correlator.poll(&id).await.unwrap(),
            CallbackState::Completed(Outcome::Failure(TerminalError::cancelled()))
        );
    }

    #[tokio::test]
    async fn test_deadline_and_rearm() {
        let correlator = correlator(Some(Duration::from_secs(60))).await;
        let id = correlator
            .create_callback(&InvocationId::new(), 0)
            .await
            .unwrap();

        let CallbackState::Pending {
            deadline: Some(first),
        } = correlator.poll(&id).await.unwrap()
        else {
            panic!("callback should be pending with a deadline");
        };
        assert!(first > Utc::now());

        let rearmed = correlator.rearm(&id).await.unwrap().unwrap();
        assert!(rearmed >= first);

        correlator.expire(&id).await.unwrap();
        assert_eq!(
            correlator.poll(&id).await.unwrap(),
            CallbackState::Completed(Outcome::Failure(TerminalError::timeout()))
        );
    }
}
