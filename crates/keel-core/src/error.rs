// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for keel-core.
//!
//! Two families live here:
//! - [`CoreError`]: engine and persistence faults, each with a stable error code.
//! - [`HandlerError`] / [`TerminalError`]: what handler code sees and returns.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Engine errors that can occur while submitting, scheduling or persisting invocations.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Invocation was not found in the store.
    InvocationNotFound {
        /// The invocation ID that was not found.
        invocation_id: String,
    },

    /// No handler is registered under the given service and handler name.
    HandlerNotFound {
        /// Service name.
        service: String,
        /// Handler name.
        handler: String,
    },

    /// Invocation is in an invalid state for the requested operation.
    InvalidInvocationState {
        /// The invocation ID.
        invocation_id: String,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// A different entry was already journaled at this index.
    JournalConflict {
        /// The invocation ID.
        invocation_id: String,
        /// The conflicting index.
        index: u32,
    },

    /// Stored journal could not be decoded or has gaps.
    CorruptJournal {
        /// The invocation ID.
        invocation_id: String,
        /// What is wrong with it.
        details: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Payload could not be encoded or decoded.
    SerializationError {
        /// Error details.
        details: String,
    },

    /// The engine is shutting down and no longer accepts work.
    ShuttingDown,
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvocationNotFound { .. } => "INVOCATION_NOT_FOUND",
            Self::HandlerNotFound { .. } => "HANDLER_NOT_FOUND",
            Self::InvalidInvocationState { .. } => "INVALID_INVOCATION_STATE",
            Self::JournalConflict { .. } => "JOURNAL_CONFLICT",
            Self::CorruptJournal { .. } => "CORRUPT_JOURNAL",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::SerializationError { .. } => "SERIALIZATION_ERROR",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvocationNotFound { invocation_id } => {
                write!(f, "Invocation '{}' not found", invocation_id)
            }
            Self::HandlerNotFound { service, handler } => {
                write!(f, "No handler registered for '{}/{}'", service, handler)
            }
            Self::InvalidInvocationState {
                invocation_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Invocation '{}' is in invalid state: expected '{}', got '{}'",
                    invocation_id, expected, actual
                )
            }
            Self::JournalConflict {
                invocation_id,
                index,
            } => {
                write!(
                    f,
                    "Journal of invocation '{}' already holds a different entry at index {}",
                    invocation_id, index
                )
            }
            Self::CorruptJournal {
                invocation_id,
                details,
            } => {
                write!(
                    f,
                    "Journal of invocation '{}' is corrupt: {}",
                    invocation_id, details
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::SerializationError { details } => {
                write!(f, "Serialization error: {}", details)
            }
            Self::ShuttingDown => write!(f, "Engine is shutting down"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError {
            details: err.to_string(),
        }
    }
}

/// A final, non-retryable failure. Becomes the outcome of the invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("[{code}] {message}")]
pub struct TerminalError {
    /// HTTP-like status code.
    pub code: u16,
    /// Human-readable message.
    pub message: String,
}

impl TerminalError {
    /// Generic failure code used when none is given.
    pub const INTERNAL: u16 = 500;
    /// Bad input.
    pub const BAD_REQUEST: u16 = 400;
    /// Unknown service or handler.
    pub const NOT_FOUND: u16 = 404;
    /// Awaited callback did not complete before its deadline.
    pub const TIMEOUT: u16 = 408;
    /// Invocation or callback was cancelled.
    pub const CANCELLED: u16 = 409;
    /// Replay requested a different action than the journal recorded.
    pub const JOURNAL_MISMATCH: u16 = 570;

    /// Create a terminal error with the generic failure code.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_code(Self::INTERNAL, message)
    }

    /// Create a terminal error with an explicit code.
    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Error recorded for a cancelled invocation or callback.
    pub fn cancelled() -> Self {
        Self::with_code(Self::CANCELLED, "cancelled")
    }

    /// Error recorded for an awaited callback whose deadline passed.
    pub fn timeout() -> Self {
        Self::with_code(Self::TIMEOUT, "callback timed out")
    }
}

/// Errors a handler can observe from, and return to, the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum HandlerError {
    /// Business-rule violation or explicit non-retryable failure.
    #[error("terminal error: {0}")]
    Terminal(#[from] TerminalError),

    /// Transient failure; the whole invocation is replayed from the journal.
    #[error("retryable error: {0}")]
    Retryable(String),

    /// The handler asked for a different action than the journal recorded.
    #[error("journal mismatch at index {index}: handler requested {requested}, journal has {recorded}")]
    Divergence {
        /// Journal index where the mismatch was detected.
        index: u32,
        /// The action requested during replay.
        requested: String,
        /// The action found in the journal.
        recorded: String,
    },

    /// The invocation is waiting for something external. Propagate with `?`.
    #[error("invocation suspended")]
    Suspended,
}

impl HandlerError {
    /// Shorthand for a terminal error with the generic failure code.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal(TerminalError::new(message))
    }

    /// Shorthand for a retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    /// Whether this error ends the invocation without retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_) | Self::Divergence { .. })
    }
}

impl From<CoreError> for HandlerError {
    fn from(err: CoreError) -> Self {
        HandlerError::Retryable(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Terminal(TerminalError::with_code(
            TerminalError::BAD_REQUEST,
            format!("invalid payload: {}", err),
        ))
    }
}

/// Result type returned by handlers and context operations.
pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_codes() {
        let test_cases = vec![
            (
                CoreError::InvocationNotFound {
                    invocation_id: "inv-1".to_string(),
                },
                "INVOCATION_NOT_FOUND",
            ),
            (
                CoreError::HandlerNotFound {
                    service: "Svc".to_string(),
                    handler: "run".to_string(),
                },
                "HANDLER_NOT_FOUND",
            ),
            (
                CoreError::InvalidInvocationState {
                    invocation_id: "inv-1".to_string(),
                    expected: "suspended".to_string(),
                    actual: "completed".to_string(),
                },
                "INVALID_INVOCATION_STATE",
            ),
            (
                CoreError::JournalConflict {
                    invocation_id: "inv-1".to_string(),
                    index: 2,
                },
                "JOURNAL_CONFLICT",
            ),
            (
                CoreError::CorruptJournal {
                    invocation_id: "inv-1".to_string(),
                    details: "gap".to_string(),
                },
                "CORRUPT_JOURNAL",
            ),
            (
                CoreError::ValidationError {
                    field: "key".to_string(),
                    message: "required".to_string(),
                },
                "VALIDATION_ERROR",
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "disk full".to_string(),
                },
                "DATABASE_ERROR",
            ),
            (
                CoreError::SerializationError {
                    details: "eof".to_string(),
                },
                "SERIALIZATION_ERROR",
            ),
            (CoreError::ShuttingDown, "SHUTTING_DOWN"),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty(), "Message should not be empty");
        }
    }

    #[test]
    fn test_core_error_display() {
        let err = CoreError::InvocationNotFound {
            invocation_id: "abc-123".to_string(),
        };
        assert_eq!(err.to_string(), "Invocation 'abc-123' not found");

        let err = CoreError::HandlerNotFound {
            service: "TicketService".to_string(),
            handler: "reserve".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "No handler registered for 'TicketService/reserve'"
        );

        let err = CoreError::JournalConflict {
            invocation_id: "abc-123".to_string(),
            index: 4,
        };
        assert_eq!(
            err.to_string(),
            "Journal of invocation 'abc-123' already holds a different entry at index 4"
        );
    }

    #[test]
    fn test_terminal_error_display_and_codes() {
        assert_eq!(TerminalError::new("boom").to_string(), "[500] boom");
        assert_eq!(TerminalError::cancelled().code, TerminalError::CANCELLED);
        assert_eq!(TerminalError::timeout().code, TerminalError::TIMEOUT);
    }

    #[test]
    fn test_handler_error_classification() {
        assert!(HandlerError::terminal("nope").is_terminal());
        assert!(!HandlerError::retryable("flaky").is_terminal());
        assert!(!HandlerError::Suspended.is_terminal());

        let from_core: HandlerError = CoreError::ShuttingDown.into();
        assert!(matches!(from_core, HandlerError::Retryable(_)));

        let bad_json = serde_json::from_slice::<u32>(b"not json").unwrap_err();
        match HandlerError::from(bad_json) {
            HandlerError::Terminal(err) => assert_eq!(err.code, TerminalError::BAD_REQUEST),
            other => panic!("unexpected {:?}", other),
        }
    }
}
