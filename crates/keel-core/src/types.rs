// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared value types: service kinds, invocation status, requests and outcomes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, TerminalError};

/// Capability shape of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Keyed virtual object: serialized per key, owns durable state.
    Keyed,
    /// Workflow: runs once per workflow id, no keyed state.
    Workflow,
}

impl ServiceKind {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keyed => "keyed",
            Self::Workflow => "workflow",
        }
    }
}

impl FromStr for ServiceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyed" => Ok(Self::Keyed),
            "workflow" => Ok(Self::Workflow),
            other => Err(CoreError::ValidationError {
                field: "kind".to_string(),
                message: format!("unknown service kind '{}'", other),
            }),
        }
    }
}

/// Lifecycle status of an invocation.
///
/// ```text
/// PENDING ─► RUNNING ─► COMPLETED | FAILED
///               │  ▲
///               ▼  │
///            SUSPENDED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// Accepted and queued, not yet started.
    Pending,
    /// An attempt is executing, or is waiting for a retry.
    Running,
    /// Parked on a callback or timer; still holds its key.
    Suspended,
    /// Finished with a success value.
    Completed,
    /// Finished with a terminal error.
    Failed,
}

impl InvocationStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the invocation has reached a final outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for InvocationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::ValidationError {
                field: "status".to_string(),
                message: format!("unknown invocation status '{}'", other),
            }),
        }
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to run `service/handler`, optionally against a key and after a delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    /// Target service.
    pub service: String,
    /// Handler within the service.
    pub handler: String,
    /// Entity key for keyed services, workflow id for workflows.
    pub key: Option<String>,
    /// Opaque input payload.
    pub input: Vec<u8>,
    /// Do not start before this much time has passed.
    pub delay: Option<Duration>,
}

impl InvocationRequest {
    /// Create a request without key or delay.
    pub fn new(service: impl Into<String>, handler: impl Into<String>, input: Vec<u8>) -> Self {
        Self {
            service: service.into(),
            handler: handler.into(),
            key: None,
            input,
            delay: None,
        }
    }

    /// Target a specific entity key (or workflow id).
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Delay the start of the invocation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Final result of an invocation or of a journaled side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Success with an opaque payload.
    Success(#[serde(with = "crate::types::base64_bytes")] Vec<u8>),
    /// Terminal failure.
    Failure(TerminalError),
}

impl Outcome {
    /// Convert into a plain result.
    pub fn into_result(self) -> Result<Vec<u8>, TerminalError> {
        match self {
            Self::Success(bytes) => Ok(bytes),
            Self::Failure(err) => Err(err),
        }
    }
}

impl From<Result<Vec<u8>, TerminalError>> for Outcome {
    fn from(result: Result<Vec<u8>, TerminalError>) -> Self {
        match result {
            Ok(bytes) => Self::Success(bytes),
            Err(err) => Self::Failure(err),
        }
    }
}

/// Serde adapter storing byte payloads as URL-safe base64 strings inside JSON.
pub(crate) mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }

    /// Same encoding for optional payloads; `None` is a JSON null.
    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => super::serialize(bytes, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            let encoded = Option::<String>::deserialize(deserializer)?;
            encoded
                .map(|s| URL_SAFE_NO_PAD.decode(s.as_bytes()))
                .transpose()
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_and_terminal() {
        for status in [
            InvocationStatus::Pending,
            InvocationStatus::Running,
            InvocationStatus::Suspended,
            InvocationStatus::Completed,
            InvocationStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<InvocationStatus>().unwrap(), status);
        }
        assert!(InvocationStatus::Completed.is_terminal());
        assert!(InvocationStatus::Failed.is_terminal());
        assert!(!InvocationStatus::Suspended.is_terminal());
        assert!("cancelled".parse::<InvocationStatus>().is_err());
    }

    #[test]
    fn test_outcome_json_shape() {
        let json = serde_json::to_value(Outcome::Success(b"ok".to_vec())).unwrap();
        assert_eq!(json, serde_json::json!({ "success": "b2s" }));

        let failure = Outcome::Failure(TerminalError::with_code(409, "cancelled"));
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["failure"]["code"], 409);
        let back: Outcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, failure);
    }

    #[test]
    fn test_request_builder() {
        let req = InvocationRequest::new("TicketService", "reserve", vec![])
            .with_key("seat-1")
            .with_delay(Duration::from_secs(5));
        assert_eq!(req.key.as_deref(), Some("seat-1"));
        assert_eq!(req.delay, Some(Duration::from_secs(5)));
    }
}
