// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identifier newtypes shared by the engine components.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Identity of one logical invocation. Stable across retries and restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(String);

impl InvocationId {
    /// Generate a fresh random invocation id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Derive the id of an invocation sent from journal entry `index` of `parent`.
    ///
    /// The same parent and index always produce the same id, so a send that is
    /// replayed after a crash targets the invocation it created the first time.
    pub fn derived(parent: &InvocationId, index: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(parent.0.as_bytes());
        hasher.update(index.to_be_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(uuid::Builder::from_random_bytes(bytes).into_uuid().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for InvocationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for InvocationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque, unguessable token handed to an external system so it can complete
/// an awakeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackId(String);

impl CallbackId {
    const PREFIX: &'static str = "cb_";

    /// Generate a new callback id from 128 random bits.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(format!("{}{}", Self::PREFIX, URL_SAFE_NO_PAD.encode(bytes)))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CallbackId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CallbackId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Partition identity: state is scoped to it and at most one invocation runs
/// against it at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Service the entity belongs to.
    pub service: String,
    /// Key within the service.
    pub key: String,
}

impl EntityKey {
    /// Create an entity key.
    pub fn new(service: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.key)
    }
}
