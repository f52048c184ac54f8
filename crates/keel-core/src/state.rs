// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State store: durable `(service, key, slot) -> bytes`.
//!
//! Handlers never call this directly; they go through [`crate::ObjectContext`],
//! which journals every read and write. This type is the unjournaled view used
//! by the engine itself and for inspection.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::CoreError;
use crate::ids::EntityKey;
use crate::persistence::Persistence;

/// Keyed state access.
#[derive(Clone)]
pub struct StateStore {
    persistence: Arc<dyn Persistence>,
}

impl StateStore {
    /// Create a state store over a persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Current value of a slot.
    pub async fn get(&self, entity: &EntityKey, slot: &str) -> Result<Option<Vec<u8>>, CoreError> {
        self.persistence.get_state(entity, slot).await
    }

    /// Overwrite a slot.
    pub async fn set(&self, entity: &EntityKey, slot: &str, value: &[u8]) -> Result<(), CoreError> {
        self.persistence.set_state(entity, slot, value).await
    }

    /// Delete a slot. Deleting an empty slot is not an error.
    pub async fn clear(&self, entity: &EntityKey, slot: &str) -> Result<(), CoreError> {
        self.persistence.clear_state(entity, slot).await
    }

    /// Every slot of an entity.
    pub async fn entries(&self, entity: &EntityKey) -> Result<BTreeMap<String, Vec<u8>>, CoreError> {
        Ok(self
            .persistence
            .list_state(entity)
            .await?
            .into_iter()
            .map(|record| (record.slot, record.value))
            .collect())
    }
}
