// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed payload helpers. Payloads are opaque bytes to the engine; handlers
//! that exchange JSON use these to cross the boundary.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{HandlerResult, TerminalError};

/// Encode a value as a JSON payload.
pub fn to_bytes<T: Serialize + ?Sized>(value: &T) -> HandlerResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        TerminalError::with_code(
            TerminalError::INTERNAL,
            format!("failed to encode payload: {}", e),
        )
        .into()
    })
}

/// Decode a JSON payload. Malformed input is a terminal 400.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> HandlerResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}
