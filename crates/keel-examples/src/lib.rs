// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Example services running on keel.
//!
//! Each module is a thin set of handlers plus a `register` function that
//! adds them to a [`HandlerRegistry`](keel_core::HandlerRegistry):
//!
//! - [`ticket`]: seat reservation state machine (keyed by seat)
//! - [`subscription`]: recurring payment plus one subscription per product
//! - [`delivery`]: food order waiting on the restaurant and a driver

pub mod delivery;
pub mod subscription;
pub mod ticket;

/// Install the `tracing` subscriber used by the example binaries.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();
}

/// Engine configuration from `KEEL_*` variables (and `.env`), falling back
/// to an in-memory database when none is configured.
pub fn load_config() -> keel_core::Config {
    dotenvy::dotenv().ok();

    match keel_core::Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("{}. Using an in-memory database.", e);
            keel_core::Config::default()
        }
    }
}
