// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keel Core - Durable Execution Engine
//!
//! Keel runs handlers against keyed entities. Every entity gets serialized,
//! single-writer access to its state; every externally visible or
//! nondeterministic action of a handler is journaled so that an attempt
//! interrupted by a crash replays deterministically without repeating
//! completed side effects; and completions from long-running external
//! systems are correlated back into the invocation that waits for them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               Engine                                     │
//! │           submit / invoke / attach / complete_callback / cancel          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Entity Scheduler                                │
//! │   per-key FIFO · worker permits · retry backoff · suspension · timers    │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ one attempt
//!                                    ▼
//! ┌───────────────────────┐    ┌─────────────────────┐   ┌──────────────────┐
//! │    Replay Engine      │───►│  Handler Registry   │   │ Callback         │
//! │  Context/ObjectContext│    │ (service, handler)  │   │ Correlator       │
//! └───────────────────────┘    └─────────────────────┘   └──────────────────┘
//!           │                                                     │
//!           ▼                                                     ▼
//! ┌───────────────────────┐    ┌─────────────────────┐   ┌──────────────────┐
//! │    Journal Store      │    │    State Store      │   │   Callbacks      │
//! └───────────────────────┘    └─────────────────────┘   └──────────────────┘
//!           └───────────────────────────┼───────────────────────┘
//!                                       ▼
//!                          ┌─────────────────────────┐
//!                          │   SQLite (Persistence)  │
//!                          └─────────────────────────┘
//! ```
//!
//! # Invocation Status State Machine
//!
//! ```text
//!     ┌─────────┐  start   ┌─────────┐  await callback / sleep / call   ┌───────────┐
//!     │ PENDING │─────────►│ RUNNING │─────────────────────────────────►│ SUSPENDED │
//!     └─────────┘          └────┬────┘◄─────────────────────────────────└───────────┘
//!                               │   completion / timer / callee done / cancel
//!                   ┌───────────┴───────────┐
//!                   ▼                       ▼
//!             ┌───────────┐           ┌────────┐
//!             │ COMPLETED │           │ FAILED │
//!             └───────────┘           └────────┘
//! ```
//!
//! A retryable failure keeps the invocation RUNNING and replays it after a
//! backoff. Terminal failures, divergence (code 570), cancellation (409) and
//! exhausted retries end it FAILED.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `KEEL_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `KEEL_MAX_CONCURRENT_INVOCATIONS` | No | `32` | Attempts executing at once |
//! | `KEEL_MAX_ATTEMPTS` | No | unbounded | Attempts before giving up |
//! | `KEEL_RETRY_INITIAL_DELAY_MS` | No | `100` | First retry delay |
//! | `KEEL_RETRY_MAX_DELAY_MS` | No | `10000` | Retry delay cap |
//! | `KEEL_RETRY_MULTIPLIER` | No | `2.0` | Retry delay growth |
//! | `KEEL_CALLBACK_TIMEOUT_MS` | No | none | Deadline for awaited callbacks |
//! | `KEEL_CALLBACK_TIMEOUT_POLICY` | No | `terminal` | `terminal` or `retryable` |

#![warn(missing_docs)]

/// Callback ids, first-wins completion, cancellation and deadlines.
pub mod callbacks;

/// Engine configuration loaded from environment variables.
pub mod config;

/// Handler-facing durable context.
pub mod context;

/// Engine errors and handler errors.
pub mod error;

/// Identifier newtypes.
pub mod ids;

/// Journal entries and the journal store.
pub mod journal;

/// JSON helpers for handler payloads.
pub mod json;

/// Embedded database migrations.
pub mod migrations;

/// Durable storage backend.
pub mod persistence;

/// Handler registration.
pub mod registry;

/// Deterministic replay of handler attempts.
pub mod replay;

/// Retry backoff policy.
pub mod retry;

/// Embeddable engine facade.
pub mod runtime;

/// Per-key scheduling of invocations.
pub mod scheduler;

/// Keyed entity state.
pub mod state;

/// Shared request and status types.
pub mod types;

pub use callbacks::{CallbackResult, Completion};
pub use config::{Config, TimeoutPolicy};
pub use context::{Awakeable, Context, ObjectContext};
pub use error::{CoreError, HandlerError, HandlerResult, TerminalError};
pub use ids::{CallbackId, EntityKey, InvocationId};
pub use registry::HandlerRegistry;
pub use retry::RetryPolicy;
pub use runtime::Engine;
pub use types::{InvocationRequest, InvocationStatus, Outcome};
