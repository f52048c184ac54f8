// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// What happens when an awaited callback is not completed before its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Resume the handler with a journaled terminal timeout error (code 408).
    #[default]
    Terminal,
    /// Fail the attempt with a retryable error and re-arm the deadline.
    Retryable,
}

impl FromStr for TimeoutPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "terminal" => Ok(Self::Terminal),
            "retryable" => Ok(Self::Retryable),
            _ => Err(ConfigError::Invalid(
                "KEEL_CALLBACK_TIMEOUT_POLICY",
                "must be 'terminal' or 'retryable'",
            )),
        }
    }
}

/// Keel engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Upper bound on attempts executing at the same time
    pub max_concurrent_invocations: u32,
    /// Backoff between retries of one invocation
    pub retry: RetryPolicy,
    /// Deadline for awaited callbacks; `None` waits forever
    pub callback_timeout: Option<Duration>,
    /// Behaviour on callback deadline expiry
    pub callback_timeout_policy: TimeoutPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_concurrent_invocations: 32,
            retry: RetryPolicy::default(),
            callback_timeout: None,
            callback_timeout_policy: TimeoutPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `KEEL_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `KEEL_MAX_CONCURRENT_INVOCATIONS`: worker permits (default: 32)
    /// - `KEEL_MAX_ATTEMPTS`: attempts before giving up (default: unbounded)
    /// - `KEEL_RETRY_INITIAL_DELAY_MS`: first backoff (default: 100)
    /// - `KEEL_RETRY_MAX_DELAY_MS`: backoff cap (default: 10000)
    /// - `KEEL_RETRY_MULTIPLIER`: backoff growth (default: 2.0)
    /// - `KEEL_CALLBACK_TIMEOUT_MS`: callback deadline (default: none)
    /// - `KEEL_CALLBACK_TIMEOUT_POLICY`: `terminal` or `retryable` (default: terminal)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("KEEL_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("KEEL_DATABASE_URL"))?;

        let max_concurrent_invocations: u32 = parse_var(
            "KEEL_MAX_CONCURRENT_INVOCATIONS",
            "must be a positive integer",
        )?
        .unwrap_or(32);
        if max_concurrent_invocations == 0 {
            return Err(ConfigError::Invalid(
                "KEEL_MAX_CONCURRENT_INVOCATIONS",
                "must be a positive integer",
            ));
        }

        let defaults = RetryPolicy::default();
        let max_attempts: Option<u32> =
            parse_var("KEEL_MAX_ATTEMPTS", "must be a positive integer")?;
        if max_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "KEEL_MAX_ATTEMPTS",
                "must be a positive integer",
            ));
        }
        let initial_delay = parse_var::<u64>("KEEL_RETRY_INITIAL_DELAY_MS", "must be milliseconds")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.initial_delay);
        let max_delay = parse_var::<u64>("KEEL_RETRY_MAX_DELAY_MS", "must be milliseconds")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_delay);
        let multiplier: f64 = parse_var("KEEL_RETRY_MULTIPLIER", "must be a number >= 1.0")?
            .unwrap_or(defaults.multiplier);
        if !(multiplier >= 1.0 && multiplier.is_finite()) {
            return Err(ConfigError::Invalid(
                "KEEL_RETRY_MULTIPLIER",
                "must be a number >= 1.0",
            ));
        }

        let callback_timeout = parse_var::<u64>("KEEL_CALLBACK_TIMEOUT_MS", "must be milliseconds")?
            .map(Duration::from_millis);
        let callback_timeout_policy = match std::env::var("KEEL_CALLBACK_TIMEOUT_POLICY") {
            Ok(value) => value.parse()?,
            Err(_) => TimeoutPolicy::default(),
        };

        Ok(Self {
            database_url,
            max_concurrent_invocations,
            retry: RetryPolicy {
                initial_delay,
                max_delay,
                multiplier,
                max_attempts,
            },
            callback_timeout,
            callback_timeout_policy,
        })
    }
}

fn parse_var<T: FromStr>(
    name: &'static str,
    expectation: &'static str,
) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(name, expectation)),
        Err(_) => Ok(None),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
