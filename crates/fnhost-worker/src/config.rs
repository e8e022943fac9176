// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for fnhost-worker.
//!
//! The master passes these to each worker through its process environment.

use std::time::Duration;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Project this worker serves
    pub project: String,
    /// Maximum invocations executing at once
    pub concurrency: usize,
    /// Capacity of the outbound queue feeding the writer task
    pub outbound_capacity: usize,
    /// Attempts made to enqueue a reply while the outbound queue is full
    pub send_attempts: u32,
    /// Base delay between enqueue attempts (grows linearly)
    pub send_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            project: "default".to_string(),
            concurrency: 10,
            outbound_capacity: 256,
            send_attempts: 5,
            send_backoff: Duration::from_millis(20),
        }
    }
}

impl WorkerConfig {
    /// Config for `project` with every other field at its default.
    pub fn for_project(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let project = std::env::var("FNHOST_PROJECT")
            .map_err(|_| ConfigError::MissingEnvVar("FNHOST_PROJECT"))?;

        let concurrency = parse_var("FNHOST_WORKER_CONCURRENCY", defaults.concurrency)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid(
                "FNHOST_WORKER_CONCURRENCY",
                "must be at least 1".to_string(),
            ));
        }

        let outbound_capacity =
            parse_var("FNHOST_OUTBOUND_CAPACITY", defaults.outbound_capacity)?.max(1);
        let send_attempts = parse_var("FNHOST_SEND_ATTEMPTS", defaults.send_attempts)?.max(1);
        let send_backoff = Duration::from_millis(parse_var("FNHOST_SEND_BACKOFF_MS", 20u64)?);

        Ok(Self {
            project,
            concurrency,
            outbound_capacity,
            send_attempts,
            send_backoff,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid(name, e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable has an unusable value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
