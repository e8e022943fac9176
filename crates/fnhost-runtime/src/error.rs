// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fnhost-runtime.

use thiserror::Error;

/// Master errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Worker lifecycle operation failed.
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] crate::supervisor::SupervisorError),

    /// Invocation failed.
    #[error("Invocation error: {0}")]
    Invoke(#[from] crate::dispatcher::InvokeError),

    /// Deploy or removal failed.
    #[error("Deploy error: {0}")]
    Deploy(#[from] crate::deploy::DeployError),

    /// Async task operation failed.
    #[error("Task error: {0}")]
    Task(#[from] crate::tasks::TaskError),

    /// Worker launch failed.
    #[error("Launch error: {0}")]
    Launch(#[from] crate::launcher::LaunchError),

    /// Worker channel failed.
    #[error("Channel error: {0}")]
    Channel(#[from] crate::channel::ChannelError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type using the master Error.
pub type Result<T> = std::result::Result<T, Error>;
