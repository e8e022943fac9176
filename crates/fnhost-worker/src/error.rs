// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fnhost-worker.

use std::path::PathBuf;

use thiserror::Error;

/// Worker errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Reading or writing a frame failed.
    #[error("Frame error: {0}")]
    Frame(#[from] fnhost_protocol::FrameError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The outbound half of the channel is gone.
    #[error("Channel to master closed")]
    ChannelClosed,
}

/// Errors raised while turning a function entry into a callable handler.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoadError {
    /// The artifact file could not be read.
    #[error("IO error reading {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The artifact file is not valid JSON for an artifact.
    #[error("Invalid artifact {path}: {source}")]
    Json {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// The artifact parsed but is unusable.
    #[error("Invalid artifact: {0}")]
    Invalid(#[from] fnhost_protocol::ArtifactError),

    /// The exec runtime's entry point is missing.
    #[error("Entry point not found: {0}")]
    MissingEntry(PathBuf),

    /// Loading one function of a table failed.
    #[error("Failed to load function '{function}': {source}")]
    Function {
        /// Function whose load failed.
        function: String,
        /// Underlying error.
        source: Box<LoadError>,
    },
}

/// Result type using [`WorkerError`].
pub type Result<T> = std::result::Result<T, WorkerError>;
