// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost Worker - one process per project
//!
//! The worker loads a project's deployed functions and executes invocations
//! sent by the master over its stdin/stdout.
//!
//! # Architecture
//!
//! ```text
//!   master ──stdin──►  read loop ──► TaskTracker (≤ concurrency permits)
//!                          │                    │
//!                          │ reload             │ InvokeResponse
//!                          ▼                    ▼
//!                    reload task           bounded queue ──► writer ──stdout──► master
//!                          │ build, swap, ack   ▲
//!                          ▼                    │
//!                  RwLock<Arc<DispatchTable>> ──┘ (ControlAck)
//! ```
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `FNHOST_PROJECT` | Yes | - | Project served by this worker |
//! | `FNHOST_WORKER_CONCURRENCY` | No | `10` | Invocations executing at once |
//! | `FNHOST_OUTBOUND_CAPACITY` | No | `256` | Outbound queue depth |
//! | `FNHOST_SEND_ATTEMPTS` | No | `5` | Enqueue attempts on a full queue |
//! | `FNHOST_SEND_BACKOFF_MS` | No | `20` | Linear backoff step between attempts |
//!
//! Logs go to stderr; stdout carries the IPC channel.

/// Worker configuration loaded from environment variables.
pub mod config;

/// Error types for the worker.
pub mod error;

/// Function loaders and handlers for the artifact runtimes.
pub mod loader;

/// The IPC serve loop.
pub mod runtime;

/// Versioned dispatch table.
pub mod table;

pub use config::WorkerConfig;
pub use error::{LoadError, WorkerError};
pub use loader::{DefaultLoader, FunctionHandler, FunctionLoader};
pub use runtime::WorkerRuntime;
pub use table::DispatchTable;
