// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost Runtime - the master process
//!
//! Hosts many projects, each served by one long-lived worker process. The
//! master owns worker lifecycle, routes invocations under a global admission
//! limit, and hot-deploys functions into running workers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          HTTP API (axum)                              │
//! │   /projects   /functions/{project}   /tasks   /health                 │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │                 │                   │
//!        ▼                 ▼                   ▼
//! ┌─────────────┐  ┌───────────────┐   ┌──────────────┐
//! │ Supervisor  │  │  Hot Deploy   │   │  Dispatcher  │◄── TaskManager
//! │ (lifecycle) │  │  Controller   │   │  + Admission │
//! └─────────────┘  └───────────────┘   └──────────────┘
//!        │                 │                   │
//!        │ spawn           │ Reload            │ InvokeRequest
//!        ▼                 ▼                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │           WorkerChannel (framed IPC over stdin/stdout)                │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │
//!        ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │            fnhost-worker (one process per project)                    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # HTTP API
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness and admission counters |
//! | `GET` | `/projects` | List projects and worker state |
//! | `GET` | `/projects/{name}` | One project's status |
//! | `DELETE` | `/projects/{name}` | Stop and remove a project |
//! | `POST` | `/projects/{name}/start` | Start the project's worker |
//! | `POST` | `/projects/{name}/stop` | Stop the project's worker |
//! | `POST` | `/projects/{name}/restart` | Stop, then start |
//! | `GET` | `/functions/{project}` | List functions |
//! | `POST` | `/functions/{project}/deploy` | Deploy a function version |
//! | `DELETE` | `/functions/{project}/{function}` | Undeploy a function |
//! | `POST` | `/functions/{project}/{function}/invoke` | Invoke synchronously |
//! | `POST` | `/tasks/{project}/{function}` | Invoke in the background |
//! | `GET` | `/tasks` | List tasks |
//! | `GET` | `/tasks/{id}` | Task status and result |
//! | `POST` | `/tasks/{id}/cancel` | Cancel a task |
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `HOST` / `PORT` | No | `0.0.0.0` / `8080` | HTTP listen address |
//! | `DATA_DIR` | No | `.data` | Projects, artifacts and environments |
//! | `MAX_CONCURRENT` | No | `10` | Invocations executing at once |
//! | `BACKLOG` | No | `2048` | Invocations allowed to wait |
//! | `WORKER_BIN` | No | `fnhost-worker` | Worker executable |
//! | `PROVISION_COMMAND` | No | - | Shell command building environments |
//! | `AUTO_START` | No | `true` | Start every project at boot |
//!
//! See [`config::Config`] for the full list.

/// Global admission control.
pub mod admission;

/// HTTP API.
pub mod api;

/// Function and project records.
pub mod catalog;

/// Master end of the worker IPC channel.
pub mod channel;

/// Configuration loaded from environment variables.
pub mod config;

/// Hot deploy and removal of functions.
pub mod deploy;

/// Invocation routing.
pub mod dispatcher;

/// Error types for the master.
pub mod error;

/// Worker heartbeats.
pub mod health;

/// Worker process launchers.
pub mod launcher;

/// On-disk layout of the data directory.
pub mod layout;

/// Dependency environment provisioning.
pub mod provisioner;

/// Embeddable runtime.
pub mod runtime;

/// Per-project worker lifecycle.
pub mod supervisor;

/// Background invocations.
pub mod tasks;

pub use admission::{AdmissionController, AdmissionError, Ticket};
pub use config::Config;
pub use deploy::{
    DeployError, DeployRequest, Deployment, FunctionUpload, HotDeployController,
    ProjectDeployRequest, ProjectDeployment,
};
pub use dispatcher::{Dispatcher, Invocation, InvokeError};
pub use error::{Error, Result};
pub use runtime::{FnHostRuntime, FnHostRuntimeBuilder, FnHostRuntimeConfig};
pub use supervisor::{ProjectState, ProjectStatus, StopOutcome, Supervisor, SupervisorError};
pub use tasks::{TaskManager, TaskRecord, TaskStatus};
