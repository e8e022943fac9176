// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime.
//!
//! [`FnHostRuntime`] wires the catalog, supervisor, dispatcher, deploy
//! controller and background workers together, and optionally serves the
//! HTTP API.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fnhost_runtime::config::Config;
//! use fnhost_runtime::runtime::FnHostRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!
//!     let runtime = FnHostRuntime::builder()
//!         .bind_addr(config.bind_addr)
//!         .config(config)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! Without a bind address no listener is opened; use
//! [`FnHostRuntime::state`] to call the components directly or
//! [`FnHostRuntime::router`] to mount the API elsewhere.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::admission::AdmissionController;
use crate::api::{self, ApiState};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::deploy::HotDeployController;
use crate::dispatcher::Dispatcher;
use crate::health::{HealthMonitor, HealthMonitorConfig};
use crate::launcher::{ProcessLauncher, WorkerLauncher};
use crate::layout::DataLayout;
use crate::provisioner::{CommandProvisioner, DirectoryProvisioner, EnvironmentProvisioner};
use crate::supervisor::{Supervisor, SupervisorConfig};
use crate::tasks::{TaskCleanupConfig, TaskCleanupWorker, TaskManager};

/// Builder for creating an [`FnHostRuntime`].
#[derive(Default)]
pub struct FnHostRuntimeBuilder {
    config: Config,
    launcher: Option<Arc<dyn WorkerLauncher>>,
    provisioner: Option<Arc<dyn EnvironmentProvisioner>>,
    bind_addr: Option<SocketAddr>,
}

impl FnHostRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the runtime configuration.
    ///
    /// Default: [`Config::default`]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the worker launcher.
    ///
    /// Default: [`ProcessLauncher`] running `config.worker_bin`
    pub fn launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Set the environment provisioner.
    ///
    /// Default: [`CommandProvisioner`] if `config.provision_command` is set,
    /// otherwise [`DirectoryProvisioner`]
    pub fn provisioner(mut self, provisioner: Arc<dyn EnvironmentProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Serve the HTTP API on this address. Port 0 picks a free port.
    ///
    /// Default: no HTTP listener
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Resolve defaults into a startable configuration.
    pub fn build(self) -> Result<FnHostRuntimeConfig> {
        if self.config.max_concurrent == 0 {
            anyhow::bail!("max_concurrent must be at least 1");
        }

        let launcher = self.launcher.unwrap_or_else(|| {
            Arc::new(ProcessLauncher::new(self.config.worker_bin.clone()))
        });
        let provisioner: Arc<dyn EnvironmentProvisioner> = match (
            self.provisioner,
            &self.config.provision_command,
        ) {
            (Some(provisioner), _) => provisioner,
            (None, Some(command)) => Arc::new(CommandProvisioner::new(
                command.clone(),
                self.config.timeout_notify,
            )),
            (None, None) => Arc::new(DirectoryProvisioner),
        };

        Ok(FnHostRuntimeConfig {
            config: self.config,
            launcher,
            provisioner,
            bind_addr: self.bind_addr,
        })
    }
}

/// Configuration for an [`FnHostRuntime`].
pub struct FnHostRuntimeConfig {
    config: Config,
    launcher: Arc<dyn WorkerLauncher>,
    provisioner: Arc<dyn EnvironmentProvisioner>,
    bind_addr: Option<SocketAddr>,
}

impl FnHostRuntimeConfig {
    /// Rehydrate the catalog, start projects (with `auto_start`), spawn the
    /// background workers and the HTTP server.
    pub async fn start(self) -> Result<FnHostRuntime> {
        let config = self.config;
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let catalog = Arc::new(Catalog::new(DataLayout::new(&config.data_dir)));
        let projects = catalog.rehydrate().await?;

        let supervisor = Supervisor::new(
            SupervisorConfig::from(&config),
            self.launcher.clone(),
            catalog,
        );
        let admission = Arc::new(AdmissionController::new(
            config.max_concurrent,
            config.backlog,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            supervisor.clone(),
            admission,
            config.invoke_timeout,
        ));
        let deployer = Arc::new(HotDeployController::new(
            supervisor.clone(),
            self.provisioner.clone(),
            config.timeout_notify,
        ));
        let tasks = Arc::new(TaskManager::new(dispatcher.clone()));

        let state = ApiState {
            supervisor: supervisor.clone(),
            dispatcher,
            deployer,
            tasks: tasks.clone(),
        };

        if config.auto_start && projects > 0 {
            info!(projects, "Auto-starting projects");
            supervisor.start_all().await;
        }

        let health_monitor = HealthMonitor::new(supervisor.clone(), HealthMonitorConfig::from(&config));
        let health_shutdown = health_monitor.shutdown_handle();
        let health_handle = tokio::spawn(async move {
            health_monitor.run().await;
        });

        let cleanup_worker = TaskCleanupWorker::new(
            tasks,
            TaskCleanupConfig {
                poll_interval: config.cleanup_interval,
                retention: config.task_retention,
            },
        );
        let cleanup_shutdown = cleanup_worker.shutdown_handle();
        let cleanup_handle = tokio::spawn(async move {
            cleanup_worker.run().await;
        });

        let server_shutdown = CancellationToken::new();
        let (server_handle, local_addr) = match self.bind_addr {
            Some(addr) => {
                let listener = tokio::net::TcpListener::bind(addr).await?;
                let local_addr = listener.local_addr()?;
                let app = api::router(state.clone());
                let token = server_shutdown.clone();
                let handle = tokio::spawn(async move {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(async move {
                            token.cancelled().await;
                            info!("HTTP server shutting down");
                        })
                        .await
                });
                (Some(handle), Some(local_addr))
            }
            None => (None, None),
        };

        info!(
            data_dir = %config.data_dir.display(),
            http_addr = ?local_addr,
            launcher = self.launcher.launcher_type(),
            provisioner = self.provisioner.provisioner_type(),
            max_concurrent = config.max_concurrent,
            backlog = config.backlog,
            "FnHostRuntime started"
        );

        Ok(FnHostRuntime {
            state,
            local_addr,
            server_handle,
            server_shutdown,
            health_handle,
            health_shutdown,
            cleanup_handle,
            cleanup_shutdown,
        })
    }
}

/// A running fnhost master that can be embedded in an application.
///
/// The runtime manages:
/// - the supervisor and per-project workers
/// - the health monitor
/// - the task cleanup worker
/// - the HTTP server (when a bind address was given)
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct FnHostRuntime {
    state: ApiState,
    local_addr: Option<SocketAddr>,
    server_handle: Option<JoinHandle<std::io::Result<()>>>,
    server_shutdown: CancellationToken,
    health_handle: JoinHandle<()>,
    health_shutdown: Arc<Notify>,
    cleanup_handle: JoinHandle<()>,
    cleanup_shutdown: Arc<Notify>,
}

impl FnHostRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> FnHostRuntimeBuilder {
        FnHostRuntimeBuilder::new()
    }

    /// Address the HTTP server listens on, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The wired components.
    pub fn state(&self) -> &ApiState {
        &self.state
    }

    /// A router over this runtime's components.
    pub fn router(&self) -> Router {
        api::router(self.state.clone())
    }

    /// Stop the HTTP server and background workers, then every project.
    pub async fn shutdown(self) -> Result<()> {
        info!("FnHostRuntime shutting down...");

        self.server_shutdown.cancel();
        self.health_shutdown.notify_one();
        self.cleanup_shutdown.notify_one();

        if let Some(handle) = self.server_handle {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "HTTP server error"),
                Err(e) => error!(error = %e, "HTTP server task panicked"),
            }
        }
        if let Err(e) = self.health_handle.await {
            error!(error = %e, "Health monitor task panicked");
        }
        if let Err(e) = self.cleanup_handle.await {
            error!(error = %e, "Task cleanup worker panicked");
        }

        self.state.supervisor.shutdown_all().await;

        info!("FnHostRuntime shutdown complete");
        Ok(())
    }
}
