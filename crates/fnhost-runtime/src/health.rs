// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that pings running workers.
//!
//! Every poll interval each running worker gets a `Ping`. A `Pong` within
//! the ping timeout refreshes its heartbeat and served version. A worker
//! that misses `max_missed` consecutive pings is declared crashed, which
//! hands it to the supervisor's restart policy.
//!
//! A closed channel is picked up by the supervisor's crash watcher
//! directly; the monitor covers workers that are alive but unresponsive.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::supervisor::{Supervisor, WorkerHandle};

/// Configuration for the health monitor.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// How often to ping workers.
    pub poll_interval: Duration,
    /// How long a ping may take.
    pub ping_timeout: Duration,
    /// Consecutive misses before the worker is declared crashed.
    pub max_missed: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for HealthMonitorConfig {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.cleanup_interval,
            ping_timeout: config.timeout_keep_alive,
            max_missed: config.heartbeat_max_missed.max(1),
        }
    }
}

/// Background worker that health-checks running projects.
pub struct HealthMonitor {
    supervisor: Supervisor,
    config: HealthMonitorConfig,
    shutdown: Arc<Notify>,
}

impl HealthMonitor {
    pub fn new(supervisor: Supervisor, config: HealthMonitorConfig) -> Self {
        Self {
            supervisor,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the monitor loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_missed = self.config.max_missed,
            "Health monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Health monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.check_workers().await;
                }
            }
        }

        info!("Health monitor stopped");
    }

    /// Ping every running worker once. Returns the number that answered.
    pub async fn check_workers(&self) -> usize {
        let workers = self.supervisor.running_workers();
        if workers.is_empty() {
            debug!("No running workers to check");
            return 0;
        }

        let checks = workers
            .into_iter()
            .map(|(project, worker)| async move { self.check_worker(&project, &worker).await });
        let results = futures::future::join_all(checks).await;
        results.into_iter().filter(|healthy| *healthy).count()
    }

    async fn check_worker(&self, project: &str, worker: &Arc<WorkerHandle>) -> bool {
        match worker.channel().ping(self.config.ping_timeout).await {
            Ok(pong) => {
                worker.record_heartbeat(pong.version);
                debug!(project, version = pong.version, in_flight = pong.in_flight, "Heartbeat");
                true
            }
            Err(e) => {
                let missed = worker.record_missed_heartbeat();
                warn!(project, missed, max_missed = self.config.max_missed, error = %e, "Missed heartbeat");
                if missed >= self.config.max_missed {
                    self.supervisor
                        .declare_crashed(
                            project,
                            worker.generation(),
                            &format!("missed {} consecutive heartbeats", missed),
                        )
                        .await;
                }
                false
            }
        }
    }
}
