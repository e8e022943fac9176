// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker lifecycle tests against in-process workers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use fnhost_protocol::{AckResult, ControlAck, Envelope, Ready, read_frame, write_frame};
use fnhost_runtime::InvokeError;
use fnhost_runtime::catalog::Catalog;
use fnhost_runtime::health::{HealthMonitor, HealthMonitorConfig};
use fnhost_runtime::launcher::{
    LaunchError, LaunchSpec, LaunchedWorker, WorkerExit, WorkerLauncher, WorkerProcess,
};
use fnhost_runtime::layout::DataLayout;
use fnhost_runtime::supervisor::{
    ProjectState, RestartPolicy, StopOutcome, Supervisor, SupervisorConfig, SupervisorError,
};
use serde_json::json;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

/// Launches workers that never complete the handshake.
struct SilentLauncher;

struct SilentWorker {
    _pipe: DuplexStream,
}

#[async_trait]
impl WorkerProcess for SilentWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Result<WorkerExit, LaunchError> {
        std::future::pending().await
    }

    async fn kill(&mut self) -> Result<WorkerExit, LaunchError> {
        Ok(WorkerExit {
            success: false,
            code: None,
        })
    }
}

#[async_trait]
impl WorkerLauncher for SilentLauncher {
    fn launcher_type(&self) -> &'static str {
        "silent"
    }

    async fn launch(&self, _spec: &LaunchSpec) -> Result<LaunchedWorker, LaunchError> {
        let (master, worker) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(master);
        Ok(LaunchedWorker {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: Box::new(SilentWorker { _pipe: worker }),
        })
    }
}

/// Launches workers that handshake and acknowledge control commands but
/// never answer a ping.
struct DeafLauncher;

struct DeafWorker {
    peer: JoinHandle<()>,
}

impl Drop for DeafWorker {
    fn drop(&mut self) {
        self.peer.abort();
    }
}

#[async_trait]
impl WorkerProcess for DeafWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Result<WorkerExit, LaunchError> {
        std::future::pending().await
    }

    async fn kill(&mut self) -> Result<WorkerExit, LaunchError> {
        self.peer.abort();
        Ok(WorkerExit {
            success: false,
            code: None,
        })
    }
}

#[async_trait]
impl WorkerLauncher for DeafLauncher {
    fn launcher_type(&self) -> &'static str {
        "deaf"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorker, LaunchError> {
        let (master, worker) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(master);
        let project = spec.project.clone();
        let peer = tokio::spawn(async move {
            let (mut rx, mut tx) = tokio::io::split(worker);
            let ready = Envelope::Ready(Ready { pid: 0, project });
            if write_frame(&mut tx, &ready.to_frame().unwrap()).await.is_err() {
                return;
            }
            while let Ok(frame) = read_frame(&mut rx).await {
                let Ok(Envelope::ControlCommand(command)) = Envelope::from_frame(&frame) else {
                    continue;
                };
                let ack = Envelope::ControlAck(ControlAck {
                    correlation_id: command.correlation_id,
                    kind: command.kind,
                    version: command.version,
                    result: AckResult::Ok,
                });
                if write_frame(&mut tx, &ack.to_frame().unwrap()).await.is_err() {
                    return;
                }
            }
        });
        Ok(LaunchedWorker {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: Box::new(DeafWorker { peer }),
        })
    }
}

async fn deaf_supervisor(dir: &std::path::Path, restart: RestartPolicy) -> Supervisor {
    let catalog = Arc::new(Catalog::new(DataLayout::new(dir)));
    catalog.ensure_project("shop").await.unwrap();
    Supervisor::new(
        SupervisorConfig {
            restart,
            ..SupervisorConfig::default()
        },
        Arc::new(DeafLauncher),
        catalog,
    )
}

fn impatient_monitor(supervisor: &Supervisor) -> HealthMonitor {
    HealthMonitor::new(
        supervisor.clone(),
        HealthMonitorConfig {
            poll_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_millis(50),
            max_missed: 3,
        },
    )
}

async fn silent_supervisor(dir: &std::path::Path) -> Supervisor {
    let catalog = Arc::new(Catalog::new(DataLayout::new(dir)));
    catalog.ensure_project("shop").await.unwrap();
    Supervisor::new(
        SupervisorConfig {
            startup_timeout: Duration::from_millis(300),
            ..SupervisorConfig::default()
        },
        Arc::new(SilentLauncher),
        catalog,
    )
}

// ============================================================================
// Start
// ============================================================================

#[tokio::test]
async fn test_start_unknown_project() {
    let host = TestHost::new().await;

    let err = host.supervisor.start_project("ghost").await.unwrap_err();
    assert!(matches!(err, SupervisorError::ProjectNotFound(name) if name == "ghost"));
}

#[tokio::test]
async fn test_start_loads_active_functions() {
    let host = TestHost::new().await;
    let deployment = host
        .deploy_template("shop", "hello", json!({"message": "hello, {{name}}"}))
        .await;
    assert!(!deployment.live);

    let status = host.supervisor.start_project("shop").await.unwrap();
    assert_eq!(status.state, ProjectState::Running);
    assert_eq!(status.version, Some(deployment.version));
    assert!(status.started_at.is_some());

    let invocation = host
        .dispatcher
        .invoke("shop", "hello", json!({"name": "A"}), None)
        .await
        .unwrap();
    assert_eq!(invocation.result, json!({"message": "hello, A"}));
    assert_eq!(invocation.version, deployment.version);
}

#[tokio::test]
async fn test_start_running_project_is_rejected() {
    let host = TestHost::new().await;
    host.running("shop", "hello", json!("hi")).await;

    let err = host.supervisor.start_project("shop").await.unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyRunning(_)));
    assert_eq!(
        host.supervisor.status("shop").unwrap().state,
        ProjectState::Running
    );
}

#[tokio::test]
async fn test_startup_timeout_marks_crashed() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = silent_supervisor(dir.path()).await;

    let err = supervisor.start_project("shop").await.unwrap_err();
    assert!(matches!(err, SupervisorError::StartupTimeout { .. }));

    let status = supervisor.status("shop").unwrap();
    assert_eq!(status.state, ProjectState::Crashed);
    assert!(status.last_error.is_some());
    assert!(supervisor.running_worker("shop").is_none());
}

#[tokio::test]
async fn test_concurrent_lifecycle_operation_is_busy() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = silent_supervisor(dir.path()).await;

    let starting = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.start_project("shop").await })
    };
    assert!(
        wait_until(|| supervisor.status("shop").unwrap().state == ProjectState::Starting).await
    );

    let err = supervisor.stop_project("shop").await.unwrap_err();
    assert!(matches!(err, SupervisorError::LifecycleBusy(_)));
    let err = supervisor.start_project("shop").await.unwrap_err();
    assert!(matches!(err, SupervisorError::LifecycleBusy(_)));

    assert!(starting.await.unwrap().is_err());
}

// ============================================================================
// Stop
// ============================================================================

#[tokio::test]
async fn test_stop_not_running() {
    let host = TestHost::new().await;
    host.deploy_template("shop", "hello", json!("hi")).await;

    let outcome = host.supervisor.stop_project("shop").await.unwrap();
    assert_eq!(outcome, StopOutcome::NotRunning);
    assert_eq!(
        host.supervisor.status("shop").unwrap().state,
        ProjectState::Stopped
    );
}

#[tokio::test]
async fn test_graceful_stop_drains_in_flight() {
    let host = TestHost::new().await;
    host.running("shop", "slow", json!({"done": true})).await;

    let dispatcher = host.dispatcher.clone();
    let call = tokio::spawn(async move {
        dispatcher
            .invoke("shop", "slow", json!({"sleep_ms": 200}), None)
            .await
    });
    let worker = host.supervisor.running_worker("shop").unwrap();
    assert!(wait_until(|| worker.channel().pending_count() == 1).await);

    let outcome = host.supervisor.stop_project("shop").await.unwrap();
    assert_eq!(outcome, StopOutcome::Graceful);

    let invocation = call.await.unwrap().unwrap();
    assert_eq!(invocation.result, json!({"done": true}));

    let status = host.supervisor.status("shop").unwrap();
    assert_eq!(status.state, ProjectState::Stopped);
    assert_eq!(status.last_stop, Some(StopOutcome::Graceful));
}

#[tokio::test]
async fn test_forced_stop_fails_in_flight() {
    let host = TestHost::with(HostOptions {
        grace: Duration::from_millis(100),
        ..HostOptions::default()
    })
    .await;
    host.running("shop", "slow", json!({"done": true})).await;

    let dispatcher = host.dispatcher.clone();
    let call = tokio::spawn(async move {
        dispatcher
            .invoke("shop", "slow", json!({"sleep_ms": 5000}), None)
            .await
    });
    let worker = host.supervisor.running_worker("shop").unwrap();
    assert!(wait_until(|| worker.channel().pending_count() == 1).await);

    let outcome = host.supervisor.stop_project("shop").await.unwrap();
    assert_eq!(outcome, StopOutcome::Forced);

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, InvokeError::WorkerUnavailable(_)));
    assert!(worker.channel().is_closed());

    // A stopped project is not restarted by its crash watcher.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        host.supervisor.status("shop").unwrap().state,
        ProjectState::Stopped
    );
}

#[tokio::test]
async fn test_restart_replaces_worker() {
    let host = TestHost::new().await;
    host.running("shop", "hello", json!("hi")).await;
    let before = host.supervisor.running_worker("shop").unwrap().generation();

    let status = host.supervisor.restart_project("shop").await.unwrap();
    assert_eq!(status.state, ProjectState::Running);

    let after = host.supervisor.running_worker("shop").unwrap().generation();
    assert_ne!(before, after);
    assert_eq!(status.restarts, 0);
}

// ============================================================================
// Crashes
// ============================================================================

#[tokio::test]
async fn test_crash_without_restart_budget() {
    let host = TestHost::new().await;
    host.running("shop", "hello", json!("hi")).await;

    assert!(host.launcher.crash("shop"));
    assert!(
        wait_until(|| host.supervisor.status("shop").unwrap().state == ProjectState::Crashed)
            .await
    );

    let err = host
        .dispatcher
        .invoke("shop", "hello", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, InvokeError::ProjectNotRunning(_)));
}

#[tokio::test]
async fn test_crash_is_restarted_within_budget() {
    let host = TestHost::with(HostOptions {
        restart: RestartPolicy {
            max_restarts: 1,
            window: Duration::from_secs(60),
        },
        ..HostOptions::default()
    })
    .await;
    host.running("shop", "hello", json!("hi")).await;
    let first = host.supervisor.running_worker("shop").unwrap().generation();

    assert!(host.launcher.crash("shop"));
    assert!(
        wait_until(|| host
            .supervisor
            .running_worker("shop")
            .is_some_and(|w| w.generation() != first))
        .await
    );

    let status = host.supervisor.status("shop").unwrap();
    assert_eq!(status.restarts, 1);
    let invocation = host
        .dispatcher
        .invoke("shop", "hello", json!({}), None)
        .await
        .unwrap();
    assert_eq!(invocation.result, json!("hi"));

    // The window allows one restart only.
    assert!(host.launcher.crash("shop"));
    assert!(
        wait_until(|| host.supervisor.status("shop").unwrap().state == ProjectState::Crashed)
            .await
    );
    assert_eq!(host.supervisor.status("shop").unwrap().restarts, 1);
}

#[tokio::test]
async fn test_health_monitor_records_heartbeats() {
    let host = TestHost::new().await;
    host.running("shop", "hello", json!("hi")).await;
    host.running("cart", "hello", json!("hi")).await;

    let monitor = HealthMonitor::new(host.supervisor.clone(), HealthMonitorConfig::default());
    assert_eq!(monitor.check_workers().await, 2);

    let status = host.supervisor.status("shop").unwrap();
    assert!(status.last_heartbeat.is_some());
}

#[tokio::test]
async fn test_missed_heartbeats_crash_worker() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = deaf_supervisor(dir.path(), RestartPolicy::disabled()).await;
    supervisor.start_project("shop").await.unwrap();
    let monitor = impatient_monitor(&supervisor);

    assert_eq!(monitor.check_workers().await, 0);
    assert_eq!(monitor.check_workers().await, 0);
    assert_eq!(
        supervisor.status("shop").unwrap().state,
        ProjectState::Running
    );

    assert_eq!(monitor.check_workers().await, 0);
    let status = supervisor.status("shop").unwrap();
    assert_eq!(status.state, ProjectState::Crashed);
    assert_eq!(status.restarts, 0);
    assert!(status.last_error.unwrap().contains("3 consecutive heartbeats"));
    assert!(supervisor.running_worker("shop").is_none());
}

#[tokio::test]
async fn test_missed_heartbeats_restart_within_budget() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = deaf_supervisor(
        dir.path(),
        RestartPolicy {
            max_restarts: 1,
            window: Duration::from_secs(60),
        },
    )
    .await;
    supervisor.start_project("shop").await.unwrap();
    let first = supervisor.running_worker("shop").unwrap().generation();
    let monitor = impatient_monitor(&supervisor);

    for _ in 0..3 {
        monitor.check_workers().await;
    }
    let status = supervisor.status("shop").unwrap();
    assert_eq!(status.state, ProjectState::Running);
    assert_eq!(status.restarts, 1);
    assert_ne!(
        supervisor.running_worker("shop").unwrap().generation(),
        first
    );

    // The replacement is just as deaf and the budget is spent.
    for _ in 0..3 {
        monitor.check_workers().await;
    }
    let status = supervisor.status("shop").unwrap();
    assert_eq!(status.state, ProjectState::Crashed);
    assert_eq!(status.restarts, 1);
}

// ============================================================================
// Removal and shutdown
// ============================================================================

#[tokio::test]
async fn test_remove_project_deletes_files() {
    let host = TestHost::new().await;
    host.running("shop", "hello", json!("hi")).await;
    let project_dir = host.supervisor.catalog().layout().project_dir("shop");
    assert!(project_dir.exists());

    host.supervisor.remove_project("shop").await.unwrap();

    assert!(!project_dir.exists());
    assert!(matches!(
        host.supervisor.status("shop"),
        Err(SupervisorError::ProjectNotFound(_))
    ));
    assert!(host.supervisor.list_projects().is_empty());
}

#[tokio::test]
async fn test_shutdown_all_stops_every_project() {
    let host = TestHost::new().await;
    host.running("shop", "hello", json!("hi")).await;
    host.running("cart", "hello", json!("hi")).await;

    host.supervisor.shutdown_all().await;

    for status in host.supervisor.list_projects() {
        assert_eq!(status.state, ProjectState::Stopped, "{}", status.name);
        assert_eq!(status.last_stop, Some(StopOutcome::Graceful));
    }
    assert!(host.supervisor.running_workers().is_empty());
}
