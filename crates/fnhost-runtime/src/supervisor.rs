// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker lifecycle supervision.
//!
//! The supervisor owns one slot per project. Lifecycle operations (start,
//! stop, restart, crash handling) hold the slot's lifecycle lock for their
//! whole duration; a second caller arriving while one runs gets
//! [`SupervisorError::LifecycleBusy`]. Readers such as the dispatcher only
//! take short snapshots of the slot state.
//!
//! # State machine
//!
//! ```text
//!  stopped ──start──► starting ──ready + initial load──► running
//!     ▲                   │                                 │
//!     │                   └──timeout / load error──► crashed ◄── channel closed,
//!     │                                                 │       missed heartbeats
//!     └──────────── stopping ◄──stop────────────────────┘
//! ```
//!
//! A crash is followed by an automatic restart while the [`RestartPolicy`]
//! budget allows it. A worker whose dispatch table is in doubt is recycled
//! (`running → starting`) outside the budget.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fnhost_protocol::{AckResult, ControlKind};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, TableChange};
use crate::channel::WorkerChannel;
use crate::config::Config;
use crate::launcher::{LaunchError, LaunchSpec, WorkerLauncher, WorkerProcess};

/// Lifecycle state of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl std::fmt::Display for ProjectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProjectState::Stopped => "stopped",
            ProjectState::Starting => "starting",
            ProjectState::Running => "running",
            ProjectState::Stopping => "stopping",
            ProjectState::Crashed => "crashed",
        };
        write!(f, "{}", s)
    }
}

/// How a stop completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The worker drained and acknowledged within the graceful window.
    Graceful,
    /// The window elapsed and the worker was killed.
    Forced,
    /// There was no worker to stop.
    NotRunning,
}

/// Supervisor errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("lifecycle operation already in progress for project {0}")]
    LifecycleBusy(String),

    #[error("project {0} is already running")]
    AlreadyRunning(String),

    #[error("project {project} did not become ready: {reason}")]
    StartupTimeout { project: String, reason: String },

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("failed to launch worker for {project}: {source}")]
    LaunchFailed {
        project: String,
        #[source]
        source: LaunchError,
    },

    #[error("worker for {project} failed to load functions: {message}")]
    LoadFailed { project: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Automatic restarts allowed per sliding window.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
}

impl RestartPolicy {
    pub fn disabled() -> Self {
        Self {
            max_restarts: 0,
            window: Duration::ZERO,
        }
    }

    /// Record a restart at `now` if the window still has budget.
    pub fn permit(&self, history: &mut VecDeque<Instant>, now: Instant) -> bool {
        if self.max_restarts == 0 {
            return false;
        }
        while history
            .front()
            .is_some_and(|at| now.duration_since(*at) >= self.window)
        {
            history.pop_front();
        }
        if history.len() < self.max_restarts as usize {
            history.push_back(now);
            true
        } else {
            false
        }
    }
}

/// Supervisor timing and policy.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Wait for the worker's `Ready` frame
    pub startup_timeout: Duration,
    /// Drain window for a graceful stop
    pub graceful_shutdown_timeout: Duration,
    /// Wait for a reload ack
    pub notify_timeout: Duration,
    pub worker_concurrency: usize,
    pub restart: RestartPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SupervisorConfig {
    fn from(config: &Config) -> Self {
        Self {
            startup_timeout: config.timeout_keep_alive,
            graceful_shutdown_timeout: config.timeout_graceful_shutdown,
            notify_timeout: config.timeout_notify,
            worker_concurrency: config.worker_concurrency,
            restart: RestartPolicy {
                max_restarts: config.restart_max,
                window: config.restart_window,
            },
        }
    }
}

/// A live worker: its process, channel and health bookkeeping.
pub struct WorkerHandle {
    generation: u64,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    channel: Arc<WorkerChannel>,
    served_version: AtomicU64,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
    missed_heartbeats: AtomicU32,
    process: tokio::sync::Mutex<Box<dyn WorkerProcess>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("generation", &self.generation)
            .field("pid", &self.pid)
            .field("served_version", &self.served_version())
            .finish()
    }
}

impl WorkerHandle {
    /// Distinguishes successive workers of the same project.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn channel(&self) -> &Arc<WorkerChannel> {
        &self.channel
    }

    /// Version of the last table the worker acknowledged.
    pub fn served_version(&self) -> u64 {
        self.served_version.load(Ordering::SeqCst)
    }

    /// Versions only move forward.
    pub fn set_served_version(&self, version: u64) {
        self.served_version.fetch_max(version, Ordering::SeqCst);
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_heartbeat(&self, version: u64) {
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.missed_heartbeats.store(0, Ordering::SeqCst);
        self.set_served_version(version);
    }

    /// Count a missed heartbeat; returns the consecutive total.
    pub fn record_missed_heartbeat(&self) -> u32 {
        self.missed_heartbeats.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn terminate(&self) {
        self.channel.close();
        let mut process = self.process.lock().await;
        match process.kill().await {
            Ok(exit) => debug!(pid = ?self.pid, ?exit, "Worker terminated"),
            Err(e) => warn!(pid = ?self.pid, error = %e, "Failed to terminate worker"),
        }
    }
}

/// Externally visible project status.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    pub name: String,
    pub state: ProjectState,
    /// Version served by the running worker
    pub version: Option<u64>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Automatic restarts performed
    pub restarts: u32,
    pub last_stop: Option<StopOutcome>,
    pub last_error: Option<String>,
}

struct SlotState {
    state: ProjectState,
    worker: Option<Arc<WorkerHandle>>,
    restarts: u32,
    restart_history: VecDeque<Instant>,
    last_stop: Option<StopOutcome>,
    last_error: Option<String>,
}

struct ProjectSlot {
    lifecycle: tokio::sync::Mutex<()>,
    state: RwLock<SlotState>,
}

impl ProjectSlot {
    fn new() -> Self {
        Self {
            lifecycle: tokio::sync::Mutex::new(()),
            state: RwLock::new(SlotState {
                state: ProjectState::Stopped,
                worker: None,
                restarts: 0,
                restart_history: VecDeque::new(),
                last_stop: None,
                last_error: None,
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SlotState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SlotState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(&self, state: ProjectState, error: String) {
        let mut slot = self.write();
        slot.state = state;
        slot.worker = None;
        slot.last_error = Some(error);
    }

    fn status(&self, name: &str) -> ProjectStatus {
        let slot = self.read();
        let worker = slot.worker.as_ref();
        ProjectStatus {
            name: name.to_string(),
            state: slot.state,
            version: worker.map(|w| w.served_version()),
            pid: worker.and_then(|w| w.pid()),
            started_at: worker.map(|w| w.started_at()),
            last_heartbeat: worker.and_then(|w| w.last_heartbeat()),
            restarts: slot.restarts,
            last_stop: slot.last_stop,
            last_error: slot.last_error.clone(),
        }
    }
}

struct Inner {
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    catalog: Arc<Catalog>,
    slots: Mutex<HashMap<String, Arc<ProjectSlot>>>,
    next_generation: AtomicU64,
    shutting_down: AtomicBool,
}

/// Owns every project's worker.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn WorkerLauncher>,
        catalog: Arc<Catalog>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                launcher,
                catalog,
                slots: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.inner.catalog
    }

    /// Spawn the project's worker and load its active functions.
    pub async fn start_project(&self, name: &str) -> Result<ProjectStatus> {
        let slot = self.known_slot(name)?;
        let _lifecycle = slot
            .lifecycle
            .try_lock()
            .map_err(|_| SupervisorError::LifecycleBusy(name.to_string()))?;
        self.start_locked(name, &slot).await
    }

    /// Drain and stop the project's worker, killing it if the graceful
    /// window elapses.
    pub async fn stop_project(&self, name: &str) -> Result<StopOutcome> {
        let slot = self.known_slot(name)?;
        let _lifecycle = slot
            .lifecycle
            .try_lock()
            .map_err(|_| SupervisorError::LifecycleBusy(name.to_string()))?;
        Ok(self.stop_locked(name, &slot).await)
    }

    pub async fn restart_project(&self, name: &str) -> Result<ProjectStatus> {
        let slot = self.known_slot(name)?;
        let _lifecycle = slot
            .lifecycle
            .try_lock()
            .map_err(|_| SupervisorError::LifecycleBusy(name.to_string()))?;
        self.stop_locked(name, &slot).await;
        self.start_locked(name, &slot).await
    }

    pub fn status(&self, name: &str) -> Result<ProjectStatus> {
        Ok(self.known_slot(name)?.status(name))
    }

    /// Every known project, sorted by name.
    pub fn list_projects(&self) -> Vec<ProjectStatus> {
        let mut names = self.inner.catalog.project_names();
        names.extend(self.slots().keys().cloned());
        names.sort();
        names.dedup();
        names
            .into_iter()
            .map(|name| {
                let slot = self.slot(&name);
                slot.status(&name)
            })
            .collect()
    }

    /// The project's worker if the project is running and its channel open.
    pub fn running_worker(&self, name: &str) -> Option<Arc<WorkerHandle>> {
        let slot = self.slots().get(name).cloned()?;
        let state = slot.read();
        match (&state.state, &state.worker) {
            (ProjectState::Running, Some(worker)) if !worker.channel().is_closed() => {
                Some(worker.clone())
            }
            _ => None,
        }
    }

    pub fn running_workers(&self) -> Vec<(String, Arc<WorkerHandle>)> {
        let names: Vec<String> = self.slots().keys().cloned().collect();
        names
            .into_iter()
            .filter_map(|name| self.running_worker(&name).map(|w| (name, w)))
            .collect()
    }

    /// Stop the project if running and delete it from disk.
    pub async fn remove_project(&self, name: &str) -> Result<()> {
        let slot = self.known_slot(name)?;
        let _lifecycle = slot
            .lifecycle
            .try_lock()
            .map_err(|_| SupervisorError::LifecycleBusy(name.to_string()))?;
        self.stop_locked(name, &slot).await;
        self.inner.catalog.remove_project(name).await?;
        self.slots().remove(name);
        info!(project = %name, "Project removed");
        Ok(())
    }

    /// Start every project in the catalog. Failures are logged.
    pub async fn start_all(&self) {
        for name in self.inner.catalog.project_names() {
            if let Err(e) = self.start_project(&name).await {
                error!(project = %name, error = %e, "Failed to start project");
            }
        }
    }

    /// Stop every worker and disable automatic restarts.
    pub async fn shutdown_all(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let slots: Vec<(String, Arc<ProjectSlot>)> = self
            .slots()
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect();

        let stops = slots.into_iter().map(|(name, slot)| async move {
            let _lifecycle = slot.lifecycle.lock().await;
            let outcome = self.stop_locked(&name, &slot).await;
            debug!(project = %name, ?outcome, "Project stopped for shutdown");
        });
        futures::future::join_all(stops).await;
        info!("All workers stopped");
    }

    /// Mark the worker of `generation` crashed, reap it, and restart the
    /// project if the policy allows. Ignored if that worker is already gone.
    pub async fn declare_crashed(&self, name: &str, generation: u64, reason: &str) {
        let Some(slot) = self.slots().get(name).cloned() else {
            return;
        };
        let _lifecycle = slot.lifecycle.lock().await;

        let worker = {
            let mut state = slot.write();
            let current = state
                .worker
                .as_ref()
                .is_some_and(|w| w.generation() == generation);
            if !current || state.state != ProjectState::Running {
                return;
            }
            state.state = ProjectState::Crashed;
            state.last_error = Some(reason.to_string());
            state.worker.take()
        };
        if let Some(worker) = worker {
            warn!(project = %name, generation, pid = ?worker.pid(), reason, "Worker crashed");
            worker.terminate().await;
        }

        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let permitted = {
            let mut state = slot.write();
            let permitted = self
                .inner
                .config
                .restart
                .permit(&mut state.restart_history, Instant::now());
            if permitted {
                state.restarts += 1;
            }
            permitted
        };

        if !permitted {
            warn!(project = %name, "Restart budget exhausted, leaving project crashed");
            return;
        }

        info!(project = %name, "Restarting crashed project");
        if let Err(e) = self.start_locked(name, &slot).await {
            error!(project = %name, error = %e, "Automatic restart failed");
        }
    }

    /// Take the worker of `generation` out of service at once and start a
    /// fresh one loaded from the catalog.
    ///
    /// The restart runs in the background since callers may hold the
    /// project's deploy lock, which the initial load needs. It does not count
    /// against the restart budget.
    pub fn recycle_worker(&self, name: &str, generation: u64, reason: &str) {
        let Some(slot) = self.slots().get(name).cloned() else {
            return;
        };
        let worker = {
            let mut state = slot.write();
            let current = state
                .worker
                .as_ref()
                .is_some_and(|w| w.generation() == generation);
            if !current || state.state != ProjectState::Running {
                return;
            }
            state.state = ProjectState::Starting;
            state.last_error = Some(reason.to_string());
            state.worker.take()
        };
        warn!(project = %name, generation, reason, "Replacing worker");

        let supervisor = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            if let Some(worker) = worker {
                worker.terminate().await;
            }
            let _lifecycle = slot.lifecycle.lock().await;

            // A start or stop that ran in between wins.
            let pending = {
                let state = slot.read();
                state.state == ProjectState::Starting && state.worker.is_none()
            };
            if !pending {
                return;
            }
            if supervisor.inner.shutting_down.load(Ordering::SeqCst) {
                slot.write().state = ProjectState::Stopped;
                return;
            }
            if let Err(e) = supervisor.start_locked(&name, &slot).await {
                error!(project = %name, error = %e, "Worker replacement failed");
            }
        });
    }

    async fn start_locked(&self, name: &str, slot: &Arc<ProjectSlot>) -> Result<ProjectStatus> {
        {
            let mut state = slot.write();
            if state.state == ProjectState::Running {
                return Err(SupervisorError::AlreadyRunning(name.to_string()));
            }
            state.state = ProjectState::Starting;
            state.last_error = None;
        }

        let catalog = &self.inner.catalog;
        let spec = LaunchSpec {
            project: name.to_string(),
            project_dir: catalog.layout().project_dir(name),
            concurrency: self.inner.config.worker_concurrency,
            env: catalog.layout().project_env(name),
        };

        info!(project = %name, launcher = self.inner.launcher.launcher_type(), "Starting worker");
        let launched = match self.inner.launcher.launch(&spec).await {
            Ok(launched) => launched,
            Err(e) => {
                slot.fail(ProjectState::Crashed, e.to_string());
                return Err(SupervisorError::LaunchFailed {
                    project: name.to_string(),
                    source: e,
                });
            }
        };
        let mut process = launched.process;

        let channel = match WorkerChannel::establish(
            launched.reader,
            launched.writer,
            self.inner.config.startup_timeout,
        )
        .await
        {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(kill) = process.kill().await {
                    warn!(project = %name, error = %kill, "Failed to kill unready worker");
                }
                let reason = e.to_string();
                slot.fail(ProjectState::Crashed, reason.clone());
                return Err(SupervisorError::StartupTimeout {
                    project: name.to_string(),
                    reason,
                });
            }
        };

        let handle = Arc::new(WorkerHandle {
            generation: self.inner.next_generation.fetch_add(1, Ordering::SeqCst),
            pid: process.pid(),
            started_at: Utc::now(),
            channel,
            served_version: AtomicU64::new(0),
            last_heartbeat: Mutex::new(None),
            missed_heartbeats: AtomicU32::new(0),
            process: tokio::sync::Mutex::new(process),
        });

        // Deploys are excluded until the worker is published, so none can
        // slip between the initial load and the Running transition.
        let deploy_lock = catalog.deploy_lock(name);
        let deploy_guard = deploy_lock.lock().await;

        let version = catalog.current_version(name).unwrap_or(0);
        let functions = catalog.dispatch_entries(name, TableChange::None);
        let function_count = functions.len();
        let loaded = handle
            .channel()
            .control(
                ControlKind::Reload,
                version,
                functions,
                self.inner.config.notify_timeout,
            )
            .await;

        let failure = match loaded {
            Ok(ack) => match ack.result {
                AckResult::Ok => None,
                AckResult::Error { message } => Some(message),
            },
            Err(e) => Some(e.to_string()),
        };
        if let Some(message) = failure {
            handle.terminate().await;
            slot.fail(ProjectState::Crashed, message.clone());
            return Err(SupervisorError::LoadFailed {
                project: name.to_string(),
                message,
            });
        }
        handle.set_served_version(version);

        {
            let mut state = slot.write();
            state.state = ProjectState::Running;
            state.worker = Some(handle.clone());
        }
        drop(deploy_guard);

        self.watch_for_crash(name.to_string(), handle.clone());

        info!(
            project = %name,
            generation = handle.generation(),
            pid = ?handle.pid(),
            version,
            functions = function_count,
            "Project running"
        );
        Ok(slot.status(name))
    }

    async fn stop_locked(&self, name: &str, slot: &Arc<ProjectSlot>) -> StopOutcome {
        let worker = {
            let mut state = slot.write();
            let worker = state.worker.take();
            state.state = if worker.is_some() {
                ProjectState::Stopping
            } else {
                ProjectState::Stopped
            };
            if worker.is_none() {
                state.last_stop = Some(StopOutcome::NotRunning);
            }
            worker
        };
        let Some(worker) = worker else {
            debug!(project = %name, "Stop requested with no worker running");
            return StopOutcome::NotRunning;
        };

        let grace = self.inner.config.graceful_shutdown_timeout;
        info!(project = %name, generation = worker.generation(), grace_ms = grace.as_millis() as u64, "Stopping worker");

        let drained = tokio::time::timeout(grace, async {
            let ack = worker
                .channel()
                .control(ControlKind::Shutdown, worker.served_version(), Vec::new(), grace)
                .await
                .ok()?;
            if !matches!(ack.result, AckResult::Ok) {
                return None;
            }
            worker.process.lock().await.wait().await.ok()
        })
        .await
        .ok()
        .flatten();

        let outcome = match drained {
            Some(exit) => {
                debug!(project = %name, ?exit, "Worker exited after draining");
                worker.channel().close();
                StopOutcome::Graceful
            }
            None => {
                warn!(project = %name, "Graceful shutdown window elapsed, killing worker");
                worker.terminate().await;
                StopOutcome::Forced
            }
        };

        {
            let mut state = slot.write();
            state.state = ProjectState::Stopped;
            state.last_stop = Some(outcome);
        }
        info!(project = %name, ?outcome, "Project stopped");
        outcome
    }

    fn watch_for_crash(&self, name: String, worker: Arc<WorkerHandle>) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            worker.channel().closed().await;
            let generation = worker.generation();
            drop(worker);
            supervisor
                .declare_crashed(&name, generation, "worker channel closed")
                .await;
        });
    }

    /// The slot of a project the catalog knows (or that has a slot).
    fn known_slot(&self, name: &str) -> Result<Arc<ProjectSlot>> {
        if let Some(slot) = self.slots().get(name) {
            return Ok(slot.clone());
        }
        if self.inner.catalog.has_project(name) {
            Ok(self.slot(name))
        } else {
            Err(SupervisorError::ProjectNotFound(name.to_string()))
        }
    }

    fn slot(&self, name: &str) -> Arc<ProjectSlot> {
        self.slots()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ProjectSlot::new()))
            .clone()
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ProjectSlot>>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
