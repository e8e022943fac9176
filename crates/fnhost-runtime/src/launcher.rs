// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker launchers.
//!
//! A launcher starts one worker for a project and hands back the two pipe
//! ends plus a process handle. Launchers are pure process plumbing: they do
//! not speak the protocol, the supervisor does.
//!
//! | Launcher | Worker |
//! |----------|--------|
//! | [`ProcessLauncher`] | `fnhost-worker` child process over stdin/stdout |
//! | [`InProcessLauncher`] | worker serve loop on a tokio task over an in-memory pipe |

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fnhost_worker::{FunctionLoader, WorkerConfig, WorkerRuntime};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

/// Errors from launcher operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LaunchError {
    /// Worker executable was not found.
    #[error("Worker binary not found: {0}")]
    BinaryNotFound(PathBuf),

    /// The process could not be spawned.
    #[error("Failed to spawn worker: {0}")]
    Spawn(std::io::Error),

    /// A stdio pipe was not captured.
    #[error("Worker {0} pipe unavailable")]
    MissingPipe(&'static str),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub project: String,
    /// Working directory for the worker
    pub project_dir: PathBuf,
    /// Invocations the worker executes at once
    pub concurrency: usize,
    /// Extra environment (the project's `.env`), applied last
    pub env: HashMap<String, String>,
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub success: bool,
    pub code: Option<i32>,
}

/// Handle to a running worker, owned by the supervisor.
#[async_trait]
pub trait WorkerProcess: Send + Sync {
    /// OS process id, if the worker is a real process.
    fn pid(&self) -> Option<u32>;

    /// Wait for the worker to exit on its own.
    async fn wait(&mut self) -> Result<WorkerExit, LaunchError>;

    /// Terminate the worker and reap it.
    async fn kill(&mut self) -> Result<WorkerExit, LaunchError>;
}

/// A freshly launched worker: pipe ends seen from the master plus its handle.
pub struct LaunchedWorker {
    /// Worker → master
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Master → worker
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub process: Box<dyn WorkerProcess>,
}

/// Starts workers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Launcher type identifier (e.g., "process", "in_process")
    fn launcher_type(&self) -> &'static str;

    /// Start a worker for `spec.project`.
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorker, LaunchError>;
}

// ============================================================================
// Child process launcher
// ============================================================================

/// Launches the `fnhost-worker` binary with the channel on stdin/stdout.
/// Worker logs go to the master's stderr.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    worker_bin: PathBuf,
    /// Time between SIGTERM and SIGKILL on kill
    term_grace: Duration,
}

impl ProcessLauncher {
    pub fn new(worker_bin: impl Into<PathBuf>) -> Self {
        Self {
            worker_bin: worker_bin.into(),
            term_grace: Duration::from_secs(1),
        }
    }

    pub fn with_term_grace(mut self, grace: Duration) -> Self {
        self.term_grace = grace;
        self
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    fn launcher_type(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorker, LaunchError> {
        let mut cmd = Command::new(&self.worker_bin);
        cmd.env("FNHOST_PROJECT", &spec.project)
            .env("FNHOST_WORKER_CONCURRENCY", spec.concurrency.to_string())
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if spec.project_dir.is_dir() {
            cmd.current_dir(&spec.project_dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LaunchError::BinaryNotFound(self.worker_bin.clone())
            } else {
                LaunchError::Spawn(e)
            }
        })?;

        let writer = child.stdin.take().ok_or(LaunchError::MissingPipe("stdin"))?;
        let reader = child
            .stdout
            .take()
            .ok_or(LaunchError::MissingPipe("stdout"))?;

        info!(
            project = %spec.project,
            pid = ?child.id(),
            worker_bin = %self.worker_bin.display(),
            "Worker process spawned"
        );

        Ok(LaunchedWorker {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: Box::new(ChildProcess {
                child,
                term_grace: self.term_grace,
            }),
        })
    }
}

struct ChildProcess {
    child: Child,
    term_grace: Duration,
}

fn exit_of(status: std::process::ExitStatus) -> WorkerExit {
    WorkerExit {
        success: status.success(),
        code: status.code(),
    }
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<WorkerExit, LaunchError> {
        Ok(exit_of(self.child.wait().await?))
    }

    async fn kill(&mut self) -> Result<WorkerExit, LaunchError> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(exit_of(status));
        }

        if let Some(pid) = self.child.id() {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => debug!(pid, "Sent SIGTERM to worker"),
                Err(e) => warn!(pid, error = %e, "Failed to send SIGTERM to worker"),
            }
            if let Ok(status) = tokio::time::timeout(self.term_grace, self.child.wait()).await {
                return Ok(exit_of(status?));
            }
            warn!(pid, "Worker ignored SIGTERM, sending SIGKILL");
        }

        self.child.kill().await?;
        Ok(exit_of(self.child.wait().await?))
    }
}

// ============================================================================
// In-process launcher
// ============================================================================

/// Runs the worker serve loop on a tokio task inside the master.
///
/// Used by tests and by embedders that do not need process isolation.
/// [`InProcessLauncher::crash`] aborts a worker to simulate a crash.
pub struct InProcessLauncher {
    loader: Arc<dyn FunctionLoader>,
    pipe_capacity: usize,
    running: Mutex<HashMap<String, AbortHandle>>,
}

impl InProcessLauncher {
    pub fn new(loader: Arc<dyn FunctionLoader>) -> Self {
        Self {
            loader,
            pipe_capacity: 1024 * 1024,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Abort the project's worker task. Returns false if none is running.
    pub fn crash(&self, project: &str) -> bool {
        match self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(project)
        {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    fn launcher_type(&self) -> &'static str {
        "in_process"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorker, LaunchError> {
        let (master, worker) = tokio::io::duplex(self.pipe_capacity);
        let (worker_read, worker_write) = tokio::io::split(worker);
        let (reader, writer) = tokio::io::split(master);

        let config = WorkerConfig {
            concurrency: spec.concurrency.max(1),
            ..WorkerConfig::for_project(spec.project.clone())
        };
        let runtime = Arc::new(WorkerRuntime::new(config, self.loader.clone()));
        let task = tokio::spawn(async move { runtime.serve(worker_read, worker_write).await.is_ok() });

        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(spec.project.clone(), task.abort_handle());

        debug!(project = %spec.project, "In-process worker started");

        Ok(LaunchedWorker {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: Box::new(InProcessWorker { task }),
        })
    }
}

struct InProcessWorker {
    task: JoinHandle<bool>,
}

#[async_trait]
impl WorkerProcess for InProcessWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Result<WorkerExit, LaunchError> {
        let success = (&mut self.task).await.unwrap_or(false);
        Ok(WorkerExit {
            success,
            code: Some(if success { 0 } else { 1 }),
        })
    }

    async fn kill(&mut self) -> Result<WorkerExit, LaunchError> {
        self.task.abort();
        let _ = (&mut self.task).await;
        Ok(WorkerExit {
            success: false,
            code: None,
        })
    }
}
