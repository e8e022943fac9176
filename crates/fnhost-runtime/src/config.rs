// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the fnhost master.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Master configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address (`HOST` + `PORT`)
    pub bind_addr: SocketAddr,
    /// Root of the on-disk project/function layout
    pub data_dir: PathBuf,
    /// Admission ceiling: invocations in flight across all projects
    pub max_concurrent: usize,
    /// Admission backlog: callers allowed to wait for a slot
    pub backlog: usize,
    /// Worker readiness handshake and heartbeat ping deadline
    pub timeout_keep_alive: Duration,
    /// Window a stopping worker gets to drain before it is killed
    pub timeout_graceful_shutdown: Duration,
    /// Wait for a control ack (reload) and for provisioning commands
    pub timeout_notify: Duration,
    /// Health-check period; also the finished-task sweep period
    pub cleanup_interval: Duration,
    /// Invocation deadline used when the caller gives none
    pub invoke_timeout: Duration,
    /// Invocations a single worker executes at once
    pub worker_concurrency: usize,
    /// Consecutive missed heartbeats before a worker is declared crashed
    pub heartbeat_max_missed: u32,
    /// Automatic restarts allowed per `restart_window` (0 disables)
    pub restart_max: u32,
    pub restart_window: Duration,
    /// Age after which finished async tasks are dropped
    pub task_retention: Duration,
    /// Worker executable
    pub worker_bin: PathBuf,
    /// Dependency install command with `{manifest}` / `{env_dir}` placeholders
    pub provision_command: Option<String>,
    /// Start every project found on disk at boot
    pub auto_start: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            data_dir: PathBuf::from(".data"),
            max_concurrent: 10,
            backlog: 2048,
            timeout_keep_alive: Duration::from_secs(5),
            timeout_graceful_shutdown: Duration::from_secs(10),
            timeout_notify: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(300),
            invoke_timeout: Duration::from_secs(30),
            worker_concurrency: 10,
            heartbeat_max_missed: 3,
            restart_max: 3,
            restart_window: Duration::from_secs(60),
            task_retention: Duration::from_secs(7 * 24 * 3600),
            worker_bin: default_worker_bin(),
            provision_command: None,
            auto_start: true,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unset variables take their defaults; set but unparsable ones fail.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host: IpAddr = match std::env::var("HOST") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Invalid("HOST", format!("not an IP address: {}", raw)))?,
            Err(_) => defaults.bind_addr.ip(),
        };
        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let data_dir =
            PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| ".data".to_string()));

        let max_concurrent = parse_var("MAX_CONCURRENT", defaults.max_concurrent)?;
        if max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "MAX_CONCURRENT",
                "must be at least 1".to_string(),
            ));
        }
        let worker_concurrency = parse_var("WORKER_CONCURRENCY", defaults.worker_concurrency)?;
        if worker_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "WORKER_CONCURRENCY",
                "must be at least 1".to_string(),
            ));
        }

        let worker_bin = std::env::var("WORKER_BIN")
            .map(PathBuf::from)
            .unwrap_or(defaults.worker_bin);

        let provision_command = std::env::var("PROVISION_COMMAND")
            .ok()
            .filter(|c| !c.trim().is_empty());

        let auto_start = std::env::var("AUTO_START")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(defaults.auto_start);

        Ok(Self {
            bind_addr: SocketAddr::new(host, port),
            data_dir,
            max_concurrent,
            backlog: parse_var("BACKLOG", defaults.backlog)?,
            timeout_keep_alive: secs_var("TIMEOUT_KEEP_ALIVE", defaults.timeout_keep_alive)?,
            timeout_graceful_shutdown: secs_var(
                "TIMEOUT_GRACEFUL_SHUTDOWN",
                defaults.timeout_graceful_shutdown,
            )?,
            timeout_notify: secs_var("TIMEOUT_NOTIFY", defaults.timeout_notify)?,
            cleanup_interval: secs_var("CLEANUP_INTERVAL", defaults.cleanup_interval)?,
            invoke_timeout: secs_var("INVOKE_TIMEOUT", defaults.invoke_timeout)?,
            worker_concurrency,
            heartbeat_max_missed: parse_var("HEARTBEAT_MAX_MISSED", defaults.heartbeat_max_missed)?
                .max(1),
            restart_max: parse_var("RESTART_MAX", defaults.restart_max)?,
            restart_window: secs_var("RESTART_WINDOW", defaults.restart_window)?,
            task_retention: secs_var("TASK_RETENTION", defaults.task_retention)?,
            worker_bin,
            provision_command,
            auto_start,
        })
    }
}

/// `fnhost-worker` next to the running executable, else looked up on `PATH`.
fn default_worker_bin() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("fnhost-worker")))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from("fnhost-worker"))
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

/// Whole or fractional seconds.
fn secs_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let secs: f64 = raw
                .trim()
                .parse()
                .map_err(|e: std::num::ParseFloatError| ConfigError::Invalid(name, e.to_string()))?;
            Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Invalid(name, e.to_string()))
        }
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// An environment variable has an unusable value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
