// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for master integration tests.
//!
//! Workers run in-process over an in-memory pipe, so every test gets real
//! framing, handshakes and reloads without spawning binaries.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fnhost_protocol::FunctionEntry;
use fnhost_runtime::api::ApiState;
use fnhost_runtime::catalog::Catalog;
use fnhost_runtime::deploy::{DeployRequest, Deployment, HotDeployController};
use fnhost_runtime::dispatcher::Dispatcher;
use fnhost_runtime::launcher::InProcessLauncher;
use fnhost_runtime::layout::DataLayout;
use fnhost_runtime::provisioner::{
    DirectoryProvisioner, EnvironmentProvisioner, ProvisionError, ProvisionRequest,
    ProvisionedEnv,
};
use fnhost_runtime::supervisor::{RestartPolicy, Supervisor, SupervisorConfig};
use fnhost_runtime::tasks::TaskManager;
use fnhost_runtime::AdmissionController;
use fnhost_worker::{DefaultLoader, FunctionHandler, FunctionLoader, LoadError};
use serde_json::{Value, json};
use tempfile::TempDir;

/// Delays each call by `payload.sleep_ms` before running the real handler.
pub struct SlowHandler {
    inner: Arc<dyn FunctionHandler>,
}

#[async_trait]
impl FunctionHandler for SlowHandler {
    async fn call(&self, payload: Value) -> Result<Value, String> {
        if let Some(ms) = payload.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        self.inner.call(payload).await
    }
}

/// [`DefaultLoader`] with [`SlowHandler`] around every function.
///
/// Loading an artifact of version `slow_version` also takes `load_delay`.
#[derive(Default)]
pub struct SlowLoader {
    slow_version: AtomicU64,
    load_delay_ms: AtomicU64,
}

impl SlowLoader {
    pub fn delay_version(&self, version: u64, delay: Duration) {
        self.load_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self.slow_version.store(version, Ordering::SeqCst);
    }
}

#[async_trait]
impl FunctionLoader for SlowLoader {
    async fn load(&self, entry: &FunctionEntry) -> Result<Arc<dyn FunctionHandler>, LoadError> {
        let slow = format!("v{}", self.slow_version.load(Ordering::SeqCst));
        if entry.artifact_dir.file_name() == Some(std::ffi::OsStr::new(&slow)) {
            let ms = self.load_delay_ms.load(Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        let inner = DefaultLoader.load(entry).await?;
        Ok(Arc::new(SlowHandler { inner }))
    }
}

/// Directory provisioner that can be switched to fail.
#[derive(Default)]
pub struct SwitchProvisioner {
    pub fail: AtomicBool,
}

#[async_trait]
impl EnvironmentProvisioner for SwitchProvisioner {
    fn provisioner_type(&self) -> &'static str {
        "switch"
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionedEnv, ProvisionError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProvisionError::CommandFailed {
                status: "exit status: 1".to_string(),
                stderr: "no matching distribution".to_string(),
            });
        }
        DirectoryProvisioner.provision(request).await
    }
}

pub struct HostOptions {
    pub max_concurrent: usize,
    pub backlog: usize,
    pub grace: Duration,
    pub startup_timeout: Duration,
    pub restart: RestartPolicy,
    pub invoke_timeout: Duration,
    pub notify_timeout: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            backlog: 16,
            grace: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(5),
            restart: RestartPolicy::disabled(),
            invoke_timeout: Duration::from_secs(10),
            notify_timeout: Duration::from_secs(5),
        }
    }
}

/// A master wired to in-process workers over a temporary data directory.
pub struct TestHost {
    pub dir: TempDir,
    pub launcher: Arc<InProcessLauncher>,
    pub loader: Arc<SlowLoader>,
    pub provisioner: Arc<SwitchProvisioner>,
    pub supervisor: Supervisor,
    pub dispatcher: Arc<Dispatcher>,
    pub deployer: Arc<HotDeployController>,
    pub tasks: Arc<TaskManager>,
}

impl TestHost {
    pub async fn new() -> Self {
        Self::with(HostOptions::default()).await
    }

    pub async fn with(options: HostOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::open(dir, options).await
    }

    /// Build a host over an existing data directory, rehydrating it.
    pub async fn open(dir: TempDir, options: HostOptions) -> Self {
        let catalog = Arc::new(Catalog::new(DataLayout::new(dir.path())));
        catalog.rehydrate().await.unwrap();

        let loader = Arc::new(SlowLoader::default());
        let launcher = Arc::new(InProcessLauncher::new(loader.clone()));
        let provisioner = Arc::new(SwitchProvisioner::default());
        let supervisor = Supervisor::new(
            SupervisorConfig {
                startup_timeout: options.startup_timeout,
                graceful_shutdown_timeout: options.grace,
                notify_timeout: options.notify_timeout,
                worker_concurrency: 16,
                restart: options.restart,
            },
            launcher.clone(),
            catalog,
        );
        let admission = Arc::new(AdmissionController::new(
            options.max_concurrent,
            options.backlog,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            supervisor.clone(),
            admission,
            options.invoke_timeout,
        ));
        let deployer = Arc::new(HotDeployController::new(
            supervisor.clone(),
            provisioner.clone(),
            options.notify_timeout,
        ));
        let tasks = Arc::new(TaskManager::new(dispatcher.clone()));

        Self {
            dir,
            launcher,
            loader,
            provisioner,
            supervisor,
            dispatcher,
            deployer,
            tasks,
        }
    }

    pub fn state(&self) -> ApiState {
        ApiState {
            supervisor: self.supervisor.clone(),
            dispatcher: self.dispatcher.clone(),
            deployer: self.deployer.clone(),
            tasks: self.tasks.clone(),
        }
    }

    pub async fn deploy_template(&self, project: &str, function: &str, body: Value) -> Deployment {
        self.deployer
            .deploy(project, template_request(function, body))
            .await
            .unwrap()
    }

    /// Deploy `function` and start the project's worker.
    pub async fn running(&self, project: &str, function: &str, body: Value) {
        self.deploy_template(project, function, body).await;
        self.supervisor.start_project(project).await.unwrap();
    }

    pub fn set_provision_failure(&self, fail: bool) {
        self.provisioner.fail.store(fail, Ordering::SeqCst);
    }
}

pub fn template_request(function: &str, body: Value) -> DeployRequest {
    serde_json::from_value(json!({
        "function": function,
        "artifact": {"code": {"runtime": "template", "body": body}},
    }))
    .unwrap()
}

/// Poll `condition` every few milliseconds for up to five seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
