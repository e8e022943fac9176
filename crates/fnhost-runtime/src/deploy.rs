// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hot deploy.
//!
//! A deploy writes the artifacts under a fresh version directory, provisions
//! that version's environment, and, if the project is running, sends the
//! worker a reload carrying the full new function table. A project deploy
//! does the same for several functions at once, so they go live together. The catalog only
//! marks the version active after the worker acknowledged, so until then
//! every invocation is served by the previous table.
//!
//! Any failure marks the function `failed` and leaves the previously active
//! version (on disk, in the catalog and in the worker) untouched. When the
//! worker's answer to a reload is lost, or the catalog cannot record an
//! acknowledged reload, the worker may be serving a table the catalog does
//! not describe. It is then sent the catalog's table again under a fresh
//! version, and replaced if that reload is not acknowledged either.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fnhost_protocol::{
    ARTIFACT_FILE, AckResult, ArtifactError, ControlKind, EXEC_ENTRY_FILE, FunctionArtifact,
    FunctionCode, FunctionEntry, MANIFEST_FILE,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::catalog::{ActivatedVersion, FunctionStatus, TableChange};
use crate::layout::validate_name;
use crate::provisioner::{self, EnvironmentProvisioner, ProvisionError, ProvisionRequest};
use crate::supervisor::{Supervisor, WorkerHandle};

/// Deploy-path errors.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("invalid name {0:?}: expected [A-Za-z0-9_-]{{1,64}}")]
    InvalidName(String),

    #[error("invalid artifact: {0}")]
    InvalidArtifact(#[from] ArtifactError),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("worker failed to load new version: {0}")]
    LoadFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("function {function} not found in project {project}")]
    FunctionNotFound { project: String, function: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Body of a deploy call.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployRequest {
    pub function: String,
    pub artifact: FunctionArtifact,
    /// Requirements, one per line
    #[serde(default)]
    pub manifest: String,
}

/// One function of a project deploy.
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionUpload {
    pub function: String,
    pub artifact: FunctionArtifact,
}

/// Body of a project deploy: every function shares one manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectDeployRequest {
    pub functions: Vec<FunctionUpload>,
    #[serde(default)]
    pub manifest: String,
}

/// Result of a successful deploy.
#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    pub project: String,
    pub function: String,
    pub version: u64,
    pub status: FunctionStatus,
    pub deployed_at: Option<DateTime<Utc>>,
    /// Whether a running worker already serves the version
    pub live: bool,
}

/// Result of a successful project deploy.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectDeployment {
    pub project: String,
    pub version: u64,
    pub live: bool,
    pub functions: Vec<Deployment>,
}

/// Deploys and removes functions.
pub struct HotDeployController {
    supervisor: Supervisor,
    provisioner: Arc<dyn EnvironmentProvisioner>,
    notify_timeout: Duration,
}

impl HotDeployController {
    pub fn new(
        supervisor: Supervisor,
        provisioner: Arc<dyn EnvironmentProvisioner>,
        notify_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            provisioner,
            notify_timeout,
        }
    }

    pub async fn deploy(
        &self,
        project: &str,
        request: DeployRequest,
    ) -> Result<Deployment, DeployError> {
        let DeployRequest {
            function,
            artifact,
            manifest,
        } = request;
        let batch = ProjectDeployRequest {
            functions: vec![FunctionUpload { function, artifact }],
            manifest,
        };
        self.deploy_project(project, batch)
            .await?
            .functions
            .pop()
            .ok_or_else(|| DeployError::InvalidRequest("no function deployed".to_string()))
    }

    /// Deploy several functions of one project under a single version,
    /// environment and reload.
    pub async fn deploy_project(
        &self,
        project: &str,
        request: ProjectDeployRequest,
    ) -> Result<ProjectDeployment, DeployError> {
        if !validate_name(project) {
            return Err(DeployError::InvalidName(project.to_string()));
        }
        if request.functions.is_empty() {
            return Err(DeployError::InvalidRequest(
                "at least one function is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for upload in &request.functions {
            if !validate_name(&upload.function) {
                return Err(DeployError::InvalidName(upload.function.clone()));
            }
            if !seen.insert(upload.function.as_str()) {
                return Err(DeployError::InvalidRequest(format!(
                    "function {} listed twice",
                    upload.function
                )));
            }
            upload.artifact.validate()?;
        }
        provisioner::parse_requirements(&request.manifest)
            .map_err(|e| DeployError::InvalidManifest(e.to_string()))?;

        let catalog = self.supervisor.catalog();
        catalog.ensure_project(project).await?;

        let lock = catalog.deploy_lock(project);
        let _guard = lock.lock().await;

        let version = catalog.reserve_version(project).await?;
        for upload in &request.functions {
            catalog.mark_deploying(project, &upload.function);
            info!(
                project,
                function = %upload.function,
                version,
                runtime = upload.artifact.runtime(),
                provisioner = self.provisioner.provisioner_type(),
                "Deploying function"
            );
        }

        let mut deployed = Vec::with_capacity(request.functions.len());
        match self.activate(project, &request, version, &mut deployed).await {
            Ok(live) => {
                for deployment in &deployed {
                    info!(project, function = %deployment.function, version, live, "Function deployed");
                }
                Ok(ProjectDeployment {
                    project: project.to_string(),
                    version,
                    live,
                    functions: deployed,
                })
            }
            Err(e) => {
                for upload in &request.functions {
                    if deployed.iter().any(|d| d.function == upload.function) {
                        continue;
                    }
                    warn!(project, function = %upload.function, version, error = %e, "Deploy failed, previous version kept");
                    catalog.mark_failed(project, &upload.function, e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Remove a function from the project's worker and mark it undeployed.
    pub async fn delete(&self, project: &str, function: &str) -> Result<(), DeployError> {
        let catalog = self.supervisor.catalog();
        let not_found = || DeployError::FunctionNotFound {
            project: project.to_string(),
            function: function.to_string(),
        };
        catalog
            .function(project, function)
            .filter(|r| r.status != FunctionStatus::Undeployed)
            .ok_or_else(not_found)?;

        let lock = catalog.deploy_lock(project);
        let _guard = lock.lock().await;

        let mut worker = None;
        if self.supervisor.running_worker(project).is_some() {
            let version = catalog.reserve_version(project).await?;
            worker = self
                .push_table(project, version, TableChange::Remove(function.to_string()))
                .await?;
        }
        if let Err(e) = catalog.mark_undeployed(project, function).await {
            if let Some(worker) = worker {
                self.restore(project, &worker, "undeploy could not be recorded")
                    .await;
            }
            return Err(e.into());
        }
        info!(project, function, "Function undeployed");
        Ok(())
    }

    /// Write, provision and load every function of `request`, then record
    /// each as active, pushing it onto `deployed`. Returns whether a running
    /// worker took the new table.
    async fn activate(
        &self,
        project: &str,
        request: &ProjectDeployRequest,
        version: u64,
        deployed: &mut Vec<Deployment>,
    ) -> Result<bool, DeployError> {
        let catalog = self.supervisor.catalog();
        let layout = catalog.layout();

        for upload in &request.functions {
            let artifact_dir = layout.artifact_dir(project, &upload.function, version);
            write_version(&artifact_dir, &upload.artifact, &request.manifest).await?;
        }

        let system_manifest = match tokio::fs::read_to_string(layout.system_manifest()).await {
            Ok(contents) => Some(contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let env = self
            .provisioner
            .provision(&ProvisionRequest {
                project: project.to_string(),
                version,
                manifest: request.manifest.clone(),
                system_manifest,
                env_dir: layout.env_dir(project, version),
            })
            .await
            .map_err(|e| match e {
                ProvisionError::InvalidManifest { .. } => DeployError::InvalidManifest(e.to_string()),
                other => DeployError::ProvisionFailed(other.to_string()),
            })?;

        let entries = request
            .functions
            .iter()
            .map(|upload| FunctionEntry {
                name: upload.function.clone(),
                artifact_dir: layout.artifact_dir(project, &upload.function, version),
                env_dir: Some(env.env_dir.clone()),
            })
            .collect();
        let worker = self
            .push_table(project, version, TableChange::Upsert(entries))
            .await?;
        let live = worker.is_some();

        for upload in &request.functions {
            let activated = ActivatedVersion {
                version,
                artifact_dir: layout.artifact_dir(project, &upload.function, version),
                env_dir: env.env_dir.clone(),
                description: upload.artifact.description.clone(),
            };
            let record = match catalog.mark_active(project, &upload.function, activated).await {
                Ok(record) => record,
                Err(e) => {
                    if let Some(worker) = &worker {
                        self.restore(project, worker, "activation could not be recorded")
                            .await;
                    }
                    return Err(e.into());
                }
            };
            deployed.push(Deployment {
                project: project.to_string(),
                function: upload.function.clone(),
                version,
                status: record.status,
                deployed_at: record.deployed_at,
                live,
            });
        }
        Ok(live)
    }

    /// Reload the running worker with the active table plus `change`.
    /// Returns the worker that acknowledged, or `None` when none is running.
    async fn push_table(
        &self,
        project: &str,
        version: u64,
        change: TableChange,
    ) -> Result<Option<Arc<WorkerHandle>>, DeployError> {
        let Some(worker) = self.supervisor.running_worker(project) else {
            return Ok(None);
        };

        let functions = self.supervisor.catalog().dispatch_entries(project, change);
        let ack = match worker
            .channel()
            .control(ControlKind::Reload, version, functions, self.notify_timeout)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                // The worker may still apply the reload after we stop waiting.
                self.restore(project, &worker, "reload was not acknowledged")
                    .await;
                return Err(DeployError::LoadFailed(e.to_string()));
            }
        };

        match ack.result {
            AckResult::Ok => {
                worker.set_served_version(version);
                Ok(Some(worker))
            }
            // A worker that rejects a table keeps the one it had.
            AckResult::Error { message } => Err(DeployError::LoadFailed(message)),
        }
    }

    /// Bring `worker` back to the catalog's active table.
    ///
    /// Reloads apply in order on the worker, so this one lands after any
    /// reload still in flight. A worker that does not acknowledge it is
    /// replaced.
    async fn restore(&self, project: &str, worker: &WorkerHandle, reason: &str) {
        let catalog = self.supervisor.catalog();
        let outcome = match catalog.reserve_version(project).await {
            Ok(version) => {
                let functions = catalog.dispatch_entries(project, TableChange::None);
                worker
                    .channel()
                    .control(ControlKind::Reload, version, functions, self.notify_timeout)
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|ack| match ack.result {
                        AckResult::Ok => Ok(version),
                        AckResult::Error { message } => Err(message),
                    })
            }
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(version) => {
                worker.set_served_version(version);
                warn!(project, version, reason, "Worker restored to the active table");
            }
            Err(e) => {
                warn!(project, reason, error = %e, "Worker could not be restored, replacing it");
                self.supervisor
                    .recycle_worker(project, worker.generation(), reason);
            }
        }
    }
}

/// Write `artifact.json`, the manifest, and for exec functions the
/// executable entry point.
async fn write_version(dir: &Path, artifact: &FunctionArtifact, manifest: &str) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let encoded = serde_json::to_vec_pretty(artifact)?;
    tokio::fs::write(dir.join(ARTIFACT_FILE), encoded).await?;
    tokio::fs::write(dir.join(MANIFEST_FILE), manifest).await?;

    if let FunctionCode::Exec { source, .. } = &artifact.code {
        let entry = dir.join(EXEC_ENTRY_FILE);
        tokio::fs::write(&entry, source).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&entry, std::fs::Permissions::from_mode(0o755)).await?;
        }
    }
    Ok(())
}
