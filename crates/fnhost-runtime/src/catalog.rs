// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Project and function catalog.
//!
//! In-memory records backed by the on-disk layout. Version counters and
//! `CURRENT` markers are written through to disk so the catalog can be
//! rebuilt at startup; everything else (invocation counters, last errors)
//! lives for the process lifetime only.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use fnhost_protocol::{FunctionEntry, MANIFEST_FILE};
use fnhost_worker::DefaultLoader;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::layout::{self, DataLayout, validate_name};

/// Deployment status of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionStatus {
    Undeployed,
    Deploying,
    Active,
    Failed,
}

/// A deployed (or once deployed) function.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionRecord {
    pub name: String,
    pub project: String,
    pub status: FunctionStatus,
    /// Version the worker serves for this function, if any. Survives a
    /// failed redeploy.
    pub active_version: Option<u64>,
    pub artifact_path: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
    pub env_dir: Option<PathBuf>,
    pub description: Option<String>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub invocations: u64,
    pub last_error: Option<String>,
}

impl FunctionRecord {
    fn new(project: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            project: project.to_string(),
            status: FunctionStatus::Undeployed,
            active_version: None,
            artifact_path: None,
            manifest_path: None,
            env_dir: None,
            description: None,
            deployed_at: None,
            invocations: 0,
            last_error: None,
        }
    }

    /// The dispatch table entry for the served version.
    pub fn dispatch_entry(&self) -> Option<FunctionEntry> {
        if self.status == FunctionStatus::Undeployed {
            return None;
        }
        Some(FunctionEntry {
            name: self.name.clone(),
            artifact_dir: self.artifact_path.clone()?,
            env_dir: self.env_dir.clone(),
        })
    }
}

/// A version that just became live.
#[derive(Debug, Clone)]
pub struct ActivatedVersion {
    pub version: u64,
    pub artifact_dir: PathBuf,
    pub env_dir: PathBuf,
    pub description: Option<String>,
}

/// A change to apply on top of the active table.
#[derive(Debug, Clone)]
pub enum TableChange {
    None,
    Upsert(Vec<FunctionEntry>),
    Remove(String),
}

#[derive(Debug, Default)]
struct ProjectEntry {
    version: u64,
    functions: BTreeMap<String, FunctionRecord>,
}

/// Registry of projects and their functions.
#[derive(Debug)]
pub struct Catalog {
    layout: DataLayout,
    projects: RwLock<BTreeMap<String, ProjectEntry>>,
    deploy_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Catalog {
    pub fn new(layout: DataLayout) -> Self {
        Self {
            layout,
            projects: RwLock::new(BTreeMap::new()),
            deploy_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Rebuild the catalog from disk. Returns the number of projects found.
    pub async fn rehydrate(&self) -> io::Result<usize> {
        let mut dirs = match tokio::fs::read_dir(self.layout.projects_dir()).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No projects directory, starting empty");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let mut found = BTreeMap::new();
        while let Some(dir) = dirs.next_entry().await? {
            let name = dir.file_name().to_string_lossy().to_string();
            if !dir.file_type().await?.is_dir() || !validate_name(&name) {
                continue;
            }
            match self.scan_project(&name).await {
                Ok(entry) => {
                    found.insert(name, entry);
                }
                Err(e) => warn!(project = %name, error = %e, "Skipping unreadable project"),
            }
        }

        let count = found.len();
        let active: usize = found
            .values()
            .map(|p| {
                p.functions
                    .values()
                    .filter(|f| f.status == FunctionStatus::Active)
                    .count()
            })
            .sum();
        *self.write() = found;

        info!(projects = count, active_functions = active, "Catalog rehydrated");
        Ok(count)
    }

    async fn scan_project(&self, project: &str) -> io::Result<ProjectEntry> {
        let mut entry = ProjectEntry {
            version: layout::read_number(&self.layout.version_file(project))
                .await?
                .unwrap_or(0),
            functions: BTreeMap::new(),
        };

        let mut dirs = match tokio::fs::read_dir(self.layout.functions_dir(project)).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(entry),
            Err(e) => return Err(e),
        };

        while let Some(dir) = dirs.next_entry().await? {
            let function = dir.file_name().to_string_lossy().to_string();
            if !dir.file_type().await?.is_dir() || !validate_name(&function) {
                continue;
            }

            // The counter must stay ahead of every version directory.
            let mut versions = tokio::fs::read_dir(dir.path()).await?;
            while let Some(v) = versions.next_entry().await? {
                if let Some(n) = layout::parse_version_dir(&v.file_name().to_string_lossy()) {
                    entry.version = entry.version.max(n);
                }
            }

            let mut record = FunctionRecord::new(project, &function);
            let current = self.layout.current_file(project, &function);
            if let Some(version) = layout::read_number(&current).await? {
                let artifact_dir = self.layout.artifact_dir(project, &function, version);
                match DefaultLoader::read_artifact(&artifact_dir).await {
                    Ok(artifact) => {
                        let deployed_at = tokio::fs::metadata(&current)
                            .await
                            .and_then(|m| m.modified())
                            .ok()
                            .map(DateTime::<Utc>::from);
                        record.status = FunctionStatus::Active;
                        record.active_version = Some(version);
                        record.manifest_path = Some(artifact_dir.join(MANIFEST_FILE));
                        record.artifact_path = Some(artifact_dir);
                        record.env_dir = Some(self.layout.env_dir(project, version));
                        record.description = artifact.description;
                        record.deployed_at = deployed_at;
                    }
                    Err(e) => {
                        warn!(project, function = %function, version, error = %e, "Active artifact unreadable");
                        record.status = FunctionStatus::Failed;
                        record.last_error = Some(e.to_string());
                    }
                }
            }
            entry.functions.insert(function, record);
        }

        Ok(entry)
    }

    /// Create the project directory and record if they do not exist.
    pub async fn ensure_project(&self, project: &str) -> io::Result<()> {
        tokio::fs::create_dir_all(self.layout.project_dir(project)).await?;
        self.write().entry(project.to_string()).or_default();
        Ok(())
    }

    pub fn has_project(&self, project: &str) -> bool {
        self.read().contains_key(project)
    }

    pub fn project_names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Serializes deploys, deletions and worker loads for one project.
    pub fn deploy_lock(&self, project: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.deploy_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(project.to_string())
            .or_default()
            .clone()
    }

    /// Issue the next deployment version and persist the counter.
    pub async fn reserve_version(&self, project: &str) -> io::Result<u64> {
        let version = {
            let mut projects = self.write();
            let entry = projects.entry(project.to_string()).or_default();
            entry.version += 1;
            entry.version
        };
        layout::write_number(&self.layout.version_file(project), version).await?;
        Ok(version)
    }

    /// Last issued version, 0 if none.
    pub fn current_version(&self, project: &str) -> Option<u64> {
        self.read().get(project).map(|p| p.version)
    }

    pub fn mark_deploying(&self, project: &str, function: &str) {
        self.update(project, function, |record| {
            record.status = FunctionStatus::Deploying;
            record.last_error = None;
        });
    }

    /// Make `activated` the served version and write the `CURRENT` marker.
    pub async fn mark_active(
        &self,
        project: &str,
        function: &str,
        activated: ActivatedVersion,
    ) -> io::Result<FunctionRecord> {
        layout::write_number(
            &self.layout.current_file(project, function),
            activated.version,
        )
        .await?;

        Ok(self.update(project, function, |record| {
            record.status = FunctionStatus::Active;
            record.active_version = Some(activated.version);
            record.manifest_path = Some(activated.artifact_dir.join(MANIFEST_FILE));
            record.artifact_path = Some(activated.artifact_dir);
            record.env_dir = Some(activated.env_dir);
            record.description = activated.description;
            record.deployed_at = Some(Utc::now());
            record.last_error = None;
        }))
    }

    /// Record a failed deploy. The previously active version is kept.
    pub fn mark_failed(&self, project: &str, function: &str, error: String) {
        self.update(project, function, |record| {
            record.status = FunctionStatus::Failed;
            record.last_error = Some(error);
        });
    }

    /// Take the function out of service and remove its `CURRENT` marker.
    pub async fn mark_undeployed(&self, project: &str, function: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.layout.current_file(project, function)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        self.update(project, function, |record| {
            record.status = FunctionStatus::Undeployed;
            record.active_version = None;
            record.artifact_path = None;
            record.manifest_path = None;
            record.env_dir = None;
        });
        Ok(())
    }

    /// The full function table for the project's worker, with `change`
    /// applied on top. Sorted by name.
    pub fn dispatch_entries(&self, project: &str, change: TableChange) -> Vec<FunctionEntry> {
        let mut entries: BTreeMap<String, FunctionEntry> = self
            .read()
            .get(project)
            .map(|p| {
                p.functions
                    .values()
                    .filter_map(|r| r.dispatch_entry().map(|e| (r.name.clone(), e)))
                    .collect()
            })
            .unwrap_or_default();

        match change {
            TableChange::None => {}
            TableChange::Upsert(upserts) => {
                for entry in upserts {
                    entries.insert(entry.name.clone(), entry);
                }
            }
            TableChange::Remove(name) => {
                entries.remove(&name);
            }
        }
        entries.into_values().collect()
    }

    pub fn functions(&self, project: &str) -> Option<Vec<FunctionRecord>> {
        self.read()
            .get(project)
            .map(|p| p.functions.values().cloned().collect())
    }

    pub fn function(&self, project: &str, function: &str) -> Option<FunctionRecord> {
        self.read()
            .get(project)
            .and_then(|p| p.functions.get(function).cloned())
    }

    pub fn record_invocation(&self, project: &str, function: &str) {
        if let Some(record) = self
            .write()
            .get_mut(project)
            .and_then(|p| p.functions.get_mut(function))
        {
            record.invocations += 1;
        }
    }

    /// Forget the project and delete its files and environments.
    pub async fn remove_project(&self, project: &str) -> io::Result<bool> {
        let existed = self.write().remove(project).is_some();
        self.deploy_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(project);
        layout::remove_dir_if_exists(&self.layout.project_dir(project)).await?;
        layout::remove_dir_if_exists(&self.layout.project_envs_dir(project)).await?;
        Ok(existed)
    }

    fn update<F>(&self, project: &str, function: &str, apply: F) -> FunctionRecord
    where
        F: FnOnce(&mut FunctionRecord),
    {
        let mut projects = self.write();
        let record = projects
            .entry(project.to_string())
            .or_default()
            .functions
            .entry(function.to_string())
            .or_insert_with(|| FunctionRecord::new(project, function));
        apply(record);
        record.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, ProjectEntry>> {
        self.projects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, ProjectEntry>> {
        self.projects.write().unwrap_or_else(PoisonError::into_inner)
    }
}
