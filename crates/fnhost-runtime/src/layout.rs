// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! On-disk layout under `DATA_DIR`.
//!
//! ```text
//! {DATA_DIR}/requirements.txt                              system manifest
//! {DATA_DIR}/projects/{project}/.env                       worker environment
//! {DATA_DIR}/projects/{project}/VERSION                    last issued version
//! {DATA_DIR}/projects/{project}/functions/{fn}/CURRENT     active version
//! {DATA_DIR}/projects/{project}/functions/{fn}/v{N}/       artifact + manifest
//! {DATA_DIR}/envs/{project}/v{N}/                          provisioned environment
//! ```

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use fnhost_protocol::MANIFEST_FILE;
use tracing::warn;

const VERSION_FILE: &str = "VERSION";
const CURRENT_FILE: &str = "CURRENT";
const MAX_NAME_LEN: usize = 64;

/// `[A-Za-z0-9_-]{1,64}`; names become directory names.
pub fn validate_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Path helpers rooted at `DATA_DIR`.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn system_manifest(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.root.join("projects")
    }

    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.projects_dir().join(project)
    }

    pub fn project_env_file(&self, project: &str) -> PathBuf {
        self.project_dir(project).join(".env")
    }

    pub fn version_file(&self, project: &str) -> PathBuf {
        self.project_dir(project).join(VERSION_FILE)
    }

    pub fn functions_dir(&self, project: &str) -> PathBuf {
        self.project_dir(project).join("functions")
    }

    pub fn function_dir(&self, project: &str, function: &str) -> PathBuf {
        self.functions_dir(project).join(function)
    }

    pub fn current_file(&self, project: &str, function: &str) -> PathBuf {
        self.function_dir(project, function).join(CURRENT_FILE)
    }

    pub fn artifact_dir(&self, project: &str, function: &str, version: u64) -> PathBuf {
        self.function_dir(project, function)
            .join(format!("v{}", version))
    }

    pub fn project_envs_dir(&self, project: &str) -> PathBuf {
        self.root.join("envs").join(project)
    }

    pub fn env_dir(&self, project: &str, version: u64) -> PathBuf {
        self.project_envs_dir(project).join(format!("v{}", version))
    }

    /// Environment variables for the project's worker, from its `.env`.
    ///
    /// A missing file yields no variables; an unreadable one is logged and
    /// ignored.
    pub fn project_env(&self, project: &str) -> HashMap<String, String> {
        let path = self.project_env_file(project);
        if !path.exists() {
            return HashMap::new();
        }
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => iter
                .filter_map(|item| match item {
                    Ok(pair) => Some(pair),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping bad .env line");
                        None
                    }
                })
                .collect(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read project .env");
                HashMap::new()
            }
        }
    }
}

/// Parse `v{N}` directory names.
pub fn parse_version_dir(name: &str) -> Option<u64> {
    name.strip_prefix('v')?.parse().ok()
}

/// Read a file holding one decimal number. Missing file is `None`.
pub async fn read_number(path: &Path) -> io::Result<Option<u64>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write a number through a temp file and rename, so readers never see a
/// partial value.
pub async fn write_number(path: &Path, value: u64) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, value.to_string()).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Remove a directory tree; a missing one is fine.
pub async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
