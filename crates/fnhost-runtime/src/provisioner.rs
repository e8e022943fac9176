// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment provisioning for deployed function versions.
//!
//! Every version gets its own environment directory, so the version being
//! replaced keeps its environment until the worker has swapped.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use fnhost_protocol::MANIFEST_FILE;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Errors from environment provisioning.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A manifest line is not a valid requirement.
    #[error("invalid manifest line {line}: {text:?}")]
    InvalidManifest { line: usize, text: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The install command exited unsuccessfully.
    #[error("provision command failed ({status}): {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("provision command timed out after {0:?}")]
    Timeout(Duration),
}

/// What to provision.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub project: String,
    pub version: u64,
    /// Project manifest contents
    pub manifest: String,
    /// System-wide manifest contents, merged after the project's
    pub system_manifest: Option<String>,
    /// Directory to materialize
    pub env_dir: PathBuf,
}

/// A ready environment.
#[derive(Debug, Clone)]
pub struct ProvisionedEnv {
    pub env_dir: PathBuf,
    /// The merged manifest written inside `env_dir`
    pub manifest_path: PathBuf,
}

/// Materializes dependency environments.
#[async_trait]
pub trait EnvironmentProvisioner: Send + Sync {
    /// Provisioner type identifier (e.g., "directory", "command")
    fn provisioner_type(&self) -> &'static str;

    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionedEnv, ProvisionError>;
}

/// Requirement lines of a manifest, without blanks and comments.
///
/// A requirement may not contain whitespace.
pub fn parse_requirements(manifest: &str) -> Result<Vec<String>, ProvisionError> {
    let mut requirements = Vec::new();
    for (idx, raw) in manifest.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.chars().any(char::is_whitespace) {
            return Err(ProvisionError::InvalidManifest {
                line: idx + 1,
                text: line.to_string(),
            });
        }
        requirements.push(line.to_string());
    }
    Ok(requirements)
}

/// Package name of a requirement: the text before any version operator.
pub fn package_name(requirement: &str) -> String {
    let end = requirement
        .find(['=', '<', '>', '~', '!'])
        .unwrap_or(requirement.len());
    requirement[..end].to_ascii_lowercase()
}

/// Project requirements first, then system requirements for packages the
/// project does not name.
pub fn merge_manifests(project: &str, system: Option<&str>) -> Result<Vec<String>, ProvisionError> {
    let mut merged = parse_requirements(project)?;
    if let Some(system) = system {
        let named: Vec<String> = merged.iter().map(|r| package_name(r)).collect();
        for requirement in parse_requirements(system)? {
            if !named.contains(&package_name(&requirement)) {
                merged.push(requirement);
            }
        }
    }
    Ok(merged)
}

async fn prepare(request: &ProvisionRequest) -> Result<ProvisionedEnv, ProvisionError> {
    let merged = merge_manifests(&request.manifest, request.system_manifest.as_deref())?;
    tokio::fs::create_dir_all(&request.env_dir).await?;
    let manifest_path = request.env_dir.join(MANIFEST_FILE);
    let mut contents = merged.join("\n");
    if !contents.is_empty() {
        contents.push('\n');
    }
    tokio::fs::write(&manifest_path, contents).await?;
    Ok(ProvisionedEnv {
        env_dir: request.env_dir.clone(),
        manifest_path,
    })
}

/// Creates the environment directory and writes the merged manifest.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryProvisioner;

#[async_trait]
impl EnvironmentProvisioner for DirectoryProvisioner {
    fn provisioner_type(&self) -> &'static str {
        "directory"
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionedEnv, ProvisionError> {
        let env = prepare(request).await?;
        debug!(
            project = %request.project,
            version = request.version,
            env_dir = %env.env_dir.display(),
            "Environment directory prepared"
        );
        Ok(env)
    }
}

/// Runs an install command after preparing the directory.
///
/// The command is a `sh -c` template with `{manifest}` and `{env_dir}`
/// placeholders, e.g. `pip install -r {manifest} --target {env_dir}`.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    command: String,
    timeout: Duration,
}

impl CommandProvisioner {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    fn render(&self, env: &ProvisionedEnv) -> String {
        self.command
            .replace("{manifest}", &env.manifest_path.to_string_lossy())
            .replace("{env_dir}", &env.env_dir.to_string_lossy())
    }
}

#[async_trait]
impl EnvironmentProvisioner for CommandProvisioner {
    fn provisioner_type(&self) -> &'static str {
        "command"
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionedEnv, ProvisionError> {
        let env = prepare(request).await?;
        let command = self.render(&env);
        info!(project = %request.project, version = request.version, command = %command, "Provisioning environment");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&env.env_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProvisionError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(project = %request.project, version = request.version, status = %output.status, "Provisioning failed");
            return Err(ProvisionError::CommandFailed {
                status: output.status.to_string(),
                stderr,
            });
        }

        Ok(env)
    }
}
