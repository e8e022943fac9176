// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function loaders.
//!
//! A loader turns a [`FunctionEntry`] (artifact directory plus optional
//! environment directory) into a callable [`FunctionHandler`]. The default
//! loader understands the two artifact runtimes:
//!
//! | Runtime | Behaviour |
//! |---------|-----------|
//! | `template` | Returns the body with `{{key}}` filled from the payload |
//! | `exec` | Runs `main` with the payload on stdin, parses stdout as JSON |

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use fnhost_protocol::{ARTIFACT_FILE, EXEC_ENTRY_FILE, FunctionArtifact, FunctionCode, FunctionEntry};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::LoadError;

/// A loaded function entry point.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    /// Run the function. `Err` carries a user-facing failure message.
    async fn call(&self, payload: Value) -> Result<Value, String>;
}

/// Resolves function entries into handlers.
#[async_trait]
pub trait FunctionLoader: Send + Sync {
    /// Load the function described by `entry`.
    async fn load(&self, entry: &FunctionEntry) -> Result<Arc<dyn FunctionHandler>, LoadError>;
}

/// Loader for artifacts written by the master's deploy path.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLoader;

impl DefaultLoader {
    /// Read and validate `artifact.json` from an artifact directory.
    pub async fn read_artifact(dir: &Path) -> Result<FunctionArtifact, LoadError> {
        let path = dir.join(ARTIFACT_FILE);
        let raw = tokio::fs::read(&path).await.map_err(|source| LoadError::Io {
            path: path.clone(),
            source,
        })?;
        let artifact: FunctionArtifact =
            serde_json::from_slice(&raw).map_err(|source| LoadError::Json { path, source })?;
        artifact.validate()?;
        Ok(artifact)
    }
}

#[async_trait]
impl FunctionLoader for DefaultLoader {
    async fn load(&self, entry: &FunctionEntry) -> Result<Arc<dyn FunctionHandler>, LoadError> {
        let artifact = Self::read_artifact(&entry.artifact_dir).await?;
        debug!(
            function = %entry.name,
            runtime = artifact.runtime(),
            artifact_dir = %entry.artifact_dir.display(),
            "Loading function"
        );

        match artifact.code {
            FunctionCode::Template { body } => Ok(Arc::new(TemplateHandler::new(body))),
            FunctionCode::Exec { args, .. } => {
                let program = entry.artifact_dir.join(EXEC_ENTRY_FILE);
                if tokio::fs::metadata(&program).await.is_err() {
                    return Err(LoadError::MissingEntry(program));
                }
                Ok(Arc::new(ExecHandler {
                    program,
                    args,
                    env_dir: entry.env_dir.clone(),
                }))
            }
        }
    }
}

/// Handler for the `template` runtime.
#[derive(Debug, Clone)]
pub struct TemplateHandler {
    body: Value,
}

impl TemplateHandler {
    pub fn new(body: Value) -> Self {
        Self { body }
    }
}

#[async_trait]
impl FunctionHandler for TemplateHandler {
    async fn call(&self, payload: Value) -> Result<Value, String> {
        Ok(render_template(&self.body, &payload))
    }
}

/// Fill `{{key}}` placeholders in every string of `body` from the payload's
/// top-level fields.
///
/// Strings are inserted verbatim, other values as compact JSON, and missing
/// keys (or a non-object payload) as the empty string. Object keys are left
/// untouched.
pub fn render_template(body: &Value, payload: &Value) -> Value {
    match body {
        Value::String(s) => Value::String(render_str(s, payload)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_template(v, payload)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_template(v, payload)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_str(template: &str, payload: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let key = rest[start + 2..start + 2 + len].trim();
        match payload.get(key) {
            Some(Value::String(s)) => out.push_str(s),
            Some(Value::Null) | None => {}
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &rest[start + 2 + len + 2..];
    }

    out.push_str(rest);
    out
}

/// Handler for the `exec` runtime.
#[derive(Debug, Clone)]
pub struct ExecHandler {
    program: PathBuf,
    args: Vec<String>,
    env_dir: Option<PathBuf>,
}

impl ExecHandler {
    pub fn new(program: PathBuf, args: Vec<String>, env_dir: Option<PathBuf>) -> Self {
        Self {
            program,
            args,
            env_dir,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(env_dir) = &self.env_dir {
            let bin = env_dir.join("bin");
            let path = match std::env::var_os("PATH") {
                Some(existing) => {
                    let mut paths = vec![bin];
                    paths.extend(std::env::split_paths(&existing));
                    std::env::join_paths(paths).unwrap_or(existing)
                }
                None => bin.into_os_string(),
            };
            cmd.env("PATH", path).env("FNHOST_ENV_DIR", env_dir);
        }

        cmd
    }
}

#[async_trait]
impl FunctionHandler for ExecHandler {
    async fn call(&self, payload: Value) -> Result<Value, String> {
        let input = serde_json::to_vec(&payload).map_err(|e| e.to_string())?;

        let mut child = self
            .command()
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {}", self.program.display(), e))?;

        // Stdin is fed while stdout and stderr drain, so a function that
        // streams its input back cannot fill both pipes.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&input).await {
                Ok(()) => Ok(()),
                // A function that never reads its input closes the pipe early.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                Err(e) => Err(format!("failed to write payload: {}", e)),
            }
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| format!("failed to wait for function: {}", e))?;
        fed?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(if stderr.is_empty() {
                format!("function exited with {}", output.status)
            } else {
                stderr
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(stdout.trim()).map_err(|e| format!("function output is not JSON: {}", e))
    }
}
