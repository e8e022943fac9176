// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function artifacts as stored on disk and read back by workers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// File name of the serialized artifact inside a version directory.
pub const ARTIFACT_FILE: &str = "artifact.json";

/// File name the exec runtime's script is written to.
pub const EXEC_ENTRY_FILE: &str = "main";

/// File name of a dependency manifest.
pub const MANIFEST_FILE: &str = "requirements.txt";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("template body must not be null")]
    EmptyTemplate,

    #[error("exec source must not be empty")]
    EmptySource,
}

/// A deployable function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionArtifact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub code: FunctionCode,
}

/// How a function is executed by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "runtime", rename_all = "snake_case")]
pub enum FunctionCode {
    /// Returns `body` with `{{key}}` placeholders filled from the payload.
    Template { body: Value },
    /// Runs `source` as an executable, payload on stdin, JSON result on stdout.
    Exec {
        source: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl FunctionArtifact {
    pub fn runtime(&self) -> &'static str {
        match self.code {
            FunctionCode::Template { .. } => "template",
            FunctionCode::Exec { .. } => "exec",
        }
    }

    pub fn validate(&self) -> Result<(), ArtifactError> {
        match &self.code {
            FunctionCode::Template { body } if body.is_null() => Err(ArtifactError::EmptyTemplate),
            FunctionCode::Exec { source, .. } if source.trim().is_empty() => {
                Err(ArtifactError::EmptySource)
            }
            _ => Ok(()),
        }
    }
}
