// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invocation dispatch.
//!
//! `invoke` suspends at two points only: admission and the worker reply.
//! Both are bounded by the same deadline. The admission ticket is scoped to
//! the call and released on every exit path.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fnhost_protocol::{InvokeErrorKind, InvokeOutcome};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::admission::{AdmissionController, AdmissionError};
use crate::channel::ChannelError;
use crate::supervisor::Supervisor;

/// Invocation failures, one per caller-visible kind.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("project {0} is not running")]
    ProjectNotRunning(String),

    #[error("too many concurrent invocations")]
    Overloaded,

    #[error("invocation timed out")]
    Timeout,

    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("function {function} not found in project {project}")]
    FunctionNotFound { project: String, function: String },

    #[error("function failed: {0}")]
    FunctionFailed(String),
}

/// A successful invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub result: Value,
    /// Version of the table that served the call
    pub version: u64,
}

/// Routes invocations to running workers.
pub struct Dispatcher {
    supervisor: Supervisor,
    admission: Arc<AdmissionController>,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        supervisor: Supervisor,
        admission: Arc<AdmissionController>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            admission,
            default_timeout,
        }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run `function` of `project` with `payload`, waiting at most
    /// `timeout` (or the default) in total.
    pub async fn invoke(
        &self,
        project: &str,
        function: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Invocation, InvokeError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;

        if self.supervisor.running_worker(project).is_none() {
            return Err(InvokeError::ProjectNotRunning(project.to_string()));
        }

        let _ticket = match self.admission.acquire(deadline).await {
            Ok(ticket) => ticket,
            Err(AdmissionError::Rejected) => {
                warn!(
                    project,
                    function,
                    in_flight = self.admission.in_flight(),
                    waiting = self.admission.waiting(),
                    "Invocation rejected by admission"
                );
                return Err(InvokeError::Overloaded);
            }
            Err(AdmissionError::DeadlineElapsed) => return Err(InvokeError::Timeout),
        };

        // The worker may have been replaced while this call waited.
        let worker = self
            .supervisor
            .running_worker(project)
            .ok_or_else(|| InvokeError::ProjectNotRunning(project.to_string()))?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let wire_deadline =
            Utc::now() + chrono::Duration::from_std(remaining).unwrap_or(chrono::Duration::zero());

        let response = worker
            .channel()
            .invoke(function, payload, wire_deadline, remaining)
            .await
            .map_err(|e| match e {
                ChannelError::Timeout => InvokeError::Timeout,
                other => InvokeError::WorkerUnavailable(other.to_string()),
            })?;

        debug!(
            project,
            function,
            correlation_id = response.correlation_id,
            version = response.version,
            "Invocation answered"
        );

        match response.outcome {
            InvokeOutcome::Success { result } => {
                self.supervisor.catalog().record_invocation(project, function);
                Ok(Invocation {
                    result,
                    version: response.version,
                })
            }
            InvokeOutcome::Error { kind, message } => match kind {
                InvokeErrorKind::FunctionNotFound => Err(InvokeError::FunctionNotFound {
                    project: project.to_string(),
                    function: function.to_string(),
                }),
                InvokeErrorKind::Failed => {
                    self.supervisor.catalog().record_invocation(project, function);
                    Err(InvokeError::FunctionFailed(message))
                }
                InvokeErrorKind::DeadlineExceeded => {
                    self.supervisor.catalog().record_invocation(project, function);
                    Err(InvokeError::Timeout)
                }
            },
        }
    }
}
