// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background invocations.
//!
//! A task runs one invocation on a tokio task and records the outcome.
//! Tasks live in memory only. At most one task per project/function is
//! `created` or `running` at a time; creating another returns the existing
//! one. Cancelling aborts the master-side wait; the worker is not told.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::dispatcher::{Dispatcher, Invocation, InvokeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub project: String,
    pub function: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(Uuid),

    #[error("task {id} already finished ({status:?})")]
    AlreadyFinished { id: Uuid, status: TaskStatus },
}

struct TaskEntry {
    record: TaskRecord,
    abort: Option<AbortHandle>,
}

/// In-memory registry of background invocations.
pub struct TaskManager {
    dispatcher: Arc<Dispatcher>,
    tasks: Mutex<HashMap<Uuid, TaskEntry>>,
}

impl TaskManager {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start a background invocation, or return the one already pending for
    /// this project/function. The flag is true if a new task was created.
    pub fn create(
        self: &Arc<Self>,
        project: &str,
        function: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> (TaskRecord, bool) {
        let mut tasks = self.tasks();
        if let Some(existing) = tasks.values().find(|t| {
            t.record.project == project
                && t.record.function == function
                && !t.record.status.is_finished()
        }) {
            debug!(task_id = %existing.record.id, project, function, "Returning pending task");
            return (existing.record.clone(), false);
        }

        let id = Uuid::new_v4();
        let record = TaskRecord {
            id,
            project: project.to_string(),
            function: function.to_string(),
            status: TaskStatus::Created,
            result: None,
            version: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        let manager = Arc::clone(self);
        let (project_owned, function_owned) = (project.to_string(), function.to_string());
        let handle = tokio::spawn(async move {
            if !manager.mark_running(id) {
                return;
            }
            let outcome = manager
                .dispatcher
                .invoke(&project_owned, &function_owned, payload, timeout)
                .await;
            manager.finish(id, outcome);
        });

        // The spawned task blocks on this lock until the entry exists.
        tasks.insert(
            id,
            TaskEntry {
                record: record.clone(),
                abort: Some(handle.abort_handle()),
            },
        );
        info!(task_id = %id, project, function, "Task created");
        (record, true)
    }

    pub fn get(&self, id: Uuid) -> Option<TaskRecord> {
        self.tasks().get(&id).map(|t| t.record.clone())
    }

    /// Tasks, newest first, optionally filtered by status.
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .tasks()
            .values()
            .filter(|t| status.is_none_or(|s| t.record.status == s))
            .map(|t| t.record.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    pub fn cancel(&self, id: Uuid) -> Result<TaskRecord, TaskError> {
        let mut tasks = self.tasks();
        let entry = tasks.get_mut(&id).ok_or(TaskError::NotFound(id))?;
        if entry.record.status.is_finished() {
            return Err(TaskError::AlreadyFinished {
                id,
                status: entry.record.status,
            });
        }
        if let Some(abort) = entry.abort.take() {
            abort.abort();
        }
        entry.record.status = TaskStatus::Cancelled;
        entry.record.finished_at = Some(Utc::now());
        info!(task_id = %id, "Task cancelled");
        Ok(entry.record.clone())
    }

    /// Drop finished tasks older than `retention`. Returns how many.
    pub fn sweep(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut tasks = self.tasks();
        let before = tasks.len();
        tasks.retain(|_, t| {
            !(t.record.status.is_finished() && t.record.finished_at.is_some_and(|at| at < cutoff))
        });
        before - tasks.len()
    }

    fn mark_running(&self, id: Uuid) -> bool {
        let mut tasks = self.tasks();
        match tasks.get_mut(&id) {
            Some(entry) if entry.record.status == TaskStatus::Created => {
                entry.record.status = TaskStatus::Running;
                entry.record.started_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    fn finish(&self, id: Uuid, outcome: Result<Invocation, InvokeError>) {
        let mut tasks = self.tasks();
        let Some(entry) = tasks.get_mut(&id) else {
            return;
        };
        // A cancel that raced the completion wins.
        if entry.record.status != TaskStatus::Running {
            return;
        }
        entry.abort = None;
        entry.record.finished_at = Some(Utc::now());
        match outcome {
            Ok(invocation) => {
                entry.record.status = TaskStatus::Completed;
                entry.record.result = Some(invocation.result);
                entry.record.version = Some(invocation.version);
            }
            Err(e) => {
                entry.record.status = TaskStatus::Failed;
                entry.record.error = Some(e.to_string());
            }
        }
        debug!(task_id = %id, status = ?entry.record.status, "Task finished");
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Configuration for the task cleanup worker.
#[derive(Debug, Clone)]
pub struct TaskCleanupConfig {
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Age after which finished tasks are dropped.
    pub retention: Duration,
}

/// Background worker that sweeps finished tasks.
pub struct TaskCleanupWorker {
    tasks: Arc<TaskManager>,
    config: TaskCleanupConfig,
    shutdown: Arc<Notify>,
}

impl TaskCleanupWorker {
    pub fn new(tasks: Arc<TaskManager>, config: TaskCleanupConfig) -> Self {
        Self {
            tasks,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "Task cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Task cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let removed = self.tasks.sweep(self.config.retention);
                    if removed > 0 {
                        info!(removed, "Swept finished tasks");
                    }
                }
            }
        }

        info!("Task cleanup worker stopped");
    }
}
