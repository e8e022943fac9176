// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP boundary.
//!
//! | Method | Path | Operation |
//! |--------|------|-----------|
//! | GET | `/` | Service info |
//! | GET | `/health` | Liveness |
//! | GET | `/projects` | List projects |
//! | GET | `/projects/{name}` | Project status |
//! | DELETE | `/projects/{name}` | Stop and remove a project |
//! | POST | `/projects/{name}/start` | Start worker |
//! | POST | `/projects/{name}/stop` | Stop worker |
//! | POST | `/projects/{name}/restart` | Restart worker |
//! | POST | `/projects/{name}/deploy` | Deploy several functions as one version |
//! | GET | `/functions/{project}` | List functions |
//! | POST | `/functions/{project}/deploy` | Deploy a function |
//! | POST | `/functions/{project}/{function}/invoke` | Invoke (`?timeout_ms=`) |
//! | DELETE | `/functions/{project}/{function}` | Undeploy a function |
//! | POST | `/tasks/{project}/{function}` | Start a background invocation |
//! | GET | `/tasks` | List tasks (`?status=`) |
//! | GET | `/tasks/{id}` | Task record |
//! | POST | `/tasks/{id}/cancel` | Cancel a task |
//!
//! Errors are returned as `{"error": <message>, "code": <code>}`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::{debug, error};
use uuid::Uuid;

use crate::deploy::{DeployError, DeployRequest, HotDeployController, ProjectDeployRequest};
use crate::dispatcher::{Dispatcher, InvokeError};
use crate::supervisor::{Supervisor, SupervisorError};
use crate::tasks::{TaskError, TaskManager, TaskStatus};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct ApiState {
    pub supervisor: Supervisor,
    pub dispatcher: Arc<Dispatcher>,
    pub deployer: Arc<HotDeployController>,
    pub tasks: Arc<TaskManager>,
}

/// Error response carrying a status code and a machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    fn unprocessable(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, code = self.code, "API error: {}", self.message);
        } else {
            debug!(status = %self.status, code = self.code, "API error: {}", self.message);
        }
        (
            self.status,
            Json(json!({"error": self.message, "code": self.code})),
        )
            .into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        let message = e.to_string();
        match e {
            SupervisorError::LifecycleBusy(_) => {
                Self::new(StatusCode::CONFLICT, "lifecycle_busy", message)
            }
            SupervisorError::AlreadyRunning(_) => {
                Self::new(StatusCode::CONFLICT, "already_running", message)
            }
            SupervisorError::ProjectNotFound(_) => Self::not_found("project_not_found", message),
            SupervisorError::StartupTimeout { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "startup_timeout", message)
            }
            SupervisorError::LaunchFailed { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "launch_failed", message)
            }
            SupervisorError::LoadFailed { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "load_failed", message)
            }
            SupervisorError::Io(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "io_error", message)
            }
        }
    }
}

impl From<InvokeError> for ApiError {
    fn from(e: InvokeError) -> Self {
        let message = e.to_string();
        match e {
            InvokeError::ProjectNotRunning(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "project_not_running", message)
            }
            InvokeError::Overloaded => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, "overloaded", message)
            }
            InvokeError::Timeout => Self::new(StatusCode::GATEWAY_TIMEOUT, "timeout", message),
            InvokeError::WorkerUnavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "worker_unavailable", message)
            }
            InvokeError::FunctionNotFound { .. } => Self::not_found("function_not_found", message),
            InvokeError::FunctionFailed(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "function_failed", message)
            }
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(e: DeployError) -> Self {
        let message = e.to_string();
        match e {
            DeployError::InvalidName(_) => Self::unprocessable("invalid_name", message),
            DeployError::InvalidArtifact(_) => Self::unprocessable("invalid_artifact", message),
            DeployError::InvalidManifest(_) => Self::unprocessable("invalid_manifest", message),
            DeployError::InvalidRequest(_) => Self::unprocessable("invalid_request", message),
            DeployError::ProvisionFailed(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "provision_failed", message)
            }
            DeployError::LoadFailed(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "load_failed", message)
            }
            DeployError::FunctionNotFound { .. } => Self::not_found("function_not_found", message),
            DeployError::Io(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "io_error", message)
            }
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        let message = e.to_string();
        match e {
            TaskError::NotFound(_) => Self::not_found("task_not_found", message),
            TaskError::AlreadyFinished { .. } => {
                Self::new(StatusCode::CONFLICT, "task_finished", message)
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health))
        // Projects
        .route("/projects", get(list_projects))
        .route("/projects/{name}", get(project_status).delete(remove_project))
        .route("/projects/{name}/start", post(start_project))
        .route("/projects/{name}/stop", post(stop_project))
        .route("/projects/{name}/restart", post(restart_project))
        .route("/projects/{name}/deploy", post(deploy_project))
        // Functions
        .route("/functions/{project}", get(list_functions))
        .route("/functions/{project}/deploy", post(deploy_function))
        .route("/functions/{project}/{function}", delete(delete_function))
        .route("/functions/{project}/{function}/invoke", post(invoke_function))
        // Tasks; the first segment is a project name or a task id
        .route("/tasks", get(list_tasks))
        .route("/tasks/{key}", get(get_task))
        .route("/tasks/{key}/cancel", post(cancel_task))
        .route("/tasks/{key}/{function}", post(create_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Service
// ============================================================================

async fn service_info() -> impl IntoResponse {
    Json(json!({
        "service": "fnhost",
        "version": VERSION,
        "status": "running",
    }))
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let admission = state.dispatcher.admission();
    Json(json!({
        "status": "healthy",
        "in_flight": admission.in_flight(),
        "waiting": admission.waiting(),
    }))
}

// ============================================================================
// Projects
// ============================================================================

async fn list_projects(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({"projects": state.supervisor.list_projects()}))
}

async fn project_status(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.supervisor.status(&name)?))
}

async fn start_project(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.supervisor.start_project(&name).await?))
}

async fn stop_project(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.supervisor.stop_project(&name).await?;
    Ok(Json(json!({
        "project": name,
        "state": "stopped",
        "outcome": outcome,
    })))
}

async fn restart_project(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.supervisor.restart_project(&name).await?))
}

async fn remove_project(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.supervisor.remove_project(&name).await?;
    Ok(Json(json!({"project": name, "deleted": true})))
}

// ============================================================================
// Functions
// ============================================================================

async fn list_functions(
    State(state): State<ApiState>,
    Path(project): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let functions = state
        .supervisor
        .catalog()
        .functions(&project)
        .ok_or_else(|| {
            ApiError::not_found("project_not_found", format!("project not found: {}", project))
        })?;
    Ok(Json(json!({"project": project, "functions": functions})))
}

async fn deploy_function(
    State(state): State<ApiState>,
    Path(project): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request: DeployRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::unprocessable("invalid_artifact", e.to_string()))?;
    Ok(Json(state.deployer.deploy(&project, request).await?))
}

async fn deploy_project(
    State(state): State<ApiState>,
    Path(project): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request: ProjectDeployRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::unprocessable("invalid_request", e.to_string()))?;
    Ok(Json(state.deployer.deploy_project(&project, request).await?))
}

async fn delete_function(
    State(state): State<ApiState>,
    Path((project, function)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state.deployer.delete(&project, &function).await?;
    Ok(Json(json!({
        "project": project,
        "function": function,
        "status": "undeployed",
    })))
}

#[derive(Debug, Default, Deserialize)]
struct TimeoutParams {
    timeout_ms: Option<u64>,
}

impl TimeoutParams {
    fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// An empty body is an empty object.
fn parse_payload(body: &Bytes) -> ApiResult<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::unprocessable("invalid_payload", e.to_string()))
}

async fn invoke_function(
    State(state): State<ApiState>,
    Path((project, function)): Path<(String, String)>,
    Query(params): Query<TimeoutParams>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let payload = parse_payload(&body)?;
    let invocation = state
        .dispatcher
        .invoke(&project, &function, payload, params.timeout())
        .await?;
    Ok(Json(json!({
        "status": "success",
        "result": invocation.result,
        "version": invocation.version,
    })))
}

// ============================================================================
// Tasks
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct TaskListParams {
    status: Option<TaskStatus>,
}

async fn create_task(
    State(state): State<ApiState>,
    Path((project, function)): Path<(String, String)>,
    Query(params): Query<TimeoutParams>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let payload = parse_payload(&body)?;
    let (record, created) = state
        .tasks
        .create(&project, &function, payload, params.timeout());
    let status = if created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(record)))
}

async fn list_tasks(
    State(state): State<ApiState>,
    Query(params): Query<TaskListParams>,
) -> impl IntoResponse {
    Json(json!({"tasks": state.tasks.list(params.status)}))
}

async fn get_task(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let record = state.tasks.get(id).ok_or(TaskError::NotFound(id))?;
    Ok(Json(record))
}

async fn cancel_task(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.tasks.cancel(id)?))
}
