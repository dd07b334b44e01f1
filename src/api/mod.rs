//! REST API for kbflow

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::catalog::{Catalog, Repository};
use crate::engine::Engine;
use crate::error::FlowError;
use crate::models::{Execution, HistoryEntry, WorkflowKind};
use crate::storage::StateStore;

/// Application state shared across handlers
pub struct AppState<S: StateStore + Catalog + Clone> {
    pub engine: Arc<Engine<S>>,
}

/// Create the API router
pub fn router<S: StateStore + Catalog + Clone>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        // Executions
        .route("/executions", post(start_execution::<S>))
        .route("/executions", get(list_executions::<S>))
        .route("/executions/:id", get(get_execution::<S>))
        .route("/executions/:id/history", get(get_history::<S>))
        // Catalog
        .route("/repositories/:id", get(get_repository::<S>))
        // Operations
        .route("/metrics", get(metrics::<S>))
        .route("/health", get(health_check::<S>))
        .with_state(state)
}

// === Request/Response types ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionRequest {
    /// `create-store`, `delete-store`, `ingest-pipeline` or `delete-pipeline`
    pub workflow: String,
    #[serde(default)]
    pub input: serde_json::Value,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionResponse {
    pub execution_id: Uuid,
    pub created: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub workflow: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    pub id: Uuid,
    pub workflow: WorkflowKind,
    pub status: String,
    pub state_name: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub cause: Option<String>,
    pub transitions: i64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub run_after: Option<String>,
}

impl From<Execution> for ExecutionResponse {
    fn from(e: Execution) -> Self {
        Self {
            id: e.id,
            workflow: e.workflow,
            status: e.status.as_str().to_string(),
            state_name: e.state_name,
            input: e.input,
            output: e.output,
            error: e.error,
            cause: e.cause,
            transitions: e.transitions,
            created_at: e.created_at.to_rfc3339(),
            started_at: e.started_at.map(|t| t.to_rfc3339()),
            ended_at: e.ended_at.map(|t| t.to_rfc3339()),
            run_after: e.run_after.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
}

// === Handlers ===

async fn start_execution<S: StateStore + Catalog + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<StartExecutionRequest>,
) -> Result<(StatusCode, Json<StartExecutionResponse>), AppError> {
    let kind = WorkflowKind::parse(&req.workflow)
        .ok_or_else(|| FlowError::UnknownWorkflow(req.workflow.clone()))?;

    let started = state
        .engine
        .start_json(kind, req.input, req.idempotency_key)
        .await?;

    tracing::info!(
        workflow = %kind,
        execution_id = %started.execution_id,
        created = started.created,
        "Execution requested"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(StartExecutionResponse {
            execution_id: started.execution_id,
            created: started.created,
        }),
    ))
}

async fn list_executions<S: StateStore + Catalog + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ExecutionResponse>>, AppError> {
    let workflow = match query.workflow.as_deref() {
        Some(name) => Some(
            WorkflowKind::parse(name).ok_or_else(|| FlowError::UnknownWorkflow(name.to_string()))?,
        ),
        None => None,
    };

    let executions = state
        .engine
        .store()
        .list_executions(workflow, query.limit.clamp(1, 500), query.offset.max(0))
        .await?;
    Ok(Json(executions.into_iter().map(Into::into).collect()))
}

async fn get_execution<S: StateStore + Catalog + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExecutionResponse>, AppError> {
    let execution = state
        .engine
        .store()
        .get_execution(id)
        .await?
        .ok_or(FlowError::ExecutionNotFound { id })?;
    Ok(Json(execution.into()))
}

async fn get_history<S: StateStore + Catalog + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<HistoryEntry>>, AppError> {
    let store = state.engine.store();
    store
        .get_execution(id)
        .await?
        .ok_or(FlowError::ExecutionNotFound { id })?;
    Ok(Json(store.get_history(id).await?))
}

async fn get_repository<S: StateStore + Catalog + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Repository>, AppError> {
    let repository = state
        .engine
        .store()
        .get_repository(&id)
        .await?
        .ok_or(FlowError::RepositoryNotFound { id })?;
    Ok(Json(repository))
}

async fn metrics<S: StateStore + Catalog + Clone>(
    State(state): State<Arc<AppState<S>>>,
) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.engine.metrics().registry.export_prometheus(),
    )
}

async fn health_check<S: StateStore + Catalog + Clone>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<HealthResponse>, AppError> {
    let db_status = match state.engine.store().ping().await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        database: db_status.to_string(),
    }))
}

// === Error handling ===

pub struct AppError(FlowError);

impl From<FlowError> for AppError {
    fn from(e: FlowError) -> Self {
        Self(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self.0 {
            FlowError::ExecutionNotFound { .. } | FlowError::RepositoryNotFound { .. } => {
                (StatusCode::NOT_FOUND, self.0.to_string())
            }
            FlowError::RepositoryExists { .. } | FlowError::StatusConflict { .. } => {
                (StatusCode::CONFLICT, self.0.to_string())
            }
            FlowError::InvalidInput(_) | FlowError::UnknownWorkflow(_) => {
                (StatusCode::BAD_REQUEST, self.0.to_string())
            }
            _ => {
                tracing::error!(error = %self.0, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}
