//! REST facade
//!
//! Thin axum layer over the engine and the task queue:
//!
//! - `POST /api/v1/workflows/run` - load a document, start a run, drive
//!   it in the background
//! - `GET  /api/v1/workflows/runs/:id` - run status
//! - `GET/POST /api/v1/tasks` plus `/assign`, `/complete`, `/reject`,
//!   `/pending/:role` and `/queue/stats`
//! - `GET  /health`
//!
//! All engines share one task queue, so completing a task through the
//! API wakes the suspended run wherever it is parked.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use awe_core::document;
use awe_core::engine::{Engine, EngineOptions, RunStatus};
use awe_core::llm::ChatModel;
use awe_llm::{GeminiClient, RemoteLlmConfig};
use awe_tasks::{HumanTask, InMemoryTaskStore, TaskFilter, TaskPriority, TaskQueue, TaskStatus, TaskStoreError};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    queue: TaskQueue,
    model: Option<Box<dyn ChatModel>>,
    credential: Option<String>,
    runs: Arc<RwLock<HashMap<Uuid, RunStatus>>>,
}

/// Start the HTTP server on `port`.
pub async fn serve(port: u16, key: Option<String>) -> anyhow::Result<()> {
    let queue = TaskQueue::new(Arc::new(InMemoryTaskStore::new()));
    let model: Option<Box<dyn ChatModel>> = key.as_deref().map(|k| {
        Box::new(GeminiClient::new(RemoteLlmConfig::with_key(k))) as Box<dyn ChatModel>
    });
    let state = AppState {
        queue,
        model,
        credential: key,
        runs: Arc::new(RwLock::new(HashMap::new())),
    };

    let app = create_router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "awe server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/workflows/run", post(run_workflow))
        .route("/api/v1/workflows/runs/:id", get(get_run))
        .route("/api/v1/tasks", get(list_tasks).post(create_task))
        .route("/api/v1/tasks/pending/:role", get(pending_by_role))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/tasks/:id/assign", post(assign_task))
        .route("/api/v1/tasks/:id/complete", post(complete_task))
        .route("/api/v1/tasks/:id/reject", post(reject_task))
        .route("/api/v1/queue/stats", get(queue_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------

enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<TaskStoreError> for ApiError {
    fn from(err: TaskStoreError) -> Self {
        match err {
            TaskStoreError::NotFound(id) => ApiError::NotFound(format!("task not found: {id}")),
            TaskStoreError::AlreadyExists(_) | TaskStoreError::Transition(_) => {
                ApiError::Conflict(err.to_string())
            }
            TaskStoreError::Backend(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

fn ok<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "success": true, "data": data })))
}

fn created<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::CREATED, Json(json!({ "success": true, "data": data })))
}

// ---------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct RunRequest {
    document: Value,
    #[serde(default)]
    inputs: Option<Value>,
}

async fn run_workflow(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let workflow = document::from_json(&request.document.to_string())
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let mut options = EngineOptions::new(state.queue.store().clone());
    if let Some(model) = &state.model {
        options = options.with_model(model.clone());
    }
    if let Some(credential) = &state.credential {
        options = options.with_credential(credential.clone());
    }

    let mut engine = Engine::with_shared_queue(Arc::new(workflow), state.queue.clone(), options)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let run_id = engine
        .start(request.inputs.unwrap_or_else(|| json!({})))
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    state.runs.write().await.insert(run_id, RunStatus::Running);
    let runs = state.runs.clone();
    tokio::spawn(async move {
        loop {
            let status = match engine.run_to_quiescence().await {
                Ok(status) => status,
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "run errored");
                    RunStatus::Failed
                }
            };
            runs.write().await.insert(run_id, status);
            match status {
                RunStatus::Waiting => {
                    // Parked on human tasks; wake on the next signal.
                    let _ = engine.wait_for_signal().await;
                }
                _ => break,
            }
        }
    });

    Ok(created(json!({ "run_id": run_id, "status": "running" })))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .runs
        .read()
        .await
        .get(&id)
        .copied()
        .ok_or_else(|| ApiError::NotFound(format!("run not found: {id}")))?;
    Ok(ok(json!({ "run_id": id, "status": status })))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match params.get("status") {
        Some(raw) => Some(
            serde_json::from_value::<TaskStatus>(Value::String(raw.clone()))
                .map_err(|_| ApiError::BadRequest(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };
    let filter = TaskFilter {
        status,
        role_id: params.get("role_id").cloned(),
        assignee_id: params.get("assignee_id").cloned(),
        workflow_id: params.get("workflow_id").cloned(),
        token_id: None,
    };
    let tasks = state.queue.list(filter).await?;
    Ok(ok(tasks))
}

#[derive(Deserialize)]
struct CreateTaskRequest {
    activity_name: String,
    role_id: String,
    #[serde(default)]
    priority: Option<TaskPriority>,
    #[serde(default)]
    inputs: Option<Value>,
}

async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut task = HumanTask::new(
        Uuid::new_v4().to_string(),
        request.activity_name,
        "manual",
        "manual",
        request.role_id,
    );
    if let Some(priority) = request.priority {
        task = task.with_priority(priority);
    }
    if let Some(inputs) = request.inputs {
        task = task.with_inputs(inputs);
    }
    let id = state.queue.create(task).await?;
    let task = state.queue.get(&id).await?;
    Ok(created(task))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.queue.get(&id).await?))
}

#[derive(Deserialize)]
struct AssignRequest {
    assignee_id: String,
    #[serde(default)]
    assigner_id: Option<String>,
}

async fn assign_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AssignRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .queue
        .assign(&id, &request.assignee_id, request.assigner_id)
        .await?;
    Ok(ok(task))
}

#[derive(Deserialize)]
struct CompleteRequest {
    #[serde(default)]
    outputs: Value,
    /// Complete implies start for clients that skip the explicit
    /// transition.
    #[serde(default)]
    auto_start: bool,
}

async fn complete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CompleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.auto_start {
        let task = state.queue.get(&id).await?;
        if task.status == TaskStatus::Assigned {
            state.queue.start(&id).await?;
        }
    }
    let task = state.queue.complete(&id, request.outputs).await?;
    Ok(ok(task))
}

#[derive(Deserialize)]
struct RejectRequest {
    reason: String,
}

async fn reject_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RejectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.queue.reject(&id, &request.reason).await?;
    Ok(ok(task))
}

async fn pending_by_role(
    State(state): State<AppState>,
    Path(role): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.queue.pending_by_role(&role).await?))
}

async fn queue_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.queue.stats().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState {
            queue: TaskQueue::new(Arc::new(InMemoryTaskStore::new())),
            model: None,
            credential: None,
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], json!("ok"));
    }

    #[tokio::test]
    async fn test_run_and_task_round_trip() {
        let state = test_state();
        let app = create_router(state.clone());

        let activity = Uuid::new_v4();
        let doc = json!({
            "id": Uuid::new_v4(),
            "name": "approval",
            "version": "1.0.0",
            "activities": [{
                "id": activity,
                "name": "review",
                "role_id": "qc",
                "actor_type": "human",
                "priority": "high",
            }],
        });

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/v1/workflows/run")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        json!({ "document": doc, "inputs": {"claim": 1} }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        let run_id = body["data"]["run_id"].as_str().unwrap().to_string();

        // The background driver parks on the human task
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let pending = state.queue.pending_by_role("qc").await.unwrap();
        assert_eq!(pending.len(), 1);
        let task_id = pending[0].id.clone();

        // assign -> complete (auto_start) through the API
        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(format!("/api/v1/tasks/{task_id}/assign"))
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        json!({ "assignee_id": "alice" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(format!("/api/v1/tasks/{task_id}/complete"))
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        json!({ "outputs": {"approved": true}, "auto_start": true }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The run finishes in the background
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/api/v1/workflows/runs/{run_id}"))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"]["status"], json!("completed"));
    }

    #[tokio::test]
    async fn test_illegal_transition_is_conflict() {
        let state = test_state();
        let app = create_router(state.clone());

        let task = HumanTask::new("a", "Review", "tok", "wf", "qc");
        let id = state.queue.create(task).await.unwrap();

        // Completing a pending task without assignment is a 409
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(format!("/api/v1/tasks/{id}/complete"))
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(json!({ "outputs": {} }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/v1/tasks/nope")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_queue_stats() {
        let state = test_state();
        let app = create_router(state.clone());
        state
            .queue
            .create(HumanTask::new("a", "A", "tok", "wf", "qc"))
            .await
            .unwrap();

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/v1/queue/stats")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["data"]["pending"], json!(1));
    }
}
