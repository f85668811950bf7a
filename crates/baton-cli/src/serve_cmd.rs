//! Thin axum HTTP façade over the Dispatcher: task CRUD, plan-review
//! transitions, git read-only queries, and dispatcher lifecycle
//! control. No business logic of its own -- every handler maps a
//! request straight onto an operation baton-core already exposes.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use baton_core::{LifecycleController, LogDocument, WorktreeManager};
use baton_store::{Task, TaskKind, TaskStatus, TaskStore};

/// Handles shared by every route.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub worktrees: Arc<WorktreeManager>,
    pub lifecycle: Arc<LifecycleController>,
    pub data_dir: std::path::PathBuf,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    detail: String,
}

impl AppError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "detail": self.detail });
        (self.status, Json(body)).into_response()
    }
}

impl From<baton_store::StoreError> for AppError {
    fn from(err: baton_store::StoreError) -> Self {
        match err {
            baton_store::StoreError::NotFound(id) => Self::not_found(format!("task {id} not found")),
            other => Self::internal(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Request/response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub needs_plan_review: bool,
}

#[derive(Debug, Deserialize)]
pub struct BulkCreateRequest {
    pub tasks: Vec<CreateTaskRequest>,
}

#[derive(Debug, Serialize)]
pub struct CreatedTaskResponse {
    pub id: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct RevisePlanRequest {
    #[serde(default)]
    pub feedback: String,
}

#[derive(Debug, Serialize)]
pub struct TaskDetailResponse {
    #[serde(flatten)]
    pub task: Task,
    pub log: Option<LogDocument>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
}

#[derive(Debug, Deserialize)]
pub struct CommitsQuery {
    #[serde(default = "default_commit_count")]
    pub count: usize,
}

fn default_commit_count() -> usize {
    20
}

#[derive(Debug, Serialize)]
pub struct CommitResponse {
    pub sha: String,
    pub author: String,
    pub date: String,
    pub subject: String,
}

impl From<baton_core::CommitInfo> for CommitResponse {
    fn from(c: baton_core::CommitInfo) -> Self {
        Self {
            sha: c.sha,
            author: c.author,
            date: c.date,
            subject: c.subject,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WorktreeResponse {
    pub path: String,
    pub branch: Option<String>,
    pub head_commit: String,
}

impl From<baton_core::WorktreeInfo> for WorktreeResponse {
    fn from(w: baton_core::WorktreeInfo) -> Self {
        Self {
            path: w.path.display().to_string(),
            branch: w.branch,
            head_commit: w.head_commit,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DispatcherStatusResponse {
    pub status: baton_core::DispatcherStatus,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/agent/health", get(health))
        .route("/agent/tasks", get(list_all_tasks).post(create_task))
        .route("/agent/tasks/bulk", post(create_tasks_bulk))
        .route("/agent/tasks/{status}", get(list_tasks_by_status))
        .route("/agent/tasks/{status}/{filename}", get(get_task_detail))
        .route("/agent/tasks/{id}/approve-plan", post(approve_plan))
        .route("/agent/tasks/{id}/revise-plan", post(revise_plan))
        .route("/agent/tasks/{id}/reject-plan", post(reject_plan))
        .route("/agent/tasks/{id}/rerun", post(rerun_task))
        .route("/agent/worktrees", get(list_worktrees))
        .route("/agent/commits", get(list_commits))
        .route("/agent/dispatcher", get(dispatcher_status).post(dispatcher_status))
        .route(
            "/agent/dispatcher/start",
            get(dispatcher_start).post(dispatcher_start),
        )
        .route("/agent/dispatcher/stop", get(dispatcher_stop).post(dispatcher_stop))
        .route(
            "/agent/dispatcher/restart",
            get(dispatcher_restart).post(dispatcher_restart),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!(%addr, "baton serve listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("baton serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { healthy: true })
}

async fn list_all_tasks(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let tasks = state.store.list_all().await?;
    let mut grouped: BTreeMap<String, Vec<Task>> = BTreeMap::new();
    for status in [
        TaskStatus::Pending,
        TaskStatus::PlanReview,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ] {
        grouped.insert(status.to_string(), Vec::new());
    }
    for task in tasks {
        grouped.entry(task.status.to_string()).or_default().push(task);
    }
    Ok(Json(grouped).into_response())
}

async fn list_tasks_by_status(
    State(state): State<AppState>,
    Path(status): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let status: TaskStatus = status
        .parse()
        .map_err(|_| AppError::bad_request(format!("unknown task status: {status:?}")))?;

    let tasks: Vec<Task> = state
        .store
        .list_all()
        .await?
        .into_iter()
        .filter(|t| t.status == status)
        .collect();
    Ok(Json(tasks).into_response())
}

async fn get_task_detail(
    State(state): State<AppState>,
    Path((status, filename)): Path<(String, String)>,
) -> Result<axum::response::Response, AppError> {
    let _status: TaskStatus = status
        .parse()
        .map_err(|_| AppError::bad_request(format!("unknown task status: {status:?}")))?;

    let id = filename
        .strip_suffix(".md")
        .ok_or_else(|| AppError::not_found(format!("no such task file: {filename}")))?;

    let task = state
        .store
        .load(id)
        .await
        .map_err(|_| AppError::not_found(format!("task {id} not found")))?;

    let log = LogDocument::read(&state.data_dir, id);
    Ok(Json(TaskDetailResponse { task, log }).into_response())
}

async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<axum::response::Response, AppError> {
    let id = create_one(&state, req).await?;
    Ok((StatusCode::OK, Json(CreatedTaskResponse { id })).into_response())
}

async fn create_tasks_bulk(
    State(state): State<AppState>,
    Json(req): Json<BulkCreateRequest>,
) -> Result<axum::response::Response, AppError> {
    let mut ids = Vec::with_capacity(req.tasks.len());
    for task in req.tasks {
        ids.push(create_one(&state, task).await?);
    }
    Ok(Json(ids.into_iter().map(|id| CreatedTaskResponse { id }).collect::<Vec<_>>()).into_response())
}

async fn create_one(state: &AppState, req: CreateTaskRequest) -> Result<String, AppError> {
    let kind = match req.kind {
        Some(k) => k
            .parse::<TaskKind>()
            .map_err(|_| AppError::bad_request(format!("unknown task kind: {k:?}")))?,
        None => TaskKind::default(),
    };
    let id = baton_core::new_task_id();
    state
        .store
        .add(&id, &req.title, &req.content, kind, req.needs_plan_review)
        .await?;
    Ok(id)
}

async fn approve_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let task = state
        .store
        .approve_plan(&id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("task {id} is not awaiting plan review")))?;
    Ok(Json(task).into_response())
}

async fn revise_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RevisePlanRequest>>,
) -> Result<axum::response::Response, AppError> {
    let feedback = body.map(|Json(r)| r.feedback).unwrap_or_default();
    let task = state
        .store
        .revise_plan(&id, &feedback)
        .await?
        .ok_or_else(|| AppError::not_found(format!("task {id} is not awaiting plan review")))?;
    Ok(Json(task).into_response())
}

async fn reject_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let task = state
        .store
        .reject_plan(&id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("task {id} is not awaiting plan review")))?;
    Ok(Json(task).into_response())
}

async fn rerun_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let task = state
        .store
        .rerun(&id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("task {id} is not in a failed state")))?;
    Ok(Json(task).into_response())
}

async fn list_worktrees(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let worktrees = state.worktrees.clone();
    let infos = tokio::task::spawn_blocking(move || worktrees.list_worktrees())
        .await
        .map_err(AppError::internal)?
        .map_err(AppError::internal)?;
    let response: Vec<WorktreeResponse> = infos.into_iter().map(Into::into).collect();
    Ok(Json(response).into_response())
}

async fn list_commits(
    State(state): State<AppState>,
    Query(query): Query<CommitsQuery>,
) -> Result<axum::response::Response, AppError> {
    let worktrees = state.worktrees.clone();
    let count = query.count;
    let commits = tokio::task::spawn_blocking(move || worktrees.recent_commits(count))
        .await
        .map_err(AppError::internal)?
        .map_err(AppError::internal)?;
    let response: Vec<CommitResponse> = commits.into_iter().map(Into::into).collect();
    Ok(Json(response).into_response())
}

async fn dispatcher_status(State(state): State<AppState>) -> Json<DispatcherStatusResponse> {
    Json(DispatcherStatusResponse {
        status: state.lifecycle.status().await,
    })
}

async fn dispatcher_start(State(state): State<AppState>) -> Json<DispatcherStatusResponse> {
    Json(DispatcherStatusResponse {
        status: state.lifecycle.start().await,
    })
}

async fn dispatcher_stop(State(state): State<AppState>) -> Json<DispatcherStatusResponse> {
    Json(DispatcherStatusResponse {
        status: state.lifecycle.stop().await,
    })
}

async fn dispatcher_restart(State(state): State<AppState>) -> Json<DispatcherStatusResponse> {
    Json(DispatcherStatusResponse {
        status: state.lifecycle.restart().await,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use baton_core::{new_git_lock, AgentConfig, LifecycleController, ProcessRegistry, TaskExecutor};
    use baton_store::{JsonTaskStore, PortAllocator};
    use baton_test_utils::init_repo;
    use std::sync::atomic::AtomicBool;
    use tower::ServiceExt;

    fn test_state(repo: &std::path::Path, data_dir: &std::path::Path) -> AppState {
        let config = AgentConfig::default();
        let store: Arc<dyn TaskStore> = Arc::new(JsonTaskStore::new(data_dir));
        let ports = Arc::new(PortAllocator::new(config.port_range_start, config.port_range_end));
        let registry = Arc::new(ProcessRegistry::new());
        let worktrees = Arc::new(WorktreeManager::new(repo, new_git_lock()).unwrap());
        let stopping = Arc::new(AtomicBool::new(false));
        let executor = Arc::new(TaskExecutor::new(
            config.clone(),
            Arc::clone(&store),
            ports,
            Arc::clone(&registry),
            Arc::clone(&worktrees),
            new_git_lock(),
            data_dir.to_path_buf(),
            Arc::clone(&stopping),
        ));
        let lifecycle = Arc::new(LifecycleController::new(
            Arc::clone(&store),
            executor,
            registry,
            config.max_parallel_workers,
            std::time::Duration::from_secs(config.poll_interval_seconds),
            stopping,
        ));

        AppState {
            store,
            worktrees,
            lifecycle,
            data_dir: data_dir.to_path_buf(),
        }
    }

    async fn send(state: AppState, method: Method, uri: &str, body: serde_json::Value) -> axum::response::Response {
        let app = super::build_router(state);
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        app.oneshot(request).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_returns_healthy() {
        let repo_dir = tempfile::tempdir().unwrap();
        init_repo(repo_dir.path());
        let data_dir = tempfile::tempdir().unwrap();
        let state = test_state(repo_dir.path(), data_dir.path());

        let resp = send(state, Method::GET, "/agent/health", serde_json::Value::Null).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["healthy"], true);
    }

    #[tokio::test]
    async fn create_then_list_tasks_grouped_by_status() {
        let repo_dir = tempfile::tempdir().unwrap();
        init_repo(repo_dir.path());
        let data_dir = tempfile::tempdir().unwrap();
        let state = test_state(repo_dir.path(), data_dir.path());

        let create_body = serde_json::json!({"title": "add a widget", "content": "do it"});
        let resp = send(state.clone(), Method::POST, "/agent/tasks", create_body).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let created = body_json(resp).await;
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(id.len(), 8);

        let resp = send(state.clone(), Method::GET, "/agent/tasks", serde_json::Value::Null).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let pending = json["pending"].as_array().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["id"], id);
        assert!(json["completed"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_by_unknown_status_is_bad_request() {
        let repo_dir = tempfile::tempdir().unwrap();
        init_repo(repo_dir.path());
        let data_dir = tempfile::tempdir().unwrap();
        let state = test_state(repo_dir.path(), data_dir.path());

        let resp = send(state, Method::GET, "/agent/tasks/bogus", serde_json::Value::Null).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert!(json["detail"].as_str().unwrap().contains("bogus"));
    }

    #[tokio::test]
    async fn task_detail_requires_md_suffix() {
        let repo_dir = tempfile::tempdir().unwrap();
        init_repo(repo_dir.path());
        let data_dir = tempfile::tempdir().unwrap();
        let state = test_state(repo_dir.path(), data_dir.path());

        let resp = send(
            state,
            Method::GET,
            "/agent/tasks/pending/aaaa1111.txt",
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn task_detail_includes_session_log_when_present() {
        let repo_dir = tempfile::tempdir().unwrap();
        init_repo(repo_dir.path());
        let data_dir = tempfile::tempdir().unwrap();
        let state = test_state(repo_dir.path(), data_dir.path());

        state
            .store
            .add("aaaa1111", "t", "c", TaskKind::Feature, false)
            .await
            .unwrap();
        let log = LogDocument {
            summary: baton_core::LogSummary {
                exit_code: Some(0),
                timed_out: false,
                aborted: false,
                stderr_snippet: None,
            },
            events: vec![],
        };
        log.write(&state.data_dir, "aaaa1111").unwrap();

        let resp = send(
            state,
            Method::GET,
            "/agent/tasks/pending/aaaa1111.md",
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["id"], "aaaa1111");
        assert_eq!(json["log"]["summary"]["exit_code"], 0);
    }

    #[tokio::test]
    async fn approve_plan_on_non_plan_review_task_is_not_found() {
        let repo_dir = tempfile::tempdir().unwrap();
        init_repo(repo_dir.path());
        let data_dir = tempfile::tempdir().unwrap();
        let state = test_state(repo_dir.path(), data_dir.path());

        state
            .store
            .add("aaaa1111", "t", "c", TaskKind::Feature, false)
            .await
            .unwrap();

        let resp = send(
            state,
            Method::POST,
            "/agent/tasks/aaaa1111/approve-plan",
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dispatcher_lifecycle_round_trips_through_http() {
        let repo_dir = tempfile::tempdir().unwrap();
        init_repo(repo_dir.path());
        let data_dir = tempfile::tempdir().unwrap();
        let state = test_state(repo_dir.path(), data_dir.path());

        let resp = send(state.clone(), Method::GET, "/agent/dispatcher", serde_json::Value::Null).await;
        let json = body_json(resp).await;
        assert_eq!(json["status"], "stopped");

        let resp = send(
            state.clone(),
            Method::POST,
            "/agent/dispatcher/start",
            serde_json::Value::Null,
        )
        .await;
        let json = body_json(resp).await;
        assert_eq!(json["status"], "running");

        let resp = send(
            state.clone(),
            Method::POST,
            "/agent/dispatcher/stop",
            serde_json::Value::Null,
        )
        .await;
        let json = body_json(resp).await;
        assert_eq!(json["status"], "stopped");
    }

    #[tokio::test]
    async fn worktrees_and_commits_endpoints_return_data() {
        let repo_dir = tempfile::tempdir().unwrap();
        init_repo(repo_dir.path());
        let data_dir = tempfile::tempdir().unwrap();
        let state = test_state(repo_dir.path(), data_dir.path());

        let resp = send(state.clone(), Method::GET, "/agent/worktrees", serde_json::Value::Null).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert!(json.as_array().unwrap().is_empty());

        let resp = send(state, Method::GET, "/agent/commits?count=5", serde_json::Value::Null).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let commits = json.as_array().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0]["subject"], "initial");
    }
}
