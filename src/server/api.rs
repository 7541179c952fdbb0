use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use super::ws;
use crate::deploy::Deployer;
use crate::errors::{DeployError, JobError, LockError};
use crate::events::PullClosedExecutor;
use crate::jobs::OutputHandler;
use crate::locking::{CommandLocker, Locker, ProjectLocker};
use crate::models::{
    CommandName, DEFAULT_WORKSPACE, DeploymentRequest, Project, PullInfo, PullRequest, Root, Trigger, User,
};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub locker: Arc<dyn Locker>,
    pub project_locker: ProjectLocker,
    pub command_locker: CommandLocker,
    pub output: OutputHandler,
    pub pull_closed: PullClosedExecutor,
    pub deployer: Arc<Deployer>,
    /// Deployable roots from `[[roots]]`.
    pub roots: Vec<Root>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ClosePullRequest {
    pub repo_full_name: String,
    pub pull_num: u64,
}

#[derive(Deserialize)]
pub struct LockProjectRequest {
    pub repo_full_name: String,
    pub path: String,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    pub pull_num: u64,
    #[serde(default)]
    pub head_commit: String,
    pub user: String,
}

fn default_workspace() -> String {
    DEFAULT_WORKSPACE.to_string()
}

#[derive(Deserialize)]
pub struct CreateDeploymentRequest {
    pub repo_full_name: String,
    /// Name of a configured root.
    pub root: String,
    pub revision: String,
    #[serde(default)]
    pub rerun: bool,
    #[serde(default)]
    pub check_run_id: i64,
    #[serde(default)]
    pub trigger: Trigger,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<LockError> for ApiError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::InvalidKey { .. } => ApiError::BadRequest(e.to_string()),
            LockError::Backend(_) => {
                tracing::error!(error = %e, "lock backend failure");
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            JobError::AlreadyComplete { .. } => ApiError::BadRequest(e.to_string()),
            JobError::Storage(_) => ApiError::Internal(e.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/locks", get(list_locks).post(lock_project))
        .route("/api/locks/{*key}", get(get_lock).delete(delete_lock))
        .route(
            "/api/command-locks/{name}",
            get(get_command_lock)
                .post(create_command_lock)
                .delete(delete_command_lock),
        )
        .route("/api/pulls/close", post(close_pull))
        .route("/api/deployments", post(create_deployment))
        .route("/api/jobs/{job_id}", get(get_job))
        .route("/api/jobs/{job_id}/ws", get(ws::job_ws_handler))
        .route("/api/stats", get(stats))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_locks(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let locks = state.locker.list().await?;
    Ok(Json(locks))
}

async fn get_lock(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.locker.get_lock(&key).await? {
        Some(lock) => Ok(Json(lock)),
        None => Err(ApiError::NotFound(format!("No lock at {}", key))),
    }
}

async fn delete_lock(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.locker.unlock(&key).await? {
        Some(lock) => {
            tracing::info!(lock_key = %key, pull = lock.pull.num, "lock deleted via api");
            Ok(Json(lock))
        }
        None => Err(ApiError::NotFound(format!("No lock at {}", key))),
    }
}

fn command_name(name: &str) -> Result<CommandName, ApiError> {
    CommandName::from_str(name).map_err(ApiError::BadRequest)
}

async fn get_command_lock(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let command = command_name(&name)?;
    match state.command_locker.check(command).await? {
        Some(lock) => Ok(Json(lock)),
        None => Err(ApiError::NotFound(format!("{} is not locked", command))),
    }
}

async fn create_command_lock(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let command = command_name(&name)?;
    let (acquired, lock) = state.command_locker.lock(command).await?;
    let status = if acquired {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(lock)))
}

async fn delete_command_lock(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let command = command_name(&name)?;
    match state.command_locker.unlock(command).await? {
        Some(lock) => Ok(Json(lock)),
        None => Err(ApiError::NotFound(format!("{} is not locked", command))),
    }
}

fn check_repo_name(repo_full_name: &str) -> Result<(), ApiError> {
    let parts: Vec<&str> = repo_full_name.split('/').collect();
    if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
        return Err(ApiError::BadRequest(format!(
            "repo_full_name must be owner/repo, got {:?}",
            repo_full_name
        )));
    }
    Ok(())
}

async fn lock_project(
    State(state): State<SharedState>,
    Json(req): Json<LockProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_repo_name(&req.repo_full_name)?;
    if req.workspace.is_empty() {
        return Err(ApiError::BadRequest("workspace must not be empty".into()));
    }
    let pull = PullRequest {
        num: req.pull_num,
        repo_full_name: req.repo_full_name.clone(),
        head_commit: req.head_commit,
        author: req.user.clone(),
        ..Default::default()
    };
    let resp = state
        .project_locker
        .try_lock(
            Project::new(&req.repo_full_name, &req.path),
            &req.workspace,
            &pull,
            User::new(req.user),
        )
        .await?;
    let status = if resp.lock_acquired {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(serde_json::json!({
            "lock_acquired": resp.lock_acquired,
            "lock_failure_reason": resp.lock_failure_reason,
            "lock_key": resp.lock_key,
        })),
    ))
}

/// Queue a deploy of `revision` to a configured root. The deploy runs in
/// the background; its Terraform output streams under the returned job id.
async fn create_deployment(
    State(state): State<SharedState>,
    Json(req): Json<CreateDeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_repo_name(&req.repo_full_name)?;
    if req.revision.trim().is_empty() {
        return Err(ApiError::BadRequest("revision must not be empty".into()));
    }
    let root = state
        .roots
        .iter()
        .find(|r| r.name == req.root)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("Unknown root '{}'", req.root)))?;

    let mut request = DeploymentRequest::new(req.repo_full_name, root, req.revision);
    request.rerun = req.rerun;
    request.check_run_id = req.check_run_id;
    request.trigger = req.trigger;

    let body = serde_json::json!({
        "id": request.id,
        "job_id": request.job_id,
    });
    tracing::info!(
        root = %request.root.name,
        revision = %request.revision,
        job_id = %request.job_id,
        "deploy queued"
    );
    tokio::spawn(run_deployment(state.deployer.clone(), request));
    Ok((StatusCode::ACCEPTED, Json(body)))
}

async fn run_deployment(deployer: Arc<Deployer>, request: DeploymentRequest) {
    match deployer.deploy_latest(&request).await {
        Ok(deployed) => tracing::info!(
            root = %request.root.name,
            revision = %deployed.latest.revision,
            persisted = deployed.persisted.is_done(),
            "deploy finished"
        ),
        Err(DeployError::Validation(v)) => {
            tracing::info!(root = %request.root.name, revision = %request.revision, reason = %v, "deploy rejected")
        }
        Err(e) => tracing::error!(root = %request.root.name, revision = %request.revision, error = %e, "deploy failed"),
    }
}

async fn close_pull(
    State(state): State<SharedState>,
    Json(req): Json<ClosePullRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_repo_name(&req.repo_full_name)?;
    let pull = PullInfo {
        repo_full_name: req.repo_full_name,
        pull_num: req.pull_num,
    };
    let summary = state.pull_closed.clean_up_pull(&pull).await?;
    Ok(Json(summary))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (output, status) = state.output.job_output(&job_id).await?;
    Ok(Json(serde_json::json!({
        "job_id": job_id,
        "status": status,
        "output": output,
    })))
}

async fn stats(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.output.stats())
}

// ── Tests ─────────────────────────────────────────────────────────────
