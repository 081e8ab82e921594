use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use loglens_core::error::LoglensError;
use loglens_core::traits::LogSource;
use loglens_core::types::{JobPayload, LogBundle, LogSelector, LogType};
use loglens_store::{Computer, NewTask, Task, TaskUpdate, MAX_TASK_CHARTS};

use crate::auth::{self, AuthResult};
use crate::middleware::Authenticated;
use crate::state::AppState;

type ApiResult = Result<Json<Value>, StatusCode>;
type CreatedResult = Result<(StatusCode, Json<Value>), StatusCode>;

fn internal(e: LoglensError) -> StatusCode {
    error!(error = %e, "Request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn require_viewer(auth: &AuthResult) -> Result<(), StatusCode> {
    if auth::has_viewer_access(&auth.role) {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

fn require_operator(auth: &AuthResult) -> Result<(), StatusCode> {
    if auth::has_operator_access(&auth.role) {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

/// Signed-in users only see their own computers; key holders see all.
fn visible_computer(state: &AppState, auth: &AuthResult, id: i64) -> Result<Computer, StatusCode> {
    let computer = state
        .store
        .get_computer(id)
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    match auth.user_id {
        Some(user) if computer.owner_id != Some(user) => Err(StatusCode::NOT_FOUND),
        _ => Ok(computer),
    }
}

// GET /api/health, no auth required
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Users ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SignupBody {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub organization: String,
}

// POST /api/users/signup, no auth required
pub async fn signup(State(state): State<Arc<AppState>>, Json(body): Json<SignupBody>) -> CreatedResult {
    let email = body.email.trim();
    if !email.contains('@') || body.password.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    match state
        .store
        .create_user(email, &body.password, body.organization.trim())
        .map_err(internal)?
    {
        Some(user) => Ok((StatusCode::CREATED, Json(json!(user)))),
        None => Err(StatusCode::CONFLICT),
    }
}

#[derive(Deserialize)]
pub struct SigninBody {
    pub email: String,
    pub password: String,
}

// POST /api/users/signin, no auth required
pub async fn signin(State(state): State<Arc<AppState>>, Json(body): Json<SigninBody>) -> ApiResult {
    let Some(user) = state
        .store
        .verify_user(body.email.trim(), &body.password)
        .map_err(internal)?
    else {
        warn!("Sign-in rejected");
        return Err(StatusCode::UNAUTHORIZED);
    };
    let token = state
        .store
        .issue_token(user.id, state.config.token_ttl_minutes)
        .map_err(internal)?;
    info!(user_id = user.id, "User signed in");
    Ok(Json(json!({
        "access_token": token.token,
        "token_type": "bearer",
        "expires_at": token.expires_at,
    })))
}

// ── Computers ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ComputerBody {
    pub name: String,
}

// GET /api/computers, requires Viewer+
pub async fn list_computers(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
) -> ApiResult {
    require_viewer(&auth_result)?;
    let computers = state
        .store
        .list_computers(auth_result.user_id)
        .map_err(internal)?;
    Ok(Json(json!({ "computers": computers })))
}

// POST /api/computers, requires Operator+
pub async fn create_computer(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ComputerBody>,
) -> CreatedResult {
    require_operator(&auth_result)?;
    let name = body.name.trim();
    if name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let computer = state
        .store
        .create_computer(name, auth_result.user_id)
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(json!(computer))))
}

// GET /api/computers/:id, requires Viewer+
pub async fn get_computer(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult {
    require_viewer(&auth_result)?;
    let computer = visible_computer(&state, &auth_result, id)?;
    Ok(Json(json!(computer)))
}

// PUT /api/computers/:id, requires Operator+
pub async fn update_computer(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<ComputerBody>,
) -> ApiResult {
    require_operator(&auth_result)?;
    visible_computer(&state, &auth_result, id)?;
    let name = body.name.trim();
    if name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let computer = state
        .store
        .update_computer(id, name)
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!(computer)))
}

// DELETE /api/computers/:id, requires Operator+
pub async fn delete_computer(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    require_operator(&auth_result)?;
    visible_computer(&state, &auth_result, id)?;
    if state.store.delete_computer(id).map_err(internal)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

// GET /api/computers/:id/tasks, requires Viewer+
pub async fn computer_tasks(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult {
    require_viewer(&auth_result)?;
    visible_computer(&state, &auth_result, id)?;
    let tasks = state.store.list_tasks(id).map_err(internal)?;
    Ok(Json(json!({ "tasks": tasks })))
}

// ── Tasks ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateTaskBody {
    pub computer_id: i64,
    pub task_type: String,
    /// Inline records. Without them the job collects the staged bundle for `start..end`.
    #[serde(default)]
    pub logs: Option<Vec<Value>>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_id: Option<i64>,
}

// POST /api/tasks, requires Operator+; runs one forensic job
pub async fn create_task(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTaskBody>,
) -> CreatedResult {
    require_operator(&auth_result)?;
    let computer = visible_computer(&state, &auth_result, body.computer_id)?;
    let log_type = LogType::parse(&body.task_type).ok_or(StatusCode::BAD_REQUEST)?;

    let mut payload = match (body.logs, body.start, body.end) {
        (Some(logs), _, _) => JobPayload::inline(log_type, logs),
        (None, Some(start), Some(end)) if start <= end => JobPayload::staged(LogSelector {
            computer_id: computer.id,
            user_id: body
                .user_id
                .or(auth_result.user_id)
                .or(computer.owner_id)
                .unwrap_or_default(),
            log_type,
            start,
            end,
        }),
        _ => return Err(StatusCode::BAD_REQUEST),
    };
    payload.computer_id = Some(computer.id);

    info!(computer_id = computer.id, %log_type, caller = %auth_result.name, "Starting forensic job");
    let result = state
        .team
        .start_job(payload, state.shutdown.child_token())
        .await;

    if !result.is_completed() {
        let reason = result.failure_reason.clone().unwrap_or_default();
        warn!(job_id = %result.job_id, %reason, "Forensic job failed");
        return Ok((
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "status": "failed",
                "job_id": result.job_id,
                "reason": reason,
                "detail": result.partial.as_ref().and_then(|p| p.detail.clone()),
            })),
        ));
    }

    let task = state
        .store
        .create_task(&NewTask {
            computer_id: computer.id,
            task_type: log_type,
            analysis_result: result.summary.as_deref().map(|s| s.trim().to_string()),
            charts: result.images.iter().take(MAX_TASK_CHARTS).cloned().collect(),
        })
        .map_err(internal)?;
    info!(job_id = %result.job_id, task_id = task.id, "Task stored");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "job_id": result.job_id, "task": task })),
    ))
}

fn visible_task(
    state: &AppState,
    auth: &AuthResult,
    id: i64,
) -> Result<Task, StatusCode> {
    let task = state
        .store
        .get_task(id)
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    visible_computer(state, auth, task.computer_id)?;
    Ok(task)
}

// GET /api/tasks/:id, requires Viewer+
pub async fn get_task(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult {
    require_viewer(&auth_result)?;
    let task = visible_task(&state, &auth_result, id)?;
    Ok(Json(json!(task)))
}

// PUT /api/tasks/:id, requires Operator+
pub async fn update_task(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(update): Json<TaskUpdate>,
) -> ApiResult {
    require_operator(&auth_result)?;
    visible_task(&state, &auth_result, id)?;
    let task = state
        .store
        .update_task(id, &update)
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!(task)))
}

// DELETE /api/tasks/:id, requires Operator+
pub async fn delete_task(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    require_operator(&auth_result)?;
    visible_task(&state, &auth_result, id)?;
    if state.store.delete_task(id).map_err(internal)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

#[derive(Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

// GET /api/search?q=...&limit=10, requires Viewer+
pub async fn search(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Query(q): Query<SearchQuery>,
) -> ApiResult {
    require_viewer(&auth_result)?;
    let hits = state
        .store
        .search_tasks(&q.q, q.limit.min(100))
        .map_err(internal)?;
    Ok(Json(json!({ "hits": hits })))
}

// ── Staged logs ─────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct StageLogsBody {
    pub selector: LogSelector,
    pub records: Vec<Value>,
}

// POST /api/logs, requires Operator+
pub async fn stage_logs(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Json(body): Json<StageLogsBody>,
) -> CreatedResult {
    require_operator(&auth_result)?;
    visible_computer(&state, &auth_result, body.selector.computer_id)?;
    let bundle = LogBundle::new(body.records);
    let url = state
        .staged
        .stage(&body.selector, &bundle)
        .await
        .map_err(internal)?;
    info!(key = %body.selector.staged_key(), records = bundle.len(), "Logs staged");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "key": body.selector.staged_key(),
            "url": url,
            "records": bundle.len(),
        })),
    ))
}

// POST /api/logs/query, requires Viewer+
pub async fn query_logs(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Json(selector): Json<LogSelector>,
) -> ApiResult {
    require_viewer(&auth_result)?;
    visible_computer(&state, &auth_result, selector.computer_id)?;
    match state.staged.fetch_logs(&selector).await {
        Ok(bundle) => Ok(Json(json!({ "records": bundle.records }))),
        Err(LoglensError::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(internal(e)),
    }
}

// GET /api/graph, requires Viewer+
pub async fn graph(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
) -> ApiResult {
    require_viewer(&auth_result)?;
    Ok(Json(json!(state.team.describe())))
}
