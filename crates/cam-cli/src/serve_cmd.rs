//! HTTP server: the full API surface of SPEC_FULL.md §6.1.
//!
//! Grounded on the teacher's `serve_cmd.rs` (axum router/state/error shape),
//! generalized from a read-only plan dashboard into the read/write Task
//! Lifecycle, Dispatcher, Pipeline Expander, Worker Registry, and Event Bus
//! surface. `ApiError` wraps `CamError` instead of a bare status+message pair
//! so every response follows the `{success, data?, error?}` envelope.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use cam_core::adapters::{GitProvider, ProcessEnvSecretResolver};
use cam_core::dispatch;
use cam_core::error::CamError;
use cam_core::events::{event_type, EventFilter};
use cam_core::lifecycle;
use cam_core::pipeline::{self, PipelineRequest};
use cam_core::recovery;
use cam_core::worker;
use cam_core::EventBus;
use cam_db::models::{AgentCapabilities, AgentRuntime, RequiredEnvVar, Task, TaskSource, TaskStatus, WorkerMode};
use cam_db::queries::{agent_definitions, tasks as task_db, templates as template_db};

// ---------------------------------------------------------------------------
// App state and error envelope
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub bus: EventBus,
}

pub struct ApiError(CamError);

impl From<CamError> for ApiError {
    fn from(err: CamError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.0.code() {
            "INVALID_INPUT" => StatusCode::BAD_REQUEST,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "STATE_CONFLICT" => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut error = serde_json::json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        });
        if let Some(extra) = self.0.extra() {
            error["extra"] = extra.clone();
        }
        let body = serde_json::json!({
            "success": false,
            "error": error,
        });
        (status, Json(body)).into_response()
    }
}

fn ok<T: Serialize>(data: T) -> axum::response::Response {
    Json(serde_json::json!({"success": true, "data": data})).into_response()
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(pool: SqlitePool, bus: EventBus) -> Router {
    let state = AppState { pool, bus };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/tasks", post(create_task).get(list_tasks))
        .route("/api/tasks/{id}", get(get_task).patch(patch_task).delete(delete_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/rerun", post(rerun_task))
        .route("/api/tasks/{id}/review", post(review_task))
        .route("/api/task-groups/cancel", post(cancel_group))
        .route("/api/task-groups/rerun-failed", post(rerun_failed_group))
        .route("/api/task-groups/restart-from", post(restart_from_group))
        .route("/api/agent-definitions", post(create_agent_definition).get(list_agent_definitions))
        .route("/api/templates", post(create_template).get(list_templates))
        .route("/api/workers", post(register_worker))
        .route("/api/workers/{id}/heartbeat", post(worker_heartbeat))
        .route("/api/workers/{id}/next-task", get(worker_next_task))
        .route("/api/workers/{id}", patch(patch_worker))
        .route("/api/events", get(list_events))
        .route("/api/events/stream", get(stream_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_serve(pool: SqlitePool, bus: EventBus, bind: &str, port: u16) -> Result<()> {
    let app = build_router(pool, bus);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("cam serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("cam serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn healthz(State(state): State<AppState>) -> axum::response::Response {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => (StatusCode::OK, "ok").into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "migrating").into_response(),
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest {
    title: String,
    description: String,
    agent_definition_id: Option<Uuid>,
    repo_url: String,
    base_branch: String,
    work_branch: Option<String>,
    depends_on: Option<Vec<Uuid>>,
    group_id: Option<String>,
    template_id: Option<Uuid>,
    max_retries: Option<i32>,
}

async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<axum::response::Response, ApiError> {
    if let Some(template_id) = body.template_id {
        let template = template_db::get(&state.pool, template_id)
            .await
            .map_err(CamError::Internal)?
            .ok_or_else(|| CamError::not_found("template", template_id))?;

        if template.is_pipeline() {
            let request = PipelineRequest {
                repo_url: body.repo_url,
                base_branch: body.base_branch,
                work_branch_stem: body.work_branch.unwrap_or_else(|| "pipeline".to_string()),
                group_id: body.group_id,
                default_agent_definition_id: body.agent_definition_id,
            };
            let tasks = pipeline::expand(&state.pool, &state.bus, &template, &request).await?;
            let mut published = Vec::with_capacity(tasks.len());
            for task in &tasks {
                published.push(lifecycle::publish(&state.pool, &state.bus, task.id).await?);
            }
            return Ok(ok(published));
        }
    }

    let agent_definition_id = body
        .agent_definition_id
        .ok_or_else(|| CamError::InvalidInput("agentDefinitionId is required".into()))?;
    let max_retries = body.max_retries.unwrap_or(2);
    if !(0..=20).contains(&max_retries) {
        return Err(CamError::InvalidInput("maxRetries must be between 0 and 20".into()).into());
    }

    let id = Uuid::new_v4();
    let work_branch = body.work_branch.unwrap_or_else(|| format!("cam/{id}"));
    let new_task = task_db::NewTask {
        title: body.title,
        description: body.description,
        agent_definition_id,
        repo_url: body.repo_url,
        base_branch: body.base_branch,
        work_branch,
        max_retries,
        depends_on: body.depends_on.unwrap_or_default(),
        group_id: body.group_id,
        source: TaskSource::Scheduler,
    };
    let task = task_db::insert_task(&state.pool, &new_task)
        .await
        .map_err(CamError::Internal)?;
    let task = lifecycle::publish(&state.pool, &state.bus, task.id).await?;

    Ok(ok(task))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct TaskListQuery {
    status: Option<TaskStatus>,
    group_id: Option<String>,
    source: Option<TaskSource>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> Result<axum::response::Response, ApiError> {
    let filter = task_db::TaskFilter {
        status: query.status,
        group_id: query.group_id,
        source: query.source,
    };
    let tasks = task_db::list_tasks(&state.pool, &filter)
        .await
        .map_err(CamError::Internal)?;
    Ok(ok(tasks))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, ApiError> {
    let task = task_db::get_task(&state.pool, id)
        .await
        .map_err(CamError::Internal)?
        .ok_or_else(|| CamError::not_found("task", id))?;
    Ok(ok(task))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchTaskRequest {
    status: Option<TaskStatus>,
    summary: Option<String>,
    pr_url: Option<String>,
}

/// PATCH is a thin status-CAS surface over the Lifecycle primitives; it only
/// accepts the two mutations a worker can make unprompted (finish-success,
/// finish-fail). Cancel-state is a sink: PATCHes on a terminal task succeed
/// idempotently without changing anything.
async fn patch_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<PatchTaskRequest>,
) -> Result<axum::response::Response, ApiError> {
    let current = task_db::get_task(&state.pool, id)
        .await
        .map_err(CamError::Internal)?
        .ok_or_else(|| CamError::not_found("task", id))?;

    if current.status.is_terminal() {
        return Ok(ok(current));
    }

    let Some(target) = body.status else {
        return Ok(ok(current));
    };

    let task = match target {
        TaskStatus::Completed => {
            let task = lifecycle::finish_success(
                &state.pool,
                &state.bus,
                id,
                TaskStatus::Completed,
                body.summary.as_deref(),
                body.pr_url.as_deref(),
            )
            .await?;
            task
        }
        TaskStatus::AwaitingReview => {
            let task = lifecycle::finish_success(
                &state.pool,
                &state.bus,
                id,
                TaskStatus::AwaitingReview,
                body.summary.as_deref(),
                body.pr_url.as_deref(),
            )
            .await?;
            maybe_open_pull_request(&state, &task).await;
            task
        }
        TaskStatus::Failed => lifecycle::finish_fail(&state.pool, &state.bus, id).await?,
        _ => return Err(CamError::InvalidInput(format!("unsupported PATCH target status {target}")).into()),
    };

    Ok(ok(task))
}

/// Providers are not wired by default in this core; the orchestration exists
/// and falls back to `task.pr_skipped` until an operator supplies a concrete
/// `GitProvider` (see DESIGN.md).
async fn maybe_open_pull_request(state: &AppState, task: &Task) {
    if task.pr_url.is_some() {
        return;
    }
    let providers: HashMap<&str, Box<dyn GitProvider>> = HashMap::new();
    let secrets = ProcessEnvSecretResolver;
    let _ = cam_core::adapters::open_pull_request(
        &state.pool,
        &state.bus,
        &providers,
        &secrets,
        task,
        &HashMap::new(),
    )
    .await;
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, ApiError> {
    let live_dependents = task_db::count_live_dependents(&state.pool, id)
        .await
        .map_err(CamError::Internal)?;
    if live_dependents > 0 {
        return Err(CamError::state_conflict(id, "has live dependents", "no live dependents").into());
    }
    recovery::delete_task(&state.pool, id).await?;
    Ok((StatusCode::NO_CONTENT, ()).into_response())
}

#[derive(Debug, Deserialize, Default)]
struct ReasonBody {
    reason: Option<String>,
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ReasonBody>>,
) -> Result<axum::response::Response, ApiError> {
    let reason = body.and_then(|b| b.0.reason);
    let task = lifecycle::cancel(&state.pool, &state.bus, id, reason.as_deref(), None).await?;
    match task {
        Some(task) => Ok(ok(task)),
        None => Ok(ok(task_db::get_task(&state.pool, id).await.map_err(CamError::Internal)?)),
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RerunBody {
    feedback: Option<String>,
}

async fn rerun_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<RerunBody>>,
) -> Result<axum::response::Response, ApiError> {
    let feedback = body.and_then(|b| b.0.feedback);
    let task = lifecycle::rerun(&state.pool, &state.bus, id, feedback.as_deref()).await?;
    Ok(ok(task))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ReviewAction {
    Approve,
    Reject,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewBody {
    action: ReviewAction,
    #[serde(default)]
    merge: bool,
    feedback: Option<String>,
}

async fn review_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ReviewBody>,
) -> Result<axum::response::Response, ApiError> {
    let task = match body.action {
        ReviewAction::Approve => {
            let task = lifecycle::review_approve(&state.pool, &state.bus, id).await?;
            if body.merge {
                if let Some(_pr_url) = &task.pr_url {
                    // Merge is a best-effort follow-up; no provider is wired
                    // by default (see DESIGN.md), so this is a documented no-op.
                    tracing::info!(task_id = %id, "merge requested but no GitProvider is configured");
                }
            }
            task
        }
        ReviewAction::Reject => {
            let feedback = body
                .feedback
                .ok_or_else(|| CamError::InvalidInput("feedback is required to reject a review".into()))?;
            lifecycle::review_reject(&state.pool, &state.bus, id, &feedback).await?
        }
    };
    Ok(ok(task))
}

// ---------------------------------------------------------------------------
// Task groups
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupCancelBody {
    group_id: String,
    reason: Option<String>,
}

async fn cancel_group(
    State(state): State<AppState>,
    Json(body): Json<GroupCancelBody>,
) -> Result<axum::response::Response, ApiError> {
    let tasks = task_db::list_tasks_for_group(&state.pool, &body.group_id)
        .await
        .map_err(CamError::Internal)?;
    let mut cancelled = Vec::new();
    for task in tasks {
        if !task.status.is_terminal() {
            if let Some(task) =
                lifecycle::cancel(&state.pool, &state.bus, task.id, body.reason.as_deref(), None).await?
            {
                cancelled.push(task.id);
            }
        }
    }
    state
        .bus
        .emit(
            &state.pool,
            event_type::TASK_GROUP_CANCELLED,
            None,
            serde_json::json!({"groupId": body.group_id, "cancelled": cancelled}),
        )
        .await?;
    Ok(ok(serde_json::json!({"groupId": body.group_id, "cancelled": cancelled})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupRerunFailedBody {
    group_id: String,
    feedback: Option<String>,
}

async fn rerun_failed_group(
    State(state): State<AppState>,
    Json(body): Json<GroupRerunFailedBody>,
) -> Result<axum::response::Response, ApiError> {
    let tasks = task_db::list_tasks_for_group(&state.pool, &body.group_id)
        .await
        .map_err(CamError::Internal)?;
    let mut rerun = Vec::new();
    for task in tasks {
        if matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            let task = lifecycle::rerun(&state.pool, &state.bus, task.id, body.feedback.as_deref()).await?;
            rerun.push(task.id);
        }
    }
    state
        .bus
        .emit(
            &state.pool,
            event_type::TASK_GROUP_RERUN_FAILED,
            None,
            serde_json::json!({"groupId": body.group_id, "rerun": rerun}),
        )
        .await?;
    Ok(ok(serde_json::json!({"groupId": body.group_id, "rerun": rerun})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestartFromBody {
    group_id: String,
    from_task_id: Uuid,
}

async fn restart_from_group(
    State(state): State<AppState>,
    Json(body): Json<RestartFromBody>,
) -> Result<axum::response::Response, ApiError> {
    let restarted =
        lifecycle::restart_from(&state.pool, &state.bus, &body.group_id, body.from_task_id).await?;
    Ok(ok(serde_json::json!({"groupId": body.group_id, "restarted": restarted})))
}

// ---------------------------------------------------------------------------
// Agent definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAgentDefinitionRequest {
    display_name: String,
    docker_image: Option<String>,
    command: String,
    args: Vec<String>,
    required_env_vars: Vec<RequiredEnvVar>,
    #[serde(default)]
    capabilities: AgentCapabilities,
    #[serde(default)]
    runtime: AgentRuntime,
}

async fn create_agent_definition(
    State(state): State<AppState>,
    Json(body): Json<CreateAgentDefinitionRequest>,
) -> Result<axum::response::Response, ApiError> {
    let new = agent_definitions::NewAgentDefinition {
        display_name: body.display_name,
        docker_image: body.docker_image,
        command: body.command,
        args: body.args,
        required_env_vars: body.required_env_vars,
        capabilities: body.capabilities,
        runtime: body.runtime,
    };
    let definition = agent_definitions::insert(&state.pool, &new)
        .await
        .map_err(CamError::Internal)?;
    Ok(ok(definition))
}

async fn list_agent_definitions(State(state): State<AppState>) -> Result<axum::response::Response, ApiError> {
    let definitions = agent_definitions::list(&state.pool).await.map_err(CamError::Internal)?;
    Ok(ok(definitions))
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTemplateRequest {
    name: String,
    title_template: String,
    prompt_template: String,
    pipeline_steps: Option<Vec<cam_db::models::PipelineStep>>,
    default_agent_definition_id: Option<Uuid>,
    #[serde(default = "default_max_retries")]
    max_retries: i32,
}

fn default_max_retries() -> i32 {
    2
}

async fn create_template(
    State(state): State<AppState>,
    Json(body): Json<CreateTemplateRequest>,
) -> Result<axum::response::Response, ApiError> {
    if !(0..=20).contains(&body.max_retries) {
        return Err(CamError::InvalidInput("maxRetries must be between 0 and 20".into()).into());
    }
    if let Some(steps) = &body.pipeline_steps {
        if steps.len() < 2 {
            return Err(CamError::InvalidInput("pipelineSteps must have at least 2 steps".into()).into());
        }
    }

    let new = template_db::NewTemplate {
        name: body.name,
        title_template: body.title_template,
        prompt_template: body.prompt_template,
        pipeline_steps: body.pipeline_steps,
        default_agent_definition_id: body.default_agent_definition_id,
        max_retries: body.max_retries,
    };
    let template = template_db::insert(&state.pool, &new).await.map_err(CamError::Internal)?;
    Ok(ok(template))
}

async fn list_templates(State(state): State<AppState>) -> Result<axum::response::Response, ApiError> {
    let templates = template_db::list(&state.pool).await.map_err(CamError::Internal)?;
    Ok(ok(templates))
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterWorkerRequest {
    id: String,
    name: String,
    supported_agent_ids: Vec<Uuid>,
    #[serde(default = "default_max_concurrent")]
    max_concurrent: i32,
    #[serde(default)]
    mode: WorkerMode,
    #[serde(default)]
    reported_env_vars: Vec<String>,
}

fn default_max_concurrent() -> i32 {
    1
}

async fn register_worker(
    State(state): State<AppState>,
    Json(body): Json<RegisterWorkerRequest>,
) -> Result<axum::response::Response, ApiError> {
    let registered = worker::register(
        &state.pool,
        &state.bus,
        worker::Registration {
            id: body.id,
            name: body.name,
            supported_agent_ids: body.supported_agent_ids,
            max_concurrent: body.max_concurrent,
            mode: body.mode,
            reported_env_vars: body.reported_env_vars,
        },
    )
    .await?;
    Ok(ok(registered))
}

#[derive(Debug, Deserialize, Default)]
struct HeartbeatBody {
    #[allow(dead_code)]
    #[serde(flatten)]
    metrics: HashMap<String, serde_json::Value>,
}

async fn worker_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _body: Option<Json<HeartbeatBody>>,
) -> Result<axum::response::Response, ApiError> {
    worker::heartbeat(&state.pool, &id).await?;
    Ok((StatusCode::NO_CONTENT, ()).into_response())
}

async fn worker_next_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, ApiError> {
    let claimed = dispatch::next_task(&state.pool, &state.bus, &id, &ProcessEnvSecretResolver).await?;
    Ok(ok(claimed.map(|c| {
        serde_json::json!({
            "task": c.task,
            "agentDefinition": c.agent_definition,
            "env": c.env,
        })
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WorkerAction {
    Drain,
    Offline,
    Activate,
}

#[derive(Debug, Deserialize)]
struct PatchWorkerRequest {
    action: WorkerAction,
}

async fn patch_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PatchWorkerRequest>,
) -> Result<axum::response::Response, ApiError> {
    match body.action {
        WorkerAction::Drain => worker::drain(&state.pool, &state.bus, &id).await?,
        WorkerAction::Offline => worker::offline(&state.pool, &state.bus, &id).await?,
        WorkerAction::Activate => worker::activate(&state.pool, &state.bus, &id).await?,
    }
    let worker = worker::get(&state.pool, &id).await?;
    Ok(ok(worker))
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct EventQuery {
    #[serde(rename = "type")]
    type_prefix: Option<String>,
    task_id: Option<String>,
    group_id: Option<String>,
    since_id: Option<i64>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Result<axum::response::Response, ApiError> {
    let filter = cam_db::queries::events::EventFilter {
        type_prefix: query.type_prefix,
        task_id: query.task_id,
        group_id: query.group_id,
        since_id: query.since_id,
        limit: 200,
    };
    let events = cam_db::queries::events::list_events(&state.pool, &filter)
        .await
        .map_err(CamError::Internal)?;
    Ok(ok(events))
}

async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let filter = EventFilter {
        type_prefix: query.type_prefix,
        task_id: query.task_id,
        group_id: query.group_id,
    };
    let mut rx = state.bus.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if filter.matches(&event) {
                        let data = serde_json::to_string(&event.payload.0).unwrap_or_default();
                        yield Ok(SseEvent::default().event(event.event_type.clone()).data(data));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    // Re-subscribe from "now"; callers needing full history re-read the audit log.
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use cam_test_utils::create_test_pool;

    async fn send_json(
        pool: SqlitePool,
        bus: EventBus,
        method: &str,
        uri: &str,
        body: serde_json::Value,
    ) -> axum::response::Response {
        let app = super::build_router(pool, bus);
        app.oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_returns_ok_once_migrated() {
        let pool = create_test_pool().await;
        let bus = super::EventBus::default();
        let app = super::build_router(pool, bus);
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_task_without_agent_definition_is_invalid_input() {
        let pool = create_test_pool().await;
        let bus = super::EventBus::default();
        let resp = send_json(
            pool,
            bus,
            "POST",
            "/api/tasks",
            serde_json::json!({
                "title": "t",
                "description": "d",
                "repoUrl": "https://github.com/acme/widgets",
                "baseBranch": "main",
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn create_task_publishes_to_queued() {
        let pool = create_test_pool().await;
        let bus = super::EventBus::default();
        let definition = cam_db::queries::agent_definitions::insert(
            &pool,
            &cam_db::queries::agent_definitions::NewAgentDefinition {
                display_name: "echo".into(),
                docker_image: None,
                command: "echo".into(),
                args: vec![],
                required_env_vars: vec![],
                capabilities: Default::default(),
                runtime: cam_db::models::AgentRuntime::Native,
            },
        )
        .await
        .unwrap();

        let resp = send_json(
            pool,
            bus,
            "POST",
            "/api/tasks",
            serde_json::json!({
                "title": "t",
                "description": "d",
                "agentDefinitionId": definition.id,
                "repoUrl": "https://github.com/acme/widgets",
                "baseBranch": "main",
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"]["status"], "queued");
    }
}
