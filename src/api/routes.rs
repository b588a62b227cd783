//! HTTP control surface — queue lifecycle endpoints and the SSE event
//! stream.
//!
//! `POST /start` spawns the scheduler for the queue; the stream endpoint
//! is a passive subscriber on the queue's event channel, so observers can
//! attach, detach and multiply without affecting execution.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::registry::AgentRegistry;
use crate::config::EngineConfig;
use crate::queue::model::{
    Complexity, Queue, QueueSettings, QueueStatus, Task, TaskStatus,
};
use crate::scheduler::{ActiveRunners, QueueRunner, RunnerControl};
use crate::store::traits::{QueueStore, TaskPatch};

/// Grace period for a stopping runner before a forced delete proceeds.
const STOP_GRACE: Duration = Duration::from_millis(200);

/// Shared state for the control API.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn QueueStore>,
    pub agents: Arc<AgentRegistry>,
    pub runners: Arc<ActiveRunners>,
    pub config: EngineConfig,
    pub client: reqwest::Client,
}

/// Build the control API router.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/api/queue", post(create_queue))
        .route("/api/queues", get(list_queues))
        .route("/api/queue/busy-agents", get(busy_agents))
        .route("/api/queue/stream/{id}", get(stream_queue))
        .route("/api/queue/{id}", get(get_queue).delete(delete_queue))
        .route("/api/queue/{id}/start", post(start_queue))
        .route("/api/queue/{id}/pause", post(pause_queue))
        .route("/api/queue/{id}/resume", post(resume_queue))
        .route("/api/queue/{id}/tasks/{task_id}/retry", post(retry_task))
        .route("/api/queue/{id}/tasks/{task_id}/cancel", post(cancel_task))
        .route("/api/health", get(health))
        .layer(middleware::from_fn(hygiene_headers))
        .with_state(state)
}

/// Every response carries no-cache and permissive CORS headers.
async fn hygiene_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn queue_not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Queue not found")
}

// ── Queue CRUD ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateQueueRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tasks: Vec<CreateTaskRequest>,
    #[serde(default)]
    settings: Option<QueueSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest {
    agent_id: String,
    message: String,
    #[serde(default = "default_priority")]
    priority: u8,
    #[serde(default)]
    estimated_complexity: Option<Complexity>,
    #[serde(default)]
    max_retries: Option<u32>,
}

fn default_priority() -> u8 {
    5
}

/// POST /api/queue
///
/// Create an idle queue from a name, a non-empty task list and optional
/// settings.
async fn create_queue(
    State(state): State<ApiState>,
    Json(request): Json<CreateQueueRequest>,
) -> Response {
    if request.name.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Queue name is required");
    }
    if request.tasks.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "At least one task is required");
    }
    if let Some(bad) = request
        .tasks
        .iter()
        .find(|t| !(1..=10).contains(&t.priority))
    {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("Task priority must be within 1..=10, got {}", bad.priority),
        );
    }

    let settings = request
        .settings
        .unwrap_or_else(|| state.config.default_settings());
    let mut queue = Queue::new(request.name.trim(), request.description, settings);
    for item in request.tasks {
        let max_retries = item.max_retries.unwrap_or(queue.settings.retry_count);
        let mut task = Task::new(queue.id, item.agent_id, item.message, item.priority, max_retries);
        task.estimated_complexity = item.estimated_complexity;
        queue.tasks.push(task);
    }

    if let Err(e) = state.store.save_queue(&queue).await {
        warn!(error = %e, "Failed to persist new queue");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist queue");
    }

    info!(queue_id = %queue.id, name = %queue.name, tasks = queue.tasks.len(), "Queue created");
    (
        StatusCode::CREATED,
        Json(json!({ "queueId": queue.id, "queue": queue })),
    )
        .into_response()
}

/// GET /api/queue/{id}
async fn get_queue(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.store.load_queue(id).await {
        Ok(Some(queue)) => Json(json!({ "queue": queue })).into_response(),
        Ok(None) => queue_not_found(),
        Err(e) => {
            warn!(queue_id = %id, error = %e, "Failed to load queue");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load queue")
        }
    }
}

/// GET /api/queues
async fn list_queues(State(state): State<ApiState>) -> Response {
    match state.store.list_queues().await {
        Ok(queues) => Json(json!({ "queues": queues })).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to list queues");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list queues")
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    #[serde(default)]
    force: bool,
}

/// DELETE /api/queue/{id}?force=true|false
///
/// Deleting a running queue requires force, which stops the active
/// scheduler first.
async fn delete_queue(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(params): Query<DeleteParams>,
) -> Response {
    let queue = match state.store.load_queue(id).await {
        Ok(Some(queue)) => queue,
        Ok(None) => return queue_not_found(),
        Err(e) => {
            warn!(queue_id = %id, error = %e, "Failed to load queue");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load queue");
        }
    };

    if queue.status == QueueStatus::Running && !params.force {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Queue is running; pass force=true to delete it",
        );
    }

    if let Some(control) = state.runners.remove(id) {
        control.stop();
        tokio::time::sleep(STOP_GRACE).await;
    }

    if let Err(e) = state.store.delete_queue(id).await {
        warn!(queue_id = %id, error = %e, "Failed to delete queue");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete queue");
    }

    info!(queue_id = %id, "Queue deleted");
    Json(json!({ "queueId": id, "deleted": true })).into_response()
}

// ── Execution control ───────────────────────────────────────────────

/// Spawn a runner for the queue unless one is already live.
fn spawn_runner(state: &ApiState, queue: Queue) -> bool {
    let queue_id = queue.id;
    let control = Arc::new(RunnerControl::new());
    if !state.runners.try_insert(queue_id, Arc::clone(&control)) {
        return false;
    }

    let runner = QueueRunner::new(
        queue,
        Arc::clone(&state.store),
        Arc::clone(&state.agents),
        control,
        state.client.clone(),
    );
    let runners = Arc::clone(&state.runners);
    tokio::spawn(async move {
        runner.run().await;
        runners.remove(queue_id);
    });
    true
}

/// POST /api/queue/{id}/start
///
/// Begins execution; the stream endpoint only observes it.
async fn start_queue(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    let queue = match state.store.load_queue(id).await {
        Ok(Some(queue)) => queue,
        Ok(None) => return queue_not_found(),
        Err(e) => {
            warn!(queue_id = %id, error = %e, "Failed to load queue");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load queue");
        }
    };

    if queue.status == QueueStatus::Running || state.runners.contains(id) {
        return error_response(StatusCode::BAD_REQUEST, "Queue is already running");
    }

    if !spawn_runner(&state, queue) {
        return error_response(StatusCode::BAD_REQUEST, "Queue is already running");
    }
    Json(json!({
        "queueId": id,
        "status": "running",
        "streamUrl": format!("/api/queue/stream/{id}"),
    }))
    .into_response()
}

/// POST /api/queue/{id}/pause
///
/// No new dispatches begin while paused; running tasks finish.
async fn pause_queue(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.store.load_queue(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return queue_not_found(),
        Err(e) => {
            warn!(queue_id = %id, error = %e, "Failed to load queue");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load queue");
        }
    }

    if let Some(control) = state.runners.get(id) {
        control.pause();
    }
    if let Err(e) = state
        .store
        .update_queue_status(id, QueueStatus::Paused, None)
        .await
    {
        warn!(queue_id = %id, error = %e, "Failed to persist paused status");
    }
    Json(json!({ "queueId": id, "status": "paused" })).into_response()
}

/// POST /api/queue/{id}/resume
///
/// Resumes the live runner, or spawns a fresh one for queues paused by
/// crash recovery.
async fn resume_queue(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    let queue = match state.store.load_queue(id).await {
        Ok(Some(queue)) => queue,
        Ok(None) => return queue_not_found(),
        Err(e) => {
            warn!(queue_id = %id, error = %e, "Failed to load queue");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load queue");
        }
    };

    match state.runners.get(id) {
        Some(control) => {
            control.resume();
            if let Err(e) = state
                .store
                .update_queue_status(id, QueueStatus::Running, None)
                .await
            {
                warn!(queue_id = %id, error = %e, "Failed to persist running status");
            }
        }
        None => {
            spawn_runner(&state, queue);
        }
    }
    Json(json!({ "queueId": id, "status": "running" })).into_response()
}

// ── Task control ────────────────────────────────────────────────────

/// POST /api/queue/{id}/tasks/{task_id}/retry
///
/// Reset a task to pending with a clean slate and requeue it.
async fn retry_task(
    State(state): State<ApiState>,
    Path((id, task_id)): Path<(Uuid, Uuid)>,
) -> Response {
    let mut task = match state.store.load_task(task_id).await {
        Ok(Some(task)) if task.queue_id == id => task,
        Ok(_) => return error_response(StatusCode::NOT_FOUND, "Task not found"),
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Failed to load task");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load task");
        }
    };

    task.status = TaskStatus::Pending;
    task.retry_count = 0;
    task.result = None;
    task.error = None;
    task.started_at = None;
    task.completed_at = None;

    if let Err(e) = state.store.save_task(&task).await {
        warn!(task_id = %task_id, error = %e, "Failed to persist task reset");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to reset task");
    }
    if let Err(e) = state.store.requeue_task(id, task_id).await {
        warn!(task_id = %task_id, error = %e, "Failed to requeue task");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to requeue task");
    }

    info!(queue_id = %id, task_id = %task_id, "Task reset for retry");
    Json(json!({ "task": task })).into_response()
}

/// POST /api/queue/{id}/tasks/{task_id}/cancel
///
/// User skip: only tasks still awaiting dispatch can be cancelled.
async fn cancel_task(
    State(state): State<ApiState>,
    Path((id, task_id)): Path<(Uuid, Uuid)>,
) -> Response {
    let mut task = match state.store.load_task(task_id).await {
        Ok(Some(task)) if task.queue_id == id => task,
        Ok(_) => return error_response(StatusCode::NOT_FOUND, "Task not found"),
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Failed to load task");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load task");
        }
    };

    if !task.status.is_ready() {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("Cannot cancel task in status {}", task.status),
        );
    }

    // Take the task off the pending list so no scheduler dispatches it.
    if let Err(e) = state.store.claim_pending(id, task_id).await {
        warn!(task_id = %task_id, error = %e, "Failed to unqueue cancelled task");
    }

    let completed_at = Utc::now();
    task.status = TaskStatus::Cancelled;
    task.completed_at = Some(completed_at);
    if let Err(e) = state
        .store
        .update_task(
            task_id,
            TaskPatch {
                status: Some(TaskStatus::Cancelled),
                completed_at: Some(completed_at),
                ..TaskPatch::default()
            },
        )
        .await
    {
        warn!(task_id = %task_id, error = %e, "Failed to persist cancellation");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to cancel task");
    }

    info!(queue_id = %id, task_id = %task_id, "Task cancelled");
    Json(json!({ "task": task })).into_response()
}

// ── Observation ─────────────────────────────────────────────────────

/// GET /api/queue/stream/{id}
///
/// Server-Sent-Events bound to the queue's event channel. Closes after
/// the terminal queue event; disconnecting never affects execution.
async fn stream_queue(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.store.load_queue(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return queue_not_found(),
        Err(e) => {
            warn!(queue_id = %id, error = %e, "Failed to load queue");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load queue");
        }
    }

    let rx = state.store.subscribe(id);
    info!(queue_id = %id, "Event stream subscriber attached");

    let sse = Sse::new(event_stream(rx)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    );
    (
        [(HeaderName::from_static("x-accel-buffering"), "no")],
        sse,
    )
        .into_response()
}

/// Bridge a broadcast receiver into an SSE event stream, ending after
/// the terminal queue event.
fn event_stream(
    rx: broadcast::Receiver<crate::queue::events::TaskQueueEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold((rx, false), |(mut rx, done)| async move {
        if done {
            return None;
        }
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let terminal = event.is_queue_terminal();
                    match Event::default().event(event.kind()).json_data(&event) {
                        Ok(sse_event) => return Some((Ok(sse_event), (rx, terminal))),
                        Err(e) => {
                            warn!(error = %e, "Failed to serialize event for SSE");
                            continue;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "SSE subscriber lagged behind the event channel");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

/// GET /api/queue/busy-agents
async fn busy_agents(State(state): State<ApiState>) -> Response {
    match state.store.busy_agents().await {
        Ok(agents) => Json(json!({ "busyAgents": agents })).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to read busy agents");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read busy agents")
        }
    }
}

/// GET /api/health
async fn health(State(state): State<ApiState>) -> Response {
    Json(json!({ "status": "ok", "store": state.store.backend() })).into_response()
}
