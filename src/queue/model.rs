//! Queue and task data model.
//!
//! Wire JSON uses camelCase field names with snake_case enum tags; all
//! timestamps travel as integer milliseconds since epoch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Created, never started.
    Idle,
    /// A scheduler is (or should be) driving the queue.
    Running,
    /// Dispatching is suspended; running tasks finish.
    Paused,
    /// All tasks terminal, none failed.
    Completed,
    /// At least one task failed, or execution was stopped.
    Failed,
}

impl QueueStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Queues in these states are re-normalized by crash recovery.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse the storage encoding produced by [`QueueStatus::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Awaiting dispatch.
    Pending,
    /// Synonym of pending before the scheduler observes the task.
    Queued,
    /// A dispatch is in flight.
    InProgress,
    /// Waiting out a retry backoff delay.
    Retrying,
    /// Finished successfully.
    Completed,
    /// Finished with a permanent error.
    Failed,
    /// Skipped by the user.
    Cancelled,
}

impl TaskStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Ready for dispatch selection.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Pending | Self::Queued)
    }

    /// In flight from the scheduler's point of view.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::InProgress | Self::Retrying)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the storage encoding produced by [`TaskStatus::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "in_progress" => Some(Self::InProgress),
            "retrying" => Some(Self::Retrying),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rough task size hint supplied by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Per-queue execution knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSettings {
    /// Cap on simultaneous dispatches.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Upper bound on retry attempts per task.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Base backoff in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Hard deadline for one dispatch, in milliseconds.
    #[serde(default = "default_timeout_per_task")]
    pub timeout_per_task: u64,
}

fn default_max_concurrency() -> usize {
    3
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    2_000
}
fn default_timeout_per_task() -> u64 {
    300_000
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            retry_count: default_retry_count(),
            retry_delay: default_retry_delay(),
            timeout_per_task: default_timeout_per_task(),
        }
    }
}

impl QueueSettings {
    /// Per-dispatch deadline as a [`Duration`].
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_per_task)
    }

    /// Base backoff as a [`Duration`].
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }
}

/// How a successful invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResultKind {
    /// The agent sent a terminating `done` frame.
    Success,
    /// The stream ended before a `done` frame; content may be incomplete.
    Partial,
}

/// Outcome of a successful task invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    #[serde(rename = "type")]
    pub kind: TaskResultKind,
    /// Aggregated assistant text content.
    pub content: String,
    /// Agent-side session id, when the agent reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(content: String, session_id: Option<String>) -> Self {
        Self {
            kind: TaskResultKind::Success,
            content,
            session_id,
            completed_at: Utc::now(),
        }
    }

    pub fn partial(content: String, session_id: Option<String>) -> Self {
        Self {
            kind: TaskResultKind::Partial,
            content,
            session_id,
            completed_at: Utc::now(),
        }
    }
}

/// Classification of a task invocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// Remote agent reported an error, bad auth, or a malformed response.
    Execution,
    /// Per-read or per-task deadline exceeded.
    Timeout,
    /// Transport failure or 5xx from the agent.
    Network,
    /// Cancellation observed.
    Abort,
}

impl TaskErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Abort => "abort",
        }
    }
}

/// A task invocation failure. The `retryable` classification is made by
/// the invoker and is final; the scheduler does not second-guess it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    #[serde(rename = "type")]
    pub kind: TaskErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub occurred_at: DateTime<Utc>,
}

impl TaskError {
    pub fn execution(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind: TaskErrorKind::Execution,
            message: message.into(),
            retryable,
            occurred_at: Utc::now(),
        }
    }

    /// Timeouts are always retryable.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Timeout,
            message: message.into(),
            retryable: true,
            occurred_at: Utc::now(),
        }
    }

    /// Network errors are always retryable.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Network,
            message: message.into(),
            retryable: true,
            occurred_at: Utc::now(),
        }
    }

    /// Aborts are never retryable.
    pub fn abort(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Abort,
            message: message.into(),
            retryable: false,
            occurred_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// One unit of work addressed to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub queue_id: Uuid,
    pub agent_id: String,
    /// The prompt payload.
    pub message: String,
    /// 1..=10, lower dispatches earlier.
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_complexity: Option<Complexity>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: TaskStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(
        queue_id: Uuid,
        agent_id: impl Into<String>,
        message: impl Into<String>,
        priority: u8,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue_id,
            agent_id: agent_id.into(),
            message: message.into(),
            priority,
            estimated_complexity: None,
            retry_count: 0,
            max_retries,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Wall-clock duration of the final attempt, when both endpoints exist.
    pub fn duration_ms(&self) -> Option<f64> {
        let (started, completed) = (self.started_at?, self.completed_at?);
        Some((completed - started).num_milliseconds() as f64)
    }
}

/// Derived but persisted metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub pending_tasks: u64,
    pub in_progress_tasks: u64,
    /// Mean completed-task duration in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_task_duration: Option<f64>,
}

/// A named unit of work owning an ordered collection of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: QueueStatus,
    pub settings: QueueSettings,
    pub metrics: QueueMetrics,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub completed_at: Option<DateTime<Utc>>,
    /// Tasks in insertion order.
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Queue {
    /// Create a new idle queue with no tasks.
    pub fn new(name: impl Into<String>, description: Option<String>, settings: QueueSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description,
            status: QueueStatus::Idle,
            settings,
            metrics: QueueMetrics::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            tasks: Vec::new(),
        }
    }

    pub fn task(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Any task still in {pending, queued, in_progress, retrying}?
    pub fn has_unfinished_work(&self) -> bool {
        self.tasks
            .iter()
            .any(|t| t.status.is_ready() || t.status.is_in_flight())
    }

    /// Recompute the metrics snapshot from ground-truth task statuses.
    pub fn recompute_metrics(&self) -> QueueMetrics {
        let mut metrics = QueueMetrics {
            total_tasks: self.tasks.len() as u64,
            ..QueueMetrics::default()
        };
        let mut durations: Vec<f64> = Vec::new();

        for task in &self.tasks {
            match task.status {
                TaskStatus::Completed => {
                    metrics.completed_tasks += 1;
                    if let Some(ms) = task.duration_ms() {
                        durations.push(ms);
                    }
                }
                TaskStatus::Failed => metrics.failed_tasks += 1,
                TaskStatus::InProgress => metrics.in_progress_tasks += 1,
                TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Retrying => {
                    metrics.pending_tasks += 1
                }
                TaskStatus::Cancelled => {}
            }
        }

        if !durations.is_empty() {
            metrics.average_task_duration =
                Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        metrics
    }
}

/// Lightweight queue summary for listing views.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub id: Uuid,
    pub name: String,
    pub status: QueueStatus,
    pub task_count: u64,
    pub completed_count: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}
