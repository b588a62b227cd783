//! Lifecycle events — the shared vocabulary carried over SSE and pub/sub.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::{QueueMetrics, TaskError, TaskResult};

/// Events emitted by the scheduler, serialized identically on the wire
/// and on the pub/sub channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TaskQueueEvent {
    QueueStarted {
        queue_id: Uuid,
    },
    QueuePaused {
        queue_id: Uuid,
    },
    QueueResumed {
        queue_id: Uuid,
    },
    QueueCompleted {
        queue_id: Uuid,
        metrics: QueueMetrics,
    },
    QueueFailed {
        queue_id: Uuid,
        error: String,
    },
    TaskStarted {
        queue_id: Uuid,
        task_id: Uuid,
        agent_id: String,
    },
    TaskCompleted {
        queue_id: Uuid,
        task_id: Uuid,
        result: TaskResult,
    },
    TaskFailed {
        queue_id: Uuid,
        task_id: Uuid,
        error: TaskError,
    },
    TaskRetrying {
        queue_id: Uuid,
        task_id: Uuid,
        attempt: u32,
        max_retries: u32,
    },
    /// Reserved for streaming partial content; not emitted yet.
    TaskProgress {
        queue_id: Uuid,
        task_id: Uuid,
        content: String,
    },
}

impl TaskQueueEvent {
    /// The serde tag (matches the SSE `event:` field).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueStarted { .. } => "queue_started",
            Self::QueuePaused { .. } => "queue_paused",
            Self::QueueResumed { .. } => "queue_resumed",
            Self::QueueCompleted { .. } => "queue_completed",
            Self::QueueFailed { .. } => "queue_failed",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskRetrying { .. } => "task_retrying",
            Self::TaskProgress { .. } => "task_progress",
        }
    }

    /// Get the queue ID from any variant.
    pub fn queue_id(&self) -> Uuid {
        match self {
            Self::QueueStarted { queue_id }
            | Self::QueuePaused { queue_id }
            | Self::QueueResumed { queue_id }
            | Self::QueueCompleted { queue_id, .. }
            | Self::QueueFailed { queue_id, .. }
            | Self::TaskStarted { queue_id, .. }
            | Self::TaskCompleted { queue_id, .. }
            | Self::TaskFailed { queue_id, .. }
            | Self::TaskRetrying { queue_id, .. }
            | Self::TaskProgress { queue_id, .. } => *queue_id,
        }
    }

    /// Whether this is a terminal queue event (completed or failed).
    pub fn is_queue_terminal(&self) -> bool {
        matches!(self, Self::QueueCompleted { .. } | Self::QueueFailed { .. })
    }
}
