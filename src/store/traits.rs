//! Backend-agnostic `QueueStore` trait — single async interface for queue
//! persistence, the pending list, the busy-agent set and event pub/sub.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::StoreError;
use crate::queue::events::TaskQueueEvent;
use crate::queue::model::{Queue, QueueMetrics, QueueStatus, QueueSummary, Task, TaskError,
    TaskResult, TaskStatus};

/// Partial task update. Unsupplied fields are left untouched by
/// [`QueueStore::update_task`].
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<TaskResult>,
    pub error: Option<TaskError>,
    pub retry_count: Option<u32>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.started_at.is_none()
            && self.completed_at.is_none()
            && self.result.is_none()
            && self.error.is_none()
            && self.retry_count.is_none()
    }
}

/// Durable persistence of queues, tasks, pending lists and the busy-agent
/// set, plus per-queue event pub/sub.
///
/// All scalar fields are stored as strings; the empty string encodes an
/// absent value so naive key/value backends work uniformly.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Backend name for diagnostics ("redis", "memory").
    fn backend(&self) -> &'static str;

    // ── Queues ──────────────────────────────────────────────────────

    /// Atomically persist queue metadata, all tasks, the task-id list and
    /// the initial pending list (ids of tasks in pending/queued).
    async fn save_queue(&self, queue: &Queue) -> Result<(), StoreError>;

    /// Reconstruct a queue including all tasks in insertion order.
    async fn load_queue(&self, id: Uuid) -> Result<Option<Queue>, StoreError>;

    /// Remove the queue, its tasks, task-id list, pending list and index
    /// entry.
    async fn delete_queue(&self, id: Uuid) -> Result<(), StoreError>;

    /// Lightweight summaries, sorted by creation time descending.
    async fn list_queues(&self) -> Result<Vec<QueueSummary>, StoreError>;

    /// Set queue status. With a timestamp: running sets `startedAt`,
    /// completed/failed set `completedAt`.
    async fn update_queue_status(
        &self,
        id: Uuid,
        status: QueueStatus,
        ts: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Overwrite the metrics snapshot.
    async fn update_queue_metrics(&self, id: Uuid, metrics: &QueueMetrics)
        -> Result<(), StoreError>;

    // ── Tasks ───────────────────────────────────────────────────────

    async fn save_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn load_task(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Merge the supplied subset of fields; never clears unsupplied ones.
    /// An empty patch is the identity.
    async fn update_task(&self, id: Uuid, patch: TaskPatch) -> Result<(), StoreError>;

    // ── Pending list ────────────────────────────────────────────────

    /// Atomically remove `task_id` from the queue's pending list. Returns
    /// whether the claim won; a lost claim means another scheduler (or a
    /// cancel request) took the task first.
    async fn claim_pending(&self, queue_id: Uuid, task_id: Uuid) -> Result<bool, StoreError>;

    /// Atomically push a task id back onto the pending list.
    async fn requeue_task(&self, queue_id: Uuid, task_id: Uuid) -> Result<(), StoreError>;

    /// Replace the pending list wholesale (recovery rebuild).
    async fn replace_pending(&self, queue_id: Uuid, task_ids: &[Uuid]) -> Result<(), StoreError>;

    // ── Busy agents ─────────────────────────────────────────────────

    async fn mark_agent_busy(&self, agent_id: &str) -> Result<(), StoreError>;

    async fn mark_agent_available(&self, agent_id: &str) -> Result<(), StoreError>;

    async fn busy_agents(&self) -> Result<Vec<String>, StoreError>;

    async fn clear_busy_agents(&self) -> Result<(), StoreError>;

    // ── Events ──────────────────────────────────────────────────────

    /// Deliver one event to all current subscribers of the queue's
    /// channel. Best-effort; no replay buffer.
    async fn publish_event(&self, queue_id: Uuid, event: &TaskQueueEvent)
        -> Result<(), StoreError>;

    /// Register a consumer on the queue's event channel.
    fn subscribe(&self, queue_id: Uuid) -> broadcast::Receiver<TaskQueueEvent>;

    // ── Recovery ────────────────────────────────────────────────────

    /// All queues whose persisted status is running or paused.
    async fn load_interrupted_queues(&self) -> Result<Vec<Queue>, StoreError>;

    /// Re-normalize an interrupted queue: status paused, in-flight tasks
    /// back to pending with `startedAt` cleared, pending list rebuilt from
    /// non-terminal tasks in insertion order, busy-agent set cleared.
    /// Idempotent.
    async fn reset_interrupted_queue(&self, id: Uuid) -> Result<(), StoreError> {
        let Some(mut queue) = self.load_queue(id).await? else {
            return Ok(());
        };

        for task in &mut queue.tasks {
            if task.status.is_in_flight() {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                self.save_task(task).await?;
            }
        }

        let pending: Vec<Uuid> = queue
            .tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id)
            .collect();
        self.replace_pending(id, &pending).await?;
        self.update_queue_status(id, QueueStatus::Paused, None).await?;
        self.clear_busy_agents().await?;
        Ok(())
    }
}
