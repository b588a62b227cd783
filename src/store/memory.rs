//! In-process queue store — the fallback backend when no redis endpoint is
//! configured or reachable. Same interface semantics as the redis backend,
//! minus persistence across restarts.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::StoreError;
use crate::queue::events::TaskQueueEvent;
use crate::queue::model::{Queue, QueueMetrics, QueueStatus, QueueSummary, Task, TaskStatus};
use crate::store::traits::{QueueStore, TaskPatch};

/// Default event channel capacity per queue.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// In-memory queue store using DashMap for concurrent access.
///
/// Queue metadata, tasks and the task-id lists live in sharded maps; the
/// per-queue pending list is a deque mutated under its shard lock, which
/// makes claim/requeue atomic within the process.
#[derive(Default)]
pub struct MemoryStore {
    queues: DashMap<Uuid, Queue>,
    tasks: DashMap<Uuid, Task>,
    task_ids: DashMap<Uuid, Vec<Uuid>>,
    pending: DashMap<Uuid, VecDeque<Uuid>>,
    busy: DashSet<String>,
    channels: DashMap<Uuid, broadcast::Sender<TaskQueueEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, queue_id: Uuid) -> broadcast::Sender<TaskQueueEvent> {
        self.channels
            .entry(queue_id)
            .or_insert_with(|| broadcast::channel(DEFAULT_BROADCAST_CAPACITY).0)
            .clone()
    }
}

fn apply_status(queue: &mut Queue, status: QueueStatus, ts: Option<DateTime<Utc>>) {
    queue.status = status;
    if let Some(ts) = ts {
        match status {
            QueueStatus::Running => queue.started_at = Some(ts),
            QueueStatus::Completed | QueueStatus::Failed => queue.completed_at = Some(ts),
            _ => {}
        }
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn save_queue(&self, queue: &Queue) -> Result<(), StoreError> {
        let mut meta = queue.clone();
        let tasks = std::mem::take(&mut meta.tasks);

        self.task_ids
            .insert(queue.id, tasks.iter().map(|t| t.id).collect());
        self.pending.insert(
            queue.id,
            tasks
                .iter()
                .filter(|t| t.status.is_ready())
                .map(|t| t.id)
                .collect(),
        );
        for task in tasks {
            self.tasks.insert(task.id, task);
        }
        self.queues.insert(queue.id, meta);
        Ok(())
    }

    async fn load_queue(&self, id: Uuid) -> Result<Option<Queue>, StoreError> {
        let Some(meta) = self.queues.get(&id).map(|q| q.clone()) else {
            return Ok(None);
        };
        let ids = self.task_ids.get(&id).map(|v| v.clone()).unwrap_or_default();

        let mut queue = meta;
        queue.tasks = ids
            .iter()
            .filter_map(|task_id| self.tasks.get(task_id).map(|t| t.clone()))
            .collect();
        Ok(Some(queue))
    }

    async fn delete_queue(&self, id: Uuid) -> Result<(), StoreError> {
        if let Some((_, ids)) = self.task_ids.remove(&id) {
            for task_id in ids {
                self.tasks.remove(&task_id);
            }
        }
        self.pending.remove(&id);
        self.queues.remove(&id);
        self.channels.remove(&id);
        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<QueueSummary>, StoreError> {
        let mut summaries: Vec<QueueSummary> = self
            .queues
            .iter()
            .map(|entry| {
                let queue = entry.value();
                let ids = self
                    .task_ids
                    .get(&queue.id)
                    .map(|v| v.clone())
                    .unwrap_or_default();
                let completed = ids
                    .iter()
                    .filter(|task_id| {
                        self.tasks
                            .get(task_id)
                            .is_some_and(|t| t.status == TaskStatus::Completed)
                    })
                    .count();
                QueueSummary {
                    id: queue.id,
                    name: queue.name.clone(),
                    status: queue.status,
                    task_count: ids.len() as u64,
                    completed_count: completed as u64,
                    created_at: queue.created_at,
                }
            })
            .collect();

        summaries.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        Ok(summaries)
    }

    async fn update_queue_status(
        &self,
        id: Uuid,
        status: QueueStatus,
        ts: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let Some(mut queue) = self.queues.get_mut(&id) else {
            return Err(StoreError::NotFound {
                entity: "queue",
                id: id.to_string(),
            });
        };
        apply_status(&mut queue, status, ts);
        Ok(())
    }

    async fn update_queue_metrics(
        &self,
        id: Uuid,
        metrics: &QueueMetrics,
    ) -> Result<(), StoreError> {
        let Some(mut queue) = self.queues.get_mut(&id) else {
            return Err(StoreError::NotFound {
                entity: "queue",
                id: id.to_string(),
            });
        };
        queue.metrics = metrics.clone();
        Ok(())
    }

    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn load_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.get(&id).map(|t| t.clone()))
    }

    async fn update_task(&self, id: Uuid, patch: TaskPatch) -> Result<(), StoreError> {
        let Some(mut task) = self.tasks.get_mut(&id) else {
            return Err(StoreError::NotFound {
                entity: "task",
                id: id.to_string(),
            });
        };
        if let Some(status) = patch.status {
            task.status = status;
        }
        if let Some(ts) = patch.started_at {
            task.started_at = Some(ts);
        }
        if let Some(ts) = patch.completed_at {
            task.completed_at = Some(ts);
        }
        if let Some(result) = patch.result {
            task.result = Some(result);
        }
        if let Some(error) = patch.error {
            task.error = Some(error);
        }
        if let Some(retry_count) = patch.retry_count {
            task.retry_count = retry_count;
        }
        Ok(())
    }

    async fn claim_pending(&self, queue_id: Uuid, task_id: Uuid) -> Result<bool, StoreError> {
        let Some(mut pending) = self.pending.get_mut(&queue_id) else {
            return Ok(false);
        };
        match pending.iter().position(|id| *id == task_id) {
            Some(pos) => {
                pending.remove(pos);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn requeue_task(&self, queue_id: Uuid, task_id: Uuid) -> Result<(), StoreError> {
        self.pending.entry(queue_id).or_default().push_back(task_id);
        Ok(())
    }

    async fn replace_pending(&self, queue_id: Uuid, task_ids: &[Uuid]) -> Result<(), StoreError> {
        self.pending
            .insert(queue_id, task_ids.iter().copied().collect());
        Ok(())
    }

    async fn mark_agent_busy(&self, agent_id: &str) -> Result<(), StoreError> {
        self.busy.insert(agent_id.to_string());
        Ok(())
    }

    async fn mark_agent_available(&self, agent_id: &str) -> Result<(), StoreError> {
        self.busy.remove(agent_id);
        Ok(())
    }

    async fn busy_agents(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.busy.iter().map(|a| a.clone()).collect())
    }

    async fn clear_busy_agents(&self) -> Result<(), StoreError> {
        self.busy.clear();
        Ok(())
    }

    async fn publish_event(
        &self,
        queue_id: Uuid,
        event: &TaskQueueEvent,
    ) -> Result<(), StoreError> {
        // Ok if no receivers are listening.
        let _ = self.channel(queue_id).send(event.clone());
        Ok(())
    }

    fn subscribe(&self, queue_id: Uuid) -> broadcast::Receiver<TaskQueueEvent> {
        self.channel(queue_id).subscribe()
    }

    async fn load_interrupted_queues(&self) -> Result<Vec<Queue>, StoreError> {
        let ids: Vec<Uuid> = self
            .queues
            .iter()
            .filter(|entry| entry.status.is_interrupted())
            .map(|entry| entry.id)
            .collect();

        let mut queues = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(queue) = self.load_queue(id).await? {
                queues.push(queue);
            }
        }
        Ok(queues)
    }
}
