//! Per-queue runner — the cooperative scheduling loop.
//!
//! The loop selects ready tasks by priority under the concurrency cap and
//! spawns one invocation per dispatch. Loop and dispatches communicate
//! through two guarded maps: `running` (loop inserts on dispatch, the
//! background task clears itself on finish) and `completed` (background
//! writes the outcome, loop drains). All other per-queue state is touched
//! only by the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::invoker::invoke_agent;
use crate::agents::registry::AgentRegistry;
use crate::queue::events::TaskQueueEvent;
use crate::queue::model::{Queue, QueueStatus, TaskError, TaskResult, TaskStatus};
use crate::scheduler::RunnerControl;
use crate::store::traits::{QueueStore, TaskPatch};

/// Idle/pause poll tick.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Drain tick while waiting out still-running dispatches.
const DRAIN_INTERVAL: Duration = Duration::from_millis(25);

/// Exponential backoff ceiling.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// `retryDelay × 2^(attempt−1)`, capped.
pub(crate) fn retry_backoff(base_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    let millis = base_ms.saturating_mul(1u64 << shift);
    Duration::from_millis(millis).min(MAX_RETRY_DELAY)
}

struct RunningDispatch {
    cancel: CancellationToken,
}

enum DispatchOutcome {
    /// The invocation (or a cancelled retry timer) finished.
    Finished(Result<TaskResult, TaskError>),
    /// A retry backoff elapsed; the task goes back to pending.
    RetryDue,
}

/// Drives one queue to a terminal state. At most one runner per queue.
pub struct QueueRunner {
    queue: Queue,
    store: Arc<dyn QueueStore>,
    agents: Arc<AgentRegistry>,
    control: Arc<RunnerControl>,
    client: reqwest::Client,
    running: Arc<RwLock<HashMap<Uuid, RunningDispatch>>>,
    completed: Arc<RwLock<HashMap<Uuid, DispatchOutcome>>>,
}

impl QueueRunner {
    pub fn new(
        queue: Queue,
        store: Arc<dyn QueueStore>,
        agents: Arc<AgentRegistry>,
        control: Arc<RunnerControl>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            queue,
            store,
            agents,
            control,
            client,
            running: Arc::new(RwLock::new(HashMap::new())),
            completed: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Run the queue to a terminal state.
    pub async fn run(mut self) {
        let queue_id = self.queue.id;
        let now = Utc::now();
        let started_ts = if self.queue.started_at.is_none() {
            self.queue.started_at = Some(now);
            Some(now)
        } else {
            None
        };
        self.queue.status = QueueStatus::Running;
        if let Err(e) = self
            .store
            .update_queue_status(queue_id, QueueStatus::Running, started_ts)
            .await
        {
            error!(queue_id = %queue_id, error = %e, "Failed to persist running status");
        }
        self.publish(TaskQueueEvent::QueueStarted { queue_id }).await;
        info!(queue_id = %queue_id, name = %self.queue.name, "Queue execution started");

        let mut was_paused = false;
        loop {
            self.drain_completions().await;

            if self.control.is_stopped() {
                break;
            }

            if self.control.is_paused() {
                if !was_paused {
                    was_paused = true;
                    self.publish(TaskQueueEvent::QueuePaused { queue_id }).await;
                    info!(queue_id = %queue_id, "Queue paused");
                }
                // Running tasks continue to completion while paused.
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
            if was_paused {
                was_paused = false;
                self.publish(TaskQueueEvent::QueueResumed { queue_id }).await;
                info!(queue_id = %queue_id, "Queue resumed");
            }

            if !self.queue.has_unfinished_work() && self.running.read().await.is_empty() {
                break;
            }

            self.dispatch_ready().await;
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        self.finish().await;
    }

    /// Select ready tasks by priority (stable, insertion order breaks ties)
    /// and dispatch up to the free concurrency slots.
    async fn dispatch_ready(&mut self) {
        let available = {
            let running = self.running.read().await;
            self.queue
                .settings
                .max_concurrency
                .saturating_sub(running.len())
        };
        if available == 0 {
            return;
        }

        let mut candidates: Vec<(u8, Uuid)> = self
            .queue
            .tasks
            .iter()
            .filter(|t| t.status.is_ready())
            .map(|t| (t.priority, t.id))
            .collect();
        candidates.sort_by_key(|(priority, _)| *priority);

        for (_, task_id) in candidates.into_iter().take(available) {
            self.dispatch(task_id).await;
        }
    }

    /// Claim one task from the pending list and start its invocation.
    async fn dispatch(&mut self, task_id: Uuid) {
        let queue_id = self.queue.id;

        match self.store.claim_pending(queue_id, task_id).await {
            Ok(true) => {}
            Ok(false) => {
                // Someone else took the task (cancel request or a second
                // scheduler); refresh our copy and move on.
                debug!(queue_id = %queue_id, task_id = %task_id, "Pending claim lost");
                if let Ok(Some(fresh)) = self.store.load_task(task_id).await
                    && let Some(task) = self.queue.task_mut(task_id)
                {
                    *task = fresh;
                }
                return;
            }
            Err(e) => {
                warn!(queue_id = %queue_id, task_id = %task_id, error = %e, "Pending claim failed");
                return;
            }
        }

        let (agent_id, message, timeout) = match self.queue.task(task_id) {
            Some(task) => (
                task.agent_id.clone(),
                task.message.clone(),
                self.queue.settings.task_timeout(),
            ),
            None => return,
        };

        let Some(agent) = self.agents.get(&agent_id).cloned() else {
            let err = TaskError::execution(format!("agent {agent_id} not found"), false);
            self.fail_task(task_id, err).await;
            return;
        };

        let started = Utc::now();
        if let Some(task) = self.queue.task_mut(task_id) {
            task.status = TaskStatus::InProgress;
            task.started_at = Some(started);
        }
        if let Err(e) = self
            .store
            .update_task(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::InProgress),
                    started_at: Some(started),
                    ..TaskPatch::default()
                },
            )
            .await
        {
            warn!(task_id = %task_id, error = %e, "Failed to persist task start");
        }
        if let Err(e) = self.store.mark_agent_busy(&agent_id).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to mark agent busy");
        }
        self.publish(TaskQueueEvent::TaskStarted {
            queue_id,
            task_id,
            agent_id: agent_id.clone(),
        })
        .await;

        let cancel = self.control.stop_token().child_token();
        self.running.write().await.insert(
            task_id,
            RunningDispatch {
                cancel: cancel.clone(),
            },
        );

        let client = self.client.clone();
        let running = Arc::clone(&self.running);
        let completed = Arc::clone(&self.completed);
        tokio::spawn(async move {
            let outcome = invoke_agent(&client, &agent, &message, task_id, timeout, &cancel).await;
            completed
                .write()
                .await
                .insert(task_id, DispatchOutcome::Finished(outcome));
            running.write().await.remove(&task_id);
        });
    }

    /// Process every finished invocation and elapsed retry timer.
    async fn drain_completions(&mut self) {
        let finished: Vec<(Uuid, DispatchOutcome)> = {
            let mut completed = self.completed.write().await;
            completed.drain().collect()
        };
        for (task_id, outcome) in finished {
            match outcome {
                DispatchOutcome::Finished(result) => self.settle(task_id, result).await,
                DispatchOutcome::RetryDue => self.requeue_retried(task_id).await,
            }
        }
    }

    /// Apply one invocation outcome: complete, retry, or fail.
    async fn settle(&mut self, task_id: Uuid, result: Result<TaskResult, TaskError>) {
        let queue_id = self.queue.id;
        let Some((agent_id, retry_count, max_retries)) = self
            .queue
            .task(task_id)
            .map(|t| (t.agent_id.clone(), t.retry_count, t.max_retries))
        else {
            return;
        };

        if let Err(e) = self.store.mark_agent_available(&agent_id).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to mark agent available");
        }

        match result {
            Ok(result) => {
                let completed_at = result.completed_at;
                if let Some(task) = self.queue.task_mut(task_id) {
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(completed_at);
                    task.result = Some(result.clone());
                }
                if let Err(e) = self
                    .store
                    .update_task(
                        task_id,
                        TaskPatch {
                            status: Some(TaskStatus::Completed),
                            completed_at: Some(completed_at),
                            result: Some(result.clone()),
                            ..TaskPatch::default()
                        },
                    )
                    .await
                {
                    warn!(task_id = %task_id, error = %e, "Failed to persist task completion");
                }
                info!(queue_id = %queue_id, task_id = %task_id, "Task completed");
                self.publish(TaskQueueEvent::TaskCompleted {
                    queue_id,
                    task_id,
                    result,
                })
                .await;
            }
            Err(err) if err.retryable && retry_count < max_retries => {
                let attempt = retry_count + 1;
                if let Some(task) = self.queue.task_mut(task_id) {
                    task.status = TaskStatus::Retrying;
                    task.retry_count = attempt;
                }
                if let Err(e) = self
                    .store
                    .update_task(
                        task_id,
                        TaskPatch {
                            status: Some(TaskStatus::Retrying),
                            retry_count: Some(attempt),
                            ..TaskPatch::default()
                        },
                    )
                    .await
                {
                    warn!(task_id = %task_id, error = %e, "Failed to persist retry state");
                }
                info!(
                    queue_id = %queue_id,
                    task_id = %task_id,
                    attempt,
                    max_retries,
                    error = %err,
                    "Task retrying"
                );
                self.publish(TaskQueueEvent::TaskRetrying {
                    queue_id,
                    task_id,
                    attempt,
                    max_retries,
                })
                .await;
                self.schedule_retry(task_id, attempt);
            }
            Err(err) => self.fail_task(task_id, err).await,
        }
    }

    /// Start a backoff timer. When it elapses the task goes back to
    /// pending; a stop during the delay fails the task with an abort
    /// error instead of requeueing it.
    fn schedule_retry(&self, task_id: Uuid, attempt: u32) {
        let delay = retry_backoff(self.queue.settings.retry_delay, attempt);
        let stop = self.control.stop_token().clone();
        let completed = Arc::clone(&self.completed);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    completed.write().await.insert(task_id, DispatchOutcome::RetryDue);
                }
                _ = stop.cancelled() => {
                    completed.write().await.insert(
                        task_id,
                        DispatchOutcome::Finished(Err(TaskError::abort(
                            "queue stopped during retry delay",
                        ))),
                    );
                }
            }
        });
    }

    /// Move a retried task back to pending and onto the pending list.
    async fn requeue_retried(&mut self, task_id: Uuid) {
        let queue_id = self.queue.id;
        match self.queue.task_mut(task_id) {
            Some(task) if task.status == TaskStatus::Retrying => {
                task.status = TaskStatus::Pending;
            }
            _ => return,
        }
        if let Err(e) = self
            .store
            .update_task(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Pending),
                    ..TaskPatch::default()
                },
            )
            .await
        {
            warn!(task_id = %task_id, error = %e, "Failed to persist requeue");
        }
        if let Err(e) = self.store.requeue_task(queue_id, task_id).await {
            warn!(task_id = %task_id, error = %e, "Failed to requeue task");
        }
    }

    /// Mark a task permanently failed.
    async fn fail_task(&mut self, task_id: Uuid, err: TaskError) {
        let queue_id = self.queue.id;
        let completed_at = Utc::now();
        if let Some(task) = self.queue.task_mut(task_id) {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(completed_at);
            task.error = Some(err.clone());
        }
        if let Err(e) = self
            .store
            .update_task(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Failed),
                    completed_at: Some(completed_at),
                    error: Some(err.clone()),
                    ..TaskPatch::default()
                },
            )
            .await
        {
            warn!(task_id = %task_id, error = %e, "Failed to persist task failure");
        }
        warn!(queue_id = %queue_id, task_id = %task_id, error = %err, "Task failed");
        self.publish(TaskQueueEvent::TaskFailed {
            queue_id,
            task_id,
            error: err,
        })
        .await;
    }

    /// Drain outstanding work, recompute metrics from ground truth and
    /// emit the terminal queue event. Stop cancels dispatches through the
    /// child tokens; their abort errors arrive through the drain.
    async fn finish(&mut self) {
        let queue_id = self.queue.id;
        let stopped = self.control.is_stopped();

        if stopped {
            for dispatch in self.running.read().await.values() {
                dispatch.cancel.cancel();
            }
        }

        loop {
            self.drain_completions().await;
            let running_empty = self.running.read().await.is_empty();
            let retry_pending = self
                .queue
                .tasks
                .iter()
                .any(|t| t.status == TaskStatus::Retrying);
            if running_empty && !retry_pending {
                break;
            }
            tokio::time::sleep(DRAIN_INTERVAL).await;
        }
        self.drain_completions().await;

        let metrics = self.queue.recompute_metrics();
        if let Err(e) = self.store.update_queue_metrics(queue_id, &metrics).await {
            warn!(queue_id = %queue_id, error = %e, "Failed to persist final metrics");
        }

        let now = Utc::now();
        let (status, event) = if stopped {
            (
                QueueStatus::Failed,
                TaskQueueEvent::QueueFailed {
                    queue_id,
                    error: "Queue was stopped".to_string(),
                },
            )
        } else if metrics.failed_tasks > 0 {
            (
                QueueStatus::Failed,
                TaskQueueEvent::QueueFailed {
                    queue_id,
                    error: format!("{} task(s) failed", metrics.failed_tasks),
                },
            )
        } else {
            (
                QueueStatus::Completed,
                TaskQueueEvent::QueueCompleted {
                    queue_id,
                    metrics: metrics.clone(),
                },
            )
        };

        self.queue.status = status;
        self.queue.completed_at = Some(now);
        if let Err(e) = self
            .store
            .update_queue_status(queue_id, status, Some(now))
            .await
        {
            error!(queue_id = %queue_id, error = %e, "Failed to persist terminal status");
        }
        info!(
            queue_id = %queue_id,
            status = %status,
            completed = metrics.completed_tasks,
            failed = metrics.failed_tasks,
            "Queue execution finished"
        );
        self.publish(event).await;
    }

    async fn publish(&self, event: TaskQueueEvent) {
        if let Err(e) = self.store.publish_event(self.queue.id, &event).await {
            warn!(queue_id = %self.queue.id, error = %e, "Failed to publish event");
        }
    }
}
