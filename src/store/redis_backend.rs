//! Redis queue store using an async connection pool.
//!
//! # Data structures
//!
//! - `queue:{id}` (HASH): queue metadata; settings/metrics nested as JSON
//! - `queue:tasks:{id}` (LIST): task ids in insertion order
//! - `task:{id}` (HASH): task record; result/error nested as JSON
//! - `queue:pending:{id}` (LIST): FIFO of task ids awaiting dispatch
//! - `busy_agents` (SET): agent ids currently executing a task
//! - `queues` (ZSET): queue index, score = createdAt millis
//! - `queue:events:{id}` (PUB/SUB): lifecycle events, no persisted messages
//!
//! Scalar fields are stored as strings; the empty string encodes an absent
//! value. Multi-key writes go through atomic pipelines.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::StoreError;
use crate::queue::events::TaskQueueEvent;
use crate::queue::model::{
    Complexity, Queue, QueueMetrics, QueueSettings, QueueStatus, QueueSummary, Task, TaskStatus,
};
use crate::store::traits::{QueueStore, TaskPatch};

/// Default event channel capacity per queue (in-process subscribers).
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

const BUSY_AGENTS_KEY: &str = "busy_agents";
const QUEUES_INDEX_KEY: &str = "queues";

/// Redis-backed queue store.
///
/// Events are fanned out to in-process subscribers over per-queue broadcast
/// channels and mirrored with `PUBLISH` on `queue:events:{id}` so external
/// observers can `SUBSCRIBE` directly.
pub struct RedisStore {
    pool: Pool,
    channels: DashMap<Uuid, broadcast::Sender<TaskQueueEvent>>,
}

impl RedisStore {
    /// Connect to redis and verify the backend is reachable.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self {
            pool,
            channels: DashMap::new(),
        };
        let mut conn = store.get_connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(store)
    }

    async fn get_connection(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    fn channel(&self, queue_id: Uuid) -> broadcast::Sender<TaskQueueEvent> {
        self.channels
            .entry(queue_id)
            .or_insert_with(|| broadcast::channel(DEFAULT_BROADCAST_CAPACITY).0)
            .clone()
    }

    fn queue_key(id: Uuid) -> String {
        format!("queue:{id}")
    }

    fn queue_tasks_key(id: Uuid) -> String {
        format!("queue:tasks:{id}")
    }

    fn task_key(id: Uuid) -> String {
        format!("task:{id}")
    }

    fn pending_key(id: Uuid) -> String {
        format!("queue:pending:{id}")
    }

    fn events_channel(id: Uuid) -> String {
        format!("queue:events:{id}")
    }
}

// ── Row encoding ────────────────────────────────────────────────────

fn encode_opt_ms(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.timestamp_millis().to_string()).unwrap_or_default()
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn queue_pairs(queue: &Queue) -> Result<Vec<(String, String)>, StoreError> {
    Ok(vec![
        ("id".into(), queue.id.to_string()),
        ("name".into(), queue.name.clone()),
        (
            "description".into(),
            queue.description.clone().unwrap_or_default(),
        ),
        ("status".into(), queue.status.as_str().into()),
        ("settings".into(), encode_json(&queue.settings)?),
        ("metrics".into(), encode_json(&queue.metrics)?),
        (
            "created_at".into(),
            queue.created_at.timestamp_millis().to_string(),
        ),
        ("started_at".into(), encode_opt_ms(queue.started_at)),
        ("completed_at".into(), encode_opt_ms(queue.completed_at)),
    ])
}

fn task_pairs(task: &Task) -> Result<Vec<(String, String)>, StoreError> {
    Ok(vec![
        ("id".into(), task.id.to_string()),
        ("queue_id".into(), task.queue_id.to_string()),
        ("agent_id".into(), task.agent_id.clone()),
        ("message".into(), task.message.clone()),
        ("priority".into(), task.priority.to_string()),
        (
            "estimated_complexity".into(),
            task.estimated_complexity
                .map(|c| c.as_str().to_string())
                .unwrap_or_default(),
        ),
        ("retry_count".into(), task.retry_count.to_string()),
        ("max_retries".into(), task.max_retries.to_string()),
        ("status".into(), task.status.as_str().into()),
        (
            "created_at".into(),
            task.created_at.timestamp_millis().to_string(),
        ),
        ("started_at".into(), encode_opt_ms(task.started_at)),
        ("completed_at".into(), encode_opt_ms(task.completed_at)),
        (
            "result".into(),
            task.result.as_ref().map(encode_json).transpose()?.unwrap_or_default(),
        ),
        (
            "error".into(),
            task.error.as_ref().map(encode_json).transpose()?.unwrap_or_default(),
        ),
    ])
}

fn field<'a>(map: &'a HashMap<String, String>, key: &str) -> Result<&'a str, StoreError> {
    map.get(key)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Serialization(format!("missing field {key}")))
}

fn parse_ms(raw: &str, key: &str) -> Result<DateTime<Utc>, StoreError> {
    let millis: i64 = raw
        .parse()
        .map_err(|_| StoreError::Serialization(format!("invalid timestamp in {key}: {raw}")))?;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range in {key}")))
}

fn opt_ms(map: &HashMap<String, String>, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    match map.get(key).map(String::as_str) {
        None | Some("") => Ok(None),
        Some(raw) => parse_ms(raw, key).map(Some),
    }
}

fn opt_json<T: DeserializeOwned>(
    map: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match map.get(key).map(String::as_str) {
        None | Some("") => Ok(None),
        Some(raw) => serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| StoreError::Serialization(format!("invalid JSON in {key}: {e}"))),
    }
}

fn parse_uuid(raw: &str, key: &str) -> Result<Uuid, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Serialization(format!("invalid uuid in {key}: {raw}")))
}

fn queue_from_hash(map: &HashMap<String, String>, tasks: Vec<Task>) -> Result<Queue, StoreError> {
    let status_raw = field(map, "status")?;
    Ok(Queue {
        id: parse_uuid(field(map, "id")?, "id")?,
        name: field(map, "name")?.to_string(),
        description: match field(map, "description")? {
            "" => None,
            s => Some(s.to_string()),
        },
        status: QueueStatus::parse(status_raw).ok_or_else(|| {
            StoreError::Serialization(format!("unknown queue status: {status_raw}"))
        })?,
        settings: opt_json::<QueueSettings>(map, "settings")?.unwrap_or_default(),
        metrics: opt_json::<QueueMetrics>(map, "metrics")?.unwrap_or_default(),
        created_at: parse_ms(field(map, "created_at")?, "created_at")?,
        started_at: opt_ms(map, "started_at")?,
        completed_at: opt_ms(map, "completed_at")?,
        tasks,
    })
}

fn task_from_hash(map: &HashMap<String, String>) -> Result<Task, StoreError> {
    let status_raw = field(map, "status")?;
    Ok(Task {
        id: parse_uuid(field(map, "id")?, "id")?,
        queue_id: parse_uuid(field(map, "queue_id")?, "queue_id")?,
        agent_id: field(map, "agent_id")?.to_string(),
        message: field(map, "message")?.to_string(),
        priority: field(map, "priority")?
            .parse()
            .map_err(|_| StoreError::Serialization("invalid priority".into()))?,
        estimated_complexity: match field(map, "estimated_complexity")? {
            "" => None,
            s => Some(Complexity::parse(s).ok_or_else(|| {
                StoreError::Serialization(format!("unknown complexity: {s}"))
            })?),
        },
        retry_count: field(map, "retry_count")?
            .parse()
            .map_err(|_| StoreError::Serialization("invalid retry_count".into()))?,
        max_retries: field(map, "max_retries")?
            .parse()
            .map_err(|_| StoreError::Serialization("invalid max_retries".into()))?,
        status: TaskStatus::parse(status_raw).ok_or_else(|| {
            StoreError::Serialization(format!("unknown task status: {status_raw}"))
        })?,
        created_at: parse_ms(field(map, "created_at")?, "created_at")?,
        started_at: opt_ms(map, "started_at")?,
        completed_at: opt_ms(map, "completed_at")?,
        result: opt_json(map, "result")?,
        error: opt_json(map, "error")?,
    })
}

#[async_trait]
impl QueueStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn save_queue(&self, queue: &Queue) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let queue_key = Self::queue_key(queue.id);
        let tasks_key = Self::queue_tasks_key(queue.id);
        let pending_key = Self::pending_key(queue.id);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(&queue_key, &queue_pairs(queue)?).ignore();
        pipe.del(&tasks_key).ignore();
        pipe.del(&pending_key).ignore();
        for task in &queue.tasks {
            pipe.hset_multiple(Self::task_key(task.id), &task_pairs(task)?)
                .ignore();
            pipe.rpush(&tasks_key, task.id.to_string()).ignore();
            if task.status.is_ready() {
                pipe.rpush(&pending_key, task.id.to_string()).ignore();
            }
        }
        pipe.zadd(
            QUEUES_INDEX_KEY,
            queue.id.to_string(),
            queue.created_at.timestamp_millis(),
        )
        .ignore();

        let _: () = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn load_queue(&self, id: Uuid) -> Result<Option<Queue>, StoreError> {
        let mut conn = self.get_connection().await?;
        let map: HashMap<String, String> = conn
            .hgetall(Self::queue_key(id))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if map.is_empty() {
            return Ok(None);
        }

        let task_ids: Vec<String> = conn
            .lrange(Self::queue_tasks_key(id), 0, -1)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut tasks = Vec::with_capacity(task_ids.len());
        for raw in &task_ids {
            let task_id = parse_uuid(raw, "task id list")?;
            let task_map: HashMap<String, String> = conn
                .hgetall(Self::task_key(task_id))
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            if !task_map.is_empty() {
                tasks.push(task_from_hash(&task_map)?);
            }
        }

        queue_from_hash(&map, tasks).map(Some)
    }

    async fn delete_queue(&self, id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let task_ids: Vec<String> = conn
            .lrange(Self::queue_tasks_key(id), 0, -1)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for raw in &task_ids {
            if let Ok(task_id) = raw.parse::<Uuid>() {
                pipe.del(Self::task_key(task_id)).ignore();
            }
        }
        pipe.del(Self::queue_tasks_key(id)).ignore();
        pipe.del(Self::pending_key(id)).ignore();
        pipe.del(Self::queue_key(id)).ignore();
        pipe.zrem(QUEUES_INDEX_KEY, id.to_string()).ignore();

        let _: () = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.channels.remove(&id);
        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<QueueSummary>, StoreError> {
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = conn
            .zrevrange(QUEUES_INDEX_KEY, 0, -1)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut summaries = Vec::with_capacity(ids.len());
        for raw in &ids {
            let id = parse_uuid(raw, "queue index")?;
            let map: HashMap<String, String> = conn
                .hgetall(Self::queue_key(id))
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            if map.is_empty() {
                continue;
            }

            let task_ids: Vec<String> = conn
                .lrange(Self::queue_tasks_key(id), 0, -1)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let mut completed = 0u64;
            for task_raw in &task_ids {
                if let Ok(task_id) = task_raw.parse::<Uuid>() {
                    let status: Option<String> = conn
                        .hget(Self::task_key(task_id), "status")
                        .await
                        .map_err(|e| StoreError::Backend(e.to_string()))?;
                    if status.as_deref() == Some("completed") {
                        completed += 1;
                    }
                }
            }

            let status_raw = field(&map, "status")?;
            summaries.push(QueueSummary {
                id,
                name: field(&map, "name")?.to_string(),
                status: QueueStatus::parse(status_raw).ok_or_else(|| {
                    StoreError::Serialization(format!("unknown queue status: {status_raw}"))
                })?,
                task_count: task_ids.len() as u64,
                completed_count: completed,
                created_at: parse_ms(field(&map, "created_at")?, "created_at")?,
            });
        }
        Ok(summaries)
    }

    async fn update_queue_status(
        &self,
        id: Uuid,
        status: QueueStatus,
        ts: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let queue_key = Self::queue_key(id);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset(&queue_key, "status", status.as_str()).ignore();
        if let Some(ts) = ts {
            match status {
                QueueStatus::Running => {
                    pipe.hset(&queue_key, "started_at", ts.timestamp_millis().to_string())
                        .ignore();
                }
                QueueStatus::Completed | QueueStatus::Failed => {
                    pipe.hset(&queue_key, "completed_at", ts.timestamp_millis().to_string())
                        .ignore();
                }
                _ => {}
            }
        }

        let _: () = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn update_queue_metrics(
        &self,
        id: Uuid,
        metrics: &QueueMetrics,
    ) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = conn
            .hset(Self::queue_key(id), "metrics", encode_json(metrics)?)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = conn
            .hset_multiple(Self::task_key(task.id), &task_pairs(task)?)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn load_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let mut conn = self.get_connection().await?;
        let map: HashMap<String, String> = conn
            .hgetall(Self::task_key(id))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if map.is_empty() {
            return Ok(None);
        }
        task_from_hash(&map).map(Some)
    }

    async fn update_task(&self, id: Uuid, patch: TaskPatch) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut pairs: Vec<(String, String)> = Vec::new();
        if let Some(status) = patch.status {
            pairs.push(("status".into(), status.as_str().into()));
        }
        if let Some(ts) = patch.started_at {
            pairs.push(("started_at".into(), ts.timestamp_millis().to_string()));
        }
        if let Some(ts) = patch.completed_at {
            pairs.push(("completed_at".into(), ts.timestamp_millis().to_string()));
        }
        if let Some(ref result) = patch.result {
            pairs.push(("result".into(), encode_json(result)?));
        }
        if let Some(ref error) = patch.error {
            pairs.push(("error".into(), encode_json(error)?));
        }
        if let Some(retry_count) = patch.retry_count {
            pairs.push(("retry_count".into(), retry_count.to_string()));
        }

        let mut conn = self.get_connection().await?;
        let _: () = conn
            .hset_multiple(Self::task_key(id), &pairs)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn claim_pending(&self, queue_id: Uuid, task_id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.get_connection().await?;
        let removed: i64 = conn
            .lrem(Self::pending_key(queue_id), 1, task_id.to_string())
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(removed > 0)
    }

    async fn requeue_task(&self, queue_id: Uuid, task_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = conn
            .rpush(Self::pending_key(queue_id), task_id.to_string())
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn replace_pending(&self, queue_id: Uuid, task_ids: &[Uuid]) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let pending_key = Self::pending_key(queue_id);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(&pending_key).ignore();
        for task_id in task_ids {
            pipe.rpush(&pending_key, task_id.to_string()).ignore();
        }

        let _: () = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn mark_agent_busy(&self, agent_id: &str) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = conn
            .sadd(BUSY_AGENTS_KEY, agent_id)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn mark_agent_available(&self, agent_id: &str) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = conn
            .srem(BUSY_AGENTS_KEY, agent_id)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn busy_agents(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.get_connection().await?;
        let agents: Vec<String> = conn
            .smembers(BUSY_AGENTS_KEY)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(agents)
    }

    async fn clear_busy_agents(&self) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = conn
            .del(BUSY_AGENTS_KEY)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn publish_event(
        &self,
        queue_id: Uuid,
        event: &TaskQueueEvent,
    ) -> Result<(), StoreError> {
        let payload = encode_json(event)?;
        let mut conn = self.get_connection().await?;
        let _: i64 = conn
            .publish(Self::events_channel(queue_id), payload)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        // In-process subscribers; ok if none are listening.
        let _ = self.channel(queue_id).send(event.clone());
        Ok(())
    }

    fn subscribe(&self, queue_id: Uuid) -> broadcast::Receiver<TaskQueueEvent> {
        self.channel(queue_id).subscribe()
    }

    async fn load_interrupted_queues(&self) -> Result<Vec<Queue>, StoreError> {
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = conn
            .zrevrange(QUEUES_INDEX_KEY, 0, -1)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        drop(conn);

        let mut interrupted = Vec::new();
        for raw in &ids {
            let id = parse_uuid(raw, "queue index")?;
            if let Some(queue) = self.load_queue(id).await?
                && queue.status.is_interrupted()
            {
                interrupted.push(queue);
            }
        }
        Ok(interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::model::{TaskError, TaskResult};

    #[test]
    fn task_row_roundtrip() {
        let mut task = Task::new(Uuid::new_v4(), "agent-1", "do it", 4, 3);
        task.status = TaskStatus::Completed;
        task.started_at = Some(Utc::now());
        task.completed_at = Some(Utc::now());
        task.result = Some(TaskResult::success("ok".into(), Some("s1".into())));
        task.retry_count = 2;

        let map: HashMap<String, String> = task_pairs(&task).unwrap().into_iter().collect();
        let parsed = task_from_hash(&map).unwrap();

        // Millisecond storage granularity.
        assert_eq!(parsed.id, task.id);
        assert_eq!(parsed.status, task.status);
        assert_eq!(parsed.retry_count, 2);
        assert_eq!(parsed.result, task.result);
        assert_eq!(
            parsed.started_at.map(|t| t.timestamp_millis()),
            task.started_at.map(|t| t.timestamp_millis())
        );
    }

    #[test]
    fn empty_string_encodes_absent() {
        let task = Task::new(Uuid::new_v4(), "agent-1", "do it", 4, 3);
        let map: HashMap<String, String> = task_pairs(&task).unwrap().into_iter().collect();

        assert_eq!(map["started_at"], "");
        assert_eq!(map["result"], "");
        assert_eq!(map["estimated_complexity"], "");

        let parsed = task_from_hash(&map).unwrap();
        assert!(parsed.started_at.is_none());
        assert!(parsed.result.is_none());
        assert!(parsed.estimated_complexity.is_none());
    }

    #[test]
    fn queue_row_roundtrip() {
        let mut queue = Queue::new("q", Some("desc".into()), QueueSettings::default());
        queue.status = QueueStatus::Running;
        queue.started_at = Some(Utc::now());

        let map: HashMap<String, String> = queue_pairs(&queue).unwrap().into_iter().collect();
        let parsed = queue_from_hash(&map, Vec::new()).unwrap();

        assert_eq!(parsed.id, queue.id);
        assert_eq!(parsed.name, "q");
        assert_eq!(parsed.description.as_deref(), Some("desc"));
        assert_eq!(parsed.status, QueueStatus::Running);
        assert_eq!(parsed.settings, queue.settings);
    }

    #[test]
    fn corrupt_row_is_a_serialization_error() {
        let task = Task::new(Uuid::new_v4(), "agent-1", "do it", 4, 3);
        let mut map: HashMap<String, String> = task_pairs(&task).unwrap().into_iter().collect();
        map.insert("status".into(), "definitely_not_a_status".into());

        let err = task_from_hash(&map).unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));

        let error_row = TaskError::network("boom");
        let encoded = encode_json(&error_row).unwrap();
        assert!(encoded.contains("\"type\":\"network\""));
    }
}
