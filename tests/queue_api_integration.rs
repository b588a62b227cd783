//! Integration tests for the queue control API.
//!
//! Each test spins up the axum control API on a random port (backed by the
//! in-memory store) plus stub worker agents, and exercises the real HTTP
//! and SSE contract end to end.

mod common;

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{Value, json};
use uuid::Uuid;

use common::{AgentScript, StubAgent, TEST_TIMEOUT, start_stub_agent, wait_until};
use fleetq::agents::AgentRegistry;
use fleetq::api::{ApiState, api_routes};
use fleetq::config::EngineConfig;
use fleetq::queue::model::{Queue, QueueSettings, QueueStatus, Task, TaskStatus};
use fleetq::recovery;
use fleetq::scheduler::ActiveRunners;
use fleetq::store::{MemoryStore, QueueStore};

struct TestEngine {
    base: String,
    store: Arc<dyn QueueStore>,
    client: reqwest::Client,
}

impl TestEngine {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

async fn start_engine(agents: AgentRegistry) -> TestEngine {
    let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
    start_engine_with_store(agents, store).await
}

async fn start_engine_with_store(agents: AgentRegistry, store: Arc<dyn QueueStore>) -> TestEngine {
    let state = ApiState {
        store: Arc::clone(&store),
        agents: Arc::new(agents),
        runners: Arc::new(ActiveRunners::new()),
        config: EngineConfig::default(),
        client: reqwest::Client::new(),
    };
    let app = api_routes(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestEngine {
        base: format!("http://127.0.0.1:{port}"),
        store,
        client: reqwest::Client::new(),
    }
}

fn two_task_body() -> Value {
    json!({
        "name": "integration queue",
        "tasks": [
            {"agentId": "a1", "message": "first", "priority": 1},
            {"agentId": "a2", "message": "second", "priority": 2}
        ],
        "settings": {"maxConcurrency": 2}
    })
}

async fn create_queue(engine: &TestEngine, body: &Value) -> Uuid {
    let response = engine
        .client
        .post(engine.url("/api/queue"))
        .json(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let json: Value = response.json().await.unwrap();
    json["queueId"].as_str().unwrap().parse().unwrap()
}

async fn get_queue_json(engine: &TestEngine, id: Uuid) -> Value {
    let response = engine
        .client
        .get(engine.url(&format!("/api/queue/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    json["queue"].clone()
}

async fn wait_queue_status(engine: &TestEngine, id: Uuid, status: &'static str) {
    wait_until(&format!("queue to reach status {status}"), move || async move {
        get_queue_json(engine, id).await["status"] == status
    })
    .await;
}

/// Read SSE blocks until a terminal queue event; returns (event, data)
/// pairs.
async fn collect_sse(response: reqwest::Response) -> Vec<(String, Value)> {
    let mut events = Vec::new();
    let mut stream = response.bytes_stream();
    let mut buf = String::new();
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;

    loop {
        let chunk = tokio::time::timeout_at(deadline, stream.next())
            .await
            .expect("SSE stream timed out");
        let Some(chunk) = chunk else {
            return events;
        };
        buf.push_str(&String::from_utf8_lossy(&chunk.unwrap()));

        while let Some(pos) = buf.find("\n\n") {
            let block: String = buf.drain(..pos + 2).collect();
            let mut event_name = String::new();
            let mut data = String::new();
            for line in block.lines() {
                if let Some(rest) = line.strip_prefix("event: ") {
                    event_name = rest.to_string();
                } else if let Some(rest) = line.strip_prefix("data: ") {
                    data.push_str(rest);
                }
            }
            if event_name.is_empty() {
                continue; // keepalive comment
            }
            let value: Value = serde_json::from_str(&data).expect("invalid SSE payload");
            let terminal = event_name == "queue_completed" || event_name == "queue_failed";
            events.push((event_name, value));
            if terminal {
                return events;
            }
        }
    }
}

// ── Validation & CRUD ───────────────────────────────────────────────

#[tokio::test]
async fn create_rejects_missing_name_and_empty_tasks() {
    let engine = start_engine(AgentRegistry::default()).await;

    let response = engine
        .client
        .post(engine.url("/api/queue"))
        .json(&json!({"tasks": [{"agentId": "a1", "message": "m"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = engine
        .client
        .post(engine.url("/api/queue"))
        .json(&json!({"name": "no tasks", "tasks": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = engine
        .client
        .post(engine.url("/api/queue"))
        .json(&json!({"name": "bad prio", "tasks": [{"agentId": "a1", "message": "m", "priority": 11}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn create_get_list_delete_roundtrip() {
    let engine = start_engine(AgentRegistry::default()).await;
    let id = create_queue(&engine, &two_task_body()).await;

    let queue = get_queue_json(&engine, id).await;
    assert_eq!(queue["status"], "idle");
    assert_eq!(queue["name"], "integration queue");
    assert_eq!(queue["settings"]["maxConcurrency"], 2);
    assert_eq!(queue["tasks"].as_array().unwrap().len(), 2);
    assert_eq!(queue["tasks"][0]["status"], "pending");

    let response = engine
        .client
        .get(engine.url("/api/queues"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    let queues = json["queues"].as_array().unwrap();
    assert_eq!(queues.len(), 1);
    assert_eq!(queues[0]["taskCount"], 2);
    assert_eq!(queues[0]["completedCount"], 0);

    let response = engine
        .client
        .delete(engine.url(&format!("/api/queue/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = engine
        .client
        .get(engine.url(&format!("/api/queue/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn unknown_queue_returns_404_everywhere() {
    let engine = start_engine(AgentRegistry::default()).await;
    let ghost = Uuid::new_v4();

    for (method, path) in [
        ("get", format!("/api/queue/{ghost}")),
        ("post", format!("/api/queue/{ghost}/start")),
        ("post", format!("/api/queue/{ghost}/pause")),
        ("post", format!("/api/queue/{ghost}/resume")),
        ("get", format!("/api/queue/stream/{ghost}")),
        ("post", format!("/api/queue/{ghost}/tasks/{}/retry", Uuid::new_v4())),
    ] {
        let request = match method {
            "get" => engine.client.get(engine.url(&path)),
            _ => engine.client.post(engine.url(&path)),
        };
        let response = request.send().await.unwrap();
        assert_eq!(response.status(), 404, "expected 404 for {path}");
    }
}

#[tokio::test]
async fn hygiene_headers_on_every_response() {
    let engine = start_engine(AgentRegistry::default()).await;
    let response = engine
        .client
        .get(engine.url("/api/health"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["cache-control"], "no-cache, no-store");
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["store"], "memory");
}

// ── Execution through the API ───────────────────────────────────────

async fn two_agents() -> (StubAgent, StubAgent, AgentRegistry) {
    let a1 = start_stub_agent(AgentScript::Ok("ok")).await;
    let a2 = start_stub_agent(AgentScript::Ok("ok")).await;
    let registry = AgentRegistry::new(vec![a1.info("a1"), a2.info("a2")]);
    (a1, a2, registry)
}

#[tokio::test]
async fn start_drives_queue_and_stream_observes_it() {
    let (_a1, _a2, registry) = two_agents().await;
    let engine = start_engine(registry).await;
    let id = create_queue(&engine, &two_task_body()).await;

    // Subscribe before starting so the whole sequence is observed.
    let stream_response = engine
        .client
        .get(engine.url(&format!("/api/queue/stream/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(stream_response.status(), 200);
    assert!(
        stream_response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
    let collector = tokio::spawn(collect_sse(stream_response));

    let response = engine
        .client
        .post(engine.url(&format!("/api/queue/{id}/start")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["status"], "running");
    assert_eq!(json["streamUrl"], format!("/api/queue/stream/{id}"));

    let events = collector.await.unwrap();
    let kinds: Vec<&str> = events.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(kinds.first(), Some(&"queue_started"));
    assert_eq!(kinds.last(), Some(&"queue_completed"));
    assert_eq!(kinds.iter().filter(|k| **k == "task_started").count(), 2);
    assert_eq!(kinds.iter().filter(|k| **k == "task_completed").count(), 2);

    let (_, terminal) = events.last().unwrap();
    assert_eq!(terminal["metrics"]["completedTasks"], 2);
    assert_eq!(terminal["metrics"]["failedTasks"], 0);

    let queue = get_queue_json(&engine, id).await;
    assert_eq!(queue["status"], "completed");
    assert_eq!(queue["tasks"][0]["result"]["content"], "ok");

    let response = engine
        .client
        .get(engine.url("/api/queue/busy-agents"))
        .send()
        .await
        .unwrap();
    let json: Value = response.json().await.unwrap();
    assert!(json["busyAgents"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let slow = start_stub_agent(AgentScript::SlowOk {
        delay_ms: 500,
        text: "ok",
    })
    .await;
    let engine = start_engine(AgentRegistry::new(vec![slow.info("a1")])).await;
    let id = create_queue(
        &engine,
        &json!({"name": "slow", "tasks": [{"agentId": "a1", "message": "m"}]}),
    )
    .await;

    let response = engine
        .client
        .post(engine.url(&format!("/api/queue/{id}/start")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = engine
        .client
        .post(engine.url(&format!("/api/queue/{id}/start")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn busy_agents_visible_during_execution() {
    let slow = start_stub_agent(AgentScript::SlowOk {
        delay_ms: 500,
        text: "ok",
    })
    .await;
    let engine = start_engine(AgentRegistry::new(vec![slow.info("a1")])).await;
    let id = create_queue(
        &engine,
        &json!({"name": "slow", "tasks": [{"agentId": "a1", "message": "m"}]}),
    )
    .await;

    engine
        .client
        .post(engine.url(&format!("/api/queue/{id}/start")))
        .send()
        .await
        .unwrap();

    let engine_ref = &engine;
    wait_until("agent to appear busy", move || async move {
        let response = engine_ref
            .client
            .get(engine_ref.url("/api/queue/busy-agents"))
            .send()
            .await
            .unwrap();
        let json: Value = response.json().await.unwrap();
        json["busyAgents"]
            .as_array()
            .unwrap()
            .iter()
            .any(|a| a == "a1")
    })
    .await;

    wait_queue_status(&engine, id, "completed").await;
}

#[tokio::test]
async fn delete_running_requires_force() {
    let slow = start_stub_agent(AgentScript::SlowOk {
        delay_ms: 2_000,
        text: "ok",
    })
    .await;
    let engine = start_engine(AgentRegistry::new(vec![slow.info("a1")])).await;
    let id = create_queue(
        &engine,
        &json!({"name": "slow", "tasks": [{"agentId": "a1", "message": "m"}]}),
    )
    .await;

    engine
        .client
        .post(engine.url(&format!("/api/queue/{id}/start")))
        .send()
        .await
        .unwrap();
    wait_queue_status(&engine, id, "running").await;

    let response = engine
        .client
        .delete(engine.url(&format!("/api/queue/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = engine
        .client
        .delete(engine.url(&format!("/api/queue/{id}?force=true")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = engine
        .client
        .get(engine.url(&format!("/api/queue/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

// ── Task-level endpoints ────────────────────────────────────────────

#[tokio::test]
async fn retry_endpoint_resets_failed_task() {
    let bad = start_stub_agent(AgentScript::Unauthorized).await;
    let engine = start_engine(AgentRegistry::new(vec![bad.info("a1")])).await;
    let id = create_queue(
        &engine,
        &json!({"name": "doomed", "tasks": [{"agentId": "a1", "message": "m"}]}),
    )
    .await;

    engine
        .client
        .post(engine.url(&format!("/api/queue/{id}/start")))
        .send()
        .await
        .unwrap();
    wait_queue_status(&engine, id, "failed").await;

    let queue = get_queue_json(&engine, id).await;
    let task_id = queue["tasks"][0]["id"].as_str().unwrap().to_string();
    assert_eq!(queue["tasks"][0]["status"], "failed");

    let response = engine
        .client
        .post(engine.url(&format!("/api/queue/{id}/tasks/{task_id}/retry")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["task"]["status"], "pending");
    assert_eq!(json["task"]["retryCount"], 0);
    assert!(json["task"].get("error").is_none());
    assert!(json["task"].get("startedAt").is_none());

    let queue = get_queue_json(&engine, id).await;
    assert_eq!(queue["tasks"][0]["status"], "pending");
}

#[tokio::test]
async fn cancel_skips_a_pending_task() {
    let (_a1, _a2, registry) = two_agents().await;
    let engine = start_engine(registry).await;
    let id = create_queue(&engine, &two_task_body()).await;

    let queue = get_queue_json(&engine, id).await;
    let second_task = queue["tasks"][1]["id"].as_str().unwrap().to_string();

    let response = engine
        .client
        .post(engine.url(&format!("/api/queue/{id}/tasks/{second_task}/cancel")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["task"]["status"], "cancelled");

    // Cancelling twice is a client error.
    let response = engine
        .client
        .post(engine.url(&format!("/api/queue/{id}/tasks/{second_task}/cancel")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    engine
        .client
        .post(engine.url(&format!("/api/queue/{id}/start")))
        .send()
        .await
        .unwrap();
    wait_queue_status(&engine, id, "completed").await;

    let queue = get_queue_json(&engine, id).await;
    assert_eq!(queue["tasks"][0]["status"], "completed");
    assert_eq!(queue["tasks"][1]["status"], "cancelled");
    assert_eq!(queue["metrics"]["completedTasks"], 1);
    assert_eq!(queue["metrics"]["failedTasks"], 0);
}

// ── Crash recovery ──────────────────────────────────────────────────

#[tokio::test]
async fn recovery_then_resume_drives_to_completion() {
    let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());

    // Persist a queue that looks like it died mid-run: T1 in flight,
    // T2 still pending, agent a1 busy.
    let mut queue = Queue::new(
        "interrupted",
        None,
        QueueSettings {
            max_concurrency: 2,
            ..QueueSettings::default()
        },
    );
    let mut t1 = Task::new(queue.id, "a1", "first", 1, 3);
    t1.status = TaskStatus::InProgress;
    t1.started_at = Some(chrono::Utc::now());
    let t2 = Task::new(queue.id, "a2", "second", 2, 3);
    queue.status = QueueStatus::Running;
    queue.started_at = Some(chrono::Utc::now());
    queue.tasks.push(t1.clone());
    queue.tasks.push(t2.clone());
    store.save_queue(&queue).await.unwrap();
    store.mark_agent_busy("a1").await.unwrap();

    // Startup pass.
    recovery::run(store.as_ref()).await.unwrap();

    let (_a1, _a2, registry) = two_agents().await;
    let engine = start_engine_with_store(registry, Arc::clone(&store)).await;

    let recovered = get_queue_json(&engine, queue.id).await;
    assert_eq!(recovered["status"], "paused");
    assert_eq!(recovered["tasks"][0]["status"], "pending");
    assert!(recovered["tasks"][0].get("startedAt").is_none());

    let response = engine
        .client
        .get(engine.url("/api/queue/busy-agents"))
        .send()
        .await
        .unwrap();
    let json: Value = response.json().await.unwrap();
    assert!(json["busyAgents"].as_array().unwrap().is_empty());

    // A bare resume spawns a fresh runner and completes the queue.
    let response = engine
        .client
        .post(engine.url(&format!("/api/queue/{}/resume", queue.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    wait_queue_status(&engine, queue.id, "completed").await;
    let done = get_queue_json(&engine, queue.id).await;
    assert_eq!(done["metrics"]["completedTasks"], 2);
    assert_eq!(done["tasks"][0]["result"]["content"], "ok");
}
