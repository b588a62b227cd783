//! Shared test support: a scriptable stub worker agent speaking the
//! NDJSON chat protocol, and polling helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use tokio::sync::broadcast;

use fleetq::agents::AgentInfo;
use fleetq::queue::TaskQueueEvent;

/// Maximum time any wait in a test is allowed to take.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-request behavior of the stub agent.
#[derive(Clone, Copy, Debug)]
pub enum AgentScript {
    /// Stream one assistant text fragment, then `done`.
    Ok(&'static str),
    /// Return 503 for the first `failures` attempts, then succeed.
    FailuresThenOk { failures: usize, text: &'static str },
    /// Always 401.
    Unauthorized,
    /// Sleep before succeeding.
    SlowOk { delay_ms: u64, text: &'static str },
    /// Stream an `error` frame.
    ErrorFrame,
}

#[derive(Clone)]
struct StubState {
    script: AgentScript,
    hits: Arc<AtomicUsize>,
}

/// A running stub agent.
pub struct StubAgent {
    pub endpoint: String,
    /// Number of chat requests received.
    pub hits: Arc<AtomicUsize>,
}

impl StubAgent {
    pub fn info(&self, id: &str) -> AgentInfo {
        AgentInfo {
            id: id.to_string(),
            endpoint: self.endpoint.clone(),
            working_directory: String::new(),
            claude_auth: None,
        }
    }
}

/// Start a stub agent on a random port.
pub async fn start_stub_agent(script: AgentScript) -> StubAgent {
    let hits = Arc::new(AtomicUsize::new(0));
    let state = StubState {
        script,
        hits: Arc::clone(&hits),
    };
    let app = Router::new().route("/api/chat", post(chat)).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    StubAgent {
        endpoint: format!("http://127.0.0.1:{port}"),
        hits,
    }
}

fn ndjson_ok(text: &str) -> String {
    let frame = serde_json::json!({
        "type": "claude_json",
        "data": {
            "session_id": "stub-session",
            "message": {"content": [{"type": "text", "text": text}]}
        }
    });
    format!("{frame}\n{}\n", serde_json::json!({"type": "done"}))
}

async fn chat(State(state): State<StubState>) -> Response {
    let attempt = state.hits.fetch_add(1, Ordering::SeqCst);
    match state.script {
        AgentScript::Ok(text) => ndjson_ok(text).into_response(),
        AgentScript::FailuresThenOk { failures, text } => {
            if attempt < failures {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable").into_response()
            } else {
                ndjson_ok(text).into_response()
            }
        }
        AgentScript::Unauthorized => (StatusCode::UNAUTHORIZED, "bad credentials").into_response(),
        AgentScript::SlowOk { delay_ms, text } => {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            ndjson_ok(text).into_response()
        }
        AgentScript::ErrorFrame => {
            format!(
                "{}\n",
                serde_json::json!({"type": "error", "message": "agent exploded"})
            )
            .into_response()
        }
    }
}

/// Poll `check` every 20 ms until it returns true, or panic after
/// [`TEST_TIMEOUT`].
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Receive the next event or panic after [`TEST_TIMEOUT`].
pub async fn recv_event(rx: &mut broadcast::Receiver<TaskQueueEvent>) -> TaskQueueEvent {
    tokio::time::timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Drain whatever events are immediately available.
pub fn drain_events(rx: &mut broadcast::Receiver<TaskQueueEvent>) -> Vec<TaskQueueEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
