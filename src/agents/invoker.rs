//! Agent invoker — one streaming chat request per task.
//!
//! POSTs to `{endpoint}/api/chat` and consumes the newline-delimited JSON
//! response: `claude_json` frames contribute assistant text, `done`
//! terminates successfully, `error`/`aborted` terminate with a classified
//! failure. Malformed lines and unknown frame types are skipped.

use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::agents::registry::AgentInfo;
use crate::queue::model::{TaskError, TaskResult};

/// A silent proxy is assumed once no frame arrives for this long.
const READ_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest<'a> {
    message: &'a str,
    request_id: Uuid,
    working_directory: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    claude_auth: Option<&'a serde_json::Value>,
}

/// Invoke one task against its worker agent.
///
/// Returns within `timeout`, or as soon as `cancel` fires. The retryable
/// classification on the error is final.
pub async fn invoke_agent(
    client: &reqwest::Client,
    agent: &AgentInfo,
    message: &str,
    request_id: Uuid,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<TaskResult, TaskError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(TaskError::abort("invocation cancelled")),
        outcome = tokio::time::timeout(timeout, stream_chat(client, agent, message, request_id)) => {
            match outcome {
                Ok(result) => result,
                Err(_) => {
                    cancel.cancel();
                    Err(TaskError::timeout(format!(
                        "task exceeded {} ms deadline",
                        timeout.as_millis()
                    )))
                }
            }
        }
    }
}

async fn stream_chat(
    client: &reqwest::Client,
    agent: &AgentInfo,
    message: &str,
    request_id: Uuid,
) -> Result<TaskResult, TaskError> {
    let url = format!("{}/api/chat", agent.endpoint.trim_end_matches('/'));
    let body = ChatRequest {
        message,
        request_id,
        working_directory: &agent.working_directory,
        claude_auth: agent.claude_auth.as_ref(),
    };

    let response = client
        .post(&url)
        .header(header::CONNECTION, "keep-alive")
        .header(header::CACHE_CONTROL, "no-cache")
        .json(&body)
        .send()
        .await
        .map_err(|e| TaskError::network(format!("request to {url} failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(classify_status(status, &agent.id));
    }

    let mut stream = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    let mut content = String::new();
    let mut session_id: Option<String> = None;

    loop {
        let chunk = match tokio::time::timeout(READ_DEADLINE, stream.next()).await {
            Err(_) => {
                return Err(TaskError::timeout(format!(
                    "no frame from agent {} within {} s",
                    agent.id,
                    READ_DEADLINE.as_secs()
                )));
            }
            // Stream ended without a done frame.
            Ok(None) => return Ok(TaskResult::partial(content, session_id)),
            Ok(Some(Err(e))) => {
                return Err(TaskError::network(format!("stream read failed: {e}")));
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        buf.extend_from_slice(&chunk);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let frame: serde_json::Value = match serde_json::from_str(line) {
                Ok(frame) => frame,
                Err(_) => {
                    debug!(agent_id = %agent.id, "Skipping malformed frame");
                    continue;
                }
            };

            match frame.get("type").and_then(|t| t.as_str()) {
                Some("claude_json") => absorb_claude_json(&frame, &mut content, &mut session_id),
                Some("error") => {
                    let message = frame
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("agent reported an error");
                    return Err(TaskError::execution(message, true));
                }
                Some("aborted") => {
                    return Err(TaskError::abort("agent aborted the request"));
                }
                Some("done") => return Ok(TaskResult::success(content, session_id)),
                _ => {}
            }
        }
    }
}

/// Append assistant text fragments and capture the session id.
fn absorb_claude_json(
    frame: &serde_json::Value,
    content: &mut String,
    session_id: &mut Option<String>,
) {
    let payload = frame.get("data").unwrap_or(frame);

    if session_id.is_none() {
        *session_id = payload
            .get("session_id")
            .or_else(|| payload.get("sessionId"))
            .and_then(|s| s.as_str())
            .map(String::from);
    }

    if let Some(items) = payload
        .pointer("/message/content")
        .and_then(|c| c.as_array())
    {
        for item in items {
            if item.get("type").and_then(|t| t.as_str()) == Some("text")
                && let Some(text) = item.get("text").and_then(|t| t.as_str())
            {
                content.push_str(text);
            }
        }
    }
}

fn classify_status(status: StatusCode, agent_id: &str) -> TaskError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        TaskError::execution(
            format!("agent {agent_id} rejected credentials ({status})"),
            false,
        )
    } else if status.is_server_error() {
        TaskError::network(format!("agent {agent_id} returned {status}"))
    } else {
        TaskError::execution(format!("agent {agent_id} returned {status}"), false)
    }
}
