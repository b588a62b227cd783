//! Engine configuration.

use std::path::PathBuf;

use crate::queue::model::QueueSettings;

/// Engine configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address the control API binds to.
    pub bind_addr: String,
    /// Default cap on simultaneous dispatches per queue.
    pub max_concurrency: usize,
    /// Default upper bound on retry attempts per task.
    pub retry_count: u32,
    /// Default base backoff in milliseconds.
    pub retry_delay: u64,
    /// Default hard deadline for one dispatch, in milliseconds.
    pub timeout_per_task: u64,
    /// Queue store backend location (redis URL). `None` → in-memory fallback.
    pub store_endpoint: Option<String>,
    /// When set, an unreachable store backend is fatal at startup.
    pub store_required: bool,
    /// Verbose logging.
    pub debug_mode: bool,
    /// Path to the agent roster JSON file.
    pub agents_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8600".to_string(),
            max_concurrency: 3,
            retry_count: 3,
            retry_delay: 2_000,
            timeout_per_task: 300_000,
            store_endpoint: None,
            store_required: false,
            debug_mode: false,
            agents_path: None,
        }
    }
}

impl EngineConfig {
    /// Build EngineConfig from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("FLEETQ_BIND").unwrap_or(defaults.bind_addr),
            max_concurrency: std::env::var("FLEETQ_MAX_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_concurrency),
            retry_count: std::env::var("FLEETQ_RETRY_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.retry_count),
            retry_delay: std::env::var("FLEETQ_RETRY_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.retry_delay),
            timeout_per_task: std::env::var("FLEETQ_TASK_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timeout_per_task),
            store_endpoint: std::env::var("FLEETQ_STORE_URL")
                .ok()
                .filter(|v| !v.is_empty()),
            store_required: std::env::var("FLEETQ_STORE_REQUIRED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(false),
            debug_mode: std::env::var("FLEETQ_DEBUG")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(false),
            agents_path: std::env::var("FLEETQ_AGENTS").ok().map(PathBuf::from),
        }
    }

    /// Per-queue settings used when a create request supplies none.
    pub fn default_settings(&self) -> QueueSettings {
        QueueSettings {
            max_concurrency: self.max_concurrency,
            retry_count: self.retry_count,
            retry_delay: self.retry_delay,
            timeout_per_task: self.timeout_per_task,
        }
    }
}
