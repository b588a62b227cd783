//! Scheduler — per-queue runners and their control handles.

pub mod runner;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use runner::QueueRunner;

/// Shared control handle between the API and one queue runner.
#[derive(Debug, Default)]
pub struct RunnerControl {
    paused: AtomicBool,
    stop: CancellationToken,
}

impl RunnerControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// The stop token; dispatches receive child tokens of this.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }
}

/// Registry of live runners, keyed by queue id. The only record of which
/// queues this process is currently driving.
#[derive(Default)]
pub struct ActiveRunners {
    inner: DashMap<Uuid, Arc<RunnerControl>>,
}

impl ActiveRunners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a control handle unless one is already live for the queue.
    pub fn try_insert(&self, queue_id: Uuid, control: Arc<RunnerControl>) -> bool {
        match self.inner.entry(queue_id) {
            dashmap::Entry::Occupied(_) => false,
            dashmap::Entry::Vacant(slot) => {
                slot.insert(control);
                true
            }
        }
    }

    pub fn get(&self, queue_id: Uuid) -> Option<Arc<RunnerControl>> {
        self.inner.get(&queue_id).map(|c| c.clone())
    }

    pub fn remove(&self, queue_id: Uuid) -> Option<Arc<RunnerControl>> {
        self.inner.remove(&queue_id).map(|(_, c)| c)
    }

    pub fn contains(&self, queue_id: Uuid) -> bool {
        self.inner.contains_key(&queue_id)
    }

    /// Signal stop to every live runner (process shutdown).
    pub fn stop_all(&self) {
        for entry in self.inner.iter() {
            entry.value().stop();
        }
    }
}
