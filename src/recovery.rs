//! Crash recovery — one-shot startup pass over interrupted queues.
//!
//! Every queue whose last persisted status was running or paused is reset
//! to paused with its in-flight tasks back to pending and the busy-agent
//! set cleared, awaiting an explicit resume.

use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::traits::QueueStore;

/// Run the recovery pass. Called once before the control API binds.
pub async fn run(store: &dyn QueueStore) -> Result<(), StoreError> {
    let interrupted = store.load_interrupted_queues().await?;
    if interrupted.is_empty() {
        debug!("No interrupted queues to recover");
        return Ok(());
    }

    info!(count = interrupted.len(), "Recovering interrupted queues");
    for queue in interrupted {
        store.reset_interrupted_queue(queue.id).await?;
        info!(
            queue_id = %queue.id,
            name = %queue.name,
            "Queue reset to paused, awaiting resume"
        );
    }
    Ok(())
}
