//! Persistence layer — redis-backed queue store with an in-process
//! fallback implementing the same interface.

pub mod memory;
pub mod redis_backend;
pub mod traits;

use std::sync::Arc;

use tracing::{info, warn};

pub use memory::MemoryStore;
pub use redis_backend::RedisStore;
pub use traits::{QueueStore, TaskPatch};

use crate::config::EngineConfig;
use crate::error::StoreError;

/// Connect to the configured backend.
///
/// No endpoint → in-memory store. An unreachable endpoint falls back to
/// memory unless the backend is explicitly required, in which case the
/// error propagates and the process exits non-zero.
pub async fn connect(config: &EngineConfig) -> Result<Arc<dyn QueueStore>, StoreError> {
    match config.store_endpoint.as_deref() {
        Some(url) => match RedisStore::connect(url).await {
            Ok(store) => {
                info!(endpoint = %url, "Connected to redis queue store");
                Ok(Arc::new(store))
            }
            Err(e) if config.store_required => Err(e),
            Err(e) => {
                warn!(
                    endpoint = %url,
                    error = %e,
                    "Queue store unreachable, degrading to in-memory store"
                );
                Ok(Arc::new(MemoryStore::new()))
            }
        },
        None => {
            info!("No store endpoint configured, using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
