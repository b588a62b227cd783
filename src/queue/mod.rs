//! Queue domain — data model and lifecycle events.

pub mod events;
pub mod model;

pub use events::TaskQueueEvent;
pub use model::{
    Queue, QueueMetrics, QueueSettings, QueueStatus, QueueSummary, Task, TaskError, TaskErrorKind,
    TaskResult, TaskResultKind, TaskStatus,
};
