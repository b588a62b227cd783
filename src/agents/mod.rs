//! Worker agents — roster lookup and the streaming invoker.

pub mod invoker;
pub mod registry;

pub use invoker::invoke_agent;
pub use registry::{AgentInfo, AgentRegistry};
