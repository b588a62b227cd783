//! Control API — HTTP handlers and the SSE event stream.

pub mod routes;

pub use routes::{ApiState, api_routes};
