//! Error types for the queue engine.

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Queue store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Backend operation failed: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

/// Agent roster errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Unknown agent: {0}")]
    Unknown(String),

    #[error("Failed to load agent roster: {0}")]
    Roster(String),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
