//! Error types for the runner

use thiserror::Error;

use mtap_core::ConfigError;

/// Transport-level client failures. Always retryable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("Connection closed before a full response line")]
    Closed,

    #[error("Transport error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e.to_string())
    }
}

/// Run-level errors. Fatal to the run, never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunError {
    #[error("Invalid plan: {0}")]
    Plan(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for runner operations
pub type RunnerResult<T> = Result<T, RunError>;
