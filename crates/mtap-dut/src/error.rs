//! Error types for the DUT simulator

use thiserror::Error;

use mtap_core::ConfigError;

/// DUT server errors
#[derive(Error, Debug)]
pub enum DutError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for DUT operations
pub type DutResult<T> = Result<T, DutError>;
