//! Error types for the MTAP protocol

use thiserror::Error;

use crate::{ErrorCode, Response};

/// Protocol-level failures, each mapping onto a wire error code
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("{0}")]
    BadArgs(String),

    #[error("{0}")]
    OutOfRange(String),

    #[error("Unknown fault profile: {0}")]
    UnknownProfile(String),

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    /// Wire code reported for this failure
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::UnknownCommand(_) => ErrorCode::UnknownCmd,
            ProtocolError::BadArgs(_) | ProtocolError::UnknownProfile(_) => ErrorCode::BadArgs,
            ProtocolError::OutOfRange(_) => ErrorCode::OutOfRange,
            ProtocolError::Busy(_) => ErrorCode::Busy,
            ProtocolError::MalformedResponse(_) | ProtocolError::Internal(_) => {
                ErrorCode::Internal
            }
        }
    }

    /// Render as a failed response
    pub fn to_response(&self) -> Response {
        Response::error(self.code(), self.to_string())
    }
}

/// Result type for protocol operations
pub type MtapResult<T> = Result<T, ProtocolError>;
