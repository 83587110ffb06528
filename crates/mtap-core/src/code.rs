//! Error taxonomy for the MTAP wire protocol
//!
//! The set is frozen. Codes split into two retry classes:
//! - Deterministic: the same request reproduces the same rejection
//! - Transient: a later attempt may succeed

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Wire error code carried in `error_code`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E_UNKNOWN_CMD")]
    UnknownCmd,
    #[serde(rename = "E_BAD_ARGS")]
    BadArgs,
    #[serde(rename = "E_TIMEOUT")]
    Timeout,
    #[serde(rename = "E_INTERNAL")]
    Internal,
    #[serde(rename = "E_OUT_OF_RANGE")]
    OutOfRange,
    #[serde(rename = "E_BUSY")]
    Busy,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 6] = [
        ErrorCode::UnknownCmd,
        ErrorCode::BadArgs,
        ErrorCode::Timeout,
        ErrorCode::Internal,
        ErrorCode::OutOfRange,
        ErrorCode::Busy,
    ];

    /// Wire spelling
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UnknownCmd => "E_UNKNOWN_CMD",
            ErrorCode::BadArgs => "E_BAD_ARGS",
            ErrorCode::Timeout => "E_TIMEOUT",
            ErrorCode::Internal => "E_INTERNAL",
            ErrorCode::OutOfRange => "E_OUT_OF_RANGE",
            ErrorCode::Busy => "E_BUSY",
        }
    }

    /// A later attempt of the same request may succeed
    #[inline]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout | ErrorCode::Internal | ErrorCode::Busy
        )
    }

    /// The same request always reproduces this rejection
    #[inline]
    pub fn is_deterministic(self) -> bool {
        !self.is_transient()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown error code: {}", s))
    }
}
