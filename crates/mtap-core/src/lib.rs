//! MTAP Core - Wire vocabulary shared by the DUT simulator and the runner
//!
//! This crate defines the frozen line protocol:
//! - Error taxonomy (ErrorCode)
//! - Command names, arity and request parsing
//! - The JSON response object
//! - Fault profile names
//! - Environment-style settings helpers

pub mod code;
pub mod command;
pub mod error;
pub mod profile;
pub mod response;
pub mod settings;

pub use code::*;
pub use command::*;
pub use error::*;
pub use profile::*;
pub use response::*;
pub use settings::ConfigError;

/// Lowest temperature a device accepts, in °C
pub const TEMP_MIN_C: f64 = -40.0;

/// Highest temperature a device accepts, in °C
pub const TEMP_MAX_C: f64 = 125.0;

/// Line terminator for requests and responses
pub const LINE_TERMINATOR: char = '\n';

/// Longest line either side reads before giving up on the peer
pub const MAX_LINE_BYTES: usize = 64 * 1024;
