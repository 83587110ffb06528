//! MTAP DUT - Simulated device under test
//!
//! This crate provides:
//! - Per-serial-number device state machine
//! - Seeded, profile-driven fault injection
//! - Command dispatch table with arity validation
//! - Line-framed TCP server, one task per session

pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod fault;
pub mod server;

pub use config::*;
pub use device::*;
pub use dispatch::*;
pub use error::*;
pub use fault::*;
pub use server::*;
