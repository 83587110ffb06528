//! MTAP Runner - Executes test plans against DUTs
//!
//! This crate provides:
//! - Line-protocol client with per-call deadlines
//! - Test plans: command templates, limits, retry budgets
//! - Bounded worker pool over serial numbers, strictly ordered steps
//! - Per-attempt StepResult events and the aggregated RunResult

pub mod client;
pub mod engine;
pub mod error;
pub mod plan;
pub mod result;
pub mod settings;

pub use client::*;
pub use engine::*;
pub use error::*;
pub use plan::*;
pub use result::*;
pub use settings::*;
