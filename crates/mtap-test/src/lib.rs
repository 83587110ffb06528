//! MTAP Test Harness - End-to-end validation
//!
//! This crate provides:
//! - In-process DUT servers on ephemeral ports
//! - Raw line exchange helpers for wire-level checks
//! - End-to-end scenarios through client and runner
//! - Reproducibility and isolation properties

pub mod harness;
pub mod scenarios;

pub use harness::*;
