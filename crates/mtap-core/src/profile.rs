//! Fault profile names
//!
//! A profile is a named policy governing how the DUT perturbs responses.
//! The parameters behind each name live with the injector.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Named fault profile
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultProfile {
    /// Pass-through, no perturbation
    #[default]
    Clean,
    /// Random E_INTERNAL replacement
    Intermittent,
    /// Random stall longer than the client deadline
    TimeoutHeavy,
    /// Per-cycle additive drift on readings
    Drift,
    /// Degraded station: higher failure rate, contention, self-test failures
    FactoryFlaky,
    /// Two-state HEALTHY/FLAKY chain driving failure bursts
    MarkovFlaky,
}

impl FaultProfile {
    pub const ALL: [FaultProfile; 6] = [
        FaultProfile::Clean,
        FaultProfile::Intermittent,
        FaultProfile::TimeoutHeavy,
        FaultProfile::Drift,
        FaultProfile::FactoryFlaky,
        FaultProfile::MarkovFlaky,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FaultProfile::Clean => "clean",
            FaultProfile::Intermittent => "intermittent",
            FaultProfile::TimeoutHeavy => "timeout-heavy",
            FaultProfile::Drift => "drift",
            FaultProfile::FactoryFlaky => "factory-flaky",
            FaultProfile::MarkovFlaky => "markov-flaky",
        }
    }
}

impl fmt::Display for FaultProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultProfile {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        FaultProfile::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| ProtocolError::UnknownProfile(s.trim().to_string()))
    }
}
