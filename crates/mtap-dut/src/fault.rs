//! Fault injection for the DUT simulator
//!
//! Wraps every valid command and decides whether the true response passes
//! through, is delayed past the client deadline, or is replaced by a
//! synthetic failure. Decisions draw from a seeded RNG so that the same seed
//! and the same command sequence reproduce the same fault sequence.
//!
//! Profiles:
//! - clean: pass-through
//! - intermittent: E_INTERNAL with probability p
//! - timeout-heavy: stall with probability q
//! - drift: pass-through, readings accumulate a per-cycle offset
//! - factory-flaky: contention (E_BUSY), higher E_INTERNAL rate, self-test failures
//! - markov-flaky: HEALTHY/FLAKY chain, failure bursts while FLAKY

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use mtap_core::{ErrorCode, FaultProfile, ProtocolError};

/// Parameters behind the profile names
#[derive(Clone, Debug, PartialEq)]
pub struct FaultTuning {
    /// intermittent: E_INTERNAL probability
    pub intermittent_fail_p: f64,
    /// timeout-heavy: stall probability
    pub timeout_p: f64,
    /// timeout-heavy: stall length, longer than any client deadline in use
    pub timeout_delay: Duration,
    /// drift: temperature offset added per cycle
    pub drift_temp_per_cycle_c: f64,
    /// drift: battery offset added per cycle
    pub drift_vbat_per_cycle_v: f64,
    /// factory-flaky: E_INTERNAL probability
    pub factory_fail_p: f64,
    /// factory-flaky: E_BUSY probability
    pub factory_busy_p: f64,
    /// factory-flaky: probability that SELF_TEST reports a failure
    pub factory_self_test_fail_p: f64,
    /// markov-flaky: HEALTHY -> FLAKY transition probability
    pub markov_healthy_to_flaky: f64,
    /// markov-flaky: FLAKY -> HEALTHY transition probability
    pub markov_flaky_to_healthy: f64,
    /// markov-flaky: E_INTERNAL probability while FLAKY
    pub markov_flaky_fail_p: f64,
}

impl Default for FaultTuning {
    fn default() -> Self {
        FaultTuning {
            intermittent_fail_p: 0.2,
            timeout_p: 0.3,
            timeout_delay: Duration::from_secs(5),
            drift_temp_per_cycle_c: 0.05,
            drift_vbat_per_cycle_v: -0.001,
            factory_fail_p: 0.35,
            factory_busy_p: 0.05,
            factory_self_test_fail_p: 0.1,
            markov_healthy_to_flaky: 0.05,
            markov_flaky_to_healthy: 0.2,
            markov_flaky_fail_p: 0.8,
        }
    }
}

impl FaultTuning {
    /// Set the intermittent failure probability
    pub fn with_intermittent_fail_p(mut self, p: f64) -> Self {
        self.intermittent_fail_p = p.clamp(0.0, 1.0);
        self
    }

    /// Set the timeout-heavy stall probability and length
    pub fn with_timeout(mut self, p: f64, delay: Duration) -> Self {
        self.timeout_p = p.clamp(0.0, 1.0);
        self.timeout_delay = delay;
        self
    }

    /// Set the drift rates
    pub fn with_drift(mut self, temp_c: f64, vbat_v: f64) -> Self {
        self.drift_temp_per_cycle_c = temp_c;
        self.drift_vbat_per_cycle_v = vbat_v;
        self
    }

    /// Set the markov chain parameters
    pub fn with_markov(mut self, healthy_to_flaky: f64, flaky_to_healthy: f64, flaky_fail_p: f64) -> Self {
        self.markov_healthy_to_flaky = healthy_to_flaky.clamp(0.0, 1.0);
        self.markov_flaky_to_healthy = flaky_to_healthy.clamp(0.0, 1.0);
        self.markov_flaky_fail_p = flaky_fail_p.clamp(0.0, 1.0);
        self
    }
}

/// Hidden state of the markov-flaky profile
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MarkovState {
    #[default]
    Healthy,
    Flaky,
}

/// Per-drift-step offsets
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DriftStep {
    pub temp_c: f64,
    pub vbat_v: f64,
}

/// What to do with one valid command
#[derive(Clone, Debug, PartialEq)]
pub enum FaultDecision {
    /// Run the handler and reply normally
    Pass,
    /// Skip the handler and reply with a synthetic failure
    Fail { code: ErrorCode, message: String },
    /// Run the handler, then hold the reply for the given duration
    Delay(Duration),
}

/// Injection counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FaultStats {
    pub commands_evaluated: u64,
    pub injected_failures: u64,
    pub injected_busy: u64,
    pub injected_delays: u64,
    pub self_test_overrides: u64,
    pub markov_transitions: u64,
}

/// Profile-driven fault injector
pub struct FaultInjector {
    initial_profile: FaultProfile,
    profile: FaultProfile,
    tuning: FaultTuning,
    seed: u64,
    rng: StdRng,
    markov: MarkovState,
    stats: FaultStats,
}

impl FaultInjector {
    /// Create an injector with an initial profile and seed
    pub fn new(profile: FaultProfile, tuning: FaultTuning, seed: u64) -> Self {
        FaultInjector {
            initial_profile: profile,
            profile,
            tuning,
            seed,
            rng: StdRng::seed_from_u64(seed),
            markov: MarkovState::Healthy,
            stats: FaultStats::default(),
        }
    }

    pub fn profile(&self) -> FaultProfile {
        self.profile
    }

    /// Switch profile. The markov chain restarts HEALTHY.
    pub fn set_profile(&mut self, profile: FaultProfile) {
        if profile != self.profile {
            debug!(from = %self.profile, to = %profile, "fault profile changed");
        }
        self.profile = profile;
        self.markov = MarkovState::Healthy;
    }

    pub fn tuning(&self) -> &FaultTuning {
        &self.tuning
    }

    pub fn markov_state(&self) -> MarkovState {
        self.markov
    }

    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }

    /// Restore the initial profile, reseed and clear counters
    pub fn reset(&mut self) {
        self.profile = self.initial_profile;
        self.rng = StdRng::seed_from_u64(self.seed);
        self.markov = MarkovState::Healthy;
        self.stats = FaultStats::default();
    }

    /// Decide the fate of one valid command under the active profile
    pub fn evaluate(&mut self) -> FaultDecision {
        self.stats.commands_evaluated += 1;

        let decision = match self.profile {
            FaultProfile::Clean | FaultProfile::Drift => FaultDecision::Pass,
            FaultProfile::Intermittent => {
                if self.roll(self.tuning.intermittent_fail_p) {
                    internal("Simulated intermittent fault")
                } else {
                    FaultDecision::Pass
                }
            }
            FaultProfile::TimeoutHeavy => {
                if self.roll(self.tuning.timeout_p) {
                    FaultDecision::Delay(self.tuning.timeout_delay)
                } else {
                    FaultDecision::Pass
                }
            }
            FaultProfile::FactoryFlaky => {
                if self.roll(self.tuning.factory_busy_p) {
                    rejected(ProtocolError::Busy("simulated station contention".into()))
                } else if self.roll(self.tuning.factory_fail_p) {
                    internal("Simulated degraded-station fault")
                } else {
                    FaultDecision::Pass
                }
            }
            FaultProfile::MarkovFlaky => {
                self.step_markov();
                if self.markov == MarkovState::Flaky && self.roll(self.tuning.markov_flaky_fail_p) {
                    internal("Simulated burst fault")
                } else {
                    FaultDecision::Pass
                }
            }
        };

        match &decision {
            FaultDecision::Pass => {}
            FaultDecision::Fail { code, .. } => {
                if *code == ErrorCode::Busy {
                    self.stats.injected_busy += 1;
                } else {
                    self.stats.injected_failures += 1;
                }
                warn!(profile = %self.profile, code = %code, "injected failure");
            }
            FaultDecision::Delay(delay) => {
                self.stats.injected_delays += 1;
                warn!(profile = %self.profile, delay_ms = delay.as_millis() as u64, "injected stall");
            }
        }

        decision
    }

    /// Drift offsets to apply this cycle, if the profile drifts
    pub fn drift_step(&self) -> Option<DriftStep> {
        match self.profile {
            FaultProfile::Drift => Some(DriftStep {
                temp_c: self.tuning.drift_temp_per_cycle_c,
                vbat_v: self.tuning.drift_vbat_per_cycle_v,
            }),
            _ => None,
        }
    }

    /// Whether this SELF_TEST should report a failure
    pub fn self_test_fails(&mut self) -> bool {
        let fails = match self.profile {
            FaultProfile::FactoryFlaky => self.roll(self.tuning.factory_self_test_fail_p),
            _ => false,
        };
        if fails {
            self.stats.self_test_overrides += 1;
        }
        fails
    }

    /// One transition draw per command, independent of command type
    fn step_markov(&mut self) {
        let current = self.markov;
        let next = match current {
            MarkovState::Healthy if self.roll(self.tuning.markov_healthy_to_flaky) => {
                MarkovState::Flaky
            }
            MarkovState::Flaky if self.roll(self.tuning.markov_flaky_to_healthy) => {
                MarkovState::Healthy
            }
            state => state,
        };
        if next != current {
            self.stats.markov_transitions += 1;
            debug!(from = ?current, to = ?next, "markov transition");
            self.markov = next;
        }
    }

    #[inline]
    fn roll(&mut self, p: f64) -> bool {
        self.rng.gen::<f64>() < p
    }
}

fn rejected(err: ProtocolError) -> FaultDecision {
    FaultDecision::Fail {
        code: err.code(),
        message: err.to_string(),
    }
}

fn internal(message: &str) -> FaultDecision {
    FaultDecision::Fail {
        code: ErrorCode::Internal,
        message: message.to_string(),
    }
}
