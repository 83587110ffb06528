//! Step and run results
//!
//! Exactly one [`StepResult`] per attempt, failed retries included. The
//! [`RunAggregator`] folds them into a [`RunResult`] as they arrive and
//! forwards each one, in recorded order, to an optional event sink.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use mtap_core::ErrorCode;

use crate::LimitViolation;

/// Why an attempt failed
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    /// `ok == false` reply, real or synthesized by the client
    Protocol { code: ErrorCode },
    /// Connection refused, reset or closed mid-line
    Transport { reason: String },
    /// Successful reply outside the step's limits
    Limit {
        field: String,
        value: Option<Value>,
        reason: String,
    },
}

impl StepError {
    /// Transient codes and transport failures are retried; deterministic
    /// rejections and limit failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            StepError::Protocol { code } => code.is_transient(),
            StepError::Transport { .. } => true,
            StepError::Limit { .. } => false,
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            StepError::Protocol { code } => Some(*code),
            _ => None,
        }
    }
}

impl From<LimitViolation> for StepError {
    fn from(v: LimitViolation) -> Self {
        StepError::Limit {
            field: v.field,
            value: v.value,
            reason: v.reason,
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepError::Protocol { code } => write!(f, "{}", code),
            StepError::Transport { reason } => write!(f, "transport: {}", reason),
            StepError::Limit { field, reason, .. } => write!(f, "limit {}: {}", field, reason),
        }
    }
}

/// Outcome of one attempt of one step for one unit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub sn: String,
    pub step_index: usize,
    pub step_id: String,
    /// 1-based
    pub attempt: u32,
    pub success: bool,
    pub error: Option<StepError>,
    pub message: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
    /// Another attempt of this step follows
    pub will_retry: bool,
    #[serde(default)]
    pub requirement_ids: Vec<String>,
}

impl StepResult {
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().and_then(StepError::code)
    }
}

/// Per-unit verdict
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Every step's final attempt succeeded
    Pass,
    /// Every step ran and at least one failed
    Fail,
    /// Cancellation cut the plan short
    Aborted,
}

/// Aggregated outcome for one unit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnOutcome {
    pub sn: String,
    pub fw_version: String,
    pub verdict: Verdict,
    /// Final attempt of each step that ran, in plan order
    pub steps: Vec<StepResult>,
}

impl SnOutcome {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// Final results that failed
    pub fn failures(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|s| !s.success)
    }
}

/// Aggregated outcome of a whole batch. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub batch_id: String,
    pub station_id: String,
    pub plan: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    /// In input order
    pub per_sn: Vec<SnOutcome>,
    /// Every attempt, in recorded order
    pub attempts: Vec<StepResult>,
    pub overall_passed: bool,
}

impl RunResult {
    pub fn sn(&self, sn: &str) -> Option<&SnOutcome> {
        self.per_sn.iter().find(|o| o.sn == sn)
    }

    /// All attempts of one step for one unit
    pub fn attempts_for<'a>(&'a self, sn: &'a str, step_index: usize) -> impl Iterator<Item = &'a StepResult> {
        self.attempts
            .iter()
            .filter(move |r| r.sn == sn && r.step_index == step_index)
    }

    pub fn passed_count(&self) -> usize {
        self.per_sn.iter().filter(|o| o.passed()).count()
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Default)]
struct SnProgress {
    fw_version: Option<String>,
    finals: Vec<StepResult>,
    completed: bool,
}

/// Builds a [`RunResult`] incrementally
pub struct RunAggregator {
    batch_id: String,
    station_id: String,
    plan: String,
    step_count: usize,
    started_at: DateTime<Utc>,
    order: Vec<String>,
    progress: HashMap<String, SnProgress>,
    attempts: Vec<StepResult>,
    sink: Option<UnboundedSender<StepResult>>,
}

impl RunAggregator {
    pub fn new(
        batch_id: impl Into<String>,
        station_id: impl Into<String>,
        plan: impl Into<String>,
        step_count: usize,
        sns: &[String],
    ) -> Self {
        RunAggregator {
            batch_id: batch_id.into(),
            station_id: station_id.into(),
            plan: plan.into(),
            step_count,
            started_at: Utc::now(),
            order: sns.to_vec(),
            progress: sns.iter().map(|sn| (sn.clone(), SnProgress::default())).collect(),
            attempts: Vec::new(),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: UnboundedSender<StepResult>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Record one attempt. The latest attempt of a step is its final one.
    pub fn record(&mut self, result: StepResult) {
        let progress = self.progress.entry(result.sn.clone()).or_default();
        match progress.finals.last_mut() {
            Some(last) if last.step_index == result.step_index => *last = result.clone(),
            _ => progress.finals.push(result.clone()),
        }

        let closed = self
            .sink
            .as_ref()
            .is_some_and(|sink| sink.send(result.clone()).is_err());
        if closed {
            debug!("event sink closed");
            self.sink = None;
        }
        self.attempts.push(result);
    }

    pub fn set_firmware(&mut self, sn: &str, fw_version: impl Into<String>) {
        self.progress.entry(sn.to_string()).or_default().fw_version = Some(fw_version.into());
    }

    /// Mark a unit finished; `completed` is false when cut short
    pub fn finish_sn(&mut self, sn: &str, completed: bool) {
        self.progress.entry(sn.to_string()).or_default().completed = completed;
    }

    pub fn attempts(&self) -> &[StepResult] {
        &self.attempts
    }

    /// Seal the run
    pub fn finish(mut self, cancelled: bool) -> RunResult {
        let step_count = self.step_count;
        let per_sn: Vec<SnOutcome> = self
            .order
            .iter()
            .map(|sn| {
                let progress = self.progress.remove(sn).unwrap_or_default();
                let verdict = if !progress.completed || progress.finals.len() < step_count {
                    Verdict::Aborted
                } else if progress.finals.iter().all(|s| s.success) {
                    Verdict::Pass
                } else {
                    Verdict::Fail
                };
                SnOutcome {
                    sn: sn.clone(),
                    fw_version: progress.fw_version.unwrap_or_else(|| "unknown".into()),
                    verdict,
                    steps: progress.finals,
                }
            })
            .collect();

        let overall_passed = !cancelled && !per_sn.is_empty() && per_sn.iter().all(SnOutcome::passed);

        RunResult {
            run_id: self.started_at.format("%Y%m%dT%H%M%SZ").to_string(),
            batch_id: self.batch_id,
            station_id: self.station_id,
            plan: self.plan,
            started_at: self.started_at,
            finished_at: Utc::now(),
            cancelled,
            per_sn,
            attempts: self.attempts,
            overall_passed,
        }
    }
}
