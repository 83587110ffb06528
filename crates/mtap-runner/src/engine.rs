//! Runner engine
//!
//! Units run on a bounded worker pool; steps within a unit run strictly in
//! plan order. Per (unit, step):
//!
//! ```text
//! PENDING -> ATTEMPTING -> SUCCESS
//!                       -> RETRYING -> ATTEMPTING   (transient code or transport failure)
//!                       -> FAILED                   (deterministic, or budget spent)
//! ```
//!
//! A failed step does not stop the unit's remaining steps. Cancellation
//! stops new attempts; an in-flight attempt finishes or times out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Map;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use mtap_core::{Command, ConfigError, ErrorCode};

use crate::{
    ClientConfig, ProtocolClient, RunAggregator, RunResult, RunnerResult, Step, StepError,
    StepResult, TestPlan, MAX_RETRIES,
};

/// Engine configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RunnerConfig {
    pub client: ClientConfig,
    /// Units processed concurrently
    pub workers: usize,
    /// Retry budget for steps without their own
    pub default_retries: u32,
    /// Pause between attempts for steps without their own
    pub default_backoff: Duration,
    pub batch_id: String,
    pub station_id: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        crate::RunnerSettings::default().into()
    }
}

impl RunnerConfig {
    pub fn with_client(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Default retry budget, capped at [`MAX_RETRIES`]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries.min(MAX_RETRIES);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.default_backoff = backoff;
        self
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>, station_id: impl Into<String>) -> Self {
        self.batch_id = batch_id.into();
        self.station_id = station_id.into();
        self
    }

    /// Reject budgets that were set directly past [`MAX_RETRIES`]
    pub fn validate(&self) -> RunnerResult<()> {
        if self.default_retries > MAX_RETRIES {
            return Err(ConfigError::InvalidValue {
                key: "default_retries".into(),
                value: self.default_retries.to_string(),
                reason: format!("must be at most {}", MAX_RETRIES),
            }
            .into());
        }
        Ok(())
    }
}

/// Run-level cancellation. Sticky once triggered.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        CancelHandle { tx: Arc::new(tx) }
    }

    /// Stop issuing new attempts
    pub fn cancel(&self) {
        if !self.tx.send_replace(true) {
            info!("run cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

enum Event {
    Firmware { sn: String, fw: String },
    Attempt(StepResult),
    Done { sn: String, completed: bool },
}

/// Executes a plan over a batch of units
pub struct RunnerEngine {
    config: Arc<RunnerConfig>,
    cancel: CancelHandle,
    sink: Option<mpsc::UnboundedSender<StepResult>>,
}

impl RunnerEngine {
    pub fn new(config: RunnerConfig) -> Self {
        RunnerEngine {
            config: Arc::new(config),
            cancel: CancelHandle::new(),
            sink: None,
        }
    }

    /// Forward every StepResult, in recorded order, to `sink`
    pub fn with_event_sink(mut self, sink: mpsc::UnboundedSender<StepResult>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run `plan` against `sns`. Plan errors are returned before any attempt.
    pub async fn run(&self, plan: &TestPlan, sns: &[String]) -> RunnerResult<RunResult> {
        self.config.validate()?;
        plan.validate(sns)?;
        let rendered = sns
            .iter()
            .map(|sn| Ok((sn.clone(), plan.render(sn)?)))
            .collect::<RunnerResult<Vec<_>>>()?;

        let workers = self.config.workers.max(1);
        let mut aggregator = RunAggregator::new(
            self.config.batch_id.clone(),
            self.config.station_id.clone(),
            plan.name.clone(),
            plan.len(),
            sns,
        );
        if let Some(sink) = &self.sink {
            aggregator = aggregator.with_sink(sink.clone());
        }

        info!(
            batch = %self.config.batch_id,
            station = %self.config.station_id,
            plan = %plan.name,
            units = sns.len(),
            steps = plan.len(),
            workers,
            "run started"
        );

        let slots = Arc::new(Semaphore::new(workers));
        let plan = Arc::new(plan.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::with_capacity(rendered.len());
        for (sn, commands) in rendered {
            let worker = Worker {
                config: Arc::clone(&self.config),
                plan: Arc::clone(&plan),
                events: tx.clone(),
                stop: self.cancel.subscribe(),
            };
            let slots = Arc::clone(&slots);
            tasks.push(tokio::spawn(async move {
                // Permits are granted FIFO, so units start in input order
                let Ok(_permit) = slots.acquire_owned().await else {
                    return;
                };
                worker.run_unit(sn, commands).await;
            }));
        }
        drop(tx);

        while let Some(event) = rx.recv().await {
            match event {
                Event::Firmware { sn, fw } => aggregator.set_firmware(&sn, fw),
                Event::Attempt(result) => aggregator.record(result),
                Event::Done { sn, completed } => aggregator.finish_sn(&sn, completed),
            }
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "unit task failed");
            }
        }

        let result = aggregator.finish(self.cancel.is_cancelled());
        info!(
            run_id = %result.run_id,
            passed = result.passed_count(),
            units = result.per_sn.len(),
            attempts = result.attempts.len(),
            cancelled = result.cancelled,
            overall_passed = result.overall_passed,
            "run finished"
        );
        Ok(result)
    }
}

struct Worker {
    config: Arc<RunnerConfig>,
    plan: Arc<TestPlan>,
    events: mpsc::UnboundedSender<Event>,
    stop: watch::Receiver<bool>,
}

impl Worker {
    async fn run_unit(mut self, sn: String, commands: Vec<Command>) {
        if self.is_cancelled() {
            self.emit(Event::Done { sn, completed: false });
            return;
        }

        debug!(sn = %sn, "unit started");
        let mut client = ProtocolClient::new(self.config.client.clone());
        if let Some(fw) = client.firmware_version(&sn).await {
            self.emit(Event::Firmware { sn: sn.clone(), fw });
        }

        let plan = Arc::clone(&self.plan);
        let mut completed = true;
        for (index, (step, command)) in plan.steps.iter().zip(&commands).enumerate() {
            if self.is_cancelled() || !self.run_step(&mut client, &sn, index, step, command).await {
                completed = false;
                break;
            }
        }

        debug!(sn = %sn, completed, "unit finished");
        self.emit(Event::Done { sn, completed });
    }

    /// Run all attempts of one step. Returns false if cancelled mid-step.
    async fn run_step(
        &mut self,
        client: &mut ProtocolClient,
        sn: &str,
        index: usize,
        step: &Step,
        command: &Command,
    ) -> bool {
        let timeout = step.timeout.unwrap_or(self.config.client.timeout);
        let max_retries = step.max_retries.unwrap_or(self.config.default_retries);
        let backoff = step.backoff.unwrap_or(self.config.default_backoff);

        for attempt in 1..=max_retries.saturating_add(1) {
            let timestamp = Utc::now();
            let started = Instant::now();
            let reply = client.send(command, timeout).await;
            let latency = started.elapsed();

            let (error, message, data) = match reply {
                Ok(resp) if resp.ok => match step.limits.as_ref().map(|l| l.check(&resp.data)) {
                    Some(Err(violation)) => {
                        let message = violation.to_string();
                        (Some(StepError::from(violation)), message, resp.data)
                    }
                    _ => (None, resp.message, resp.data),
                },
                Ok(resp) => (
                    Some(StepError::Protocol {
                        code: resp.error_code.unwrap_or(ErrorCode::Internal),
                    }),
                    resp.message,
                    Map::new(),
                ),
                Err(e) => (
                    Some(StepError::Transport {
                        reason: e.to_string(),
                    }),
                    e.to_string(),
                    Map::new(),
                ),
            };

            let will_retry = attempt <= max_retries && error.as_ref().is_some_and(StepError::is_retryable);
            let latency_ms = latency.as_millis() as u64;
            match &error {
                None => debug!(sn, step = %step.id, attempt, latency_ms, "attempt passed"),
                Some(e) if will_retry => {
                    warn!(sn, step = %step.id, attempt, error = %e, "attempt failed, retrying")
                }
                Some(e) => warn!(sn, step = %step.id, attempt, error = %e, "step failed"),
            }

            self.emit(Event::Attempt(StepResult {
                sn: sn.to_string(),
                step_index: index,
                step_id: step.id.clone(),
                attempt,
                success: error.is_none(),
                error,
                message,
                data,
                latency,
                timestamp,
                will_retry,
                requirement_ids: step.requirement_ids.clone(),
            }));

            if !will_retry {
                return true;
            }
            if self.is_cancelled() || (!backoff.is_zero() && !self.pause(backoff).await) {
                return false;
            }
        }
        true
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&mut self, delay: Duration) -> bool {
        let slept = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancelled(&mut self.stop) => false,
        };
        slept && !self.is_cancelled()
    }

    fn is_cancelled(&self) -> bool {
        *self.stop.borrow()
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

async fn cancelled(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sequential_sns, Limits, RunError, Verdict};
    use mtap_core::FaultProfile;
    use chrono::DateTime;
    use mtap_dut::{DutServer, FaultTuning, ServerConfig, ShutdownHandle};

    async fn dut(config: ServerConfig) -> (String, ShutdownHandle) {
        let server = DutServer::bind(&config).await.unwrap();
        let addr = server.local_addr().to_string();
        let handle = server.shutdown_handle();
        tokio::spawn(server.run());
        (addr, handle)
    }

    fn engine(addr: &str) -> RunnerEngine {
        RunnerEngine::new(
            RunnerConfig::default()
                .with_client(ClientConfig::new(addr).with_timeout(Duration::from_secs(2)))
                .with_backoff(Duration::ZERO),
        )
    }

    #[tokio::test]
    async fn test_clean_plan_passes() {
        let (addr, handle) = dut(ServerConfig::local()).await;
        let plan = TestPlan::new("smoke")
            .with_step(Step::new("ping", "PING {sn}").unwrap())
            .with_step(Step::new("set", "SET_TEMP {sn} {target}").unwrap().with_binding("target", "30"))
            .with_step(
                Step::new("read", "READ_TEMP {sn}")
                    .unwrap()
                    .with_limits(Limits::range("temp_c", 29.5, 30.5))
                    .with_requirements(["REQ-TEMP-001"]),
            );
        let sns = sequential_sns(3);

        let run = engine(&addr).run(&plan, &sns).await.unwrap();
        assert!(run.overall_passed);
        assert_eq!(run.attempts.len(), 9);
        for (outcome, sn) in run.per_sn.iter().zip(&sns) {
            assert_eq!(&outcome.sn, sn);
            assert_eq!(outcome.verdict, Verdict::Pass);
            assert_eq!(outcome.fw_version, "1.0.0");
            assert_eq!(outcome.steps.len(), 3);
        }
        assert_eq!(run.attempts_for("SN0002", 2).next().unwrap().requirement_ids, vec!["REQ-TEMP-001"]);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_retry_budget_then_next_step() {
        let tuning = FaultTuning::default().with_intermittent_fail_p(1.0);
        let (addr, handle) = dut(ServerConfig::local()
            .with_profile(FaultProfile::Intermittent)
            .with_tuning(tuning))
        .await;
        let plan = TestPlan::new("flaky")
            .with_step(Step::new("read", "READ_TEMP {sn}").unwrap().with_retries(2))
            .with_step(Step::new("selftest", "SELF_TEST {sn}").unwrap().with_retries(0));
        let sns = vec!["SN0001".to_string()];

        let run = engine(&addr).run(&plan, &sns).await.unwrap();
        let read: Vec<_> = run.attempts_for("SN0001", 0).collect();
        assert_eq!(read.len(), 3);
        assert_eq!(read.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(read.iter().all(|r| r.error_code() == Some(ErrorCode::Internal)));
        assert!(read[1].will_retry);
        assert!(!read[2].will_retry);

        // The failed first step does not stop the plan
        assert_eq!(run.attempts_for("SN0001", 1).count(), 1);
        let unit = run.sn("SN0001").unwrap();
        assert_eq!(unit.verdict, Verdict::Fail);
        assert_eq!(unit.fw_version, "unknown");
        assert!(!run.overall_passed);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_deterministic_rejection_not_retried() {
        let (addr, handle) = dut(ServerConfig::local()).await;
        let plan = TestPlan::new("range")
            .with_step(
                Step::new("set", "SET_TEMP {sn} 999")
                    .unwrap()
                    .with_retries(5),
            )
            .with_step(Step::new("read", "READ_TEMP {sn}").unwrap());
        let sns = vec!["SN0001".to_string()];

        let run = engine(&addr).run(&plan, &sns).await.unwrap();
        let set: Vec<_> = run.attempts_for("SN0001", 0).collect();
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].error_code(), Some(ErrorCode::OutOfRange));
        assert!(run.attempts_for("SN0001", 1).next().unwrap().success);
        assert_eq!(run.sn("SN0001").unwrap().verdict, Verdict::Fail);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_limit_failure_not_retried() {
        let (addr, handle) = dut(ServerConfig::local()).await;
        let plan = TestPlan::new("limits").with_step(
            Step::new("read", "READ_TEMP {sn}")
                .unwrap()
                .with_retries(3)
                .with_limits(Limits::at_least("temp_c", 100.0)),
        );

        let run = engine(&addr).run(&plan, &["SN1".to_string()]).await.unwrap();
        assert_eq!(run.attempts.len(), 1);
        assert!(matches!(run.attempts[0].error, Some(StepError::Limit { .. })));
        assert!(run.attempts[0].data.contains_key("temp_c"));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_stalls_are_retried_as_transient() {
        let tuning = FaultTuning::default().with_timeout(1.0, Duration::from_millis(300));
        let (addr, handle) = dut(ServerConfig::local()
            .with_profile(FaultProfile::TimeoutHeavy)
            .with_tuning(tuning))
        .await;
        let plan = TestPlan::new("stall").with_step(
            Step::new("read", "READ_TEMP {sn}")
                .unwrap()
                .with_timeout(Duration::from_millis(100))
                .with_retries(1),
        );
        let engine = RunnerEngine::new(
            RunnerConfig::default()
                .with_client(ClientConfig::new(&addr).with_timeout(Duration::from_millis(100)))
                .with_backoff(Duration::ZERO),
        );

        let run = engine.run(&plan, &["SN1".to_string()]).await.unwrap();
        assert_eq!(run.attempts.len(), 2);
        for attempt in &run.attempts {
            assert_eq!(attempt.error_code(), Some(ErrorCode::Timeout));
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_unreachable_dut_is_transport_failure() {
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let plan = TestPlan::new("down").with_step(Step::new("ping", "PING {sn}").unwrap().with_retries(1));

        let run = engine(&addr).run(&plan, &["SN1".to_string()]).await.unwrap();
        assert_eq!(run.attempts.len(), 2);
        assert!(run
            .attempts
            .iter()
            .all(|r| matches!(r.error, Some(StepError::Transport { .. }))));
        assert_eq!(run.sn("SN1").unwrap().fw_version, "unknown");
    }

    #[tokio::test]
    async fn test_invalid_plan_makes_no_attempts() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = engine("127.0.0.1:9").with_event_sink(tx);
        let plan = TestPlan::new("bad").with_step(Step::new("set", "SET_TEMP {sn} {t}").unwrap());

        let err = engine.run(&plan, &["SN1".to_string()]).await.unwrap_err();
        assert!(matches!(err, RunError::Plan(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_single_worker_keeps_input_order() {
        let (addr, handle) = dut(ServerConfig::local()).await;
        let plan = TestPlan::new("order")
            .with_step(Step::new("ping", "PING {sn}").unwrap())
            .with_step(Step::new("read", "READ_TEMP {sn}").unwrap());
        let sns = vec!["SN-B".to_string(), "SN-A".to_string(), "SN-C".to_string()];
        let engine = RunnerEngine::new(
            RunnerConfig::default()
                .with_client(ClientConfig::new(&addr))
                .with_workers(1),
        );

        let run = engine.run(&plan, &sns).await.unwrap();
        let order: Vec<(&str, usize)> = run
            .attempts
            .iter()
            .map(|r| (r.sn.as_str(), r.step_index))
            .collect();
        assert_eq!(
            order,
            vec![("SN-B", 0), ("SN-B", 1), ("SN-A", 0), ("SN-A", 1), ("SN-C", 0), ("SN-C", 1)]
        );

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_event_sink_sees_every_attempt() {
        let tuning = FaultTuning::default().with_intermittent_fail_p(1.0);
        let (addr, handle) = dut(ServerConfig::local()
            .with_profile(FaultProfile::Intermittent)
            .with_tuning(tuning))
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let plan = TestPlan::new("events").with_step(Step::new("read", "READ_TEMP {sn}").unwrap().with_retries(1));

        let run = engine(&addr)
            .with_event_sink(tx)
            .run(&plan, &sequential_sns(2))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(result) = rx.try_recv() {
            seen.push(result);
        }
        assert_eq!(seen, run.attempts);
        assert_eq!(seen.len(), 4);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let (addr, handle) = dut(ServerConfig::local()).await;
        let engine = engine(&addr);
        engine.cancel_handle().cancel();

        let plan = TestPlan::new("cancelled").with_step(Step::new("ping", "PING {sn}").unwrap());
        let run = engine.run(&plan, &sequential_sns(2)).await.unwrap();
        assert!(run.cancelled);
        assert!(run.attempts.is_empty());
        assert!(run.per_sn.iter().all(|o| o.verdict == Verdict::Aborted));
        assert!(!run.overall_passed);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let tuning = FaultTuning::default().with_intermittent_fail_p(1.0);
        let (addr, handle) = dut(ServerConfig::local()
            .with_profile(FaultProfile::Intermittent)
            .with_tuning(tuning))
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = engine(&addr).with_event_sink(tx);
        let cancel = engine.cancel_handle();
        let plan = TestPlan::new("slow").with_step(
            Step::new("read", "READ_TEMP {sn}")
                .unwrap()
                .with_retries(5)
                .with_backoff(Duration::from_secs(30)),
        );

        let run = tokio::spawn(async move { engine.run(&plan, &["SN1".to_string()]).await });
        let first = rx.recv().await.unwrap();
        assert!(first.will_retry);
        cancel.cancel();

        let run = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(run.cancelled);
        assert_eq!(run.attempts.len(), 1);
        assert_eq!(run.sn("SN1").unwrap().verdict, Verdict::Aborted);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_retry_default_is_capped() {
        let tuning = FaultTuning::default().with_intermittent_fail_p(1.0);
        let (addr, handle) = dut(ServerConfig::local()
            .with_profile(FaultProfile::Intermittent)
            .with_tuning(tuning))
        .await;
        let engine = RunnerEngine::new(
            RunnerConfig::default()
                .with_client(ClientConfig::new(&addr))
                .with_retries(u32::MAX)
                .with_backoff(Duration::ZERO),
        );
        assert_eq!(engine.config().default_retries, MAX_RETRIES);

        let plan = TestPlan::new("ping").with_step(Step::new("ping", "PING {sn}").unwrap());
        let run = engine.run(&plan, &["SN1".to_string()]).await.unwrap();
        assert_eq!(run.attempts.len(), MAX_RETRIES as usize + 1);
        assert_eq!(run.sn("SN1").unwrap().verdict, Verdict::Fail);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_oversized_retry_default_rejected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = RunnerConfig {
            default_retries: 50,
            ..RunnerConfig::default().with_client(ClientConfig::new("127.0.0.1:9"))
        };
        let engine = RunnerEngine::new(config).with_event_sink(tx);
        let plan = TestPlan::new("ping").with_step(Step::new("ping", "PING {sn}").unwrap());

        let err = engine.run(&plan, &["SN1".to_string()]).await.unwrap_err();
        assert!(matches!(err, RunError::Config(_)));
        assert!(rx.try_recv().is_err());
    }

    fn max_overlap(attempts: &[StepResult]) -> usize {
        let mut edges: Vec<(DateTime<Utc>, i32)> = Vec::new();
        for r in attempts {
            let end = r.timestamp + chrono::Duration::from_std(r.latency).unwrap();
            edges.push((r.timestamp, 1));
            edges.push((end, -1));
        }
        // Ends sort before starts at the same instant
        edges.sort();
        let mut open = 0i32;
        let mut peak = 0i32;
        for (_, delta) in edges {
            open += delta;
            peak = peak.max(open);
        }
        peak as usize
    }

    #[tokio::test]
    async fn test_worker_cap_bounds_concurrent_units() {
        let tuning = FaultTuning::default().with_timeout(1.0, Duration::from_millis(300));
        let (addr, handle) = dut(ServerConfig::local()
            .with_profile(FaultProfile::TimeoutHeavy)
            .with_tuning(tuning))
        .await;
        let engine = RunnerEngine::new(
            RunnerConfig::default()
                .with_client(ClientConfig::new(&addr).with_timeout(Duration::from_secs(2)))
                .with_workers(2),
        );
        let plan = TestPlan::new("slow").with_step(Step::new("read", "READ_TEMP {sn}").unwrap());

        let started = Instant::now();
        let run = engine.run(&plan, &sequential_sns(4)).await.unwrap();
        let elapsed = started.elapsed();

        assert!(run.overall_passed);
        assert_eq!(run.attempts.len(), 4);
        assert_eq!(max_overlap(&run.attempts), 2);
        // Each unit holds a slot for a stalled firmware PING plus a stalled read
        assert!(elapsed >= Duration::from_millis(1200), "elapsed {:?}", elapsed);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_attempt_finish() {
        let tuning = FaultTuning::default().with_timeout(1.0, Duration::from_millis(500));
        let server = DutServer::bind(
            &ServerConfig::local()
                .with_profile(FaultProfile::TimeoutHeavy)
                .with_tuning(tuning),
        )
        .await
        .unwrap();
        let addr = server.local_addr().to_string();
        let handle = server.shutdown_handle();
        let dispatcher = server.dispatcher();
        tokio::spawn(server.run());

        let engine = engine(&addr);
        let cancel = engine.cancel_handle();
        let plan = TestPlan::new("two")
            .with_step(Step::new("read", "READ_TEMP {sn}").unwrap())
            .with_step(Step::new("selftest", "SELF_TEST {sn}").unwrap());
        let run = tokio::spawn(async move { engine.run(&plan, &["SN1".to_string()]).await });

        // Probe answered, first step dispatched and held by its stall
        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.fault_stats().commands_evaluated < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();

        let run = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(run.cancelled);
        assert_eq!(run.attempts.len(), 1);
        assert!(run.attempts[0].success);
        assert_eq!(run.attempts[0].step_id, "read");

        let unit = run.sn("SN1").unwrap();
        assert_eq!(unit.verdict, Verdict::Aborted);
        assert_eq!(unit.fw_version, "1.0.0");
        assert!(!run.overall_passed);

        handle.shutdown();
    }
}
