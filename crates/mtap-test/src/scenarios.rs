//! End-to-end scenarios
//!
//! Plans used by the scenario tests, and the tests themselves. Every test
//! starts its own server, so profiles and seeds never leak between tests.

use mtap_runner::{Limits, RunnerResult, Step, TestPlan};

/// PING, SELF_TEST, READ_TEMP within a wide band
pub fn smoke_plan() -> RunnerResult<TestPlan> {
    Ok(TestPlan::new("smoke")
        .with_step(Step::new("ping", "PING {sn}")?.with_requirements(["REQ-COMM-001"]))
        .with_step(
            Step::new("self-test", "SELF_TEST {sn}")?
                .with_limits(Limits::equals("self_test_ok", true))
                .with_requirements(["REQ-DIAG-001"]),
        )
        .with_step(
            Step::new("read-temp", "READ_TEMP {sn}")?
                .with_limits(Limits::range("temp_c", -40.0, 125.0))
                .with_requirements(["REQ-THERM-001"]),
        ))
}

/// Set the chamber target, then read it back within `tolerance`
pub fn thermal_plan(target_c: f64, tolerance: f64) -> RunnerResult<TestPlan> {
    Ok(TestPlan::new("thermal")
        .with_step(
            Step::new("set-temp", "SET_TEMP {sn} {target}")?
                .with_binding("target", target_c.to_string())
                .with_requirements(["REQ-THERM-002"]),
        )
        .with_step(
            Step::new("read-temp", "READ_TEMP {sn}")?
                .with_limits(Limits::range("temp_c", target_c - tolerance, target_c + tolerance))
                .with_requirements(["REQ-THERM-002"]),
        ))
}

/// A single READ_TEMP with an explicit retry budget
pub fn retry_plan(max_retries: u32) -> RunnerResult<TestPlan> {
    Ok(TestPlan::new("retry").with_step(Step::new("read-temp", "READ_TEMP {sn}")?.with_retries(max_retries)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DutHarness;
    use std::time::{Duration, Instant};

    use mtap_core::{Command, ErrorCode, FaultProfile, Response};
    use mtap_dut::{DeviceDefaults, Dispatcher, FaultTuning, VBAT_MAX_V, VBAT_MIN_V};
    use mtap_runner::{sequential_sns, StepError, Verdict};
    use proptest::prelude::*;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_ping_on_fresh_server() {
        let dut = DutHarness::clean().await.unwrap();
        let mut session = dut.session().await.unwrap();

        session.write_raw(b"PING SN0001\n").await.unwrap();
        let raw = session.read_line().await.unwrap();
        assert!(raw.ends_with('\n'));
        assert_eq!(raw.matches('\n').count(), 1);
        assert!(raw.contains("\"error_code\":null"));

        let resp = Response::from_line(&raw).unwrap();
        assert!(resp.ok);
        assert_eq!(resp.data_str("sn"), Some("SN0001"));
        assert_eq!(resp.data_str("mode"), Some("NORMAL"));
        let vbat = resp.data_f64("vbat_v").unwrap();
        assert!((VBAT_MIN_V..=VBAT_MAX_V).contains(&vbat));
    }

    #[tokio::test]
    async fn test_set_temp_out_of_range_keeps_state() {
        let dut = DutHarness::clean().await.unwrap();
        let mut session = dut.session().await.unwrap();

        let before = session.request("READ_TEMP SN0001").await.unwrap();
        let resp = session.request("SET_TEMP SN0001 999").await.unwrap();
        assert!(!resp.ok);
        assert_eq!(resp.error_code, Some(ErrorCode::OutOfRange));
        assert!(resp.data.is_empty());

        let after = session.request("READ_TEMP SN0001").await.unwrap();
        assert_eq!(after.data_f64("temp_c"), before.data_f64("temp_c"));
    }

    #[tokio::test]
    async fn test_timeout_heavy_yields_client_timeout() {
        let tuning = FaultTuning::default().with_timeout(1.0, Duration::from_millis(800));
        let dut = DutHarness::with_profile(FaultProfile::Clean, tuning, 0).await.unwrap();
        let mut client = dut.client(Duration::from_millis(200));

        let set = Command::new("SET_FAULT_PROFILE", ["timeout-heavy"]);
        assert!(client.call(&set).await.unwrap().ok);

        let started = Instant::now();
        let resp = client.call(&Command::new("READ_TEMP", ["SN0001"])).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(resp.error_code, Some(ErrorCode::Timeout));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_late_reply_never_misattributed() {
        let tuning = FaultTuning::default().with_timeout(1.0, Duration::from_millis(400));
        let dut = DutHarness::with_profile(FaultProfile::TimeoutHeavy, tuning, 0).await.unwrap();
        let mut client = dut.client(Duration::from_millis(100));

        let resp = client.call(&Command::new("READ_TEMP", ["SN0001"])).await.unwrap();
        assert_eq!(resp.error_code, Some(ErrorCode::Timeout));

        let mut control = dut.session().await.unwrap();
        assert!(control.request("SET_FAULT_PROFILE clean").await.unwrap().ok);

        let resp = client.call(&Command::new("PING", ["SN0002"])).await.unwrap();
        assert!(resp.ok);
        assert_eq!(resp.cmd(), Some("PING"));
        assert_eq!(resp.data_str("sn"), Some("SN0002"));
    }

    #[tokio::test]
    async fn test_runner_exhausts_retries_under_intermittent() {
        let tuning = FaultTuning::default().with_intermittent_fail_p(1.0);
        let dut = DutHarness::with_profile(FaultProfile::Intermittent, tuning, 7).await.unwrap();
        let sns = vec!["SN0001".to_string()];

        let run = dut.runner(TIMEOUT).run(&retry_plan(2).unwrap(), &sns).await.unwrap();
        assert_eq!(run.attempts.len(), 3);
        for (i, attempt) in run.attempts.iter().enumerate() {
            assert_eq!(attempt.attempt as usize, i + 1);
            assert!(!attempt.success);
            assert_eq!(attempt.error_code(), Some(ErrorCode::Internal));
        }
        assert_eq!(run.sn("SN0001").unwrap().verdict, Verdict::Fail);
        assert!(!run.overall_passed);
    }

    #[tokio::test]
    async fn test_bad_args_single_attempt() {
        let dut = DutHarness::clean().await.unwrap();
        let plan = TestPlan::new("bad-args")
            .with_step(Step::new("set", "SET_TEMP {sn} hot").unwrap().with_retries(4));

        let run = dut.runner(TIMEOUT).run(&plan, &sequential_sns(1)).await.unwrap();
        assert_eq!(run.attempts.len(), 1);
        assert_eq!(run.attempts[0].error_code(), Some(ErrorCode::BadArgs));
    }

    #[tokio::test]
    async fn test_clean_set_then_read_is_exact() {
        let dut = DutHarness::clean().await.unwrap();
        let mut session = dut.session().await.unwrap();

        for value in [-40.0, -12.75, 0.0, 0.1, 36.6, 99.99, 125.0] {
            let set = session.request(&format!("SET_TEMP SN0001 {}", value)).await.unwrap();
            assert!(set.ok, "SET_TEMP {} rejected", value);
            assert!(set.data.is_empty());
            let read = session.request("READ_TEMP SN0001").await.unwrap();
            assert_eq!(read.data_f64("temp_c"), Some(value));
        }
    }

    #[tokio::test]
    async fn test_units_are_isolated_across_sessions() {
        let dut = DutHarness::clean().await.unwrap();
        let mut a = dut.session().await.unwrap();
        let mut b = dut.session().await.unwrap();

        let (set, baseline) = tokio::join!(a.request("SET_TEMP SN0001 10"), b.request("READ_TEMP SN0002"));
        assert!(set.unwrap().ok);
        assert_eq!(baseline.unwrap().data_f64("temp_c"), Some(25.0));

        let read = b.request("READ_TEMP SN0002").await.unwrap();
        assert_eq!(read.data_f64("temp_c"), Some(25.0));
        let read = a.request("READ_TEMP SN0001").await.unwrap();
        assert_eq!(read.data_f64("temp_c"), Some(10.0));
    }

    #[tokio::test]
    async fn test_session_survives_malformed_lines() {
        let dut = DutHarness::clean().await.unwrap();
        let mut session = dut.session().await.unwrap();

        let resp = session.request("FLY SN0001").await.unwrap();
        assert_eq!(resp.error_code, Some(ErrorCode::UnknownCmd));
        let resp = session.request("PING").await.unwrap();
        assert_eq!(resp.error_code, Some(ErrorCode::BadArgs));
        let resp = session.request("SET_FAULT_PROFILE").await.unwrap();
        assert_eq!(resp.error_code, Some(ErrorCode::BadArgs));
        let resp = session.request("set_temp   SN0001    NaN").await.unwrap();
        assert_eq!(resp.error_code, Some(ErrorCode::BadArgs));

        let resp = session.request("ping SN0001").await.unwrap();
        assert!(resp.ok);
    }

    #[tokio::test]
    async fn test_intermittent_pattern_is_reproducible() {
        let tuning = FaultTuning::default().with_intermittent_fail_p(0.5);
        let script: Vec<String> = (0..40).map(|i| format!("READ_TEMP SN{:04}", i % 4)).collect();

        let mut patterns = Vec::new();
        for _ in 0..2 {
            let dut = DutHarness::with_profile(FaultProfile::Intermittent, tuning.clone(), 1234)
                .await
                .unwrap();
            let mut session = dut.session().await.unwrap();
            let mut pattern = Vec::new();
            for line in &script {
                pattern.push(session.request(line).await.unwrap().ok);
            }
            patterns.push(pattern);
        }

        assert_eq!(patterns[0], patterns[1]);
        assert!(patterns[0].iter().any(|ok| *ok));
        assert!(patterns[0].iter().any(|ok| !*ok));
    }

    #[tokio::test]
    async fn test_reset_restores_initial_state() {
        let tuning = FaultTuning::default().with_intermittent_fail_p(0.5);
        let dut = DutHarness::with_profile(FaultProfile::Intermittent, tuning, 99).await.unwrap();
        let mut session = dut.session().await.unwrap();

        let mut first = Vec::new();
        for _ in 0..10 {
            first.push(session.request("READ_TEMP SN0001").await.unwrap().ok);
        }
        session.request("SET_FAULT_PROFILE clean").await.unwrap();

        dut.dispatcher().reset();
        assert_eq!(dut.dispatcher().profile(), FaultProfile::Intermittent);
        assert_eq!(dut.dispatcher().device_count(), 0);

        let mut second = Vec::new();
        for _ in 0..10 {
            second.push(session.request("READ_TEMP SN0001").await.unwrap().ok);
        }
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_drift_accumulates_and_recalibrates() {
        let tuning = FaultTuning::default().with_drift(0.5, -0.01);
        let dut = DutHarness::with_profile(FaultProfile::Drift, tuning, 0).await.unwrap();
        let mut session = dut.session().await.unwrap();

        session.request("SET_TEMP SN0001 30").await.unwrap();
        let mut readings = Vec::new();
        for _ in 0..3 {
            let resp = session.request("READ_TEMP SN0001").await.unwrap();
            readings.push(resp.data_f64("temp_c").unwrap());
        }
        assert!(readings.windows(2).all(|w| w[1] > w[0]));
        assert!((readings[0] - 30.0).abs() <= 0.5 + 1e-9);

        // The thermal plan's first step recalibrates
        let run = dut
            .runner(TIMEOUT)
            .run(&thermal_plan(30.0, 1.0).unwrap(), &["SN0001".to_string()])
            .await
            .unwrap();
        assert!(run.overall_passed);
    }

    #[tokio::test]
    async fn test_smoke_plan_across_batch() {
        let dut = DutHarness::clean().await.unwrap();
        let sns = sequential_sns(5);

        let run = dut.runner(TIMEOUT).run(&smoke_plan().unwrap(), &sns).await.unwrap();
        assert!(run.overall_passed);
        assert_eq!(run.batch_id, "BATCH-TEST");
        assert_eq!(run.station_id, "STATION-TEST");
        assert_eq!(run.per_sn.len(), 5);
        assert_eq!(run.attempts.len(), 15);
        assert!(run.finished_at >= run.started_at);
        assert_eq!(dut.dispatcher().device_count(), 5);
    }

    #[tokio::test]
    async fn test_factory_flaky_run_respects_budgets() {
        let dut = DutHarness::with_profile(FaultProfile::FactoryFlaky, FaultTuning::default(), 2024)
            .await
            .unwrap();
        let plan = smoke_plan().unwrap();
        let sns = sequential_sns(6);

        let run = dut.runner(TIMEOUT).run(&plan, &sns).await.unwrap();
        let budget = 1 + dut.runner(TIMEOUT).config().default_retries as usize;

        for sn in &sns {
            let unit = run.sn(sn).unwrap();
            assert_eq!(unit.steps.len(), plan.len());
            for index in 0..plan.len() {
                let attempts: Vec<_> = run.attempts_for(sn, index).collect();
                assert!(!attempts.is_empty() && attempts.len() <= budget);
                assert!(attempts[..attempts.len() - 1].iter().all(|a| !a.success && a.will_retry));
                for a in &attempts {
                    if let Some(StepError::Protocol { code }) = &a.error {
                        assert!(code.is_transient());
                    }
                }
            }
            let expected = if unit.steps.iter().all(|s| s.success) {
                Verdict::Pass
            } else {
                Verdict::Fail
            };
            assert_eq!(unit.verdict, expected);
        }
    }

    proptest! {
        #[test]
        fn prop_any_request_line_gets_a_well_formed_reply(
            name in prop_oneof![
                Just("PING".to_string()),
                Just("READ_TEMP".to_string()),
                Just("SELF_TEST".to_string()),
                Just("SET_TEMP".to_string()),
                Just("SET_FAULT_PROFILE".to_string()),
                "[A-Za-z_]{1,10}",
            ],
            args in proptest::collection::vec("[A-Za-z0-9.+\\-]{1,8}", 0..4),
            seed in any::<u64>(),
        ) {
            let dispatcher = Dispatcher::new(
                FaultProfile::FactoryFlaky,
                FaultTuning::default(),
                seed,
                DeviceDefaults::default(),
            );
            let line = format!("{} {}\n", name, args.join(" "));

            let reply = dispatcher.dispatch_line(&line).unwrap();
            prop_assert!(reply.response.is_well_formed());
            let upper = name.to_ascii_uppercase();
            prop_assert_eq!(reply.response.cmd(), Some(upper.as_str()));

            let parsed = Response::from_line(&reply.response.to_line()).unwrap();
            prop_assert_eq!(parsed.ok, reply.response.ok);
            prop_assert_eq!(parsed.error_code, reply.response.error_code);
        }
    }
}
