//! End-to-end orchestrator scenarios, driven entirely through the public
//! `RunOrchestrator`/`TestControl` surface — no internal items.

use camino::Utf8PathBuf;
use linetest_runner::case::{CaseContext, TestCase};
use linetest_runner::common::{
    FlowControl, LoopConfig, ParallelExecution, ParallelSyncMode, StationConfig, StationHooks,
};
use linetest_runner::errors::CaseError;
use linetest_runner::instrument::InstrumentMap;
use linetest_runner::intake::{ControlEvent, SnIntake};
use linetest_runner::limits::{CaseLimits, Limit, LimitsTable};
use linetest_runner::orchestrator::RunOrchestrator;
use linetest_runner::position::TestStatus;
use linetest_runner::progress::ProgressReporter;
use linetest_runner::report::{NullDbHandler, NullReportSink};
use linetest_runner::result::Verdict;
use linetest_runner::sequence::{CaseRegistry, SequenceManifest, SequenceRegistry, SequenceStep};
use linetest_runner::TestControl;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct NoopHooks;
impl StationHooks for NoopHooks {}

fn two_position_config(
    parallel_execution: ParallelExecution,
    parallel_sync_mode: ParallelSyncMode,
    flow_control: FlowControl,
) -> StationConfig {
    StationConfig {
        test_positions: vec!["P1".to_string(), "P2".to_string()],
        instruments: InstrumentMap::new(),
        db_handler_name: "null".to_string(),
        flow_control,
        parallel_execution,
        parallel_sync_mode,
        parallel_sync_completed_timeout: Duration::from_secs(5),
        loop_config: LoopConfig::disabled(),
        sn_from_ui: true,
        sn_externally: false,
        sn_from_instrument: false,
        running_modes: vec!["default".to_string()],
        gage_rr: None,
        hooks: Box::new(NoopHooks),
    }
}

fn send_both_positions(control: &TestControl, sequence: &str) {
    control.send_event(
        ControlEvent::from_json(
            &format!(r#"{{"P1": "S1", "P2": "S2", "sequence": "{sequence}"}}"#),
            &["P1".to_string(), "P2".to_string()],
        )
        .unwrap(),
    );
}

async fn await_overall_result(progress: &ProgressReporter) -> String {
    let mut rx = progress.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(result) = rx.borrow().overall_result.clone() {
                return result;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("run did not finish in time")
}

/// Ends the outer gate loop and unsticks the SN-intake consumer, which by
/// this point is blocked on a second `events.recv()` waiting for a run that
/// will never come: the outer loop's `should_terminate` check only runs
/// between iterations, and the second iteration is already past it.
async fn shut_down(control: &Arc<TestControl>, handle: tokio::task::JoinHandle<()>) {
    control.terminate();
    control.send_event(ControlEvent::from_json("{}", &[]).unwrap());
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("orchestrator did not shut down in time")
        .unwrap();
}

struct RecordingCase {
    name: &'static str,
    calls: Arc<AtomicU32>,
}
impl TestCase for RecordingCase {
    fn name(&self) -> &str {
        self.name
    }
    fn test(&mut self, ctx: &CaseContext) -> Result<(), CaseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ctx.new_measurement("x", 1);
        Ok(())
    }
}

fn passing_limits(case_name: &str, measurement: &str) -> LimitsTable {
    let mut limits = LimitsTable::new();
    let mut case_limits = CaseLimits::new();
    case_limits.insert(measurement.to_string(), Limit::new(|v| Ok(v.as_i64().unwrap_or(0) < 100)));
    limits.insert(case_name.to_string(), case_limits);
    limits
}

fn numeric_limits(case_name: &str, measurement: &str) -> LimitsTable {
    let mut limits = LimitsTable::new();
    let mut case_limits = CaseLimits::new();
    case_limits.insert(
        measurement.to_string(),
        Limit::new(|v| {
            let n = v.as_f64().ok_or_else(|| "not a number".to_string())?;
            Ok(n > 0.0 && n < 100.0)
        }),
    );
    limits.insert(case_name.to_string(), case_limits);
    limits
}

#[tokio::test]
async fn two_positions_parallel_all_pass() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut cases = CaseRegistry::new();
    {
        let calls = Arc::clone(&calls);
        cases.register(
            "A",
            Arc::new(move || Box::new(RecordingCase { name: "A", calls: Arc::clone(&calls) }) as Box<dyn TestCase>),
        );
    }
    let mut sequences = SequenceRegistry::new();
    sequences.insert(SequenceManifest {
        name: "seq1".to_string(),
        tests: vec![SequenceStep::Case("A".to_string())],
        skip: Default::default(),
        limits: passing_limits("A", "x"),
        parameters: Value::Null,
        duts: None,
    });

    let config = two_position_config(ParallelExecution::Parallel, ParallelSyncMode::Mid, FlowControl::Continue);
    let (control, orchestrator) = RunOrchestrator::new(
        config,
        sequences,
        cases,
        Arc::new(NullReportSink),
        Arc::new(NullDbHandler),
        SnIntake::FromUi,
        Utf8PathBuf::from("results"),
    );
    let progress = orchestrator.progress();
    let handle = tokio::spawn(orchestrator.run_forever());

    send_both_positions(&control, "seq1");
    let overall = await_overall_result(&progress).await;
    assert_eq!(overall, Verdict::Pass.to_string());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    shut_down(&control, handle).await;
}

#[tokio::test]
async fn stop_on_fail_skips_subsequent_case() {
    struct FailingCase;
    impl TestCase for FailingCase {
        fn name(&self) -> &str {
            "A"
        }
        fn test(&mut self, ctx: &CaseContext) -> Result<(), CaseError> {
            ctx.new_measurement("x", 999); // out of range, fails its limit
            Ok(())
        }
    }

    let b_calls = Arc::new(AtomicU32::new(0));
    let mut cases = CaseRegistry::new();
    cases.register("A", Arc::new(|| Box::new(FailingCase) as Box<dyn TestCase>));
    {
        let b_calls = Arc::clone(&b_calls);
        cases.register(
            "B",
            Arc::new(move || Box::new(RecordingCase { name: "B", calls: Arc::clone(&b_calls) }) as Box<dyn TestCase>),
        );
    }

    let mut sequences = SequenceRegistry::new();
    sequences.insert(SequenceManifest {
        name: "seq1".to_string(),
        tests: vec![SequenceStep::Case("A".to_string()), SequenceStep::Case("B".to_string())],
        skip: Default::default(),
        limits: passing_limits("A", "x"),
        parameters: Value::Null,
        duts: None,
    });

    let config = two_position_config(ParallelExecution::Parallel, ParallelSyncMode::Mid, FlowControl::StopOnFail);
    let (control, orchestrator) = RunOrchestrator::new(
        config,
        sequences,
        cases,
        Arc::new(NullReportSink),
        Arc::new(NullDbHandler),
        SnIntake::FromUi,
        Utf8PathBuf::from("results"),
    );
    let progress = orchestrator.progress();
    let handle = tokio::spawn(orchestrator.run_forever());

    send_both_positions(&control, "seq1");
    let overall = await_overall_result(&progress).await;
    assert_eq!(overall, Verdict::Fail.to_string());
    assert_eq!(b_calls.load(Ordering::SeqCst), 0, "B must never run after A fails under STOP_ON_FAIL");

    shut_down(&control, handle).await;
}

#[tokio::test]
async fn missing_mandatory_measurement_errors_the_case() {
    struct ForgetfulCase;
    impl TestCase for ForgetfulCase {
        fn name(&self) -> &str {
            "A"
        }
        fn test(&mut self, _ctx: &CaseContext) -> Result<(), CaseError> {
            Ok(()) // never records "y"
        }
    }

    let mut cases = CaseRegistry::new();
    cases.register("A", Arc::new(|| Box::new(ForgetfulCase) as Box<dyn TestCase>));

    let mut sequences = SequenceRegistry::new();
    sequences.insert(SequenceManifest {
        name: "seq1".to_string(),
        tests: vec![SequenceStep::Case("A".to_string())],
        skip: Default::default(),
        limits: passing_limits("A", "y"),
        parameters: Value::Null,
        duts: None,
    });

    let config = two_position_config(ParallelExecution::Parallel, ParallelSyncMode::Mid, FlowControl::Continue);
    let (control, orchestrator) = RunOrchestrator::new(
        config,
        sequences,
        cases,
        Arc::new(NullReportSink),
        Arc::new(NullDbHandler),
        SnIntake::FromUi,
        Utf8PathBuf::from("results"),
    );
    let progress = orchestrator.progress();
    let handle = tokio::spawn(orchestrator.run_forever());

    send_both_positions(&control, "seq1");
    let overall = await_overall_result(&progress).await;
    assert_eq!(overall, Verdict::Error.to_string());

    shut_down(&control, handle).await;
}

#[tokio::test]
async fn limit_predicate_failure_marks_case_error() {
    struct NonNumericCase;
    impl TestCase for NonNumericCase {
        fn name(&self) -> &str {
            "A"
        }
        fn test(&mut self, ctx: &CaseContext) -> Result<(), CaseError> {
            ctx.new_measurement("x", "not-a-number");
            Ok(())
        }
    }

    let mut cases = CaseRegistry::new();
    cases.register("A", Arc::new(|| Box::new(NonNumericCase) as Box<dyn TestCase>));

    let mut sequences = SequenceRegistry::new();
    sequences.insert(SequenceManifest {
        name: "seq1".to_string(),
        tests: vec![SequenceStep::Case("A".to_string())],
        skip: Default::default(),
        limits: numeric_limits("A", "x"),
        parameters: Value::Null,
        duts: None,
    });

    let config = two_position_config(ParallelExecution::Parallel, ParallelSyncMode::Mid, FlowControl::Continue);
    let (control, orchestrator) = RunOrchestrator::new(
        config,
        sequences,
        cases,
        Arc::new(NullReportSink),
        Arc::new(NullDbHandler),
        SnIntake::FromUi,
        Utf8PathBuf::from("results"),
    );
    let progress = orchestrator.progress();
    let handle = tokio::spawn(orchestrator.run_forever());

    send_both_positions(&control, "seq1");
    let overall = await_overall_result(&progress).await;
    assert_eq!(overall, Verdict::Error.to_string());

    shut_down(&control, handle).await;
}

#[tokio::test]
async fn per_test_case_completed_barrier_synchronizes_slow_and_fast_workers() {
    struct TimedCase {
        slow: bool,
        finished: Arc<AtomicU32>,
        observed_at_post: Arc<AtomicU32>,
    }
    impl TestCase for TimedCase {
        fn name(&self) -> &str {
            "A"
        }
        fn test(&mut self, _ctx: &CaseContext) -> Result<(), CaseError> {
            if self.slow {
                std::thread::sleep(Duration::from_millis(80));
            }
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn post_test(&mut self, _ctx: &CaseContext) -> Result<(), CaseError> {
            self.observed_at_post.store(self.finished.load(Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        }
    }

    let finished = Arc::new(AtomicU32::new(0));
    let observed_fast = Arc::new(AtomicU32::new(0));
    let observed_slow = Arc::new(AtomicU32::new(0));

    // First call (bound to the first active position) runs slow, the
    // second runs fast, so one real rendezvous happens per run.
    let next_is_slow = Arc::new(std::sync::Mutex::new(true));
    let mut cases = CaseRegistry::new();
    {
        let finished = Arc::clone(&finished);
        let observed_fast = Arc::clone(&observed_fast);
        let observed_slow = Arc::clone(&observed_slow);
        cases.register(
            "A",
            Arc::new(move || {
                let mut guard = next_is_slow.lock().unwrap();
                let slow = *guard;
                *guard = false;
                let observed = if slow { Arc::clone(&observed_slow) } else { Arc::clone(&observed_fast) };
                Box::new(TimedCase { slow, finished: Arc::clone(&finished), observed_at_post: observed })
                    as Box<dyn TestCase>
            }),
        );
    }

    let mut sequences = SequenceRegistry::new();
    sequences.insert(SequenceManifest {
        name: "seq1".to_string(),
        tests: vec![SequenceStep::Case("A".to_string())],
        skip: Default::default(),
        limits: LimitsTable::new(),
        parameters: Value::Null,
        duts: None,
    });

    let config = two_position_config(ParallelExecution::PerTestCase, ParallelSyncMode::Completed, FlowControl::Continue);
    let (control, orchestrator) = RunOrchestrator::new(
        config,
        sequences,
        cases,
        Arc::new(NullReportSink),
        Arc::new(NullDbHandler),
        SnIntake::FromUi,
        Utf8PathBuf::from("results"),
    );
    let progress = orchestrator.progress();
    let handle = tokio::spawn(orchestrator.run_forever());

    send_both_positions(&control, "seq1");
    let overall = await_overall_result(&progress).await;
    assert_eq!(overall, Verdict::Pass.to_string());

    shut_down(&control, handle).await;

    // Both workers' post_test ran only after both test() calls finished:
    // the completed-barrier rendezvous means neither observed fewer than 2.
    assert_eq!(observed_fast.load(Ordering::SeqCst), 2);
    assert_eq!(observed_slow.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn abort_mid_run_marks_every_bound_position_aborted() {
    struct SlowCase;
    impl TestCase for SlowCase {
        fn name(&self) -> &str {
            "A"
        }
        fn test(&mut self, _ctx: &CaseContext) -> Result<(), CaseError> {
            std::thread::sleep(Duration::from_millis(100));
            Ok(())
        }
    }

    let mut cases = CaseRegistry::new();
    cases.register("A", Arc::new(|| Box::new(SlowCase) as Box<dyn TestCase>));
    cases.register("B", Arc::new(|| Box::new(SlowCase) as Box<dyn TestCase>));

    let mut sequences = SequenceRegistry::new();
    sequences.insert(SequenceManifest {
        name: "seq1".to_string(),
        tests: vec![SequenceStep::Case("A".to_string()), SequenceStep::Case("B".to_string())],
        skip: Default::default(),
        limits: LimitsTable::new(),
        parameters: Value::Null,
        duts: None,
    });

    let config = two_position_config(ParallelExecution::Parallel, ParallelSyncMode::Mid, FlowControl::Continue);
    let (control, orchestrator) = RunOrchestrator::new(
        config,
        sequences,
        cases,
        Arc::new(NullReportSink),
        Arc::new(NullDbHandler),
        SnIntake::FromUi,
        Utf8PathBuf::from("results"),
    );
    let progress = orchestrator.progress();
    let handle = tokio::spawn(orchestrator.run_forever());

    send_both_positions(&control, "seq1");
    // Case A is underway (100ms) by the time this fires; abort before B runs.
    tokio::time::sleep(Duration::from_millis(20)).await;
    control.abort();

    let _ = await_overall_result(&progress).await;
    let snapshot = progress.current();
    for (_, position) in snapshot.duts {
        assert_eq!(position.test_status, TestStatus::Abort);
    }

    shut_down(&control, handle).await;
}

#[tokio::test]
async fn per_dut_discipline_runs_each_position_independently() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut cases = CaseRegistry::new();
    {
        let calls = Arc::clone(&calls);
        cases.register(
            "A",
            Arc::new(move || Box::new(RecordingCase { name: "A", calls: Arc::clone(&calls) }) as Box<dyn TestCase>),
        );
    }

    let mut sequences = SequenceRegistry::new();
    sequences.insert(SequenceManifest {
        name: "seq1".to_string(),
        tests: vec![SequenceStep::Case("A".to_string())],
        skip: Default::default(),
        limits: passing_limits("A", "x"),
        parameters: Value::Null,
        duts: None,
    });

    let config = two_position_config(ParallelExecution::PerDut, ParallelSyncMode::Mid, FlowControl::Continue);
    let (control, orchestrator) = RunOrchestrator::new(
        config,
        sequences,
        cases,
        Arc::new(NullReportSink),
        Arc::new(NullDbHandler),
        SnIntake::FromUi,
        Utf8PathBuf::from("results"),
    );
    let progress = orchestrator.progress();
    let handle = tokio::spawn(orchestrator.run_forever());

    send_both_positions(&control, "seq1");
    let overall = await_overall_result(&progress).await;
    assert_eq!(overall, Verdict::Pass.to_string());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    shut_down(&control, handle).await;
}
