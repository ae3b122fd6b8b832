//! Run Orchestrator (component C8): the state machine that drives one full
//! test run from instrument check through report emission, and the three
//! scheduling disciplines (`PARALLEL`, `PER_TEST_CASE`, `PER_DUT`) case
//! execution is fanned out under.
//!
//! Every phase publishes a progress snapshot before moving to the next, so a
//! subscriber watching [`crate::progress::ProgressReporter::subscribe`] sees
//! the full sequence of states a run passes through.

use crate::barrier::GenerationalBarrier;
use crate::case::{CaseContext, TestCase, TestCaseInstance};
use crate::common::{GageRrCounters, ParallelExecution, ParallelSyncMode, StationConfig};
use crate::control::TestControl;
use crate::dut::DutRecord;
use crate::errors::{CaseError, ErrorTrace};
use crate::intake::{ControlEvent, SnIntake};
use crate::limits::LimitsTable;
use crate::position::{PositionStatus, TestPosition, TestStatus};
use crate::progress::{GeneralState, ProgressReporter};
use crate::report::{advance_gage_rr, report_html_path, DbHandler, ReportContext, ReportSink, RunId};
use crate::result::Verdict;
use crate::sequence::{CaseRegistry, SequenceManifest, SequenceRegistry, SequenceStep};
use camino::Utf8PathBuf;
use chrono::Utc;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The phases one run passes through, in order. Purely descriptive — used
/// for tracing spans and nothing else branches directly on it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunPhase {
    CheckInstruments,
    PreparePositions,
    IntakeSn,
    BindDuts,
    LoadSequence,
    UpdateParams,
    ExecuteCases,
    Finalize,
    Report,
}

/// Per-position tracker for the "recurring failure signature" warning: the
/// signature is the ordered tuple of failed step names, and the warning
/// fires at five consecutive repeats of the same signature while the
/// position's running pass count is still under five.
#[derive(Default)]
struct ConsecutiveFailState {
    last_signature: Option<Vec<String>>,
    streak: u32,
    pass_count: u32,
}

impl ConsecutiveFailState {
    fn observe(&mut self, dut: &DutRecord) -> bool {
        if dut.pass_fail_result == Verdict::Pass {
            self.pass_count += 1;
            self.streak = 0;
            self.last_signature = None;
            return false;
        }
        let signature = dut.failed_steps.clone();
        if !signature.is_empty() && self.last_signature.as_ref() == Some(&signature) {
            self.streak += 1;
        } else {
            self.streak = 1;
            self.last_signature = Some(signature);
        }
        self.streak >= 5 && self.pass_count < 5
    }
}

type WorkerOutcome = (TestCaseInstance, Box<dyn TestCase>, Result<(), CaseError>);
type WorkerHandle = JoinHandle<WorkerOutcome>;

fn error_trace_from(err: &CaseError) -> ErrorTrace {
    match err {
        CaseError::Exception(trace) => trace.clone(),
        other => ErrorTrace::new("CaseError", other.to_string()),
    }
}

/// Owns the station configuration, the registries, the live position set,
/// and the external collaborators (report sink, DB handler, SN intake), and
/// drives the run loop.
pub struct RunOrchestrator {
    control: Arc<TestControl>,
    config: StationConfig,
    sequences: SequenceRegistry,
    cases: CaseRegistry,
    progress: ProgressReporter,
    positions: Vec<TestPosition>,
    report_sink: Arc<dyn ReportSink>,
    db_handler: Arc<dyn DbHandler>,
    intake: SnIntake,
    report_root: Utf8PathBuf,
    gage_rr: GageRrCounters,
    fail_trackers: IndexMap<String, ConsecutiveFailState>,
}

impl RunOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: StationConfig,
        sequences: SequenceRegistry,
        cases: CaseRegistry,
        report_sink: Arc<dyn ReportSink>,
        db_handler: Arc<dyn DbHandler>,
        intake: SnIntake,
        report_root: impl Into<Utf8PathBuf>,
    ) -> (Arc<TestControl>, Self) {
        let control = TestControl::new();
        let progress = ProgressReporter::new();
        let positions = config
            .test_positions
            .iter()
            .map(|name| TestPosition::new(name.clone(), name.clone()))
            .collect();
        let orchestrator = Self {
            control: Arc::clone(&control),
            config,
            sequences,
            cases,
            progress,
            positions,
            report_sink,
            db_handler,
            intake,
            report_root: report_root.into(),
            gage_rr: GageRrCounters::default(),
            fail_trackers: IndexMap::new(),
        };
        (control, orchestrator)
    }

    pub fn progress(&self) -> ProgressReporter {
        self.progress.clone()
    }

    /// Runs the outer gate loop until [`TestControl::terminate`] is called.
    pub async fn run_forever(mut self) {
        self.config.hooks.boot_up();
        self.progress.set_general_state(GeneralState::Initialized);
        let mut events = self.control.take_events_receiver();

        loop {
            self.control.wait_for_gate().await;
            if self.control.should_terminate() {
                break;
            }
            self.control.clear_abort();
            self.control.mark_run_start();
            self.run_one(&mut events).await;
            self.control.mark_run_stop();
            if self.control.should_terminate() {
                break;
            }
        }

        self.config.hooks.shutdown();
        self.progress.set_general_state(GeneralState::Shutdown);
    }

    async fn run_one(&mut self, events: &mut mpsc::UnboundedReceiver<ControlEvent>) {
        tracing::debug!(phase = ?RunPhase::CheckInstruments, "entering phase");
        if let Err(err) = self.check_instruments().await {
            tracing::error!(%err, "instrument check failed; skipping run");
            return;
        }
        if self.control.should_terminate() {
            return;
        }

        tracing::debug!(phase = ?RunPhase::PreparePositions, "entering phase");
        for position in &mut self.positions {
            position.prepare_for_new_test_run();
        }
        self.progress.set_general_state(GeneralState::Prepare);
        self.progress.set_positions(&self.positions);

        tracing::debug!(phase = ?RunPhase::IntakeSn, "entering phase");
        let position_names: Vec<String> = self.positions.iter().map(|p| p.name.clone()).collect();
        let Some(intake_result) = self
            .intake
            .recv_one_run(&position_names, &self.sequences, events, &self.control)
            .await
        else {
            return;
        };

        tracing::debug!(phase = ?RunPhase::BindDuts, "entering phase");
        let identified = self.config.hooks.identify_duts();
        let mut serials = intake_result.serials.clone();
        if intake_result.external_selection {
            if let Some(identified) = &identified {
                for (position, serial) in &identified.serials {
                    serials.insert(position.clone(), serial.clone());
                }
            }
        }
        let sequence_name = intake_result
            .sequence_name
            .clone()
            .or_else(|| identified.as_ref().and_then(|i| i.sequence_name.clone()));

        for (idx, position) in self.positions.iter_mut().enumerate() {
            let Some(serial) = serials.get(&position.name) else {
                continue;
            };
            let info = self.config.hooks.parse_dut_info(serial, &position.name, Some(idx as u32));
            let dut = DutRecord::new(serial.clone(), position.name.clone()).with_info(info, Some(idx as u32));
            position.bind_dut(dut);
        }
        self.progress.set_positions(&self.positions);

        tracing::debug!(phase = ?RunPhase::LoadSequence, "entering phase");
        let Some(sequence_name) = sequence_name else {
            tracing::error!("intake completed with no sequence name resolved; skipping run");
            return;
        };
        let manifest = match self.sequences.resolve(&sequence_name) {
            Ok(manifest) => manifest,
            Err(err) => {
                tracing::error!(%err, "failed to resolve sequence; skipping run");
                return;
            }
        };
        self.progress.set_sequence_name(Some(sequence_name.clone()));
        let effective_cases = manifest.filtered_cases(intake_result.test_cases_override.as_deref());
        self.progress.set_statistics(Value::Null);

        if let Some(mode) = &intake_result.running_mode {
            if let Err(err) = self.config.validate_running_mode(mode) {
                tracing::error!(%err, "unknown running mode; skipping run");
                return;
            }
            self.progress.set_running_mode(Some(mode.clone()));
        }

        let mut limits: LimitsTable = self.sequences.pool().clone();
        for (case_name, case_limits) in manifest.limits.iter() {
            limits.insert(case_name.clone(), case_limits.clone());
        }
        let limits = Arc::new(limits);
        let parameters = Arc::new(manifest.parameters.clone());
        let tokens: Vec<SequenceStep> = {
            let allowed: HashSet<&str> = effective_cases.iter().map(String::as_str).collect();
            manifest
                .tests
                .iter()
                .filter(|step| allowed.contains(step.case_name()))
                .cloned()
                .collect()
        };
        let manifest_name = manifest.name.clone();

        tracing::debug!(phase = ?RunPhase::UpdateParams, "entering phase");
        self.config.hooks.update_parameters(&sequence_name);
        for case_name in &effective_cases {
            self.config.hooks.update_test_case_params(case_name);
        }
        self.config.hooks.prepare_test(&position_names);

        let run_id = RunId::new();
        let duts: Vec<Option<Arc<Mutex<DutRecord>>>> = self
            .positions
            .iter()
            .map(|p| p.dut.clone().map(|d| Arc::new(Mutex::new(d))))
            .collect();

        tracing::debug!(phase = ?RunPhase::ExecuteCases, "entering phase");
        let loop_start = std::time::Instant::now();
        let mut loop_cycle: u64 = 0;
        loop {
            loop_cycle += 1;
            self.progress.set_general_state(GeneralState::Testing);
            self.config.hooks.prepare_loop(loop_cycle);

            match self.config.parallel_execution {
                ParallelExecution::PerDut => {
                    self.execute_per_dut(&tokens, Arc::clone(&limits), Arc::clone(&parameters), run_id, &duts)
                        .await;
                }
                ParallelExecution::Parallel | ParallelExecution::PerTestCase => {
                    self.execute_fanout(&tokens, Arc::clone(&limits), Arc::clone(&parameters), run_id, &duts)
                        .await;
                }
            }

            self.config.hooks.finalize_loop(loop_cycle);

            let within_budget =
                self.config.loop_config.enabled && loop_start.elapsed() < self.config.loop_config.budget;
            let any_stop_looping = self.positions.iter().any(|p| p.should_stop_looping());
            if self.control.is_aborted() || self.control.should_terminate() || !within_budget || any_stop_looping {
                break;
            }
        }

        for (position, dut) in self.positions.iter_mut().zip(duts.iter()) {
            if let Some(dut) = dut {
                position.dut = Some(dut.lock().expect("dut mutex poisoned").clone());
            }
        }

        tracing::debug!(phase = ?RunPhase::Finalize, "entering phase");
        if self.control.is_aborted() {
            self.config.hooks.test_aborted();
            for position in &mut self.positions {
                position.test_status = TestStatus::Abort;
                position.status = PositionStatus::Aborting;
            }
        } else {
            self.config.hooks.finalize_test();
            for position in &mut self.positions {
                if let Some(dut) = &position.dut {
                    position.test_status = match dut.pass_fail_result {
                        Verdict::Pass => TestStatus::Pass,
                        Verdict::Fail => TestStatus::Fail,
                        Verdict::Error => TestStatus::Error,
                        Verdict::Na | Verdict::Testing => TestStatus::Testing,
                    };
                    position.status = PositionStatus::Idle;
                    tracing::info!(message = %dut.status_message(), "dut finished");
                }
            }
        }
        self.progress.set_general_state(GeneralState::Finalize);
        self.progress.set_positions(&self.positions);

        for position in &self.positions {
            if let Some(dut) = &position.dut {
                let tracker = self.fail_trackers.entry(position.name.clone()).or_default();
                if tracker.observe(dut) {
                    tracing::warn!(
                        position = %position.name,
                        "recurring failure signature: same failed steps five runs running"
                    );
                }
            }
        }

        advance_gage_rr(&mut self.gage_rr, self.config.gage_rr.as_ref());
        self.progress
            .set_gage_rr(self.config.gage_rr.as_ref().map(|_| self.gage_rr.clone()));

        tracing::debug!(phase = ?RunPhase::Report, "entering phase");
        self.progress.set_general_state(GeneralState::CreateTestReport);
        if !self.control.snapshot_fields().report_off {
            let ctx = ReportContext {
                run_id,
                timestamp: Utc::now(),
                sequence_name: manifest_name.clone(),
                positions: &self.positions,
                parameters: &parameters,
                loop_cycle,
                last_result: true,
            };
            if let Err(err) = self.report_sink.write_report(&ctx) {
                tracing::warn!(%err, "report sink failed");
            }
            if let Err(err) = self.db_handler.store_run_result(&ctx) {
                tracing::warn!(%err, "db handler failed to store run result");
            }
            let path = report_html_path(&self.report_root, ctx.timestamp, &self.positions);
            let mut paths = IndexMap::new();
            paths.insert(manifest_name, path.to_string());
            self.progress.set_report_paths(paths);
        }

        let overall = self
            .positions
            .iter()
            .filter_map(|p| p.dut.as_ref())
            .fold(Verdict::Testing, |acc, dut| acc.lift(dut.pass_fail_result));
        self.progress.set_overall_result(Some(overall.to_string()));
    }

    async fn check_instruments(&mut self) -> Result<(), crate::errors::InstrumentError> {
        loop {
            if self.control.should_terminate() {
                return Ok(());
            }
            for (name, status) in self.config.instruments.probe_all() {
                self.progress.set_instrument_status(&name, &format!("{status:?}"));
            }
            match self.config.hooks.handle_instrument_status(&self.progress) {
                Ok(()) => {
                    if self.config.instruments.all_ready() {
                        return Ok(());
                    }
                }
                Err(err) if err.is_fatal() => {
                    self.control.abort();
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(%err, "instrument not ready, retrying");
                }
            }
            if self.config.instruments.all_ready() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    fn build_ctx(
        &self,
        pos_idx: usize,
        case_name: &str,
        dut: Arc<Mutex<DutRecord>>,
        run_id: RunId,
        parameters: Arc<Value>,
    ) -> CaseContext {
        let position = &self.positions[pos_idx];
        CaseContext {
            case_name: case_name.to_string(),
            dut,
            stop_testing: Arc::clone(&position.stop_testing),
            stop_looping: Arc::clone(&position.stop_looping),
            flow_control: self.config.flow_control,
            parameters,
            instruments: self.config.instruments.clone(),
            db_handler: Arc::clone(&self.db_handler),
            progress: self.progress.clone(),
            run_id,
            mid_barrier: None,
        }
    }

    fn active_positions(&self) -> Vec<usize> {
        (0..self.positions.len()).filter(|&i| self.positions[i].is_active()).collect()
    }

    fn mark_factory_missing(&self, dut: &Arc<Mutex<DutRecord>>, case_name: &str, err: &crate::errors::ConfigurationError) {
        let mut dut = dut.lock().expect("dut mutex poisoned");
        let record = dut.case_entry(case_name);
        record.result = Verdict::Error;
        record.error = Some(err.to_string());
        dut.record_case_result(case_name, Verdict::Error);
    }

    /// `PARALLEL` and `PER_TEST_CASE`: one case at a time, fanned out across
    /// every active position, with the barriers `PER_TEST_CASE`'s sync mode
    /// installs.
    async fn execute_fanout(
        &self,
        tokens: &[SequenceStep],
        limits: Arc<LimitsTable>,
        parameters: Arc<Value>,
        run_id: RunId,
        duts: &[Option<Arc<Mutex<DutRecord>>>],
    ) {
        let mut pending_pre: IndexMap<String, IndexMap<usize, WorkerHandle>> = IndexMap::new();

        for step in tokens {
            if self.control.is_aborted() {
                break;
            }
            match step {
                SequenceStep::Pre(name) => {
                    for pos_idx in self.active_positions() {
                        let Some(dut_arc) = duts[pos_idx].clone() else { continue };
                        let case = match self.cases.build(name) {
                            Ok(case) => case,
                            Err(err) => {
                                self.mark_factory_missing(&dut_arc, name, &err);
                                continue;
                            }
                        };
                        let ctx = self.build_ctx(pos_idx, name, dut_arc, run_id, Arc::clone(&parameters));
                        let instance = TestCaseInstance::new(name.clone(), ctx);
                        let limits = Arc::clone(&limits);
                        let handle = tokio::task::spawn_blocking(move || {
                            let mut instance = instance;
                            let mut case = case;
                            let result = instance.run_pre_test(case.as_mut(), &limits);
                            (instance, case, result)
                        });
                        pending_pre.entry(name.clone()).or_default().insert(pos_idx, handle);
                    }
                }
                SequenceStep::Case(name) => {
                    self.config.hooks.prepare_test_case(name);
                    let active = self.active_positions();
                    if active.is_empty() {
                        continue;
                    }

                    // Resolve every position's case instance (and run its
                    // pre-test, if pending) before any barrier is sized, so
                    // a position skipped here for a missing factory or a
                    // failed pre-test never counts toward the rendezvous
                    // party count.
                    let mut ready: Vec<(TestCaseInstance, Box<dyn TestCase>)> = Vec::new();
                    for pos_idx in active {
                        let Some(dut_arc) = duts[pos_idx].clone() else { continue };
                        let slot = pending_pre.get_mut(name).and_then(|m| m.remove(&pos_idx));
                        let (mut instance, mut case, pre_result) = match slot {
                            Some(handle) => handle.await.expect("pre-test worker panicked"),
                            None => {
                                let case = match self.cases.build(name) {
                                    Ok(case) => case,
                                    Err(err) => {
                                        self.mark_factory_missing(&dut_arc, name, &err);
                                        continue;
                                    }
                                };
                                let ctx =
                                    self.build_ctx(pos_idx, name, Arc::clone(&dut_arc), run_id, Arc::clone(&parameters));
                                (TestCaseInstance::new(name.clone(), ctx), case, Ok(()))
                            }
                        };

                        if let Err(err) = pre_result {
                            let trace = error_trace_from(&err);
                            instance.handle_error(case.as_mut(), trace);
                            continue;
                        }

                        ready.push((instance, case));
                    }

                    if ready.is_empty() {
                        continue;
                    }

                    let mid_barrier = if self.config.parallel_execution == ParallelExecution::PerTestCase
                        && matches!(self.config.parallel_sync_mode, ParallelSyncMode::Mid | ParallelSyncMode::Both)
                    {
                        let barrier = GenerationalBarrier::new(ready.len());
                        self.control.register_barrier(&barrier);
                        Some(barrier)
                    } else {
                        None
                    };
                    let completed_barrier = if self.config.parallel_execution == ParallelExecution::PerTestCase
                        && matches!(self.config.parallel_sync_mode, ParallelSyncMode::Completed | ParallelSyncMode::Both)
                    {
                        let barrier = GenerationalBarrier::new(ready.len());
                        self.control.register_barrier(&barrier);
                        Some(barrier)
                    } else {
                        None
                    };
                    let completed_timeout = self.config.parallel_sync_completed_timeout;

                    let mut handles = Vec::new();
                    for (mut instance, case) in ready {
                        instance.ctx.mid_barrier = mid_barrier.clone();

                        let limits = Arc::clone(&limits);
                        let completed = completed_barrier.clone();
                        let handle: WorkerHandle = tokio::task::spawn_blocking(move || {
                            let mut instance = instance;
                            let mut case = case;
                            let test_result = instance.run_test(case.as_mut(), &limits);
                            let combined = match (&test_result, &completed) {
                                (Ok(()), Some(barrier)) => test_result.and(barrier.wait(completed_timeout).map(|_| ())),
                                _ => test_result,
                            };
                            let final_result = match combined {
                                Ok(()) => instance.run_post_test(case.as_mut(), &limits),
                                Err(err) => Err(err),
                            };
                            (instance, case, final_result)
                        });
                        handles.push(handle);
                    }

                    for handle in handles {
                        let (mut instance, mut case, result) = handle.await.expect("case worker panicked");
                        if let Err(err) = result {
                            let trace = error_trace_from(&err);
                            instance.handle_error(case.as_mut(), trace);
                        }
                    }
                }
            }
        }
    }

    /// `PER_DUT`: each active position runs the whole filtered token list
    /// start to finish, independently of every other position; no barriers
    /// ever apply.
    async fn execute_per_dut(
        &self,
        tokens: &[SequenceStep],
        limits: Arc<LimitsTable>,
        parameters: Arc<Value>,
        run_id: RunId,
        duts: &[Option<Arc<Mutex<DutRecord>>>],
    ) {
        let mut joins = tokio::task::JoinSet::new();
        for pos_idx in self.active_positions() {
            let Some(dut_arc) = duts[pos_idx].clone() else { continue };
            let tokens = tokens.to_vec();
            let limits = Arc::clone(&limits);
            let ctx_template = self.build_ctx(pos_idx, "", Arc::clone(&dut_arc), run_id, Arc::clone(&parameters));
            let stop_testing = Arc::clone(&self.positions[pos_idx].stop_testing);
            let cases_by_name = self.snapshot_case_factories(&tokens);

            joins.spawn(async move {
                let mut pending_pre: IndexMap<String, WorkerHandle> = IndexMap::new();
                for step in &tokens {
                    if stop_testing.load(std::sync::atomic::Ordering::SeqCst) {
                        break;
                    }
                    match step {
                        SequenceStep::Pre(name) => {
                            let Some(factory) = cases_by_name.get(name) else { continue };
                            let case = factory();
                            let mut ctx = ctx_template.clone();
                            ctx.case_name = name.clone();
                            let instance = TestCaseInstance::new(name.clone(), ctx);
                            let limits = Arc::clone(&limits);
                            let handle: WorkerHandle = tokio::task::spawn_blocking(move || {
                                let mut instance = instance;
                                let mut case = case;
                                let result = instance.run_pre_test(case.as_mut(), &limits);
                                (instance, case, result)
                            });
                            pending_pre.insert(name.clone(), handle);
                        }
                        SequenceStep::Case(name) => {
                            let (mut instance, mut case, pre_result) = match pending_pre.remove(name) {
                                Some(handle) => handle.await.expect("pre-test worker panicked"),
                                None => {
                                    let Some(factory) = cases_by_name.get(name) else { continue };
                                    let case = factory();
                                    let mut ctx = ctx_template.clone();
                                    ctx.case_name = name.clone();
                                    (TestCaseInstance::new(name.clone(), ctx), case, Ok(()))
                                }
                            };

                            if let Err(err) = pre_result {
                                let trace = error_trace_from(&err);
                                instance.handle_error(case.as_mut(), trace);
                                continue;
                            }

                            let limits = Arc::clone(&limits);
                            let handle: WorkerHandle = tokio::task::spawn_blocking(move || {
                                let mut instance = instance;
                                let mut case = case;
                                let result = instance
                                    .run_test(case.as_mut(), &limits)
                                    .and_then(|()| instance.run_post_test(case.as_mut(), &limits));
                                (instance, case, result)
                            });
                            let (mut instance, mut case, result) = handle.await.expect("case worker panicked");
                            if let Err(err) = result {
                                let trace = error_trace_from(&err);
                                instance.handle_error(case.as_mut(), trace);
                            }
                        }
                    }
                }
            });
        }
        while joins.join_next().await.is_some() {}
    }

    /// Pre-resolves every case factory this token list references so the
    /// `PER_DUT` per-position task doesn't need to borrow `self.cases`
    /// across the `tokio::spawn` boundary.
    fn snapshot_case_factories(&self, tokens: &[SequenceStep]) -> IndexMap<String, crate::case::CaseFactory> {
        let mut out = IndexMap::new();
        for step in tokens {
            let name = step.case_name();
            if out.contains_key(name) {
                continue;
            }
            if let Some(factory) = self.cases.factory(name) {
                out.insert(name.to_string(), factory);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{
        FlowControl, LoopConfig, ParallelExecution as PE, ParallelSyncMode as PSM, StationConfig, StationHooks,
    };
    use crate::instrument::InstrumentMap;
    use crate::limits::{CaseLimits, Limit};
    use crate::report::{NullDbHandler, NullReportSink};
    use std::sync::atomic::AtomicUsize;

    struct NoopHooks;
    impl StationHooks for NoopHooks {}

    struct RecordingCase {
        name: &'static str,
        calls: Arc<AtomicUsize>,
    }
    impl TestCase for RecordingCase {
        fn name(&self) -> &str {
            self.name
        }
        fn test(&mut self, ctx: &CaseContext) -> Result<(), CaseError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            ctx.new_measurement("x", 1);
            Ok(())
        }
    }

    fn base_config(parallel_execution: PE, parallel_sync_mode: PSM) -> StationConfig {
        StationConfig {
            test_positions: vec!["P1".to_string(), "P2".to_string()],
            instruments: InstrumentMap::new(),
            db_handler_name: "null".to_string(),
            flow_control: FlowControl::Continue,
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

    fn manifest_with(cases: Vec<SequenceStep>) -> SequenceManifest {
        let mut limits = LimitsTable::new();
        let mut case_limits = CaseLimits::new();
        case_limits.insert("x".to_string(), Limit::new(|v| Ok(v.as_i64().unwrap_or(0) < 10)));
        limits.insert("A".to_string(), case_limits);
        SequenceManifest {
            name: "seq1".to_string(),
            tests: cases,
            skip: Default::default(),
            limits,
            parameters: Value::Null,
            duts: None,
        }
    }

    #[tokio::test]
    async fn parallel_run_completes_both_positions() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut cases = CaseRegistry::new();
        {
            let calls = Arc::clone(&calls);
            cases.register(
                "A",
                Arc::new(move || Box::new(RecordingCase { name: "A", calls: Arc::clone(&calls) }) as Box<dyn TestCase>),
            );
        }
        let mut sequences = SequenceRegistry::new();
        sequences.insert(manifest_with(vec![SequenceStep::Case("A".to_string())]));

        let config = base_config(PE::Parallel, PSM::Mid);
        let (control, mut orchestrator) = RunOrchestrator::new(
            config,
            sequences,
            cases,
            Arc::new(NullReportSink),
            Arc::new(NullDbHandler),
            SnIntake::FromUi,
            Utf8PathBuf::from("results"),
        );

        let mut rx = control.take_events_receiver();
        control.send_event(
            ControlEvent::from_json(r#"{"P1": "S1", "P2": "S2", "sequence": "seq1"}"#, &["P1".into(), "P2".into()])
                .unwrap(),
        );

        orchestrator.run_one(&mut rx).await;

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(orchestrator
            .positions
            .iter()
            .all(|p| p.dut.as_ref().unwrap().pass_fail_result == Verdict::Pass));
    }

    struct PreFailsOnPosition {
        failing_position: &'static str,
        calls: Arc<AtomicUsize>,
    }
    impl TestCase for PreFailsOnPosition {
        fn name(&self) -> &str {
            "A"
        }
        fn pre_test(&mut self, ctx: &CaseContext) -> Result<(), CaseError> {
            let position = ctx.dut.lock().expect("dut mutex poisoned").test_position.clone();
            if position == self.failing_position {
                return Err(CaseError::Exception(ErrorTrace::new("TestError", "boom")));
            }
            Ok(())
        }
        fn test(&mut self, ctx: &CaseContext) -> Result<(), CaseError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            ctx.new_measurement("x", 1);
            Ok(())
        }
    }

    #[tokio::test]
    async fn completed_barrier_does_not_wait_on_a_position_skipped_by_pre_test() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut cases = CaseRegistry::new();
        {
            let calls = Arc::clone(&calls);
            cases.register(
                "A",
                Arc::new(move || {
                    Box::new(PreFailsOnPosition { failing_position: "P2", calls: Arc::clone(&calls) })
                        as Box<dyn TestCase>
                }),
            );
        }
        let mut sequences = SequenceRegistry::new();
        sequences.insert(manifest_with(vec![
            SequenceStep::Pre("A".to_string()),
            SequenceStep::Case("A".to_string()),
        ]));

        let mut config = base_config(PE::PerTestCase, PSM::Completed);
        config.parallel_sync_completed_timeout = Duration::from_millis(300);
        let (control, mut orchestrator) = RunOrchestrator::new(
            config,
            sequences,
            cases,
            Arc::new(NullReportSink),
            Arc::new(NullDbHandler),
            SnIntake::FromUi,
            Utf8PathBuf::from("results"),
        );

        let mut rx = control.take_events_receiver();
        control.send_event(
            ControlEvent::from_json(r#"{"P1": "S1", "P2": "S2", "sequence": "seq1"}"#, &["P1".into(), "P2".into()])
                .unwrap(),
        );

        tokio::time::timeout(Duration::from_secs(2), orchestrator.run_one(&mut rx))
            .await
            .expect("run should not block on the completed barrier");

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        let p1 = orchestrator.positions.iter().find(|p| p.name == "P1").unwrap();
        assert_eq!(p1.dut.as_ref().unwrap().pass_fail_result, Verdict::Pass);
        let p2 = orchestrator.positions.iter().find(|p| p.name == "P2").unwrap();
        assert_eq!(p2.dut.as_ref().unwrap().pass_fail_result, Verdict::Error);
    }

    #[tokio::test]
    async fn abort_mid_run_invalidates_the_completed_barrier_instead_of_blocking() {
        // P1 is slow and reaches the completed barrier; P2 fails its own
        // test() immediately and so never calls barrier.wait at all. With a
        // barrier sized for 2 parties, P1 is stuck waiting on a party that
        // will never arrive until control.abort() invalidates the barrier.
        struct AlternatingCase {
            slow: bool,
        }
        impl TestCase for AlternatingCase {
            fn name(&self) -> &str {
                "A"
            }
            fn test(&mut self, _ctx: &CaseContext) -> Result<(), CaseError> {
                if self.slow {
                    std::thread::sleep(Duration::from_millis(100));
                    Ok(())
                } else {
                    Err(CaseError::Exception(ErrorTrace::new("TestError", "boom")))
                }
            }
        }

        let next_is_slow = Arc::new(Mutex::new(true));
        let mut cases = CaseRegistry::new();
        {
            let next_is_slow = Arc::clone(&next_is_slow);
            cases.register(
                "A",
                Arc::new(move || {
                    let mut guard = next_is_slow.lock().expect("poisoned");
                    let slow = *guard;
                    *guard = !*guard;
                    Box::new(AlternatingCase { slow }) as Box<dyn TestCase>
                }),
            );
        }
        let mut sequences = SequenceRegistry::new();
        sequences.insert(manifest_with(vec![SequenceStep::Case("A".to_string())]));

        let mut config = base_config(PE::PerTestCase, PSM::Completed);
        config.parallel_sync_completed_timeout = Duration::from_secs(30);
        let (control, mut orchestrator) = RunOrchestrator::new(
            config,
            sequences,
            cases,
            Arc::new(NullReportSink),
            Arc::new(NullDbHandler),
            SnIntake::FromUi,
            Utf8PathBuf::from("results"),
        );

        let mut rx = control.take_events_receiver();
        control.send_event(
            ControlEvent::from_json(r#"{"P1": "S1", "P2": "S2", "sequence": "seq1"}"#, &["P1".into(), "P2".into()])
                .unwrap(),
        );

        let run = tokio::spawn(async move {
            orchestrator.run_one(&mut rx).await;
            orchestrator
        });

        // Give P1 time to enter its completed-barrier wait (it would
        // otherwise block for the full 30s timeout, since P2's immediate
        // failure means it never arrives as the second party), then abort
        // and expect prompt completion.
        tokio::time::sleep(Duration::from_millis(50)).await;
        control.abort();

        let orchestrator = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("abort should release the completed barrier immediately")
            .unwrap();
        assert!(orchestrator.positions.iter().all(|p| p.test_status == TestStatus::Abort));
    }
}
