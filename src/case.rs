//! Test Case Base.
//!
//! The engine drives each case instance through a fixed four-step
//! execution path; user code only ever implements `pre_test`/`test`/
//! `post_test` and the engine-invoked `clean*` hooks. Nothing here is
//! called by user code except through the [`CaseContext`] methods.

use crate::barrier::GenerationalBarrier;
use crate::common::FlowControl;
use crate::dut::{DutRecord, MediaRecord};
use crate::errors::{CaseError, ErrorTrace};
use crate::instrument::InstrumentMap;
use crate::limits::{check_missing_measurements, evaluate_case, LimitsTable};
use crate::progress::ProgressReporter;
use crate::report::{media_dest_name, DbHandler, RunId};
use crate::result::Verdict;
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Everything one case instance needs to reach the DUT, the position's
/// termination flags, the instrument map, and the persistence sinks,
/// without holding a borrow across the `spawn_blocking` boundary.
#[derive(Clone)]
pub struct CaseContext {
    pub case_name: String,
    pub dut: Arc<Mutex<DutRecord>>,
    pub stop_testing: Arc<std::sync::atomic::AtomicBool>,
    pub stop_looping: Arc<std::sync::atomic::AtomicBool>,
    pub flow_control: FlowControl,
    pub parameters: Arc<Value>,
    pub instruments: InstrumentMap,
    pub db_handler: Arc<dyn DbHandler>,
    pub progress: ProgressReporter,
    pub run_id: RunId,
    /// The mid-case rendezvous barrier, installed by the orchestrator only
    /// under `PerTestCase` with `Mid`/`Both` sync mode.
    pub mid_barrier: Option<Arc<GenerationalBarrier>>,
}

impl CaseContext {
    /// Records a measurement value under the current case for the current
    /// DUT. Idempotent on name: the last write wins.
    pub fn new_measurement(&self, name: impl Into<String>, value: impl Into<Value>) {
        let mut dut = self.dut.lock().expect("dut mutex poisoned");
        let case = dut.case_entry(&self.case_name);
        let entry = case
            .measurements
            .entry(name.into())
            .or_insert_with(Default::default);
        entry.measurement = Some(value.into());
    }

    /// Emits an instruction event via the Progress Reporter; `append`
    /// concatenates with a newline separator.
    pub fn show_operator_instructions(&self, message: &str, append: bool) {
        self.progress.show_operator_instructions(message, append);
    }

    /// Sets the position's `stop_testing` flag, effective before the next
    /// case.
    pub fn stop_testing(&self) {
        self.stop_testing.store(true, Ordering::SeqCst);
    }

    /// Sets the position's `stop_looping` flag, effective before the next
    /// loop cycle.
    pub fn stop_looping(&self) {
        self.stop_looping.store(true, Ordering::SeqCst);
    }

    /// Cooperative mid-case rendezvous across all live positions. Fails
    /// with [`CaseError::BarrierTimeout`] on timeout or abort.
    pub fn sync_threads(&self, timeout: Duration) -> Result<(), CaseError> {
        match &self.mid_barrier {
            Some(barrier) => barrier.wait(timeout).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Relocates a file produced by the case into the run's artefact
    /// directory under a unique name, persists a metadata record through
    /// `db_handler`, and attaches the record to the case's `media` list.
    pub fn store_test_data_file(
        &self,
        source_path: &camino::Utf8Path,
        dest_name: &str,
        extra: indexmap::IndexMap<String, Value>,
    ) -> Result<(), crate::errors::ReportError> {
        let serial = self
            .dut
            .lock()
            .expect("dut mutex poisoned")
            .serial_number
            .clone();
        let final_name = media_dest_name(&self.case_name, &serial, self.run_id, dest_name);

        let record = MediaRecord {
            name: final_name.clone(),
            file_path: format!("file_attachments/{final_name}"),
            run_id: self.run_id.to_string(),
            test_case: self.case_name.clone(),
            dut: serial,
            url: format!("/api/media/{final_name}"),
            extra,
        };

        self.db_handler.store_test_data_file(&record)?;

        let mut dut = self.dut.lock().expect("dut mutex poisoned");
        let case = dut.case_entry(&self.case_name);
        case.media.push(record);
        let _ = source_path; // relocation is owned by the embedding station's fs layer
        Ok(())
    }
}

/// The user-overridable phases of one test case.
pub trait TestCase: Send {
    fn name(&self) -> &str;

    /// Runs in the background before `test`, when the sequence's `_pre`
    /// token for this case is reached. Optional; default no-op.
    fn pre_test(&mut self, _ctx: &CaseContext) -> Result<(), CaseError> {
        Ok(())
    }

    /// The case's primary body. Required.
    fn test(&mut self, ctx: &CaseContext) -> Result<(), CaseError>;

    /// Runs in the background after `test` returns. Optional; default
    /// no-op.
    fn post_test(&mut self, _ctx: &CaseContext) -> Result<(), CaseError> {
        Ok(())
    }

    /// Invoked by the engine after every run, regardless of verdict.
    fn clean(&mut self, _ctx: &CaseContext) {}

    /// Invoked by the engine when the DUT's verdict is `pass`.
    fn clean_pass(&mut self, _ctx: &CaseContext) {}

    /// Invoked by the engine when the DUT's verdict is not `pass`.
    fn clean_fail(&mut self, _ctx: &CaseContext) {}

    /// Invoked by the engine instead of `clean_pass`/`clean_fail` when the
    /// case itself errored.
    fn clean_error(&mut self, _ctx: &CaseContext) {}
}

/// A factory constructing a fresh [`TestCase`] instance, keyed by case
/// name in the sequence registry.
pub type CaseFactory = Arc<dyn Fn() -> Box<dyn TestCase> + Send + Sync>;

/// Stateful execution of one case for one DUT: owns the timing fields and
/// the [`CaseContext`], and drives the pre/test/post lifecycle. One
/// instance per (position, case) pair per loop cycle.
pub struct TestCaseInstance {
    pub case_name: String,
    pub ctx: CaseContext,
    pub start_time: Option<chrono::DateTime<Utc>>,
    pub start_time_monotonic: Option<Instant>,
    pub end_time: Option<chrono::DateTime<Utc>>,
    pub duration_s: Option<f64>,
}

impl TestCaseInstance {
    pub fn new(case_name: impl Into<String>, ctx: CaseContext) -> Self {
        Self {
            case_name: case_name.into(),
            ctx,
            start_time: None,
            start_time_monotonic: None,
            end_time: None,
            duration_s: None,
        }
    }

    /// Stamps `start_time`, initialises the DUT's case record, runs
    /// `pre_test`, then re-evaluates results.
    pub fn run_pre_test(
        &mut self,
        case: &mut dyn TestCase,
        limits: &LimitsTable,
    ) -> Result<(), CaseError> {
        self.start_time = Some(Utc::now());
        self.start_time_monotonic = Some(Instant::now());
        {
            let mut dut = self.ctx.dut.lock().expect("dut mutex poisoned");
            dut.case_entry(&self.case_name);
        }
        case.pre_test(&self.ctx)?;
        self.evaluate_results(limits);
        Ok(())
    }

    /// Runs `test`, performs the mid-case rendezvous if the case body
    /// calls `sync_threads` itself, then re-evaluates results.
    pub fn run_test(
        &mut self,
        case: &mut dyn TestCase,
        limits: &LimitsTable,
    ) -> Result<(), CaseError> {
        case.test(&self.ctx)?;
        self.evaluate_results(limits);
        Ok(())
    }

    /// Runs `post_test`, re-evaluates, checks missing-limit coverage,
    /// dispatches `clean_pass`/`clean_fail`, then `clean`, then stamps
    /// `end_time`/`duration_s`.
    pub fn run_post_test(
        &mut self,
        case: &mut dyn TestCase,
        limits: &LimitsTable,
    ) -> Result<(), CaseError> {
        case.post_test(&self.ctx)?;
        self.evaluate_results(limits);

        let missing = {
            let mut dut = self.ctx.dut.lock().expect("dut mutex poisoned");
            let record = dut.case_entry(&self.case_name);
            check_missing_measurements(record, &self.case_name, limits)
        };

        let dut_passing = {
            let dut = self.ctx.dut.lock().expect("dut mutex poisoned");
            dut.pass_fail_result == Verdict::Pass
        };
        if dut_passing {
            case.clean_pass(&self.ctx);
        } else {
            case.clean_fail(&self.ctx);
        }
        case.clean(&self.ctx);

        self.stamp_timing();

        if let Err(err) = &missing {
            if let CaseError::MissingMeasurement { .. } = err {
                self.record_flow_control();
            }
        }
        missing
    }

    /// Classifies the whole case as `error` with a full error payload,
    /// stamps end times, invokes `clean_error`. Never propagates further.
    pub fn handle_error(&mut self, case: &mut dyn TestCase, trace: ErrorTrace) {
        {
            let mut dut = self.ctx.dut.lock().expect("dut mutex poisoned");
            let record = dut.case_entry(&self.case_name);
            record.result = Verdict::Error;
            record.error = Some(trace.to_string());
        }
        {
            let mut dut = self.ctx.dut.lock().expect("dut mutex poisoned");
            dut.record_case_result(&self.case_name, Verdict::Error);
        }
        self.record_flow_control();
        self.stamp_timing();
        case.clean_error(&self.ctx);
    }

    fn evaluate_results(&self, limits: &LimitsTable) {
        let mut dut = self.ctx.dut.lock().expect("dut mutex poisoned");
        let result = {
            let record = dut.case_entry(&self.case_name);
            evaluate_case(record, &self.case_name, limits)
        };
        dut.record_case_result(&self.case_name, result);
        drop(dut);
        if result.is_failed_or_errored() {
            self.record_flow_control();
        }
    }

    fn record_flow_control(&self) {
        if self.ctx.flow_control == FlowControl::StopOnFail {
            self.ctx.stop_testing();
        }
    }

    fn stamp_timing(&mut self) {
        self.end_time = Some(Utc::now());
        if let Some(start) = self.start_time_monotonic {
            self.duration_s = Some(start.elapsed().as_secs_f64());
        }
        let mut dut = self.ctx.dut.lock().expect("dut mutex poisoned");
        let record = dut.case_entry(&self.case_name);
        record.start_time = self.start_time;
        record.end_time = self.end_time;
        record.duration_s = self.duration_s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::InstrumentMap;
    use crate::progress::ProgressReporter;
    use crate::report::NullDbHandler;

    struct PassingCase;
    impl TestCase for PassingCase {
        fn name(&self) -> &str {
            "A"
        }
        fn test(&mut self, ctx: &CaseContext) -> Result<(), CaseError> {
            ctx.new_measurement("x", 5);
            Ok(())
        }
    }

    fn make_ctx(dut: Arc<Mutex<DutRecord>>) -> CaseContext {
        CaseContext {
            case_name: "A".to_string(),
            dut,
            stop_testing: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            stop_looping: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            flow_control: FlowControl::Continue,
            parameters: Arc::new(Value::Null),
            instruments: InstrumentMap::new(),
            db_handler: Arc::new(NullDbHandler),
            progress: ProgressReporter::new(),
            run_id: RunId::new(),
            mid_barrier: None,
        }
    }

    #[test]
    fn full_lifecycle_records_measurement_and_passes() {
        let dut = Arc::new(Mutex::new(DutRecord::new("S1", "P1")));
        let ctx = make_ctx(Arc::clone(&dut));
        let mut instance = TestCaseInstance::new("A", ctx);
        let mut case = PassingCase;
        let mut limits = LimitsTable::new();
        let mut case_limits = crate::limits::CaseLimits::new();
        case_limits.insert(
            "x".to_string(),
            crate::limits::Limit::new(|v| Ok(v.as_i64().unwrap_or(0) < 10)),
        );
        limits.insert("A".to_string(), case_limits);

        instance.run_pre_test(&mut case, &limits).unwrap();
        instance.run_test(&mut case, &limits).unwrap();
        instance.run_post_test(&mut case, &limits).unwrap();

        let dut = dut.lock().unwrap();
        assert_eq!(dut.pass_fail_result, Verdict::Pass);
        assert_eq!(dut.test_cases["A"].measurements["x"].result, Some(Verdict::Pass));
    }

    #[test]
    fn handle_error_escalates_dut_to_error() {
        let dut = Arc::new(Mutex::new(DutRecord::new("S1", "P1")));
        let ctx = make_ctx(Arc::clone(&dut));
        let mut instance = TestCaseInstance::new("A", ctx);
        let mut case = PassingCase;
        instance.handle_error(&mut case, ErrorTrace::new("ValueError", "boom"));

        let dut = dut.lock().unwrap();
        assert_eq!(dut.pass_fail_result, Verdict::Error);
        assert_eq!(dut.test_cases["A"].result, Verdict::Error);
    }
}
