//! Test Position: one physical fixture slot.

use crate::dut::DutRecord;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// `status`: the position's own scheduling state, distinct from the
/// aggregated `test_status` of the case currently running.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Idle,
    Wait,
    Testing,
    Aborting,
}

/// `test_status`: mirrors the lifecycle of the currently running case plus
/// the two states that only apply to a whole position (`Idle`, `Testing`
/// before any case has reported a verdict).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Idle,
    Testing,
    Pass,
    Fail,
    Error,
    Abort,
}

impl Default for TestStatus {
    fn default() -> Self {
        TestStatus::Idle
    }
}

/// A snapshot of a position's previous DUT, retained across
/// `prepare_for_new_test_run` for display purposes (`previous_dut` /
/// `dut_class`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreviousDut {
    pub serial_number: String,
    pub pass_fail_result: crate::result::Verdict,
}

/// One physical fixture slot. Created at process start from station
/// configuration and lives for the process lifetime; `dut` and
/// `test_case_instances` are replaced every run by
/// [`TestPosition::prepare_for_new_test_run`].
pub struct TestPosition {
    pub name: String,
    pub label: String,
    pub step: Option<String>,
    pub status: PositionStatus,
    pub test_status: TestStatus,
    pub dut: Option<DutRecord>,
    pub previous_dut: Option<PreviousDut>,
    /// Per-case instance bookkeeping is owned by the orchestrator
    /// (`case::TestCaseInstance` borrows the position, so the map itself
    /// lives here only as a record of which cases have run this position
    /// this cycle, keyed by case name).
    pub test_case_instances: IndexMap<String, CaseInstanceRecord>,
    pub stop_testing: Arc<AtomicBool>,
    pub stop_looping: Arc<AtomicBool>,
    pub stop_reporting: Arc<AtomicBool>,
}

/// Minimal per-case bookkeeping retained on the position itself (the heavy
/// state lives on the DUT's `test_cases` map; this just tracks whether an
/// instance for this case has already been created this cycle — one
/// instance per (position, case) pair per loop cycle).
#[derive(Clone, Debug)]
pub struct CaseInstanceRecord {
    pub case_name: String,
    pub created_this_cycle: bool,
}

impl TestPosition {
    pub fn new(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            step: None,
            status: PositionStatus::Idle,
            test_status: TestStatus::Idle,
            dut: None,
            previous_dut: None,
            test_case_instances: IndexMap::new(),
            stop_testing: Arc::new(AtomicBool::new(false)),
            stop_looping: Arc::new(AtomicBool::new(false)),
            stop_reporting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Snapshots the current DUT into `previous_dut`, clears per-run state,
    /// and resets the termination flags. Called once per position at the
    /// start of every run.
    pub fn prepare_for_new_test_run(&mut self) {
        self.previous_dut = self.dut.take().map(|dut| PreviousDut {
            serial_number: dut.serial_number,
            pass_fail_result: dut.pass_fail_result,
        });
        self.step = None;
        self.status = PositionStatus::Idle;
        self.test_status = TestStatus::Idle;
        self.test_case_instances.clear();
        self.stop_testing.store(false, Ordering::SeqCst);
        self.stop_looping.store(false, Ordering::SeqCst);
        self.stop_reporting.store(false, Ordering::SeqCst);
    }

    pub fn bind_dut(&mut self, dut: DutRecord) {
        self.dut = Some(dut);
        self.status = PositionStatus::Wait;
    }

    pub fn is_active(&self) -> bool {
        self.dut.is_some() && !self.stop_testing.load(Ordering::SeqCst)
    }

    pub fn should_stop_testing(&self) -> bool {
        self.stop_testing.load(Ordering::SeqCst)
    }

    pub fn should_stop_looping(&self) -> bool {
        self.stop_looping.load(Ordering::SeqCst)
    }

    pub fn request_stop_testing(&self) {
        self.stop_testing.store(true, Ordering::SeqCst);
    }

    pub fn request_stop_looping(&self) {
        self.stop_looping.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dut::DutRecord;

    #[test]
    fn prepare_for_new_run_snapshots_previous_dut() {
        let mut position = TestPosition::new("P1", "Position 1");
        let mut dut = DutRecord::new("S1", "P1");
        dut.pass_fail_result = crate::result::Verdict::Fail;
        position.bind_dut(dut);
        position.request_stop_testing();

        position.prepare_for_new_test_run();

        assert!(position.dut.is_none());
        let prev = position.previous_dut.expect("previous dut retained");
        assert_eq!(prev.serial_number, "S1");
        assert_eq!(prev.pass_fail_result, crate::result::Verdict::Fail);
        assert!(!position.should_stop_testing());
    }

    #[test]
    fn idle_position_is_never_active() {
        let position = TestPosition::new("P1", "Position 1");
        assert!(!position.is_active());
    }
}
