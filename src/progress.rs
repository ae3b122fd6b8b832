//! Progress Reporter.
//!
//! A mutable aggregate guarded by a single mutex, published through a
//! `tokio::sync::watch` channel. `watch` already gives exactly the
//! semantics wanted here: subscribers consume at their own pace, and
//! overflow drops old snapshots because only the latest value is ever kept
//! (most-recent-wins is acceptable since state is always re-derivable from
//! the next emission).

use crate::common::GageRrCounters;
use crate::position::{PositionStatus, TestPosition, TestStatus};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use tokio::sync::watch;

/// `general_state`: the coarse orchestrator phase, published so consumers
/// can assert the monotone sequence a run's state passes through.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneralState {
    Boot,
    Initialized,
    Prepare,
    Testing,
    Finalize,
    CreateTestReport,
    Shutdown,
}

/// One test position's entry in a progress snapshot's `duts` map.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub step: Option<String>,
    pub status: PositionStatus,
    pub sn: Option<String>,
    pub test_status: TestStatus,
    pub dut_class: Option<Value>,
}

/// The stable JSON shape published to progress subscribers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub general_state: Option<GeneralState>,
    pub duts: IndexMap<String, PositionSnapshot>,
    pub sequence_name: Option<String>,
    pub get_sn_from_ui: bool,
    pub test_sequences: Vec<String>,
    pub test_cases: Vec<String>,
    pub running_mode: Option<String>,
    pub gage_rr: Option<GageRrCounters>,
    pub overall_result: Option<String>,
    pub statistics: Option<Value>,
    pub instrument_status: Option<IndexMap<String, String>>,
    pub version_info: Option<IndexMap<String, String>>,
    pub operator_instructions: Option<String>,
    pub report_paths: IndexMap<String, String>,
}

impl Default for GeneralState {
    fn default() -> Self {
        GeneralState::Boot
    }
}

struct Aggregate {
    snapshot: ProgressSnapshot,
}

/// Thread-safe aggregation of run state into a single JSON-shaped
/// snapshot; pushes snapshots to subscribers via a `watch` channel.
#[derive(Clone)]
pub struct ProgressReporter {
    aggregate: std::sync::Arc<Mutex<Aggregate>>,
    sender: watch::Sender<ProgressSnapshot>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(ProgressSnapshot::default());
        Self {
            aggregate: std::sync::Arc::new(Mutex::new(Aggregate {
                snapshot: ProgressSnapshot::default(),
            })),
            sender,
        }
    }

    /// Subscribes to the progress stream; the subscriber always reads the
    /// most recently published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.sender.subscribe()
    }

    pub fn set_general_state(&self, state: GeneralState) {
        self.mutate(|s| s.general_state = Some(state));
    }

    pub fn set_sequence_name(&self, name: Option<String>) {
        self.mutate(|s| s.sequence_name = name);
    }

    pub fn set_running_mode(&self, mode: Option<String>) {
        self.mutate(|s| s.running_mode = mode);
    }

    pub fn set_gage_rr(&self, counters: Option<GageRrCounters>) {
        self.mutate(|s| s.gage_rr = counters);
    }

    pub fn set_overall_result(&self, result: Option<String>) {
        self.mutate(|s| s.overall_result = result);
    }

    pub fn set_statistics(&self, statistics: Value) {
        self.mutate(|s| s.statistics = Some(statistics));
    }

    /// Renders `positions` into the snapshot's `duts` map.
    pub fn set_positions(&self, positions: &[TestPosition]) {
        self.mutate(|s| {
            s.duts = positions
                .iter()
                .map(|position| {
                    let (sn, dut_class) = match (&position.dut, &position.previous_dut) {
                        (Some(dut), _) => (
                            Some(dut.serial_number.clone()),
                            Some(serde_json::to_value(dut).unwrap_or(Value::Null)),
                        ),
                        (None, Some(prev)) => (
                            None,
                            Some(serde_json::to_value(prev).unwrap_or(Value::Null)),
                        ),
                        (None, None) => (None, None),
                    };
                    (
                        position.name.clone(),
                        PositionSnapshot {
                            step: position.step.clone(),
                            status: position.status,
                            sn,
                            test_status: position.test_status,
                            dut_class,
                        },
                    )
                })
                .collect();
        });
    }

    /// Sparse per-instrument map update.
    pub fn set_instrument_status(&self, name: &str, status: &str) {
        self.mutate(|s| {
            s.instrument_status
                .get_or_insert_with(IndexMap::new)
                .insert(name.to_string(), status.to_string());
        });
    }

    /// Sparse version-info map update.
    pub fn set_version_info(&self, key: &str, value: &str) {
        self.mutate(|s| {
            s.version_info
                .get_or_insert_with(IndexMap::new)
                .insert(key.to_string(), value.to_string());
        });
    }

    pub fn show_operator_instructions(&self, message: &str, append: bool) {
        self.mutate(|s| {
            s.operator_instructions = if append {
                match &s.operator_instructions {
                    Some(existing) => Some(format!("{existing}\n{message}")),
                    None => Some(message.to_string()),
                }
            } else {
                Some(message.to_string())
            };
        });
    }

    pub fn set_report_paths(&self, paths: IndexMap<String, String>) {
        self.mutate(|s| s.report_paths = paths);
    }

    pub fn current(&self) -> ProgressSnapshot {
        self.aggregate.lock().expect("progress mutex poisoned").snapshot.clone()
    }

    fn mutate(&self, f: impl FnOnce(&mut ProgressSnapshot)) {
        let mut guard = self.aggregate.lock().expect("progress mutex poisoned");
        f(&mut guard.snapshot);
        // A closed channel (no subscribers left) is not an error here:
        // the aggregate itself is still the source of truth via `current`.
        let _ = self.sender.send(guard.snapshot.clone());
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}
