//! Station (Common) Definitions: the station-wide configuration surface.
//!
//! Every configuration knob a station needs is given a typed home here
//! instead of being read off a loosely-typed config object by name.

use crate::errors::{ConfigurationError, InstrumentError};
use crate::instrument::InstrumentMap;
use crate::progress::ProgressReporter;
use std::time::Duration;

/// `FLOW_CONTROL`: whether a non-pass result stops the rest of the
/// sequence for that position.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlowControl {
    /// Stop running further cases for this position after a fail/error.
    StopOnFail,
    /// Always run every case in the sequence regardless of result.
    Continue,
}

/// `PARALLEL_EXECUTION`: the scheduling discipline.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParallelExecution {
    /// Fan out every active position per case, no rendezvous.
    Parallel,
    /// Serial per-position traversal of the whole case list.
    PerDut,
    /// Fan out per case with barrier rendezvous (see [`ParallelSyncMode`]).
    PerTestCase,
}

/// `PARALLEL_SYNC_PER_TEST_CASE`: which barriers are installed under
/// `PerTestCase`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParallelSyncMode {
    /// Only the mid-case `sync_threads` barrier.
    Mid,
    /// Only the single rendezvous after `test` returns, before `post_test`.
    Completed,
    /// Both barriers installed simultaneously.
    Both,
}

/// `LOOP_EXECUTION` + `LOOP_TIME_IN_SECONDS`.
#[derive(Copy, Clone, Debug)]
pub struct LoopConfig {
    pub enabled: bool,
    pub budget: Duration,
}

impl LoopConfig {
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            budget: Duration::ZERO,
        }
    }
}

/// `GAGE_RR`: measurement-system study mode, iterating operator × dut ×
/// trial. The counter advancement order is fixed: trial → dut → operator,
/// wrapping to `completed`.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GageRrConfig {
    pub operators: Vec<String>,
    pub duts: Vec<String>,
    pub trials: u32,
}

/// Mutable Gage-R&R progress counters, advanced once per finished run.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GageRrCounters {
    pub trial: u32,
    pub dut: usize,
    pub operator: usize,
    pub completed: bool,
}

impl GageRrCounters {
    /// Advances trial → dut → operator, wrapping to `completed = true` once
    /// every operator has seen every dut for every trial.
    pub fn advance(&mut self, config: &GageRrConfig) {
        if self.completed {
            return;
        }
        self.trial += 1;
        if self.trial >= config.trials {
            self.trial = 0;
            self.dut += 1;
            if self.dut >= config.duts.len() {
                self.dut = 0;
                self.operator += 1;
                if self.operator >= config.operators.len() {
                    self.operator = 0;
                    self.completed = true;
                }
            }
        }
    }
}

/// The result of `StationHooks::identify_duts`: serials keyed by position
/// name plus, on stations where identification also resolves sequence
/// selection, the sequence name to use.
#[derive(Clone, Debug, Default)]
pub struct DutIdentification {
    pub serials: Vec<(String, String)>,
    pub sequence_name: Option<String>,
}

/// `TEST_POSITIONS`, `DB_HANDLER_NAME`, and the rest of the station-wide
/// configuration surface.
pub struct StationConfig {
    pub test_positions: Vec<String>,
    pub instruments: InstrumentMap,
    pub db_handler_name: String,
    pub flow_control: FlowControl,
    pub parallel_execution: ParallelExecution,
    pub parallel_sync_mode: ParallelSyncMode,
    pub parallel_sync_completed_timeout: Duration,
    pub loop_config: LoopConfig,
    pub sn_from_ui: bool,
    pub sn_externally: bool,
    pub sn_from_instrument: bool,
    pub running_modes: Vec<String>,
    pub gage_rr: Option<GageRrConfig>,
    pub hooks: Box<dyn StationHooks>,
}

impl StationConfig {
    pub fn validate_running_mode(&self, mode: &str) -> Result<(), ConfigurationError> {
        if self.running_modes.iter().any(|m| m == mode) {
            Ok(())
        } else {
            Err(ConfigurationError::UnknownRunningMode {
                mode: mode.to_string(),
                known: self.running_modes.clone(),
            })
        }
    }
}

/// Station lifecycle hooks. All have a no-op default except
/// `identify_duts`/`parse_dut_info`, which the orchestrator needs a real
/// answer from and which are therefore still overridable by the embedding
/// station even though they carry a default.
pub trait StationHooks: Send + Sync {
    /// One-time instrument/driver bring-up, called once before the outer
    /// loop starts.
    fn boot_up(&self) {}

    /// Runs once per run, before case execution, after positions are bound.
    fn prepare_test(&self, _positions: &[String]) {}

    /// Runs once per case per run, before fan-out, in PARALLEL/PER_TEST_CASE.
    fn prepare_test_case(&self, _case_name: &str) {}

    /// Runs once per loop cycle, before the cycle's cases execute.
    fn prepare_loop(&self, _cycle: u64) {}

    /// Runs once per loop cycle, after the cycle's cases finish.
    fn finalize_loop(&self, _cycle: u64) {}

    /// Runs once per run, after all cases and before the report is written.
    fn finalize_test(&self) {}

    /// Runs instead of `finalize_test` when the run was aborted.
    fn test_aborted(&self) {}

    /// Runs once before process shutdown.
    fn shutdown(&self) {}

    /// Blocks until every configured instrument is `Ok` or explicitly
    /// mocked; returns a fatal error to abort the run.
    fn handle_instrument_status(
        &self,
        _progress: &ProgressReporter,
    ) -> Result<(), InstrumentError> {
        Ok(())
    }

    /// Resolves DUT identity (and, on some stations, sequence selection)
    /// independently of SN intake. Used as the sequence name when intake
    /// returned none, and its serials override the UI selection whenever
    /// `external_selection` is set.
    fn identify_duts(&self) -> Option<DutIdentification> {
        None
    }

    /// Parses an intake-supplied serial/info blob into whatever
    /// `additional_info`/`hw_id` the station records on the DUT.
    fn parse_dut_info(
        &self,
        _info: &str,
        _position: &str,
        _order: Option<u32>,
    ) -> crate::dut::DutInfo {
        crate::dut::DutInfo::default()
    }

    fn set_events(&self, _events: &serde_json::Value) {}

    fn update_parameters(&self, _sequence: &str) {}

    fn update_test_case_params(&self, _case: &str) {}

    fn get_tester_info(&self) -> Option<String> {
        None
    }
}
