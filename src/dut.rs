//! DUT Record: per-unit measurement, result, and status-message state.

use crate::result::Verdict;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-measurement reduction outcome and metadata, stored under a case's
/// `measurements` map.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Measurement {
    pub measurement: Option<Value>,
    /// Display text for the limit, if any matched (report_limit, or the
    /// predicate's own description).
    pub limit: Option<String>,
    pub unit: Option<String>,
    pub result: Option<Verdict>,
    pub error: Option<String>,
}

/// One case's accumulated record on a DUT (`test_cases[case_name]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaseRecord {
    pub result: Verdict,
    pub measurements: IndexMap<String, Measurement>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_s: Option<f64>,
    pub error: Option<String>,
    pub media: Vec<MediaRecord>,
}

impl CaseRecord {
    pub fn new() -> Self {
        Self {
            result: Verdict::Testing,
            measurements: IndexMap::new(),
            start_time: None,
            end_time: None,
            duration_s: None,
            error: None,
            media: Vec::new(),
        }
    }
}

impl Default for CaseRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// A persisted artefact attached to a case via `store_test_data_file`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaRecord {
    pub name: String,
    pub file_path: String,
    pub run_id: String,
    pub test_case: String,
    pub dut: String,
    pub url: String,
    pub extra: IndexMap<String, Value>,
}

/// Station-supplied identity info resolved by `parse_dut_info`
/// (`common::StationHooks::parse_dut_info`).
#[derive(Clone, Debug, Default)]
pub struct DutInfo {
    pub hw_id: Option<String>,
    pub additional_info: Option<Value>,
}

/// One physical specimen under test. Created by SN Intake, mutated only by
/// its owning [`crate::case::TestCaseInstance`] (measurements/results) and
/// by the orchestrator (final status); destroyed at the next
/// `prepare_for_new_test_run`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DutRecord {
    pub serial_number: String,
    pub test_position: String,
    pub hw_id: Option<String>,
    pub order: Option<u32>,
    pub additional_info: Option<Value>,
    pub test_cases: IndexMap<String, CaseRecord>,
    pub pass_fail_result: Verdict,
    pub failed_steps: Vec<String>,
    pub error_steps: Vec<String>,
}

impl DutRecord {
    pub fn new(serial_number: impl Into<String>, test_position: impl Into<String>) -> Self {
        Self {
            serial_number: serial_number.into(),
            test_position: test_position.into(),
            hw_id: None,
            order: None,
            additional_info: None,
            test_cases: IndexMap::new(),
            pass_fail_result: Verdict::Testing,
            failed_steps: Vec::new(),
            error_steps: Vec::new(),
        }
    }

    pub fn with_info(mut self, info: DutInfo, order: Option<u32>) -> Self {
        self.hw_id = info.hw_id;
        self.additional_info = info.additional_info;
        self.order = order;
        self
    }

    /// Ensures a case record exists for `case_name`, creating one in
    /// `Testing` state if this is the first time it is touched this run.
    pub fn case_entry(&mut self, case_name: &str) -> &mut CaseRecord {
        self.test_cases
            .entry(case_name.to_string())
            .or_insert_with(CaseRecord::new)
    }

    /// Lifts the DUT's overall verdict and, on a non-pass case result,
    /// records the case name in `failed_steps`/`error_steps` without
    /// duplication.
    pub fn record_case_result(&mut self, case_name: &str, result: Verdict) {
        self.pass_fail_result = self.pass_fail_result.lift(result);
        match result {
            Verdict::Fail => {
                if !self.failed_steps.iter().any(|s| s == case_name) {
                    self.failed_steps.push(case_name.to_string());
                }
            }
            Verdict::Error => {
                if !self.error_steps.iter().any(|s| s == case_name) {
                    self.error_steps.push(case_name.to_string());
                }
            }
            _ => {}
        }
    }

    /// Builds the per-DUT user-visible status message.
    pub fn status_message(&self) -> String {
        match self.pass_fail_result {
            Verdict::Pass => format!("{}: PASSED", self.serial_number),
            Verdict::Fail => format!(
                "{}: FAILED: {}",
                self.serial_number,
                self.failed_steps.join(", ")
            ),
            Verdict::Error => {
                let detail = self
                    .error_steps
                    .iter()
                    .map(|step| {
                        let err = self
                            .test_cases
                            .get(step)
                            .and_then(|c| c.error.as_deref())
                            .unwrap_or("unknown error");
                        format!("{step}: {err}")
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{}: ERROR: {}", self.serial_number, detail)
            }
            Verdict::Na | Verdict::Testing => format!("{}: TESTING", self.serial_number),
        }
    }

    /// The DUT passes iff every case in `effective_cases` passed.
    pub fn matches_t1(&self, effective_cases: &[String]) -> bool {
        let all_pass = effective_cases
            .iter()
            .all(|c| self.test_cases.get(c).is_some_and(|r| r.result == Verdict::Pass));
        (self.pass_fail_result == Verdict::Pass) == all_pass
    }

    /// `failed_steps ∪ error_steps` equals exactly the set of cases with
    /// `result ∈ {fail, error}`, and neither list has duplicates.
    pub fn matches_t3(&self) -> bool {
        let mut failed = self.failed_steps.clone();
        let mut errored = self.error_steps.clone();
        failed.sort();
        errored.sort();
        let no_dup_failed = {
            let mut d = failed.clone();
            d.dedup();
            d == failed
        };
        let no_dup_errored = {
            let mut d = errored.clone();
            d.dedup();
            d == errored
        };

        let mut expected: Vec<String> = self
            .test_cases
            .iter()
            .filter(|(_, c)| matches!(c.result, Verdict::Fail | Verdict::Error))
            .map(|(name, _)| name.clone())
            .collect();
        expected.sort();

        let mut union: Vec<String> = failed.iter().chain(errored.iter()).cloned().collect();
        union.sort();
        union.dedup();

        no_dup_failed && no_dup_errored && union == expected
    }
}
