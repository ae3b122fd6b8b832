//! Limit Evaluator.
//!
//! Applies per-measurement predicates and classifies each measurement
//! pass/fail/error, then lifts the per-measurement results into a case
//! verdict through the verdict-reduction fold.

use crate::dut::{CaseRecord, Measurement};
use crate::errors::CaseError;
use crate::result::Verdict;
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A measurement predicate: `value -> Result<pass?, error message>`. The
/// `Result` lets a predicate that itself fails (e.g. a type mismatch)
/// surface as a limit-evaluation error instead of panicking the worker.
pub type Predicate = Arc<dyn Fn(&Value) -> Result<bool, String> + Send + Sync>;

/// One entry of a case's `LIMITS[case][measurement]` table.
#[derive(Clone)]
pub struct Limit {
    pub predicate: Predicate,
    pub unit: Option<String>,
    /// Display text shown in reports; falls back to a generic description
    /// when the station does not supply one (the Python source uses
    /// `inspect.getsource` on the lambda — this crate requires an explicit
    /// string instead, since Rust closures are not introspectable).
    pub report_limit: Option<String>,
    /// When true, a missing measurement for this limit is not an error.
    pub optional: bool,
}

impl fmt::Debug for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limit")
            .field("unit", &self.unit)
            .field("report_limit", &self.report_limit)
            .field("optional", &self.optional)
            .finish_non_exhaustive()
    }
}

impl Limit {
    pub fn new(predicate: impl Fn(&Value) -> Result<bool, String> + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
            unit: None,
            report_limit: None,
            optional: false,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_report_limit(mut self, text: impl Into<String>) -> Self {
        self.report_limit = Some(text.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// `LIMITS[case_name]`: measurement name → limit.
pub type CaseLimits = IndexMap<String, Limit>;

/// `LIMITS`: case name → measurement limits.
pub type LimitsTable = IndexMap<String, CaseLimits>;

/// Evaluates every recorded measurement for `case_name` against its entry
/// in `limits`, writing per-measurement `result`/`limit`/`unit`/`error`
/// fields and lifting the case's own `result` field. The flow-control
/// stop-testing trigger is left to the caller (it returns whether the case
/// is non-pass so the caller can decide whether to call
/// `position.request_stop_testing()`).
pub fn evaluate_case(case: &mut CaseRecord, case_name: &str, limits: &LimitsTable) -> Verdict {
    let case_limits = limits.get(case_name);

    for (measurement_name, measurement) in case.measurements.iter_mut() {
        evaluate_measurement(measurement, case_limits, measurement_name);
    }

    let lifted = case
        .measurements
        .values()
        .map(|m| m.result.unwrap_or(Verdict::Pass))
        .fold(Verdict::Pass, |acc, r| acc.lift(r));

    // Do not downgrade an error already recorded by handle_error / the
    // missing-measurement check.
    case.result = case.result.lift(lifted);
    case.result
}

fn evaluate_measurement(
    measurement: &mut Measurement,
    case_limits: Option<&CaseLimits>,
    measurement_name: &str,
) {
    let Some(limit) = case_limits.and_then(|limits| limits.get(measurement_name)) else {
        // No matching limit entry means the measurement is recorded as a
        // pass with a null limit.
        measurement.result = Some(Verdict::Pass);
        measurement.limit = None;
        measurement.unit = None;
        measurement.error = None;
        return;
    };

    let value = measurement.measurement.clone().unwrap_or(Value::Null);
    measurement.unit = limit.unit.clone();
    measurement.limit = limit.report_limit.clone();

    match (limit.predicate)(&value) {
        Ok(true) => {
            measurement.result = Some(Verdict::Pass);
            measurement.error = None;
        }
        Ok(false) => {
            measurement.result = Some(Verdict::Fail);
            measurement.error = None;
        }
        Err(message) => {
            measurement.result = Some(Verdict::Error);
            measurement.error = Some(message);
        }
    }
}

/// A mandatory limit entry with no corresponding measurement escalates the
/// case to `error`. Called once, from `run_post_test`, after the case's
/// own measurements have been evaluated.
pub fn check_missing_measurements(
    case: &mut CaseRecord,
    case_name: &str,
    limits: &LimitsTable,
) -> Result<(), CaseError> {
    let Some(case_limits) = limits.get(case_name) else {
        return Ok(());
    };

    for (measurement_name, limit) in case_limits {
        if limit.optional {
            continue;
        }
        if !case.measurements.contains_key(measurement_name) {
            case.result = Verdict::Error;
            case.error = Some(format!("Measurement \"{measurement_name}\" missing"));
            return Err(CaseError::MissingMeasurement {
                name: measurement_name.clone(),
            });
        }
    }
    Ok(())
}
