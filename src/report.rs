//! Persistence sinks: the report writer and the results database are
//! opaque collaborators invoked once per completed run (and once per
//! completed loop cycle). This module owns only the traits the
//! orchestrator calls through, plus the artefact-path layout rules, and
//! the run identity type used to key idempotent writes.

use crate::common::GageRrCounters;
use crate::dut::MediaRecord;
use crate::errors::ReportError;
use crate::position::TestPosition;
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// A unique identity for one orchestrator run, used in artefact file names
/// and as the idempotence key passed to [`ReportSink::write_report`].
/// Mirrors the thin `Copy` newtype-over-`Uuid` shape of `quick-junit`'s
/// `ReportUuid`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a report sink needs to render one run (or one loop cycle) of
/// results.
pub struct ReportContext<'a> {
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub sequence_name: String,
    pub positions: &'a [TestPosition],
    pub parameters: &'a Value,
    pub loop_cycle: u64,
    /// True only on the final cycle of a looped run.
    pub last_result: bool,
}

/// The run-report sink. Required to be idempotent-on-name: if called
/// repeatedly for the same `(run_id, loop_cycle)`, the last call wins.
pub trait ReportSink: Send + Sync {
    fn write_report(&self, ctx: &ReportContext<'_>) -> Result<(), ReportError>;
}

/// The results database, treated as an opaque persistence sink.
pub trait DbHandler: Send + Sync {
    fn store_test_data_file(&self, record: &MediaRecord) -> Result<(), ReportError>;

    fn store_run_result(&self, ctx: &ReportContext<'_>) -> Result<(), ReportError>;
}

/// A sink that records nothing. Used by tests and by stations configured
/// with `report_off`.
#[derive(Default)]
pub struct NullReportSink;

impl ReportSink for NullReportSink {
    fn write_report(&self, _ctx: &ReportContext<'_>) -> Result<(), ReportError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct NullDbHandler;

impl DbHandler for NullDbHandler {
    fn store_test_data_file(&self, _record: &MediaRecord) -> Result<(), ReportError> {
        Ok(())
    }

    fn store_run_result(&self, _ctx: &ReportContext<'_>) -> Result<(), ReportError> {
        Ok(())
    }
}

/// Builds the `results/<YYYY>/<M>/<D>/<positionA-sn>_<positionB-sn>_….html`
/// path from the bound positions' serials, in position order.
pub fn report_html_path(
    root: &Utf8PathBuf,
    timestamp: DateTime<Utc>,
    positions: &[TestPosition],
) -> Utf8PathBuf {
    let mut name_parts = Vec::new();
    for position in positions {
        if let Some(dut) = &position.dut {
            name_parts.push(format!("{}-{}", position.name, dut.serial_number));
        }
    }
    let file_name = format!("{}.html", name_parts.join("_"));
    root.join(timestamp.format("%Y").to_string())
        .join(timestamp.format("%-m").to_string())
        .join(timestamp.format("%-d").to_string())
        .join(file_name)
}

/// Builds the `file_attachments/<case>_<serial>_<run_id>_<dest>` path.
pub fn media_dest_name(
    case_name: &str,
    serial_number: &str,
    run_id: RunId,
    dest_name: &str,
) -> String {
    format!("{case_name}_{serial_number}_{run_id}_{dest_name}")
}

/// Advances the Gage-R&R counters after a run finalises. Kept here
/// alongside the rest of the end-of-run bookkeeping this module already
/// owns.
pub fn advance_gage_rr(
    counters: &mut GageRrCounters,
    config: Option<&crate::common::GageRrConfig>,
) {
    if let Some(config) = config {
        counters.advance(config);
    }
}
