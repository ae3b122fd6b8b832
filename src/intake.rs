//! SN Intake.
//!
//! A blocking consumer of a single control-event stream that assembles DUT
//! serials, sequence selection, and the rest of the run-start parameters.
//! Three variants, selected per station: from the UI, from an external
//! caller, and from an instrument that reports its own DUT list.

use crate::control::TestControl;
use crate::sequence::SequenceRegistry;
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One parsed, valid message off the control-event stream. Built by
/// [`ControlEvent::from_json`]; invalid JSON or a message with no
/// recognisable fields never produces one — invalid messages are ignored.
#[derive(Clone, Debug, Default)]
pub struct ControlEvent {
    pub sequence: Option<String>,
    pub serials: IndexMap<String, String>,
    pub running_mode: Option<String>,
    pub gage_rr: Option<Value>,
    pub operator: Option<String>,
    pub test_cases_filter: Option<IndexMap<String, Vec<String>>>,
    pub external_selection: Option<bool>,
    pub order: Option<String>,
    pub instrument_type: Option<String>,
    pub instrument_sn: Option<String>,
}

impl ControlEvent {
    /// Parses a raw JSON object into a [`ControlEvent`], recognising the
    /// documented subset of keys. Any subset may be present; per-position
    /// serials are read from keys matching `known_positions`, accepting
    /// either a bare string or `{"sn": string}`.
    pub fn from_json(raw: &str, known_positions: &[String]) -> Option<Self> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let obj = value.as_object()?;

        let mut event = ControlEvent::default();
        event.sequence = obj.get("sequence").and_then(Value::as_str).map(str::to_string);
        event.running_mode = obj
            .get("running_mode")
            .and_then(Value::as_str)
            .map(str::to_string);
        event.gage_rr = obj.get("gage_rr").cloned();
        event.operator = obj.get("operator").and_then(Value::as_str).map(str::to_string);
        event.external_selection = obj.get("external_selection").and_then(Value::as_bool);
        event.order = obj.get("order").and_then(Value::as_str).map(str::to_string);
        event.instrument_type = obj.get("type").and_then(Value::as_str).map(str::to_string);
        event.instrument_sn = obj.get("SN").and_then(Value::as_str).map(str::to_string);

        if let Some(test_cases) = obj.get("testCases").and_then(Value::as_object) {
            let mut filter = IndexMap::new();
            for (sequence, cases) in test_cases {
                let names: Vec<String> = cases
                    .as_array()?
                    .iter()
                    .filter_map(|c| c.get("name").and_then(Value::as_str).map(str::to_string))
                    .collect();
                filter.insert(sequence.clone(), names);
            }
            event.test_cases_filter = Some(filter);
        }

        for position in known_positions {
            if let Some(field) = obj.get(position) {
                let sn = match field {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(o) => o.get("sn").and_then(Value::as_str).map(str::to_string),
                    _ => None,
                };
                if let Some(sn) = sn {
                    if !sn.is_empty() {
                        event.serials.insert(position.clone(), sn);
                    }
                }
            }
        }

        Some(event)
    }

    fn merge(&mut self, other: ControlEvent) {
        if other.sequence.is_some() {
            self.sequence = other.sequence;
        }
        self.serials.extend(other.serials);
        if other.running_mode.is_some() {
            self.running_mode = other.running_mode;
        }
        if other.gage_rr.is_some() {
            self.gage_rr = other.gage_rr;
        }
        if other.operator.is_some() {
            self.operator = other.operator;
        }
        if other.test_cases_filter.is_some() {
            self.test_cases_filter = other.test_cases_filter;
        }
        if other.external_selection.is_some() {
            self.external_selection = other.external_selection;
        }
        if other.order.is_some() {
            self.order = other.order;
        }
        if other.instrument_type.is_some() {
            self.instrument_type = other.instrument_type;
        }
        if other.instrument_sn.is_some() {
            self.instrument_sn = other.instrument_sn;
        }
    }
}

/// The result of one completed intake: enough to bind DUTs and load a
/// sequence.
#[derive(Clone, Debug, Default)]
pub struct IntakeResult {
    pub serials: IndexMap<String, String>,
    pub sequence_name: Option<String>,
    pub operator: Option<String>,
    pub test_cases_override: Option<Vec<String>>,
    pub external_selection: bool,
    pub running_mode: Option<String>,
    pub gage_rr: Option<Value>,
}

/// One DUT as reported by an instrument, for the `FromInstrument` variant.
#[derive(Clone, Debug)]
pub struct ReportedDut {
    pub kind: String,
    pub serial_number: String,
    pub order: Option<u32>,
}

/// An instrument capable of reporting its own attached-DUT list, polled at
/// 1 Hz by `FromInstrument` intake.
pub trait DutReportingInstrument: Send + Sync {
    fn duts(&self) -> Vec<ReportedDut>;
}

/// Resolves an instrument-reported `type` string to the closest matching
/// sequence name: exact match preferred over substring match. Returns
/// `None` if nothing matches.
pub fn resolve_sequence_name(reported_type: &str, known_sequences: &[String]) -> Option<String> {
    if let Some(exact) = known_sequences.iter().find(|s| s.as_str() == reported_type) {
        return Some(exact.clone());
    }
    known_sequences
        .iter()
        .find(|s| s.contains(reported_type) || reported_type.contains(s.as_str()))
        .cloned()
}

/// Blocking consumer of the control-event stream. Three variants,
/// selected per station.
pub enum SnIntake {
    /// Accumulates serials and sequence selection typed in through the UI.
    FromUi,
    /// As `FromUi`, plus the extra validation external callers must
    /// satisfy: a single shared sequence across all populated positions,
    /// at least one serial, and unique serials.
    FromExternal,
    /// Polls an instrument's own DUT list at 1 Hz and re-injects an
    /// assembled message into its own event stream.
    FromInstrument {
        instrument: Arc<dyn DutReportingInstrument>,
        poll_interval: Duration,
    },
}

impl SnIntake {
    /// Blocks until a full binding is assembled: either the sequence named
    /// in the accumulated event declares a `DUTS` count that is met by the
    /// number of non-empty serials seen so far, or every configured
    /// position has received one. The sequence's `DUTS` count is re-read
    /// from `sequences` after every merged message, since the sequence
    /// name itself may arrive in the same or a later message than the
    /// serials it governs. Malformed messages are silently dropped and the
    /// consumer keeps waiting.
    pub async fn recv_one_run(
        &self,
        positions: &[String],
        sequences: &SequenceRegistry,
        events: &mut mpsc::UnboundedReceiver<ControlEvent>,
        control: &TestControl,
    ) -> Option<IntakeResult> {
        let known_sequences = sequences.known_names();
        if let SnIntake::FromInstrument {
            instrument,
            poll_interval,
        } = self
        {
            return self
                .recv_from_instrument(positions, &known_sequences, instrument, *poll_interval, control)
                .await;
        }

        let mut accumulated = ControlEvent::default();
        loop {
            if control.should_terminate() {
                return None;
            }
            let event = events.recv().await?;
            accumulated.merge(event);

            if matches!(self, SnIntake::FromExternal) {
                if !Self::external_is_valid(&accumulated, positions) {
                    continue;
                }
            }

            let expected_duts = accumulated
                .sequence
                .as_deref()
                .and_then(|name| sequences.resolve(name).ok())
                .and_then(|manifest| manifest.duts);

            if Self::is_complete(&accumulated, positions, expected_duts) {
                return Some(Self::finish(accumulated));
            }
        }
    }

    fn is_complete(
        event: &ControlEvent,
        positions: &[String],
        expected_duts: Option<usize>,
    ) -> bool {
        match expected_duts {
            Some(count) => event.serials.len() >= count,
            None => positions.iter().all(|p| event.serials.contains_key(p)),
        }
    }

    /// External intake's additional validation: all populated positions
    /// must declare the same sequence, at least one serial must be
    /// present, and serials must be unique.
    fn external_is_valid(event: &ControlEvent, _positions: &[String]) -> bool {
        if event.serials.is_empty() {
            return false;
        }
        let mut seen = std::collections::HashSet::new();
        for sn in event.serials.values() {
            if !seen.insert(sn.as_str()) {
                return false;
            }
        }
        event.sequence.is_some()
    }

    fn finish(event: ControlEvent) -> IntakeResult {
        let test_cases_override = event.sequence.as_ref().and_then(|seq| {
            event
                .test_cases_filter
                .as_ref()
                .and_then(|filter| filter.get(seq.as_str()).cloned())
        });
        IntakeResult {
            serials: event.serials,
            sequence_name: event.sequence,
            operator: event.operator,
            test_cases_override,
            external_selection: event.external_selection.unwrap_or(false),
            running_mode: event.running_mode,
            gage_rr: event.gage_rr,
        }
    }

    async fn recv_from_instrument(
        &self,
        positions: &[String],
        known_sequences: &[String],
        instrument: &Arc<dyn DutReportingInstrument>,
        poll_interval: Duration,
        control: &TestControl,
    ) -> Option<IntakeResult> {
        loop {
            if control.should_terminate() {
                return None;
            }
            let reported = instrument.duts();
            if !reported.is_empty() {
                let mut serials = IndexMap::new();
                let mut sequence_name = None;
                for (reported_dut, position) in reported.iter().zip(positions.iter()) {
                    serials.insert(position.clone(), reported_dut.serial_number.clone());
                    if sequence_name.is_none() {
                        sequence_name =
                            resolve_sequence_name(&reported_dut.kind, known_sequences);
                    }
                }
                if !serials.is_empty() {
                    return Some(IntakeResult {
                        serials,
                        sequence_name,
                        operator: None,
                        test_cases_override: None,
                        external_selection: false,
                        running_mode: None,
                        gage_rr: None,
                    });
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}
