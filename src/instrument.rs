//! Instrument handles and status tracking (`INSTRUMENTS`).
//!
//! Concrete drivers and their connection-retry loops are out of scope;
//! this module only owns the named handle map and the status enum the
//! orchestrator's `handle_instrument_status` hook reports through.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The status of one configured instrument, as published on progress
/// snapshots (`instrument_status`).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentStatus {
    /// Not yet probed this run.
    Unknown,
    /// Connected and responding.
    Ok,
    /// Explicitly mocked out (station running with `--mock <name>`-style
    /// configuration); treated the same as `Ok` for gating purposes.
    Mocked,
    /// Failed to respond; `handle_instrument_status` keeps retrying.
    Error,
}

impl InstrumentStatus {
    /// True once the instrument no longer blocks `CHECK_INSTRUMENTS`.
    pub fn is_ready(self) -> bool {
        matches!(self, InstrumentStatus::Ok | InstrumentStatus::Mocked)
    }
}

/// An opaque instrument handle. Concrete drivers implement this trait
/// outside the engine; the engine only calls `probe`.
pub trait InstrumentHandle: Send + Sync {
    /// Probes the instrument's current connection/health state.
    fn probe(&self) -> InstrumentStatus;
}

/// A named, mock-aware instrument that is always ready. Useful for tests
/// and for stations that mock a subset of their instruments.
pub struct MockInstrument;

impl InstrumentHandle for MockInstrument {
    fn probe(&self) -> InstrumentStatus {
        InstrumentStatus::Mocked
    }
}

/// `INSTRUMENTS`: the station-wide named instrument map.
#[derive(Clone, Default)]
pub struct InstrumentMap {
    handles: IndexMap<String, Arc<dyn InstrumentHandle>>,
}

impl InstrumentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, handle: Arc<dyn InstrumentHandle>) {
        self.handles.insert(name.into(), handle);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn InstrumentHandle>> {
        self.handles.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handles.keys().map(String::as_str)
    }

    /// Probes every configured instrument, returning `(name, status)`
    /// pairs in configuration order.
    pub fn probe_all(&self) -> Vec<(String, InstrumentStatus)> {
        self.handles
            .iter()
            .map(|(name, handle)| (name.clone(), handle.probe()))
            .collect()
    }

    pub fn all_ready(&self) -> bool {
        self.handles.values().all(|h| h.probe().is_ready())
    }
}
