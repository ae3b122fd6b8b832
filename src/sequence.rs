//! Sequence Loader.
//!
//! Sequence modules are discovered at startup and published as a
//! `name -> SequenceManifest` map; case classes are values in a registry
//! keyed by name, constructed through a typed factory. No runtime
//! attribute lookup on a module object.

use crate::case::CaseFactory;
use crate::errors::ConfigurationError;
use crate::limits::LimitsTable;
use indexmap::{IndexMap, IndexSet};
use serde_json::Value;

/// One token of a sequence's `TESTS` list: either a plain case name or a
/// `<name>_pre` marker that starts that case's `pre_test` in the
/// background at that point in the sequence.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SequenceStep {
    Pre(String),
    Case(String),
}

impl SequenceStep {
    pub fn case_name(&self) -> &str {
        match self {
            SequenceStep::Pre(name) => name,
            SequenceStep::Case(name) => name,
        }
    }
}

/// A named, ordered list of case names plus associated limits and
/// parameters.
pub struct SequenceManifest {
    pub name: String,
    pub tests: Vec<SequenceStep>,
    pub skip: IndexSet<String>,
    pub limits: LimitsTable,
    pub parameters: Value,
    /// Expected populated-position count, if the sequence fixes one.
    pub duts: Option<usize>,
}

impl SequenceManifest {
    /// The effective case list: `TESTS` with `SKIP` removed, collapsing
    /// `_pre` tokens into the base case order while remembering which
    /// cases had a `_pre` marker.
    pub fn effective_cases(&self) -> Vec<String> {
        self.tests
            .iter()
            .filter(|step| !self.skip.contains(step.case_name()))
            .map(|step| step.case_name().to_string())
            .collect()
    }

    /// Applies the UI `test_cases_override` filter, if present: keeps only
    /// the named cases from the effective list, preserving sequence order.
    pub fn filtered_cases(&self, override_filter: Option<&[String]>) -> Vec<String> {
        let effective = self.effective_cases();
        match override_filter {
            Some(names) => effective
                .into_iter()
                .filter(|c| names.iter().any(|n| n == c))
                .collect(),
            None => effective,
        }
    }
}

/// `INSTRUMENTS`-style registry: case name -> factory. Case classes become
/// values in a registry instead of being resolved by dynamic attribute
/// lookup on a loaded module.
#[derive(Default)]
pub struct CaseRegistry {
    factories: IndexMap<String, CaseFactory>,
}

impl CaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: CaseFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn build(&self, name: &str) -> Result<Box<dyn crate::case::TestCase>, ConfigurationError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ConfigurationError::CaseNotFound {
                name: name.to_string(),
            })
    }

    /// Returns a clone of the registered factory itself, for callers that
    /// need to construct instances from a context where `&self` cannot be
    /// held (e.g. across a `tokio::spawn` boundary).
    pub fn factory(&self, name: &str) -> Option<CaseFactory> {
        self.factories.get(name).cloned()
    }
}

/// The resolved sequence directory plus the cross-sequence "pool" of
/// shared cases and their limits.
#[derive(Default)]
pub struct SequenceRegistry {
    sequences: IndexMap<String, SequenceManifest>,
    pool: LimitsTable,
}

impl SequenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, manifest: SequenceManifest) {
        self.sequences.insert(manifest.name.clone(), manifest);
    }

    pub fn set_pool(&mut self, pool: LimitsTable) {
        self.pool = pool;
    }

    pub fn pool(&self) -> &LimitsTable {
        &self.pool
    }

    pub fn known_names(&self) -> Vec<String> {
        self.sequences.keys().cloned().collect()
    }

    pub fn resolve(&self, name: &str) -> Result<&SequenceManifest, ConfigurationError> {
        self.sequences
            .get(name)
            .ok_or_else(|| ConfigurationError::SequenceNotFound {
                name: name.to_string(),
                known: self.known_names(),
            })
    }
}
