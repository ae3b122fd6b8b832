//! The result lattice: `pass | fail | error | NA | testing`.
//!
//! A small totally-ordered enum and a monotone join operator, instead of
//! ad-hoc truthiness checks over loosely-typed pass/fail/error values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The verdict of a measurement, a case, or a whole DUT.
///
/// Ordered so that `Pass < Fail < Error`; `Na` and `Testing` sit outside the
/// pass/fail/error chain and are never produced by [`lift`]. The ordering is
/// declaration order: a verdict never moves "down" the chain once lifted.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Not applicable: the case/measurement was never run (e.g. skipped).
    Na,
    /// Currently in progress.
    Testing,
    /// All constituent measurements/cases passed.
    Pass,
    /// At least one measurement/case failed its limit.
    Fail,
    /// An exception, missing measurement, or predicate error occurred.
    Error,
}

impl Verdict {
    /// Monotone join over the lattice `pass < fail < error`.
    ///
    /// `Na`/`Testing` are absorbed by any `Pass`/`Fail`/`Error` incoming
    /// value, since those two states only ever describe the *absence* of a
    /// result, never compete with a real one.
    pub fn lift(self, incoming: Verdict) -> Verdict {
        use Verdict::*;
        match (self, incoming) {
            (Na | Testing, other) => other,
            (current, Na | Testing) => current,
            (current, incoming) => current.max(incoming),
        }
    }

    /// True for [`Verdict::Pass`].
    pub fn is_pass(self) -> bool {
        matches!(self, Verdict::Pass)
    }

    /// True for [`Verdict::Fail`] or [`Verdict::Error`].
    pub fn is_failed_or_errored(self) -> bool {
        matches!(self, Verdict::Fail | Verdict::Error)
    }
}

impl Default for Verdict {
    fn default() -> Self {
        Verdict::Testing
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Na => "NA",
            Verdict::Testing => "testing",
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::Error => "error",
        };
        f.write_str(s)
    }
}
