//! Errors produced by the engine.
//!
//! Configuration errors are fatal at run start, instrument errors are
//! retryable-or-fatal, case errors never escape a worker, and
//! report/persistence errors are logged and never propagated.

use std::fmt;
use thiserror::Error;

/// A configuration error discovered at run start. Fatal for the current
/// run only: the orchestrator logs it and proceeds to the next gate
/// iteration.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The sequence name supplied by intake is not in the registry.
    #[error("sequence `{name}` not found (known sequences: {})", .known.join(", "))]
    SequenceNotFound {
        name: String,
        known: Vec<String>,
    },

    /// A case token in a sequence's `TESTS` list has no registered factory.
    #[error("test case `{name}` has no registered factory")]
    CaseNotFound { name: String },

    /// `running_mode` from intake is not one of `RUNNING_MODES`.
    #[error("unknown running mode `{mode}` (known modes: {})", .known.join(", "))]
    UnknownRunningMode { mode: String, known: Vec<String> },
}

/// Severity classification for a driver-reported instrument error: drivers
/// return a tagged variant instead of raising, and the worker sets
/// `TestControl::abort` only on `Fatal`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InstrumentErrorKind {
    /// The instrument is unavailable but the run can continue waiting.
    Retryable,
    /// The instrument has failed in a way that invalidates the whole run.
    Fatal,
}

/// An error surfaced by `handle_instrument_status` or a driver call from
/// inside a worker.
#[derive(Debug, Error)]
#[error("instrument `{instrument}` error ({kind:?}): {message}")]
pub struct InstrumentError {
    pub instrument: String,
    pub kind: InstrumentErrorKind,
    pub message: String,
}

impl InstrumentError {
    pub fn retryable(instrument: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            kind: InstrumentErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn fatal(instrument: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            kind: InstrumentErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == InstrumentErrorKind::Fatal
    }
}

/// A captured exception trace, attached verbatim to a case's error payload
/// as `{ type, message, trace[] }`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorTrace {
    pub error_type: String,
    pub message: String,
    pub trace: Vec<String>,
}

impl ErrorTrace {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = trace;
        self
    }
}

impl fmt::Display for ErrorTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

/// An error raised anywhere in a case's pre/test/post execution path.
/// Always recorded on the case record; never propagated past the worker
/// task.
#[derive(Debug, Error)]
pub enum CaseError {
    /// An exception was raised inside `pre_test`/`test`/`post_test`.
    #[error("{0}")]
    Exception(ErrorTrace),

    /// `sync_threads` timed out or its barrier was invalidated by an abort.
    #[error("synchronisation timed out or was aborted")]
    BarrierTimeout,

    /// A measurement named by a mandatory limit entry was never recorded.
    #[error("Measurement \"{name}\" missing")]
    MissingMeasurement { name: String },

    /// A limit predicate itself raised while being evaluated.
    #[error("error evaluating limit for `{measurement}`: {message}")]
    LimitPredicateError { measurement: String, message: String },
}

/// A report-sink or database write failure. Logged and emitted as a
/// progress message; never propagated.
#[derive(Debug, Error)]
#[error("failed to persist {what}: {message}")]
pub struct ReportError {
    pub what: String,
    pub message: String,
}

impl ReportError {
    pub fn new(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            what: what.into(),
            message: message.into(),
        }
    }
}

/// Failure to install the OS signal handler.
#[derive(Debug, Error)]
#[error("failed to set up signal handler: {0}")]
pub struct SignalHandlerSetupError(#[source] pub std::io::Error);

/// The union of errors an orchestrator run-start step can fail with before
/// any case has executed.
#[derive(Debug, Error)]
pub enum RunStartError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Instrument(#[from] InstrumentError),
}
