//! Core test-orchestration engine for a multi-position production line test
//! sequencer.
//!
//! This crate owns the run-loop orchestrator and the test-case execution
//! contract: the state machine that drives one full test run, the
//! parallel/per-DUT/per-test-case scheduling disciplines and their barrier
//! semantics, the pre/test/post lifecycle of a case instance with
//! measurement-to-limit-to-verdict reduction, the DUT/test-position data
//! model, and the progress-reporting contract. The HTTP control plane,
//! report rendering, instrument drivers, and user test-case business logic
//! are external collaborators represented here only by their trait
//! boundaries.

pub mod barrier;
pub mod case;
pub mod common;
pub mod control;
pub mod dut;
pub mod errors;
pub mod instrument;
pub mod intake;
pub mod limits;
pub mod orchestrator;
pub mod position;
pub mod progress;
pub mod report;
pub mod result;
pub mod sequence;
pub mod signal;

pub use control::TestControl;
pub use orchestrator::RunOrchestrator;
pub use result::Verdict;
