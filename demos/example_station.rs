//! A minimal worked station: two cases on two positions, run once through
//! the PARALLEL discipline.
//!
//! Run with `cargo run --example example_station`.

use camino::Utf8PathBuf;
use linetest_runner::case::{CaseContext, TestCase};
use linetest_runner::common::{
    FlowControl, LoopConfig, ParallelExecution, ParallelSyncMode, StationConfig, StationHooks,
};
use linetest_runner::errors::CaseError;
use linetest_runner::instrument::InstrumentMap;
use linetest_runner::intake::{ControlEvent, SnIntake};
use linetest_runner::limits::{CaseLimits, Limit, LimitsTable};
use linetest_runner::orchestrator::RunOrchestrator;
use linetest_runner::report::{NullDbHandler, NullReportSink};
use linetest_runner::sequence::{CaseRegistry, SequenceManifest, SequenceRegistry, SequenceStep};
use std::sync::Arc;
use std::time::Duration;

/// Measures a fake resistance and records it under "ohms".
struct ResistanceCheck;
impl TestCase for ResistanceCheck {
    fn name(&self) -> &str {
        "resistance_check"
    }

    fn test(&mut self, ctx: &CaseContext) -> Result<(), CaseError> {
        ctx.new_measurement("ohms", 47.2);
        Ok(())
    }
}

/// Toggles a fake relay and records whether it latched.
struct RelayLatchCheck;
impl TestCase for RelayLatchCheck {
    fn name(&self) -> &str {
        "relay_latch_check"
    }

    fn test(&mut self, ctx: &CaseContext) -> Result<(), CaseError> {
        ctx.new_measurement("latched", true);
        Ok(())
    }
}

struct ExampleHooks;
impl StationHooks for ExampleHooks {
    fn boot_up(&self) {
        tracing::info!("example station booting up");
    }
}

fn build_sequence() -> SequenceManifest {
    let mut limits = LimitsTable::new();

    let mut resistance_limits = CaseLimits::new();
    resistance_limits.insert(
        "ohms".to_string(),
        Limit::new(|v| {
            let n = v.as_f64().ok_or_else(|| "ohms must be numeric".to_string())?;
            Ok(n > 40.0 && n < 55.0)
        })
        .with_unit("ohm")
        .with_report_limit("40 < ohms < 55"),
    );
    limits.insert("resistance_check".to_string(), resistance_limits);

    let mut relay_limits = CaseLimits::new();
    relay_limits.insert(
        "latched".to_string(),
        Limit::new(|v| Ok(v.as_bool().unwrap_or(false))).with_report_limit("latched == true"),
    );
    limits.insert("relay_latch_check".to_string(), relay_limits);

    SequenceManifest {
        name: "basic_continuity".to_string(),
        tests: vec![
            SequenceStep::Case("resistance_check".to_string()),
            SequenceStep::Case("relay_latch_check".to_string()),
        ],
        skip: Default::default(),
        limits,
        parameters: serde_json::Value::Null,
        duts: None,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let mut cases = CaseRegistry::new();
    cases.register("resistance_check", Arc::new(|| Box::new(ResistanceCheck) as Box<dyn TestCase>));
    cases.register("relay_latch_check", Arc::new(|| Box::new(RelayLatchCheck) as Box<dyn TestCase>));

    let mut sequences = SequenceRegistry::new();
    sequences.insert(build_sequence());

    let config = StationConfig {
        test_positions: vec!["P1".to_string(), "P2".to_string()],
        instruments: InstrumentMap::new(),
        db_handler_name: "null".to_string(),
        flow_control: FlowControl::StopOnFail,
        parallel_execution: ParallelExecution::Parallel,
        parallel_sync_mode: ParallelSyncMode::Mid,
        parallel_sync_completed_timeout: Duration::from_secs(10),
        loop_config: LoopConfig::disabled(),
        sn_from_ui: true,
        sn_externally: false,
        sn_from_instrument: false,
        running_modes: vec!["default".to_string()],
        gage_rr: None,
        hooks: Box::new(ExampleHooks),
    };

    let (control, orchestrator) = RunOrchestrator::new(
        config,
        sequences,
        cases,
        Arc::new(NullReportSink),
        Arc::new(NullDbHandler),
        SnIntake::FromUi,
        Utf8PathBuf::from("results"),
    );

    let progress = orchestrator.progress();
    let run = tokio::spawn(orchestrator.run_forever());

    control.send_event(
        ControlEvent::from_json(
            r#"{"P1": "SN001", "P2": "SN002", "sequence": "basic_continuity"}"#,
            &["P1".to_string(), "P2".to_string()],
        )
        .unwrap(),
    );

    let mut rx = progress.subscribe();
    loop {
        rx.changed().await.unwrap();
        if let Some(result) = rx.borrow().overall_result.clone() {
            println!("run finished: {result}");
            break;
        }
    }

    control.terminate();
    control.send_event(ControlEvent::from_json("{}", &[]).unwrap());
    run.await.unwrap();
}
