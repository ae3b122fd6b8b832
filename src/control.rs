//! The test-control surface: an explicit struct rather than a shared
//! mutable dict — a mutex for the mutating fields, a `Notify` for the run
//! gate, and a channel for the control-event stream.

use crate::barrier::GenerationalBarrier;
use crate::intake::ControlEvent;
use crate::progress::ProgressSnapshot;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, Notify};

/// Mutable fields of the test-control surface that are read/written from
/// multiple threads but do not need a dedicated signalling primitive.
#[derive(Clone, Debug, Default)]
pub struct TestControlFields {
    pub single_run: bool,
    pub report_off: bool,
    pub dry_run: bool,
    pub mock: Vec<String>,
    pub inverse_mock: Vec<String>,
    pub get_sn_from_ui: bool,
    pub get_sn_externally: bool,
    pub test_sequences: Vec<String>,
    pub test_cases: Vec<String>,
    pub running_mode: Option<String>,
    pub test_time: Option<f64>,
    pub progress: Option<ProgressSnapshot>,
}

/// The shared cross-thread control record: the run gate, `terminate`,
/// `abort`, and the rest of the test-control surface.
pub struct TestControl {
    run_gate: Notify,
    running: AtomicBool,
    terminate: AtomicBool,
    abort: AtomicBool,
    fields: Mutex<TestControlFields>,
    events_tx: mpsc::UnboundedSender<ControlEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlEvent>>>,
    start_time_monotonic: Mutex<Option<Instant>>,
    stop_time_monotonic: Mutex<Option<Instant>>,
    /// Barriers live for the current run, held weakly so a finished run's
    /// barriers are simply dropped rather than requiring explicit
    /// deregistration.
    barriers: Mutex<Vec<Weak<GenerationalBarrier>>>,
}

impl TestControl {
    pub fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            run_gate: Notify::new(),
            running: AtomicBool::new(true),
            terminate: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            fields: Mutex::new(TestControlFields::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            start_time_monotonic: Mutex::new(None),
            stop_time_monotonic: Mutex::new(None),
            barriers: Mutex::new(Vec::new()),
        })
    }

    /// Registers a barrier as live for the current run so [`abort`] can
    /// invalidate it immediately rather than letting a blocked waiter ride
    /// out its full timeout. Opportunistically prunes already-dropped
    /// entries first.
    pub fn register_barrier(&self, barrier: &Arc<GenerationalBarrier>) {
        let mut guard = self.barriers.lock().expect("barriers mutex poisoned");
        guard.retain(|b| b.strong_count() > 0);
        guard.push(Arc::downgrade(barrier));
    }

    /// Takes ownership of the control-event receiver. Panics if called
    /// twice: there is exactly one SN-intake consumer per process.
    pub fn take_events_receiver(&self) -> mpsc::UnboundedReceiver<ControlEvent> {
        self.events_rx
            .lock()
            .expect("events_rx mutex poisoned")
            .take()
            .expect("control-event receiver already taken")
    }

    pub fn send_event(&self, event: ControlEvent) {
        // A closed receiver just means no run is currently waiting on
        // intake; the event is simply dropped, it has nowhere useful to go.
        let _ = self.events_tx.send(event);
    }

    /// Pauses the gate: a new run will not start until [`resume`] is
    /// called. Does not interrupt a run already in flight.
    pub fn pause(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.run_gate.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Blocks until the gate is open.
    pub async fn wait_for_gate(&self) {
        while !self.is_running() {
            self.run_gate.notified().await;
        }
    }

    /// Ends the outer loop after the current iteration.
    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
        self.run_gate.notify_waiters();
    }

    pub fn should_terminate(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// Cancels only the current run; routes through `test_aborted` and
    /// invalidates every barrier registered for this run so a worker
    /// blocked in a rendezvous fails fast instead of riding out its
    /// timeout.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        let guard = self.barriers.lock().expect("barriers mutex poisoned");
        for barrier in guard.iter() {
            if let Some(barrier) = barrier.upgrade() {
                barrier.abort();
            }
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Clears the abort flag and the barrier registry at the start of a
    /// fresh run.
    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::SeqCst);
        self.barriers.lock().expect("barriers mutex poisoned").clear();
    }

    pub fn with_fields<R>(&self, f: impl FnOnce(&mut TestControlFields) -> R) -> R {
        let mut guard = self.fields.lock().expect("fields mutex poisoned");
        f(&mut guard)
    }

    pub fn snapshot_fields(&self) -> TestControlFields {
        self.fields.lock().expect("fields mutex poisoned").clone()
    }

    pub fn mark_run_start(&self) {
        *self.start_time_monotonic.lock().expect("poisoned") = Some(Instant::now());
    }

    pub fn mark_run_stop(&self) {
        *self.stop_time_monotonic.lock().expect("poisoned") = Some(Instant::now());
    }

    pub fn elapsed_since_start(&self) -> Option<std::time::Duration> {
        self.start_time_monotonic
            .lock()
            .expect("poisoned")
            .map(|t| t.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pause_blocks_gate_until_resume() {
        let control = TestControl::new();
        control.pause();
        assert!(!control.is_running());

        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move {
                control.wait_for_gate().await;
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        control.resume();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("gate should open after resume")
            .unwrap();
    }

    #[test]
    fn abort_flag_round_trips() {
        let control = TestControl::new();
        assert!(!control.is_aborted());
        control.abort();
        assert!(control.is_aborted());
        control.clear_abort();
        assert!(!control.is_aborted());
    }

    #[test]
    fn abort_invalidates_registered_barriers() {
        let control = TestControl::new();
        let barrier = GenerationalBarrier::new(2);
        control.register_barrier(&barrier);

        let waiter_barrier = Arc::clone(&barrier);
        let handle = std::thread::spawn(move || waiter_barrier.wait(std::time::Duration::from_secs(30)));
        std::thread::sleep(std::time::Duration::from_millis(20));

        control.abort();
        assert!(matches!(
            handle.join().unwrap(),
            Err(crate::errors::CaseError::BarrierTimeout)
        ));
    }
}
