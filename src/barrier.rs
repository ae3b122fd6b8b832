//! Generation-counted rendezvous barrier.
//!
//! Closes a reset race that a naive barrier (reset immediately after the
//! last party passes) is prone to: a thread completing generation N would
//! otherwise race with waiters already arriving for generation N+1. Every
//! [`wait`] call is tagged with the generation it arrived in, and a thread
//! cannot be counted towards generation N+1 until it calls `wait` again.
//!
//! Built on `std::sync::{Mutex, Condvar}` rather than an async primitive
//! because case bodies are opaque, blocking user code run from inside
//! `tokio::task::spawn_blocking` — the rendezvous itself has to be a
//! blocking primitive callable from a blocking task, not an `.await`-based
//! one.

use crate::errors::CaseError;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

struct State {
    generation: u64,
    count: usize,
    aborted: bool,
}

/// A rendezvous point for a fixed number of parties, reusable across
/// generations.
pub struct GenerationalBarrier {
    parties: usize,
    state: Mutex<State>,
    condvar: Condvar,
}

/// The outcome of one party's [`GenerationalBarrier::wait`] call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitResult {
    /// This thread was the one that completed the generation.
    Leader,
    /// Another thread completed the generation; this one just observed it.
    Follower,
}

impl GenerationalBarrier {
    pub fn new(parties: usize) -> Arc<Self> {
        Arc::new(Self {
            parties: parties.max(1),
            state: Mutex::new(State {
                generation: 0,
                count: 0,
                aborted: false,
            }),
            condvar: Condvar::new(),
        })
    }

    /// Blocks until every party has called `wait` for the current
    /// generation, the timeout elapses, or the barrier is aborted.
    ///
    /// On timeout or abort, returns [`CaseError::BarrierTimeout`] and
    /// invalidates the barrier for every other waiter: on timeout, expiry,
    /// or orchestrator abort, every barrier fails fast instead of hanging a
    /// live waiter forever.
    pub fn wait(&self, timeout: Duration) -> Result<WaitResult, CaseError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock().expect("barrier mutex poisoned");
        if guard.aborted {
            return Err(CaseError::BarrierTimeout);
        }

        let my_generation = guard.generation;
        guard.count += 1;

        if guard.count == self.parties {
            guard.count = 0;
            guard.generation += 1;
            self.condvar.notify_all();
            return Ok(WaitResult::Leader);
        }

        loop {
            if guard.aborted {
                return Err(CaseError::BarrierTimeout);
            }
            if guard.generation != my_generation {
                return Ok(WaitResult::Follower);
            }
            let now = Instant::now();
            if now >= deadline {
                guard.aborted = true;
                self.condvar.notify_all();
                return Err(CaseError::BarrierTimeout);
            }
            let (next_guard, timeout_result) = self
                .condvar
                .wait_timeout(guard, deadline - now)
                .expect("barrier mutex poisoned");
            guard = next_guard;
            if timeout_result.timed_out() && guard.generation == my_generation && !guard.aborted {
                guard.aborted = true;
                self.condvar.notify_all();
                return Err(CaseError::BarrierTimeout);
            }
        }
    }

    /// Invalidates the barrier immediately: every current and future
    /// waiter returns `Err(CaseError::BarrierTimeout)` until a fresh
    /// barrier is installed. Used on orchestrator abort.
    pub fn abort(&self) {
        let mut guard = self.state.lock().expect("barrier mutex poisoned");
        guard.aborted = true;
        self.condvar.notify_all();
    }
}
