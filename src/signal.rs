//! OS signal handling.
//!
//! A `Standard`/`Noop` handler kind: a station binary embedding this engine
//! gets Ctrl-C-to-abort for free, while the orchestrator itself only ever
//! observes [`crate::control::TestControl::abort`]/`terminate` — it never
//! touches a signal type.

use crate::control::TestControl;
use crate::errors::SignalHandlerSetupError;
use std::sync::Arc;

/// The kind of signal handling to set up for a station process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SignalHandlerKind {
    /// Turn SIGINT/SIGTERM (or Ctrl-C on Windows) into an abort of the
    /// current run; a second signal requests termination of the outer
    /// loop.
    Standard,
    /// Do nothing. Useful for tests and embedded stations that handle
    /// signals themselves.
    Noop,
}

impl SignalHandlerKind {
    /// Spawns the signal-handling task, if any, feeding it the shared
    /// [`TestControl`].
    pub fn spawn(self, control: Arc<TestControl>) -> Result<(), SignalHandlerSetupError> {
        match self {
            SignalHandlerKind::Noop => Ok(()),
            SignalHandlerKind::Standard => {
                tokio::spawn(run_standard_handler(control));
                Ok(())
            }
        }
    }
}

async fn run_standard_handler(control: Arc<TestControl>) {
    let mut seen_once = false;
    loop {
        if wait_for_shutdown_signal().await.is_none() {
            return;
        }
        if seen_once {
            control.terminate();
            return;
        }
        seen_once = true;
        control.abort();
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Option<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut int = signal(SignalKind::interrupt()).ok()?;
    let mut term = signal(SignalKind::terminate()).ok()?;
    tokio::select! {
        _ = int.recv() => Some(()),
        _ = term.recv() => Some(()),
    }
}

#[cfg(windows)]
async fn wait_for_shutdown_signal() -> Option<()> {
    tokio::signal::ctrl_c().await.ok()
}
