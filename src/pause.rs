use nix::sys::signal::Signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use crate::config::{PauseMode, PROCESS_PAUSED_CODE, PROCESS_PAUSED_WITH_ERROR_CODE};
use crate::runner::ProcessOutcome;
use crate::signals::is_release;

/// What to do once the wrapped process has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Exit right away with this code.
    Exit(i32),
    /// Block until released, then exit with this code.
    Pause(i32),
}

impl Verdict {
    pub fn exit_code(&self) -> i32 {
        match *self {
            Verdict::Exit(code) | Verdict::Pause(code) => code,
        }
    }
}

/// Decides between exiting and pausing, and implements the pause itself.
///
/// Only ever sees outcomes of a wrapped process that actually ran. Supervisor
/// failures never get here.
#[derive(Debug, Clone, Copy)]
pub struct PauseController {
    mode: PauseMode,
}

impl PauseController {
    pub fn new(mode: PauseMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> PauseMode {
        self.mode
    }

    pub fn decide(&self, outcome: &ProcessOutcome) -> Verdict {
        match (self.mode, outcome.succeeded()) {
            (PauseMode::Never, true) | (PauseMode::OnError, true) => Verdict::Exit(0),
            (PauseMode::Never, false) => Verdict::Exit(outcome.failure_code()),
            (PauseMode::OnError, false) | (PauseMode::Always, false) => {
                Verdict::Pause(PROCESS_PAUSED_WITH_ERROR_CODE)
            }
            (PauseMode::Always, true) => Verdict::Pause(PROCESS_PAUSED_CODE),
        }
    }

    /// Block until a release signal arrives on `signals`. There is no
    /// timeout: the container will not exit on its own while paused.
    ///
    /// If the channel closes nothing can release us any more, and the wait
    /// lasts until the container is torn down.
    pub async fn hold(&self, signals: &mut mpsc::Receiver<Signal>) -> Signal {
        while let Some(sig) = signals.recv().await {
            if is_release(sig) {
                info!("released from pause by {}", sig);
                return sig;
            }
            debug!("ignoring {} while paused", sig);
        }

        warn!("signal channel closed while paused, waiting for container teardown");
        std::future::pending().await
    }
}
