use std::fmt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Lifecycle of one supervisor run.
///
/// ```text
/// Starting -> Running -> {Completed, Failed} -> {Exiting, Paused} -> Terminated
///     \          \                                  Paused -> Exiting
///      `----------`--> InternalError -> Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Starting,
    Running,
    Completed,
    Failed,
    InternalError,
    Paused,
    Exiting,
    Terminated,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::InternalError => "internal-error",
            Phase::Paused => "paused",
            Phase::Exiting => "exiting",
            Phase::Terminated => "terminated",
        }
    }

    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;

        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, InternalError)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, InternalError)
                | (Completed, Exiting)
                | (Completed, Paused)
                | (Failed, Exiting)
                | (Failed, Paused)
                | (Paused, Exiting)
                | (Exiting, Terminated)
                | (InternalError, Terminated)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owns the current phase and publishes it to read-only observers (the
/// health endpoint).
#[derive(Debug)]
pub struct PhaseTracker {
    tx: watch::Sender<Phase>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Phase::Starting);
        Self { tx }
    }

    pub fn current(&self) -> Phase {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.tx.subscribe()
    }

    /// Move to `next`. Illegal moves are still applied so observers never see
    /// a stale phase, but they are logged loudly.
    pub fn advance(&self, next: Phase) {
        let prev = self.current();
        if !prev.can_transition_to(next) {
            warn!("unexpected phase transition {} -> {}", prev, next);
        }
        debug!("phase {} -> {}", prev, next);
        self.tx.send_replace(next);
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_paths_are_legal() {
        let paths = [
            vec![Phase::Starting, Phase::Running, Phase::Completed, Phase::Exiting, Phase::Terminated],
            vec![Phase::Starting, Phase::Running, Phase::Failed, Phase::Paused, Phase::Exiting, Phase::Terminated],
            vec![Phase::Starting, Phase::Running, Phase::Completed, Phase::Paused, Phase::Exiting, Phase::Terminated],
            vec![Phase::Starting, Phase::InternalError, Phase::Terminated],
            vec![Phase::Starting, Phase::Running, Phase::InternalError, Phase::Terminated],
        ];

        for path in paths {
            for pair in path.windows(2) {
                assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            }
        }
    }

    #[test]
    fn internal_error_never_pauses() {
        assert!(!Phase::InternalError.can_transition_to(Phase::Paused));
        assert!(!Phase::InternalError.can_transition_to(Phase::Exiting));
    }

    #[test]
    fn terminated_is_final() {
        for next in [Phase::Starting, Phase::Running, Phase::Paused, Phase::Exiting] {
            assert!(!Phase::Terminated.can_transition_to(next));
        }
    }

    #[test]
    fn tracker_publishes_to_subscribers() {
        let tracker = PhaseTracker::new();
        let rx = tracker.subscribe();
        assert_eq!(*rx.borrow(), Phase::Starting);

        tracker.advance(Phase::Running);
        assert_eq!(*rx.borrow(), Phase::Running);
        assert_eq!(tracker.current(), Phase::Running);
    }

    #[test]
    fn phase_serializes_kebab_case() {
        let json = serde_json::to_string(&Phase::InternalError).unwrap();
        assert_eq!(json, "\"internal-error\"");
    }
}
