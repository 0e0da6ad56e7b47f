//! OS signal intake.
//!
//! Signals are funnelled into a plain `mpsc` channel so the runner and the
//! pause controller consume them the same way, and tests can drive both
//! without touching real signals.

use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::debug;

/// Signals that ask the wrapped process (or a paused supervisor) to stop.
pub fn is_termination(sig: Signal) -> bool {
    matches!(sig, Signal::SIGTERM | Signal::SIGINT | Signal::SIGQUIT)
}

/// Signals that end the paused state. SIGUSR1 is the explicit unpause.
pub fn is_release(sig: Signal) -> bool {
    sig == Signal::SIGUSR1 || is_termination(sig)
}

/// Install handlers for SIGTERM, SIGINT, SIGQUIT and SIGUSR1 and forward
/// every delivery into the returned channel.
///
/// Must be called from within a tokio runtime. Handlers are installed before
/// this returns, so nothing delivered afterwards is lost.
pub fn listen() -> std::io::Result<mpsc::Receiver<Signal>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        loop {
            let sig = tokio::select! {
                Some(()) = sigterm.recv() => Signal::SIGTERM,
                Some(()) = sigint.recv() => Signal::SIGINT,
                Some(()) = sigquit.recv() => Signal::SIGQUIT,
                Some(()) = sigusr1.recv() => Signal::SIGUSR1,
                else => break,
            };

            debug!("received {}", sig);
            if tx.send(sig).await.is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usr1_releases_but_does_not_terminate() {
        assert!(is_release(Signal::SIGUSR1));
        assert!(!is_termination(Signal::SIGUSR1));
    }

    #[test]
    fn termination_signals_also_release() {
        for sig in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT] {
            assert!(is_termination(sig));
            assert!(is_release(sig));
        }
        assert!(!is_release(Signal::SIGHUP));
    }

    #[tokio::test]
    async fn delivered_signal_reaches_channel() {
        let mut rx = listen().unwrap();
        nix::sys::signal::raise(Signal::SIGUSR1).unwrap();

        let sig = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(sig, Some(Signal::SIGUSR1));
    }
}
