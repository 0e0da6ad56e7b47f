use nix::sys::signal::Signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use crate::config::{Config, INTERNAL_ERROR_CODE};
use crate::error::SupervisorError;
use crate::fs::existing_dir;
use crate::health::HealthServer;
use crate::pause::{PauseController, Verdict};
use crate::runner::{ProcessOutcome, ProcessRunner};
use crate::state::{Phase, PhaseTracker};

/// Ties the health endpoint, the runner and the pause controller together
/// for a single run, and picks the final exit code.
///
/// `run` consumes the supervisor, so one instance launches at most one
/// wrapped process.
pub struct Supervisor {
    config: Config,
    phase: PhaseTracker,
    tee: bool,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            phase: PhaseTracker::new(),
            tee: true,
        }
    }

    /// Whether the wrapped process's output is also copied to our own
    /// stdout/stderr.
    pub fn tee_output(mut self, tee: bool) -> Self {
        self.tee = tee;
        self
    }

    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Run to completion and return the exit code for the OS.
    ///
    /// When the pause mode calls for it this blocks until a release signal
    /// arrives on `signals`, potentially forever. The health socket is gone by
    /// the time this returns, whatever the path taken.
    pub async fn run(self, mut signals: mpsc::Receiver<Signal>) -> i32 {
        let code = self.supervise(&mut signals).await;
        self.phase.advance(Phase::Terminated);
        info!(exit_code = code, "entrypoint exiting");
        code
    }

    async fn supervise(&self, signals: &mut mpsc::Receiver<Signal>) -> i32 {
        let config = match self.config.clone().validate() {
            Ok(config) => config,
            Err(e) => return self.internal_error(e),
        };
        self.log_config(&config);

        // Serving before the wrapped process starts, so a probe during
        // Running never finds a missing socket.
        let health = match HealthServer::bind(&config.health_check_socket_path, self.phase()) {
            Ok(server) => server.spawn(),
            Err(e) => return self.internal_error(e),
        };

        let mut runner = ProcessRunner::new(config.command.clone(), &config.process_log_path)
            .tee(self.tee);
        if let Some(dir) = existing_dir(&config.work_dir) {
            runner = runner.work_dir(dir);
        }

        self.phase.advance(Phase::Running);
        let code = match runner.run(signals).await {
            Ok(outcome) => self.conclude(&config, outcome, signals).await,
            Err(e) => self.internal_error(e),
        };

        health.shutdown().await;
        code
    }

    async fn conclude(
        &self,
        config: &Config,
        outcome: ProcessOutcome,
        signals: &mut mpsc::Receiver<Signal>,
    ) -> i32 {
        self.phase.advance(if outcome.succeeded() {
            Phase::Completed
        } else {
            Phase::Failed
        });

        let controller = PauseController::new(config.pause_mode);
        let verdict = controller.decide(&outcome);

        if let Verdict::Pause(code) = verdict {
            self.phase.advance(Phase::Paused);
            warn!(
                pause_mode = %controller.mode(),
                exit_code = code,
                "paused, the container will not exit on its own. \
                 Send SIGUSR1 to release it or stop the container"
            );
            controller.hold(signals).await;
        }

        self.phase.advance(Phase::Exiting);
        verdict.exit_code()
    }

    fn internal_error(&self, e: SupervisorError) -> i32 {
        error!("{}", e);
        self.phase.advance(Phase::InternalError);
        INTERNAL_ERROR_CODE
    }

    fn log_config(&self, config: &Config) {
        info!(
            command = ?config.command,
            pause_mode = %config.pause_mode,
            process_log = %config.process_log_path.display(),
            health_socket = %config.health_check_socket_path.display(),
            "starting entrypoint"
        );
        if !config.registry.is_empty() {
            info!(registry = ?config.registry, "local registry configured");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use crate::config::{PauseMode, PROCESS_PAUSED_CODE, PROCESS_PAUSED_WITH_ERROR_CODE};
    use crate::health::probe;

    const TIMEOUT: Duration = Duration::from_secs(10);

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self { dir: tempdir().unwrap() }
        }

        fn socket(&self) -> PathBuf {
            self.dir.path().join("health.sock")
        }

        fn log(&self) -> PathBuf {
            self.dir.path().join("artifacts/logs/process.log")
        }

        fn config(&self, command: &[&str], mode: PauseMode) -> Config {
            Config::new(command.iter().map(|s| s.to_string()).collect())
                .with_artifacts_dir(self.dir.path().join("artifacts"))
                .with_health_check_socket(self.socket())
                .with_work_dir(self.dir.path())
                .with_pause_mode(mode)
        }
    }

    async fn wait_for_phase(rx: &mut watch::Receiver<Phase>, phase: Phase) {
        tokio::time::timeout(TIMEOUT, rx.wait_for(|p| *p == phase))
            .await
            .unwrap()
            .unwrap();
    }

    async fn run_quiet(config: Config) -> (i32, mpsc::Sender<Signal>) {
        let (tx, rx) = mpsc::channel(4);
        let code = Supervisor::new(config).tee_output(false).run(rx).await;
        (code, tx)
    }

    fn assert_socket_gone(path: &Path) {
        assert!(!path.exists(), "{} still exists", path.display());
    }

    #[tokio::test]
    async fn success_without_pause_exits_zero() {
        let fx = Fixture::new();
        let (code, _tx) = run_quiet(fx.config(&["/bin/true"], PauseMode::Never)).await;

        assert_eq!(code, 0);
        assert_eq!(std::fs::read(fx.log()).unwrap(), b"");
        assert_socket_gone(&fx.socket());
    }

    #[tokio::test]
    async fn failure_without_pause_passes_exit_code_through() {
        let fx = Fixture::new();
        let (code, _tx) =
            run_quiet(fx.config(&["/bin/sh", "-c", "echo boom >&2; exit 7"], PauseMode::Never)).await;

        assert_eq!(code, 7);
        assert_eq!(std::fs::read_to_string(fx.log()).unwrap(), "boom\n");
        assert_socket_gone(&fx.socket());
    }

    #[tokio::test]
    async fn success_with_on_error_exits_zero() {
        let fx = Fixture::new();
        let (code, _tx) = run_quiet(fx.config(&["/bin/true"], PauseMode::OnError)).await;
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn failure_with_on_error_pauses_until_released() {
        let fx = Fixture::new();
        let supervisor = Supervisor::new(fx.config(&["/bin/false"], PauseMode::OnError)).tee_output(false);
        let mut phase = supervisor.phase();
        let (tx, rx) = mpsc::channel(4);
        let run = tokio::spawn(supervisor.run(rx));

        wait_for_phase(&mut phase, Phase::Paused).await;
        let resp = probe(&fx.socket(), TIMEOUT).await.unwrap();
        assert!(resp.is_healthy());
        assert_eq!(resp.phase, Phase::Paused);
        assert!(!run.is_finished());

        tx.send(Signal::SIGUSR1).await.unwrap();
        let code = tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap();

        assert_eq!(code, PROCESS_PAUSED_WITH_ERROR_CODE);
        assert_socket_gone(&fx.socket());
        assert_eq!(*phase.borrow(), Phase::Terminated);
    }

    #[tokio::test]
    async fn success_with_always_pauses() {
        let fx = Fixture::new();
        let supervisor = Supervisor::new(fx.config(&["/bin/true"], PauseMode::Always)).tee_output(false);
        let mut phase = supervisor.phase();
        let (tx, rx) = mpsc::channel(4);
        let run = tokio::spawn(supervisor.run(rx));

        wait_for_phase(&mut phase, Phase::Paused).await;
        tx.send(Signal::SIGTERM).await.unwrap();
        let code = tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap();

        assert_eq!(code, PROCESS_PAUSED_CODE);
        assert_socket_gone(&fx.socket());
    }

    #[tokio::test]
    async fn failure_with_always_pauses_with_error_code() {
        let fx = Fixture::new();
        let supervisor = Supervisor::new(fx.config(&["/bin/false"], PauseMode::Always)).tee_output(false);
        let mut phase = supervisor.phase();
        let (tx, rx) = mpsc::channel(4);
        let run = tokio::spawn(supervisor.run(rx));

        wait_for_phase(&mut phase, Phase::Paused).await;
        tx.send(Signal::SIGUSR1).await.unwrap();

        let code = tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap();
        assert_eq!(code, PROCESS_PAUSED_WITH_ERROR_CODE);
    }

    #[tokio::test]
    async fn health_answers_while_running() {
        let fx = Fixture::new();
        let supervisor =
            Supervisor::new(fx.config(&["/bin/sleep", "2"], PauseMode::Never)).tee_output(false);
        let mut phase = supervisor.phase();
        let (_tx, rx) = mpsc::channel(4);
        let run = tokio::spawn(supervisor.run(rx));

        wait_for_phase(&mut phase, Phase::Running).await;
        let resp = probe(&fx.socket(), TIMEOUT).await.unwrap();
        assert_eq!(resp.phase, Phase::Running);

        assert_eq!(tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap(), 0);
        assert!(probe(&fx.socket(), TIMEOUT).await.is_err());
    }

    #[tokio::test]
    async fn unwritable_log_skips_pause() {
        let fx = Fixture::new();
        let blocker = fx.dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let config = fx
            .config(&["/bin/true"], PauseMode::Always)
            .with_process_log_path(blocker.join("process.log"));

        let (code, _tx) = tokio::time::timeout(TIMEOUT, run_quiet(config)).await.unwrap();

        assert_eq!(code, INTERNAL_ERROR_CODE);
        assert_socket_gone(&fx.socket());
    }

    #[tokio::test]
    async fn missing_command_is_internal_error() {
        let fx = Fixture::new();
        let (code, _tx) = run_quiet(fx.config(&["/no/such/binary"], PauseMode::OnError)).await;

        assert_eq!(code, INTERNAL_ERROR_CODE);
        assert_socket_gone(&fx.socket());
    }

    #[tokio::test]
    async fn empty_command_is_internal_error() {
        let fx = Fixture::new();
        let (code, _tx) = run_quiet(fx.config(&[], PauseMode::Always)).await;

        assert_eq!(code, INTERNAL_ERROR_CODE);
        assert!(!fx.log().exists());
    }

    #[tokio::test]
    async fn unbindable_socket_means_nothing_runs() {
        let fx = Fixture::new();
        std::fs::write(fx.socket(), b"taken").unwrap();
        let marker = fx.dir.path().join("ran");
        let script = format!("touch {}", marker.display());

        let (code, _tx) =
            run_quiet(fx.config(&["/bin/sh", "-c", &script], PauseMode::Always)).await;

        assert_eq!(code, INTERNAL_ERROR_CODE);
        assert!(!marker.exists());
        // Someone else's file stays put.
        assert_eq!(std::fs::read(fx.socket()).unwrap(), b"taken");
    }
}
