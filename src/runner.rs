use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use crate::config::{translate_exit_code, PROCESS_FAILED_CODE, PROCESS_SIGNALED_CODE};
use crate::error::SupervisorError;
use crate::fs::open_append_log;
use crate::signals::is_termination;

const COPY_BUF_SIZE: usize = 8 * 1024;

/// How long output may keep trickling in after the wrapped process is
/// reaped. Background descendants can hold the pipes open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How the wrapped process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// The process's own exit code, or [`PROCESS_SIGNALED_CODE`] when it was
    /// killed by a signal.
    pub exit_code: i32,
    /// Raw signal number, kept for logging only.
    pub signal: Option<i32>,
}

impl ProcessOutcome {
    pub fn exited(code: i32) -> Self {
        Self { exit_code: code, signal: None }
    }

    pub fn signaled(signal: i32) -> Self {
        Self { exit_code: PROCESS_SIGNALED_CODE, signal: Some(signal) }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::exited(code),
            (None, Some(sig)) => Self::signaled(sig),
            // wait() never reports stopped or continued children.
            (None, None) => Self::exited(PROCESS_FAILED_CODE),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }

    /// Code to hand the orchestrator for a failed run. Signal deaths keep
    /// their sentinel; the process's own codes are translated so they never
    /// read as a supervisor sentinel.
    pub fn failure_code(&self) -> i32 {
        match self.signal {
            Some(_) => self.exit_code,
            None => translate_exit_code(self.exit_code),
        }
    }
}

/// Launches the wrapped command once, capturing stdout and stderr into a
/// single append-only log.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    command: Vec<String>,
    log_path: PathBuf,
    work_dir: Option<PathBuf>,
    tee: bool,
}

impl ProcessRunner {
    pub fn new(command: Vec<String>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            command,
            log_path: log_path.into(),
            work_dir: None,
            tee: true,
        }
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Also copy output to our own stdout/stderr. On by default so the
    /// container runtime's log shows the wrapped process too.
    pub fn tee(mut self, tee: bool) -> Self {
        self.tee = tee;
        self
    }

    /// Run the command to completion.
    ///
    /// Termination signals arriving on `signals` while the process runs are
    /// forwarded to it; anything else is ignored. There is no timeout.
    pub async fn run(
        &self,
        signals: &mut mpsc::Receiver<Signal>,
    ) -> Result<ProcessOutcome, SupervisorError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| SupervisorError::Config("no command to run".into()))?;

        // No log, no child.
        let log = open_append_log(&self.log_path)
            .await
            .map_err(|source| SupervisorError::LogFile {
                path: self.log_path.clone(),
                source,
            })?;
        let log = Arc::new(Mutex::new(log));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(pid, "started {:?}", self.command);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Capture("stdout was not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SupervisorError::Capture("stderr was not piped".into()))?;

        let mut stdout_task = spawn_copy(stdout, log.clone(), self.tee.then(tokio::io::stdout));
        let mut stderr_task = spawn_copy(stderr, log.clone(), self.tee.then(tokio::io::stderr));

        let mut signals_open = true;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status.map_err(SupervisorError::Wait)?,
                sig = signals.recv(), if signals_open => match sig {
                    Some(sig) if is_termination(sig) => forward_signal(pid, sig),
                    Some(sig) => debug!("ignoring {} while the wrapped process runs", sig),
                    None => signals_open = false,
                },
            }
        };

        // The pipes only hit EOF once everything holding them is gone, which
        // may be never if the process left something running in the
        // background.
        let drained = tokio::time::timeout(OUTPUT_DRAIN_GRACE, async {
            let mut captured = 0u64;
            for task in [&mut stdout_task, &mut stderr_task] {
                captured += task
                    .await
                    .map_err(|e| SupervisorError::Capture(e.to_string()))?;
            }
            Ok::<_, SupervisorError>(captured)
        })
        .await;

        let captured = match drained {
            Ok(captured) => Some(captured?),
            Err(_) => {
                stdout_task.abort();
                stderr_task.abort();
                warn!(
                    "output pipes still open {:?} after the wrapped process exited, \
                     the process log is truncated",
                    OUTPUT_DRAIN_GRACE
                );
                None
            }
        };

        if let Err(e) = log.lock().await.flush().await {
            warn!("failed to flush {}: {}", self.log_path.display(), e);
        }

        let outcome = ProcessOutcome::from_status(status);
        info!(
            exit_code = outcome.exit_code,
            signal = outcome.signal,
            bytes = captured,
            "wrapped process exited"
        );
        Ok(outcome)
    }
}

fn forward_signal(pid: Option<u32>, sig: Signal) {
    let Some(pid) = pid else {
        debug!("not forwarding {}, process already reaped", sig);
        return;
    };

    info!(pid, "forwarding {} to wrapped process", sig);
    if let Err(e) = kill(Pid::from_raw(pid as i32), sig) {
        warn!(pid, "failed to forward {}: {}", sig, e);
    }
}

fn spawn_copy<R, W>(reader: R, log: Arc<Mutex<File>>, tee: Option<W>) -> JoinHandle<u64>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(copy_stream(reader, log, tee))
}

/// Drain `reader` into the shared log chunk by chunk, preserving this
/// stream's order. Write failures disable that destination but the pipe
/// keeps being drained so the wrapped process never blocks on a full pipe.
async fn copy_stream<R, W>(mut reader: R, log: Arc<Mutex<File>>, mut tee: Option<W>) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    let mut log_ok = true;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("failed to read wrapped process output: {}", e);
                break;
            }
        };
        total += n as u64;

        if log_ok {
            if let Err(e) = log.lock().await.write_all(&buf[..n]).await {
                warn!("failed to write process log, further output is dropped: {}", e);
                log_ok = false;
            }
        }

        if let Some(w) = tee.as_mut() {
            if w.write_all(&buf[..n]).await.is_err() || w.flush().await.is_err() {
                tee = None;
            }
        }
    }

    total
}
