//! Health check endpoint on a unix socket, and the probe used by the
//! `healthcheck` subcommand.
//!
//! The endpoint only attests that the supervisor is up and scheduling. Every
//! connection gets one JSON line and is closed; whatever the client sends is
//! ignored.

use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use crate::error::SupervisorError;
use crate::fs::remove_socket_file;
use crate::state::Phase;

pub const HEALTHY: &str = "ok";

/// Pause after a failed accept so a persistent error (fd exhaustion) can't
/// spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub phase: Phase,
}

impl HealthResponse {
    pub fn ok(phase: Phase) -> Self {
        Self { status: HEALTHY.to_string(), phase }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HEALTHY
    }
}

/// A bound, not yet serving, health endpoint.
pub struct HealthServer {
    path: PathBuf,
    listener: UnixListener,
    phase: watch::Receiver<Phase>,
}

impl HealthServer {
    /// Bind the socket. Anything already at `path` is an error; we never
    /// clobber someone else's socket. Must be called inside a tokio runtime.
    pub fn bind(
        path: impl Into<PathBuf>,
        phase: watch::Receiver<Phase>,
    ) -> Result<Self, SupervisorError> {
        let path = path.into();
        let listener = UnixListener::bind(&path).map_err(|source| SupervisorError::Bind {
            path: path.clone(),
            source,
        })?;

        info!("health check listening on {}", path.display());
        Ok(Self { path, listener, phase })
    }

    /// Start the accept loop on its own task.
    pub fn spawn(self) -> HealthHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let path = self.path.clone();
        let task = tokio::spawn(self.serve(shutdown_rx));

        HealthHandle { path, shutdown_tx, task }
    }

    async fn serve(self, mut shutdown_rx: oneshot::Receiver<()>) {
        let HealthServer { path, listener, phase } = self;
        let _guard = SocketGuard(path);

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, _)) => {
                        let current = *phase.borrow();
                        tokio::spawn(async move {
                            if let Err(e) = respond(stream, current).await {
                                debug!("health check client error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept health check connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = &mut shutdown_rx => break,
            }
        }

        // Listener closes before the guard removes the socket file.
        drop(listener);
    }
}

/// Running health endpoint.
pub struct HealthHandle {
    path: PathBuf,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl HealthHandle {
    /// Stop accepting and remove the socket file. Returns once the file is
    /// gone.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            error!("health check task ended abnormally: {}", e);
            // The guard ran during unwinding, but make sure.
            remove_socket_file(&self.path);
        }
        info!("health check stopped");
    }
}

/// Removes the socket file when the serving task ends, however it ends.
struct SocketGuard(PathBuf);

impl Drop for SocketGuard {
    fn drop(&mut self) {
        remove_socket_file(&self.0);
    }
}

async fn respond(mut stream: UnixStream, phase: Phase) -> std::io::Result<()> {
    let mut body = serde_json::to_vec(&HealthResponse::ok(phase))?;
    body.push(b'\n');
    stream.write_all(&body).await?;
    stream.shutdown().await
}

/// Connect to the endpoint at `path` and read its response.
pub async fn probe(path: &Path, timeout: Duration) -> anyhow::Result<HealthResponse> {
    let fut = async {
        let mut stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("failed to connect to {}", path.display()))?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .context("failed to read health check response")?;

        if raw.is_empty() {
            bail!("empty health check response");
        }

        let response: HealthResponse =
            serde_json::from_slice(&raw).context("malformed health check response")?;
        Ok::<_, anyhow::Error>(response)
    };

    tokio::time::timeout(timeout, fut)
        .await
        .with_context(|| format!("health check timed out after {:?}", timeout))?
}
