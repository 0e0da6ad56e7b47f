use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the entrypoint itself, as opposed to the wrapped process
/// failing. Every variant ends the run with the internal error code and never
/// enters the pause state.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to open process log '{path}': {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait on wrapped process: {0}")]
    Wait(#[source] io::Error),

    #[error("failed to capture wrapped process output: {0}")]
    Capture(String),

    #[error("failed to bind health check socket '{path}': {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),
}
