//! In-container entrypoint for image tests.
//!
//! Runs one wrapped command, captures its output into the artifacts dir,
//! serves a health check socket while it runs, and optionally pauses
//! afterwards so the container can be inspected. The orchestrator outside
//! the container only sees the exit code, the artifacts and the health
//! socket; see [`config`] for the exit code contract.

pub mod config;
pub mod error;
pub mod fs;
pub mod health;
pub mod pause;
pub mod runner;
pub mod signals;
pub mod state;
pub mod supervisor;

pub use config::{Config, PauseMode};
pub use error::SupervisorError;
pub use supervisor::Supervisor;
