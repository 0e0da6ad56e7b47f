use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use crate::error::SupervisorError;
use crate::fs::resolve_under;

/// Exit code when the entrypoint itself fails. The orchestrator matches on the
/// full value; a POSIX parent only sees the low byte.
pub const INTERNAL_ERROR_CODE: i32 = 1000;

/// The wrapped process failed and the entrypoint is paused.
pub const PROCESS_PAUSED_WITH_ERROR_CODE: i32 = 75;

/// The entrypoint is paused after a successful run. Non-zero because the
/// orchestrator waits on some completion signal.
pub const PROCESS_PAUSED_CODE: i32 = 78;

/// The wrapped process was terminated by a signal.
pub const PROCESS_SIGNALED_CODE: i32 = 255;

/// Stand-in for a wrapped exit code that would read as one of ours.
pub const PROCESS_FAILED_CODE: i32 = 1;

/// Exit statuses (low byte) the orchestrator reads as entrypoint sentinels.
pub const RESERVED_EXIT_STATUSES: [i32; 4] = [
    PROCESS_PAUSED_WITH_ERROR_CODE,
    PROCESS_PAUSED_CODE,
    INTERNAL_ERROR_CODE & 0xff,
    PROCESS_SIGNALED_CODE,
];

/// Translate the wrapped process's own non-zero exit code for the
/// orchestrator: kept as is unless it collides with a reserved status, in
/// which case it becomes [`PROCESS_FAILED_CODE`].
pub fn translate_exit_code(code: i32) -> i32 {
    if RESERVED_EXIT_STATUSES.contains(&(code & 0xff)) {
        PROCESS_FAILED_CODE
    } else {
        code
    }
}

pub const DEFAULT_ARTIFACTS_DIR: &str = "/mnt/imagetest/artifacts";
pub const DEFAULT_WORK_DIR: &str = "/imagetest/work";
pub const DEFAULT_HEALTH_CHECK_SOCKET: &str = "/tmp/imagetest.health.sock";

/// Process log location, relative to the artifacts dir.
pub const PROCESS_LOG_FILE: &str = "logs/process.log";

pub const PAUSE_MODE_ENV_VAR: &str = "IMAGETEST_PAUSE_MODE";
pub const ARTIFACTS_DIR_ENV_VAR: &str = "IMAGETEST_ARTIFACTS";
pub const WORK_DIR_ENV_VAR: &str = "IMAGETEST_WORK_DIR";
pub const HEALTH_CHECK_SOCKET_ENV_VAR: &str = "IMAGETEST_HEALTH_CHECK_SOCKET";
pub const LOCAL_REGISTRY_ENV_VAR: &str = "IMAGETEST_LOCAL_REGISTRY";
pub const LOCAL_REGISTRY_HOSTNAME_ENV_VAR: &str = "IMAGETEST_LOCAL_REGISTRY_HOSTNAME";
pub const LOCAL_REGISTRY_PORT_ENV_VAR: &str = "IMAGETEST_LOCAL_REGISTRY_PORT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PauseMode {
    #[default]
    Never,
    OnError,
    Always,
}

impl PauseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseMode::Never => "never",
            PauseMode::OnError => "on-error",
            PauseMode::Always => "always",
        }
    }
}

impl fmt::Display for PauseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PauseMode {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "never" => Ok(PauseMode::Never),
            "on-error" => Ok(PauseMode::OnError),
            "always" => Ok(PauseMode::Always),
            other => Err(SupervisorError::Config(format!(
                "unknown pause mode '{other}', expected one of never, on-error, always"
            ))),
        }
    }
}

/// Local registry settings handed to us by the driver. Only recorded; the
/// wrapped process sees the same variables through its inherited environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryConfig {
    pub registry: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
}

impl RegistryConfig {
    pub fn from_values(
        registry: Option<String>,
        hostname: Option<String>,
        port: Option<String>,
    ) -> Result<Self, SupervisorError> {
        let port = match port.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(p) => Some(p.parse::<u16>().map_err(|_| {
                SupervisorError::Config(format!(
                    "{LOCAL_REGISTRY_PORT_ENV_VAR} must be a port number, got '{p}'"
                ))
            })?),
        };

        Ok(Self {
            registry: registry.filter(|s| !s.is_empty()),
            hostname: hostname.filter(|s| !s.is_empty()),
            port,
        })
    }

    pub fn from_env() -> Result<Self, SupervisorError> {
        Self::from_values(
            std::env::var(LOCAL_REGISTRY_ENV_VAR).ok(),
            std::env::var(LOCAL_REGISTRY_HOSTNAME_ENV_VAR).ok(),
            std::env::var(LOCAL_REGISTRY_PORT_ENV_VAR).ok(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_none() && self.hostname.is_none() && self.port.is_none()
    }
}

/// Everything the supervisor needs, fixed before any component starts.
#[derive(Debug, Clone)]
pub struct Config {
    pub command: Vec<String>,
    pub process_log_path: PathBuf,
    pub pause_mode: PauseMode,
    pub health_check_socket_path: PathBuf,
    pub work_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub registry: RegistryConfig,
}

impl Config {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            process_log_path: PathBuf::from(PROCESS_LOG_FILE),
            pause_mode: PauseMode::Never,
            health_check_socket_path: PathBuf::from(DEFAULT_HEALTH_CHECK_SOCKET),
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            artifacts_dir: PathBuf::from(DEFAULT_ARTIFACTS_DIR),
            registry: RegistryConfig::default(),
        }
    }

    /// Point the artifacts dir somewhere else. A process log path that is
    /// still relative is resolved against it in [`Config::validate`].
    pub fn with_artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = dir.into();
        self
    }

    pub fn with_process_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.process_log_path = path.into();
        self
    }

    pub fn with_pause_mode(mut self, mode: PauseMode) -> Self {
        self.pause_mode = mode;
        self
    }

    pub fn with_health_check_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.health_check_socket_path = path.into();
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Check required settings and resolve relative paths. Consumes the
    /// builder so the result can't be mutated afterwards.
    pub fn validate(mut self) -> Result<Self, SupervisorError> {
        match self.command.first() {
            None => return Err(SupervisorError::Config("no command to run".into())),
            Some(program) if program.trim().is_empty() => {
                return Err(SupervisorError::Config("command program is empty".into()))
            }
            _ => {}
        }

        if self.process_log_path.as_os_str().is_empty() {
            return Err(SupervisorError::Config("process log path is empty".into()));
        }
        if self.health_check_socket_path.as_os_str().is_empty() {
            return Err(SupervisorError::Config("health check socket path is empty".into()));
        }

        self.process_log_path = resolve_under(&self.artifacts_dir, &self.process_log_path);
        Ok(self)
    }
}
