use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;
use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};
use entrypoint::config::{
    Config, PauseMode, RegistryConfig, ARTIFACTS_DIR_ENV_VAR, DEFAULT_ARTIFACTS_DIR,
    DEFAULT_HEALTH_CHECK_SOCKET, DEFAULT_WORK_DIR, HEALTH_CHECK_SOCKET_ENV_VAR,
    INTERNAL_ERROR_CODE, PAUSE_MODE_ENV_VAR, WORK_DIR_ENV_VAR,
};
use entrypoint::error::SupervisorError;
use entrypoint::{health, signals, Supervisor};

// Usage: entrypoint [--process-log-path PATH] <command> <arg1> <arg2> ...
//        entrypoint healthcheck
#[derive(Parser)]
#[command(name = "entrypoint", version, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    cmd: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe a running entrypoint's health check socket
    Healthcheck {
        #[arg(long, env = HEALTH_CHECK_SOCKET_ENV_VAR, default_value = DEFAULT_HEALTH_CHECK_SOCKET)]
        socket: PathBuf,
        /// Seconds to wait for an answer
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Where the wrapped process's stdout and stderr go. Relative paths
    /// resolve against the artifacts dir
    #[arg(long, value_name = "PATH")]
    process_log_path: Option<PathBuf>,

    /// never, on-error or always
    #[arg(long, env = PAUSE_MODE_ENV_VAR, default_value = "never")]
    pause_mode: String,

    #[arg(long, env = ARTIFACTS_DIR_ENV_VAR, default_value = DEFAULT_ARTIFACTS_DIR)]
    artifacts_dir: PathBuf,

    #[arg(long, env = WORK_DIR_ENV_VAR, default_value = DEFAULT_WORK_DIR)]
    work_dir: PathBuf,

    #[arg(long, env = HEALTH_CHECK_SOCKET_ENV_VAR, default_value = DEFAULT_HEALTH_CHECK_SOCKET)]
    health_check_socket: PathBuf,

    /// The wrapped command and its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl RunArgs {
    fn into_config(self) -> Result<Config, SupervisorError> {
        let pause_mode: PauseMode = self.pause_mode.parse()?;
        let registry = RegistryConfig::from_env()?;

        let mut config = Config::new(self.command)
            .with_pause_mode(pause_mode)
            .with_artifacts_dir(self.artifacts_dir)
            .with_work_dir(self.work_dir)
            .with_health_check_socket(self.health_check_socket)
            .with_registry(registry);
        if let Some(path) = self.process_log_path {
            config = config.with_process_log_path(path);
        }

        Ok(config)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .try_init();
}

async fn supervise(args: RunArgs) -> i32 {
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return INTERNAL_ERROR_CODE;
        }
    };

    let signals = match signals::listen() {
        Ok(rx) => rx,
        Err(e) => {
            error!("{}", SupervisorError::Signals(e));
            return INTERNAL_ERROR_CODE;
        }
    };

    Supervisor::new(config).run(signals).await
}

async fn healthcheck(socket: PathBuf, timeout: u64) -> i32 {
    match health::probe(&socket, Duration::from_secs(timeout)).await {
        Ok(resp) if resp.is_healthy() => {
            println!("{} ({})", resp.status, resp.phase);
            0
        }
        Ok(resp) => {
            eprintln!("unhealthy: {} ({})", resp.status, resp.phase);
            1
        }
        Err(e) => {
            eprintln!("unhealthy: {:#}", e);
            1
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            // A bad command line is a configuration error like any other.
            let _ = e.print();
            std::process::exit(INTERNAL_ERROR_CODE);
        }
    };

    let code = match cli.cmd {
        Some(Commands::Healthcheck { socket, timeout }) => healthcheck(socket, timeout).await,
        None => supervise(cli.run).await,
    };

    std::process::exit(code);
}
