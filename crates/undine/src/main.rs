//! undine: process-execution daemon.
//!
//! Speaks framed CBOR records over its own stdin/stdout with a single
//! controlling peer, runs the commands it asks for under pseudo-terminals
//! and relays their output, exit status and a heartbeat back.

mod channel;
mod config;
mod daemon;
mod heartbeat;
mod host;
mod session;

use clap::Parser;
use config::{CliOverrides, ConfigSource, DaemonConfig};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Process-execution daemon driven over stdin/stdout
#[derive(Parser, Debug)]
#[command(name = "undine", version, about = "Process-execution daemon")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.undine/config.toml")]
    config: String,

    /// Append-only log file ("-" for stderr)
    #[arg(long)]
    log_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Seconds between heartbeat pings sent to the peer
    #[arg(long)]
    ping_interval: Option<u64>,

    /// Seconds without a peer ping before raising an alarm
    #[arg(long)]
    ping_timeout: Option<u64>,

    /// Shut down when the ping timeout elapses
    #[arg(long)]
    exit_on_ping_timeout: bool,

    /// Maximum concurrently registered children
    #[arg(long)]
    max_children: Option<usize>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let overrides = CliOverrides {
        log_file: cli.log_file.clone(),
        log_level: cli.log_level.clone(),
        ping_interval: cli.ping_interval,
        ping_timeout: cli.ping_timeout,
        exit_on_ping_timeout: cli.exit_on_ping_timeout,
        max_children: cli.max_children,
    };

    let config_path = PathBuf::from(&cli.config);
    let config = match DaemonConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Logging is not up yet and stdout belongs to the peer.
            init_tracing(None, "info");
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let log_error = init_tracing(config.log_file.as_ref(), &config.log_level);
    if let Some((path, e)) = log_error {
        warn!(path = %path.display(), error = %e, "log file error, logging to stderr");
    }
    match &config.source {
        ConfigSource::File(path) => info!(path = %path.display(), "loaded config file"),
        ConfigSource::Missing(path) => {
            info!(path = %path.display(), "config file not found, using defaults")
        }
        ConfigSource::Defaults => info!("using default config"),
    }

    std::panic::set_hook(Box::new(|panic| {
        error!(panic = %panic, "panic");
    }));

    let pid = std::process::id();
    info!(pid, version = env!("CARGO_PKG_VERSION"), "start");

    let reason = daemon::run(config, tokio::io::stdin(), tokio::io::stdout()).await;

    info!(pid, reason = ?reason, "exit");
    // Blocking stdin reads would hold the runtime open on drop.
    std::process::exit(reason.exit_code());
}

/// Install the global subscriber, writing to `log_file` when it can be
/// opened and to stderr otherwise. Returns the open error, if any.
fn init_tracing(
    log_file: Option<&PathBuf>,
    level: &str,
) -> Option<(PathBuf, std::io::Error)> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file, open_error) = match log_file {
        Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => (Some(file), None),
            Err(e) => (None, Some((path.clone(), e))),
        },
        None => (None, None),
    };

    match file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
    }
    open_error
}
