//! CLI entry point for tierstream
//!
//! Parses command line arguments, installs logging and runs the daemon until
//! Ctrl-C or SIGTERM.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tierstream::config::ConfigError;
use tierstream::{Config, Daemon, DaemonError};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// tierstream - live multi-tier HLS orchestrator with latency and metrics push
#[derive(Parser, Debug)]
#[command(name = "tierstream")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Fall back to built-in defaults when the config file does not exist
    #[arg(long, default_value = "false")]
    allow_missing_config: bool,

    /// Skip startup checks (ffmpeg, source file). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Log level for tierstream targets; RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<Config, ConfigError> {
    if args.allow_missing_config && !args.config.exists() {
        warn!(path = %args.config.display(), "config file not found, using defaults");
        return Config::from_env();
    }
    Config::load(&args.config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_filter = if args.log_level == "trace" {
        format!("tierstream={},tower_http=trace", args.log_level)
    } else {
        format!("tierstream={}", args.log_level)
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("tierstream v{} starting", env!("CARGO_PKG_VERSION"));

    let daemon_result = load_config(&args)
        .map_err(DaemonError::from)
        .and_then(|config| {
            info!(
                config = %args.config.display(),
                bind = %config.server.bind_addr,
                tiers = config.tiers.len(),
                "configuration loaded"
            );
            Daemon::with_config(config, args.skip_checks)
        });

    match daemon_result {
        Ok(daemon) => {
            if let Err(e) = daemon.run_with_server().await {
                error!(error = %e, "daemon error");
                return ExitCode::FAILURE;
            }
            info!("tierstream stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            ExitCode::FAILURE
        }
    }
}
