//! Daemon startup and main loop for tierstream
//!
//! Provides the daemon entry point: startup checks, orchestrator construction,
//! HTTP serving, and controlled shutdown on Ctrl-C or SIGTERM.

use crate::config::{Config, ConfigError};
use crate::orchestrator::StreamOrchestrator;
use crate::process::{EncoderLauncher, FfmpegLauncher};
use crate::server::{run_server, ServerError};
use crate::startup::{run_startup_checks, StartupError};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// HTTP server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Pipelines, watchers, metrics and observers
    pub orchestrator: Arc<StreamOrchestrator>,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// Loads the file, applies environment overrides, validates, then runs the
    /// startup checks unless `skip_checks` is set.
    pub fn new<P: AsRef<Path>>(config_path: P, skip_checks: bool) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config, skip_checks)
    }

    /// Initialize the daemon with an existing configuration
    pub fn with_config(config: Config, skip_checks: bool) -> Result<Self, DaemonError> {
        config.validate()?;
        if skip_checks {
            warn!("startup checks skipped");
        } else {
            run_startup_checks(&config)?;
        }
        let launcher = Arc::new(FfmpegLauncher::new(config.encoder.clone()));
        Ok(Self::with_launcher(config, launcher))
    }

    /// Initialize the daemon around a custom encoder launcher, without checks
    pub fn with_launcher(config: Config, launcher: Arc<dyn EncoderLauncher>) -> Self {
        let orchestrator = Arc::new(StreamOrchestrator::new(&config, launcher));
        Self {
            config,
            orchestrator,
        }
    }

    /// Start every pipeline, then serve HTTP until a shutdown signal arrives
    ///
    /// Pipelines are stopped before returning, also when the server fails.
    pub async fn run_with_server(&self) -> Result<(), DaemonError> {
        self.orchestrator.start().await;

        let result = run_server(
            self.orchestrator.clone(),
            &self.config.server.bind_addr,
            self.config.server.serve_segments,
            shutdown_signal(),
        )
        .await;

        info!("shutting down");
        self.orchestrator.shutdown().await;
        result.map_err(DaemonError::from)
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
