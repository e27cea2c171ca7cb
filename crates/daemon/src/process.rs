//! Encoder process control
//!
//! The supervisor never touches OS processes directly. It asks an
//! [`EncoderLauncher`] for an [`EncoderProcess`], which reports lifecycle
//! notifications over a channel and can be told to stop. The production
//! launcher runs ffmpeg through tokio; tests substitute a scripted one.

use crate::config::EncoderConfig;
use crate::encode::{build_ffmpeg_command, FfmpegHlsParams};
use crate::tiers::Tier;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Error type for launching encoders
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoder process could not be spawned
    #[error("Failed to spawn encoder: {0}")]
    Spawn(std::io::Error),

    /// IO error preparing the launch
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How an encoder process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited with a status code
    Code(i32),
    /// Terminated by a signal
    Signaled,
}

impl ExitOutcome {
    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => ExitOutcome::Code(code),
            None => ExitOutcome::Signaled,
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Code(code) => write!(f, "exit code {}", code),
            ExitOutcome::Signaled => write!(f, "terminated by signal"),
        }
    }
}

/// Asynchronous notifications from a running encoder
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderEvent {
    /// The process is up
    Started,
    /// One line of encoder diagnostics
    Progress(String),
    /// The process could not be supervised any further
    Error(String),
    /// The process is gone; always the last event
    Exited(ExitOutcome),
}

/// Handle on a launched encoder
pub struct EncoderProcess {
    pub pid: Option<u32>,
    pub events: mpsc::UnboundedReceiver<EncoderEvent>,
    stop: Option<oneshot::Sender<()>>,
}

impl EncoderProcess {
    pub fn new(
        pid: Option<u32>,
        events: mpsc::UnboundedReceiver<EncoderEvent>,
        stop: oneshot::Sender<()>,
    ) -> Self {
        Self {
            pid,
            events,
            stop: Some(stop),
        }
    }

    /// Take the stop trigger; sending on it (or dropping it) ends the process
    pub fn take_stop(&mut self) -> Option<oneshot::Sender<()>> {
        self.stop.take()
    }
}

/// Starts encoder processes for tiers
pub trait EncoderLauncher: Send + Sync {
    fn launch(&self, tier: &Tier, output_dir: &Path) -> Result<EncoderProcess, EncodeError>;
}

/// Launches ffmpeg as a child process
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    encoder: EncoderConfig,
}

impl FfmpegLauncher {
    pub fn new(encoder: EncoderConfig) -> Self {
        Self { encoder }
    }

    fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.encoder.kill_timeout_ms)
    }
}

impl EncoderLauncher for FfmpegLauncher {
    fn launch(&self, tier: &Tier, output_dir: &Path) -> Result<EncoderProcess, EncodeError> {
        let params = FfmpegHlsParams::new(&self.encoder, tier, output_dir);
        let mut cmd = TokioCommand::from(build_ffmpeg_command(&params));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        debug!(tier = %tier.id, command = ?cmd.as_std(), "launching encoder");
        let mut child = cmd.spawn().map_err(EncodeError::Spawn)?;
        let pid = child.id();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        if let Some(stderr) = child.stderr.take() {
            let tx = event_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(EncoderEvent::Progress(line)).is_err() {
                        break;
                    }
                }
            });
        }

        let tier_id = tier.id;
        let kill_timeout = self.kill_timeout();
        tokio::spawn(async move {
            let _ = event_tx.send(EncoderEvent::Started);
            // None means a stop was requested (or the handle dropped)
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = stop_rx => None,
            };
            let final_event = match exited {
                Some(Ok(status)) => EncoderEvent::Exited(ExitOutcome::from_status(status)),
                Some(Err(e)) => {
                    let _ = event_tx.send(EncoderEvent::Error(e.to_string()));
                    let _ = child.start_kill();
                    EncoderEvent::Exited(ExitOutcome::Signaled)
                }
                None => {
                    trace!(tier = %tier_id, "stopping encoder");
                    EncoderEvent::Exited(terminate(&mut child, kill_timeout).await)
                }
            };
            let _ = event_tx.send(final_event);
        });

        Ok(EncoderProcess::new(pid, event_rx, stop_tx))
    }
}

/// Ask the child to exit, then kill it if it is still around after `grace`
async fn terminate(child: &mut Child, grace: Duration) -> ExitOutcome {
    send_terminate(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => ExitOutcome::from_status(status),
        Ok(Err(e)) => {
            warn!(error = %e, "failed waiting for encoder exit");
            ExitOutcome::Signaled
        }
        Err(_) => {
            warn!(pid = ?child.id(), "encoder ignored termination signal, killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill encoder");
            }
            ExitOutcome::Signaled
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) with a pid we spawned and still own; no memory is touched
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            warn!(pid, "SIGTERM failed: {}", std::io::Error::last_os_error());
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}
