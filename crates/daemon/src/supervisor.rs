//! Pipeline supervisor
//!
//! Owns at most one encoder pipeline per tier and keeps it alive: a pipeline
//! that errors or exits is marked failed and relaunched after a delay, forever.
//! The delay grows exponentially with consecutive quick failures up to a
//! configured cap, and resets once a run has stayed up long enough.
//!
//! Every launch gets a generation number. Notifications from an older
//! generation's encoder are ignored, so a late exit from a replaced process
//! can never mark its successor failed.

use crate::config::{PipelineConfig, TierId};
use crate::metrics::timestamp_ms;
use crate::process::{EncoderEvent, EncoderLauncher, EncoderProcess, ExitOutcome};
use crate::tiers::{TierCatalog, MANIFEST_FILE_NAME, SEGMENT_EXTENSION};
use crate::watcher::WatchRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("tier {0} is not configured")]
    UnknownTier(TierId),
}

/// Lifecycle state of one tier's pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Starting,
    Running,
    Failed,
    Stopped,
}

impl PipelineStatus {
    /// Starting or running; a live pipeline is never launched twice
    pub fn is_live(self) -> bool {
        matches!(self, PipelineStatus::Starting | PipelineStatus::Running)
    }
}

/// Introspection record for one pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineInfo {
    pub tier: TierId,
    pub status: PipelineStatus,
    pub pid: Option<u32>,
    pub started_at_ms: i64,
    /// Relaunches since the first start
    pub restarts: u32,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

struct Pipeline {
    generation: u64,
    info: PipelineInfo,
    started_at: Instant,
    stop: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
}

struct Inner {
    catalog: Arc<TierCatalog>,
    launcher: Arc<dyn EncoderLauncher>,
    watchers: Arc<WatchRegistry>,
    config: PipelineConfig,
    stop_grace: Duration,
    pipelines: Mutex<HashMap<TierId, Pipeline>>,
    next_generation: AtomicU64,
    shutting_down: AtomicBool,
}

/// Delay before relaunching after `failures` consecutive quick failures
///
/// `base * 2^(failures - 1)`, capped. The first failure waits exactly `base`.
pub fn restart_delay(config: &PipelineConfig, failures: u32) -> Duration {
    let base = config.restart_delay_ms;
    let shift = failures.saturating_sub(1).min(20);
    let delay = base.saturating_mul(1u64 << shift);
    Duration::from_millis(delay.min(config.restart_delay_cap_ms()))
}

/// Create the tier directory and remove output left by a previous run
pub fn prepare_output_dir(dir: &Path) -> std::io::Result<usize> {
    use walkdir::WalkDir;

    std::fs::create_dir_all(dir)?;
    let mut removed = 0;
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let name = entry.file_name().to_string_lossy();
        let stale = name.starts_with(MANIFEST_FILE_NAME)
            || entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map_or(false, |e| e.eq_ignore_ascii_case(SEGMENT_EXTENSION));
        if stale {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Keeps one encoder pipeline alive per requested tier
#[derive(Clone)]
pub struct PipelineSupervisor {
    inner: Arc<Inner>,
}

impl PipelineSupervisor {
    pub fn new(
        catalog: Arc<TierCatalog>,
        launcher: Arc<dyn EncoderLauncher>,
        watchers: Arc<WatchRegistry>,
        config: PipelineConfig,
        stop_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                launcher,
                watchers,
                config,
                stop_grace,
                pipelines: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Make sure the tier has a live pipeline and return its manifest URL
    ///
    /// Idempotent: a starting or running pipeline is left alone. Launch
    /// failures are contained here and scheduled for retry; the caller always
    /// gets the URL.
    pub async fn ensure_running(&self, tier: TierId) -> Result<String, SupervisorError> {
        let inner = &self.inner;
        let descriptor = inner
            .catalog
            .get(tier)
            .ok_or(SupervisorError::UnknownTier(tier))?;
        let url = inner.catalog.manifest_url(tier);

        if inner.shutting_down.load(Ordering::SeqCst) {
            return Ok(url);
        }

        let mut pipelines = inner.pipelines.lock().await;
        let previous = pipelines.get(&tier);
        if previous.map_or(false, |p| p.info.status.is_live()) {
            return Ok(url);
        }
        let (restarts, failures) = previous
            .map(|p| (p.info.restarts + 1, p.info.consecutive_failures))
            .unwrap_or((0, 0));

        let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let dir = inner.catalog.output_dir(tier);
        let launched = match prepare_output_dir(&dir) {
            Ok(removed) => {
                if removed > 0 {
                    debug!(%tier, removed, "cleared stale output");
                }
                inner.launcher.launch(&descriptor, &dir).map_err(|e| e.to_string())
            }
            Err(e) => Err(format!("failed to prepare {}: {}", dir.display(), e)),
        };

        let mut pipeline = Pipeline {
            generation,
            info: PipelineInfo {
                tier,
                status: PipelineStatus::Starting,
                pid: None,
                started_at_ms: timestamp_ms(),
                restarts,
                consecutive_failures: failures,
                last_error: None,
            },
            started_at: Instant::now(),
            stop: None,
            monitor: None,
        };

        match launched {
            Ok(mut process) => {
                info!(%tier, pid = ?process.pid, generation, restarts, "pipeline starting");
                pipeline.stop = process.take_stop();
                let EncoderProcess { pid, events, .. } = process;
                pipeline.info.pid = pid;
                pipeline.monitor = Some(tokio::spawn(monitor(
                    self.clone(),
                    tier,
                    generation,
                    events,
                )));
                pipelines.insert(tier, pipeline);
            }
            Err(reason) => {
                error!(%tier, error = %reason, "pipeline launch failed");
                pipeline.info.status = PipelineStatus::Failed;
                pipeline.info.last_error = Some(reason);
                pipeline.info.consecutive_failures = failures + 1;
                let delay = restart_delay(&inner.config, failures + 1);
                pipelines.insert(tier, pipeline);
                self.schedule_restart(tier, delay);
            }
        }

        Ok(url)
    }

    /// Current status of a tier's pipeline, if one was ever launched
    pub async fn status(&self, tier: TierId) -> Option<PipelineStatus> {
        self.inner
            .pipelines
            .lock()
            .await
            .get(&tier)
            .map(|p| p.info.status)
    }

    /// Every pipeline in tier order
    pub async fn pipelines(&self) -> Vec<PipelineInfo> {
        let pipelines = self.inner.pipelines.lock().await;
        let mut infos: Vec<PipelineInfo> = pipelines.values().map(|p| p.info.clone()).collect();
        infos.sort_by_key(|p| p.tier);
        infos
    }

    /// Pids of live encoders
    pub async fn encoder_pids(&self) -> Vec<(TierId, u32)> {
        let pipelines = self.inner.pipelines.lock().await;
        let mut pids: Vec<(TierId, u32)> = pipelines
            .iter()
            .filter(|(_, p)| p.info.status.is_live())
            .filter_map(|(tier, p)| p.info.pid.map(|pid| (*tier, pid)))
            .collect();
        pids.sort();
        pids
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop every encoder and wait briefly for them to exit
    ///
    /// No restarts happen afterwards. Segment files are not guaranteed flushed.
    pub async fn stop_all(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let monitors: Vec<JoinHandle<()>> = {
            let mut pipelines = self.inner.pipelines.lock().await;
            pipelines
                .values_mut()
                .filter_map(|p| {
                    if let Some(stop) = p.stop.take() {
                        let _ = stop.send(());
                    }
                    if p.info.status.is_live() {
                        p.info.status = PipelineStatus::Stopped;
                    }
                    p.monitor.take()
                })
                .collect()
        };
        info!(count = monitors.len(), "stopping pipelines");

        let grace = self.inner.stop_grace;
        if tokio::time::timeout(grace, futures::future::join_all(monitors))
            .await
            .is_err()
        {
            warn!(grace_ms = grace.as_millis() as u64, "pipelines still running after grace period");
        }
        self.inner.watchers.stop_all().await;
    }

    fn schedule_restart(&self, tier: TierId, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        info!(%tier, delay_ms = delay.as_millis() as u64, "scheduling pipeline restart");
        let supervisor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = supervisor.ensure_running(tier).await {
                error!(%tier, error = %e, "pipeline restart failed");
            }
        });
    }

    async fn on_started(&self, tier: TierId, generation: u64) {
        let dir = {
            let mut pipelines = self.inner.pipelines.lock().await;
            match pipelines.get_mut(&tier) {
                Some(p) if p.generation == generation && p.info.status == PipelineStatus::Starting => {
                    p.info.status = PipelineStatus::Running;
                    self.inner.catalog.output_dir(tier)
                }
                _ => return,
            }
        };
        info!(%tier, generation, "pipeline running");
        self.inner.watchers.register(tier, dir).await;
    }

    /// The encoder reported it cannot continue; fail the pipeline and stop it
    ///
    /// The stop trigger is fired here, so the exit that follows finds the
    /// pipeline already failed (or replaced) and does nothing.
    async fn on_error(&self, tier: TierId, generation: u64, message: String) {
        let delay = {
            let mut pipelines = self.inner.pipelines.lock().await;
            let Some(p) = pipelines.get_mut(&tier).filter(|p| p.generation == generation) else {
                return;
            };
            if !p.info.status.is_live() || self.is_shutting_down() {
                return;
            }
            warn!(%tier, generation, error = %message, "encoder error");
            if let Some(stop) = p.stop.take() {
                let _ = stop.send(());
            }
            p.info.last_error = Some(message);
            self.mark_failed(p)
        };
        self.schedule_restart(tier, delay);
    }

    /// The encoder is gone; schedule a relaunch unless it was stopped or already failed
    async fn on_exit(&self, tier: TierId, generation: u64, outcome: Option<ExitOutcome>) {
        let delay = {
            let mut pipelines = self.inner.pipelines.lock().await;
            let Some(p) = pipelines.get_mut(&tier).filter(|p| p.generation == generation) else {
                return;
            };
            p.stop = None;
            if !p.info.status.is_live() || self.is_shutting_down() {
                debug!(%tier, generation, status = ?p.info.status, "encoder exited");
                return;
            }

            if p.info.last_error.is_none() {
                p.info.last_error = Some(match outcome {
                    Some(o) => o.to_string(),
                    None => "encoder notifications ended".to_string(),
                });
            }
            warn!(%tier, generation, outcome = ?outcome, "encoder exited unexpectedly");
            self.mark_failed(p)
        };
        self.schedule_restart(tier, delay);
    }

    /// Move a live pipeline to failed and return the delay before its relaunch
    fn mark_failed(&self, p: &mut Pipeline) -> Duration {
        let ran_for = p.started_at.elapsed();
        let stable = ran_for >= Duration::from_millis(self.inner.config.stable_after_ms);
        p.info.consecutive_failures = if stable { 1 } else { p.info.consecutive_failures + 1 };
        p.info.status = PipelineStatus::Failed;
        p.info.pid = None;
        warn!(
            tier = %p.info.tier,
            generation = p.generation,
            ran_ms = ran_for.as_millis() as u64,
            failures = p.info.consecutive_failures,
            "pipeline failed"
        );
        restart_delay(&self.inner.config, p.info.consecutive_failures)
    }
}

async fn monitor(
    supervisor: PipelineSupervisor,
    tier: TierId,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<EncoderEvent>,
) {
    let mut outcome = None;
    while let Some(event) = events.recv().await {
        match event {
            EncoderEvent::Started => supervisor.on_started(tier, generation).await,
            EncoderEvent::Progress(line) => {
                if line.to_ascii_lowercase().contains("error") {
                    warn!(%tier, "encoder: {}", line);
                } else {
                    trace!(%tier, "encoder: {}", line);
                }
            }
            EncoderEvent::Error(message) => supervisor.on_error(tier, generation, message).await,
            EncoderEvent::Exited(o) => {
                outcome = Some(o);
                break;
            }
        }
    }
    supervisor.on_exit(tier, generation, outcome).await;
}
