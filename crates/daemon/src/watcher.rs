//! Segment watcher
//!
//! Detects new segment files in each active tier's output directory and turns
//! every arrival into a counter update plus an immediate latency push to
//! observers, ahead of the periodic snapshot.
//!
//! Detection polls the directory and dedupes by file name, so a file is
//! reported at most once per watcher. Names that disappear (pruned by the
//! encoder's rolling window) are forgotten. Latency is recomputed from the
//! manifest on every arrival rather than tracked incrementally, so reordered or
//! batched arrivals cannot skew it.

use crate::config::TierId;
use crate::hub::{BroadcastHub, ServerMessage};
use crate::manifest::LatencyEstimator;
use crate::metrics::{timestamp_ms, SharedStats};
use crate::tiers::SEGMENT_EXTENSION;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// A segment file observed for the first time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEvent {
    pub tier: TierId,
    pub file_name: String,
    pub observed_at_ms: i64,
}

/// Reports files with a given extension that were not present on the previous poll
#[derive(Debug)]
pub struct DirectoryPoller {
    dir: PathBuf,
    extension: &'static str,
    seen: HashSet<String>,
}

impl DirectoryPoller {
    pub fn new(dir: PathBuf, extension: &'static str) -> Self {
        Self {
            dir,
            extension,
            seen: HashSet::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// New file names since the last poll, in name order
    ///
    /// A missing directory reads as empty; the encoder may not have created it yet.
    pub fn poll(&mut self) -> Vec<String> {
        use walkdir::WalkDir;

        let current: HashSet<String> = WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.path()
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map_or(false, |ext| ext.eq_ignore_ascii_case(self.extension))
            })
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .collect();

        let mut fresh: Vec<String> = current.difference(&self.seen).cloned().collect();
        fresh.sort();
        self.seen = current;
        fresh
    }
}

/// Applies segment arrivals to tier stats and pushes latency events
pub struct SegmentWatcher {
    stats: SharedStats,
    estimator: LatencyEstimator,
    hub: Arc<BroadcastHub>,
}

impl SegmentWatcher {
    pub fn new(stats: SharedStats, estimator: LatencyEstimator, hub: Arc<BroadcastHub>) -> Self {
        Self {
            stats,
            estimator,
            hub,
        }
    }

    /// Count the segment, refresh latency and push it to observers when known
    pub async fn handle(&self, event: SegmentEvent) {
        let estimate = self.estimator.estimate_blocking(event.tier).await;

        let boundary_ms = {
            let mut stats = self.stats.write().await;
            let Some(tier) = stats.tier_mut(event.tier) else {
                return;
            };
            tier.record_segment(event.observed_at_ms);
            tier.record_latency(estimate);
            tier.latency_boundary_ms
        };

        debug!(
            tier = %event.tier,
            segment = %event.file_name,
            latency_ms = ?estimate.map(|e| e.latency_ms),
            "segment arrived"
        );

        if let Some(estimate) = estimate {
            let message = ServerMessage::Latency {
                latency: estimate.latency_ms,
                boundary: boundary_ms,
                quality: event.tier,
                timestamp: timestamp_ms(),
            };
            self.hub.broadcast(&message).await;
        }
    }
}

/// One polling task per watched tier directory
pub struct WatchRegistry {
    watcher: Arc<SegmentWatcher>,
    poll_interval: Duration,
    tasks: Mutex<HashMap<TierId, (PathBuf, JoinHandle<()>)>>,
}

impl WatchRegistry {
    pub fn new(watcher: Arc<SegmentWatcher>, poll_interval: Duration) -> Self {
        Self {
            watcher,
            poll_interval,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching a tier's directory, replacing any previous watch for the tier
    ///
    /// Called on every pipeline start. The fresh watcher has no memory of the
    /// previous run, whose files were cleared before relaunch, so a restarted
    /// encoder reusing sequence numbers is still counted.
    pub async fn register(&self, tier: TierId, dir: PathBuf) {
        let watcher = self.watcher.clone();
        let period = self.poll_interval;
        let poll_dir = dir.clone();
        let handle = tokio::spawn(async move {
            let mut poller = DirectoryPoller::new(poll_dir, SEGMENT_EXTENSION);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // The poller travels to the blocking pool and back each tick
                let polled = tokio::task::spawn_blocking(move || {
                    let found = poller.poll();
                    (poller, found)
                })
                .await;
                let found = match polled {
                    Ok((returned, found)) => {
                        poller = returned;
                        found
                    }
                    Err(e) => {
                        warn!(%tier, error = %e, "directory poll task failed");
                        break;
                    }
                };
                for file_name in found {
                    watcher
                        .handle(SegmentEvent {
                            tier,
                            file_name,
                            observed_at_ms: timestamp_ms(),
                        })
                        .await;
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        if let Some((_, old)) = tasks.insert(tier, (dir.clone(), handle)) {
            old.abort();
        }
        info!(%tier, dir = %dir.display(), "watching segment directory");
    }

    pub async fn is_watching(&self, tier: TierId) -> bool {
        self.tasks
            .lock()
            .await
            .get(&tier)
            .map_or(false, |(_, h)| !h.is_finished())
    }

    /// Abort every polling task
    pub async fn stop_all(&self) {
        let mut tasks = self.tasks.lock().await;
        for (_, (_, handle)) in tasks.drain() {
            handle.abort();
        }
    }
}

impl Drop for WatchRegistry {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for (_, (_, handle)) in tasks.drain() {
                handle.abort();
            }
        }
    }
}
