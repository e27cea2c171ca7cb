//! Stream orchestrator
//!
//! Composes the tier catalog, pipeline supervisor, segment watchers, metrics
//! aggregator and broadcast hub, and exposes the operations request handlers
//! call into. Only malformed caller input produces an error; encoder trouble is
//! contained by the supervisor and shows up as stale or absent values.

use crate::aggregator::MetricsAggregator;
use crate::config::{Config, TierId};
use crate::hub::{BroadcastHub, ServerMessage};
use crate::manifest::LatencyEstimator;
use crate::metrics::{new_shared_stats, timestamp_ms, MetricsSnapshot, SharedStats};
use crate::process::EncoderLauncher;
use crate::supervisor::{PipelineInfo, PipelineSupervisor, SupervisorError};
use crate::tiers::TierCatalog;
use crate::watcher::{SegmentWatcher, WatchRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Caller-facing errors
#[derive(Debug, Error, PartialEq)]
pub enum OrchestratorError {
    #[error("Invalid quality tier: {0}")]
    InvalidTier(String),

    #[error("Invalid latency boundary: {0} (must be a positive number of milliseconds)")]
    InvalidBoundary(f64),
}

/// Answer to a tier request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierRequest {
    pub tier_id: TierId,
    pub manifest_url: String,
}

/// Boundary that was applied, and to which tier (`None` means every tier)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundaryUpdate {
    pub boundary_ms: u64,
    pub tier_id: Option<TierId>,
}

/// Pipeline introspection plus global counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub pipelines: Vec<PipelineInfo>,
    pub viewer_count: u64,
    pub uptime_seconds: u64,
    pub timestamp: i64,
}

pub struct StreamOrchestrator {
    catalog: Arc<TierCatalog>,
    stats: SharedStats,
    hub: Arc<BroadcastHub>,
    watchers: Arc<WatchRegistry>,
    supervisor: PipelineSupervisor,
    aggregator: Arc<MetricsAggregator>,
    tick_period: Duration,
    observer_buffer: usize,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamOrchestrator {
    pub fn new(config: &Config, launcher: Arc<dyn EncoderLauncher>) -> Self {
        let catalog = Arc::new(TierCatalog::from_config(config));
        let stats = new_shared_stats(catalog.ids(), config.metrics.default_latency_boundary_ms);
        let hub = Arc::new(BroadcastHub::new(stats.clone()));
        let estimator = LatencyEstimator::new(catalog.clone());

        let watcher = Arc::new(SegmentWatcher::new(
            stats.clone(),
            estimator.clone(),
            hub.clone(),
        ));
        let watchers = Arc::new(WatchRegistry::new(
            watcher,
            Duration::from_millis(config.metrics.watch_poll_ms),
        ));

        // Encoders get their own kill timeout, plus slack for the exit to be observed
        let stop_grace = Duration::from_millis(config.encoder.kill_timeout_ms) + Duration::from_secs(1);
        let supervisor = PipelineSupervisor::new(
            catalog.clone(),
            launcher,
            watchers.clone(),
            config.pipeline.clone(),
            stop_grace,
        );
        let aggregator = Arc::new(MetricsAggregator::new(
            catalog.clone(),
            stats.clone(),
            supervisor.clone(),
            estimator,
        ));

        Self {
            catalog,
            stats,
            hub,
            watchers,
            supervisor,
            aggregator,
            tick_period: Duration::from_millis(config.metrics.tick_ms),
            observer_buffer: config.metrics.observer_buffer,
            ticker: Mutex::new(None),
        }
    }

    pub fn catalog(&self) -> &Arc<TierCatalog> {
        &self.catalog
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn supervisor(&self) -> &PipelineSupervisor {
        &self.supervisor
    }

    /// Outbound queue length for each new observer
    pub fn observer_buffer(&self) -> usize {
        self.observer_buffer
    }

    /// Ensure the tier's pipeline is running and return where to play it
    pub async fn request_tier(&self, raw: &str) -> Result<TierRequest, OrchestratorError> {
        let tier = self
            .catalog
            .resolve(raw)
            .ok_or_else(|| OrchestratorError::InvalidTier(raw.to_string()))?;

        let manifest_url = self
            .supervisor
            .ensure_running(tier.id)
            .await
            .map_err(|e| match e {
                SupervisorError::UnknownTier(id) => OrchestratorError::InvalidTier(id.to_string()),
            })?;

        debug!(tier = %tier.id, %manifest_url, "tier requested");
        Ok(TierRequest {
            tier_id: tier.id,
            manifest_url,
        })
    }

    /// Latest snapshot, computed on the spot before the first tick
    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        self.aggregator.current().await
    }

    /// Change the latency alert threshold for one tier, or every tier
    ///
    /// The value is in milliseconds and rounded to a whole millisecond.
    pub async fn set_latency_boundary(
        &self,
        value_ms: f64,
        tier: Option<&str>,
    ) -> Result<BoundaryUpdate, OrchestratorError> {
        if !value_ms.is_finite() || value_ms <= 0.0 {
            return Err(OrchestratorError::InvalidBoundary(value_ms));
        }
        let tier_id = match tier {
            Some(raw) => Some(
                self.catalog
                    .resolve(raw)
                    .ok_or_else(|| OrchestratorError::InvalidTier(raw.to_string()))?
                    .id,
            ),
            None => None,
        };

        let boundary_ms = value_ms.round().max(1.0) as u64;
        self.stats.write().await.set_boundary(tier_id, boundary_ms);
        info!(
            boundary_ms,
            tier = tier_id.map_or("all", |t| t.as_str()),
            "latency boundary updated"
        );
        Ok(BoundaryUpdate {
            boundary_ms,
            tier_id,
        })
    }

    pub async fn pipelines(&self) -> Vec<PipelineInfo> {
        self.supervisor.pipelines().await
    }

    pub async fn performance_report(&self) -> PerformanceReport {
        let pipelines = self.supervisor.pipelines().await;
        let stats = self.stats.read().await;
        PerformanceReport {
            pipelines,
            viewer_count: stats.viewer_count(),
            uptime_seconds: stats.uptime_secs(),
            timestamp: timestamp_ms(),
        }
    }

    /// Run one metrics tick and push the snapshot to every observer
    pub async fn tick(&self) -> usize {
        broadcast_tick(&self.aggregator, &self.hub).await
    }

    /// Warm every tier's pipeline and start the periodic metrics tick
    pub async fn start(&self) {
        let ids: Vec<TierId> = self.catalog.ids().collect();
        for id in ids {
            if let Err(e) = self.request_tier(id.as_str()).await {
                warn!(tier = %id, error = %e, "failed to start tier");
            }
        }

        let aggregator = self.aggregator.clone();
        let hub = self.hub.clone();
        let period = self.tick_period;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                broadcast_tick(&aggregator, &hub).await;
            }
        });
        if let Some(old) = self.ticker.lock().await.replace(handle) {
            old.abort();
        }
        info!(
            tiers = self.catalog.len(),
            tick_ms = period.as_millis() as u64,
            "orchestrator started"
        );
    }

    /// Stop ticking, stop every pipeline and every watcher
    pub async fn shutdown(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
        self.supervisor.stop_all().await;
        self.watchers.stop_all().await;
        info!("orchestrator stopped");
    }
}

async fn broadcast_tick(aggregator: &MetricsAggregator, hub: &BroadcastHub) -> usize {
    let snapshot = aggregator.tick().await;
    hub.broadcast(&ServerMessage::Performance {
        per_stream: snapshot.per_stream,
        timestamp: snapshot.timestamp,
    })
    .await
}
