//! Metrics aggregator
//!
//! Builds the per-tier snapshot observers receive. A tick refreshes latency for
//! tiers with a live pipeline (keeping the previous value when the manifest is
//! unreadable), recomputes throughput from the segment delta since the prior
//! tick, and samples process resources. Missing values come out as zero or
//! absent; a tick never fails.

use crate::config::TierId;
use crate::manifest::LatencyEstimator;
use crate::metrics::{timestamp_ms, MetricsSnapshot, ProcessSampler, SharedStats, TierSnapshot};
use crate::supervisor::{PipelineStatus, PipelineSupervisor};
use crate::tiers::TierCatalog;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

pub struct MetricsAggregator {
    catalog: Arc<TierCatalog>,
    stats: SharedStats,
    supervisor: PipelineSupervisor,
    estimator: LatencyEstimator,
    sampler: Mutex<ProcessSampler>,
    latest: RwLock<Option<MetricsSnapshot>>,
}

impl MetricsAggregator {
    pub fn new(
        catalog: Arc<TierCatalog>,
        stats: SharedStats,
        supervisor: PipelineSupervisor,
        estimator: LatencyEstimator,
    ) -> Self {
        Self {
            catalog,
            stats,
            supervisor,
            estimator,
            sampler: Mutex::new(ProcessSampler::new()),
            latest: RwLock::new(None),
        }
    }

    /// Run one periodic tick and keep its snapshot as the latest
    pub async fn tick(&self) -> MetricsSnapshot {
        let snapshot = self.collect(true).await;
        *self.latest.write().await = Some(snapshot.clone());
        snapshot
    }

    pub async fn latest(&self) -> Option<MetricsSnapshot> {
        self.latest.read().await.clone()
    }

    /// The latest tick's snapshot, or one computed now if no tick has run
    ///
    /// Counters, latency and boundaries are re-read from the live stats, so a
    /// boundary change or a segment arrival since the tick is visible at once.
    pub async fn current(&self) -> MetricsSnapshot {
        let Some(mut snapshot) = self.latest().await else {
            return self.collect(false).await;
        };
        let stats = self.stats.read().await;
        let viewers = stats.viewer_count();
        for (id, tier) in snapshot.per_stream.iter_mut() {
            if let Some(tier_stats) = stats.tier(*id) {
                tier.refresh_counters(tier_stats, viewers);
            }
        }
        snapshot
    }

    /// Gather a snapshot; `advance` also moves the throughput window forward
    async fn collect(&self, advance: bool) -> MetricsSnapshot {
        let mut statuses: BTreeMap<TierId, Option<PipelineStatus>> = BTreeMap::new();
        for id in self.catalog.ids() {
            statuses.insert(id, self.supervisor.status(id).await);
        }
        let encoder_pids = self.supervisor.encoder_pids().await;

        // Manifest reads happen before taking the stats lock
        let live: Vec<TierId> = statuses
            .iter()
            .filter(|(_, status)| status.map_or(false, PipelineStatus::is_live))
            .map(|(id, _)| *id)
            .collect();
        let estimates = self.estimator.estimate_many(live).await;

        let (process, encoders) = {
            let pids: Vec<u32> = encoder_pids.iter().map(|(_, pid)| *pid).collect();
            self.sampler.lock().await.sample(&pids)
        };

        let now = Instant::now();
        let mut stats = self.stats.write().await;
        for (id, estimate) in estimates {
            if let Some(tier) = stats.tier_mut(id) {
                tier.record_latency(estimate);
            }
        }
        if advance {
            for (_, tier) in stats.iter_mut() {
                tier.refresh_throughput(now);
            }
        }

        let viewers = stats.viewer_count();
        let uptime = stats.uptime_secs();
        let per_stream = self
            .catalog
            .iter()
            .filter_map(|tier| {
                let tier_stats = stats.tier(tier.id)?;
                let encoder = encoder_pids
                    .iter()
                    .find(|(id, _)| *id == tier.id)
                    .and_then(|(_, pid)| encoders.get(pid).copied());
                Some((
                    tier.id,
                    TierSnapshot::from_stats(
                        tier.id,
                        &tier.label,
                        tier_stats,
                        statuses.get(&tier.id).copied().flatten(),
                        viewers,
                        &process,
                        uptime,
                        encoder,
                    ),
                ))
            })
            .collect();

        MetricsSnapshot {
            timestamp: timestamp_ms(),
            per_stream,
        }
    }
}
