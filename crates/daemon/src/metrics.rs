//! Metrics module for tierstream
//!
//! Per-tier operational counters, process resource sampling, and the immutable
//! snapshots handed to observers, with JSON serialization support.

use crate::config::TierId;
use crate::manifest::LatencyEstimate;
use crate::supervisor::PipelineStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn timestamp_ms() -> i64 {
    system_time_ms(SystemTime::now())
}

pub fn system_time_ms(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Segments per second over a window; zero for an empty or negative window
pub fn throughput(segment_delta: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs > 0.0 && elapsed_secs.is_finite() {
        segment_delta as f64 / elapsed_secs
    } else {
        0.0
    }
}

/// Mutable aggregate for one tier
#[derive(Debug, Clone, PartialEq)]
pub struct TierStats {
    pub segment_count: u64,
    pub latency: Option<LatencyEstimate>,
    pub latency_boundary_ms: u64,
    pub last_segment_at_ms: Option<i64>,
    pub segments_per_second: f64,
    prev_segment_count: u64,
    prev_tick: Option<Instant>,
}

impl TierStats {
    pub fn new(latency_boundary_ms: u64) -> Self {
        Self {
            segment_count: 0,
            latency: None,
            latency_boundary_ms,
            last_segment_at_ms: None,
            segments_per_second: 0.0,
            prev_segment_count: 0,
            prev_tick: None,
        }
    }

    /// Count a newly observed segment; timestamps never move backwards
    pub fn record_segment(&mut self, at_ms: i64) {
        self.segment_count += 1;
        self.last_segment_at_ms = Some(self.last_segment_at_ms.map_or(at_ms, |t| t.max(at_ms)));
    }

    /// Store a fresh estimate; an absent read keeps the previous value
    pub fn record_latency(&mut self, estimate: Option<LatencyEstimate>) {
        if estimate.is_some() {
            self.latency = estimate;
        }
    }

    /// Recompute throughput from the segment delta since the previous tick
    pub fn refresh_throughput(&mut self, now: Instant) {
        if let Some(prev) = self.prev_tick {
            let delta = self.segment_count.saturating_sub(self.prev_segment_count);
            let elapsed = now.saturating_duration_since(prev).as_secs_f64();
            if elapsed > 0.0 {
                self.segments_per_second = throughput(delta, elapsed);
            }
        }
        self.prev_segment_count = self.segment_count;
        self.prev_tick = Some(now);
    }
}

/// Every tier's stats plus the global viewer count
#[derive(Debug, Clone)]
pub struct StatsTable {
    tiers: BTreeMap<TierId, TierStats>,
    viewer_count: u64,
    started_at: Instant,
}

impl StatsTable {
    pub fn new(tiers: impl IntoIterator<Item = TierId>, latency_boundary_ms: u64) -> Self {
        Self {
            tiers: tiers
                .into_iter()
                .map(|id| (id, TierStats::new(latency_boundary_ms)))
                .collect(),
            viewer_count: 0,
            started_at: Instant::now(),
        }
    }

    pub fn tier(&self, id: TierId) -> Option<&TierStats> {
        self.tiers.get(&id)
    }

    pub fn tier_mut(&mut self, id: TierId) -> Option<&mut TierStats> {
        self.tiers.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TierId, &TierStats)> {
        self.tiers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&TierId, &mut TierStats)> {
        self.tiers.iter_mut()
    }

    pub fn viewer_count(&self) -> u64 {
        self.viewer_count
    }

    pub fn viewer_connected(&mut self) -> u64 {
        self.viewer_count += 1;
        self.viewer_count
    }

    pub fn viewer_disconnected(&mut self) -> u64 {
        self.viewer_count = self.viewer_count.saturating_sub(1);
        self.viewer_count
    }

    /// Set the boundary for one tier, or every tier when `tier` is `None`
    pub fn set_boundary(&mut self, tier: Option<TierId>, boundary_ms: u64) {
        for (id, stats) in self.tiers.iter_mut() {
            if tier.map_or(true, |t| t == *id) {
                stats.latency_boundary_ms = boundary_ms;
            }
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Shared stats state for concurrent access across service components
pub type SharedStats = Arc<RwLock<StatsTable>>;

pub fn new_shared_stats(tiers: impl IntoIterator<Item = TierId>, latency_boundary_ms: u64) -> SharedStats {
    Arc::new(RwLock::new(StatsTable::new(tiers, latency_boundary_ms)))
}

/// Memory held by a process, in bytes
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub rss: u64,
    #[serde(rename = "virtual")]
    pub virtual_bytes: u64,
}

/// Resource usage of one process
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessUsage {
    pub memory: MemoryUsage,
    pub cpu_usage_percent: f32,
    /// Accumulated run time of the process in seconds
    pub cpu_time_secs: u64,
}

/// Samples this process and the encoder subprocesses with sysinfo
///
/// Holds one `System` across calls so CPU usage is measured between ticks.
pub struct ProcessSampler {
    sys: sysinfo::System,
    own_pid: Option<sysinfo::Pid>,
}

impl ProcessSampler {
    pub fn new() -> Self {
        Self {
            sys: sysinfo::System::new(),
            own_pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Refresh and read this process plus the given encoder pids
    pub fn sample(&mut self, encoder_pids: &[u32]) -> (ProcessUsage, BTreeMap<u32, ProcessUsage>) {
        use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate};

        let mut pids: Vec<Pid> = encoder_pids.iter().map(|p| Pid::from_u32(*p)).collect();
        if let Some(own) = self.own_pid {
            pids.push(own);
        }
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&pids),
            ProcessRefreshKind::new().with_memory().with_cpu(),
        );

        let own = self
            .own_pid
            .and_then(|pid| self.usage_of(pid))
            .unwrap_or_default();
        let encoders = encoder_pids
            .iter()
            .filter_map(|p| self.usage_of(Pid::from_u32(*p)).map(|u| (*p, u)))
            .collect();
        (own, encoders)
    }

    fn usage_of(&self, pid: sysinfo::Pid) -> Option<ProcessUsage> {
        self.sys.process(pid).map(|p| ProcessUsage {
            memory: MemoryUsage {
                rss: p.memory(),
                virtual_bytes: p.virtual_memory(),
            },
            cpu_usage_percent: p.cpu_usage(),
            cpu_time_secs: p.run_time(),
        })
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-tier record carried in every snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TierSnapshot {
    pub tier: TierId,
    pub label: String,
    pub status: Option<PipelineStatus>,
    pub latency_ms: Option<u64>,
    pub latency_boundary_ms: u64,
    pub over_boundary: bool,
    pub segment_count: u64,
    pub segments_per_second: f64,
    /// Global; every observer watches every tier
    pub viewer_count: u64,
    pub last_segment_timestamp: Option<i64>,
    /// Process-wide, replicated into every tier
    pub memory: MemoryUsage,
    pub cpu_usage_percent: f32,
    /// Accumulated run time of this process in seconds
    pub cpu_time_secs: u64,
    pub uptime_seconds: u64,
    /// The tier's encoder subprocess, when its pid is known
    pub encoder: Option<ProcessUsage>,
}

impl TierSnapshot {
    pub fn from_stats(
        tier: TierId,
        label: &str,
        stats: &TierStats,
        status: Option<PipelineStatus>,
        viewer_count: u64,
        process: &ProcessUsage,
        uptime_seconds: u64,
        encoder: Option<ProcessUsage>,
    ) -> Self {
        let latency_ms = stats.latency.map(|l| l.latency_ms);
        Self {
            tier,
            label: label.to_string(),
            status,
            latency_ms,
            latency_boundary_ms: stats.latency_boundary_ms,
            over_boundary: latency_ms.map_or(false, |l| l > stats.latency_boundary_ms),
            segment_count: stats.segment_count,
            segments_per_second: stats.segments_per_second,
            viewer_count,
            last_segment_timestamp: stats.last_segment_at_ms,
            memory: process.memory,
            cpu_usage_percent: process.cpu_usage_percent,
            cpu_time_secs: process.cpu_time_secs,
            uptime_seconds,
            encoder,
        }
    }

    /// Overwrite the fields that change between ticks with the live stats
    ///
    /// Throughput, status and resource usage keep their tick values.
    pub fn refresh_counters(&mut self, stats: &TierStats, viewer_count: u64) {
        self.latency_ms = stats.latency.map(|l| l.latency_ms);
        self.latency_boundary_ms = stats.latency_boundary_ms;
        self.over_boundary = self
            .latency_ms
            .map_or(false, |l| l > stats.latency_boundary_ms);
        self.segment_count = stats.segment_count;
        self.last_segment_timestamp = stats.last_segment_at_ms;
        self.viewer_count = viewer_count;
    }
}

/// Immutable snapshot of every tier at one instant
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub timestamp: i64,
    pub per_stream: BTreeMap<TierId, TierSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn estimate(ms: u64) -> LatencyEstimate {
        LatencyEstimate {
            latency_ms: ms,
            window_ms: ms,
            segment_age_ms: 0,
            segment_count: 3,
            computed_at_ms: 0,
        }
    }

    #[test]
    fn test_throughput_four_segments_in_eight_seconds() {
        assert_eq!(throughput(4, 8.0), 0.5);
        assert_eq!(throughput(4, 0.0), 0.0);
    }

    #[test]
    fn test_refresh_throughput_uses_delta_since_previous_tick() {
        let mut stats = TierStats::new(3000);
        let t0 = Instant::now();
        stats.refresh_throughput(t0);
        assert_eq!(stats.segments_per_second, 0.0);

        for i in 0..4 {
            stats.record_segment(1_000 + i);
        }
        stats.refresh_throughput(t0 + Duration::from_secs(8));
        assert_eq!(stats.segments_per_second, 0.5);

        // No new segments in the next window
        stats.refresh_throughput(t0 + Duration::from_secs(10));
        assert_eq!(stats.segments_per_second, 0.0);
    }

    #[test]
    fn test_latency_never_regresses_to_absent() {
        let mut stats = TierStats::new(3000);
        stats.record_latency(None);
        assert!(stats.latency.is_none());

        stats.record_latency(Some(estimate(6500)));
        stats.record_latency(None);
        assert_eq!(stats.latency.map(|l| l.latency_ms), Some(6500));

        stats.record_latency(Some(estimate(6100)));
        assert_eq!(stats.latency.map(|l| l.latency_ms), Some(6100));
    }

    #[test]
    fn test_last_segment_time_is_monotonic() {
        let mut stats = TierStats::new(3000);
        stats.record_segment(2_000);
        stats.record_segment(1_500);
        assert_eq!(stats.segment_count, 2);
        assert_eq!(stats.last_segment_at_ms, Some(2_000));
    }

    #[test]
    fn test_set_boundary_scoped_and_global() {
        let mut table = StatsTable::new(TierId::ALL, 3000);

        table.set_boundary(Some(TierId::Cinema), 8000);
        assert_eq!(table.tier(TierId::Cinema).unwrap().latency_boundary_ms, 8000);
        assert_eq!(table.tier(TierId::Social).unwrap().latency_boundary_ms, 3000);
        assert_eq!(table.tier(TierId::Broadcasting).unwrap().latency_boundary_ms, 3000);

        table.set_boundary(None, 4000);
        assert!(table.iter().all(|(_, s)| s.latency_boundary_ms == 4000));
    }

    #[test]
    fn test_viewer_count_saturates() {
        let mut table = StatsTable::new(TierId::ALL, 3000);
        assert_eq!(table.viewer_connected(), 1);
        assert_eq!(table.viewer_disconnected(), 0);
        assert_eq!(table.viewer_disconnected(), 0);
    }

    #[test]
    fn test_snapshot_flags_latency_over_boundary() {
        let mut stats = TierStats::new(3000);
        stats.record_latency(Some(estimate(6500)));
        let snap = TierSnapshot::from_stats(
            TierId::Social,
            "Social",
            &stats,
            Some(PipelineStatus::Running),
            2,
            &ProcessUsage::default(),
            10,
            None,
        );
        assert!(snap.over_boundary);
        assert_eq!(snap.latency_ms, Some(6500));
        assert_eq!(snap.viewer_count, 2);
    }

    #[test]
    fn test_snapshot_carries_process_cpu_time() {
        let stats = TierStats::new(3000);
        let process = ProcessUsage {
            memory: MemoryUsage {
                rss: 4096,
                virtual_bytes: 8192,
            },
            cpu_usage_percent: 12.5,
            cpu_time_secs: 42,
        };
        let snap = TierSnapshot::from_stats(
            TierId::Cinema,
            "Cinema",
            &stats,
            None,
            0,
            &process,
            50,
            None,
        );
        assert_eq!(snap.cpu_time_secs, 42);
        assert_eq!(snap.memory.rss, 4096);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["cpuTimeSecs"], 42);
    }

    #[test]
    fn test_refresh_counters_keeps_tick_values() {
        let mut stats = TierStats::new(3000);
        stats.segments_per_second = 0.5;
        let mut snap = TierSnapshot::from_stats(
            TierId::Social,
            "Social",
            &stats,
            Some(PipelineStatus::Running),
            1,
            &ProcessUsage::default(),
            10,
            None,
        );

        stats.record_segment(5_000);
        stats.record_latency(Some(estimate(4000)));
        stats.latency_boundary_ms = 3500;
        stats.segments_per_second = 2.0;
        snap.refresh_counters(&stats, 4);

        assert_eq!(snap.segment_count, 1);
        assert_eq!(snap.last_segment_timestamp, Some(5_000));
        assert_eq!(snap.latency_ms, Some(4000));
        assert_eq!(snap.latency_boundary_ms, 3500);
        assert!(snap.over_boundary);
        assert_eq!(snap.viewer_count, 4);
        assert_eq!(snap.segments_per_second, 0.5);
        assert_eq!(snap.status, Some(PipelineStatus::Running));
    }

    #[test]
    fn test_snapshot_json_field_names() {
        let stats = TierStats::new(3000);
        let mut snapshot = MetricsSnapshot {
            timestamp: 1701388800000,
            per_stream: BTreeMap::new(),
        };
        snapshot.per_stream.insert(
            TierId::Broadcasting,
            TierSnapshot::from_stats(
                TierId::Broadcasting,
                "Broadcasting (1080p)",
                &stats,
                None,
                0,
                &ProcessUsage::default(),
                0,
                None,
            ),
        );

        let json = serde_json::to_string(&snapshot).unwrap();
        for field in [
            "perStream",
            "broadcasting",
            "latencyMs",
            "latencyBoundaryMs",
            "segmentCount",
            "segmentsPerSecond",
            "viewerCount",
            "lastSegmentTimestamp",
            "\"rss\"",
            "\"virtual\"",
            "uptimeSeconds",
            "cpuTimeSecs",
        ] {
            assert!(json.contains(field), "missing {} in {}", field, json);
        }
    }

    #[test]
    fn test_sampler_reads_own_process() {
        let mut sampler = ProcessSampler::new();
        let (own, encoders) = sampler.sample(&[]);
        assert!(own.memory.rss > 0);
        assert!(encoders.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Rapid repeated triggers never decrement the counter or go negative
        #[test]
        fn prop_throughput_never_negative(
            bursts in proptest::collection::vec(0u8..6, 1..20),
            gaps_ms in proptest::collection::vec(0u64..3000, 1..20),
        ) {
            let mut stats = TierStats::new(3000);
            let mut now = Instant::now();
            let mut last_count = 0;
            for (burst, gap) in bursts.iter().zip(gaps_ms.iter().cycle()) {
                for _ in 0..*burst {
                    stats.record_segment(timestamp_ms());
                }
                prop_assert!(stats.segment_count >= last_count);
                last_count = stats.segment_count;
                now += Duration::from_millis(*gap);
                stats.refresh_throughput(now);
                prop_assert!(stats.segments_per_second >= 0.0);
            }
        }

        #[test]
        fn prop_metrics_snapshot_round_trip(
            timestamp in any::<i64>(),
            segment_count in any::<u32>(),
            boundary in 1u64..60_000,
            viewers in 0u64..10_000,
            latency in proptest::option::of(0u64..60_000),
        ) {
            let mut stats = TierStats::new(boundary);
            stats.segment_count = segment_count as u64;
            stats.record_latency(latency.map(estimate));
            let mut snapshot = MetricsSnapshot { timestamp, per_stream: BTreeMap::new() };
            for id in TierId::ALL {
                snapshot.per_stream.insert(
                    id,
                    TierSnapshot::from_stats(id, id.as_str(), &stats, Some(PipelineStatus::Running), viewers, &ProcessUsage::default(), 5, None),
                );
            }

            let json = serde_json::to_string(&snapshot).expect("serialization should succeed");
            let back: MetricsSnapshot = serde_json::from_str(&json).expect("deserialization should succeed");
            prop_assert_eq!(snapshot, back);
        }
    }
}
