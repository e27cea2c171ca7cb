//! Manifest latency estimator
//!
//! Reads a tier's rolling HLS manifest and the modification time of its newest
//! segment to estimate how far behind the live edge a just-joining viewer sits:
//!
//! `latency = (now - mtime(last segment)) + sum(segment durations in manifest)`
//!
//! The formula treats the whole manifest window as buffering delay on top of the
//! age of the newest segment, so it approximates rather than measures
//! glass-to-glass latency. Any read or parse anomaly yields `None`; encoder
//! writes are not atomic and a missing value is simply retried on the next
//! segment or tick.

use crate::config::TierId;
use crate::metrics::system_time_ms;
use crate::tiers::TierCatalog;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{trace, warn};

const DURATION_TAG: &str = "#EXTINF:";

/// One entry of a parsed manifest, in playback order
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestSegment {
    pub duration_secs: f64,
    pub file_name: String,
}

/// Segments currently listed by a manifest; the last entry is the newest
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub segments: Vec<ManifestSegment>,
}

impl Manifest {
    /// Parse manifest text
    ///
    /// A duration tag followed (possibly after blank or comment lines) by a
    /// file name line forms one segment. Returns `None` for an empty segment
    /// list or any anomaly: unparseable or negative durations, two duration
    /// tags without a file name between them, or a file name with no duration.
    /// A trailing duration tag with no file name yet is an entry still being
    /// written and is ignored.
    pub fn parse(contents: &str) -> Option<Self> {
        let mut segments = Vec::new();
        let mut pending_duration: Option<f64> = None;

        for line in contents.lines().map(str::trim) {
            if let Some(rest) = line.strip_prefix(DURATION_TAG) {
                if pending_duration.is_some() {
                    return None;
                }
                let value = rest.split(',').next().unwrap_or_default().trim();
                let duration: f64 = value.parse().ok()?;
                if !duration.is_finite() || duration < 0.0 {
                    return None;
                }
                pending_duration = Some(duration);
            } else if line.is_empty() || line.starts_with('#') {
                continue;
            } else {
                let duration_secs = pending_duration.take()?;
                segments.push(ManifestSegment {
                    duration_secs,
                    file_name: line.to_string(),
                });
            }
        }

        if segments.is_empty() {
            return None;
        }
        Some(Self { segments })
    }

    /// Sum of the listed segment durations in seconds
    pub fn window_secs(&self) -> f64 {
        self.segments.iter().map(|s| s.duration_secs).sum()
    }

    pub fn last(&self) -> Option<&ManifestSegment> {
        self.segments.last()
    }
}

/// Derived latency value for one tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyEstimate {
    /// Segment age plus manifest window
    pub latency_ms: u64,
    /// Sum of listed segment durations
    pub window_ms: u64,
    /// Time since the newest segment file was last modified
    pub segment_age_ms: u64,
    pub segment_count: usize,
    pub computed_at_ms: i64,
}

/// Estimate latency from a manifest file at the given instant
pub fn estimate_at(manifest_path: &Path, now: SystemTime) -> Option<LatencyEstimate> {
    let contents = std::fs::read_to_string(manifest_path).ok()?;
    let manifest = Manifest::parse(&contents)?;
    let last = manifest.last()?;

    // Segment names are relative to the manifest's directory
    let dir = manifest_path.parent()?;
    let segment_path = dir.join(&last.file_name);
    let modified = std::fs::metadata(&segment_path).ok()?.modified().ok()?;

    // A future mtime (clock skew) counts as a fresh segment
    let segment_age_ms = now
        .duration_since(modified)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let window_ms = (manifest.window_secs() * 1000.0).round() as u64;

    Some(LatencyEstimate {
        latency_ms: segment_age_ms + window_ms,
        window_ms,
        segment_age_ms,
        segment_count: manifest.segments.len(),
        computed_at_ms: system_time_ms(now),
    })
}

/// Estimates latency for catalog tiers
#[derive(Debug, Clone)]
pub struct LatencyEstimator {
    catalog: Arc<TierCatalog>,
}

impl LatencyEstimator {
    pub fn new(catalog: Arc<TierCatalog>) -> Self {
        Self { catalog }
    }

    /// Current estimate for a tier, or `None` when no usable manifest exists yet
    pub fn estimate(&self, tier: TierId) -> Option<LatencyEstimate> {
        let path = self.catalog.manifest_path(tier);
        let estimate = estimate_at(&path, SystemTime::now());
        if estimate.is_none() {
            trace!(%tier, path = %path.display(), "manifest unavailable");
        }
        estimate
    }

    /// Estimates for several tiers, read on the blocking pool
    ///
    /// A failed read task yields `None` for every requested tier.
    pub async fn estimate_many(&self, tiers: Vec<TierId>) -> Vec<(TierId, Option<LatencyEstimate>)> {
        let estimator = self.clone();
        let requested = tiers.clone();
        let read = tokio::task::spawn_blocking(move || {
            tiers
                .into_iter()
                .map(|tier| (tier, estimator.estimate(tier)))
                .collect::<Vec<_>>()
        })
        .await;

        match read {
            Ok(estimates) => estimates,
            Err(e) => {
                warn!(error = %e, "manifest read task failed");
                requested.into_iter().map(|tier| (tier, None)).collect()
            }
        }
    }

    /// Single-tier form of [`LatencyEstimator::estimate_many`]
    pub async fn estimate_blocking(&self, tier: TierId) -> Option<LatencyEstimate> {
        self.estimate_many(vec![tier])
            .await
            .into_iter()
            .next()
            .and_then(|(_, estimate)| estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use proptest::prelude::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    const THREE_SEGMENTS: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:2\n\
#EXT-X-MEDIA-SEQUENCE:41\n\
#EXTINF:2.000000,\n\
segment_00041.ts\n\
#EXTINF:2.000000,\n\
segment_00042.ts\n\
#EXTINF:2.000000,\n\
segment_00043.ts\n";

    fn write_tier_dir(contents: &str, segments: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("playlist.m3u8"), contents).unwrap();
        for name in segments {
            fs::write(dir.path().join(name), b"ts").unwrap();
        }
        dir
    }

    #[test]
    fn test_parse_keeps_file_order() {
        let manifest = Manifest::parse(THREE_SEGMENTS).expect("valid manifest");
        let names: Vec<&str> = manifest
            .segments
            .iter()
            .map(|s| s.file_name.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["segment_00041.ts", "segment_00042.ts", "segment_00043.ts"]
        );
        assert_eq!(manifest.last().unwrap().file_name, "segment_00043.ts");
        assert!((manifest.window_secs() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_skips_comments_between_tag_and_name() {
        let text = "#EXTM3U\n#EXTINF:1.5,\n\n#EXT-X-DISCONTINUITY\nseg_1.ts\n";
        let manifest = Manifest::parse(text).unwrap();
        assert_eq!(manifest.segments.len(), 1);
        assert_eq!(manifest.segments[0].duration_secs, 1.5);
    }

    #[test]
    fn test_parse_empty_or_headers_only_is_absent() {
        assert!(Manifest::parse("").is_none());
        assert!(Manifest::parse("#EXTM3U\n#EXT-X-VERSION:3\n").is_none());
    }

    #[test]
    fn test_parse_anomalies_are_absent() {
        // Truncated mid-number
        assert!(Manifest::parse("#EXTM3U\n#EXTINF:2.0x,\nseg.ts\n").is_none());
        // Name without a duration
        assert!(Manifest::parse("#EXTM3U\nseg.ts\n").is_none());
        // Two durations in a row
        assert!(Manifest::parse("#EXTINF:2,\n#EXTINF:2,\nseg.ts\n").is_none());
        // Negative duration
        assert!(Manifest::parse("#EXTINF:-2,\nseg.ts\n").is_none());
    }

    #[test]
    fn test_parse_ignores_trailing_incomplete_entry() {
        let text = format!("{}#EXTINF:2.000000,\n", THREE_SEGMENTS);
        let manifest = Manifest::parse(&text).unwrap();
        assert_eq!(manifest.segments.len(), 3);
    }

    #[test]
    fn test_estimate_adds_window_and_age() {
        let dir = write_tier_dir(
            THREE_SEGMENTS,
            &["segment_00041.ts", "segment_00042.ts", "segment_00043.ts"],
        );
        let mtime = fs::metadata(dir.path().join("segment_00043.ts"))
            .unwrap()
            .modified()
            .unwrap();

        let estimate = estimate_at(
            &dir.path().join("playlist.m3u8"),
            mtime + Duration::from_millis(500),
        )
        .expect("estimate");

        assert_eq!(estimate.window_ms, 6000);
        assert_eq!(estimate.segment_age_ms, 500);
        assert_eq!(estimate.latency_ms, 6500);
        assert_eq!(estimate.segment_count, 3);
    }

    #[test]
    fn test_estimate_absent_without_manifest() {
        let dir = TempDir::new().unwrap();
        assert!(estimate_at(&dir.path().join("playlist.m3u8"), SystemTime::now()).is_none());
    }

    #[test]
    fn test_estimate_absent_when_last_segment_missing() {
        // Manifest published before the newest segment landed
        let dir = write_tier_dir(THREE_SEGMENTS, &["segment_00041.ts", "segment_00042.ts"]);
        assert!(estimate_at(&dir.path().join("playlist.m3u8"), SystemTime::now()).is_none());
    }

    #[test]
    fn test_future_mtime_counts_as_zero_age() {
        let dir = write_tier_dir(
            THREE_SEGMENTS,
            &["segment_00041.ts", "segment_00042.ts", "segment_00043.ts"],
        );
        let mtime = fs::metadata(dir.path().join("segment_00043.ts"))
            .unwrap()
            .modified()
            .unwrap();

        let estimate = estimate_at(
            &dir.path().join("playlist.m3u8"),
            mtime - Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(estimate.latency_ms, 6000);
    }

    #[test]
    fn test_estimator_resolves_tier_path() {
        let root = TempDir::new().unwrap();
        let mut config = Config::default();
        config.encoder.output_root = root.path().to_path_buf();
        let catalog = Arc::new(TierCatalog::from_config(&config));

        let tier_dir = catalog.output_dir(TierId::Social);
        fs::create_dir_all(&tier_dir).unwrap();
        fs::write(tier_dir.join("playlist.m3u8"), "#EXTM3U\n#EXTINF:2.0,\nsegment_00000.ts\n")
            .unwrap();
        fs::write(tier_dir.join("segment_00000.ts"), b"ts").unwrap();

        let estimator = LatencyEstimator::new(catalog);
        let estimate = estimator.estimate(TierId::Social).expect("estimate");
        assert!(estimate.latency_ms >= 2000);
        assert!(estimator.estimate(TierId::Cinema).is_none());
    }

    #[tokio::test]
    async fn test_estimate_many_reads_every_requested_tier() {
        let root = TempDir::new().unwrap();
        let mut config = Config::default();
        config.encoder.output_root = root.path().to_path_buf();
        let catalog = Arc::new(TierCatalog::from_config(&config));

        let tier_dir = catalog.output_dir(TierId::Broadcasting);
        fs::create_dir_all(&tier_dir).unwrap();
        fs::write(tier_dir.join("playlist.m3u8"), THREE_SEGMENTS).unwrap();
        for name in ["segment_00041.ts", "segment_00042.ts", "segment_00043.ts"] {
            fs::write(tier_dir.join(name), b"ts").unwrap();
        }

        let estimator = LatencyEstimator::new(catalog);
        let estimates = estimator
            .estimate_many(vec![TierId::Broadcasting, TierId::Cinema])
            .await;

        assert_eq!(estimates.len(), 2);
        assert_eq!(estimates[0].0, TierId::Broadcasting);
        assert_eq!(estimates[0].1.map(|e| e.segment_count), Some(3));
        assert_eq!(estimates[1], (TierId::Cinema, None));

        let single = estimator.estimate_blocking(TierId::Broadcasting).await.expect("estimate");
        assert_eq!(single.window_ms, 6000);
        assert!(estimator.estimate_blocking(TierId::Social).await.is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        // The estimate never undercuts the manifest window
        #[test]
        fn prop_estimate_at_least_window(
            durations in proptest::collection::vec(0.5f64..10.0, 1..8),
            age_ms in 0u64..20_000,
        ) {
            let mut text = String::from("#EXTM3U\n");
            let mut names = Vec::new();
            for (i, d) in durations.iter().enumerate() {
                let name = format!("segment_{:05}.ts", i);
                text.push_str(&format!("#EXTINF:{:.6},\n{}\n", d, name));
                names.push(name);
            }
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let dir = write_tier_dir(&text, &refs);
            let mtime = fs::metadata(dir.path().join(refs.last().unwrap()))
                .unwrap()
                .modified()
                .unwrap();

            let estimate = estimate_at(
                &dir.path().join("playlist.m3u8"),
                mtime + Duration::from_millis(age_ms),
            ).unwrap();

            let window: f64 = durations.iter().sum();
            prop_assert!(estimate.latency_ms as f64 + 1.0 >= window * 1000.0);
            prop_assert_eq!(estimate.latency_ms, estimate.window_ms + age_ms);
        }

        #[test]
        fn prop_parse_never_panics(text in "\\PC*") {
            let _ = Manifest::parse(&text);
        }
    }
}
