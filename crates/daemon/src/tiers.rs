//! Tier catalog
//!
//! Static registry of the quality tiers this service publishes, built once from
//! configuration. Also resolves every per-tier path and URL so the rest of the
//! crate never assembles them by hand.

use crate::config::{Config, TierConfig, TierId};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Manifest file written by every pipeline inside its output directory
pub const MANIFEST_FILE_NAME: &str = "playlist.m3u8";

/// Segment file extension produced by the encoder
pub const SEGMENT_EXTENSION: &str = "ts";

/// Immutable descriptor of one quality tier
#[derive(Debug, Clone, PartialEq)]
pub struct Tier {
    pub id: TierId,
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub maxrate_kbps: u32,
    pub bufsize_kbps: u32,
    pub frame_rate: u32,
    pub preset: String,
    pub profile: String,
    pub level: String,
    pub segment_duration_secs: u32,
}

/// `kbps * num / den`, widened so large bitrates saturate instead of wrapping
fn scale_kbps(kbps: u32, num: u64, den: u64) -> u32 {
    u32::try_from(u64::from(kbps) * num / den).unwrap_or(u32::MAX)
}

impl Tier {
    pub fn from_config(cfg: &TierConfig) -> Self {
        Self {
            id: cfg.id,
            label: cfg.label.clone(),
            width: cfg.width,
            height: cfg.height,
            video_bitrate_kbps: cfg.video_bitrate_kbps,
            maxrate_kbps: cfg
                .maxrate_kbps
                .unwrap_or_else(|| scale_kbps(cfg.video_bitrate_kbps, 107, 100)),
            bufsize_kbps: cfg
                .bufsize_kbps
                .unwrap_or_else(|| scale_kbps(cfg.video_bitrate_kbps, 3, 2)),
            frame_rate: cfg.frame_rate,
            preset: cfg.preset.clone(),
            profile: cfg.profile.clone(),
            level: cfg.level.clone(),
            segment_duration_secs: cfg.segment_duration_secs,
        }
    }

    /// Frames between keyframes, aligned so every segment starts on one
    pub fn keyframe_interval(&self) -> u32 {
        self.frame_rate.saturating_mul(self.segment_duration_secs)
    }
}

/// Registry of every configured tier plus the path/URL layout of its output
#[derive(Debug, Clone)]
pub struct TierCatalog {
    tiers: BTreeMap<TierId, Arc<Tier>>,
    output_root: PathBuf,
    public_base_url: String,
}

impl TierCatalog {
    pub fn new(tiers: impl IntoIterator<Item = Tier>, output_root: PathBuf, public_base_url: &str) -> Self {
        Self {
            tiers: tiers.into_iter().map(|t| (t.id, Arc::new(t))).collect(),
            output_root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.tiers.iter().map(Tier::from_config),
            config.encoder.output_root.clone(),
            &config.server.public_base_url,
        )
    }

    /// Resolve a raw identifier to a tier this catalog carries
    pub fn resolve(&self, raw: &str) -> Option<Arc<Tier>> {
        let id = raw.trim().parse::<TierId>().ok()?;
        self.get(id)
    }

    pub fn get(&self, id: TierId) -> Option<Arc<Tier>> {
        self.tiers.get(&id).cloned()
    }

    pub fn contains(&self, id: TierId) -> bool {
        self.tiers.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = TierId> + '_ {
        self.tiers.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Tier>> {
        self.tiers.values()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn output_dir(&self, id: TierId) -> PathBuf {
        self.output_root.join(id.as_str())
    }

    pub fn manifest_path(&self, id: TierId) -> PathBuf {
        self.output_dir(id).join(MANIFEST_FILE_NAME)
    }

    /// Public URL players load the tier's manifest from
    pub fn manifest_url(&self, id: TierId) -> String {
        format!(
            "{}/hls/{}/{}",
            self.public_base_url,
            id.as_str(),
            MANIFEST_FILE_NAME
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> TierCatalog {
        TierCatalog::from_config(&Config::default())
    }

    #[test]
    fn test_catalog_holds_default_tiers() {
        let catalog = catalog();
        assert_eq!(catalog.len(), 3);
        assert_eq!(
            catalog.ids().collect::<Vec<_>>(),
            vec![TierId::Social, TierId::Broadcasting, TierId::Cinema]
        );
    }

    #[test]
    fn test_resolve_rejects_unknown() {
        let catalog = catalog();
        assert!(catalog.resolve("cinema").is_some());
        assert!(catalog.resolve("  social ").is_some());
        assert!(catalog.resolve("ultra").is_none());
        assert!(catalog.resolve("").is_none());
    }

    #[test]
    fn test_resolve_respects_configured_subset() {
        let mut config = Config::default();
        config.tiers.retain(|t| t.id != TierId::Cinema);
        let catalog = TierCatalog::from_config(&config);

        assert!(catalog.resolve("cinema").is_none());
        assert!(!catalog.contains(TierId::Cinema));
    }

    #[test]
    fn test_paths_and_urls() {
        let catalog = TierCatalog::new(
            crate::config::default_tiers().iter().map(Tier::from_config),
            PathBuf::from("/srv/hls"),
            "https://cdn.example.com/",
        );

        assert_eq!(
            catalog.manifest_path(TierId::Social),
            PathBuf::from("/srv/hls/social/playlist.m3u8")
        );
        assert_eq!(
            catalog.manifest_url(TierId::Cinema),
            "https://cdn.example.com/hls/cinema/playlist.m3u8"
        );
    }

    #[test]
    fn test_root_relative_url_by_default() {
        assert_eq!(
            catalog().manifest_url(TierId::Broadcasting),
            "/hls/broadcasting/playlist.m3u8"
        );
    }

    #[test]
    fn test_derived_rate_control_and_gop() {
        let social = catalog().get(TierId::Social).unwrap();
        assert_eq!(social.maxrate_kbps, 2996);
        assert_eq!(social.bufsize_kbps, 4200);
        assert_eq!(social.keyframe_interval(), 60);
    }

    #[test]
    fn test_derived_rate_control_saturates_at_extreme_bitrates() {
        let mut cfg = Config::default().tiers[0].clone();
        cfg.video_bitrate_kbps = u32::MAX;
        cfg.maxrate_kbps = None;
        cfg.bufsize_kbps = None;
        cfg.frame_rate = u32::MAX;

        let tier = Tier::from_config(&cfg);
        assert_eq!(tier.maxrate_kbps, u32::MAX);
        assert_eq!(tier.bufsize_kbps, u32::MAX);
        assert_eq!(tier.keyframe_interval(), u32::MAX);

        cfg.video_bitrate_kbps = 4_100_000_000;
        let tier = Tier::from_config(&cfg);
        assert_eq!(tier.maxrate_kbps, u32::MAX);
        assert_eq!(tier.bufsize_kbps, u32::MAX);
        cfg.video_bitrate_kbps = 2_000_000_000;
        let tier = Tier::from_config(&cfg);
        assert_eq!(tier.maxrate_kbps, 2_140_000_000);
        assert_eq!(tier.bufsize_kbps, 3_000_000_000);
    }
}
