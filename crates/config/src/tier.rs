//! Quality tier identifiers and their encode parameters

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed set of quality tiers a stream can be served at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierId {
    /// Mobile-friendly 720p
    Social,
    /// Standard 1080p
    Broadcasting,
    /// High-fidelity 4K
    Cinema,
}

impl TierId {
    pub const ALL: [TierId; 3] = [TierId::Social, TierId::Broadcasting, TierId::Cinema];

    pub fn as_str(&self) -> &'static str {
        match self {
            TierId::Social => "social",
            TierId::Broadcasting => "broadcasting",
            TierId::Cinema => "cinema",
        }
    }
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string names no known tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTierIdError(pub String);

impl fmt::Display for ParseTierIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown tier identifier: {:?}", self.0)
    }
}

impl std::error::Error for ParseTierIdError {}

impl FromStr for TierId {
    type Err = ParseTierIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "social" => Ok(TierId::Social),
            "broadcasting" => Ok(TierId::Broadcasting),
            "cinema" => Ok(TierId::Cinema),
            other => Err(ParseTierIdError(other.to_string())),
        }
    }
}

/// Encode parameters for one tier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierConfig {
    pub id: TierId,
    /// Human-readable label shown to observers
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    /// Peak bitrate cap (defaults to 107% of the target bitrate)
    #[serde(default)]
    pub maxrate_kbps: Option<u32>,
    /// Rate-control buffer (defaults to 150% of the target bitrate)
    #[serde(default)]
    pub bufsize_kbps: Option<u32>,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    /// x264 preset
    pub preset: String,
    /// H.264 profile
    pub profile: String,
    /// H.264 level
    pub level: String,
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: u32,
}

fn default_frame_rate() -> u32 {
    30
}

fn default_segment_duration_secs() -> u32 {
    2
}

impl TierConfig {
    fn builtin(
        id: TierId,
        label: &str,
        (width, height): (u32, u32),
        video_bitrate_kbps: u32,
        preset: &str,
        profile: &str,
        level: &str,
    ) -> Self {
        Self {
            id,
            label: label.to_string(),
            width,
            height,
            video_bitrate_kbps,
            maxrate_kbps: None,
            bufsize_kbps: None,
            frame_rate: default_frame_rate(),
            preset: preset.to_string(),
            profile: profile.to_string(),
            level: level.to_string(),
            segment_duration_secs: default_segment_duration_secs(),
        }
    }
}

/// The built-in tier catalog used when the config file names no tiers
pub fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig::builtin(
            TierId::Social,
            "Social Media (720p)",
            (1280, 720),
            2800,
            "veryfast",
            "main",
            "3.1",
        ),
        TierConfig::builtin(
            TierId::Broadcasting,
            "Broadcasting (1080p)",
            (1920, 1080),
            5000,
            "fast",
            "high",
            "4.1",
        ),
        TierConfig::builtin(
            TierId::Cinema,
            "Cinema (4K)",
            (3840, 2160),
            15000,
            "medium",
            "high",
            "5.1",
        ),
    ]
}
