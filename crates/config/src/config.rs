//! Core configuration structures and loading logic

use crate::tier::{default_tiers, TierConfig, TierId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Configuration parsed but holds unusable values
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// HTTP / observer channel settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Listen address (default 0.0.0.0:8000)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Prefix for manifest URLs handed to players; empty means root-relative
    #[serde(default)]
    pub public_base_url: String,
    /// Serve the output root under /hls
    #[serde(default = "default_true")]
    pub serve_segments: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            public_base_url: String::new(),
            serve_segments: true,
        }
    }
}

/// External encoder invocation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Source file read in a loop by every pipeline
    #[serde(default = "default_source")]
    pub source: PathBuf,
    /// Parent of the per-tier output directories
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    /// Number of segments retained in the rolling manifest
    #[serde(default = "default_playlist_size")]
    pub playlist_size: u32,
    #[serde(default = "default_audio_bitrate_kbps")]
    pub audio_bitrate_kbps: u32,
    /// Grace period between the termination signal and a forced kill
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_source() -> PathBuf {
    PathBuf::from("video/source.mp4")
}

fn default_output_root() -> PathBuf {
    PathBuf::from("hls")
}

fn default_playlist_size() -> u32 {
    3
}

fn default_audio_bitrate_kbps() -> u32 {
    128
}

fn default_kill_timeout_ms() -> u64 {
    3000
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            source: default_source(),
            output_root: default_output_root(),
            playlist_size: default_playlist_size(),
            audio_bitrate_kbps: default_audio_bitrate_kbps(),
            kill_timeout_ms: default_kill_timeout_ms(),
        }
    }
}

/// Pipeline restart policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Delay before a failed pipeline is relaunched (default 5000)
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Upper bound for the restart delay; unset means no backoff growth
    #[serde(default)]
    pub max_restart_delay_ms: Option<u64>,
    /// Run time after which the consecutive failure count resets
    #[serde(default = "default_stable_after_ms")]
    pub stable_after_ms: u64,
}

fn default_restart_delay_ms() -> u64 {
    5000
}

fn default_stable_after_ms() -> u64 {
    60_000
}

impl PipelineConfig {
    /// Effective backoff cap, never below the base delay
    pub fn restart_delay_cap_ms(&self) -> u64 {
        self.max_restart_delay_ms
            .unwrap_or(self.restart_delay_ms)
            .max(self.restart_delay_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: default_restart_delay_ms(),
            max_restart_delay_ms: None,
            stable_after_ms: default_stable_after_ms(),
        }
    }
}

/// Metrics cadence and observer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    /// Snapshot period (default 2000)
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Segment directory poll period
    #[serde(default = "default_watch_poll_ms")]
    pub watch_poll_ms: u64,
    /// Initial latency alert threshold for every tier
    #[serde(default = "default_latency_boundary_ms")]
    pub default_latency_boundary_ms: u64,
    /// Outbound message queue per observer
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
}

fn default_tick_ms() -> u64 {
    2000
}

fn default_watch_poll_ms() -> u64 {
    250
}

fn default_latency_boundary_ms() -> u64 {
    3000
}

fn default_observer_buffer() -> usize {
    256
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            watch_poll_ms: default_watch_poll_ms(),
            default_latency_boundary_ms: default_latency_boundary_ms(),
            observer_buffer: default_observer_buffer(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            encoder: EncoderConfig::default(),
            pipeline: PipelineConfig::default(),
            metrics: MetricsConfig::default(),
            tiers: default_tiers(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - PORT -> port part of server.bind_addr
    /// - TIERSTREAM_BIND_ADDR -> server.bind_addr
    /// - TIERSTREAM_PUBLIC_BASE_URL -> server.public_base_url
    /// - TIERSTREAM_FFMPEG -> encoder.ffmpeg_path
    /// - TIERSTREAM_SOURCE -> encoder.source
    /// - TIERSTREAM_OUTPUT_ROOT -> encoder.output_root
    /// - TIERSTREAM_RESTART_DELAY_MS -> pipeline.restart_delay_ms
    /// - TIERSTREAM_TICK_MS -> metrics.tick_ms
    /// - TIERSTREAM_LATENCY_BOUNDARY_MS -> metrics.default_latency_boundary_ms
    pub fn apply_env_overrides(&mut self) {
        // PORT keeps the configured host
        if let Ok(val) = env::var("PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.server.bind_addr = with_port(&self.server.bind_addr, port);
            }
        }

        if let Ok(val) = env::var("TIERSTREAM_BIND_ADDR") {
            if !val.is_empty() {
                self.server.bind_addr = val;
            }
        }

        if let Ok(val) = env::var("TIERSTREAM_PUBLIC_BASE_URL") {
            self.server.public_base_url = val;
        }

        if let Ok(val) = env::var("TIERSTREAM_FFMPEG") {
            if !val.is_empty() {
                self.encoder.ffmpeg_path = val;
            }
        }

        if let Ok(val) = env::var("TIERSTREAM_SOURCE") {
            if !val.is_empty() {
                self.encoder.source = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("TIERSTREAM_OUTPUT_ROOT") {
            if !val.is_empty() {
                self.encoder.output_root = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("TIERSTREAM_RESTART_DELAY_MS") {
            if let Ok(delay) = val.parse::<u64>() {
                self.pipeline.restart_delay_ms = delay;
            }
        }

        if let Ok(val) = env::var("TIERSTREAM_TICK_MS") {
            if let Ok(tick) = val.parse::<u64>() {
                self.metrics.tick_ms = tick;
            }
        }

        if let Ok(val) = env::var("TIERSTREAM_LATENCY_BOUNDARY_MS") {
            if let Ok(boundary) = val.parse::<u64>() {
                self.metrics.default_latency_boundary_ms = boundary;
            }
        }
    }

    /// Check invariants the rest of the service relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::Invalid("at least one tier is required".into()));
        }

        let mut seen = HashSet::new();
        for tier in &self.tiers {
            if !seen.insert(tier.id) {
                return Err(ConfigError::Invalid(format!("duplicate tier {}", tier.id)));
            }
            if tier.segment_duration_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "tier {}: segment_duration_secs must be positive",
                    tier.id
                )));
            }
            if tier.frame_rate == 0 {
                return Err(ConfigError::Invalid(format!(
                    "tier {}: frame_rate must be positive",
                    tier.id
                )));
            }
        }

        if self.encoder.playlist_size == 0 {
            return Err(ConfigError::Invalid("encoder.playlist_size must be positive".into()));
        }
        if self.pipeline.restart_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.restart_delay_ms must be positive".into(),
            ));
        }
        if self.metrics.tick_ms == 0 || self.metrics.watch_poll_ms == 0 {
            return Err(ConfigError::Invalid("metrics periods must be positive".into()));
        }
        if self.metrics.default_latency_boundary_ms == 0 {
            return Err(ConfigError::Invalid(
                "metrics.default_latency_boundary_ms must be positive".into(),
            ));
        }
        if self.metrics.observer_buffer == 0 {
            return Err(ConfigError::Invalid("metrics.observer_buffer must be positive".into()));
        }
        Ok(())
    }

    /// Configured parameters for one tier, if present
    pub fn tier(&self, id: TierId) -> Option<&TierConfig> {
        self.tiers.iter().find(|t| t.id == id)
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

/// Replace the port of a `host:port` address, appending one if absent
fn with_port(addr: &str, port: u16) -> String {
    match addr.rsplit_once(':') {
        Some((host, _)) => format!("{}:{}", host, port),
        None => format!("{}:{}", addr, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("PORT");
        env::remove_var("TIERSTREAM_BIND_ADDR");
        env::remove_var("TIERSTREAM_PUBLIC_BASE_URL");
        env::remove_var("TIERSTREAM_FFMPEG");
        env::remove_var("TIERSTREAM_SOURCE");
        env::remove_var("TIERSTREAM_OUTPUT_ROOT");
        env::remove_var("TIERSTREAM_RESTART_DELAY_MS");
        env::remove_var("TIERSTREAM_TICK_MS");
        env::remove_var("TIERSTREAM_LATENCY_BOUNDARY_MS");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            port in 1024u16..65535,
            playlist_size in 1u32..20,
            restart_delay in 1u64..60_000,
            tick in 1u64..10_000,
            boundary in 1u64..60_000,
        ) {
            let toml_str = format!(
                r#"
[server]
bind_addr = "127.0.0.1:{}"

[encoder]
playlist_size = {}

[pipeline]
restart_delay_ms = {}

[metrics]
tick_ms = {}
default_latency_boundary_ms = {}
"#,
                port, playlist_size, restart_delay, tick, boundary
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(&config.server.bind_addr, &format!("127.0.0.1:{}", port));
            prop_assert_eq!(config.encoder.playlist_size, playlist_size);
            prop_assert_eq!(config.pipeline.restart_delay_ms, restart_delay);
            prop_assert_eq!(config.pipeline.restart_delay_cap_ms(), restart_delay);
            prop_assert_eq!(config.metrics.tick_ms, tick);
            prop_assert_eq!(config.metrics.default_latency_boundary_ms, boundary);
            prop_assert_eq!(config.tiers.len(), 3);
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_env_port_keeps_host(port in 1u16..65535) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::parse_toml("[server]\nbind_addr = \"10.0.0.5:9000\"\n")
                .expect("Valid TOML");

            env::set_var("PORT", port.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(&config.server.bind_addr, &format!("10.0.0.5:{}", port));
        }

        #[test]
        fn prop_env_overrides_restart_delay(
            initial in 1u64..10_000,
            override_delay in 1u64..120_000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[pipeline]\nrestart_delay_ms = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("TIERSTREAM_RESTART_DELAY_MS", override_delay.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.pipeline.restart_delay_ms, override_delay);
            prop_assert!(config.pipeline.restart_delay_cap_ms() >= override_delay);
        }
    }

    #[test]
    fn test_env_overrides_paths_and_cadence() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("TIERSTREAM_FFMPEG", "/opt/ffmpeg/bin/ffmpeg");
        env::set_var("TIERSTREAM_SOURCE", "/media/loop.mp4");
        env::set_var("TIERSTREAM_OUTPUT_ROOT", "/var/lib/tierstream/hls");
        env::set_var("TIERSTREAM_TICK_MS", "not-a-number");
        env::set_var("TIERSTREAM_LATENCY_BOUNDARY_MS", "4500");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.encoder.ffmpeg_path, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(config.encoder.source, PathBuf::from("/media/loop.mp4"));
        assert_eq!(
            config.encoder.output_root,
            PathBuf::from("/var/lib/tierstream/hls")
        );
        // Invalid value keeps the existing one
        assert_eq!(config.metrics.tick_ms, 2000);
        assert_eq!(config.metrics.default_latency_boundary_ms, 4500);
    }

    // Test that missing sections use defaults
    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config, Config::default());
        assert_eq!(config.server.bind_addr, "0.0.0.0:8000");
        assert_eq!(config.pipeline.restart_delay_ms, 5000);
        assert_eq!(config.pipeline.max_restart_delay_ms, None);
        assert_eq!(config.pipeline.restart_delay_cap_ms(), 5000);
        assert_eq!(config.metrics.tick_ms, 2000);
        assert_eq!(config.metrics.default_latency_boundary_ms, 3000);
        assert_eq!(config.tiers.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tier_override_replaces_catalog() {
        let toml_str = r#"
[[tiers]]
id = "social"
label = "Phones"
width = 854
height = 480
video_bitrate_kbps = 1200
preset = "ultrafast"
profile = "baseline"
level = "3.0"
segment_duration_secs = 4
"#;
        let config = Config::parse_toml(toml_str).expect("Tier TOML should parse");

        assert_eq!(config.tiers.len(), 1);
        let social = config.tier(TierId::Social).expect("social configured");
        assert_eq!(social.width, 854);
        assert_eq!(social.segment_duration_secs, 4);
        assert!(config.tier(TierId::Cinema).is_none());
    }

    #[test]
    fn test_validate_rejects_duplicate_tiers() {
        let mut config = Config::default();
        let dup = config.tiers[0].clone();
        config.tiers.push(dup);

        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_segment_duration() {
        let mut config = Config::default();
        config.tiers[1].segment_duration_secs = 0;

        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_restart_delay() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let config = Config::parse_toml("[pipeline]\nrestart_delay_ms = 0\n").expect("Valid TOML");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        // Same through the environment
        let mut config = Config::default();
        env::set_var("TIERSTREAM_RESTART_DELAY_MS", "0");
        config.apply_env_overrides();
        clear_env_vars();
        assert_eq!(config.pipeline.restart_delay_ms, 0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_backoff_cap_never_below_base_delay() {
        let mut config = Config::default();
        config.pipeline.restart_delay_ms = 10_000;
        config.pipeline.max_restart_delay_ms = Some(5_000);
        assert_eq!(config.pipeline.restart_delay_cap_ms(), 10_000);

        config.pipeline.max_restart_delay_ms = Some(40_000);
        assert_eq!(config.pipeline.restart_delay_cap_ms(), 40_000);
    }

    #[test]
    fn test_with_port() {
        assert_eq!(with_port("0.0.0.0:8000", 9000), "0.0.0.0:9000");
        assert_eq!(with_port("localhost", 8080), "localhost:8080");
    }
}
