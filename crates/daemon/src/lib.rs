//! tierstream
//!
//! Live multi-tier HLS orchestrator: keeps one encoder pipeline per quality
//! tier alive, estimates viewer latency from the published manifests, and
//! pushes per-tier metrics to connected observers.

pub mod aggregator;
pub mod daemon;
pub mod encode;
pub mod hub;
pub mod manifest;
pub mod metrics;
pub mod orchestrator;
pub mod process;
pub mod server;
pub mod startup;
pub mod supervisor;
pub mod tiers;
pub mod watcher;

pub use tierstream_config as config;
pub use tierstream_config::Config;
pub use aggregator::MetricsAggregator;
pub use daemon::{shutdown_signal, Daemon, DaemonError};
pub use encode::{build_ffmpeg_command, FfmpegHlsParams};
pub use hub::{BroadcastHub, ClientMessage, ObserverId, ServerMessage};
pub use manifest::{LatencyEstimate, LatencyEstimator, Manifest};
pub use metrics::{MetricsSnapshot, SharedStats, TierSnapshot};
pub use orchestrator::{
    BoundaryUpdate, OrchestratorError, PerformanceReport, StreamOrchestrator, TierRequest,
};
pub use process::{EncodeError, EncoderEvent, EncoderLauncher, EncoderProcess, FfmpegLauncher};
pub use server::{create_router, run_server, ServerError};
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError};
pub use supervisor::{PipelineInfo, PipelineStatus, PipelineSupervisor};
pub use tiers::{Tier, TierCatalog};
pub use watcher::{SegmentEvent, SegmentWatcher, WatchRegistry};
