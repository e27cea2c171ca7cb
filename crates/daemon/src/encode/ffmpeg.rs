//! FFmpeg HLS encoder module for tierstream
//!
//! Builds the ffmpeg command line that turns a looping source file into a rolling
//! HLS window for one tier.

use crate::config::EncoderConfig;
use crate::tiers::{Tier, MANIFEST_FILE_NAME};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Segment naming pattern; the sequence number grows monotonically per run
pub const SEGMENT_FILE_PATTERN: &str = "segment_%05d.ts";

/// Everything needed to launch one tier's encoder
#[derive(Debug, Clone)]
pub struct FfmpegHlsParams {
    /// ffmpeg executable
    pub program: String,
    /// Source file, read in an endless loop
    pub source: PathBuf,
    /// Directory receiving the manifest and segments
    pub output_dir: PathBuf,
    /// Segments retained in the manifest
    pub playlist_size: u32,
    pub audio_bitrate_kbps: u32,
    pub tier: Tier,
}

impl FfmpegHlsParams {
    pub fn new(encoder: &EncoderConfig, tier: &Tier, output_dir: &Path) -> Self {
        Self {
            program: encoder.ffmpeg_path.clone(),
            source: encoder.source.clone(),
            output_dir: output_dir.to_path_buf(),
            playlist_size: encoder.playlist_size,
            audio_bitrate_kbps: encoder.audio_bitrate_kbps,
            tier: tier.clone(),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(MANIFEST_FILE_NAME)
    }

    pub fn segment_pattern(&self) -> PathBuf {
        self.output_dir.join(SEGMENT_FILE_PATTERN)
    }
}

/// Build an ffmpeg command producing a live HLS window for one tier
///
/// Creates a Command configured with:
/// - Endless input looping at native frame rate, with generated timestamps
/// - x264 video at the tier's resolution, bitrate, frame rate, preset, profile and level
/// - A keyframe at every segment boundary (no scene-cut keyframes)
/// - AAC audio
/// - HLS output with a fixed segment duration, bounded window, deletion of
///   rotated-out segments and a deterministic segment filename pattern
pub fn build_ffmpeg_command(params: &FfmpegHlsParams) -> Command {
    let tier = &params.tier;
    let gop = tier.keyframe_interval().to_string();
    let mut cmd = Command::new(&params.program);

    cmd.arg("-hide_banner").arg("-nostats");
    cmd.arg("-loglevel").arg("warning");

    // Looping input, paced in real time, with regenerated timestamps
    cmd.arg("-stream_loop").arg("-1");
    cmd.arg("-re");
    cmd.arg("-fflags").arg("+genpts");
    cmd.arg("-i").arg(&params.source);

    // Video
    cmd.arg("-c:v").arg("libx264");
    cmd.arg("-preset").arg(&tier.preset);
    cmd.arg("-profile:v").arg(&tier.profile);
    cmd.arg("-level:v").arg(&tier.level);
    cmd.arg("-vf")
        .arg(format!("scale={}:{}", tier.width, tier.height));
    cmd.arg("-r").arg(tier.frame_rate.to_string());
    cmd.arg("-b:v").arg(format!("{}k", tier.video_bitrate_kbps));
    cmd.arg("-maxrate").arg(format!("{}k", tier.maxrate_kbps));
    cmd.arg("-bufsize").arg(format!("{}k", tier.bufsize_kbps));
    cmd.arg("-g").arg(&gop);
    cmd.arg("-keyint_min").arg(&gop);
    cmd.arg("-sc_threshold").arg("0");

    // Audio
    cmd.arg("-c:a").arg("aac");
    cmd.arg("-b:a").arg(format!("{}k", params.audio_bitrate_kbps));
    cmd.arg("-ac").arg("2");

    // Rolling HLS window
    cmd.arg("-f").arg("hls");
    cmd.arg("-hls_time").arg(tier.segment_duration_secs.to_string());
    cmd.arg("-hls_list_size").arg(params.playlist_size.to_string());
    cmd.arg("-hls_flags")
        .arg("delete_segments+independent_segments");
    cmd.arg("-hls_segment_filename").arg(params.segment_pattern());
    cmd.arg(params.manifest_path());

    cmd
}
