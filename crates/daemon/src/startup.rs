//! Startup checks module for tierstream
//!
//! Preflight checks run before any pipeline is launched:
//! - FFmpeg availability and version
//! - Looping source file present
//! - Output root creatable

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Oldest ffmpeg release whose HLS muxer supports every flag the pipelines use
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("FFmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("Source video not found: {0}")]
    SourceMissing(String),

    #[error("Output root unusable: {0}")]
    OutputRoot(String),
}

/// Parse FFmpeg version output and extract the major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version = ffmpeg_version_token(version_output)?;
    let version_str = version.trim_start_matches('n');

    // Major version sits before the first '.' or '-'
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;
    major_str.parse().ok()
}

/// The raw version token following "ffmpeg version"
fn ffmpeg_version_token(version_output: &str) -> Option<String> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    Some(
        version_line
            .to_lowercase()
            .split("ffmpeg version")
            .nth(1)?
            .split_whitespace()
            .next()?
            .to_string(),
    )
}

/// Run `<ffmpeg> -version` and check the release is recent enough
///
/// Returns the reported version token for logging.
pub fn check_ffmpeg(program: &str) -> Result<String, StartupError> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::FfmpegUnavailable(format!(
                "{} -version failed; is ffmpeg installed and in PATH? Error: {}",
                program, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnavailable(format!(
            "{} -version exited with {}",
            program, output.status
        )));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major = parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major < MIN_FFMPEG_MAJOR {
        return Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major
        )));
    }

    Ok(ffmpeg_version_token(&version_output).unwrap_or_else(|| major.to_string()))
}

/// The looping source must be an existing regular file
pub fn check_source(source: &Path) -> Result<(), StartupError> {
    if source.is_file() {
        Ok(())
    } else {
        Err(StartupError::SourceMissing(source.display().to_string()))
    }
}

pub fn check_output_root(root: &Path) -> Result<(), StartupError> {
    std::fs::create_dir_all(root)
        .map_err(|e| StartupError::OutputRoot(format!("{}: {}", root.display(), e)))
}

/// Run all startup checks in order
///
/// 1. FFmpeg version
/// 2. Source file
/// 3. Output root
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let version = check_ffmpeg(&cfg.encoder.ffmpeg_path)?;
    info!(ffmpeg = %cfg.encoder.ffmpeg_path, %version, "ffmpeg available");
    check_source(&cfg.encoder.source)?;
    check_output_root(&cfg.encoder.output_root)?;
    Ok(())
}
