//! Encoder invocation for tierstream pipelines

pub mod ffmpeg;

pub use ffmpeg::{build_ffmpeg_command, FfmpegHlsParams, SEGMENT_FILE_PATTERN};
