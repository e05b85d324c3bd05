//! Encoding modules for av1conv

pub mod ffmpeg;
pub mod progress;

pub use ffmpeg::{
    build_ffmpeg_args, run_transcode, AudioEncoder, EncodeError, FfmpegTranscoder, StreamMapping,
    SubtitleMode, TranscodeRequest, Transcoder, TERMINATE_GRACE,
};
pub use progress::{ProgressParser, ProgressSample};
