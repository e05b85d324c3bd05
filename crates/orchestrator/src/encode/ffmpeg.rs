//! ffmpeg/SVT-AV1 transcoding
//!
//! Turns an [`EncodePlan`] into a complete ffmpeg invocation and runs it as a
//! child process, streaming `-progress` samples back to the caller.

use super::progress::{ProgressParser, ProgressSample};
use crate::config::AudioConfig;
use crate::interrupt::RunControl;
use crate::planner::EncodePlan;
use crate::probe::VideoInfo;
use log::debug;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;

/// Time a terminated transcoder gets to exit before it is killed
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Number of stderr lines kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The transcoder could not be started
    #[error("failed to start transcoder: {0}")]
    Spawn(std::io::Error),

    /// The transcoder exited with non-zero status
    #[error("transcoder failed with exit code {code}: {stderr_tail}")]
    Failed { code: i32, stderr_tail: String },

    /// The transcoder was terminated by a signal we did not send
    #[error("transcoder was terminated by signal")]
    Terminated,

    /// The run was aborted and the transcoder stopped
    #[error("transcode aborted")]
    Aborted,

    /// Exit status was zero but the output is missing or empty
    #[error("transcoder produced no output at {}", .0.display())]
    EmptyOutput(PathBuf),

    /// IO error while supervising the transcoder
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio encoder chosen at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoder {
    Opus,
    Aac,
}

impl AudioEncoder {
    pub fn codec_name(&self) -> &'static str {
        match self {
            AudioEncoder::Opus => "libopus",
            AudioEncoder::Aac => "aac",
        }
    }
}

/// How subtitle streams are carried into Matroska
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleMode {
    Copy,
    /// mov_text cannot live in Matroska and is converted to SubRip
    ConvertToSrt,
}

/// Audio and subtitle handling for one file
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMapping {
    pub audio_encoder: AudioEncoder,
    pub stereo: bool,
    pub audio_bitrate: Option<String>,
    pub subtitles: SubtitleMode,
}

impl StreamMapping {
    pub fn for_source(info: &VideoInfo, audio: &AudioConfig, encoder: AudioEncoder) -> Self {
        let subtitles = if info.subtitle_codecs.iter().any(|c| c == "mov_text") {
            SubtitleMode::ConvertToSrt
        } else {
            SubtitleMode::Copy
        };
        Self {
            audio_encoder: encoder,
            stereo: audio.stereo,
            audio_bitrate: audio.bitrate.clone(),
            subtitles,
        }
    }
}

/// Everything needed to build one transcode invocation
#[derive(Debug, Clone)]
pub struct TranscodeRequest<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub plan: &'a EncodePlan,
    pub mapping: &'a StreamMapping,
    pub encoded_by: &'a str,
}

/// Build the full ffmpeg argument list for a request
///
/// Progress is written to stdout as `key=value` blocks; stderr only carries errors.
pub fn build_ffmpeg_args(req: &TranscodeRequest<'_>) -> Vec<OsString> {
    let plan = req.plan;
    let mut args: Vec<OsString> = Vec::new();
    let mut push = |a: &str| args.push(OsString::from(a));

    for a in ["-hide_banner", "-nostdin", "-y", "-loglevel", "error", "-nostats"] {
        push(a);
    }
    push("-progress");
    push("pipe:1");
    push("-i");
    args.push(req.input.as_os_str().to_owned());

    let mut push = |a: &str| args.push(OsString::from(a));
    for a in ["-map", "0:v:0", "-map", "0:a?", "-map", "0:s?", "-map_chapters", "0"] {
        push(a);
    }

    push("-c:v");
    push("libsvtav1");
    push("-preset");
    push(&plan.preset.to_string());
    push("-crf");
    push(&plan.crf.to_string());
    if plan.gop > 0 {
        push("-g");
        push(&plan.gop.to_string());
    }
    push("-pix_fmt");
    push(plan.pix_fmt.as_str());

    if let Some(height) = plan.scale_height {
        push("-vf");
        push(&format!("scale=-2:{}", height));
    }

    let color = &plan.color;
    for (flag, value) in [
        ("-color_primaries", &color.primaries),
        ("-color_trc", &color.transfer),
        ("-colorspace", &color.space),
        ("-color_range", &color.range),
    ] {
        if let Some(v) = value {
            push(flag);
            push(v);
        }
    }

    push("-svtav1-params");
    push(&plan.svt_params());

    if plan.strip_dolby_vision {
        push("-dolbyvision");
        push("0");
    }

    push("-threads");
    push(&plan.threads.to_string());

    let mapping = req.mapping;
    push("-c:a");
    push(mapping.audio_encoder.codec_name());
    if mapping.stereo {
        push("-ac");
        push("2");
    } else if mapping.audio_encoder == AudioEncoder::Opus {
        // libopus rejects side-channel layouts such as 5.1(side)
        push("-af");
        push("aformat=channel_layouts=7.1|5.1|stereo|mono");
    }
    if let Some(bitrate) = &mapping.audio_bitrate {
        push("-b:a");
        push(bitrate);
    }

    push("-c:s");
    push(match mapping.subtitles {
        SubtitleMode::Copy => "copy",
        SubtitleMode::ConvertToSrt => "srt",
    });

    push("-metadata");
    push(&format!("encoded_by={}", req.encoded_by));

    push("-f");
    push("matroska");
    args.push(req.output.as_os_str().to_owned());
    args
}

/// Anything able to produce the command for a transcode
pub trait Transcoder: Send + Sync {
    fn command(&self, req: &TranscodeRequest<'_>) -> Command;
}

/// [`Transcoder`] running ffmpeg with libsvtav1
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

impl Transcoder for FfmpegTranscoder {
    fn command(&self, req: &TranscodeRequest<'_>) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(build_ffmpeg_args(req));
        cmd
    }
}

/// Run a transcode to completion
///
/// The child runs in its own process group so a terminal Ctrl-C reaches only
/// this process. When `control` switches to [`RunControl::Abort`] the child is
/// sent SIGTERM and killed after `grace`.
///
/// # Arguments
/// * `cmd` - Command from a [`Transcoder`]
/// * `duration_secs` - Source duration used for percentages
/// * `control` - Run control channel
/// * `grace` - Time between SIGTERM and kill on abort
/// * `on_progress` - Called for every complete progress block
///
/// # Returns
/// * `Ok(())` - The transcoder exited with status 0
/// * `Err(EncodeError)` - Spawn failure, non-zero exit, signal or abort
pub async fn run_transcode<F>(
    mut cmd: Command,
    duration_secs: f64,
    mut control: watch::Receiver<RunControl>,
    grace: Duration,
    mut on_progress: F,
) -> Result<(), EncodeError>
where
    F: FnMut(ProgressSample),
{
    if *control.borrow() == RunControl::Abort {
        return Err(EncodeError::Aborted);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(EncodeError::Spawn)?;
    debug!("transcoder started with pid {:?}", child.id());

    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        })
    });

    let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
    let mut parser = ProgressParser::new(duration_secs);
    let mut control_open = true;

    let status: ExitStatus = loop {
        tokio::select! {
            line = next_line(&mut stdout), if stdout.is_some() => match line {
                Some(line) => {
                    if let Some(sample) = parser.feed_line(&line) {
                        on_progress(sample);
                    }
                }
                None => stdout = None,
            },
            changed = control.changed(), if control_open => {
                if changed.is_err() {
                    control_open = false;
                } else if *control.borrow() == RunControl::Abort {
                    terminate(&mut child, grace).await;
                    return Err(EncodeError::Aborted);
                }
            },
            status = child.wait() => break status?,
        }
    };

    let stderr_tail = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    if status.success() {
        Ok(())
    } else {
        match status.code() {
            Some(code) => Err(EncodeError::Failed { code, stderr_tail }),
            None => Err(EncodeError::Terminated),
        }
    }
}

async fn next_line(
    lines: &mut Option<tokio::io::Lines<BufReader<ChildStdout>>>,
) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

/// SIGTERM to the whole process group first, kill once `grace` has passed
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child was spawned with `process_group(0)`, so its pid is also its
        // group id and a negative pid reaches every helper it forked.
        // SAFETY: kill(2) on the group of a child we still own and have not reaped
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGTERM) };
        if rc != 0 {
            debug!(
                "SIGTERM to process group {} failed: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}
