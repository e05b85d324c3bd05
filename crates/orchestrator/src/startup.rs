//! Startup checks
//!
//! Finds ffmpeg and ffprobe and makes sure the encoders we need are compiled
//! in. Any failure here stops the run before a single file is touched.

use crate::config::Config;
use crate::encode::AudioEncoder;
use log::{debug, info};
use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Video encoder every run requires
pub const VIDEO_ENCODER: &str = "libsvtav1";

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not found: {0}")]
    FfmpegNotFound(String),

    #[error("ffmpeg is not usable: {0}")]
    FfmpegBroken(String),

    #[error("ffprobe not found next to {} or in PATH", .0.display())]
    FfprobeNotFound(PathBuf),

    #[error("ffmpeg was built without {0}")]
    MissingEncoder(&'static str),

    #[error("ffmpeg has neither libopus nor aac")]
    NoAudioEncoder,

    #[error("cannot create temp directory {}: {source}", .path.display())]
    TempRoot {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// External tools a run works with
#[derive(Debug, Clone, PartialEq)]
pub struct Toolchain {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// Version as printed by `ffmpeg -version`, `n` prefix removed
    pub version: Option<String>,
    pub audio_encoder: AudioEncoder,
}

/// Search `path_var` (a `PATH`-style list) for an executable named `name`
pub fn find_in_path(name: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    let path_var = path_var?;
    env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Resolve the ffmpeg binary
///
/// Order: explicit path, the `FFMPEG` environment variable, then `PATH`.
///
/// # Arguments
/// * `explicit` - `paths.ffmpeg` from the configuration
/// * `env_ffmpeg` - Value of `FFMPEG`
/// * `path_var` - Value of `PATH`
pub fn locate_ffmpeg(
    explicit: Option<&Path>,
    env_ffmpeg: Option<OsString>,
    path_var: Option<&OsStr>,
) -> Result<PathBuf, StartupError> {
    if let Some(path) = explicit {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(StartupError::FfmpegNotFound(format!(
                "{} does not exist",
                path.display()
            )))
        };
    }

    if let Some(value) = env_ffmpeg.filter(|v| !v.is_empty()) {
        let path = PathBuf::from(&value);
        if path.is_file() {
            return Ok(path);
        }
        // FFMPEG may also name a binary to look up
        if let Some(found) = path.to_str().and_then(|name| find_in_path(name, path_var)) {
            return Ok(found);
        }
        return Err(StartupError::FfmpegNotFound(format!(
            "FFMPEG points to {}, which does not exist",
            path.display()
        )));
    }

    find_in_path("ffmpeg", path_var).ok_or_else(|| {
        StartupError::FfmpegNotFound("not in PATH; install ffmpeg or pass --ffmpeg".to_string())
    })
}

/// ffprobe next to ffmpeg, else on `PATH`
pub fn locate_ffprobe(ffmpeg: &Path, path_var: Option<&OsStr>) -> Result<PathBuf, StartupError> {
    let sibling_name = match ffmpeg.extension() {
        Some(ext) => format!("ffprobe.{}", ext.to_string_lossy()),
        None => "ffprobe".to_string(),
    };
    if let Some(dir) = ffmpeg.parent() {
        let sibling = dir.join(&sibling_name);
        if sibling.is_file() {
            return Ok(sibling);
        }
    }
    find_in_path("ffprobe", path_var).ok_or_else(|| StartupError::FfprobeNotFound(ffmpeg.to_path_buf()))
}

/// Parse the version token of `ffmpeg -version`
///
/// Handles release builds (`ffmpeg version 7.1`), git builds
/// (`ffmpeg version n7.1-3-g1234`) and snapshots (`ffmpeg version N-112233-gabc`).
pub fn parse_ffmpeg_version(version_output: &str) -> Option<String> {
    let line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;
    let mut tokens = line.split_whitespace();
    tokens.find(|t| t.eq_ignore_ascii_case("version"))?;
    let token = tokens.next()?;

    match token.strip_prefix('n') {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => Some(rest.to_string()),
        _ => Some(token.to_string()),
    }
}

/// Major version of a parsed version string, `None` for snapshot builds
pub fn ffmpeg_major_version(version: &str) -> Option<u32> {
    version.split(['.', '-']).next()?.parse().ok()
}

/// Encoder names listed by `ffmpeg -encoders`
pub fn parse_encoders(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("------"))
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _flags = fields.next()?;
            fields.next().map(String::from)
        })
        .collect()
}

/// libopus when available, aac otherwise
pub fn select_audio_encoder(encoders: &[String]) -> Option<AudioEncoder> {
    if encoders.iter().any(|e| e == "libopus") {
        Some(AudioEncoder::Opus)
    } else if encoders.iter().any(|e| e == "aac") {
        Some(AudioEncoder::Aac)
    } else {
        None
    }
}

fn run_ffmpeg(ffmpeg: &Path, args: &[&str]) -> Result<String, StartupError> {
    let output = Command::new(ffmpeg).args(args).output().map_err(|e| {
        StartupError::FfmpegBroken(format!("failed to run {}: {}", ffmpeg.display(), e))
    })?;
    if !output.status.success() {
        return Err(StartupError::FfmpegBroken(format!(
            "{} {} exited with {}",
            ffmpeg.display(),
            args.join(" "),
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run all startup checks in order
///
/// 1. Locate ffmpeg and run `-version`
/// 2. Locate ffprobe
/// 3. Require libsvtav1 and an audio encoder
/// 4. Create the temp root
pub fn run_startup_checks(cfg: &Config) -> Result<Toolchain, StartupError> {
    let path_var = env::var_os("PATH");
    let ffmpeg = locate_ffmpeg(
        cfg.paths.ffmpeg.as_deref(),
        env::var_os("FFMPEG"),
        path_var.as_deref(),
    )?;

    let version_output = run_ffmpeg(&ffmpeg, &["-hide_banner", "-version"])
        .or_else(|_| run_ffmpeg(&ffmpeg, &["-version"]))?;
    let version = parse_ffmpeg_version(&version_output);
    info!(
        "Using ffmpeg {} at {}",
        version.as_deref().unwrap_or("(unknown version)"),
        ffmpeg.display()
    );

    let ffprobe = locate_ffprobe(&ffmpeg, path_var.as_deref())?;
    debug!("Using ffprobe at {}", ffprobe.display());

    let encoders = parse_encoders(&run_ffmpeg(&ffmpeg, &["-hide_banner", "-encoders"])?);
    if !encoders.iter().any(|e| e == VIDEO_ENCODER) {
        return Err(StartupError::MissingEncoder(VIDEO_ENCODER));
    }
    let audio_encoder = select_audio_encoder(&encoders).ok_or(StartupError::NoAudioEncoder)?;
    debug!("Audio encoder: {}", audio_encoder.codec_name());

    fs::create_dir_all(&cfg.paths.temp_root).map_err(|e| StartupError::TempRoot {
        path: cfg.paths.temp_root.clone(),
        source: e,
    })?;

    Ok(Toolchain {
        ffmpeg,
        ffprobe,
        version,
        audio_encoder,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    const ENCODERS: &str = "Encoders:
 V..... = Video
 A..... = Audio
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V..... libsvtav1            SVT-AV1(Scalable Video Technology for AV1) encoder (codec av1)
 A....D aac                  AAC (Advanced Audio Coding)
 S..... srt                  SubRip subtitle (codec subrip)
";

    #[test]
    fn test_parse_ffmpeg_version_formats() {
        assert_eq!(
            parse_ffmpeg_version("ffmpeg version 7.1 Copyright (c) 2000-2024"),
            Some("7.1".to_string())
        );
        assert_eq!(
            parse_ffmpeg_version("ffmpeg version n8.0-3-g1234abcd Copyright"),
            Some("8.0-3-g1234abcd".to_string())
        );
        assert_eq!(
            parse_ffmpeg_version("ffmpeg version N-112233-gabcdef Copyright"),
            Some("N-112233-gabcdef".to_string())
        );
        assert_eq!(
            parse_ffmpeg_version("built with gcc\nffmpeg version 6.1.1-3ubuntu5 Copyright"),
            Some("6.1.1-3ubuntu5".to_string())
        );
        assert_eq!(parse_ffmpeg_version("not ffmpeg"), None);
    }

    #[test]
    fn test_major_version() {
        assert_eq!(ffmpeg_major_version("7.1"), Some(7));
        assert_eq!(ffmpeg_major_version("8.0-3-g1234"), Some(8));
        assert_eq!(ffmpeg_major_version("N-112233-gabcdef"), None);
    }

    #[test]
    fn test_parse_encoders() {
        let encoders = parse_encoders(ENCODERS);
        assert_eq!(encoders, vec!["libx264", "libsvtav1", "aac", "srt"]);
    }

    #[test]
    fn test_audio_encoder_preference() {
        let with_opus = vec!["aac".to_string(), "libopus".to_string()];
        assert_eq!(select_audio_encoder(&with_opus), Some(AudioEncoder::Opus));
        assert_eq!(select_audio_encoder(&parse_encoders(ENCODERS)), Some(AudioEncoder::Aac));
        assert_eq!(select_audio_encoder(&["libx264".to_string()]), None);
    }

    #[test]
    fn test_locate_ffmpeg_order() {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir(&bin).unwrap();
        let on_path = bin.join("ffmpeg");
        fs::write(&on_path, b"").unwrap();
        let custom = dir.path().join("my-ffmpeg");
        fs::write(&custom, b"").unwrap();
        let path_var = env::join_paths([&bin]).unwrap();

        // explicit wins
        assert_eq!(
            locate_ffmpeg(Some(&custom), None, Some(path_var.as_os_str())).unwrap(),
            custom
        );
        // then FFMPEG
        assert_eq!(
            locate_ffmpeg(None, Some(custom.clone().into_os_string()), Some(path_var.as_os_str())).unwrap(),
            custom
        );
        // then PATH
        assert_eq!(locate_ffmpeg(None, None, Some(path_var.as_os_str())).unwrap(), on_path);
    }

    #[test]
    fn test_locate_ffmpeg_failures() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("ffmpeg");
        let err = locate_ffmpeg(Some(&missing), None, None).unwrap_err();
        assert!(matches!(err, StartupError::FfmpegNotFound(_)));

        let empty_path = env::join_paths([dir.path()]).unwrap();
        assert!(locate_ffmpeg(None, None, Some(empty_path.as_os_str())).is_err());
        assert!(locate_ffmpeg(None, Some(missing.into_os_string()), Some(empty_path.as_os_str())).is_err());
    }

    #[test]
    fn test_locate_ffprobe_prefers_sibling() {
        let dir = TempDir::new().unwrap();
        let ffmpeg = dir.path().join("ffmpeg");
        let ffprobe = dir.path().join("ffprobe");
        fs::write(&ffmpeg, b"").unwrap();
        assert!(matches!(
            locate_ffprobe(&ffmpeg, None),
            Err(StartupError::FfprobeNotFound(_))
        ));
        fs::write(&ffprobe, b"").unwrap();
        assert_eq!(locate_ffprobe(&ffmpeg, None).unwrap(), ffprobe);
    }

    #[test]
    fn test_missing_ffmpeg_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.paths.ffmpeg = Some(dir.path().join("missing-ffmpeg"));
        assert!(matches!(
            run_startup_checks(&cfg),
            Err(StartupError::FfmpegNotFound(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_version_round_trip(major in 1u32..20, minor in 0u32..10, n_prefix in proptest::bool::ANY) {
            let prefix = if n_prefix { "n" } else { "" };
            let output = format!("ffmpeg version {}{}.{} Copyright (c) 2000-2024", prefix, major, minor);
            let version = parse_ffmpeg_version(&output).unwrap();
            prop_assert_eq!(version.clone(), format!("{}.{}", major, minor));
            prop_assert_eq!(ffmpeg_major_version(&version), Some(major));
        }
    }
}
