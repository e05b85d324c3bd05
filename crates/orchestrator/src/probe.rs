//! Media probing via ffprobe.
//!
//! A single ffprobe call collects container, stream and first-frame side data.
//! The result is distilled into a [`VideoInfo`] carrying everything the planner
//! needs: geometry, bit depth, color description, HDR classification, Dolby
//! Vision configuration and HDR10 static metadata already converted to the
//! encoder's integer domain.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Arguments passed to ffprobe before the input path.
///
/// `-read_intervals %+#1` limits frame output to the first packet of each stream,
/// which is where mastering display and content light side data appear.
pub const FFPROBE_ARGS: &[&str] = &[
    "-v",
    "error",
    "-print_format",
    "json",
    "-show_format",
    "-show_streams",
    "-show_frames",
    "-read_intervals",
    "%+#1",
    "-show_entries",
    "frame=media_type,side_data_list",
];

/// Chromaticity coordinates are scaled by this factor for the encoder.
const CHROMA_SCALE: f64 = 50_000.0;
/// Luminance values are scaled by this factor for the encoder.
const LUMINANCE_SCALE: f64 = 10_000.0;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The file could not be analysed: ffprobe missing or failing, unreadable
    /// output, or no video stream.
    #[error("{}: unreadable or corrupt media ({reason})", .path.display())]
    Corrupt { path: PathBuf, reason: String },
}

impl ProbeError {
    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        ProbeError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// HDR classification of the primary video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HdrKind {
    #[default]
    None,
    Hdr10,
    Hlg,
    /// BT.2020 with static metadata but an unrecognised transfer function
    Hdr,
    DolbyVision,
}

impl std::fmt::Display for HdrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HdrKind::None => write!(f, "sdr"),
            HdrKind::Hdr10 => write!(f, "hdr10"),
            HdrKind::Hlg => write!(f, "hlg"),
            HdrKind::Hdr => write!(f, "hdr"),
            HdrKind::DolbyVision => write!(f, "dolby_vision"),
        }
    }
}

/// Dolby Vision configuration record of the video stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DolbyVisionInfo {
    /// `None` when only the codec tag revealed Dolby Vision.
    pub profile: Option<u8>,
    /// Base layer signal compatibility id (1 = HDR10, 2 = SDR, 4 = HLG, 6 = HDR10 UHD-BD).
    pub bl_compat_id: Option<u8>,
    pub el_present: bool,
    pub rpu_present: bool,
}

/// Mastering display color volume in the encoder's integer domain.
///
/// Chromaticities are in units of 1/50000, luminance in units of 1/10000 cd/m².
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasteringDisplay {
    pub green: (u32, u32),
    pub blue: (u32, u32),
    pub red: (u32, u32),
    pub white_point: (u32, u32),
    pub max_luminance: u32,
    pub min_luminance: u32,
}

impl MasteringDisplay {
    /// Render as `G(x,y)B(x,y)R(x,y)WP(x,y)L(max,min)`.
    pub fn to_param(&self) -> String {
        format!(
            "G({},{})B({},{})R({},{})WP({},{})L({},{})",
            self.green.0,
            self.green.1,
            self.blue.0,
            self.blue.1,
            self.red.0,
            self.red.1,
            self.white_point.0,
            self.white_point.1,
            self.max_luminance,
            self.min_luminance
        )
    }
}

/// Content light level (MaxCLL / MaxFALL in cd/m²).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentLight {
    pub max_cll: u32,
    pub max_fall: u32,
}

impl ContentLight {
    pub fn to_param(&self) -> String {
        format!("{},{}", self.max_cll, self.max_fall)
    }
}

/// First audio stream summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub codec_name: String,
    pub profile: Option<String>,
    pub channels: u32,
}

/// Everything known about a source file after one probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub container: String,
    pub codec_name: String,
    pub codec_tag: Option<String>,
    pub width: u32,
    pub height: u32,
    pub pix_fmt: Option<String>,
    /// 8, 10 or 12; `None` when neither the stream nor the pixel format say.
    pub bit_depth: Option<u8>,
    pub color_primaries: Option<String>,
    pub color_transfer: Option<String>,
    pub color_space: Option<String>,
    pub color_range: Option<String>,
    pub frame_rate: Option<f64>,
    pub duration_secs: f64,
    pub audio: Option<AudioInfo>,
    pub subtitle_codecs: Vec<String>,
    pub hdr: HdrKind,
    pub dolby_vision: Option<DolbyVisionInfo>,
    pub mastering_display: Option<MasteringDisplay>,
    pub content_light: Option<ContentLight>,
    /// Container title tag
    pub title: Option<String>,
}

impl VideoInfo {
    /// True for every HDR flavour, Dolby Vision included.
    pub fn is_hdr(&self) -> bool {
        self.hdr != HdrKind::None
    }

    pub fn is_av1(&self) -> bool {
        self.codec_name.eq_ignore_ascii_case("av1")
    }

    /// Average bitrate in bits per second estimated from size and duration.
    pub fn estimated_bitrate_bps(&self) -> Option<u64> {
        if self.duration_secs > 0.0 {
            Some((self.size_bytes as f64 * 8.0 / self.duration_secs) as u64)
        } else {
            None
        }
    }
}

/// Anything able to turn a file path into a [`VideoInfo`].
pub trait MediaProbe: Send + Sync {
    fn probe(&self, path: &Path) -> Result<VideoInfo, ProbeError>;
}

/// [`MediaProbe`] backed by the ffprobe binary.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    binary: PathBuf,
}

impl FfprobeProbe {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl MediaProbe for FfprobeProbe {
    fn probe(&self, path: &Path) -> Result<VideoInfo, ProbeError> {
        let output = Command::new(&self.binary)
            .args(FFPROBE_ARGS)
            .arg(path)
            .output()
            .map_err(|e| ProbeError::corrupt(path, format!("failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::corrupt(
                path,
                format!("ffprobe exited with status {}: {}", output.status, stderr.trim()),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut info = parse_ffprobe_output(path, &stdout)?;
        if let Ok(meta) = std::fs::metadata(path) {
            info.size_bytes = meta.len();
        }
        Ok(info)
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
        pub frames: Option<Vec<Frame>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub codec_tag_string: Option<String>,
        pub profile: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub pix_fmt: Option<String>,
        pub bits_per_raw_sample: Option<String>,
        pub color_primaries: Option<String>,
        pub color_transfer: Option<String>,
        pub color_space: Option<String>,
        pub color_range: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub r_frame_rate: Option<String>,
        pub channels: Option<u32>,
        pub duration: Option<String>,
        pub side_data_list: Option<Vec<serde_json::Value>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub duration: Option<String>,
        pub size: Option<String>,
        pub tags: Option<HashMap<String, String>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Frame {
        pub media_type: Option<String>,
        pub side_data_list: Option<Vec<serde_json::Value>>,
    }
}

/// Parses ffprobe JSON output into a [`VideoInfo`].
///
/// `size_bytes` is taken from the container; callers with file system access
/// overwrite it with the on-disk size.
pub fn parse_ffprobe_output(path: &Path, json_str: &str) -> Result<VideoInfo, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput = serde_json::from_str(json_str)
        .map_err(|e| ProbeError::corrupt(path, format!("invalid ffprobe output: {}", e)))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe
        .format
        .ok_or_else(|| ProbeError::corrupt(path, "missing format information"))?;

    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ProbeError::corrupt(path, "no video stream"))?;

    let audio = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .map(|s| AudioInfo {
            codec_name: s.codec_name.clone().unwrap_or_default(),
            profile: s.profile.clone(),
            channels: s.channels.unwrap_or(0),
        });

    let subtitle_codecs = streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("subtitle"))
        .filter_map(|s| s.codec_name.clone())
        .collect();

    // Side data from the video stream header plus its first decoded frame
    let mut side_data: Vec<&serde_json::Value> = video.side_data_list.iter().flatten().collect();
    for frame in ffprobe.frames.iter().flatten() {
        if frame.media_type.as_deref().unwrap_or("video") == "video" {
            side_data.extend(frame.side_data_list.iter().flatten());
        }
    }

    let codec_tag = video
        .codec_tag_string
        .clone()
        .filter(|t| !t.is_empty() && !t.starts_with("[0]"));

    let mut dolby_vision = side_data
        .iter()
        .find(|sd| side_data_type(sd).contains("dovi configuration"))
        .map(|sd| parse_dovi_record(sd));
    if dolby_vision.is_none() && codec_tag.as_deref().map(is_dolby_vision_tag).unwrap_or(false) {
        dolby_vision = Some(DolbyVisionInfo::default());
    }

    let mastering_display = side_data
        .iter()
        .find(|sd| side_data_type(sd).contains("mastering display"))
        .and_then(|sd| parse_mastering_display(sd));
    let content_light = side_data
        .iter()
        .find(|sd| side_data_type(sd).contains("content light"))
        .and_then(|sd| parse_content_light(sd));

    let hdr = classify_hdr(
        video.color_transfer.as_deref(),
        video.color_primaries.as_deref(),
        dolby_vision.is_some(),
        mastering_display.is_some() || content_light.is_some(),
    );

    let duration_secs = format
        .duration
        .as_deref()
        .or(video.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let size_bytes = format
        .size
        .as_deref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let frame_rate = video
        .avg_frame_rate
        .as_deref()
        .and_then(parse_ratio)
        .or_else(|| video.r_frame_rate.as_deref().and_then(parse_ratio));

    let title = format.tags.as_ref().and_then(|tags| {
        tags.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("title"))
            .map(|(_, v)| v.clone())
    });

    Ok(VideoInfo {
        path: path.to_path_buf(),
        size_bytes,
        container: format.format_name.unwrap_or_default(),
        codec_name: video.codec_name.clone().unwrap_or_default(),
        codec_tag,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        pix_fmt: video.pix_fmt.clone(),
        bit_depth: bit_depth(video.bits_per_raw_sample.as_deref(), video.pix_fmt.as_deref()),
        color_primaries: known(video.color_primaries.as_deref()),
        color_transfer: known(video.color_transfer.as_deref()),
        color_space: known(video.color_space.as_deref()),
        color_range: known(video.color_range.as_deref()),
        frame_rate,
        duration_secs,
        audio,
        subtitle_codecs,
        hdr,
        dolby_vision,
        mastering_display,
        content_light,
        title,
    })
}

/// HDR lookup table.
///
/// Dolby Vision wins over the transfer function; BT.2020 with static
/// metadata but an unknown transfer is reported as generic HDR.
pub fn classify_hdr(
    transfer: Option<&str>,
    primaries: Option<&str>,
    has_dolby_vision: bool,
    has_static_metadata: bool,
) -> HdrKind {
    if has_dolby_vision {
        return HdrKind::DolbyVision;
    }
    match transfer.map(|t| t.to_ascii_lowercase()).as_deref() {
        Some("smpte2084") => HdrKind::Hdr10,
        Some("arib-std-b67") => HdrKind::Hlg,
        _ => {
            let bt2020 = primaries
                .map(|p| p.to_ascii_lowercase().starts_with("bt2020"))
                .unwrap_or(false);
            if bt2020 && has_static_metadata {
                HdrKind::Hdr
            } else {
                HdrKind::None
            }
        }
    }
}

fn is_dolby_vision_tag(tag: &str) -> bool {
    matches!(tag.to_ascii_lowercase().as_str(), "dvh1" | "dvhe" | "dav1")
}

fn known(value: Option<&str>) -> Option<String> {
    value
        .filter(|v| !v.is_empty() && *v != "unknown" && *v != "unspecified")
        .map(str::to_string)
}

/// Bit depth from `bits_per_raw_sample`, falling back to the pixel format name.
pub fn bit_depth(bits_per_raw_sample: Option<&str>, pix_fmt: Option<&str>) -> Option<u8> {
    if let Some(bits) = bits_per_raw_sample.and_then(|b| b.parse::<u8>().ok()) {
        if bits > 0 {
            return Some(bits);
        }
    }
    let fmt = pix_fmt?.to_ascii_lowercase();
    if fmt.contains("p12") || fmt.contains("12le") || fmt.contains("12be") {
        Some(12)
    } else if fmt.contains("p10") || fmt.contains("10le") || fmt.contains("10be") {
        Some(10)
    } else if fmt.starts_with("yuv") || fmt.starts_with("nv12") || fmt.starts_with("gray") {
        Some(8)
    } else {
        None
    }
}

/// Parses `num/den` or a plain number.
fn parse_ratio(s: &str) -> Option<f64> {
    match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => s.trim().parse().ok(),
    }
}

fn side_data_type(sd: &serde_json::Value) -> String {
    sd.get("side_data_type")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn json_number(sd: &serde_json::Value, key: &str) -> Option<f64> {
    match sd.get(key)? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => parse_ratio(s),
        _ => None,
    }
}

fn json_flag(sd: &serde_json::Value, key: &str) -> bool {
    json_number(sd, key).map(|v| v != 0.0).unwrap_or(false)
}

fn parse_dovi_record(sd: &serde_json::Value) -> DolbyVisionInfo {
    DolbyVisionInfo {
        profile: json_number(sd, "dv_profile").map(|v| v as u8),
        bl_compat_id: json_number(sd, "dv_bl_signal_compatibility_id").map(|v| v as u8),
        el_present: json_flag(sd, "el_present_flag"),
        rpu_present: json_flag(sd, "rpu_present_flag"),
    }
}

fn parse_mastering_display(sd: &serde_json::Value) -> Option<MasteringDisplay> {
    let chroma = |key: &str| json_number(sd, key).map(|v| (v * CHROMA_SCALE).round() as u32);
    let luma = |key: &str| json_number(sd, key).map(|v| (v * LUMINANCE_SCALE).round() as u32);

    Some(MasteringDisplay {
        green: (chroma("green_x")?, chroma("green_y")?),
        blue: (chroma("blue_x")?, chroma("blue_y")?),
        red: (chroma("red_x")?, chroma("red_y")?),
        white_point: (chroma("white_point_x")?, chroma("white_point_y")?),
        max_luminance: luma("max_luminance")?,
        min_luminance: luma("min_luminance")?,
    })
}

fn parse_content_light(sd: &serde_json::Value) -> Option<ContentLight> {
    Some(ContentLight {
        max_cll: json_number(sd, "max_content")? as u32,
        max_fall: json_number(sd, "max_average")? as u32,
    })
}
