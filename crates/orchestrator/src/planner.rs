//! Encode planning.
//!
//! [`plan`] turns probed metadata, a content label and the configuration into
//! a fully resolved [`EncodePlan`], or a [`PlanSkip`] when the file must not be
//! transcoded. Planning is pure: the same inputs always give the same plan.
//!
//! Rules, in priority order:
//! 1. CRF is only ever lowered toward the label target.
//! 2. Animation may move to a faster preset, film to a slower one, TV is forced
//!    to its preset; TV at preset 7 or higher gets its grain scaled down.
//! 3. Grain is clamped to 0..=50; any grain disables fast-decode, tiling and denoising.
//! 4. Dolby Vision 7/8 with an HDR10 compatible base layer is encoded as HDR10
//!    with the RPU stripped; everything else Dolby Vision is skipped.
//! 5. Pixel format follows the source bit depth.
//! 6. Known color metadata passes through; HDR gaps are filled with BT.2020 PQ/HLG.
//! 7. HDR above 1080 lines gets a shorter lookahead and no overlays.

use crate::classify::{ContentKind, ContentLabel};
use crate::config::Config;
use crate::probe::{HdrKind, VideoInfo};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for synthetic grain strength.
pub const MAX_GRAIN: u8 = 50;

/// Lookahead used for HDR sources taller than 1080 lines.
pub const UHD_HDR_LOOKAHEAD: u32 = 16;

/// Dolby Vision base layer compatibility ids that are plain HDR10 underneath.
const HDR10_COMPATIBLE_BL: &[u8] = &[1, 6];

/// Why a file is not transcoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanSkip {
    #[error("source is already AV1")]
    AlreadyAv1,

    #[error("Dolby Vision sources are disabled by configuration")]
    DolbyVisionDisabled,

    #[error("Dolby Vision profile {profile:?} with base layer compatibility {bl_compat_id:?} cannot be converted")]
    DolbyVisionUnsupported {
        profile: Option<u8>,
        bl_compat_id: Option<u8>,
    },
}

impl PlanSkip {
    pub fn is_dolby_vision(&self) -> bool {
        matches!(
            self,
            PlanSkip::DolbyVisionDisabled | PlanSkip::DolbyVisionUnsupported { .. }
        )
    }
}

/// Output pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Yuv420p,
    Yuv420p10le,
}

impl PixelFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Yuv420p10le => "yuv420p10le",
        }
    }
}

/// Color description stamped on the output. `None` fields are left to the encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ColorMetadata {
    pub primaries: Option<String>,
    pub transfer: Option<String>,
    pub space: Option<String>,
    pub range: Option<String>,
}

/// Fully resolved encoder settings for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodePlan {
    pub crf: u8,
    pub preset: i8,
    /// 0 leaves the keyframe interval to the encoder
    pub gop: u32,
    pub pix_fmt: PixelFormat,
    pub grain: u8,
    pub film_grain_denoise: bool,
    pub tune: u8,
    pub enable_overlays: bool,
    pub fast_decode: u8,
    pub lookahead: u32,
    pub enable_qm: bool,
    pub qm_min: u8,
    pub qm_max: u8,
    pub tile_columns: u8,
    pub aq_mode: u8,
    pub sharpness: i8,
    pub color: ColorMetadata,
    /// HDR signalling of the output; Dolby Vision sources come out as HDR10
    pub hdr: HdrKind,
    pub mastering_display: Option<String>,
    pub content_light: Option<String>,
    pub strip_dolby_vision: bool,
    pub scale_height: Option<u32>,
    pub threads: u32,
    pub label: ContentLabel,
}

impl EncodePlan {
    /// Colon separated `-svtav1-params` value.
    pub fn svt_params(&self) -> String {
        let mut params = vec![
            format!("tune={}", self.tune),
            format!("enable-overlays={}", self.enable_overlays as u8),
            format!("fast-decode={}", self.fast_decode),
            format!("lookahead={}", self.lookahead),
            format!("enable-qm={}", self.enable_qm as u8),
            format!("qm-min={}", self.qm_min),
            format!("qm-max={}", self.qm_max),
            format!("tile-columns={}", self.tile_columns),
            format!("film-grain={}", self.grain),
            format!("film-grain-denoise={}", self.film_grain_denoise as u8),
            format!("aq-mode={}", self.aq_mode),
            format!("sharpness={}", self.sharpness),
        ];
        if self.hdr != HdrKind::None {
            params.push("enable-hdr=1".to_string());
        }
        if let Some(md) = &self.mastering_display {
            params.push(format!("mastering-display={}", md));
        }
        if let Some(cl) = &self.content_light {
            params.push(format!("content-light={}", cl));
        }
        params.join(":")
    }
}

/// Build the encode plan for one file.
///
/// # Arguments
/// * `info` - Probe result of the source
/// * `label` - Content label; use [`ContentLabel::unclassified`] when classification is off
/// * `config` - Validated configuration
/// * `threads` - ffmpeg thread count for this job
///
/// # Returns
/// * `Ok(EncodePlan)` - The file should be transcoded with these settings
/// * `Err(PlanSkip)` - The file must not reach the transcoder
pub fn plan(
    info: &VideoInfo,
    label: &ContentLabel,
    config: &Config,
    threads: u32,
) -> Result<EncodePlan, PlanSkip> {
    let enc = &config.encode;
    let svt = &config.svt;

    if info.is_av1() && !enc.force_reencode {
        return Err(PlanSkip::AlreadyAv1);
    }

    let (hdr, strip_dolby_vision) = resolve_dolby_vision(info, enc.skip_dolby_vision)?;

    let crf = match label.target_crf {
        Some(target) => enc.crf.min(target),
        None => enc.crf,
    };

    let preset = resolve_preset(enc.preset, label);

    let mut grain = label.grain;
    if label.kind == ContentKind::Tv && preset >= 7 {
        grain = scale_tv_grain(grain, preset);
    }
    let grain = grain.min(MAX_GRAIN);

    let (fast_decode, tile_columns, film_grain_denoise) = if grain > 0 {
        (0, 0, false)
    } else {
        (svt.fast_decode, svt.tile_columns, svt.film_grain_denoise)
    };

    let is_hdr = hdr != HdrKind::None;
    let pix_fmt = match info.bit_depth {
        Some(depth) if depth > 8 => PixelFormat::Yuv420p10le,
        Some(_) => PixelFormat::Yuv420p,
        None if is_hdr => PixelFormat::Yuv420p10le,
        None => PixelFormat::Yuv420p,
    };

    let color = resolve_color(info, hdr);

    let (lookahead, enable_overlays) = if is_hdr && info.height > 1080 {
        (svt.lookahead.min(UHD_HDR_LOOKAHEAD), false)
    } else {
        (svt.lookahead, svt.enable_overlays)
    };

    let (mastering_display, content_light) = if is_hdr {
        (
            info.mastering_display.map(|md| md.to_param()),
            info.content_light.map(|cl| cl.to_param()),
        )
    } else {
        (None, None)
    };

    let scale_height = enc.resize_height.filter(|&h| info.height > h);

    Ok(EncodePlan {
        crf,
        preset,
        gop: enc.gop,
        pix_fmt,
        grain,
        film_grain_denoise,
        tune: svt.tune,
        enable_overlays,
        fast_decode,
        lookahead,
        enable_qm: svt.enable_qm,
        qm_min: svt.qm_min,
        qm_max: svt.qm_max,
        tile_columns,
        aq_mode: svt.aq_mode,
        sharpness: svt.sharpness,
        color,
        hdr,
        mastering_display,
        content_light,
        strip_dolby_vision,
        scale_height,
        threads: threads.max(1),
        label: label.clone(),
    })
}

/// Output HDR kind and whether the Dolby Vision RPU must be stripped.
fn resolve_dolby_vision(info: &VideoInfo, skip_dolby_vision: bool) -> Result<(HdrKind, bool), PlanSkip> {
    if info.dolby_vision.is_none() && info.hdr != HdrKind::DolbyVision {
        return Ok((info.hdr, false));
    }
    if skip_dolby_vision {
        return Err(PlanSkip::DolbyVisionDisabled);
    }

    // A codec tag alone carries no profile and is never convertible
    let dv = info.dolby_vision.clone().unwrap_or_default();
    let convertible = matches!(dv.profile, Some(7) | Some(8))
        && dv
            .bl_compat_id
            .map(|id| HDR10_COMPATIBLE_BL.contains(&id))
            .unwrap_or(false);

    if convertible {
        Ok((HdrKind::Hdr10, true))
    } else {
        Err(PlanSkip::DolbyVisionUnsupported {
            profile: dv.profile,
            bl_compat_id: dv.bl_compat_id,
        })
    }
}

fn resolve_preset(configured: i8, label: &ContentLabel) -> i8 {
    let preferred = match label.preferred_preset {
        Some(p) => p,
        None => return configured,
    };
    match label.kind {
        // Higher preset numbers are faster
        ContentKind::Animation if configured < preferred => preferred,
        ContentKind::Film if configured > preferred => preferred,
        ContentKind::Tv => preferred,
        _ => configured,
    }
}

fn scale_tv_grain(grain: u8, preset: i8) -> u8 {
    let factor = if preset >= 8 { 0.70 } else { 0.85 };
    (grain as f64 * factor).round() as u8
}

fn resolve_color(info: &VideoInfo, hdr: HdrKind) -> ColorMetadata {
    if hdr == HdrKind::None {
        return ColorMetadata {
            primaries: info.color_primaries.clone(),
            transfer: info.color_transfer.clone(),
            space: info.color_space.clone(),
            range: info.color_range.clone(),
        };
    }

    let default_transfer = if hdr == HdrKind::Hlg {
        "arib-std-b67"
    } else {
        "smpte2084"
    };
    ColorMetadata {
        primaries: Some(info.color_primaries.clone().unwrap_or_else(|| "bt2020".to_string())),
        transfer: Some(
            info.color_transfer
                .clone()
                .unwrap_or_else(|| default_transfer.to_string()),
        ),
        space: Some(info.color_space.clone().unwrap_or_else(|| "bt2020nc".to_string())),
        range: Some(info.color_range.clone().unwrap_or_else(|| "tv".to_string())),
    }
}
