//! Post-encode safety net
//!
//! An encode is only kept when it actually shrank the file, unless larger
//! outputs are explicitly allowed. Accepted outputs are installed next to the
//! source as `<stem>.av1.mkv` (or `<stem>.<ext>.av1.mkv` when another source
//! with the same stem got there first); the source is removed only after that.
//! An existing file is never overwritten.

use crate::probe::VideoInfo;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Suffix of installed outputs
pub const OUTPUT_SUFFIX: &str = ".av1.mkv";

/// Errors while installing an accepted output.
#[derive(Debug, Error)]
pub enum SafetyError {
    /// Could not move or copy the encode next to the source.
    #[error("failed to install {}: {source}", .target.display())]
    Install {
        target: PathBuf,
        source: std::io::Error,
    },

    /// The output is in place but the source could not be removed.
    #[error("failed to remove source {}: {source}", .path.display())]
    RemoveSource {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A conversion that was thrown away because it did not save space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReversionRecord {
    pub path: PathBuf,
    /// Source video codec
    pub codec: String,
    /// Estimated source bitrate in bits/s, from size and duration
    pub estimated_bitrate_bps: Option<u64>,
    pub original_bytes: u64,
    pub encoded_bytes: u64,
}

impl ReversionRecord {
    /// How much larger the encode was, in percent of the original
    pub fn growth_percent(&self) -> f64 {
        if self.original_bytes == 0 {
            return 0.0;
        }
        (self.encoded_bytes as f64 - self.original_bytes as f64) / self.original_bytes as f64 * 100.0
    }
}

/// Pure size decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeDecision {
    /// Keep the encode; savings may be negative when larger files are allowed
    Keep { saved_bytes: i64 },
    /// Encode is not smaller; discard it
    Revert,
    /// Encode is missing or empty
    Invalid,
}

/// Outcome of [`evaluate`]
#[derive(Debug, Clone, PartialEq)]
pub enum SafetyVerdict {
    Accept { saved_bytes: i64 },
    Revert(ReversionRecord),
    Invalid,
}

/// Compare sizes without touching the file system
///
/// # Arguments
/// * `original_bytes` - Size of the source
/// * `encoded_bytes` - Size of the encode, `None` when it does not exist
/// * `allow_larger` - Keep encodes that are not smaller
pub fn check_sizes(original_bytes: u64, encoded_bytes: Option<u64>, allow_larger: bool) -> SizeDecision {
    let encoded = match encoded_bytes {
        Some(0) | None => return SizeDecision::Invalid,
        Some(bytes) => bytes,
    };

    if encoded >= original_bytes && !allow_larger {
        return SizeDecision::Revert;
    }

    let saved_bytes = original_bytes as i128 - encoded as i128;
    SizeDecision::Keep {
        saved_bytes: saved_bytes.clamp(i64::MIN as i128, i64::MAX as i128) as i64,
    }
}

/// Check an encode against its source
///
/// On [`SafetyVerdict::Revert`] and [`SafetyVerdict::Invalid`] the encoded
/// artifact is deleted; the source is never modified here.
///
/// # Arguments
/// * `original` - Probe result of the source
/// * `encoded` - Path of the finished encode
/// * `allow_larger` - Keep encodes that are not smaller
pub fn evaluate(original: &VideoInfo, encoded: &Path, allow_larger: bool) -> SafetyVerdict {
    let original_bytes = fs::metadata(&original.path)
        .map(|m| m.len())
        .unwrap_or(original.size_bytes);
    let encoded_bytes = fs::metadata(encoded).ok().map(|m| m.len());

    match check_sizes(original_bytes, encoded_bytes, allow_larger) {
        SizeDecision::Keep { saved_bytes } => SafetyVerdict::Accept { saved_bytes },
        SizeDecision::Revert => {
            discard(encoded);
            SafetyVerdict::Revert(ReversionRecord {
                path: original.path.clone(),
                codec: original.codec_name.clone(),
                estimated_bitrate_bps: original.estimated_bitrate_bps(),
                original_bytes,
                encoded_bytes: encoded_bytes.unwrap_or(0),
            })
        }
        SizeDecision::Invalid => {
            discard(encoded);
            SafetyVerdict::Invalid
        }
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove rejected encode {}: {}", path.display(), e);
        }
    }
}

/// `<dir>/<stem>.av1.mkv` for a source file
pub fn output_path_for(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    source.with_file_name(format!("{}{}", stem, OUTPUT_SUFFIX))
}

/// Target names for a source, in order of preference
///
/// `movie.mkv` and `movie.mp4` share the first name; the second keeps the
/// source extension to tell them apart.
pub fn output_candidates(source: &Path) -> Vec<PathBuf> {
    let primary = output_path_for(source);
    let mut candidates = vec![primary.clone()];
    if source.extension().is_some() {
        if let Some(name) = source.file_name() {
            let qualified =
                source.with_file_name(format!("{}{}", name.to_string_lossy(), OUTPUT_SUFFIX));
            if qualified != primary {
                candidates.push(qualified);
            }
        }
    }
    candidates
}

/// Claim the first free target name by creating it exclusively
fn reserve_target(source: &Path) -> Result<PathBuf, SafetyError> {
    let candidates = output_candidates(source);
    for candidate in &candidates {
        match OpenOptions::new().write(true).create_new(true).open(candidate) {
            Ok(_) => return Ok(candidate.clone()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!("{} already exists", candidate.display());
            }
            Err(e) => {
                return Err(SafetyError::Install {
                    target: candidate.clone(),
                    source: e,
                })
            }
        }
    }
    Err(SafetyError::Install {
        target: output_path_for(source),
        source: io::Error::new(
            io::ErrorKind::AlreadyExists,
            "every output name for this source is taken",
        ),
    })
}

/// Move an accepted encode next to its source.
///
/// The target is reserved with an exclusive create, so two jobs never
/// install to the same name and an existing output is left alone. Rename
/// first; fall back to copy and delete when the temp directory lives on
/// another file system.
pub fn install_output(encoded: &Path, source: &Path) -> Result<PathBuf, SafetyError> {
    let target = reserve_target(source)?;

    if fs::rename(encoded, &target).is_err() {
        debug!("rename failed, copying {} to {}", encoded.display(), target.display());
        if let Err(e) = fs::copy(encoded, &target) {
            let _ = fs::remove_file(&target);
            return Err(SafetyError::Install { target, source: e });
        }
        let _ = fs::remove_file(encoded);
    }

    Ok(target)
}

/// Delete the source of an installed encode.
pub fn remove_source(source: &Path) -> Result<(), SafetyError> {
    fs::remove_file(source).map_err(|e| SafetyError::RemoveSource {
        path: source.to_path_buf(),
        source: e,
    })
}
