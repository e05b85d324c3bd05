//! Candidate discovery
//!
//! Recursively walks the target directory for video files, filtering by
//! extension, size threshold and ignore terms. Files this tool produced
//! (`*.av1.mkv`) are never picked up again.

use crate::config::{Config, ConfigError};
use crate::safety::OUTPUT_SUFFIX;
use log::debug;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Video file extensions picked up by the scanner (case-insensitive).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "mov", "avi", "ts", "m2ts", "wmv", "flv", "mpg", "mpeg", "vob", "mxf", "webm",
    "3gp", "asf", "rm", "rmvb", "m4v",
];

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("{} does not exist", .0.display())]
    NotFound(PathBuf),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Filters applied while scanning
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    /// Files smaller than this are skipped unless `force` is set
    pub min_size_bytes: u64,
    pub force: bool,
    /// Case-insensitive substrings of file names to skip
    pub ignore_terms: Vec<String>,
}

impl ScanOptions {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            min_size_bytes: config.size_threshold_bytes()?,
            force: config.files.force,
            ignore_terms: config.ignore_terms(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanCandidate {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Candidates plus what was filtered out
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    /// Sorted by path
    pub candidates: Vec<ScanCandidate>,
    pub below_threshold: usize,
    pub ignored: usize,
    pub existing_outputs: usize,
}

impl ScanReport {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.candidates.iter().map(|c| c.path.clone()).collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.candidates.iter().map(|c| c.size_bytes).sum()
    }
}

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            VIDEO_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// True for outputs written by a previous run
pub fn is_converted_output(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_ascii_lowercase().ends_with(OUTPUT_SUFFIX))
        .unwrap_or(false)
}

/// First ignore term found in the file name, if any
pub fn matching_ignore_term<'a>(path: &Path, terms: &'a [String]) -> Option<&'a str> {
    let name = path.file_name()?.to_string_lossy().to_lowercase();
    terms
        .iter()
        .map(String::as_str)
        .find(|term| name.contains(&term.to_lowercase()))
}

/// Scan a directory, or accept a single file.
///
/// A single file only has to be a video file that is not already an output;
/// size and ignore filters apply to directory scans.
pub fn scan(target: &Path, opts: &ScanOptions) -> Result<ScanReport, ScanError> {
    if !target.exists() {
        return Err(ScanError::NotFound(target.to_path_buf()));
    }

    let mut report = ScanReport::default();

    if target.is_file() {
        if is_video_file(target) && !is_converted_output(target) {
            let size_bytes = target.metadata().map(|m| m.len()).unwrap_or(0);
            report.candidates.push(ScanCandidate {
                path: target.to_path_buf(),
                size_bytes,
            });
        }
        return Ok(report);
    }

    let walker = WalkDir::new(target).into_iter().filter_entry(|entry| {
        // hidden directories, but never the root itself
        !(entry.file_type().is_dir()
            && entry.depth() > 0
            && entry.file_name().to_string_lossy().starts_with('.'))
    });

    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !is_video_file(path) {
            continue;
        }
        if is_converted_output(path) {
            report.existing_outputs += 1;
            continue;
        }
        if let Some(term) = matching_ignore_term(path, &opts.ignore_terms) {
            debug!("Ignoring {} (matches '{}')", path.display(), term);
            report.ignored += 1;
            continue;
        }

        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let size_bytes = metadata.len();
        if size_bytes < opts.min_size_bytes && !opts.force {
            report.below_threshold += 1;
            continue;
        }

        report.candidates.push(ScanCandidate {
            path: path.to_path_buf(),
            size_bytes,
        });
    }

    report.candidates.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn opts(min: u64) -> ScanOptions {
        ScanOptions {
            min_size_bytes: min,
            force: false,
            ignore_terms: vec!["CAM".into(), "WORKPRINT".into(), "TELESYNC".into()],
        }
    }

    fn touch(dir: &Path, rel: &str, len: usize) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, vec![0u8; len]).unwrap();
        path
    }

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file(Path::new("/media/movie.mkv")));
        assert!(is_video_file(Path::new("/media/movie.MKV")));
        assert!(is_video_file(Path::new("/media/old.RMVB")));
        assert!(is_video_file(Path::new("/media/clip.3gp")));
        assert!(!is_video_file(Path::new("/media/movie.srt")));
        assert!(!is_video_file(Path::new("/media/movie")));
    }

    #[test]
    fn test_converted_outputs_detected() {
        assert!(is_converted_output(Path::new("/m/Film.av1.mkv")));
        assert!(is_converted_output(Path::new("/m/Film.AV1.MKV")));
        assert!(!is_converted_output(Path::new("/m/Film.mkv")));
        assert!(!is_converted_output(Path::new("/m/av1.mkv.mp4")));
    }

    #[test]
    fn test_ignore_terms_case_insensitive() {
        let terms = vec!["CAM".to_string()];
        assert_eq!(
            matching_ignore_term(Path::new("/m/Movie.2023.cam.mkv"), &terms),
            Some("CAM")
        );
        assert_eq!(matching_ignore_term(Path::new("/m/Movie.mkv"), &terms), None);
    }

    #[test]
    fn test_scan_directory_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch(root, "b/Second.mkv", 200);
        touch(root, "a/First.mp4", 200);
        touch(root, "a/First.av1.mkv", 200);
        touch(root, "Tiny.mkv", 10);
        touch(root, "Movie.TELESYNC.avi", 200);
        touch(root, ".hidden/Secret.mkv", 200);
        touch(root, "notes.txt", 200);

        let report = scan(root, &opts(100)).unwrap();
        let names: Vec<String> = report
            .candidates
            .iter()
            .map(|c| c.path.strip_prefix(root).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a/First.mp4", "b/Second.mkv"]);
        assert_eq!(report.below_threshold, 1);
        assert_eq!(report.ignored, 1);
        assert_eq!(report.existing_outputs, 1);
        assert_eq!(report.total_bytes(), 400);
    }

    #[test]
    fn test_force_includes_small_files() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "Tiny.mkv", 10);
        let report = scan(dir.path(), &ScanOptions { force: true, ..opts(100) }).unwrap();
        assert_eq!(report.candidates.len(), 1);
    }

    #[test]
    fn test_single_file_target() {
        let dir = TempDir::new().unwrap();
        let file = touch(dir.path(), "Clip.mov", 1);
        let report = scan(&file, &opts(1_000_000)).unwrap();
        assert_eq!(report.paths(), vec![file]);

        let output = touch(dir.path(), "Clip.av1.mkv", 1);
        assert!(scan(&output, &opts(0)).unwrap().candidates.is_empty());
    }

    #[test]
    fn test_missing_target() {
        let dir = TempDir::new().unwrap();
        let err = scan(&dir.path().join("nope"), &opts(0)).unwrap_err();
        assert!(matches!(err, ScanError::NotFound(_)));
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.files.extra_ignore_terms = vec!["SAMPLE".into()];
        let opts = ScanOptions::from_config(&config).unwrap();
        assert_eq!(opts.min_size_bytes, 1024 * 1024 * 1024);
        assert!(opts.ignore_terms.contains(&"SAMPLE".to_string()));
        assert!(opts.ignore_terms.contains(&"CAM".to_string()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_extension_case_insensitive(
            name in "[a-zA-Z0-9_]{1,20}",
            ext_idx in 0usize..VIDEO_EXTENSIONS.len(),
            upper in proptest::bool::ANY,
        ) {
            let ext = VIDEO_EXTENSIONS[ext_idx];
            let ext = if upper { ext.to_uppercase() } else { ext.to_string() };
            let path = PathBuf::from(format!("/media/{}.{}", name, ext));
            prop_assert!(is_video_file(&path));
        }
    }
}
