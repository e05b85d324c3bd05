//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is outside its accepted range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Core encode settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncodeConfig {
    /// Constant rate factor (0-63, lower is better quality)
    pub crf: u8,
    /// SVT-AV1 preset (-1..=13, lower is slower)
    pub preset: i8,
    /// Keyframe interval in frames (0 = encoder default)
    pub gop: u32,
    /// Number of encodes running at once (1-4)
    pub max_parallel_jobs: u32,
    /// Threads handed to each ffmpeg process (0 = derive from core count)
    pub ffmpeg_threads: u32,
    /// Classify content and adapt grain/CRF/preset to it
    pub detect_grain: bool,
    /// Keep encodes that came out larger than their source
    pub allow_larger_files: bool,
    /// Skip every Dolby Vision source instead of converting profile 7/8
    pub skip_dolby_vision: bool,
    /// Re-encode sources that are already AV1
    pub force_reencode: bool,
    /// Downscale sources taller than this many lines
    pub resize_height: Option<u32>,
    /// Sources shorter than this skip classification
    pub min_classify_duration_secs: u64,
    /// Value written to the `encoded_by` metadata tag
    pub encoded_by: String,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            crf: 28,
            preset: 5,
            gop: 120,
            max_parallel_jobs: 1,
            ffmpeg_threads: 6,
            detect_grain: false,
            allow_larger_files: false,
            skip_dolby_vision: false,
            force_reencode: false,
            resize_height: None,
            min_classify_duration_secs: 30,
            encoded_by: "av1conv".to_string(),
        }
    }
}

/// SVT-AV1 tuning passed through `-svtav1-params`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SvtConfig {
    /// 0 = VQ, 1 = PSNR, 2 = SSIM
    pub tune: u8,
    pub enable_overlays: bool,
    pub fast_decode: u8,
    pub lookahead: u32,
    pub enable_qm: bool,
    pub qm_min: u8,
    pub qm_max: u8,
    /// log2 of the tile column count
    pub tile_columns: u8,
    /// Synthetic grain used when content is not classified
    pub film_grain: u8,
    pub film_grain_denoise: bool,
    pub aq_mode: u8,
    pub sharpness: i8,
}

impl Default for SvtConfig {
    fn default() -> Self {
        Self {
            tune: 1,
            enable_overlays: false,
            fast_decode: 1,
            lookahead: 32,
            enable_qm: true,
            qm_min: 0,
            qm_max: 15,
            tile_columns: 2,
            film_grain: 0,
            film_grain_denoise: false,
            aq_mode: 2,
            sharpness: 0,
        }
    }
}

/// Encode targets for one content label
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelProfile {
    pub crf: u8,
    pub preset: i8,
    pub grain: u8,
}

/// Content classification settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContentConfig {
    /// External classifier executable, called as `<classifier> <file>`
    pub classifier: Option<PathBuf>,
    pub animation: LabelProfile,
    pub film: LabelProfile,
    pub tv: LabelProfile,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            classifier: None,
            animation: LabelProfile {
                crf: 29,
                preset: 6,
                grain: 0,
            },
            film: LabelProfile {
                crf: 22,
                preset: 4,
                grain: 10,
            },
            tv: LabelProfile {
                crf: 26,
                preset: 5,
                grain: 6,
            },
        }
    }
}

/// Candidate file selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilesConfig {
    /// Minimum source size, e.g. "1G" or "500M"
    pub size_threshold: String,
    /// Name fragments that exclude a file (case-insensitive)
    pub ignore_terms: Vec<String>,
    pub extra_ignore_terms: Vec<String>,
    /// Ignore the size threshold
    pub force: bool,
    /// Delete the source once its encode has been accepted
    pub remove_input_file: bool,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            size_threshold: "1G".to_string(),
            ignore_terms: vec![
                "CAM".to_string(),
                "WORKPRINT".to_string(),
                "TELESYNC".to_string(),
            ],
            extra_ignore_terms: Vec::new(),
            force: false,
            remove_input_file: false,
        }
    }
}

/// Audio stream handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AudioConfig {
    /// Downmix to two channels
    pub stereo: bool,
    /// Audio bitrate such as "128k" (encoder default when unset)
    pub bitrate: Option<String>,
}

/// Tool and scratch locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// Explicit ffmpeg binary; `FFMPEG` and `PATH` are searched otherwise
    pub ffmpeg: Option<PathBuf>,
    /// Directory the per-run state directory is created under
    pub temp_root: PathBuf,
    /// Leave the per-run state directory behind at exit
    pub keep_temp: bool,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: None,
            temp_root: env::temp_dir(),
            keep_temp: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encode: EncodeConfig,
    #[serde(default)]
    pub svt: SvtConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - AV1CONV_CRF -> encode.crf
    /// - AV1CONV_PRESET -> encode.preset
    /// - AV1CONV_GOP -> encode.gop
    /// - AV1CONV_PARALLEL_JOBS -> encode.max_parallel_jobs
    /// - AV1CONV_FFMPEG_THREADS -> encode.ffmpeg_threads
    /// - AV1CONV_DETECT_GRAIN -> encode.detect_grain
    /// - AV1CONV_ALLOW_LARGER -> encode.allow_larger_files
    /// - AV1CONV_SIZE_THRESHOLD -> files.size_threshold
    /// - AV1CONV_CLASSIFIER -> content.classifier
    /// - AV1CONV_FFMPEG -> paths.ffmpeg
    /// - AV1CONV_TEMP_ROOT -> paths.temp_root
    ///
    /// A value that does not parse as the field's type is an error; range
    /// checks are left to [`validate`](Self::validate).
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(crf) = env_parse::<u8>("AV1CONV_CRF")? {
            self.encode.crf = crf;
        }
        if let Some(preset) = env_parse::<i8>("AV1CONV_PRESET")? {
            self.encode.preset = preset;
        }
        if let Some(gop) = env_parse::<u32>("AV1CONV_GOP")? {
            self.encode.gop = gop;
        }
        if let Some(jobs) = env_parse::<u32>("AV1CONV_PARALLEL_JOBS")? {
            self.encode.max_parallel_jobs = jobs;
        }
        if let Some(threads) = env_parse::<u32>("AV1CONV_FFMPEG_THREADS")? {
            self.encode.ffmpeg_threads = threads;
        }
        if let Some(flag) = env_bool("AV1CONV_DETECT_GRAIN")? {
            self.encode.detect_grain = flag;
        }
        if let Some(flag) = env_bool("AV1CONV_ALLOW_LARGER")? {
            self.encode.allow_larger_files = flag;
        }
        if let Ok(val) = env::var("AV1CONV_SIZE_THRESHOLD") {
            self.files.size_threshold = val;
        }
        if let Ok(val) = env::var("AV1CONV_CLASSIFIER") {
            self.content.classifier = Some(PathBuf::from(val));
        }
        if let Ok(val) = env::var("AV1CONV_FFMPEG") {
            self.paths.ffmpeg = Some(PathBuf::from(val));
        }
        if let Ok(val) = env::var("AV1CONV_TEMP_ROOT") {
            self.paths.temp_root = PathBuf::from(val);
        }
        Ok(())
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Check every tunable against its accepted range
    ///
    /// Runs before any file is touched; the first violation is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let e = &self.encode;
        check_range("encode.crf", e.crf as i64, 0, 63)?;
        check_range("encode.preset", e.preset as i64, -1, 13)?;
        check_range("encode.gop", e.gop as i64, 0, 500)?;
        check_range("encode.max_parallel_jobs", e.max_parallel_jobs as i64, 1, 4)?;
        check_range("encode.ffmpeg_threads", e.ffmpeg_threads as i64, 0, 256)?;
        if let Some(height) = e.resize_height {
            check_range("encode.resize_height", height as i64, 144, 4320)?;
        }

        let s = &self.svt;
        check_range("svt.tune", s.tune as i64, 0, 2)?;
        check_range("svt.fast_decode", s.fast_decode as i64, 0, 2)?;
        check_range("svt.lookahead", s.lookahead as i64, 0, 120)?;
        check_range("svt.qm_min", s.qm_min as i64, 0, 15)?;
        check_range("svt.qm_max", s.qm_max as i64, 0, 15)?;
        if s.qm_min > s.qm_max {
            return Err(ConfigError::Invalid(format!(
                "svt.qm_min ({}) must not exceed svt.qm_max ({})",
                s.qm_min, s.qm_max
            )));
        }
        check_range("svt.tile_columns", s.tile_columns as i64, 0, 4)?;
        check_range("svt.film_grain", s.film_grain as i64, 0, 50)?;
        check_range("svt.aq_mode", s.aq_mode as i64, 0, 2)?;
        check_range("svt.sharpness", s.sharpness as i64, -7, 7)?;

        for (name, profile) in [
            ("content.animation", &self.content.animation),
            ("content.film", &self.content.film),
            ("content.tv", &self.content.tv),
        ] {
            check_range(&format!("{}.crf", name), profile.crf as i64, 0, 63)?;
            check_range(&format!("{}.preset", name), profile.preset as i64, -1, 13)?;
            check_range(&format!("{}.grain", name), profile.grain as i64, 0, 50)?;
        }

        parse_size(&self.files.size_threshold)?;
        Ok(())
    }

    /// Minimum source size in bytes
    pub fn size_threshold_bytes(&self) -> Result<u64, ConfigError> {
        parse_size(&self.files.size_threshold)
    }

    /// All ignore terms, built-in and extra
    pub fn ignore_terms(&self) -> Vec<String> {
        self.files
            .ignore_terms
            .iter()
            .chain(self.files.extra_ignore_terms.iter())
            .filter(|t| !t.trim().is_empty())
            .cloned()
            .collect()
    }

    /// Render a commented sample configuration holding the defaults
    pub fn sample_toml() -> String {
        let body = toml::to_string_pretty(&Config::default()).unwrap_or_default();
        format!(
            "# av1conv configuration\n# Every key is optional; missing keys fall back to these defaults.\n\n{}",
            body
        )
    }
}

/// Parse a human size such as `1G`, `500M`, `2.5g` or a bare byte count
///
/// Suffixes k/m/g/t use powers of 1024.
pub fn parse_size(input: &str) -> Result<u64, ConfigError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Invalid("size threshold is empty".to_string()));
    }

    let lower = trimmed.to_lowercase();
    let lower = lower.trim_end_matches('b');
    let (number, multiplier) = match lower.chars().last() {
        Some('k') => (&lower[..lower.len() - 1], 1024u64),
        Some('m') => (&lower[..lower.len() - 1], 1024u64.pow(2)),
        Some('g') => (&lower[..lower.len() - 1], 1024u64.pow(3)),
        Some('t') => (&lower[..lower.len() - 1], 1024u64.pow(4)),
        _ => (lower, 1u64),
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("unparsable size threshold '{}'", input)))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::Invalid(format!(
            "size threshold '{}' must be a positive number",
            input
        )));
    }

    Ok((value * multiplier as f64) as u64)
}

fn check_range(name: &str, value: i64, min: i64, max: i64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::Invalid(format!(
            "{} = {} is outside {}..={}",
            name, value, min, max
        )));
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    let Ok(val) = env::var(key) else {
        return Ok(None);
    };
    val.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| ConfigError::Invalid(format!("{} = '{}' is not a valid value", key, val)))
}

// Accept "true", "1", "yes" as true; "false", "0", "no" as false
fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    let Ok(val) = env::var(key) else {
        return Ok(None);
    };
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(Some(true)),
        "false" | "0" | "no" => Ok(Some(false)),
        _ => Err(ConfigError::Invalid(format!(
            "{} = '{}' is not a boolean",
            key, val
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        for key in [
            "AV1CONV_CRF",
            "AV1CONV_PRESET",
            "AV1CONV_GOP",
            "AV1CONV_PARALLEL_JOBS",
            "AV1CONV_FFMPEG_THREADS",
            "AV1CONV_DETECT_GRAIN",
            "AV1CONV_ALLOW_LARGER",
            "AV1CONV_SIZE_THRESHOLD",
            "AV1CONV_CLASSIFIER",
            "AV1CONV_FFMPEG",
            "AV1CONV_TEMP_ROOT",
        ] {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_encode_section(
            crf in 0u8..=63,
            preset in -1i8..=13,
            gop in 0u32..=500,
            jobs in 1u32..=4,
            detect_grain in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[encode]
crf = {}
preset = {}
gop = {}
max_parallel_jobs = {}
detect_grain = {}
"#,
                crf, preset, gop, jobs, detect_grain
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.encode.crf, crf);
            prop_assert_eq!(config.encode.preset, preset);
            prop_assert_eq!(config.encode.gop, gop);
            prop_assert_eq!(config.encode.max_parallel_jobs, jobs);
            prop_assert_eq!(config.encode.detect_grain, detect_grain);
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_out_of_range_crf_rejected(crf in 64u8..=255) {
            let mut config = Config::default();
            config.encode.crf = crf;
            prop_assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }

        #[test]
        fn prop_parallel_jobs_outside_one_to_four_rejected(jobs in prop_oneof![Just(0u32), 5u32..64]) {
            let mut config = Config::default();
            config.encode.max_parallel_jobs = jobs;
            prop_assert!(config.validate().is_err());
        }

        #[test]
        fn prop_qm_min_above_max_rejected(qm_min in 1u8..=15, delta in 1u8..=15) {
            let mut config = Config::default();
            config.svt.qm_min = qm_min;
            config.svt.qm_max = qm_min.saturating_sub(delta);
            prop_assert!(config.validate().is_err());
        }

        #[test]
        fn prop_env_overrides_crf(initial in 0u8..=63, override_crf in 0u8..=63) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[encode]\ncrf = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("AV1CONV_CRF", override_crf.to_string());
            let result = config.apply_env_overrides();
            clear_env_vars();

            prop_assert!(result.is_ok());
            prop_assert_eq!(config.encode.crf, override_crf);
        }

        #[test]
        fn prop_size_suffixes_use_binary_multiples(n in 1u64..1024) {
            prop_assert_eq!(parse_size(&format!("{}k", n)).unwrap(), n * 1024);
            prop_assert_eq!(parse_size(&format!("{}M", n)).unwrap(), n * 1024 * 1024);
            prop_assert_eq!(parse_size(&format!("{}G", n)).unwrap(), n * 1024 * 1024 * 1024);
            prop_assert_eq!(parse_size(&n.to_string()).unwrap(), n);
        }
    }

    #[test]
    fn test_env_override_bool_and_paths() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("AV1CONV_DETECT_GRAIN", "yes");
        env::set_var("AV1CONV_ALLOW_LARGER", "0");
        env::set_var("AV1CONV_FFMPEG", "/opt/ffmpeg/bin/ffmpeg");
        env::set_var("AV1CONV_PARALLEL_JOBS", "3");
        let result = config.apply_env_overrides();
        clear_env_vars();

        assert!(result.is_ok());
        assert!(config.encode.detect_grain);
        assert!(!config.encode.allow_larger_files);
        assert_eq!(config.encode.max_parallel_jobs, 3);
        assert_eq!(
            config.paths.ffmpeg,
            Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg"))
        );
    }

    #[test]
    fn test_malformed_env_values_are_errors() {
        let _guard = ENV_MUTEX.lock().unwrap();

        for (key, value) in [
            ("AV1CONV_CRF", "300"),
            ("AV1CONV_PARALLEL_JOBS", "not-a-number"),
            ("AV1CONV_ALLOW_LARGER", "maybe"),
            ("AV1CONV_PRESET", "-20x"),
        ] {
            clear_env_vars();
            let mut config = Config::default();
            env::set_var(key, value);
            let result = config.apply_env_overrides();
            clear_env_vars();

            assert!(
                matches!(result, Err(ConfigError::Invalid(ref msg)) if msg.contains(key)),
                "{} = {} accepted",
                key,
                value
            );
            assert_eq!(config.encode.crf, 28);
        }
    }

    #[test]
    fn test_load_rejects_malformed_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("av1conv.toml");
        fs::write(&path, "[encode]\ncrf = 30\n").unwrap();

        env::set_var("AV1CONV_CRF", "300");
        let result = Config::load(&path);
        clear_env_vars();

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.encode.crf, 28);
        assert_eq!(config.encode.preset, 5);
        assert_eq!(config.encode.gop, 120);
        assert_eq!(config.encode.max_parallel_jobs, 1);
        assert_eq!(config.svt.lookahead, 32);
        assert_eq!(config.content.film.crf, 22);
        assert_eq!(config.files.size_threshold, "1G");
        assert_eq!(config.ignore_terms(), vec!["CAM", "WORKPRINT", "TELESYNC"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[svt]
tune = 0

[files]
extra_ignore_terms = ["SAMPLE"]
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.svt.tune, 0);
        assert_eq!(config.svt.qm_max, 15); // default
        assert_eq!(config.encode.crf, 28); // default
        assert!(config.ignore_terms().contains(&"SAMPLE".to_string()));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("av1conv.toml");
        fs::write(&path, "[encode]\npreset = 8\n").unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.encode.preset, 8);

        let missing = Config::load_from_file(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_sample_toml_parses_back_to_defaults() {
        let sample = Config::sample_toml();
        let config = Config::parse_toml(&sample).expect("sample should parse");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("lots").is_err());
        assert!(parse_size("-1G").is_err());
        assert_eq!(parse_size("1.5G").unwrap(), 1610612736);
        assert_eq!(parse_size("700MB").unwrap(), 700 * 1024 * 1024);
    }

    #[test]
    fn test_invalid_size_threshold_fails_validation() {
        let mut config = Config::default();
        config.files.size_threshold = "big".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
