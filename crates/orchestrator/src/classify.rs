//! Content classification for grain-adaptive encoding.
//!
//! A file is labelled animation, film or TV so the planner can pick a grain
//! seed, a CRF target and a preset direction for it. Two classifiers exist: a
//! built-in heuristic looking at names, titles and duration, and an external
//! executable printing a single token. [`ClassifierChain`] runs the external
//! one first and degrades to the heuristic whenever it is missing or fails,
//! then raises the grain seed to what the source bitrate suggests.

use crate::config::{ContentConfig, LabelProfile};
use crate::probe::VideoInfo;
use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use thiserror::Error;

/// Episode markers such as `S01E02`, `s1.e10` or `3x07`.
const EPISODE_PATTERN: &str = r"(?i)\bs\d{1,2}[ ._-]?e\d{1,3}\b|\b\d{1,2}x\d{2}\b";

/// Keywords that indicate animated content.
const ANIMATION_KEYWORDS: &[&str] = &["anime", "animation", "animated", "cartoon"];

/// Keywords that indicate episodic content.
const TV_KEYWORDS: &[&str] = &["season", "episode", "series"];

/// Unlabelled content at least this long is assumed to be a feature film.
const FEATURE_LENGTH_SECS: f64 = 3600.0;

/// Bitrate floors (bits per second) and the grain strength they suggest.
/// Dense SDR sources are usually grainy film scans.
const GRAIN_BITRATE_STEPS: &[(u64, u8)] = &[(14_000_000, 20), (10_000_000, 12), (6_000_000, 8)];

/// Grain strength hint from the average bitrate of a source.
///
/// HDR sources and sources without a usable bitrate get 0.
pub fn estimate_grain(info: &VideoInfo) -> u8 {
    if info.is_hdr() {
        return 0;
    }
    let Some(bps) = info.estimated_bitrate_bps() else {
        return 0;
    };
    GRAIN_BITRATE_STEPS
        .iter()
        .find(|(floor, _)| bps > *floor)
        .map(|(_, grain)| *grain)
        .unwrap_or(0)
}

/// Content category of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Animation,
    Film,
    Tv,
    #[default]
    Unknown,
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentKind::Animation => write!(f, "animation"),
            ContentKind::Film => write!(f, "film"),
            ContentKind::Tv => write!(f, "tv"),
            ContentKind::Unknown => write!(f, "unknown"),
        }
    }
}

impl ContentKind {
    /// Parses the token printed by an external classifier.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "ANIMATION" => Some(ContentKind::Animation),
            "FILM" => Some(ContentKind::Film),
            "TV" => Some(ContentKind::Tv),
            _ => None,
        }
    }
}

/// How sure a classifier is about its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
    None,
}

/// Where a label came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelSource {
    External,
    Heuristic,
    /// Too short to classify
    Bypass,
    /// Classification disabled
    Default,
}

/// Raw answer of a classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ContentKind,
    pub confidence: Confidence,
}

/// Content label with the encode targets attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentLabel {
    pub kind: ContentKind,
    pub confidence: Confidence,
    pub source: LabelSource,
    /// Grain seed before planner adjustments
    pub grain: u8,
    /// `None` for unknown content, which keeps the configured CRF
    pub target_crf: Option<u8>,
    /// `None` for unknown content, which keeps the configured preset
    pub preferred_preset: Option<i8>,
}

impl ContentLabel {
    /// Label used when classification is disabled or bypassed.
    pub fn unclassified(source: LabelSource, default_grain: u8) -> Self {
        Self {
            kind: ContentKind::Unknown,
            confidence: Confidence::None,
            source,
            grain: default_grain,
            target_crf: None,
            preferred_preset: None,
        }
    }

    /// Attach the configured targets of `classification.kind`.
    pub fn from_classification(
        classification: Classification,
        source: LabelSource,
        content: &ContentConfig,
        default_grain: u8,
    ) -> Self {
        let profile: Option<&LabelProfile> = match classification.kind {
            ContentKind::Animation => Some(&content.animation),
            ContentKind::Film => Some(&content.film),
            ContentKind::Tv => Some(&content.tv),
            ContentKind::Unknown => None,
        };
        match profile {
            Some(p) => Self {
                kind: classification.kind,
                confidence: classification.confidence,
                source,
                grain: p.grain,
                target_crf: Some(p.crf),
                preferred_preset: Some(p.preset),
            },
            None => Self {
                confidence: classification.confidence,
                ..Self::unclassified(source, default_grain)
            },
        }
    }
}

/// Error type for classifier operations.
#[derive(Debug, Error)]
pub enum ClassifyError {
    /// The classifier executable does not exist.
    #[error("classifier {} is not available", .0.display())]
    Unavailable(PathBuf),

    /// The classifier ran but produced no usable answer.
    #[error("classifier failed: {0}")]
    Failed(String),
}

/// Anything able to label a probed file.
pub trait ContentClassifier: Send + Sync {
    fn classify(&self, path: &Path, info: &VideoInfo) -> Result<Classification, ClassifyError>;
}

/// Name, title and duration based classifier.
///
/// Never fails; answers `Unknown` when it finds no evidence.
#[derive(Debug, Clone, Default)]
pub struct HeuristicClassifier;

fn episode_regex() -> Option<&'static Regex> {
    static EPISODE: OnceLock<Option<Regex>> = OnceLock::new();
    EPISODE.get_or_init(|| Regex::new(EPISODE_PATTERN).ok()).as_ref()
}

fn contains_any_keyword(haystack: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| haystack.contains(kw))
}

impl ContentClassifier for HeuristicClassifier {
    fn classify(&self, path: &Path, info: &VideoInfo) -> Result<Classification, ClassifyError> {
        // Only the file name counts; library folders like `Anime/` say nothing
        // about the episode inside them.
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let title = info.title.as_deref().unwrap_or("").to_lowercase();

        if episode_regex().map(|re| re.is_match(&file_name)).unwrap_or(false) {
            return Ok(Classification {
                kind: ContentKind::Tv,
                confidence: Confidence::High,
            });
        }

        if contains_any_keyword(&file_name, TV_KEYWORDS) || contains_any_keyword(&title, TV_KEYWORDS) {
            return Ok(Classification {
                kind: ContentKind::Tv,
                confidence: Confidence::Medium,
            });
        }

        if contains_any_keyword(&file_name, ANIMATION_KEYWORDS)
            || contains_any_keyword(&title, ANIMATION_KEYWORDS)
        {
            return Ok(Classification {
                kind: ContentKind::Animation,
                confidence: Confidence::Medium,
            });
        }

        if info.duration_secs >= FEATURE_LENGTH_SECS {
            return Ok(Classification {
                kind: ContentKind::Film,
                confidence: Confidence::Low,
            });
        }

        Ok(Classification {
            kind: ContentKind::Unknown,
            confidence: Confidence::None,
        })
    }
}

/// Classifier backed by an external executable called as `<binary> <file>`.
///
/// Stdout must hold exactly one token, `ANIMATION`, `FILM` or `TV`
/// (case-insensitive, surrounding whitespace ignored).
#[derive(Debug, Clone)]
pub struct ExternalClassifier {
    binary: PathBuf,
}

impl ExternalClassifier {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl ContentClassifier for ExternalClassifier {
    fn classify(&self, path: &Path, _info: &VideoInfo) -> Result<Classification, ClassifyError> {
        let output = Command::new(&self.binary).arg(path).output().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                ClassifyError::Unavailable(self.binary.clone())
            } else {
                ClassifyError::Failed(e.to_string())
            }
        })?;

        if !output.status.success() {
            return Err(ClassifyError::Failed(format!(
                "exited with status {}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let answer = stdout.trim();
        if answer.split_whitespace().count() != 1 {
            return Err(ClassifyError::Failed(format!(
                "expected a single token, got '{}'",
                answer
            )));
        }
        let kind = ContentKind::from_token(answer)
            .ok_or_else(|| ClassifyError::Failed(format!("unrecognised answer '{}'", answer)))?;

        Ok(Classification {
            kind,
            confidence: Confidence::High,
        })
    }
}

/// Runs the optional plugin, then the heuristic, and turns the answer into a label.
pub struct ClassifierChain {
    plugin: Option<Box<dyn ContentClassifier>>,
    heuristic: HeuristicClassifier,
    min_duration_secs: f64,
}

impl ClassifierChain {
    /// # Arguments
    /// * `plugin` - External classifier tried first, if any
    /// * `min_duration_secs` - Shorter content is never classified
    pub fn new(plugin: Option<Box<dyn ContentClassifier>>, min_duration_secs: u64) -> Self {
        Self {
            plugin,
            heuristic: HeuristicClassifier,
            min_duration_secs: min_duration_secs as f64,
        }
    }

    /// Chain configured from `[content]`, with the external classifier if one is set.
    pub fn from_config(content: &ContentConfig, min_duration_secs: u64) -> Self {
        let plugin = content
            .classifier
            .as_ref()
            .map(|bin| Box::new(ExternalClassifier::new(bin)) as Box<dyn ContentClassifier>);
        Self::new(plugin, min_duration_secs)
    }

    /// Produce the label for one file. Never fails.
    ///
    /// Short content is bypassed with no grain at all. Otherwise the grain
    /// seed is at least [`estimate_grain`] of the source.
    pub fn label(&self, info: &VideoInfo, content: &ContentConfig, default_grain: u8) -> ContentLabel {
        if info.duration_secs < self.min_duration_secs {
            debug!(
                "{}: {:.0}s is too short to classify",
                info.path.display(),
                info.duration_secs
            );
            return ContentLabel::unclassified(LabelSource::Bypass, 0);
        }

        let mut label = self.classify_label(info, content, default_grain);
        let hint = estimate_grain(info);
        if hint > label.grain {
            debug!("{}: bitrate suggests grain {}", info.path.display(), hint);
            label.grain = hint;
        }
        label
    }

    fn classify_label(&self, info: &VideoInfo, content: &ContentConfig, default_grain: u8) -> ContentLabel {
        if let Some(plugin) = &self.plugin {
            match plugin.classify(&info.path, info) {
                Ok(classification) => {
                    return ContentLabel::from_classification(
                        classification,
                        LabelSource::External,
                        content,
                        default_grain,
                    );
                }
                Err(e) => {
                    warn!("{}: {}; using built-in heuristic", info.path.display(), e);
                }
            }
        }

        let classification = self
            .heuristic
            .classify(&info.path, info)
            .unwrap_or(Classification {
                kind: ContentKind::Unknown,
                confidence: Confidence::None,
            });
        ContentLabel::from_classification(classification, LabelSource::Heuristic, content, default_grain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::tests::sdr_info;
    use crate::probe::HdrKind;
    use proptest::prelude::*;

    struct FixedClassifier(Result<ContentKind, ()>);

    impl ContentClassifier for FixedClassifier {
        fn classify(&self, _path: &Path, _info: &VideoInfo) -> Result<Classification, ClassifyError> {
            match self.0 {
                Ok(kind) => Ok(Classification {
                    kind,
                    confidence: Confidence::High,
                }),
                Err(()) => Err(ClassifyError::Failed("boom".to_string())),
            }
        }
    }

    /// Source at 2 Mb/s, low enough that bitrate never raises the grain.
    fn info_at(path: &str, duration_secs: f64) -> VideoInfo {
        VideoInfo {
            path: PathBuf::from(path),
            duration_secs,
            size_bytes: (duration_secs * 250_000.0) as u64,
            ..sdr_info()
        }
    }

    fn at_mbps(mbps: u64) -> VideoInfo {
        VideoInfo {
            size_bytes: mbps * 125_000 * 4000,
            ..info_at("/m/Some Film (1980).mkv", 4000.0)
        }
    }

    fn heuristic(path: &str, duration_secs: f64) -> ContentKind {
        let info = info_at(path, duration_secs);
        HeuristicClassifier.classify(&info.path, &info).unwrap().kind
    }

    #[test]
    fn test_heuristic_episode_patterns() {
        assert_eq!(heuristic("/tv/Show/Show.S01E02.1080p.mkv", 2700.0), ContentKind::Tv);
        assert_eq!(heuristic("/tv/Show/show s1e10.mkv", 2700.0), ContentKind::Tv);
        assert_eq!(heuristic("/tv/Show/Show 3x07.mkv", 2700.0), ContentKind::Tv);
        assert_eq!(heuristic("/library/Show/Show Season 2 part 1.mkv", 2700.0), ContentKind::Tv);
        assert_eq!(heuristic("/library/Show/Episode 4.mkv", 2700.0), ContentKind::Tv);
    }

    #[test]
    fn test_heuristic_ignores_parent_directories() {
        assert_eq!(heuristic("/library/Show/Season 2/part.mkv", 2700.0), ContentKind::Unknown);
        assert_eq!(heuristic("/media/Cartoons/short.mkv", 600.0), ContentKind::Unknown);
    }

    #[test]
    fn test_heuristic_prefers_tv_over_animation() {
        assert_eq!(heuristic("/media/Anime/Some.Show.S01E01.mkv", 1400.0), ContentKind::Tv);
        assert_eq!(heuristic("/m/Anime Series Episode 3.mkv", 1400.0), ContentKind::Tv);
    }

    #[test]
    fn test_heuristic_resolution_is_not_an_episode() {
        assert_eq!(heuristic("/m/Clip 1920x1080.mkv", 600.0), ContentKind::Unknown);
    }

    #[test]
    fn test_heuristic_animation_and_film() {
        assert_eq!(heuristic("/media/Anime/Some Anime Movie.mkv", 5400.0), ContentKind::Animation);
        assert_eq!(heuristic("/media/Shorts/cartoon-classics.mkv", 600.0), ContentKind::Animation);
        assert_eq!(heuristic("/media/Movies/Some Film (2010).mkv", 7000.0), ContentKind::Film);
        assert_eq!(heuristic("/media/clips/thing.mkv", 900.0), ContentKind::Unknown);
    }

    #[test]
    fn test_heuristic_uses_title_tag() {
        let info = VideoInfo {
            title: Some("Animated Feature".to_string()),
            ..info_at("/m/a.mkv", 600.0)
        };
        let c = HeuristicClassifier.classify(&info.path, &info).unwrap();
        assert_eq!(c.kind, ContentKind::Animation);
    }

    #[test]
    fn test_short_content_bypasses_classification() {
        let chain = ClassifierChain::new(Some(Box::new(FixedClassifier(Ok(ContentKind::Film)))), 30);
        let label = chain.label(&info_at("/m/trailer.mkv", 12.0), &ContentConfig::default(), 3);

        assert_eq!(label.kind, ContentKind::Unknown);
        assert_eq!(label.source, LabelSource::Bypass);
        assert_eq!(label.grain, 0);
        assert_eq!(label.target_crf, None);
    }

    #[test]
    fn test_short_dense_content_gets_no_grain() {
        let chain = ClassifierChain::new(None, 30);
        let info = VideoInfo {
            size_bytes: 200_000_000,
            ..info_at("/m/trailer.mkv", 12.0)
        };
        let label = chain.label(&info, &ContentConfig::default(), 10);
        assert_eq!(label.source, LabelSource::Bypass);
        assert_eq!(label.grain, 0);
    }

    #[test]
    fn test_estimate_grain_steps() {
        assert_eq!(estimate_grain(&at_mbps(2)), 0);
        assert_eq!(estimate_grain(&at_mbps(7)), 8);
        assert_eq!(estimate_grain(&at_mbps(11)), 12);
        assert_eq!(estimate_grain(&at_mbps(30)), 20);

        let hdr = VideoInfo {
            hdr: HdrKind::Hdr10,
            ..at_mbps(30)
        };
        assert_eq!(estimate_grain(&hdr), 0);

        let no_duration = VideoInfo {
            duration_secs: 0.0,
            ..at_mbps(30)
        };
        assert_eq!(estimate_grain(&no_duration), 0);
    }

    #[test]
    fn test_bitrate_raises_grain_seed() {
        let content = ContentConfig::default();
        let chain = ClassifierChain::new(None, 30);

        let label = chain.label(&at_mbps(11), &content, 4);
        assert_eq!(label.kind, ContentKind::Film);
        assert_eq!(label.grain, content.film.grain.max(12));

        // Unknown keeps the configured grain when it is already stronger
        let short = VideoInfo {
            size_bytes: 7 * 125_000 * 600,
            ..info_at("/m/clip.mkv", 600.0)
        };
        assert_eq!(chain.label(&short, &content, 15).grain, 15);
        assert_eq!(chain.label(&short, &content, 2).grain, 8);
    }

    #[test]
    fn test_plugin_answer_carries_profile_targets() {
        let content = ContentConfig::default();
        let chain = ClassifierChain::new(Some(Box::new(FixedClassifier(Ok(ContentKind::Film)))), 30);
        let label = chain.label(&info_at("/m/x.mkv", 600.0), &content, 0);

        assert_eq!(label.kind, ContentKind::Film);
        assert_eq!(label.source, LabelSource::External);
        assert_eq!(label.target_crf, Some(content.film.crf));
        assert_eq!(label.preferred_preset, Some(content.film.preset));
        assert_eq!(label.grain, content.film.grain);
    }

    #[test]
    fn test_plugin_failure_degrades_to_heuristic() {
        let chain = ClassifierChain::new(Some(Box::new(FixedClassifier(Err(())))), 30);
        let label = chain.label(&info_at("/tv/Show.S02E03.mkv", 1500.0), &ContentConfig::default(), 0);

        assert_eq!(label.kind, ContentKind::Tv);
        assert_eq!(label.source, LabelSource::Heuristic);
    }

    #[test]
    fn test_missing_external_binary_is_unavailable() {
        let classifier = ExternalClassifier::new("/nonexistent/classifier-bin");
        let info = info_at("/m/x.mkv", 600.0);
        assert!(matches!(
            classifier.classify(&info.path, &info),
            Err(ClassifyError::Unavailable(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_external_classifier_token_parsing() {
        // `echo` prints its argument back, so the file name doubles as the answer
        let echo = ExternalClassifier::new("echo");

        let info = info_at("FILM", 600.0);
        let c = echo.classify(&info.path, &info).unwrap();
        assert_eq!(c.kind, ContentKind::Film);
        assert_eq!(c.confidence, Confidence::High);

        let info = info_at("documentary", 600.0);
        assert!(matches!(
            echo.classify(&info.path, &info),
            Err(ClassifyError::Failed(_))
        ));

        assert!(matches!(
            ExternalClassifier::new("false").classify(&info.path, &info),
            Err(ClassifyError::Failed(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_external_classifier_rejects_extra_tokens() {
        let echo = ExternalClassifier::new("echo");

        let info = info_at("FILM extra", 600.0);
        assert!(matches!(
            echo.classify(&info.path, &info),
            Err(ClassifyError::Failed(_))
        ));

        let info = info_at("  tv ", 600.0);
        assert_eq!(echo.classify(&info.path, &info).unwrap().kind, ContentKind::Tv);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_token_parsing_ignores_case_and_padding(
            idx in 0usize..3,
            upper in proptest::bool::ANY,
            pad in "[ \t]{0,3}",
        ) {
            let (word, kind) = [
                ("animation", ContentKind::Animation),
                ("film", ContentKind::Film),
                ("tv", ContentKind::Tv),
            ][idx];
            let word = if upper { word.to_uppercase() } else { word.to_string() };
            let token = format!("{}{}{}", pad, word, pad);
            prop_assert_eq!(ContentKind::from_token(&token), Some(kind));
        }

        #[test]
        fn prop_below_min_duration_always_bypassed(duration in 0.0f64..29.9) {
            let chain = ClassifierChain::new(None, 30);
            let label = chain.label(&info_at("/tv/Show.S01E01.mkv", duration), &ContentConfig::default(), 0);
            prop_assert_eq!(label.source, LabelSource::Bypass);
        }
    }
}
