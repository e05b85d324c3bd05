//! Encode jobs and their terminal outcomes

use crate::planner::PlanSkip;
use crate::safety::ReversionRecord;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle of a single job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    SkippedMissing,
    SkippedUnsupported,
    RevertedLarger,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::SkippedMissing => "skipped_missing",
            JobState::SkippedUnsupported => "skipped_unsupported",
            JobState::RevertedLarger => "reverted_larger",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Queued | JobState::Running)
    }
}

/// Numeric completion code reported for a finished job
///
/// * `0` - output kept
/// * `1` - missing, failed or otherwise unsupported
/// * `2` - Dolby Vision the run cannot or may not handle
/// * `3` - reverted because the encode was not smaller
pub type CompletionCode = u8;

/// Exactly one of these is produced per dispatched file.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded {
        output: PathBuf,
        saved_bytes: i64,
        source_removed: bool,
    },
    SkippedMissing,
    SkippedUnsupported(PlanSkip),
    RevertedLarger(ReversionRecord),
    Failed { reason: String },
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Succeeded { .. } => JobState::Succeeded,
            JobOutcome::SkippedMissing => JobState::SkippedMissing,
            JobOutcome::SkippedUnsupported(_) => JobState::SkippedUnsupported,
            JobOutcome::RevertedLarger(_) => JobState::RevertedLarger,
            JobOutcome::Failed { .. } => JobState::Failed,
        }
    }

    pub fn completion_code(&self) -> CompletionCode {
        match self {
            JobOutcome::Succeeded { .. } => 0,
            JobOutcome::SkippedUnsupported(skip) if skip.is_dolby_vision() => 2,
            JobOutcome::RevertedLarger(_) => 3,
            JobOutcome::SkippedMissing
            | JobOutcome::SkippedUnsupported(_)
            | JobOutcome::Failed { .. } => 1,
        }
    }

    /// True when an encoded output was kept.
    pub fn is_kept(&self) -> bool {
        matches!(self, JobOutcome::Succeeded { .. })
    }

    /// Signed bytes saved; zero unless the output was kept.
    pub fn saved_bytes(&self) -> i64 {
        match self {
            JobOutcome::Succeeded { saved_bytes, .. } => *saved_bytes,
            _ => 0,
        }
    }
}

/// One file moving through the pipeline.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub id: Uuid,
    /// Panel slot, 1-based
    pub slot: usize,
    pub source: PathBuf,
    pub state: JobState,
}

impl EncodeJob {
    pub fn new(slot: usize, source: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            slot,
            source,
            state: JobState::Queued,
        }
    }

    /// Short name used in logs and the monitor
    pub fn label(&self) -> String {
        file_label(&self.source)
    }
}

pub fn file_label(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
