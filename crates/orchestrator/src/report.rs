//! End-of-run reporting
//!
//! The scheduler folds every terminal outcome into a [`RunSummary`] exactly
//! once. This module turns it into log lines, the reverted-files report and
//! the optional JSON report.

use crate::job::{CompletionCode, JobOutcome};
use crate::safety::ReversionRecord;
use chrono::{DateTime, Utc};
use humansize::{format_size, BINARY};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeptRecord {
    pub source: PathBuf,
    pub output: PathBuf,
    pub saved_bytes: i64,
    pub source_removed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipRecord {
    pub path: PathBuf,
    pub reason: String,
    pub code: CompletionCode,
}

/// Everything that happened during one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_files: usize,
    pub kept: usize,
    pub skipped: usize,
    pub reverted: usize,
    pub failed: usize,
    pub missing: usize,
    pub unsupported: usize,
    /// Files never dispatched because the run was interrupted
    pub not_started: usize,
    /// Signed; negative when larger outputs were kept
    pub saved_bytes: i64,
    pub kept_files: Vec<KeptRecord>,
    pub reversions: Vec<ReversionRecord>,
    pub missing_files: Vec<PathBuf>,
    pub failures: Vec<FailureRecord>,
    pub unsupported_files: Vec<SkipRecord>,
    pub aborted: bool,
}

impl RunSummary {
    pub fn new(total_files: usize) -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            total_files,
            kept: 0,
            skipped: 0,
            reverted: 0,
            failed: 0,
            missing: 0,
            unsupported: 0,
            not_started: 0,
            saved_bytes: 0,
            kept_files: Vec::new(),
            reversions: Vec::new(),
            missing_files: Vec::new(),
            failures: Vec::new(),
            unsupported_files: Vec::new(),
            aborted: false,
        }
    }

    /// Fold one terminal outcome into the summary and log it
    pub fn record(&mut self, source: &Path, outcome: &JobOutcome) {
        let code = outcome.completion_code();
        match outcome {
            JobOutcome::Succeeded {
                output,
                saved_bytes,
                source_removed,
            } => {
                self.kept += 1;
                self.saved_bytes += saved_bytes;
                self.kept_files.push(KeptRecord {
                    source: source.to_path_buf(),
                    output: output.clone(),
                    saved_bytes: *saved_bytes,
                    source_removed: *source_removed,
                });
                info!(
                    "[{}] Kept {} ({} {})",
                    code,
                    output.display(),
                    if *saved_bytes < 0 { "grew by" } else { "saved" },
                    format_size(saved_bytes.unsigned_abs(), BINARY)
                );
            }
            JobOutcome::SkippedMissing => {
                self.skipped += 1;
                self.missing += 1;
                self.missing_files.push(source.to_path_buf());
                warn!("[{}] Missing: {}", code, source.display());
            }
            JobOutcome::SkippedUnsupported(skip) => {
                self.skipped += 1;
                self.unsupported += 1;
                self.unsupported_files.push(SkipRecord {
                    path: source.to_path_buf(),
                    reason: skip.to_string(),
                    code,
                });
                info!("[{}] Skipped {}: {}", code, source.display(), skip);
            }
            JobOutcome::RevertedLarger(record) => {
                self.skipped += 1;
                self.reverted += 1;
                self.reversions.push(record.clone());
                warn!(
                    "[{}] Reverted {}: encode was {} against {} original",
                    code,
                    source.display(),
                    format_size(record.encoded_bytes, BINARY),
                    format_size(record.original_bytes, BINARY)
                );
            }
            JobOutcome::Failed { reason } => {
                self.skipped += 1;
                self.failed += 1;
                self.failures.push(FailureRecord {
                    path: source.to_path_buf(),
                    reason: reason.clone(),
                });
                warn!("[{}] Failed {}: {}", code, source.display(), reason);
            }
        }
    }

    pub fn finish(&mut self, aborted: bool, not_started: usize) {
        self.aborted = aborted;
        self.not_started = not_started;
        self.finished_at = Some(Utc::now());
    }

    /// Files that reached a terminal outcome
    pub fn finished_files(&self) -> usize {
        self.kept + self.skipped
    }
}

/// Signed human readable byte count
pub fn format_signed_size(bytes: i64) -> String {
    let magnitude = format_size(bytes.unsigned_abs(), BINARY);
    if bytes < 0 {
        format!("-{}", magnitude)
    } else {
        magnitude
    }
}

/// Multi-line end-of-run summary.
pub fn summary_text(summary: &RunSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Processed {} of {} files: {} kept, {} skipped ({} reverted, {} failed, {} missing, {} unsupported)",
        summary.finished_files(),
        summary.total_files,
        summary.kept,
        summary.skipped,
        summary.reverted,
        summary.failed,
        summary.missing,
        summary.unsupported
    );
    let _ = writeln!(out, "Total space saved: {}", format_signed_size(summary.saved_bytes));

    if let Some(finished) = summary.finished_at {
        let elapsed = finished - summary.started_at;
        let _ = writeln!(
            out,
            "Elapsed: {:02}:{:02}:{:02}",
            elapsed.num_hours(),
            elapsed.num_minutes() % 60,
            elapsed.num_seconds() % 60
        );
    }
    if summary.not_started > 0 {
        let _ = writeln!(out, "{} files were not started", summary.not_started);
    }
    if summary.aborted {
        let _ = writeln!(out, "Run was aborted");
    }

    if !summary.missing_files.is_empty() {
        let _ = writeln!(out, "Missing files:");
        for path in &summary.missing_files {
            let _ = writeln!(out, "  {}", path.display());
        }
    }
    if !summary.failures.is_empty() {
        let _ = writeln!(out, "Failures:");
        for failure in &summary.failures {
            let _ = writeln!(out, "  {}: {}", failure.path.display(), failure.reason);
        }
    }
    out
}

/// Report of reverted files with remediation hints; `None` when nothing was reverted.
pub fn reversion_report(reversions: &[ReversionRecord]) -> Option<String> {
    if reversions.is_empty() {
        return None;
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} file(s) were not converted because the AV1 encode was not smaller:",
        reversions.len()
    );
    for record in reversions {
        let bitrate = record
            .estimated_bitrate_bps
            .map(|bps| format!("{:.1} Mb/s", bps as f64 / 1_000_000.0))
            .unwrap_or_else(|| "unknown bitrate".to_string());
        let _ = writeln!(
            out,
            "  {} [{}, {}]: {} -> {} (+{:.1}%)",
            record.path.display(),
            record.codec,
            bitrate,
            format_size(record.original_bytes, BINARY),
            format_size(record.encoded_bytes, BINARY),
            record.growth_percent()
        );
    }
    let _ = writeln!(out, "Suggestions:");
    let _ = writeln!(out, "  - raise the CRF (--crf) for a smaller output");
    let _ = writeln!(out, "  - use a slower preset (--preset) for better compression");
    let _ = writeln!(
        out,
        "  - the source may already be efficiently compressed; consider leaving it as is"
    );
    Some(out)
}

/// Log the summary and, when present, the reversion report
pub fn log_summary(summary: &RunSummary) {
    for line in summary_text(summary).lines() {
        info!("{}", line);
    }
    if let Some(report) = reversion_report(&summary.reversions) {
        for line in report.lines() {
            warn!("{}", line);
        }
    }
}

pub fn write_json_report(summary: &RunSummary, path: &Path) -> Result<(), ReportError> {
    let json = serde_json::to_string_pretty(summary)?;
    fs::write(path, json)?;
    Ok(())
}
