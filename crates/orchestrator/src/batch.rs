//! Batch runner
//!
//! Wires scanner, scheduler, monitor, interrupt listener and reporting into
//! one run over a directory.

use crate::classify::{ClassifierChain, ContentLabel, LabelSource};
use crate::concurrency::ConcurrencyPlan;
use crate::config::{Config, ConfigError};
use crate::encode::{FfmpegTranscoder, TERMINATE_GRACE};
use crate::interrupt::{spawn_interrupt_listener, RunControl};
use crate::monitor::{ProgressMonitor, DEFAULT_INTERVAL};
use crate::planner::{plan, EncodePlan, PlanSkip};
use crate::probe::{FfprobeProbe, MediaProbe, ProbeError, VideoInfo};
use crate::report::{log_summary, write_json_report, ReportError, RunSummary};
use crate::scan::{scan, ScanError, ScanOptions};
use crate::scheduler::{JobScheduler, WorkerContext};
use crate::startup::{StartupError, Toolchain};
use crate::state::{new_shared_status, StateDir};
use humansize::{format_size, BINARY};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Errors that stop a run as a whole
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Scan failed: {0}")]
    Scan(#[from] ScanError),

    #[error("Cannot create run state directory: {0}")]
    StateDir(std::io::Error),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Report(#[from] ReportError),
}

/// Per-invocation options that are not part of the configuration
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Directory to scan, or a single file
    pub target: PathBuf,
    /// Log a progress frame periodically
    pub monitor: bool,
    pub report_json: Option<PathBuf>,
}

/// What a single file would be encoded with
#[derive(Debug, Clone)]
pub struct Inspection {
    pub info: VideoInfo,
    pub label: ContentLabel,
    pub plan: Result<EncodePlan, PlanSkip>,
}

pub struct BatchRunner {
    config: Arc<Config>,
    toolchain: Toolchain,
}

impl BatchRunner {
    pub fn new(config: Config, toolchain: Toolchain) -> Self {
        Self {
            config: Arc::new(config),
            toolchain,
        }
    }

    fn classifier(&self) -> ClassifierChain {
        ClassifierChain::from_config(
            &self.config.content,
            self.config.encode.min_classify_duration_secs,
        )
    }

    /// Probe and classify one file and plan it without encoding.
    pub fn inspect(&self, path: &Path) -> Result<Inspection, BatchError> {
        let info = FfprobeProbe::new(&self.toolchain.ffprobe).probe(path)?;
        let default_grain = self.config.svt.film_grain;
        let label = self
            .classifier()
            .label(&info, &self.config.content, default_grain);
        let threads = ConcurrencyPlan::derive(&self.config).threads_per_job;
        let plan = plan(&info, &label, &self.config, threads);
        Ok(Inspection { info, label, plan })
    }

    /// Scan `opts.target` and encode everything found
    ///
    /// # Returns
    /// * `Ok(RunSummary)` - The run finished, was drained or was aborted
    /// * `Err(BatchError)` - Nothing was processed
    pub async fn run(&self, opts: &BatchOptions) -> Result<RunSummary, BatchError> {
        let scan_opts = ScanOptions::from_config(&self.config)?;
        let report = scan(&opts.target, &scan_opts)?;
        info!(
            "Found {} file(s) to convert ({}) in {}",
            report.candidates.len(),
            format_size(report.total_bytes(), BINARY),
            opts.target.display()
        );
        if report.below_threshold + report.ignored + report.existing_outputs > 0 {
            info!(
                "Skipped during scan: {} below {}, {} ignored by name, {} already converted",
                report.below_threshold,
                self.config.files.size_threshold,
                report.ignored,
                report.existing_outputs
            );
        }

        let concurrency = ConcurrencyPlan::derive(&self.config);
        info!(
            "Running {} job(s) at a time with {} thread(s) each on {} core(s)",
            concurrency.parallel_jobs, concurrency.threads_per_job, concurrency.total_cores
        );

        let state_dir =
            StateDir::create(&self.config.paths.temp_root).map_err(BatchError::StateDir)?;
        info!("Run state in {}", state_dir.path().display());

        let (control_tx, control_rx) = watch::channel(RunControl::Running);
        let listener = spawn_interrupt_listener(control_tx);

        let ctx = WorkerContext {
            config: self.config.clone(),
            probe: Arc::new(FfprobeProbe::new(&self.toolchain.ffprobe)),
            classifier: Arc::new(self.classifier()),
            transcoder: Arc::new(FfmpegTranscoder::new(&self.toolchain.ffmpeg)),
            audio_encoder: self.toolchain.audio_encoder,
            threads: concurrency.threads_per_job,
            jobs_dir: state_dir.jobs_dir(),
            grace: TERMINATE_GRACE,
        };

        let status = new_shared_status(report.candidates.len(), concurrency.parallel_jobs as usize);
        let monitor = opts
            .monitor
            .then(|| ProgressMonitor::new(status.clone(), DEFAULT_INTERVAL).spawn());

        let scheduler =
            JobScheduler::new(ctx, status, control_rx).with_state_dir(state_dir.clone());
        let summary = scheduler.run(report.paths()).await;

        if let Some(monitor) = monitor {
            monitor.abort();
        }
        listener.abort();

        log_summary(&summary);
        if let Some(path) = &opts.report_json {
            write_json_report(&summary, path)?;
            info!("Wrote report to {}", path.display());
        }

        if self.config.paths.keep_temp {
            info!("Keeping run state in {}", state_dir.path().display());
        } else {
            let path = state_dir.path().to_path_buf();
            if let Err(e) = state_dir.remove() {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }

        Ok(summary)
    }
}

/// Describe an inspection for `--detect-grain-test`
pub fn describe_inspection(inspection: &Inspection) -> Vec<String> {
    let info = &inspection.info;
    let label = &inspection.label;
    let mut lines = vec![
        format!("File: {}", info.path.display()),
        format!(
            "Source: {} {}x{} {}-bit {}, {:.0}s",
            info.codec_name,
            info.width,
            info.height,
            info.bit_depth.map(|b| b.to_string()).unwrap_or_else(|| "?".to_string()),
            info.hdr,
            info.duration_secs
        ),
        format!(
            "Content: {:?} (confidence {:?}, source {:?})",
            label.kind, label.confidence, label.source
        ),
    ];
    match &inspection.plan {
        Ok(plan) => {
            lines.push(format!(
                "Plan: crf {} preset {} grain {} {}",
                plan.crf,
                plan.preset,
                plan.grain,
                plan.pix_fmt.as_str()
            ));
            lines.push(format!("SVT-AV1 params: {}", plan.svt_params()));
        }
        Err(skip) => lines.push(format!("Not converted: {}", skip)),
    }
    if label.source == LabelSource::Bypass {
        lines.push("Too short to classify; using the configured defaults".to_string());
    }
    lines
}
