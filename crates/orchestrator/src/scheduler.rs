//! Job scheduler
//!
//! Runs up to `max_parallel_jobs` encodes at once. Each dispatched file gets a
//! panel slot and a tokio task that owns one transcoder child process. Workers
//! never touch shared counters: they report over an mpsc channel and the
//! scheduler loop is the only writer of the [`StatusBoard`] and the
//! [`RunSummary`].

use crate::classify::{ClassifierChain, ContentLabel, LabelSource};
use crate::config::Config;
use crate::encode::{
    run_transcode, AudioEncoder, EncodeError, ProgressSample, StreamMapping, TranscodeRequest,
    Transcoder,
};
use crate::interrupt::RunControl;
use crate::job::{file_label, EncodeJob, JobOutcome, JobState};
use crate::planner::plan;
use crate::probe::MediaProbe;
use crate::report::RunSummary;
use crate::safety::{self, SafetyVerdict};
use crate::state::{SavingsEntry, SharedStatus, SlotPhase, SlotStatus, StateDir, StatusBoard};
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::watch;
use uuid::Uuid;

/// Sleep between polls of the worker channel
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Message from a worker to the scheduler
#[derive(Debug)]
pub enum WorkerEvent {
    /// The transcoder is running
    Started { slot: usize, job_id: Uuid },
    Progress {
        slot: usize,
        job_id: Uuid,
        sample: ProgressSample,
    },
    /// Transcode done, checking and installing the output
    Finalizing { slot: usize, job_id: Uuid },
    /// Terminal outcome; sent exactly once per job
    Finished {
        slot: usize,
        job_id: Uuid,
        source: PathBuf,
        outcome: JobOutcome,
    },
}

/// Everything a worker needs, shared between all of them
pub struct WorkerContext {
    pub config: Arc<Config>,
    pub probe: Arc<dyn MediaProbe>,
    pub classifier: Arc<ClassifierChain>,
    pub transcoder: Arc<dyn Transcoder>,
    pub audio_encoder: AudioEncoder,
    /// ffmpeg `-threads` for every job
    pub threads: u32,
    /// Where in-progress encodes are written
    pub jobs_dir: PathBuf,
    /// SIGTERM to kill delay on abort
    pub grace: Duration,
}

/// Bounded pool of encode workers
pub struct JobScheduler {
    ctx: Arc<WorkerContext>,
    status: SharedStatus,
    state_dir: Option<StateDir>,
    control: watch::Receiver<RunControl>,
    slot_count: usize,
    poll_interval: Duration,
}

impl JobScheduler {
    /// # Arguments
    /// * `ctx` - Shared worker context
    /// * `status` - Board the scheduler owns and monitors read
    /// * `control` - Run control fed by the interrupt listener
    pub fn new(ctx: WorkerContext, status: SharedStatus, control: watch::Receiver<RunControl>) -> Self {
        let slot_count = ctx.config.encode.max_parallel_jobs.max(1) as usize;
        Self {
            ctx: Arc::new(ctx),
            status,
            state_dir: None,
            control,
            slot_count,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Mirror the board into a run state directory
    pub fn with_state_dir(mut self, dir: StateDir) -> Self {
        self.state_dir = Some(dir);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Process `files` in order and return the run summary.
    ///
    /// Returns once every dispatched job has reported its outcome and either
    /// the queue is empty or the run is draining or aborted.
    pub async fn run(&self, files: Vec<PathBuf>) -> RunSummary {
        let mut summary = RunSummary::new(files.len());
        {
            let mut board = self.status.write().await;
            *board = StatusBoard::new(files.len(), self.slot_count);
            board.queue.next_hint = files.first().map(|p| file_label(p));
        }
        self.mirror().await;

        let (tx, mut rx) = mpsc::channel::<WorkerEvent>(EVENT_CHANNEL_CAPACITY);
        let mut queue: VecDeque<PathBuf> = files.into();
        let mut free_slots: BTreeSet<usize> = (1..=self.slot_count).collect();
        let mut running: HashMap<Uuid, EncodeJob> = HashMap::new();
        let mut announced_drain = false;

        loop {
            let mut changed = false;

            loop {
                match rx.try_recv() {
                    Ok(event) => {
                        changed = true;
                        self.handle_event(event, &mut free_slots, &mut running, &mut summary)
                            .await;
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }

            let control = *self.control.borrow();
            if control == RunControl::Running {
                changed |= self
                    .dispatch(&mut queue, &mut free_slots, &mut running, &tx, &mut summary)
                    .await;
            } else if !announced_drain && !queue.is_empty() {
                announced_drain = true;
                info!(
                    "Not starting the remaining {} file(s); waiting for {} running job(s)",
                    queue.len(),
                    running.len()
                );
            }

            if changed {
                self.mirror().await;
            }

            if running.is_empty() && (queue.is_empty() || control != RunControl::Running) {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let aborted = *self.control.borrow() == RunControl::Abort;
        summary.finish(aborted, queue.len());
        summary
    }

    async fn dispatch(
        &self,
        queue: &mut VecDeque<PathBuf>,
        free_slots: &mut BTreeSet<usize>,
        running: &mut HashMap<Uuid, EncodeJob>,
        tx: &mpsc::Sender<WorkerEvent>,
        summary: &mut RunSummary,
    ) -> bool {
        let mut changed = false;
        let mut board = self.status.write().await;

        while let Some(&slot) = free_slots.first() {
            let Some(source) = queue.pop_front() else {
                break;
            };
            board.queue.next_hint = queue.front().map(|p| file_label(p));
            board.queue.started += 1;
            changed = true;

            if !source.exists() {
                board.queue.skipped += 1;
                summary.record(&source, &JobOutcome::SkippedMissing);
                continue;
            }

            free_slots.remove(&slot);
            let mut job = EncodeJob::new(slot, source);
            job.state = JobState::Running;
            board.queue.active += 1;
            board.slots.insert(
                slot,
                SlotStatus {
                    slot,
                    job_id: job.id,
                    label: job.label(),
                    phase: SlotPhase::Preparing,
                    progress: None,
                },
            );
            info!("[slot {}] Starting {}", slot, job.source.display());

            tokio::spawn(run_job(
                self.ctx.clone(),
                slot,
                job.id,
                job.source.clone(),
                tx.clone(),
                self.control.clone(),
            ));
            running.insert(job.id, job);
        }

        debug_assert!(board.queue.is_consistent());
        changed
    }

    async fn handle_event(
        &self,
        event: WorkerEvent,
        free_slots: &mut BTreeSet<usize>,
        running: &mut HashMap<Uuid, EncodeJob>,
        summary: &mut RunSummary,
    ) {
        let mut board = self.status.write().await;
        match event {
            WorkerEvent::Started { slot, job_id } => {
                set_phase(&mut board, slot, job_id, SlotPhase::Encoding);
            }
            WorkerEvent::Finalizing { slot, job_id } => {
                set_phase(&mut board, slot, job_id, SlotPhase::Finalizing);
            }
            WorkerEvent::Progress {
                slot,
                job_id,
                sample,
            } => {
                if let Some(status) = board.slots.get_mut(&slot).filter(|s| s.job_id == job_id) {
                    status.progress = Some(sample);
                }
            }
            WorkerEvent::Finished {
                slot,
                job_id,
                source,
                outcome,
            } => {
                let Some(mut job) = running.remove(&job_id) else {
                    warn!("Ignoring outcome for unknown job {}", job_id);
                    return;
                };
                job.state = outcome.state();

                board.slots.remove(&slot);
                free_slots.insert(slot);
                board.queue.active = board.queue.active.saturating_sub(1);
                if outcome.is_kept() {
                    board.queue.processed += 1;
                    board.queue.saved_bytes += outcome.saved_bytes();
                } else {
                    board.queue.skipped += 1;
                }
                debug_assert!(board.queue.is_consistent());
                drop(board);

                summary.record(&source, &outcome);
                self.log_savings(&source, &outcome);
                debug!("[slot {}] {} is {}", slot, job.label(), job.state.as_str());
            }
        }
    }

    fn log_savings(&self, source: &Path, outcome: &JobOutcome) {
        let Some(dir) = &self.state_dir else {
            return;
        };
        let entry = match outcome {
            JobOutcome::Succeeded { saved_bytes, .. } => SavingsEntry {
                path: source.to_path_buf(),
                saved_bytes: *saved_bytes,
                reverted: false,
            },
            JobOutcome::RevertedLarger(_) => SavingsEntry {
                path: source.to_path_buf(),
                saved_bytes: 0,
                reverted: true,
            },
            _ => return,
        };
        if let Err(e) = dir.append_savings(&entry) {
            warn!("Could not append to savings log: {}", e);
        }
    }

    async fn mirror(&self) {
        let Some(dir) = &self.state_dir else {
            return;
        };
        let board = self.status.read().await.clone();
        if let Err(e) = dir.mirror(&board) {
            warn!("Could not write run state to {}: {}", dir.path().display(), e);
        }
    }
}

fn set_phase(board: &mut StatusBoard, slot: usize, job_id: Uuid, phase: SlotPhase) {
    if let Some(status) = board.slots.get_mut(&slot).filter(|s| s.job_id == job_id) {
        status.phase = phase;
    }
}

/// Worker task: process one file and report exactly one outcome.
async fn run_job(
    ctx: Arc<WorkerContext>,
    slot: usize,
    job_id: Uuid,
    source: PathBuf,
    tx: mpsc::Sender<WorkerEvent>,
    control: watch::Receiver<RunControl>,
) {
    let inner = tokio::spawn(process_file(
        ctx,
        slot,
        job_id,
        source.clone(),
        tx.clone(),
        control,
    ));
    let outcome = match inner.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("[slot {}] worker crashed: {}", slot, e);
            JobOutcome::Failed {
                reason: format!("worker crashed: {}", e),
            }
        }
    };

    let finished = WorkerEvent::Finished {
        slot,
        job_id,
        source,
        outcome,
    };
    if tx.send(finished).await.is_err() {
        error!("[slot {}] scheduler is gone; outcome lost", slot);
    }
}

/// Probe, classify, plan, transcode and check one file
async fn process_file(
    ctx: Arc<WorkerContext>,
    slot: usize,
    job_id: Uuid,
    source: PathBuf,
    tx: mpsc::Sender<WorkerEvent>,
    control: watch::Receiver<RunControl>,
) -> JobOutcome {
    let config = &ctx.config;

    let probe = ctx.probe.clone();
    let probe_path = source.clone();
    let info = match tokio::task::spawn_blocking(move || probe.probe(&probe_path)).await {
        Ok(Ok(info)) => info,
        Ok(Err(e)) => {
            return JobOutcome::Failed {
                reason: e.to_string(),
            }
        }
        Err(e) => {
            return JobOutcome::Failed {
                reason: format!("probe task failed: {}", e),
            }
        }
    };

    let default_grain = config.svt.film_grain;
    let label = if config.encode.detect_grain {
        let classifier = ctx.classifier.clone();
        let content = config.content.clone();
        let classify_info = info.clone();
        tokio::task::spawn_blocking(move || {
            classifier.label(&classify_info, &content, default_grain)
        })
        .await
        .unwrap_or_else(|_| ContentLabel::unclassified(LabelSource::Default, default_grain))
    } else {
        ContentLabel::unclassified(LabelSource::Default, default_grain)
    };

    let plan = match plan(&info, &label, config, ctx.threads) {
        Ok(plan) => plan,
        Err(skip) => return JobOutcome::SkippedUnsupported(skip),
    };
    info!(
        "[slot {}] {}: {} {}x{} {}, {:?} ({:?}) -> crf {} preset {} grain {} {}",
        slot,
        file_label(&source),
        info.codec_name,
        info.width,
        info.height,
        plan.hdr,
        plan.label.kind,
        plan.label.source,
        plan.crf,
        plan.preset,
        plan.grain,
        plan.pix_fmt.as_str()
    );

    // The file may have vanished while we were probing
    if !source.exists() {
        return JobOutcome::SkippedMissing;
    }

    let output = ctx.jobs_dir.join(format!("{}.mkv", job_id));
    let mapping = StreamMapping::for_source(&info, &config.audio, ctx.audio_encoder);
    let request = TranscodeRequest {
        input: &source,
        output: &output,
        plan: &plan,
        mapping: &mapping,
        encoded_by: &config.encode.encoded_by,
    };
    let cmd = ctx.transcoder.command(&request);
    debug!("[slot {}] {:?}", slot, cmd.as_std());

    let _ = tx.send(WorkerEvent::Started { slot, job_id }).await;
    let progress_tx = tx.clone();
    let result = run_transcode(cmd, info.duration_secs, control, ctx.grace, move |sample| {
        // progress is lossy; a full channel just drops the sample
        let _ = progress_tx.try_send(WorkerEvent::Progress {
            slot,
            job_id,
            sample,
        });
    })
    .await;

    if let Err(e) = result {
        remove_partial(&output);
        return JobOutcome::Failed {
            reason: e.to_string(),
        };
    }

    let _ = tx.send(WorkerEvent::Finalizing { slot, job_id }).await;

    match safety::evaluate(&info, &output, config.encode.allow_larger_files) {
        SafetyVerdict::Invalid => JobOutcome::Failed {
            reason: EncodeError::EmptyOutput(output).to_string(),
        },
        SafetyVerdict::Revert(record) => JobOutcome::RevertedLarger(record),
        SafetyVerdict::Accept { saved_bytes } => {
            let installed = match safety::install_output(&output, &source) {
                Ok(path) => path,
                Err(e) => {
                    remove_partial(&output);
                    return JobOutcome::Failed {
                        reason: e.to_string(),
                    };
                }
            };

            let mut source_removed = false;
            if config.files.remove_input_file {
                match safety::remove_source(&source) {
                    Ok(()) => source_removed = true,
                    Err(e) => warn!("[slot {}] {}", slot, e),
                }
            }

            JobOutcome::Succeeded {
                output: installed,
                saved_bytes,
                source_removed,
            }
        }
    }
}

fn remove_partial(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove partial output {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::tests::sdr_info;
    use crate::probe::{DolbyVisionInfo, HdrKind, ProbeError, VideoInfo};
    use crate::state::new_shared_status;
    use std::fs;
    use tempfile::TempDir;
    use tokio::process::Command;

    /// Probe that reads the size from disk and derives the rest from the name
    struct FakeProbe;

    impl MediaProbe for FakeProbe {
        fn probe(&self, path: &Path) -> Result<VideoInfo, ProbeError> {
            let name = file_label(path);
            if name.contains("corrupt") {
                return Err(ProbeError::Corrupt {
                    path: path.to_path_buf(),
                    reason: "moov atom not found".to_string(),
                });
            }
            let mut info = VideoInfo {
                path: path.to_path_buf(),
                size_bytes: fs::metadata(path).map(|m| m.len()).unwrap_or(0),
                duration_secs: 10.0,
                ..sdr_info()
            };
            if name.contains("dv5") {
                info.hdr = HdrKind::DolbyVision;
                info.dolby_vision = Some(DolbyVisionInfo {
                    profile: Some(5),
                    bl_compat_id: Some(0),
                    el_present: false,
                    rpu_present: true,
                });
            }
            Ok(info)
        }
    }

    /// Shell transcoder; output size depends on the source name
    struct ShellTranscoder;

    impl Transcoder for ShellTranscoder {
        fn command(&self, req: &TranscodeRequest<'_>) -> Command {
            let name = file_label(req.input);
            let size = fs::metadata(req.input).map(|m| m.len()).unwrap_or(0);
            let script = if name.contains("fail") {
                "echo 'encoder error' >&2; exit 1".to_string()
            } else if name.contains("slow") {
                format!("sleep 0.5; head -c {} /dev/zero > \"$1\"", size / 2)
            } else if name.contains("hang") {
                "sleep 30".to_string()
            } else if name.contains("big") {
                format!("head -c {} /dev/zero > \"$1\"", size * 105 / 100)
            } else if name.contains("empty") {
                ": > \"$1\"".to_string()
            } else {
                format!(
                    "printf 'out_time_us=5000000\\nprogress=continue\\n'; head -c {} /dev/zero > \"$1\"; printf 'out_time_us=10000000\\nprogress=end\\n'",
                    size / 2
                )
            };
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(script).arg("sh").arg(req.output);
            cmd
        }
    }

    struct Fixture {
        dir: TempDir,
        jobs: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let jobs = dir.path().join("jobs");
            fs::create_dir(&jobs).unwrap();
            Self { dir, jobs }
        }

        fn media(&self, name: &str, len: usize) -> PathBuf {
            let path = self.dir.path().join(name);
            fs::write(&path, vec![1u8; len]).unwrap();
            path
        }

        fn scheduler(&self, config: Config, control: watch::Receiver<RunControl>) -> JobScheduler {
            let ctx = WorkerContext {
                config: Arc::new(config),
                probe: Arc::new(FakeProbe),
                classifier: Arc::new(ClassifierChain::new(None, 30)),
                transcoder: Arc::new(ShellTranscoder),
                audio_encoder: AudioEncoder::Opus,
                threads: 2,
                jobs_dir: self.jobs.clone(),
                grace: Duration::from_secs(1),
            };
            JobScheduler::new(ctx, new_shared_status(0, 1), control)
                .with_poll_interval(Duration::from_millis(20))
        }
    }

    fn config_with_jobs(jobs: u32) -> Config {
        let mut config = Config::default();
        config.encode.max_parallel_jobs = jobs;
        config
    }

    #[tokio::test]
    async fn test_mixed_batch_outcomes() {
        let fx = Fixture::new();
        let good = fx.media("good.mkv", 4000);
        let dv = fx.media("film.dv5.mkv", 4000);
        let missing = fx.dir.path().join("gone.mkv");
        let big = fx.media("big.mkv", 4000);
        let failing = fx.media("fail.mkv", 4000);
        let corrupt = fx.media("corrupt.mp4", 4000);
        let empty = fx.media("empty.mkv", 4000);

        let (_tx, rx) = watch::channel(RunControl::Running);
        let scheduler = fx.scheduler(config_with_jobs(2), rx);
        let summary = scheduler
            .run(vec![
                good.clone(),
                dv.clone(),
                missing.clone(),
                big.clone(),
                failing,
                corrupt,
                empty,
            ])
            .await;

        assert_eq!(summary.total_files, 7);
        assert_eq!(summary.kept, 1);
        assert_eq!(summary.skipped, 6);
        assert_eq!(summary.missing_files, vec![missing]);
        assert_eq!(summary.unsupported, 1);
        assert_eq!(summary.unsupported_files[0].code, 2);
        assert_eq!(summary.reverted, 1);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.saved_bytes, 2000);
        assert!(!summary.aborted);

        // kept output installed next to the source, source left alone
        assert_eq!(fs::metadata(fx.dir.path().join("good.av1.mkv")).unwrap().len(), 2000);
        assert!(good.exists());
        // reverted source untouched and no output
        assert_eq!(fs::read(&big).unwrap().len(), 4000);
        assert!(!fx.dir.path().join("big.av1.mkv").exists());
        assert!(dv.exists());
        // no temp leftovers
        assert_eq!(fs::read_dir(&fx.jobs).unwrap().count(), 0);

        let board = scheduler.status().read().await.clone();
        assert_eq!(board.queue.total, 7);
        assert_eq!(board.queue.started, 7);
        assert_eq!(board.queue.processed, 1);
        assert_eq!(board.queue.skipped, 6);
        assert_eq!(board.queue.active, 0);
        assert!(board.slots.is_empty());
    }

    #[tokio::test]
    async fn test_queue_invariant_holds_while_running() {
        let fx = Fixture::new();
        let files: Vec<PathBuf> = (0..6)
            .map(|i| fx.media(&format!("slow{}.mkv", i), 1000))
            .collect();

        let (_tx, rx) = watch::channel(RunControl::Running);
        let scheduler = fx.scheduler(config_with_jobs(3), rx);
        let status = scheduler.status();

        let watcher = tokio::spawn(async move {
            let mut max_active = 0;
            for _ in 0..200 {
                {
                    let board = status.read().await;
                    assert!(board.queue.is_consistent());
                    assert_eq!(board.queue.active, board.slots.len());
                    assert!(board.queue.active <= 3);
                    assert!(board.slots.keys().all(|s| (1..=3).contains(s)));
                    max_active = max_active.max(board.queue.active);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            max_active
        });

        let summary = scheduler.run(files).await;
        assert_eq!(summary.kept, 6);
        assert!(watcher.await.unwrap() >= 2);
    }

    #[tokio::test]
    async fn test_drain_finishes_running_and_starts_nothing() {
        let fx = Fixture::new();
        let first = fx.media("slow-a.mkv", 1000);
        let second = fx.media("slow-b.mkv", 1000);

        let (tx, rx) = watch::channel(RunControl::Running);
        let scheduler = fx.scheduler(config_with_jobs(1), rx);
        let handle = tokio::spawn(async move { scheduler.run(vec![first, second]).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(RunControl::Draining).unwrap();
        let summary = handle.await.unwrap();

        assert_eq!(summary.kept, 1);
        assert_eq!(summary.not_started, 1);
        assert!(!summary.aborted);
        assert!(fx.dir.path().join("slow-a.av1.mkv").exists());
        assert!(!fx.dir.path().join("slow-b.av1.mkv").exists());
    }

    #[tokio::test]
    async fn test_abort_stops_running_encodes() {
        let fx = Fixture::new();
        let a = fx.media("hang-a.mkv", 1000);
        let b = fx.media("hang-b.mkv", 1000);
        let c = fx.media("hang-c.mkv", 1000);

        let (tx, rx) = watch::channel(RunControl::Running);
        let scheduler = fx.scheduler(config_with_jobs(2), rx);
        let started = std::time::Instant::now();
        let handle = tokio::spawn(async move { scheduler.run(vec![a, b, c]).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(RunControl::Abort).unwrap();
        let summary = handle.await.unwrap();

        assert!(summary.aborted);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.not_started, 1);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(fs::read_dir(&fx.jobs).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_remove_input_after_acceptance() {
        let fx = Fixture::new();
        let source = fx.media("episode.mp4", 3000);
        let mut config = config_with_jobs(1);
        config.files.remove_input_file = true;

        let (_tx, rx) = watch::channel(RunControl::Running);
        let summary = fx.scheduler(config, rx).run(vec![source.clone()]).await;

        assert_eq!(summary.kept, 1);
        assert!(summary.kept_files[0].source_removed);
        assert!(!source.exists());
        assert!(fx.dir.path().join("episode.av1.mkv").exists());
    }

    #[tokio::test]
    async fn test_same_stem_sources_both_survive_remove_input() {
        let fx = Fixture::new();
        let mkv = fx.media("movie.mkv", 4000);
        let mp4 = fx.media("movie.mp4", 6000);
        let mut config = config_with_jobs(2);
        config.files.remove_input_file = true;

        let (_tx, rx) = watch::channel(RunControl::Running);
        let summary = fx.scheduler(config, rx).run(vec![mkv.clone(), mp4.clone()]).await;

        assert_eq!(summary.kept, 2);
        let mut outputs: Vec<u64> = summary
            .kept_files
            .iter()
            .map(|k| fs::metadata(&k.output).unwrap().len())
            .collect();
        outputs.sort_unstable();
        assert_eq!(outputs, vec![2000, 3000]);
        assert_ne!(summary.kept_files[0].output, summary.kept_files[1].output);
        assert!(fx.dir.path().join("movie.av1.mkv").exists());
    }

    #[tokio::test]
    async fn test_existing_outputs_keep_source() {
        let fx = Fixture::new();
        let source = fx.media("movie.mkv", 4000);
        fs::write(fx.dir.path().join("movie.av1.mkv"), b"earlier").unwrap();
        fs::write(fx.dir.path().join("movie.mkv.av1.mkv"), b"earlier").unwrap();
        let mut config = config_with_jobs(1);
        config.files.remove_input_file = true;

        let (_tx, rx) = watch::channel(RunControl::Running);
        let summary = fx.scheduler(config, rx).run(vec![source.clone()]).await;

        assert_eq!(summary.failed, 1);
        assert_eq!(fs::read(&source).unwrap().len(), 4000);
        assert_eq!(fs::read(fx.dir.path().join("movie.av1.mkv")).unwrap(), b"earlier");
        assert_eq!(fs::read_dir(&fx.jobs).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_reverted_source_kept_even_with_remove_input() {
        let fx = Fixture::new();
        let source = fx.media("big.mkv", 3000);
        let mut config = config_with_jobs(1);
        config.files.remove_input_file = true;

        let (_tx, rx) = watch::channel(RunControl::Running);
        let summary = fx.scheduler(config, rx).run(vec![source.clone()]).await;

        assert_eq!(summary.reversions.len(), 1);
        assert_eq!(summary.reversions[0].encoded_bytes, 3150);
        assert_eq!(fs::read(&source).unwrap().len(), 3000);
    }

    #[tokio::test]
    async fn test_state_dir_mirrors_final_board() {
        let fx = Fixture::new();
        let state = StateDir::create(fx.dir.path()).unwrap();
        let reader = StateDir::open(state.path());
        let good = fx.media("good.mkv", 2000);
        let big = fx.media("big.mkv", 2000);

        let (_tx, rx) = watch::channel(RunControl::Running);
        let scheduler = fx.scheduler(config_with_jobs(2), rx).with_state_dir(state);
        scheduler.run(vec![good, big]).await;

        let record = reader.read_queue().unwrap();
        assert_eq!(record.queue.total, 2);
        assert_eq!(record.queue.processed, 1);
        assert_eq!(record.queue.skipped, 1);
        assert_eq!(record.queue.saved_bytes, 1000);
        assert_eq!(record.slot_count, 2);
        assert!(reader.read_slots(2).is_empty());

        let savings = reader.read_savings();
        assert_eq!(savings.len(), 2);
        assert_eq!(savings.iter().filter(|s| s.reverted).count(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_returns_immediately() {
        let fx = Fixture::new();
        let (_tx, rx) = watch::channel(RunControl::Running);
        let summary = fx.scheduler(config_with_jobs(2), rx).run(Vec::new()).await;
        assert_eq!(summary.total_files, 0);
        assert_eq!(summary.finished_files(), 0);
        assert!(summary.finished_at.is_some());
    }
}
