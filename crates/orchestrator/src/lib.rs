//! av1conv
//!
//! Batch conversion of video libraries to AV1 with SVT-AV1. Every file is
//! probed, optionally classified, planned and transcoded under a concurrency
//! cap; an encode is only kept when it made the file smaller.

pub mod batch;
pub mod classify;
pub mod concurrency;
pub mod encode;
pub mod interrupt;
pub mod job;
pub mod monitor;
pub mod planner;
pub mod probe;
pub mod report;
pub mod safety;
pub mod scan;
pub mod scheduler;
pub mod startup;
pub mod state;

pub use av1conv_config as config;
pub use av1conv_config::Config;
pub use batch::{describe_inspection, BatchError, BatchOptions, BatchRunner, Inspection};
pub use classify::{ClassifierChain, ContentClassifier, ContentKind, ContentLabel};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use encode::{AudioEncoder, EncodeError, FfmpegTranscoder, ProgressSample, Transcoder};
pub use interrupt::{InterruptController, RunControl, ABORT_EXIT_CODE};
pub use job::{CompletionCode, EncodeJob, JobOutcome, JobState};
pub use monitor::ProgressMonitor;
pub use planner::{plan, EncodePlan, PlanSkip};
pub use probe::{FfprobeProbe, MediaProbe, ProbeError, VideoInfo};
pub use report::RunSummary;
pub use safety::{ReversionRecord, SafetyVerdict};
pub use scan::{scan, ScanOptions};
pub use scheduler::{JobScheduler, WorkerContext};
pub use startup::{run_startup_checks, StartupError, Toolchain};
pub use state::{latest_state_dir, QueueState, SharedStatus, SlotStatus, StateDir, StatusBoard};
