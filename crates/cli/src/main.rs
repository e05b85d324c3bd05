//! CLI entry point for av1conv
//!
//! Parses command line arguments, builds the effective configuration
//! (file, then `AV1CONV_*` environment, then flags) and runs one batch.

use anyhow::{Context, Result};
use av1conv::config::parse_size;
use av1conv::{
    describe_inspection, run_startup_checks, BatchOptions, BatchRunner, Config, RunSummary,
    ABORT_EXIT_CODE,
};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;

/// Exit status for configuration, startup and other setup failures
const FATAL_EXIT_CODE: u8 = 1;

/// av1conv - Batch conversion of video libraries to AV1 (SVT-AV1)
#[derive(Parser, Debug)]
#[command(name = "av1conv")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory to convert (or a single video file)
    #[arg(required_unless_present_any = ["generate_config", "detect_grain_test"])]
    directory: Option<PathBuf>,

    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Constant rate factor (0-63)
    #[arg(short, long)]
    crf: Option<u8>,

    /// SVT-AV1 preset (-1..13)
    #[arg(short, long, allow_negative_numbers = true)]
    preset: Option<i8>,

    /// Keyframe interval in frames
    #[arg(short, long)]
    gop: Option<u32>,

    /// Encodes to run at once (1-4)
    #[arg(short = 'J', long)]
    parallel: Option<u32>,

    /// Minimum file size, e.g. 1G or 500M
    #[arg(short, long)]
    size: Option<String>,

    /// Delete the source after a successful conversion
    #[arg(short, long)]
    remove: bool,

    /// Ignore the size threshold
    #[arg(short, long)]
    force: bool,

    /// Re-encode sources that are already AV1
    #[arg(short = 'F', long)]
    force_reencode: bool,

    /// Downscale sources taller than 1080 lines
    #[arg(short = 'R', long = "resize-1080p", conflicts_with = "resize_720p")]
    resize_1080p: bool,

    /// Downscale sources taller than 720 lines
    #[arg(long = "resize-720p")]
    resize_720p: bool,

    /// Keep encodes that are larger than their source
    #[arg(long)]
    allow_larger: bool,

    /// Downmix audio to stereo
    #[arg(long)]
    stereo: bool,

    /// Audio bitrate, e.g. 128k
    #[arg(long)]
    audio_bitrate: Option<String>,

    /// Classify content and adapt grain, CRF and preset
    #[arg(long, conflicts_with = "no_detect_grain")]
    detect_grain: bool,

    /// Disable content classification
    #[arg(long)]
    no_detect_grain: bool,

    /// Print the classification and plan for one file, then exit
    #[arg(long, value_name = "FILE")]
    detect_grain_test: Option<PathBuf>,

    /// External content classifier executable
    #[arg(long, value_name = "PATH")]
    classifier: Option<PathBuf>,

    /// Skip every Dolby Vision source
    #[arg(long)]
    skip_dolby_vision: bool,

    /// Skip files whose name contains TERM (repeatable)
    #[arg(long = "ignore", value_name = "TERM")]
    ignore: Vec<String>,

    /// Directory for run state and temporary encodes
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Keep the run state directory at exit
    #[arg(long)]
    keep_temp: bool,

    /// ffmpeg binary to use
    #[arg(long, value_name = "PATH")]
    ffmpeg: Option<PathBuf>,

    /// Write a JSON run report to this path
    #[arg(long, value_name = "PATH")]
    report_json: Option<PathBuf>,

    /// Print a sample configuration file and exit
    #[arg(long)]
    generate_config: bool,

    /// Do not log periodic progress frames
    #[arg(long)]
    no_monitor: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp_secs()
        .init();
}

/// Build the effective configuration: file or defaults, environment, flags
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            let mut config = Config::default();
            config
                .apply_env_overrides()
                .context("Invalid AV1CONV_* environment override")?;
            config
        }
    };
    apply_cli_overrides(args, &mut config)?;
    config.validate().context("Invalid settings")?;
    Ok(config)
}

fn apply_cli_overrides(args: &Args, config: &mut Config) -> Result<()> {
    let encode = &mut config.encode;
    if let Some(crf) = args.crf {
        encode.crf = crf;
    }
    if let Some(preset) = args.preset {
        encode.preset = preset;
    }
    if let Some(gop) = args.gop {
        encode.gop = gop;
    }
    if let Some(parallel) = args.parallel {
        encode.max_parallel_jobs = parallel;
    }
    if args.force_reencode {
        encode.force_reencode = true;
    }
    if args.resize_1080p {
        encode.resize_height = Some(1080);
    } else if args.resize_720p {
        encode.resize_height = Some(720);
    }
    if args.allow_larger {
        encode.allow_larger_files = true;
    }
    if args.detect_grain {
        encode.detect_grain = true;
    } else if args.no_detect_grain {
        encode.detect_grain = false;
    }
    if args.skip_dolby_vision {
        encode.skip_dolby_vision = true;
    }

    if let Some(size) = &args.size {
        parse_size(size).with_context(|| format!("Invalid size threshold '{}'", size))?;
        config.files.size_threshold = size.clone();
    }
    if args.remove {
        config.files.remove_input_file = true;
    }
    if args.force {
        config.files.force = true;
    }
    config.files.extra_ignore_terms.extend(args.ignore.iter().cloned());

    if args.stereo {
        config.audio.stereo = true;
    }
    if let Some(bitrate) = &args.audio_bitrate {
        config.audio.bitrate = Some(bitrate.clone());
    }
    if let Some(classifier) = &args.classifier {
        config.content.classifier = Some(classifier.clone());
    }

    if let Some(ffmpeg) = &args.ffmpeg {
        config.paths.ffmpeg = Some(ffmpeg.clone());
    }
    if let Some(temp_dir) = &args.temp_dir {
        config.paths.temp_root = temp_dir.clone();
    }
    if args.keep_temp {
        config.paths.keep_temp = true;
    }
    Ok(())
}

async fn run(args: Args) -> Result<u8> {
    let config = load_config(&args)?;
    let toolchain = run_startup_checks(&config).context("Startup checks failed")?;
    info!(
        "Using {} ({}), audio encoder {}",
        toolchain.ffmpeg.display(),
        toolchain.version.as_deref().unwrap_or("unknown version"),
        toolchain.audio_encoder.codec_name()
    );

    let runner = BatchRunner::new(config, toolchain);

    if let Some(file) = &args.detect_grain_test {
        let inspection = runner
            .inspect(file)
            .with_context(|| format!("Cannot inspect {}", file.display()))?;
        for line in describe_inspection(&inspection) {
            println!("{}", line);
        }
        return Ok(0);
    }

    let target = args
        .directory
        .clone()
        .context("No directory given")?;
    let opts = BatchOptions {
        target,
        monitor: !args.no_monitor,
        report_json: args.report_json.clone(),
    };
    let summary = runner.run(&opts).await?;
    Ok(summary_exit_status(&summary))
}

/// 130 after an escalated abort, 0 otherwise
fn summary_exit_status(summary: &RunSummary) -> u8 {
    if summary.aborted {
        ABORT_EXIT_CODE
    } else {
        0
    }
}

fn exit_status(result: &Result<u8>) -> u8 {
    match result {
        Ok(code) => *code,
        Err(_) => FATAL_EXIT_CODE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.generate_config {
        print!("{}", Config::sample_toml());
        return ExitCode::SUCCESS;
    }

    init_logging(args.verbose);

    let result = run(args).await;
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    ExitCode::from(exit_status(&result))
}
