use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use stepreel::assemble::{supported_encoders, AssemblyOutcome};
use stepreel::config::{load_config, AnimationConfig, Codec, Interpolation};
use stepreel::engine::RunMetadata;
use stepreel::error_codes::{find_coded_error, AbortReason, CodedError};
use stepreel::hook::StepHook;
use stepreel::process::Toolchain;
use stepreel::run::{postprocess, AssemblyStatus, CaptureSession, RunReport};
use stepreel::synthetic::SyntheticEngine;

const GIT_HASH: Option<&str> = option_env!("STEPREEL_GIT_HASH");

#[derive(Debug, Parser)]
#[command(name = "stepreel", version)]
#[command(about = "Turn the intermediate steps of an image generation run into a video")]
struct Cli {
    /// Verbose logging, encoder output and ffprobe verification.
    #[arg(long, global = true)]
    debug: bool,
    /// Print a JSON report on stdout instead of a summary.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate a config file.
    Check { config: PathBuf },
    /// Show which codecs the installed ffmpeg can encode.
    Codecs,
    /// Run the synthetic engine with capture enabled and assemble its steps.
    Simulate {
        #[command(flatten)]
        settings: Settings,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long, default_value_t = 1)]
        seed: i64,
        #[arg(long, default_value_t = 20)]
        steps: u32,
        #[arg(long, default_value_t = 64)]
        width: u32,
        #[arg(long, default_value_t = 64)]
        height: u32,
        /// Stop the engine after this many steps.
        #[arg(long)]
        interrupt_after: Option<u32>,
    },
    /// Assemble a video from frames already on disk.
    Encode {
        /// Run metadata as YAML or JSON.
        metadata: PathBuf,
        #[command(flatten)]
        settings: Settings,
        /// Steps the run reached; defaults to the configured step count.
        #[arg(long)]
        captured: Option<u32>,
    },
}

#[derive(Debug, Args)]
struct Settings {
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    #[arg(long, value_enum)]
    codec: Option<Codec>,
    #[arg(long, value_enum)]
    interpolation: Option<Interpolation>,
    /// Target video length in seconds.
    #[arg(long)]
    duration: Option<f64>,
    #[arg(long)]
    skip_steps: Option<u32>,
    /// Directory the frame and video paths are relative to.
    #[arg(long)]
    base_dir: Option<PathBuf>,
    #[arg(long)]
    keep_frames: bool,
    /// Capture frames but do not create a video.
    #[arg(long)]
    no_video: bool,
    /// Do not assemble runs that stopped early.
    #[arg(long)]
    strict: bool,
}

impl Settings {
    fn resolve(&self, debug: bool) -> Result<AnimationConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)
                .map_err(|error| CodedError::config(format!("{error:#}")))?,
            None => AnimationConfig::default(),
        };
        config.enabled = true;
        config.debug |= debug;
        if let Some(codec) = self.codec {
            config.codec = codec;
        }
        if let Some(interpolation) = self.interpolation {
            config.interpolation = interpolation;
        }
        if let Some(duration) = self.duration {
            config.duration = duration;
        }
        if let Some(skip_steps) = self.skip_steps {
            config.skip_steps = skip_steps;
        }
        if let Some(base_dir) = &self.base_dir {
            config.base_dir = base_dir.clone();
        }
        if self.keep_frames {
            config.delete_intermediate = false;
        }
        if self.no_video {
            config.create_animation = false;
        }
        if self.strict {
            config.run_incomplete = false;
        }
        config
            .validate()
            .map_err(|error| CodedError::config(format!("{error:#}")))?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let task = match Task::resolve(&cli) {
        Ok(task) => task,
        Err(error) => {
            report_error(&error, cli.json);
            return ExitCode::FAILURE;
        }
    };
    // A config file with `debug: true` turns on debug logging too.
    init_tracing(cli.debug || task.debug());
    debug!(
        version = env!("CARGO_PKG_VERSION"),
        git = GIT_HASH.unwrap_or("unknown"),
        "stepreel starting"
    );

    match task.run(cli.json) {
        Ok(code) => code,
        Err(error) => {
            report_error(&error, cli.json);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "stepreel=debug" } else { "stepreel=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn report_error(error: &anyhow::Error, json: bool) {
    if !json {
        eprintln!("error: {error:#}");
        return;
    }
    let coded = find_coded_error(error)
        .cloned()
        .unwrap_or_else(|| CodedError::new("E_RUNTIME", format!("{error:#}")));
    match serde_json::to_string(&coded.envelope()) {
        Ok(envelope) => println!("{envelope}"),
        Err(_) => eprintln!("error: {error:#}"),
    }
}

/// A parsed command with its settings resolved, ready to run.
enum Task {
    Check(PathBuf),
    Codecs,
    Simulate {
        engine: SyntheticEngine,
        config: AnimationConfig,
    },
    Encode {
        metadata: PathBuf,
        config: AnimationConfig,
        captured: Option<u32>,
    },
}

impl Task {
    fn resolve(cli: &Cli) -> Result<Self> {
        Ok(match &cli.command {
            Commands::Check { config } => Self::Check(config.clone()),
            Commands::Codecs => Self::Codecs,
            Commands::Simulate {
                settings,
                prompt,
                seed,
                steps,
                width,
                height,
                interrupt_after,
            } => {
                let mut engine = SyntheticEngine {
                    seed: *seed,
                    steps: *steps,
                    width: *width,
                    height: *height,
                    interrupt_after: *interrupt_after,
                    ..SyntheticEngine::default()
                };
                if let Some(prompt) = prompt {
                    engine.prompt = prompt.clone();
                }
                Self::Simulate {
                    engine,
                    config: settings.resolve(cli.debug)?,
                }
            }
            Commands::Encode {
                metadata,
                settings,
                captured,
            } => Self::Encode {
                metadata: metadata.clone(),
                config: settings.resolve(cli.debug)?,
                captured: *captured,
            },
        })
    }

    fn debug(&self) -> bool {
        match self {
            Self::Check(_) | Self::Codecs => false,
            Self::Simulate { config, .. } | Self::Encode { config, .. } => config.debug,
        }
    }

    fn run(self, json: bool) -> Result<ExitCode> {
        match self {
            Self::Check(path) => run_check(&path, json),
            Self::Codecs => run_codecs(json),
            Self::Simulate { engine, config } => run_simulate(&engine, &config, json),
            Self::Encode {
                metadata,
                config,
                captured,
            } => run_encode(&metadata, &config, captured, json),
        }
    }
}

fn run_check(path: &Path, json: bool) -> Result<ExitCode> {
    let config = load_config(path).map_err(|error| CodedError::config(format!("{error:#}")))?;
    if json {
        print_json(&serde_json::json!({ "ok": true, "config": config }))?;
    } else {
        println!(
            "OK: {} ({}, interpolation {}, {}s, skip {} steps)",
            path.display(),
            config.codec,
            config.interpolation,
            config.duration,
            config.skip_steps
        );
        println!("Frames: {}", config.frames_dir().display());
        println!("Videos: {}", config.videos_dir().display());
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Debug, Serialize)]
struct CodecSupport {
    codec: Codec,
    library: &'static str,
    supported: bool,
}

fn run_codecs(json: bool) -> Result<ExitCode> {
    let toolchain = Toolchain::from_env();
    let ffmpeg = toolchain
        .ffmpeg
        .as_deref()
        .ok_or_else(|| CodedError::from(&AbortReason::EncoderMissing))?;
    let encoders = supported_encoders(ffmpeg, AnimationConfig::default().probe_timeout())
        .context("failed to list ffmpeg encoders")?;
    let support = Codec::ALL
        .into_iter()
        .map(|codec| CodecSupport {
            codec,
            library: codec.library(),
            supported: encoders.contains(codec.library()),
        })
        .collect::<Vec<_>>();

    if json {
        print_json(&support)?;
    } else {
        println!("ffmpeg: {}", ffmpeg.display());
        for entry in &support {
            let mark = if entry.supported { "yes" } else { "no" };
            println!("{:<10} {:<12} {mark}", entry.codec, entry.library);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_simulate(engine: &SyntheticEngine, config: &AnimationConfig, json: bool) -> Result<ExitCode> {
    let hook = StepHook::passthrough();
    let session = CaptureSession::begin(&hook, config, &engine.run_start());
    let metadata = engine.run(&hook)?;
    let report = session.finish(&metadata, Toolchain::from_env());
    finish_report(&report, json)
}

fn run_encode(
    metadata_path: &Path,
    config: &AnimationConfig,
    captured: Option<u32>,
    json: bool,
) -> Result<ExitCode> {
    let contents = fs::read_to_string(metadata_path)
        .with_context(|| format!("failed to read run metadata {}", metadata_path.display()))?;
    let metadata: RunMetadata = serde_yaml::from_str(&contents).map_err(|error| {
        anyhow!(
            "failed to parse run metadata {}: {error}",
            metadata_path.display()
        )
    })?;
    let captured = captured.unwrap_or(metadata.steps);
    let report = postprocess(config, &metadata, captured, Toolchain::from_env());
    finish_report(&report, json)
}

fn finish_report(report: &RunReport, json: bool) -> Result<ExitCode> {
    if json {
        print_json(report)?;
    } else {
        print_summary(report);
    }
    let ok = report.video_created() || matches!(report.status, AssemblyStatus::NotRequested);
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::from(2) })
}

fn print_summary(report: &RunReport) {
    println!("Captured steps: {}", report.captured_steps);
    match &report.status {
        AssemblyStatus::Disabled => println!("Capture disabled"),
        AssemblyStatus::NotRequested => println!("Video not requested"),
        AssemblyStatus::SkippedIncomplete { captured, expected } => {
            println!("Skipped incomplete run ({captured}/{expected} steps)")
        }
        AssemblyStatus::Aborted { code, reason } => println!("Aborted [{code}]: {reason}"),
        AssemblyStatus::Ran(assembly) => match &assembly.outcome {
            AssemblyOutcome::Encoded { outfile, frames } => {
                println!("Wrote {} ({frames} frames)", outfile.display())
            }
            AssemblyOutcome::Aborted { code, reason } => println!("Aborted [{code}]: {reason}"),
            AssemblyOutcome::EncoderFailed { exit_code } => match exit_code {
                Some(code) => println!("Encoder failed with exit code {code}"),
                None => println!("Encoder was terminated by a signal"),
            },
            AssemblyOutcome::TimedOut { timeout } => {
                println!("Encoder timed out after {}s", timeout.as_secs())
            }
            AssemblyOutcome::LaunchFailed { message } => println!("Encoder did not run: {message}"),
        },
    }
    if let Some(cleanup) = &report.cleanup {
        println!("Removed {} intermediate files", cleanup.removed);
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to serialize report")?;
    println!("{text}");
    Ok(())
}
