//! Video assembly: precondition checks, encoder invocation, optional
//! verification.
//!
//! The pipeline walks `Idle → Validating → Encoding → Verifying → Done`, or
//! leaves `Validating` for `Aborted`. Nothing here returns an error to the
//! caller; every failure becomes an [`AssemblyOutcome`] plus log lines.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::capture::is_frame_of;
use crate::config::AnimationConfig;
use crate::error_codes::AbortReason;
use crate::params::RunParameters;
use crate::process::{run_program, run_shell, ProcessError, Toolchain};

/// The ffmpeg command line, one `{placeholder}` per substituted value.
pub const DEFAULT_TEMPLATE: &str = "\"{ffmpeg}\" -hide_banner -loglevel {loglevel} -hwaccel auto -y -framerate {framerate} -start_number {skip} -i \"{inpath}/{pattern}-{short_name}.{extension}\" -r {videorate} {preset} {minterpolate} {flags} -metadata title=\"{description}\" -metadata description=\"{info}\" -metadata author=\"stable-diffusion\" -metadata album_artist=\"{author}\" \"{outfile}\"";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyStage {
    Idle,
    Validating,
    Encoding,
    Verifying,
    Done,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AssemblyOutcome {
    Encoded { outfile: PathBuf, frames: usize },
    Aborted { code: &'static str, reason: AbortReason },
    EncoderFailed { exit_code: Option<i32> },
    TimedOut { timeout: Duration },
    LaunchFailed { message: String },
}

impl AssemblyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Encoded { .. })
    }

    fn aborted(reason: AbortReason) -> Self {
        Self::Aborted {
            code: reason.code(),
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssemblyReport {
    pub outcome: AssemblyOutcome,
    /// Every state the pipeline entered, in order.
    pub stages: Vec<AssemblyStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

pub struct VideoAssembler {
    toolchain: Toolchain,
    template: String,
    debug: bool,
    encode_timeout: Duration,
    probe_timeout: Duration,
}

impl VideoAssembler {
    pub fn new(toolchain: Toolchain, config: &AnimationConfig) -> Self {
        Self {
            toolchain,
            template: DEFAULT_TEMPLATE.to_owned(),
            debug: config.debug,
            encode_timeout: config.encode_timeout(),
            probe_timeout: config.probe_timeout(),
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub fn assemble(&self, params: &RunParameters) -> AssemblyReport {
        let mut run = StageLog::default();

        run.enter(AssemblyStage::Validating);
        let validated = match self.validate(params) {
            Ok(validated) => validated,
            Err(reason) => {
                error!(code = reason.code(), "video assembly aborted: {reason}");
                run.enter(AssemblyStage::Aborted);
                return run.finish(AssemblyOutcome::aborted(reason), None);
            }
        };

        run.enter(AssemblyStage::Encoding);
        let command = match render_command(&self.template, params, &validated.ffmpeg) {
            Ok(command) => command,
            Err(error) => {
                error!("failed to render encoder command: {error:#}");
                run.enter(AssemblyStage::Done);
                return run.finish(
                    AssemblyOutcome::LaunchFailed {
                        message: format!("{error:#}"),
                    },
                    None,
                );
            }
        };
        info!(
            outfile = %params.outfile.display(),
            frames = validated.frames,
            framerate = params.framerate,
            "creating video from captured frames"
        );
        let outcome = self.encode(&command, params, validated.frames);

        if self.debug {
            run.enter(AssemblyStage::Verifying);
            self.verify(&params.outfile);
        }

        run.enter(AssemblyStage::Done);
        run.finish(outcome, Some(command))
    }

    fn validate(&self, params: &RunParameters) -> Result<Validated, AbortReason> {
        if params.framerate <= 0.0 {
            return Err(AbortReason::ZeroFrameRate {
                captured: params.current,
                skip: params.skip,
                duration: params.duration,
            });
        }

        let frames = list_frames(&params.frames_dir, &params.short_name);
        if self.debug {
            debug!(count = frames.len(), frames = ?frames, "captured frames");
        }
        if frames.is_empty() {
            return Err(AbortReason::NoFrames {
                dir: params.frames_dir.clone(),
                short_name: params.short_name.clone(),
            });
        }

        let ffmpeg = self
            .toolchain
            .ffmpeg
            .clone()
            .ok_or(AbortReason::EncoderMissing)?;

        let supported = supported_encoders(&ffmpeg, self.probe_timeout).map_err(|error| {
            AbortReason::CapabilityQueryFailed {
                message: error.to_string(),
            }
        })?;
        if self.debug {
            debug!(encoders = ?supported, "encoders supported by ffmpeg");
        }
        let library = params.codec.library();
        if !supported.contains(library) {
            return Err(AbortReason::CodecUnsupported {
                library: library.to_owned(),
            });
        }

        if !params.videos_dir.is_dir() {
            info!(dir = %params.videos_dir.display(), "creating output directory");
            fs::create_dir_all(&params.videos_dir).map_err(|error| AbortReason::OutputDir {
                dir: params.videos_dir.clone(),
                message: error.to_string(),
            })?;
        }

        Ok(Validated {
            ffmpeg,
            frames: frames.len(),
        })
    }

    fn encode(&self, command: &str, params: &RunParameters, frames: usize) -> AssemblyOutcome {
        match run_shell(command, self.encode_timeout) {
            Ok(output) if output.success() => {
                if self.debug {
                    debug!(command, "encoder finished");
                    log_output(&output.stdout, &output.stderr);
                }
                AssemblyOutcome::Encoded {
                    outfile: params.outfile.clone(),
                    frames,
                }
            }
            Ok(output) => {
                error!(
                    command,
                    exit_code = ?output.exit_code(),
                    stdout = %output.stdout.trim(),
                    stderr = %output.stderr.trim(),
                    "encoder failed"
                );
                AssemblyOutcome::EncoderFailed {
                    exit_code: output.exit_code(),
                }
            }
            Err(ProcessError::Timeout { timeout, .. }) => {
                error!(command, ?timeout, "encoder timed out and was killed");
                AssemblyOutcome::TimedOut { timeout }
            }
            Err(error) => {
                error!(command, "could not run encoder: {error}");
                AssemblyOutcome::LaunchFailed {
                    message: error.to_string(),
                }
            }
        }
    }

    fn verify(&self, outfile: &Path) {
        let Some(ffprobe) = &self.toolchain.ffprobe else {
            warn!("cannot verify video: ffprobe not found");
            return;
        };
        let args = [
            OsStr::new("-hide_banner"),
            OsStr::new("-print_format"),
            OsStr::new("json"),
            OsStr::new("-show_streams"),
            outfile.as_os_str(),
        ];
        match run_program(ffprobe, args, self.probe_timeout) {
            Ok(output) => {
                info!(outfile = %outfile.display(), exit_code = ?output.exit_code(), "ffprobe report");
                log_output(&output.stdout, &output.stderr);
            }
            Err(error) => warn!("ffprobe did not run: {error}"),
        }
    }
}

struct Validated {
    ffmpeg: PathBuf,
    frames: usize,
}

#[derive(Default)]
struct StageLog {
    stages: Vec<AssemblyStage>,
}

impl StageLog {
    fn enter(&mut self, stage: AssemblyStage) {
        let from = self.stages.last().copied().unwrap_or(AssemblyStage::Idle);
        debug!(?from, to = ?stage, "assembly stage");
        self.stages.push(stage);
    }

    fn finish(self, outcome: AssemblyOutcome, command: Option<String>) -> AssemblyReport {
        AssemblyReport {
            outcome,
            stages: self.stages,
            command,
        }
    }
}

fn log_output(stdout: &str, stderr: &str) {
    if !stdout.trim().is_empty() {
        info!("{}", stdout.trim_end());
    }
    if !stderr.trim().is_empty() {
        info!("{}", stderr.trim_end());
    }
}

/// Sorted names of the files in `dir` that belong to the run.
pub fn list_frames(dir: &Path, short_name: &str) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut frames = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| is_frame_of(name, short_name))
        .collect::<Vec<_>>();
    frames.sort();
    frames
}

/// Asks ffmpeg which video encoders it was built with.
pub fn supported_encoders(
    ffmpeg: &Path,
    timeout: Duration,
) -> Result<BTreeSet<String>, ProcessError> {
    let output = run_program(ffmpeg, ["-hide_banner", "-encoders"], timeout)?;
    if !output.success() {
        warn!(
            exit_code = ?output.exit_code(),
            stderr = %output.stderr.trim(),
            "ffmpeg -encoders exited unsuccessfully"
        );
    }
    Ok(parse_encoder_list(&output.stdout))
}

/// Parses `ffmpeg -encoders` output. Video encoder rows start with a `V`
/// capability flag; the legend rows contain `=` and are skipped.
pub fn parse_encoder_list(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('V') && !line.contains('='))
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_owned)
        .collect()
}

pub fn render_command(template: &str, params: &RunParameters, ffmpeg: &Path) -> Result<String> {
    let values = BTreeMap::from([
        ("ffmpeg", ffmpeg.display().to_string()),
        ("loglevel", params.loglevel.to_owned()),
        ("framerate", params.framerate.to_string()),
        ("skip", params.skip.to_string()),
        ("inpath", params.frames_dir.display().to_string()),
        ("pattern", params.sequence_pattern.clone()),
        ("short_name", params.short_name.clone()),
        ("extension", params.extension.to_owned()),
        ("videorate", params.video_rate.to_string()),
        ("preset", params.preset.to_owned()),
        ("minterpolate", params.minterpolate.clone()),
        ("flags", params.flags.to_owned()),
        ("description", params.description.clone()),
        ("info", params.info.clone()),
        ("author", params.author.clone()),
        ("outfile", params.outfile.display().to_string()),
    ]);
    let values: BTreeMap<_, _> = values
        .into_iter()
        .map(|(name, value)| (name, escape_for_shell(&value)))
        .collect();
    render_template(template, &values)
}

/// Makes `value` inert inside a double-quoted argument of the shell that
/// [`run_shell`] uses.
pub fn escape_for_shell(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if cfg!(target_os = "windows") {
            // cmd has no escape inside quotes, so these are dropped.
            if !matches!(c, '"' | '%') {
                escaped.push(c);
            }
        } else {
            if matches!(c, '"' | '$' | '`' | '\\') {
                escaped.push('\\');
            }
            escaped.push(c);
        }
    }
    escaped
}

/// Substitutes `{name}` placeholders in one pass; substituted values are
/// never rescanned.
pub fn render_template(template: &str, values: &BTreeMap<&str, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len() * 2);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            bail!("unterminated placeholder in command template");
        };
        let name = &after[..close];
        match values.get(name) {
            Some(value) => out.push_str(value),
            None => bail!("unknown placeholder '{{{name}}}' in command template"),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
