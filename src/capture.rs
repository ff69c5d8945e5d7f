//! Per-step frame capture.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use tracing::{debug, error, warn};

use crate::config::{AnimationConfig, FrameFormat};
use crate::engine::{Preview, RunStart, StepInfo};
use crate::hook::StepObserver;
use crate::sanitize::prompt_prefix;

const MIN_INDEX_WIDTH: usize = 3;

/// Deterministic frame file names for one run:
/// `{index}-{seed}-{promptPrefix}.{ext}` with a zero-padded index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameNaming {
    short_name: String,
    index_width: usize,
    format: FrameFormat,
}

impl FrameNaming {
    pub fn for_run(seed: i64, prompt: &str, total_steps: u32, format: FrameFormat) -> Self {
        Self {
            short_name: format!("{seed}-{}", prompt_prefix(prompt)),
            index_width: index_width(total_steps),
            format,
        }
    }

    /// `{seed}-{promptPrefix}`, shared by every frame of the run and by the
    /// output video.
    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn index_width(&self) -> usize {
        self.index_width
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn file_stem(&self, index: u32) -> String {
        format!(
            "{index:0width$}-{}",
            self.short_name,
            width = self.index_width
        )
    }

    pub fn file_name(&self, index: u32) -> String {
        format!("{}.{}", self.file_stem(index), self.format.extension())
    }

    /// printf-style index pattern understood by ffmpeg's image sequence
    /// demuxer, e.g. `%03d`.
    pub fn sequence_pattern(&self) -> String {
        format!("%0{}d", self.index_width)
    }

    pub fn matches(&self, file_name: &str) -> bool {
        is_frame_of(file_name, &self.short_name)
    }

    /// Whether `index` still pads to the run's width. Larger indices make
    /// wider names that sort out of capture order.
    pub fn fits(&self, index: u32) -> bool {
        index.to_string().len() <= self.index_width
    }
}

/// `{digits}-{short_name}.{ext}`, nothing else. A plain substring test would
/// let seed `5` claim the frames of seed `15`.
pub fn is_frame_of(file_name: &str, short_name: &str) -> bool {
    let rest = file_name.trim_start_matches(|c: char| c.is_ascii_digit());
    if rest.len() == file_name.len() {
        return false;
    }
    rest.strip_prefix('-')
        .and_then(|rest| rest.strip_prefix(short_name))
        .and_then(|rest| rest.strip_prefix('.'))
        .is_some_and(|extension| !extension.is_empty() && !extension.contains('.'))
}

/// Index width wide enough for the largest zero-based index of the run, and
/// never narrower than three digits.
fn index_width(total_steps: u32) -> usize {
    let largest = total_steps.saturating_sub(1);
    largest.to_string().len().max(MIN_INDEX_WIDTH)
}

/// State for one run, shared between the interceptor on the engine thread and
/// the postprocess entry point.
#[derive(Debug)]
pub struct RunContext {
    steps: AtomicU32,
    naming: FrameNaming,
    frames_dir: PathBuf,
}

impl RunContext {
    pub fn new(naming: FrameNaming, frames_dir: PathBuf) -> Self {
        Self {
            steps: AtomicU32::new(0),
            naming,
            frames_dir,
        }
    }

    pub fn for_run(run: &RunStart, config: &AnimationConfig) -> Self {
        Self::new(
            FrameNaming::for_run(run.seed, &run.prompt, run.steps, config.frame_format),
            config.frames_dir(),
        )
    }

    pub fn current_step(&self) -> u32 {
        self.steps.load(Ordering::SeqCst)
    }

    /// Reads the step count and resets it to zero in one operation.
    pub fn take_steps(&self) -> u32 {
        self.steps.swap(0, Ordering::SeqCst)
    }

    pub fn naming(&self) -> &FrameNaming {
        &self.naming
    }

    pub fn frames_dir(&self) -> &Path {
        &self.frames_dir
    }

    fn record_step(&self, current: u32) {
        self.steps.store(current, Ordering::SeqCst);
    }
}

/// Black-box image persistence.
pub trait FrameSink: Send + Sync {
    fn save(
        &self,
        dir: &Path,
        file_stem: &str,
        preview: &Preview,
        format: FrameFormat,
    ) -> Result<PathBuf>;
}

/// Writes frames with the `image` crate, creating the directory on demand.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageFrameSink;

impl FrameSink for ImageFrameSink {
    fn save(
        &self,
        dir: &Path,
        file_stem: &str,
        preview: &Preview,
        format: FrameFormat,
    ) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create frame directory {}", dir.display()))?;
        let path = dir.join(format!("{file_stem}.{}", format.extension()));
        let image = preview
            .to_image()
            .ok_or_else(|| anyhow!("preview buffer does not match its dimensions"))?;
        let image = if format.supports_alpha() {
            DynamicImage::ImageRgba8(image)
        } else {
            DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(image).to_rgb8())
        };
        image
            .save_with_format(&path, format.image_format())
            .with_context(|| format!("failed to write frame {}", path.display()))?;
        Ok(path)
    }
}

/// Saves the preview of every step after the skip threshold as a numbered
/// frame. Save failures are logged and swallowed so generation never stops
/// because of capture.
pub struct StepInterceptor {
    context: Arc<RunContext>,
    sink: Arc<dyn FrameSink>,
    skip_steps: u32,
    debug: bool,
    width_exceeded: bool,
}

impl StepInterceptor {
    pub fn new(context: Arc<RunContext>, sink: Arc<dyn FrameSink>, config: &AnimationConfig) -> Self {
        Self {
            context,
            sink,
            skip_steps: config.skip_steps,
            debug: config.debug,
            width_exceeded: false,
        }
    }

    fn should_capture(&self, current: u32) -> bool {
        self.skip_steps == 0 || current > self.skip_steps
    }
}

impl StepObserver for StepInterceptor {
    fn on_step(&mut self, step: &StepInfo<'_>) {
        let current = step.index.saturating_add(1);
        self.context.record_step(current);
        if !self.should_capture(current) {
            return;
        }

        let naming = self.context.naming();
        if !self.width_exceeded && !naming.fits(step.index) {
            self.width_exceeded = true;
            warn!(
                index = step.index,
                width = naming.index_width(),
                "engine ran past its configured step count; frame names no longer sort in capture order"
            );
        }
        let stem = naming.file_stem(step.index);
        match self.sink.save(
            self.context.frames_dir(),
            &stem,
            step.preview,
            naming.format(),
        ) {
            Ok(path) => {
                if self.debug {
                    debug!(step = current, path = %path.display(), "saved intermediate frame");
                }
            }
            Err(error) => {
                error!(step = current, "failed to save intermediate frame: {error:#}");
            }
        }
    }
}
