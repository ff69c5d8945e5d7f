//! Types exchanged with the generation engine.
//!
//! The engine itself is opaque: it announces a run, calls the step hook once
//! per denoising iteration, and reports [`RunMetadata`] when it is done.

use anyhow::{bail, Result};
use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// The denoised preview of one step as a tightly packed RGBA8 buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Preview {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
}

impl Preview {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("preview must be non-empty, got {width}x{height}");
        }
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            bail!(
                "preview buffer for {width}x{height} must be {expected} bytes, got {}",
                rgba.len()
            );
        }
        Ok(Self {
            width,
            height,
            rgba,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_rgba(&self) -> &[u8] {
        &self.rgba
    }

    /// Renders the preview into a displayable image.
    pub fn to_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.rgba.clone())
    }
}

/// What the engine passes to the step hook on every iteration.
#[derive(Debug, Clone, Copy)]
pub struct StepInfo<'a> {
    /// Zero-based iteration index.
    pub index: u32,
    pub preview: &'a Preview,
}

/// Known when a run starts, before the first step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStart {
    pub seed: i64,
    pub prompt: String,
    /// Steps the engine is configured to run.
    pub steps: u32,
}

/// Reported by the engine after the last step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunMetadata {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub seed: i64,
    pub sampler_name: String,
    pub cfg_scale: f32,
    /// Configured step count, not the number of steps actually run.
    pub steps: u32,
    /// Free-form generation summary. May mention the model and embeddings.
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub face_restoration_model: Option<String>,
    pub job_timestamp: String,
}

impl RunMetadata {
    pub fn run_start(&self) -> RunStart {
        RunStart {
            seed: self.seed,
            prompt: self.prompt.clone(),
            steps: self.steps,
        }
    }
}
