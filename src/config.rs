//! Animation settings: YAML loading, validation and the codec tables.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use image::ImageFormat;
use serde::{Deserialize, Serialize};

pub const MIN_DURATION_SECONDS: f64 = 0.5;
pub const MAX_DURATION_SECONDS: f64 = 120.0;
pub const MAX_SKIP_STEPS: u32 = 100;

/// User-facing configuration for one capture run.
///
/// Every field has a default, so an empty YAML document is a valid config
/// (with capture disabled).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnimationConfig {
    pub enabled: bool,
    pub codec: Codec,
    pub interpolation: Interpolation,
    /// Target video length in seconds.
    pub duration: f64,
    /// Steps at the start of the run that are not captured.
    pub skip_steps: u32,
    pub debug: bool,
    /// Assemble a video even when the engine stopped before its configured
    /// step count.
    pub run_incomplete: bool,
    pub delete_intermediate: bool,
    pub create_animation: bool,
    /// Frame directory, relative to `base_dir` unless absolute.
    pub intermediate_path: PathBuf,
    /// Video directory, relative to `base_dir` unless absolute.
    pub output_path: PathBuf,
    pub base_dir: PathBuf,
    pub frame_format: FrameFormat,
    pub video_rate: u32,
    pub author: String,
    pub encode_timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            codec: Codec::X264,
            interpolation: Interpolation::Mci,
            duration: 10.0,
            skip_steps: 0,
            debug: false,
            run_incomplete: true,
            delete_intermediate: true,
            create_animation: true,
            intermediate_path: PathBuf::from("intermediate"),
            output_path: PathBuf::from("animation"),
            base_dir: PathBuf::from("."),
            frame_format: FrameFormat::Png,
            video_rate: 30,
            author: "stepreel".to_owned(),
            encode_timeout_secs: 600,
            probe_timeout_secs: 30,
        }
    }
}

impl AnimationConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.duration.is_finite()
            || !(MIN_DURATION_SECONDS..=MAX_DURATION_SECONDS).contains(&self.duration)
        {
            bail!(
                "duration must be between {MIN_DURATION_SECONDS} and {MAX_DURATION_SECONDS} seconds, got {}",
                self.duration
            );
        }
        if self.skip_steps > MAX_SKIP_STEPS {
            bail!(
                "skip_steps must be at most {MAX_SKIP_STEPS}, got {}",
                self.skip_steps
            );
        }
        if self.video_rate == 0 {
            bail!("video_rate must be > 0");
        }
        if self.encode_timeout_secs == 0 || self.probe_timeout_secs == 0 {
            bail!("process timeouts must be > 0 seconds");
        }
        if self.intermediate_path.as_os_str().is_empty() {
            bail!("intermediate_path cannot be empty");
        }
        if self.output_path.as_os_str().is_empty() {
            bail!("output_path cannot be empty");
        }
        if self.author.chars().any(|c| c == '"' || c.is_control()) {
            bail!("author cannot contain quotes or control characters");
        }
        Ok(())
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.base_dir.join(&self.intermediate_path)
    }

    pub fn videos_dir(&self) -> PathBuf {
        self.base_dir.join(&self.output_path)
    }

    pub fn encode_timeout(&self) -> Duration {
        Duration::from_secs(self.encode_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

pub fn load_config(path: &Path) -> Result<AnimationConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

pub fn parse_config(contents: &str) -> Result<AnimationConfig> {
    let config: AnimationConfig = if contents.trim().is_empty() {
        AnimationConfig::default()
    } else {
        serde_yaml::from_str(contents).map_err(|error| {
            let location = error
                .location()
                .map(|location| format!("line {}, column {}", location.line(), location.column()))
                .unwrap_or_else(|| "unknown location".to_owned());
            anyhow!("failed to parse yaml at {location}: {error}")
        })?
    };
    config.validate()?;
    Ok(config)
}

/// Video codec choice. Each maps to one ffmpeg encoder library, a fixed set
/// of encoder arguments, and a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Codec {
    #[serde(rename = "x264")]
    #[value(name = "x264")]
    X264,
    #[serde(rename = "x265")]
    #[value(name = "x265")]
    X265,
    #[serde(rename = "vpx-vp9")]
    #[value(name = "vpx-vp9")]
    VpxVp9,
    #[serde(rename = "aom-av1")]
    #[value(name = "aom-av1")]
    AomAv1,
    #[serde(rename = "prores_ks")]
    #[value(name = "prores_ks")]
    ProresKs,
}

impl Codec {
    pub const ALL: [Codec; 5] = [
        Self::X264,
        Self::X265,
        Self::VpxVp9,
        Self::AomAv1,
        Self::ProresKs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::X264 => "x264",
            Self::X265 => "x265",
            Self::VpxVp9 => "vpx-vp9",
            Self::AomAv1 => "aom-av1",
            Self::ProresKs => "prores_ks",
        }
    }

    /// Encoder name as listed by `ffmpeg -encoders` and passed to `-vcodec`.
    pub fn library(self) -> &'static str {
        match self {
            Self::X264 => "libx264",
            Self::X265 => "libx265",
            Self::VpxVp9 => "libvpx-vp9",
            Self::AomAv1 => "libaom-av1",
            Self::ProresKs => "prores_ks",
        }
    }

    pub fn preset(self) -> &'static str {
        match self {
            Self::X264 => "-vcodec libx264 -preset medium -crf 23",
            Self::X265 => "-vcodec libx265 -preset faster -crf 28",
            Self::VpxVp9 => "-vcodec libvpx-vp9 -crf 34 -b:v 0 -deadline realtime -cpu-used 4",
            Self::AomAv1 => {
                "-vcodec libaom-av1 -crf 28 -b:v 0 -usage realtime -cpu-used 8 -pix_fmt yuv444p"
            }
            Self::ProresKs => {
                "-vcodec prores_ks -profile:v 3 -vendor apl0 -bits_per_mb 8000 -pix_fmt yuv422p10le"
            }
        }
    }

    pub fn container_suffix(self) -> &'static str {
        match self {
            Self::VpxVp9 => ".webm",
            Self::ProresKs => ".mov",
            Self::X264 | Self::X265 | Self::AomAv1 => ".mp4",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Motion interpolation applied by the encoder when stretching a short frame
/// sequence over the target duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    None,
    /// Motion compensated interpolation.
    Mci,
    Blend,
}

impl Interpolation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Mci => "mci",
            Self::Blend => "blend",
        }
    }

    /// The `-vf` argument for ffmpeg, empty when interpolation is off.
    pub fn filter_arg(self) -> String {
        match self {
            Self::None => String::new(),
            mode => format!("-vf minterpolate=mi_mode={},fifo", mode.as_str()),
        }
    }
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FrameFormat {
    Png,
    #[serde(alias = "jpeg")]
    Jpg,
    Webp,
}

impl FrameFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpg => "jpg",
            Self::Webp => "webp",
        }
    }

    pub fn image_format(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpg => ImageFormat::Jpeg,
            Self::Webp => ImageFormat::WebP,
        }
    }

    pub fn supports_alpha(self) -> bool {
        !matches!(self, Self::Jpg)
    }
}
