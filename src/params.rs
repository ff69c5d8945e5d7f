//! Run parameters: everything the encoder invocation needs, derived once at
//! the end of a run.

use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::capture::FrameNaming;
use crate::config::{AnimationConfig, Codec, Interpolation};
use crate::engine::RunMetadata;
use crate::sanitize::sanitize;

pub const UNKNOWN_MODEL: &str = "unknown";
pub const NO_EMBEDDING: &str = "none";
pub const CONTAINER_FLAGS: &str = "-movflags +faststart";

/// Pulls structured fields out of the engine's free-form info string.
pub trait InfoParser {
    fn model(&self, info: &str) -> Option<String>;
    fn embedding(&self, info: &str) -> Option<String>;
}

/// Best-effort scan for `Model: <id>` and `Used embeddings: <id>` markers.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextInfoParser;

impl InfoParser for TextInfoParser {
    fn model(&self, info: &str) -> Option<String> {
        static MODEL_RE: OnceLock<Regex> = OnceLock::new();
        let re = MODEL_RE
            .get_or_init(|| Regex::new(r"Model:\s*([^\s,]+)").expect("model regex should compile"));
        first_capture(re, info)
    }

    fn embedding(&self, info: &str) -> Option<String> {
        static EMBEDDING_RE: OnceLock<Regex> = OnceLock::new();
        let re = EMBEDDING_RE.get_or_init(|| {
            Regex::new(r"Used embeddings:\s*([^\s,]+)").expect("embedding regex should compile")
        });
        first_capture(re, info)
    }
}

fn first_capture(re: &Regex, haystack: &str) -> Option<String> {
    re.captures(haystack)
        .and_then(|capture| capture.get(1))
        .map(|value| value.as_str().to_owned())
}

/// Immutable once built. All derived fields are functions of the inputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunParameters {
    pub prompt: String,
    pub negative: String,
    pub seed: i64,
    pub sampler: String,
    pub cfg_scale: f32,
    pub steps: u32,
    pub current: u32,
    pub skip: u32,
    pub info: String,
    pub model: String,
    pub embedding: String,
    pub faces: String,
    pub timestamp: String,
    pub frames_dir: PathBuf,
    pub videos_dir: PathBuf,
    pub codec: Codec,
    pub duration: f64,
    pub interpolation: Interpolation,
    pub loglevel: &'static str,
    pub framerate: f64,
    pub video_rate: u32,
    pub author: String,
    pub preset: &'static str,
    pub extension: &'static str,
    pub short_name: String,
    pub sequence_pattern: String,
    pub flags: &'static str,
    pub minterpolate: String,
    pub outfile: PathBuf,
    pub description: String,
}

impl RunParameters {
    pub fn build(metadata: &RunMetadata, config: &AnimationConfig, captured_steps: u32) -> Self {
        Self::build_with(&TextInfoParser, metadata, config, captured_steps)
    }

    pub fn build_with(
        parser: &dyn InfoParser,
        metadata: &RunMetadata,
        config: &AnimationConfig,
        captured_steps: u32,
    ) -> Self {
        let naming = FrameNaming::for_run(
            metadata.seed,
            &metadata.prompt,
            metadata.steps,
            config.frame_format,
        );
        let prompt = sanitize(&metadata.prompt);
        let negative = sanitize(&metadata.negative_prompt);
        let model = parser
            .model(&metadata.info)
            .unwrap_or_else(|| UNKNOWN_MODEL.to_owned());
        let embedding = parser
            .embedding(&metadata.info)
            .unwrap_or_else(|| NO_EMBEDDING.to_owned());
        let faces = metadata
            .face_restoration_model
            .clone()
            .unwrap_or_else(|| "none".to_owned());
        let videos_dir = config.videos_dir();
        let outfile = videos_dir.join(format!(
            "{}{}",
            naming.short_name(),
            config.codec.container_suffix()
        ));

        let description = format!(
            "{prompt} | negative {negative} | seed {seed} | sampler {sampler} | cfgscale {cfg} | steps {steps} | current {current} | skip {skip} | model {model} | embedding {embedding} | faces {faces} | timestamp {timestamp} | interpolation {interpolation}",
            seed = metadata.seed,
            sampler = metadata.sampler_name,
            cfg = metadata.cfg_scale,
            steps = metadata.steps,
            current = captured_steps,
            skip = config.skip_steps,
            timestamp = metadata.job_timestamp,
            interpolation = config.interpolation,
        );

        Self {
            prompt,
            negative,
            seed: metadata.seed,
            sampler: metadata.sampler_name.clone(),
            cfg_scale: metadata.cfg_scale,
            steps: metadata.steps,
            current: captured_steps,
            skip: config.skip_steps,
            info: sanitize(&metadata.info),
            model,
            embedding,
            faces,
            timestamp: metadata.job_timestamp.clone(),
            frames_dir: config.frames_dir(),
            videos_dir,
            codec: config.codec,
            duration: config.duration,
            interpolation: config.interpolation,
            loglevel: if config.debug { "info" } else { "error" },
            framerate: frame_rate(captured_steps, config.skip_steps, config.duration),
            video_rate: config.video_rate,
            author: config.author.clone(),
            preset: config.codec.preset(),
            extension: naming.format().extension(),
            short_name: naming.short_name().to_owned(),
            sequence_pattern: naming.sequence_pattern(),
            flags: CONTAINER_FLAGS,
            minterpolate: config.interpolation.filter_arg(),
            outfile,
            description,
        }
    }

    /// Pretty JSON dump for debug logging.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|error| format!("{{\"error\": \"{error}\"}}"))
    }
}

/// Frames per second that stretches the captured frames over `duration`.
/// Zero means there is nothing to encode.
pub fn frame_rate(captured_steps: u32, skip_steps: u32, duration: f64) -> f64 {
    if duration.is_nan() || duration <= 0.0 {
        return 0.0;
    }
    let frames = f64::from(captured_steps) - f64::from(skip_steps);
    (frames / duration).max(0.0)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::config::FrameFormat;

    fn metadata(info: &str) -> RunMetadata {
        RunMetadata {
            prompt: "a lighthouse, at dusk!\nstormy sea".to_owned(),
            negative_prompt: "blurry (low quality)".to_owned(),
            seed: 3141,
            sampler_name: "Euler a".to_owned(),
            cfg_scale: 7.5,
            steps: 50,
            info: info.to_owned(),
            face_restoration_model: None,
            job_timestamp: "20240301093000".to_owned(),
        }
    }

    #[test]
    fn frame_rate_examples() {
        assert_eq!(frame_rate(50, 10, 10.0), 4.0);
        assert_eq!(frame_rate(20, 0, 5.0), 4.0);
        assert_eq!(frame_rate(10, 10, 10.0), 0.0);
        assert_eq!(frame_rate(3, 10, 10.0), 0.0);
        assert_eq!(frame_rate(10, 0, 0.0), 0.0);
    }

    #[test]
    fn model_and_embedding_are_extracted() {
        let parser = TextInfoParser;
        let info = "Steps: 20, Sampler: Euler a, Model: abc123 Used embeddings: style-x";
        assert_eq!(parser.model(info).as_deref(), Some("abc123"));
        assert_eq!(parser.embedding(info).as_deref(), Some("style-x"));
        assert_eq!(parser.model("Steps: 20"), None);
        assert_eq!(parser.embedding("Steps: 20"), None);
    }

    #[test]
    fn missing_markers_fall_back() {
        let config = AnimationConfig::default();
        let params = RunParameters::build(&metadata("Steps: 50"), &config, 50);
        assert_eq!(params.model, UNKNOWN_MODEL);
        assert_eq!(params.embedding, NO_EMBEDDING);
        assert_eq!(params.faces, "none");
    }

    #[test]
    fn derived_fields() {
        let config = AnimationConfig {
            codec: Codec::VpxVp9,
            skip_steps: 10,
            duration: 10.0,
            base_dir: PathBuf::from("/out"),
            frame_format: FrameFormat::Webp,
            ..AnimationConfig::default()
        };
        let params = RunParameters::build(&metadata("Model: abc123, Seed: 3141"), &config, 50);

        assert_eq!(params.framerate, 4.0);
        assert_eq!(params.model, "abc123");
        assert_eq!(params.prompt, "a lighthouse at dusk, stormy sea");
        assert_eq!(params.short_name, "3141-a lighthouse at dusk, stormy sea");
        assert_eq!(
            params.outfile,
            Path::new("/out/animation/3141-a lighthouse at dusk, stormy sea.webm")
        );
        assert_eq!(params.frames_dir, Path::new("/out/intermediate"));
        assert_eq!(params.extension, "webp");
        assert_eq!(params.sequence_pattern, "%03d");
        assert_eq!(params.loglevel, "error");
        assert_eq!(params.preset, Codec::VpxVp9.preset());
        assert_eq!(params.minterpolate, "-vf minterpolate=mi_mode=mci,fifo");
    }

    #[test]
    fn description_embeds_run_fields() {
        let config = AnimationConfig {
            interpolation: Interpolation::None,
            debug: true,
            ..AnimationConfig::default()
        };
        let mut meta = metadata("Model: sd15");
        meta.face_restoration_model = Some("CodeFormer".to_owned());
        let params = RunParameters::build(&meta, &config, 42);

        assert_eq!(
            params.description,
            "a lighthouse at dusk, stormy sea | negative blurry low quality | seed 3141 | sampler Euler a | cfgscale 7.5 | steps 50 | current 42 | skip 0 | model sd15 | embedding none | faces CodeFormer | timestamp 20240301093000 | interpolation none"
        );
        assert_eq!(params.loglevel, "info");
        assert!(params.minterpolate.is_empty());
    }

    #[test]
    fn custom_parser_is_used() {
        struct Structured;
        impl InfoParser for Structured {
            fn model(&self, _: &str) -> Option<String> {
                Some("from-engine".to_owned())
            }
            fn embedding(&self, _: &str) -> Option<String> {
                None
            }
        }
        let params = RunParameters::build_with(
            &Structured,
            &metadata("Model: ignored"),
            &AnimationConfig::default(),
            50,
        );
        assert_eq!(params.model, "from-engine");
        assert_eq!(params.embedding, NO_EMBEDDING);
    }

    #[test]
    fn debug_dump_is_json() {
        let params = RunParameters::build(&metadata(""), &AnimationConfig::default(), 50);
        let value: serde_json::Value = serde_json::from_str(&params.to_json()).unwrap();
        assert_eq!(value["codec"], "x264");
        assert_eq!(value["framerate"], 5.0);
    }
}
