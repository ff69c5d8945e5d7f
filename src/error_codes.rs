//! Stable codes for assembly aborts and CLI failures.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Why video assembly stopped before the encoder ran. Each reason carries a
/// stable code for machine consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    ZeroSteps,
    ZeroFrameRate { captured: u32, skip: u32, duration: f64 },
    NoFrames { dir: PathBuf, short_name: String },
    EncoderMissing,
    CapabilityQueryFailed { message: String },
    CodecUnsupported { library: String },
    OutputDir { dir: PathBuf, message: String },
}

impl AbortReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ZeroSteps => "E_ZERO_STEPS",
            Self::ZeroFrameRate { .. } => "E_FRAMERATE_ZERO",
            Self::NoFrames { .. } => "E_NO_FRAMES",
            Self::EncoderMissing => "E_ENCODER_MISSING",
            Self::CapabilityQueryFailed { .. } => "E_CAPABILITY_QUERY",
            Self::CodecUnsupported { .. } => "E_CODEC_UNSUPPORTED",
            Self::OutputDir { .. } => "E_OUTPUT_DIR",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSteps => write!(
                f,
                "no steps were captured, likely an unsupported sampler or an interrupted run"
            ),
            Self::ZeroFrameRate {
                captured,
                skip,
                duration,
            } => write!(
                f,
                "frame rate is zero: duration/step mismatch ({captured} captured, {skip} skipped, {duration}s)"
            ),
            Self::NoFrames { dir, short_name } => write!(
                f,
                "no frames captured: nothing matching '{short_name}' in {}",
                dir.display()
            ),
            Self::EncoderMissing => write!(f, "encoder missing: ffmpeg not found on PATH"),
            Self::CapabilityQueryFailed { message } => {
                write!(f, "could not list encoders supported by ffmpeg: {message}")
            }
            Self::CodecUnsupported { library } => {
                write!(f, "codec {library} unsupported by this encoder build")
            }
            Self::OutputDir { dir, message } => write!(
                f,
                "cannot create output directory {}: {message}",
                dir.display()
            ),
        }
    }
}

/// A failure that stops the CLI before or instead of a run, with a stable code
/// for `--json` consumers.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct CodedError {
    pub code: &'static str,
    pub message: String,
}

impl CodedError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new("E_CONFIG", message)
    }

    /// `{"ok": false, "error": {"code": .., "message": ..}}`
    pub fn envelope(&self) -> Value {
        json!({
            "ok": false,
            "error": {
                "code": self.code,
                "message": self.message,
            }
        })
    }
}

impl From<&AbortReason> for CodedError {
    fn from(reason: &AbortReason) -> Self {
        Self::new(reason.code(), reason.to_string())
    }
}

/// The first [`CodedError`] anywhere in the cause chain.
pub fn find_coded_error(error: &anyhow::Error) -> Option<&CodedError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<CodedError>())
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn abort_codes_are_distinct() {
        let reasons = [
            AbortReason::ZeroSteps,
            AbortReason::ZeroFrameRate {
                captured: 1,
                skip: 1,
                duration: 1.0,
            },
            AbortReason::NoFrames {
                dir: PathBuf::from("x"),
                short_name: "1-a".to_owned(),
            },
            AbortReason::EncoderMissing,
            AbortReason::CapabilityQueryFailed {
                message: "boom".to_owned(),
            },
            AbortReason::CodecUnsupported {
                library: "libx265".to_owned(),
            },
            AbortReason::OutputDir {
                dir: PathBuf::from("y"),
                message: "denied".to_owned(),
            },
        ];
        let mut codes = reasons.iter().map(AbortReason::code).collect::<Vec<_>>();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), reasons.len());
    }

    #[test]
    fn zero_steps_message_names_likely_causes() {
        let message = AbortReason::ZeroSteps.to_string();
        assert!(message.contains("unsupported sampler"));
        assert!(message.contains("interrupted"));
    }

    #[test]
    fn coded_error_is_found_through_context() {
        let error = anyhow::Error::new(CodedError::config("duration must be > 0"))
            .context("failed loading config");
        let coded = find_coded_error(&error).expect("coded error should be in chain");
        assert_eq!(coded.code, "E_CONFIG");

        let plain: anyhow::Result<()> = Err(anyhow::anyhow!("plain"));
        let plain = plain.context("outer").unwrap_err();
        assert!(find_coded_error(&plain).is_none());
    }

    #[test]
    fn envelope_carries_code_and_message() {
        let value = CodedError::new("E_RUNTIME", "bad flag").envelope();
        assert_eq!(
            value,
            json!({"ok": false, "error": {"code": "E_RUNTIME", "message": "bad flag"}})
        );
    }

    #[test]
    fn abort_reason_converts_with_its_code() {
        let coded = CodedError::from(&AbortReason::EncoderMissing);
        assert_eq!(coded.code, "E_ENCODER_MISSING");
        assert!(coded.message.contains("ffmpeg not found"));
    }
}
