//! Capture the intermediate denoising steps of an image generation run as
//! numbered frames and assemble them into a video with ffmpeg.
//!
//! A run goes through [`run::CaptureSession::begin`], which installs a
//! [`capture::StepInterceptor`] on the engine's [`hook::StepHook`], and ends
//! with [`run::CaptureSession::finish`], which restores the hook and drives
//! [`params::RunParameters`], [`assemble::VideoAssembler`] and
//! [`cleanup::remove_intermediate`].

pub mod assemble;
pub mod capture;
pub mod cleanup;
pub mod config;
pub mod engine;
pub mod error_codes;
pub mod hook;
pub mod params;
pub mod process;
pub mod run;
pub mod sanitize;
pub mod synthetic;
