//! Run orchestration: install the interceptor when a run starts, and drive
//! parameter building, assembly and cleanup when it ends.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::assemble::{AssemblyReport, VideoAssembler};
use crate::capture::{FrameSink, ImageFrameSink, RunContext, StepInterceptor};
use crate::cleanup::{remove_intermediate, CleanupReport};
use crate::config::AnimationConfig;
use crate::engine::{RunMetadata, RunStart};
use crate::error_codes::AbortReason;
use crate::hook::{HookRegistration, StepHook};
use crate::params::RunParameters;
use crate::process::Toolchain;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "assembly", rename_all = "snake_case")]
pub enum AssemblyStatus {
    /// Capture was off for this run.
    Disabled,
    /// The run stopped early and the config says not to assemble partial runs.
    SkippedIncomplete { captured: u32, expected: u32 },
    Aborted { code: &'static str, reason: AbortReason },
    NotRequested,
    Ran(AssemblyReport),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub captured_steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<RunParameters>,
    pub status: AssemblyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupReport>,
}

impl RunReport {
    pub fn video_created(&self) -> bool {
        matches!(&self.status, AssemblyStatus::Ran(report) if report.outcome.is_success())
    }
}

/// One run's capture. Created before the first step; the hook stays
/// installed until [`CaptureSession::finish`] runs or the session is
/// dropped, whichever comes first.
pub struct CaptureSession {
    config: AnimationConfig,
    context: Arc<RunContext>,
    registration: Option<HookRegistration>,
}

impl CaptureSession {
    pub fn begin(hook: &StepHook, config: &AnimationConfig, run: &RunStart) -> Self {
        Self::begin_with_sink(hook, config, run, Arc::new(ImageFrameSink))
    }

    pub fn begin_with_sink(
        hook: &StepHook,
        config: &AnimationConfig,
        run: &RunStart,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        let context = Arc::new(RunContext::for_run(run, config));
        let registration = config.enabled.then(|| {
            debug!(
                seed = run.seed,
                steps = run.steps,
                frames_dir = %context.frames_dir().display(),
                "capturing intermediate steps"
            );
            hook.install(StepInterceptor::new(Arc::clone(&context), sink, config))
        });
        Self {
            config: config.clone(),
            context,
            registration,
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn is_capturing(&self) -> bool {
        self.registration
            .as_ref()
            .is_some_and(HookRegistration::is_active)
    }

    /// Postprocess entry point. Restores the hook before doing anything else.
    pub fn finish(mut self, metadata: &RunMetadata, toolchain: Toolchain) -> RunReport {
        drop(self.registration.take());
        if !self.config.enabled {
            return RunReport {
                captured_steps: 0,
                params: None,
                status: AssemblyStatus::Disabled,
                cleanup: None,
            };
        }

        let captured = self.context.take_steps();
        postprocess(&self.config, metadata, captured, toolchain)
    }
}

/// Everything after the last step: incomplete-run policy, parameters,
/// assembly, cleanup. `captured` is the step count the run actually reached.
pub fn postprocess(
    config: &AnimationConfig,
    metadata: &RunMetadata,
    captured: u32,
    toolchain: Toolchain,
) -> RunReport {
    if captured == 0 {
        let reason = AbortReason::ZeroSteps;
        error!(code = reason.code(), "{reason}");
        let status = AssemblyStatus::Aborted {
            code: reason.code(),
            reason,
        };
        return with_cleanup(config, captured, None, status);
    }

    let complete = captured == metadata.steps;
    if !complete {
        warn!(
            captured,
            expected = metadata.steps,
            run_incomplete = config.run_incomplete,
            "postprocess called before the run reached its configured step count"
        );
    }

    let params = RunParameters::build(metadata, config, captured);
    if config.debug {
        debug!(params = %params.to_json(), "run parameters");
    }

    let status = if !complete && !config.run_incomplete {
        AssemblyStatus::SkippedIncomplete {
            captured,
            expected: metadata.steps,
        }
    } else if !config.create_animation {
        AssemblyStatus::NotRequested
    } else {
        let report = VideoAssembler::new(toolchain, config).assemble(&params);
        if report.outcome.is_success() {
            info!(outfile = %params.outfile.display(), "video created");
        }
        AssemblyStatus::Ran(report)
    };

    with_cleanup(config, captured, Some(params), status)
}

fn with_cleanup(
    config: &AnimationConfig,
    captured: u32,
    params: Option<RunParameters>,
    status: AssemblyStatus,
) -> RunReport {
    let cleanup = config.delete_intermediate.then(|| {
        let dir = params
            .as_ref()
            .map_or_else(|| config.frames_dir(), |params| params.frames_dir.clone());
        remove_intermediate(&dir)
    });
    RunReport {
        captured_steps: captured,
        params,
        status,
        cleanup,
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use anyhow::Result;

    use super::*;
    use crate::config::FrameFormat;
    use crate::engine::{Preview, StepInfo};

    #[derive(Default)]
    struct CountingSink {
        saved: Mutex<u32>,
    }

    impl FrameSink for CountingSink {
        fn save(
            &self,
            dir: &Path,
            file_stem: &str,
            _: &Preview,
            format: FrameFormat,
        ) -> Result<PathBuf> {
            *self.saved.lock().unwrap() += 1;
            Ok(dir.join(format!("{file_stem}.{}", format.extension())))
        }
    }

    fn run_start() -> RunStart {
        RunStart {
            seed: 11,
            prompt: "a bridge".to_owned(),
            steps: 8,
        }
    }

    fn metadata() -> RunMetadata {
        RunMetadata {
            prompt: "a bridge".to_owned(),
            negative_prompt: String::new(),
            seed: 11,
            sampler_name: "Euler".to_owned(),
            cfg_scale: 7.0,
            steps: 8,
            info: String::new(),
            face_restoration_model: None,
            job_timestamp: "20240101000000".to_owned(),
        }
    }

    fn drive(hook: &StepHook, steps: u32) {
        let preview = Preview::new(1, 1, vec![0; 4]).unwrap();
        for index in 0..steps {
            hook.dispatch(&StepInfo {
                index,
                preview: &preview,
            });
        }
    }

    fn config() -> AnimationConfig {
        AnimationConfig {
            enabled: true,
            delete_intermediate: false,
            base_dir: PathBuf::from("/nonexistent/stepreel-test"),
            ..AnimationConfig::default()
        }
    }

    #[test]
    fn disabled_run_never_installs() {
        let hook = StepHook::passthrough();
        let session = CaptureSession::begin(&hook, &AnimationConfig::default(), &run_start());
        assert!(!hook.is_installed());
        assert!(!session.is_capturing());
        let report = session.finish(&metadata(), Toolchain::default());
        assert_eq!(report.status, AssemblyStatus::Disabled);
    }

    #[test]
    fn finish_restores_hook_and_resets_counter() {
        let hook = StepHook::passthrough();
        let sink = Arc::new(CountingSink::default());
        let session = CaptureSession::begin_with_sink(&hook, &config(), &run_start(), sink.clone());
        assert!(hook.is_installed());

        drive(&hook, 8);
        assert_eq!(session.context().current_step(), 8);
        let context = Arc::clone(&session.context);

        let report = session.finish(&metadata(), Toolchain::default());
        assert!(!hook.is_installed());
        assert_eq!(report.captured_steps, 8);
        assert_eq!(context.current_step(), 0);
        assert_eq!(*sink.saved.lock().unwrap(), 8);

        // No frames on disk, so assembly aborts during validation.
        let AssemblyStatus::Ran(assembly) = &report.status else {
            panic!("assembly should have run: {:?}", report.status);
        };
        assert!(matches!(
            assembly.outcome,
            crate::assemble::AssemblyOutcome::Aborted { code: "E_NO_FRAMES", .. }
        ));

        // Steps after the run are not captured.
        drive(&hook, 3);
        assert_eq!(*sink.saved.lock().unwrap(), 8);
    }

    #[test]
    fn dropped_session_restores_hook() {
        let hook = StepHook::passthrough();
        {
            let _session = CaptureSession::begin(&hook, &config(), &run_start());
            assert!(hook.is_installed());
        }
        assert!(!hook.is_installed());
    }

    #[test]
    fn zero_steps_aborts() {
        let hook = StepHook::passthrough();
        let session = CaptureSession::begin(&hook, &config(), &run_start());
        let report = session.finish(&metadata(), Toolchain::default());
        assert_eq!(
            report.status,
            AssemblyStatus::Aborted {
                code: "E_ZERO_STEPS",
                reason: AbortReason::ZeroSteps,
            }
        );
        assert!(report.params.is_none());
    }

    #[test]
    fn incomplete_run_policy() {
        let sink: Arc<dyn FrameSink> = Arc::new(CountingSink::default());

        let strict = AnimationConfig {
            run_incomplete: false,
            ..config()
        };
        let hook = StepHook::passthrough();
        let session = CaptureSession::begin_with_sink(&hook, &strict, &run_start(), Arc::clone(&sink));
        drive(&hook, 5);
        let report = session.finish(&metadata(), Toolchain::default());
        assert_eq!(
            report.status,
            AssemblyStatus::SkippedIncomplete {
                captured: 5,
                expected: 8,
            }
        );

        let lenient = AnimationConfig {
            run_incomplete: true,
            create_animation: false,
            ..config()
        };
        let session = CaptureSession::begin_with_sink(&hook, &lenient, &run_start(), sink);
        drive(&hook, 5);
        let report = session.finish(&metadata(), Toolchain::default());
        assert_eq!(report.status, AssemblyStatus::NotRequested);
        assert_eq!(report.params.map(|params| params.framerate), Some(0.5));
    }
}
