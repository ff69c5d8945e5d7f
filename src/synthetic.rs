//! A stand-in generation engine for demos and tests.
//!
//! It "denoises" seeded noise toward a gradient over the configured number of
//! steps, calling the step hook once per iteration like a real sampler would.

use anyhow::Result;
use chrono::Local;

use crate::engine::{Preview, RunMetadata, RunStart, StepInfo};
use crate::hook::StepHook;

#[derive(Debug, Clone)]
pub struct SyntheticEngine {
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: i64,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    pub sampler_name: String,
    pub cfg_scale: f32,
    /// Stop after this many steps, as if the user interrupted the run.
    pub interrupt_after: Option<u32>,
}

impl Default for SyntheticEngine {
    fn default() -> Self {
        Self {
            prompt: "a lighthouse on a cliff at dusk".to_owned(),
            negative_prompt: String::new(),
            seed: 1,
            steps: 20,
            width: 64,
            height: 64,
            sampler_name: "Euler a".to_owned(),
            cfg_scale: 7.0,
            interrupt_after: None,
        }
    }
}

impl SyntheticEngine {
    pub fn run_start(&self) -> RunStart {
        RunStart {
            seed: self.seed,
            prompt: self.prompt.clone(),
            steps: self.steps,
        }
    }

    /// Runs every step through `hook` and reports the run's metadata.
    pub fn run(&self, hook: &StepHook) -> Result<RunMetadata> {
        let noise = self.noise();
        let last = self
            .interrupt_after
            .map_or(self.steps, |limit| limit.min(self.steps));
        for index in 0..last {
            let preview = self.preview(&noise, index)?;
            hook.dispatch(&StepInfo {
                index,
                preview: &preview,
            });
        }
        Ok(self.metadata())
    }

    fn metadata(&self) -> RunMetadata {
        let info = format!(
            "{}\nNegative prompt: {}\nSteps: {}, Sampler: {}, CFG scale: {}, Seed: {}, Size: {}x{}, Model: synthetic-gradient",
            self.prompt,
            self.negative_prompt,
            self.steps,
            self.sampler_name,
            self.cfg_scale,
            self.seed,
            self.width,
            self.height,
        );
        RunMetadata {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            seed: self.seed,
            sampler_name: self.sampler_name.clone(),
            cfg_scale: self.cfg_scale,
            steps: self.steps,
            info,
            face_restoration_model: None,
            job_timestamp: Local::now().format("%Y%m%d%H%M%S").to_string(),
        }
    }

    fn noise(&self) -> Vec<u8> {
        let mut state = (self.seed as u64) ^ 0x9e37_79b9_7f4a_7c15;
        let len = self.width as usize * self.height as usize * 3;
        (0..len)
            .map(|_| {
                // xorshift64
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 56) as u8
            })
            .collect()
    }

    fn preview(&self, noise: &[u8], index: u32) -> Result<Preview> {
        let t = (index + 1) as f32 / self.steps.max(1) as f32;
        let mut rgba = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        for y in 0..self.height {
            for x in 0..self.width {
                let target = [
                    (x * 255 / self.width.max(1)) as f32,
                    (y * 255 / self.height.max(1)) as f32,
                    160.0,
                ];
                let base = (y * self.width + x) as usize * 3;
                for (channel, target) in target.into_iter().enumerate() {
                    let value = noise[base + channel] as f32 * (1.0 - t) + target * t;
                    rgba.push(value.round().clamp(0.0, 255.0) as u8);
                }
                rgba.push(255);
            }
        }
        Preview::new(self.width, self.height, rgba)
    }
}
