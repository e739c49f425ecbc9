use candle_core::Tensor;
use diffusion_engine_common::{Error, Result};
use serde::Deserialize;

fn default_base_image_seq_len() -> usize {
    256
}
fn default_max_image_seq_len() -> usize {
    4096
}
fn default_base_shift() -> f64 {
    0.5
}
fn default_max_shift() -> f64 {
    1.15
}
fn default_shift() -> f64 {
    1.0
}

#[derive(Deserialize, Clone, Debug)]
pub struct SchedulerConfig {
    #[serde(rename = "_class_name")]
    pub scheduler_type: SchedulerType,
    #[serde(default = "default_base_image_seq_len")]
    pub base_image_seq_len: usize,
    #[serde(default = "default_base_shift")]
    pub base_shift: f64,
    #[serde(default = "default_max_image_seq_len")]
    pub max_image_seq_len: usize,
    #[serde(default = "default_max_shift")]
    pub max_shift: f64,
    #[serde(default = "default_shift")]
    pub shift: f64,
    #[serde(default)]
    pub use_dynamic_shifting: bool,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerType {
    #[serde(rename = "FlowMatchEulerDiscreteScheduler")]
    FlowMatchEulerDiscrete,
}

fn time_shift(mu: f64, sigma: f64, t: f64) -> f64 {
    let e = mu.exp();
    e / (e + (1. / t - 1.).powf(sigma))
}

/// Linear interpolation of the shift parameter `mu` over the image sequence length.
pub(crate) fn calculate_shift(
    image_seq_len: usize,
    base_seq_len: usize,
    max_seq_len: usize,
    base_shift: f64,
    max_shift: f64,
) -> f64 {
    let m = (max_shift - base_shift) / (max_seq_len as f64 - base_seq_len as f64);
    let b = base_shift - m * base_seq_len as f64;
    image_seq_len as f64 * m + b
}

/// One Euler transition between two noise levels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleStep {
    pub sigma: f64,
    pub sigma_next: f64,
}

impl ScheduleStep {
    /// `latent + (sigma_next - sigma) * prediction`
    pub fn apply(&self, latent: &Tensor, prediction: &Tensor) -> candle_core::Result<Tensor> {
        latent + (prediction * (self.sigma_next - self.sigma))?
    }
}

/// The ordered transitions of a denoising run, from pure noise (`sigma = 1`) down to `0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    steps: Vec<ScheduleStep>,
}

impl Schedule {
    pub fn steps(&self) -> &[ScheduleStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, step: usize) -> Option<&ScheduleStep> {
        self.steps.get(step)
    }
}

impl SchedulerConfig {
    /// Parse `scheduler_config.json`.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::invalid_config(format!("scheduler: {e}")))
    }

    /// The `num_steps + 1` noise levels visited by a run, first to last.
    pub fn sigmas(&self, num_steps: usize, image_seq_len: usize) -> Result<Vec<f64>> {
        if num_steps == 0 {
            return Err(Error::validation("`num_steps` must be at least 1"));
        }
        let sigmas = (0..=num_steps)
            .map(|v| v as f64 / num_steps as f64)
            .rev();
        match self.scheduler_type {
            SchedulerType::FlowMatchEulerDiscrete => {
                if self.use_dynamic_shifting {
                    let mu = calculate_shift(
                        image_seq_len,
                        self.base_image_seq_len,
                        self.max_image_seq_len,
                        self.base_shift,
                        self.max_shift,
                    );
                    Ok(sigmas.map(|sigma| time_shift(mu, 1., sigma)).collect())
                } else {
                    Ok(sigmas
                        .map(|sigma| self.shift * sigma / (1. + (self.shift - 1.) * sigma))
                        .collect())
                }
            }
        }
    }

    pub fn schedule(&self, num_steps: usize, image_seq_len: usize) -> Result<Schedule> {
        let sigmas = self.sigmas(num_steps, image_seq_len)?;
        let steps = sigmas
            .windows(2)
            .map(|w| ScheduleStep {
                sigma: w[0],
                sigma_next: w[1],
            })
            .collect();
        Ok(Schedule { steps })
    }
}
