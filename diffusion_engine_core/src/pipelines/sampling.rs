use std::{
    io::Cursor,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use candle_core::{DType, Device, IndexOp, Tensor};
use diffusion_engine_common::{Error, NiceProgressBar, Result};
use image::{imageops::FilterType, DynamicImage, ImageFormat, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::debug;

use super::{scheduler::Schedule, OutputFormat};
use crate::models::{Conditioning, Denoiser, GuidanceKind};

/// Cooperative cancellation for a running generation. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The executor stops before the next denoising step.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How predictions are produced and combined at every step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GuidancePlan {
    /// One pass, the scale is passed to the model.
    Distilled { scale: f64 },
    /// One conditional pass, no guidance.
    Conditional,
    /// Conditional and unconditional passes combined as `u + scale * (c - u)`.
    ClassifierFree { scale: f64 },
}

impl GuidancePlan {
    pub fn new(kind: GuidanceKind, scale: f64) -> Self {
        match kind {
            GuidanceKind::Distilled => Self::Distilled { scale },
            GuidanceKind::ClassifierFree if scale == 0.0 => Self::Conditional,
            GuidanceKind::ClassifierFree => Self::ClassifierFree { scale },
        }
    }

    /// Whether an unconditional (empty prompt) conditioning is needed.
    pub fn needs_unconditional(&self) -> bool {
        matches!(self, Self::ClassifierFree { .. })
    }
}

/// The latent after `step` transitions.
#[derive(Debug, Clone)]
pub struct DenoiseState {
    pub step: usize,
    pub latent: Tensor,
}

/// Steps latents along a [`Schedule`].
pub struct DenoisingExecutor<'a> {
    denoiser: &'a dyn Denoiser,
    schedule: &'a Schedule,
    plan: GuidancePlan,
    cond: &'a Conditioning,
    uncond: Option<&'a Conditioning>,
    cancellation: Option<&'a CancellationToken>,
    silent: bool,
}

impl<'a> DenoisingExecutor<'a> {
    pub fn new(
        denoiser: &'a dyn Denoiser,
        schedule: &'a Schedule,
        plan: GuidancePlan,
        cond: &'a Conditioning,
    ) -> Self {
        Self {
            denoiser,
            schedule,
            plan,
            cond,
            uncond: None,
            cancellation: None,
            silent: true,
        }
    }

    /// Conditioning of the empty prompt, required by [`GuidancePlan::ClassifierFree`].
    pub fn with_unconditional(mut self, uncond: &'a Conditioning) -> Self {
        self.uncond = Some(uncond);
        self
    }

    pub fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Show a progress bar over the steps unless `silent`.
    pub fn with_progress(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn is_done(&self, state: &DenoiseState) -> bool {
        state.step >= self.schedule.len()
    }

    fn predict(&self, latent: &Tensor, sigma: f64) -> Result<Tensor> {
        let pred = match self.plan {
            GuidancePlan::Distilled { scale } => {
                self.denoiser.predict(latent, sigma, self.cond, Some(scale))?
            }
            GuidancePlan::Conditional => self.denoiser.predict(latent, sigma, self.cond, None)?,
            GuidancePlan::ClassifierFree { scale } => {
                let uncond = self.uncond.ok_or_else(|| {
                    Error::validation("classifier-free guidance without unconditional embeddings")
                })?;
                let c = self.denoiser.predict(latent, sigma, self.cond, None)?;
                let u = self.denoiser.predict(latent, sigma, uncond, None)?;
                (&u + ((c - &u)? * scale)?)?
            }
        };
        Ok(pred)
    }

    /// Apply one scheduler transition.
    pub fn step(&self, state: DenoiseState) -> Result<DenoiseState> {
        let Some(transition) = self.schedule.get(state.step) else {
            return Err(Error::validation(format!(
                "step {} is past the end of a {} step schedule",
                state.step,
                self.schedule.len()
            )));
        };
        let pred = self.predict(&state.latent, transition.sigma)?;
        Ok(DenoiseState {
            step: state.step + 1,
            latent: transition.apply(&state.latent, &pred)?,
        })
    }

    /// Run every remaining step, checking for cancellation before each one.
    pub fn run(&self, initial: Tensor) -> Result<Tensor> {
        let mut state = DenoiseState {
            step: 0,
            latent: initial,
        };
        let steps: Box<dyn Iterator<Item = usize>> = if self.silent {
            Box::new(0..self.schedule.len())
        } else {
            Box::new(
                NiceProgressBar::<_, 'g'>(0..self.schedule.len(), "Denoise loop").into_iter(),
            )
        };
        for _ in steps {
            if self
                .cancellation
                .is_some_and(CancellationToken::is_cancelled)
            {
                debug!("cancelled before step {}", state.step);
                return Err(Error::Cancelled(state.step));
            }
            state = self.step(state)?;
        }
        Ok(state.latent)
    }
}

/// Standard normal noise of shape `(n, c, h, w)` for prompts `batch_offset..batch_offset + n`.
///
/// With a seed, prompt `i` of a request always draws from `seed + i`, so a prompt's noise does
/// not depend on how the request is split into batches. Without a seed every call draws fresh
/// entropy and results are not reproducible.
pub fn initial_noise(
    batch_offset: usize,
    n: usize,
    (c, h, w): (usize, usize, usize),
    seed: Option<u64>,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let numel = c * h * w;
    let mut data = Vec::with_capacity(n * numel);
    for i in 0..n {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add((batch_offset + i) as u64)),
            None => StdRng::from_entropy(),
        };
        data.extend((0..numel).map(|_| rng.sample::<f32, _>(StandardNormal)));
    }
    Ok(Tensor::from_vec(data, (n, c, h, w), &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(device)?)
}

/// Convert decoded pixels in `[-1, 1]`, shaped `(batch, 3, h, w)`, to `height x width` images.
pub fn to_images(pixels: &Tensor, height: usize, width: usize) -> Result<Vec<DynamicImage>> {
    let (b, c, h, w) = pixels.dims4()?;
    if c != 3 {
        return Err(Error::Backend(candle_core::Error::Msg(format!(
            "expected 3 channels in the decoded image, got {c}"
        ))));
    }
    let pixels = ((pixels.to_dtype(DType::F32)?.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?
        .to_dtype(DType::U8)?
        .to_device(&Device::Cpu)?;
    let mut images = Vec::with_capacity(b);
    for i in 0..b {
        let flattened = pixels.i(i)?.permute((1, 2, 0))?.flatten_all()?;
        #[allow(clippy::cast_possible_truncation)]
        let img = RgbImage::from_raw(w as u32, h as u32, flattened.to_vec1::<u8>()?).ok_or(
            candle_core::Error::Msg("RgbImage has invalid capacity.".to_string()),
        )?;
        let img = if (h, w) == (height, width) {
            img
        } else {
            debug!("resizing decoded {w}x{h} image to {width}x{height}");
            #[allow(clippy::cast_possible_truncation)]
            image::imageops::resize(&img, width as u32, height as u32, FilterType::Lanczos3)
        };
        images.push(DynamicImage::ImageRgb8(img));
    }
    Ok(images)
}

pub fn encode_image(img: &DynamicImage, format: OutputFormat) -> Result<Vec<u8>> {
    let format = match format {
        OutputFormat::Png => ImageFormat::Png,
        OutputFormat::Jpeg => ImageFormat::Jpeg,
    };
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), format)?;
    Ok(buf)
}
