mod flux;
mod offload;
mod text;
mod vaes;

use candle_core::{Result, Tensor};

pub use flux::{FluxConfig, FluxModel};
pub use offload::{Offloading, Residency};
pub use text::{ClipConfigShim, FluxTextEncoder};
pub use vaes::dispatch_load_vae_model;

/// Output of a [`TextEncoder`] for a batch of prompts.
#[derive(Debug, Clone)]
pub struct Conditioning {
    /// Per-token embeddings, `(batch, seq_len, dim)`.
    pub context: Tensor,
    /// Pooled prompt embedding, `(batch, dim)`, for models that use one.
    pub pooled: Option<Tensor>,
}

/// How a [`Denoiser`] applies the guidance scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidanceKind {
    /// The scale is fed to the model as an embedding; a single pass per step.
    Distilled,
    /// Conditional and unconditional predictions are combined outside of the model.
    ClassifierFree,
}

/// Maps token ids to the conditioning consumed by the denoiser.
pub trait TextEncoder: Send + Sync {
    /// `input_ids` holds one `(batch, seq_len)` tensor per prompt tokenizer, in the order
    /// of [`crate::LoadedModel::tokenizers`].
    fn encode(&self, input_ids: &[Tensor]) -> Result<Conditioning>;
}

pub trait Denoiser: Send + Sync {
    fn guidance_kind(&self) -> GuidanceKind;

    /// Predict the flow (velocity) for `latent` of shape `(batch, channels, h, w)` at noise
    /// level `sigma`. `guidance` is only set for [`GuidanceKind::Distilled`] models.
    fn predict(
        &self,
        latent: &Tensor,
        sigma: f64,
        cond: &Conditioning,
        guidance: Option<f64>,
    ) -> Result<Tensor>;

    /// Called once a denoising loop is over, also when it failed. Offloaded models drop their
    /// device copy here.
    fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Decodes denoised latents to pixels in `[-1, 1]`, shaped `(batch, 3, height, width)`.
///
/// Implementations undo their own latent scaling.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;
}
