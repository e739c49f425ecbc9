use candle_core::{Module, Result, Tensor};
use candle_nn::{Activation, Conv2d};
use diffusion_engine_common::{nn::conv2d, VarBuilder};
use serde::Deserialize;

use super::vae::{Decoder, VAEConfig};
use crate::models::ImageDecoder;

fn default_act() -> Activation {
    Activation::Silu
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoencoderKlConfig {
    pub out_channels: usize,
    pub block_out_channels: Vec<usize>,
    pub layers_per_block: usize,
    #[serde(default = "default_act")]
    pub act_fn: Activation,
    pub latent_channels: usize,
    pub norm_num_groups: usize,
    pub scaling_factor: f64,
    pub shift_factor: Option<f64>,
    #[serde(default = "default_true")]
    pub mid_block_add_attention: bool,
    #[serde(default = "default_true")]
    pub use_post_quant_conv: bool,
    pub up_block_types: Vec<String>,
}

impl AutoencoderKlConfig {
    /// Spatial downscaling between pixels and latents.
    pub fn downscale_factor(&self) -> usize {
        1 << self.block_out_channels.len().saturating_sub(1)
    }
}

impl From<AutoencoderKlConfig> for VAEConfig {
    fn from(value: AutoencoderKlConfig) -> Self {
        Self {
            out_channels: value.out_channels,
            block_out_channels: value.block_out_channels,
            layers_per_block: value.layers_per_block,
            act_fn: value.act_fn,
            latent_channels: value.latent_channels,
            norm_num_groups: value.norm_num_groups,
            mid_block_add_attention: value.mid_block_add_attention,
            up_block_types: value.up_block_types,
        }
    }
}

/// Decoder side of a KL autoencoder. Encoder weights, if present, are never read.
#[derive(Debug, Clone)]
pub struct AutoEncoderKl {
    decoder: Decoder,
    post_quant_conv: Option<Conv2d>,
    shift_factor: f64,
    scale_factor: f64,
}

impl AutoEncoderKl {
    pub fn new(cfg: &AutoencoderKlConfig, vb: VarBuilder) -> Result<Self> {
        let decoder = Decoder::new(&cfg.clone().into(), vb.pp("decoder"))?;
        let post_quant_conv = if cfg.use_post_quant_conv {
            Some(conv2d(
                cfg.latent_channels,
                cfg.latent_channels,
                1,
                Default::default(),
                vb.pp("post_quant_conv"),
            )?)
        } else {
            None
        };
        Ok(Self {
            decoder,
            post_quant_conv,
            scale_factor: cfg.scaling_factor,
            shift_factor: cfg.shift_factor.unwrap_or(0.0),
        })
    }
}

impl ImageDecoder for AutoEncoderKl {
    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let mut z = ((latents / self.scale_factor)? + self.shift_factor)?;
        if let Some(conv) = &self.post_quant_conv {
            z = z.apply(conv)?;
        }
        self.decoder.forward(&z)
    }
}
