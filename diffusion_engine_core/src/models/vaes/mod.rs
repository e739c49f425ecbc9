use diffusion_engine_common::{Error, Result, VarBuilder};
use serde::Deserialize;

use autoencoder_kl::{AutoEncoderKl, AutoencoderKlConfig};

use super::ImageDecoder;

mod autoencoder_kl;
mod vae;

/// A loaded VAE together with the latent geometry it expects.
pub struct LoadedVae {
    pub decoder: Box<dyn ImageDecoder>,
    pub latent_channels: usize,
    pub downscale_factor: usize,
}

#[derive(Clone, Debug, Deserialize)]
struct VaeConfigShim {
    #[serde(rename = "_class_name")]
    name: String,
}

fn load_autoencoder_kl(cfg_json: &str, vb: VarBuilder) -> Result<LoadedVae> {
    let cfg: AutoencoderKlConfig = serde_json::from_str(cfg_json)?;
    if cfg.block_out_channels.is_empty() {
        return Err(Error::invalid_config("VAE `block_out_channels` is empty"));
    }
    if let Some(other) = cfg
        .up_block_types
        .iter()
        .find(|ty| ty.as_str() != "UpDecoderBlock2D")
    {
        return Err(Error::UnsupportedModel(format!("VAE up block `{other}`")));
    }
    let downscale_factor = cfg.downscale_factor();
    let latent_channels = cfg.latent_channels;
    Ok(LoadedVae {
        decoder: Box::new(AutoEncoderKl::new(&cfg, vb)?),
        latent_channels,
        downscale_factor,
    })
}

/// Instantiate the VAE named by `_class_name` in `cfg_json`.
pub fn dispatch_load_vae_model(cfg_json: &str, vb: VarBuilder) -> Result<LoadedVae> {
    let VaeConfigShim { name } = serde_json::from_str(cfg_json)?;
    match name.as_str() {
        "AutoencoderKL" => load_autoencoder_kl(cfg_json, vb),
        other => Err(Error::UnsupportedModel(format!("VAE type `{other}`"))),
    }
}
