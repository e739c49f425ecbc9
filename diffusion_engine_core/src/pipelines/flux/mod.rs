use std::{collections::HashMap, sync::Mutex};

use candle_core::{DType, Device, Tensor};
use candle_transformers::models::{
    clip::text_model::{ClipTextConfig, ClipTextTransformer},
    t5::{self, T5EncoderModel},
};
use diffusion_engine_common::{
    load_bpe_tokenizer, load_tokenizer_json, Error, FileData, PromptTokenizer, Result, VarBuilder,
};
use tracing::info;

use crate::models::{
    dispatch_load_vae_model, ClipConfigShim, Conditioning, Denoiser, FluxConfig, FluxModel,
    FluxTextEncoder, GuidanceKind, Residency,
};

use super::{
    scheduler::SchedulerConfig, take_component, ComponentElem, ComponentName, LoadContext,
    LoadedModel, Loader, ModelConfig,
};

mod sampling;

const CLIP_MAX_LEN: usize = 77;
/// The undistilled (schnell) checkpoints were trained on exactly 256 T5 tokens.
const T5_SCHNELL_LEN: usize = 256;
const T5_DEV_MAX_LEN: usize = 512;

pub struct FluxLoader;

fn file<'a>(files: &'a HashMap<String, FileData>, name: &str) -> Result<&'a FileData> {
    files
        .get(name)
        .ok_or_else(|| Error::InvalidSource(format!("missing `{name}`")))
}

fn clip_tokenizer(files: &HashMap<String, FileData>) -> Result<PromptTokenizer> {
    if let Some(json) = files.get("tokenizer/tokenizer.json") {
        // Serialized tokenizers add the start and end markers themselves.
        let tokenizer = load_tokenizer_json(&json.read_to_string()?)?;
        let eos = tokenizer.token_to_id("<|endoftext|>").unwrap_or(0);
        return Ok(PromptTokenizer::new("clip", tokenizer, CLIP_MAX_LEN)
            .with_end_marker(Some(eos))
            .with_pad_id(eos)
            .with_fixed_length(true));
    }
    let tokenizer = load_bpe_tokenizer(
        &file(files, "tokenizer/vocab.json")?.read_to_string()?,
        &file(files, "tokenizer/merges.txt")?.read_to_string()?,
    )?;
    let bos = tokenizer.token_to_id("<|startoftext|>");
    let eos = tokenizer.token_to_id("<|endoftext|>");
    Ok(PromptTokenizer::new("clip", tokenizer, CLIP_MAX_LEN)
        .with_special_tokens(bos, eos)
        .with_pad_id(eos.unwrap_or(0))
        .with_fixed_length(true))
}

impl Loader for FluxLoader {
    fn name(&self) -> &'static str {
        "flux"
    }

    fn required_component_names(&self) -> Vec<ComponentName> {
        vec![
            ComponentName::Scheduler,
            ComponentName::TextEncoder(1),
            ComponentName::TextEncoder(2),
            ComponentName::Tokenizer(1),
            ComponentName::Tokenizer(2),
            ComponentName::Transformer,
            ComponentName::Vae,
        ]
    }

    fn load_from_components(
        &self,
        mut components: HashMap<ComponentName, ComponentElem>,
        ctx: &LoadContext,
    ) -> Result<LoadedModel> {
        let silent = ctx.silent();

        let scheduler_files =
            take_component(&mut components, ComponentName::Scheduler)?.into_files()?;
        let scheduler = SchedulerConfig::from_json(
            &file(&scheduler_files, "scheduler/scheduler_config.json")?.read_to_string()?,
        )?;

        if !silent {
            info!("loading FLUX model");
        }
        let (flux_weights, flux_config) =
            take_component(&mut components, ComponentName::Transformer)?.into_model()?;
        let flux_cfg: FluxConfig = ctx.read_config(&flux_config)?;
        let guidance_distilled = flux_cfg.guidance_embeds;
        let flux_model = if ctx.offloading().is_some() {
            let weights = ctx.host_tensor_map(flux_weights)?;
            let dtype = ctx.dtype();
            // Checks names and shapes on the host.
            FluxModel::new(
                &flux_cfg,
                VarBuilder::from_tensors(weights.clone(), dtype, &Device::Cpu),
                silent,
            )?;
            Residency::offloaded(ctx.device().clone(), move |dev| {
                FluxModel::new(
                    &flux_cfg,
                    VarBuilder::from_tensors(weights.clone(), dtype, dev),
                    true,
                )
            })
        } else {
            Residency::on_device(FluxModel::new(
                &flux_cfg,
                ctx.var_builder(flux_weights)?,
                silent,
            )?)
        };
        if !silent {
            info!("FLUX pipeline using a guidance-distilled model: {guidance_distilled}");
        }

        let clip_tok_files =
            take_component(&mut components, ComponentName::Tokenizer(1))?.into_files()?;
        let t5_tok_files =
            take_component(&mut components, ComponentName::Tokenizer(2))?.into_files()?;
        let t5_tokenizer = load_tokenizer_json(
            &file(&t5_tok_files, "tokenizer_2/tokenizer.json")?.read_to_string()?,
        )?;
        let t5_eos = t5_tokenizer.token_to_id("</s>");
        let t5_tokenizer = if guidance_distilled {
            PromptTokenizer::new("t5", t5_tokenizer, T5_DEV_MAX_LEN)
        } else {
            PromptTokenizer::new("t5", t5_tokenizer, T5_SCHNELL_LEN).with_fixed_length(true)
        }
        .with_end_marker(t5_eos);
        let tokenizers = vec![clip_tokenizer(&clip_tok_files)?, t5_tokenizer];

        if !silent {
            info!("loading CLIP model");
        }
        let (clip_weights, clip_config) =
            take_component(&mut components, ComponentName::TextEncoder(1))?.into_model()?;
        let clip_cfg: ClipConfigShim = ctx.read_config(&clip_config)?;
        let clip_cfg = ClipTextConfig::try_from(clip_cfg)
            .map_err(|e| Error::invalid_config(format!("CLIP: {e}")))?;
        let clip_vb = candle_nn::VarBuilder::from_tensors(
            ctx.tensor_map(clip_weights)?,
            ctx.dtype(),
            ctx.device(),
        );
        let clip = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_cfg)?;

        if !silent {
            info!("loading T5 model");
        }
        let (t5_weights, t5_config) =
            take_component(&mut components, ComponentName::TextEncoder(2))?.into_model()?;
        let t5_cfg: t5::Config = ctx.read_config(&t5_config)?;
        let t5 = if ctx.offloading().is_some() {
            let weights = ctx.host_tensor_map(t5_weights)?;
            let dtype = ctx.dtype();
            load_t5(weights.clone(), &t5_cfg, dtype, &Device::Cpu)?;
            Residency::offloaded(ctx.device().clone(), move |dev| {
                load_t5(weights.clone(), &t5_cfg, dtype, dev)
            })
        } else {
            Residency::on_device(load_t5(
                ctx.tensor_map(t5_weights)?,
                &t5_cfg,
                ctx.dtype(),
                ctx.device(),
            )?)
        };

        if !silent {
            info!("loading VAE model");
        }
        let (vae_weights, vae_config) =
            take_component(&mut components, ComponentName::Vae)?.into_model()?;
        let vae = dispatch_load_vae_model(
            &ctx.read_config_str(&vae_config)?,
            ctx.var_builder(vae_weights)?,
        )?;

        Ok(LoadedModel {
            config: ModelConfig {
                name: self.name().to_string(),
                latent_channels: vae.latent_channels,
                latent_downscale: vae.downscale_factor,
                // Latents are packed in 2x2 patches.
                spatial_compression: vae.downscale_factor * 2,
            },
            tokenizers,
            text_encoder: Box::new(FluxTextEncoder::new(clip, t5)),
            denoiser: Box::new(FluxDenoiser {
                model: flux_model,
                guidance_distilled,
            }),
            decoder: vae.decoder,
            scheduler,
            device: ctx.device().clone(),
            dtype: ctx.dtype(),
        })
    }
}

fn load_t5(
    weights: HashMap<String, Tensor>,
    cfg: &t5::Config,
    dtype: DType,
    dev: &Device,
) -> candle_core::Result<Mutex<T5EncoderModel>> {
    let vb = candle_nn::VarBuilder::from_tensors(weights, dtype, dev);
    T5EncoderModel::load(vb, cfg).map(Mutex::new)
}

/// Runs the FLUX transformer on unpacked latents.
pub struct FluxDenoiser {
    model: Residency<FluxModel>,
    guidance_distilled: bool,
}

impl Denoiser for FluxDenoiser {
    fn guidance_kind(&self) -> GuidanceKind {
        if self.guidance_distilled {
            GuidanceKind::Distilled
        } else {
            GuidanceKind::ClassifierFree
        }
    }

    fn predict(
        &self,
        latent: &Tensor,
        sigma: f64,
        cond: &Conditioning,
        guidance: Option<f64>,
    ) -> candle_core::Result<Tensor> {
        let (b, _c, h, w) = latent.dims4()?;
        let dtype = latent.dtype();
        let dev = latent.device();
        let Some(pooled) = cond.pooled.as_ref() else {
            candle_core::bail!("FLUX needs a pooled CLIP embedding")
        };

        let img = sampling::pack(latent)?;
        let img_ids = sampling::img_ids(b, h, w, dtype, dev)?;
        let txt = cond.context.to_dtype(dtype)?;
        let txt_ids = Tensor::zeros((b, txt.dim(1)?, 3), dtype, dev)?;
        let t_vec = Tensor::full(sigma as f32, b, dev)?.to_dtype(dtype)?;
        let guidance = guidance
            .map(|g| Tensor::full(g as f32, b, dev)?.to_dtype(dtype))
            .transpose()?;

        let pred = self.model.acquire()?.forward(
            &img,
            &img_ids,
            &txt,
            &txt_ids,
            &t_vec,
            &pooled.to_dtype(dtype)?,
            guidance.as_ref(),
        )?;
        sampling::unpack(&pred, h, w)
    }

    fn release(&self) -> candle_core::Result<()> {
        self.model.release();
        Ok(())
    }
}
