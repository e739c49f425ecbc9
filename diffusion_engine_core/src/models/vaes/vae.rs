#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use candle_core::{Module, Result, Tensor};
use candle_nn::{Activation, Conv2d, Conv2dConfig, GroupNorm, Linear};
use diffusion_engine_common::{
    nn::{conv2d, group_norm, linear, scaled_dot_product_attention},
    VarBuilder,
};
use serde::Deserialize;
use tracing::{span, Span};

fn default_act() -> Activation {
    Activation::Silu
}

#[derive(Debug, Clone, Deserialize)]
pub struct VAEConfig {
    pub out_channels: usize,
    pub block_out_channels: Vec<usize>,
    pub layers_per_block: usize,
    #[serde(default = "default_act")]
    pub act_fn: Activation,
    pub latent_channels: usize,
    pub norm_num_groups: usize,
    pub mid_block_add_attention: bool,
    pub up_block_types: Vec<String>,
}

#[derive(Debug, Clone)]
struct AttnBlock {
    q: Linear,
    k: Linear,
    v: Linear,
    out: Linear,
    norm: GroupNorm,
    span: Span,
}

impl AttnBlock {
    fn new(in_c: usize, vb: VarBuilder, cfg: &VAEConfig) -> Result<Self> {
        Ok(Self {
            q: linear(in_c, in_c, vb.pp("to_q"))?,
            k: linear(in_c, in_c, vb.pp("to_k"))?,
            v: linear(in_c, in_c, vb.pp("to_v"))?,
            out: linear(in_c, in_c, vb.pp("to_out.0"))?,
            norm: group_norm(cfg.norm_num_groups, in_c, 1e-6, vb.pp("group_norm"))?,
            span: span!(tracing::Level::TRACE, "vae-attn"),
        })
    }
}

impl Module for AttnBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _span = self.span.enter();
        let (b, c, h, w) = xs.dims4()?;
        // (b, h * w, c)
        let hidden = xs
            .apply(&self.norm)?
            .flatten_from(2)?
            .transpose(1, 2)?
            .contiguous()?;
        let q = hidden.apply(&self.q)?.unsqueeze(1)?;
        let k = hidden.apply(&self.k)?.unsqueeze(1)?;
        let v = hidden.apply(&self.v)?.unsqueeze(1)?;
        let attn = scaled_dot_product_attention(&q, &k, &v)?
            .squeeze(1)?
            .apply(&self.out)?;
        let attn = attn.transpose(1, 2)?.reshape((b, c, h, w))?;
        attn + xs
    }
}

#[derive(Debug, Clone)]
struct ResnetBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    nin_shortcut: Option<Conv2d>,
    act_fn: Activation,
    span: Span,
}

impl ResnetBlock {
    fn new(in_c: usize, out_c: usize, vb: VarBuilder, cfg: &VAEConfig) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let nin_shortcut = if in_c == out_c {
            None
        } else {
            Some(conv2d(
                in_c,
                out_c,
                1,
                Default::default(),
                vb.pp("conv_shortcut"),
            )?)
        };
        Ok(Self {
            norm1: group_norm(cfg.norm_num_groups, in_c, 1e-6, vb.pp("norm1"))?,
            conv1: conv2d(in_c, out_c, 3, conv_cfg, vb.pp("conv1"))?,
            norm2: group_norm(cfg.norm_num_groups, out_c, 1e-6, vb.pp("norm2"))?,
            conv2: conv2d(out_c, out_c, 3, conv_cfg, vb.pp("conv2"))?,
            nin_shortcut,
            act_fn: cfg.act_fn,
            span: span!(tracing::Level::TRACE, "vae-resnet"),
        })
    }
}

impl Module for ResnetBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _span = self.span.enter();
        let h = xs
            .apply(&self.norm1)?
            .apply(&self.act_fn)?
            .apply(&self.conv1)?
            .apply(&self.norm2)?
            .apply(&self.act_fn)?
            .apply(&self.conv2)?;
        match self.nin_shortcut.as_ref() {
            None => xs + h,
            Some(c) => xs.apply(c)? + h,
        }
    }
}

#[derive(Debug, Clone)]
struct Upsample {
    conv: Conv2d,
    span: Span,
}

impl Upsample {
    fn new(in_c: usize, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            conv: conv2d(in_c, in_c, 3, conv_cfg, vb.pp("conv"))?,
            span: span!(tracing::Level::TRACE, "vae-upsample"),
        })
    }
}

impl Module for Upsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _span = self.span.enter();
        let (_, _, h, w) = xs.dims4()?;
        xs.upsample_nearest2d(h * 2, w * 2)?.apply(&self.conv)
    }
}

#[derive(Debug, Clone)]
struct UpBlock {
    block: Vec<ResnetBlock>,
    upsample: Option<Upsample>,
}

/// The decoder half of a diffusers `AutoencoderKL`.
#[derive(Debug, Clone)]
pub struct Decoder {
    conv_in: Conv2d,
    mid_block_1: ResnetBlock,
    mid_attn_1: Option<AttnBlock>,
    mid_block_2: ResnetBlock,
    norm_out: GroupNorm,
    conv_out: Conv2d,
    up: Vec<UpBlock>,
    act_fn: Activation,
}

impl Decoder {
    pub fn new(cfg: &VAEConfig, vb: VarBuilder) -> Result<Self> {
        if !cfg.up_block_types.iter().all(|x| x == "UpDecoderBlock2D") {
            candle_core::bail!("All up (decoder) block types must be `UpDecoderBlock2D`");
        }
        let (Some(&base_ch), Some(&top_ch)) =
            (cfg.block_out_channels.first(), cfg.block_out_channels.last())
        else {
            candle_core::bail!("`block_out_channels` must not be empty");
        };
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let mut block_in = top_ch;

        let conv_in = conv2d(cfg.latent_channels, block_in, 3, conv_cfg, vb.pp("conv_in"))?;
        let mid_block_1 = ResnetBlock::new(block_in, block_in, vb.pp("mid_block.resnets.0"), cfg)?;
        let mid_attn_1 = if cfg.mid_block_add_attention {
            Some(AttnBlock::new(
                block_in,
                vb.pp("mid_block.attentions.0"),
                cfg,
            )?)
        } else {
            None
        };
        let mid_block_2 = ResnetBlock::new(block_in, block_in, vb.pp("mid_block.resnets.1"), cfg)?;

        let n_levels = cfg.block_out_channels.len();
        let mut up = Vec::with_capacity(n_levels);
        let vb_u = vb.pp("up_blocks");
        for (i_level, out_channels) in cfg.block_out_channels.iter().rev().enumerate() {
            let block_out = *out_channels;
            let vb_u = vb_u.pp(i_level);
            let vb_resnets = vb_u.pp("resnets");
            let mut block = Vec::with_capacity(cfg.layers_per_block + 1);
            for i_block in 0..=cfg.layers_per_block {
                block.push(ResnetBlock::new(
                    block_in,
                    block_out,
                    vb_resnets.pp(i_block),
                    cfg,
                )?);
                block_in = block_out;
            }
            let upsample = if i_level != n_levels - 1 {
                Some(Upsample::new(block_in, vb_u.pp("upsamplers.0"))?)
            } else {
                None
            };
            up.push(UpBlock { block, upsample })
        }

        let norm_out = group_norm(cfg.norm_num_groups, base_ch, 1e-6, vb.pp("conv_norm_out"))?;
        let conv_out = conv2d(base_ch, cfg.out_channels, 3, conv_cfg, vb.pp("conv_out"))?;
        Ok(Self {
            conv_in,
            mid_block_1,
            mid_attn_1,
            mid_block_2,
            norm_out,
            conv_out,
            up,
            act_fn: cfg.act_fn,
        })
    }
}

impl Module for Decoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.apply(&self.conv_in)?.apply(&self.mid_block_1)?;
        if let Some(attn) = &self.mid_attn_1 {
            h = h.apply(attn)?;
        }
        h = h.apply(&self.mid_block_2)?;
        for block in self.up.iter() {
            for b in block.block.iter() {
                h = h.apply(b)?
            }
            if let Some(us) = block.upsample.as_ref() {
                h = h.apply(us)?
            }
        }
        h.apply(&self.norm_out)?
            .apply(&self.act_fn)?
            .apply(&self.conv_out)
    }
}
