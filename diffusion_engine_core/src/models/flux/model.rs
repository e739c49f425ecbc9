#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use candle_core::{DType, IndexOp, Module, Result, Tensor, D};
use candle_nn::{LayerNorm, Linear, RmsNorm};
use diffusion_engine_common::{
    nn::{layer_norm_no_affine, linear, linear_b, rms_norm, scaled_dot_product_attention},
    IterWithProgress, VarBuilder,
};
use serde::Deserialize;
use tracing::{span, Span};

const MLP_RATIO: f64 = 4.;
const THETA: usize = 10000;
const TIMESTEP_DIM: usize = 256;

fn default_attention_head_dim() -> usize {
    128
}

fn default_axes_dims_rope() -> Vec<usize> {
    vec![16, 56, 56]
}

#[derive(Debug, Clone, Deserialize)]
pub struct FluxConfig {
    pub in_channels: usize,
    pub pooled_projection_dim: usize,
    pub joint_attention_dim: usize,
    pub num_attention_heads: usize,
    #[serde(default = "default_attention_head_dim")]
    pub attention_head_dim: usize,
    pub num_layers: usize,
    pub num_single_layers: usize,
    #[serde(default)]
    pub guidance_embeds: bool,
    #[serde(default = "default_axes_dims_rope")]
    pub axes_dims_rope: Vec<usize>,
}

impl FluxConfig {
    pub fn hidden_size(&self) -> usize {
        self.num_attention_heads * self.attention_head_dim
    }
}

fn rope(pos: &Tensor, dim: usize, theta: usize) -> Result<Tensor> {
    if dim % 2 == 1 {
        candle_core::bail!("dim {dim} is odd")
    }
    let dev = pos.device();
    let theta = theta as f64;
    let inv_freq: Vec<_> = (0..dim)
        .step_by(2)
        .map(|i| 1f32 / theta.powf(i as f64 / dim as f64) as f32)
        .collect();
    let inv_freq_len = inv_freq.len();
    let inv_freq = Tensor::from_vec(inv_freq, (1, 1, inv_freq_len), dev)?;
    let inv_freq = inv_freq.to_dtype(pos.dtype())?;
    let freqs = pos.unsqueeze(2)?.broadcast_mul(&inv_freq)?;
    let cos = freqs.cos()?;
    let sin = freqs.sin()?;
    let out = Tensor::stack(&[&cos, &sin.neg()?, &sin, &cos], 3)?;
    let (b, n, d, _ij) = out.dims4()?;
    out.reshape((b, n, d, 2, 2))
}

fn apply_rope(x: &Tensor, freq_cis: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let (b_sz, n_head, seq_len, n_embd) = x.dims4()?;
    let x = x.reshape((b_sz, n_head, seq_len, n_embd / 2, 2))?;
    let x0 = x.narrow(D::Minus1, 0, 1)?;
    let x1 = x.narrow(D::Minus1, 1, 1)?;
    let fr0 = freq_cis.get_on_dim(D::Minus1, 0)?;
    let fr1 = freq_cis.get_on_dim(D::Minus1, 1)?;
    (fr0.broadcast_mul(&x0)? + fr1.broadcast_mul(&x1)?)?.reshape(dims.to_vec())
}

fn attention(q: &Tensor, k: &Tensor, v: &Tensor, pe: &Tensor) -> Result<Tensor> {
    let q = apply_rope(q, pe)?.contiguous()?;
    let k = apply_rope(k, pe)?.contiguous()?;
    let x = scaled_dot_product_attention(&q, &k, v)?;
    x.transpose(1, 2)?.flatten_from(2)
}

/// Sinusoidal embedding of `t` (in `[0, 1]`, scaled by 1000 like the training timesteps).
fn timestep_embedding(t: &Tensor, dim: usize, dtype: DType) -> Result<Tensor> {
    const TIME_FACTOR: f64 = 1000.;
    const MAX_PERIOD: f64 = 10000.;
    if dim % 2 == 1 {
        candle_core::bail!("{dim} is odd")
    }
    let dev = t.device();
    let half = dim / 2;
    let t = (t * TIME_FACTOR)?;
    let arange = Tensor::arange(0, half as u32, dev)?.to_dtype(DType::F32)?;
    let freqs = (arange * (-MAX_PERIOD.ln() / half as f64))?.exp()?;
    let args = t
        .unsqueeze(1)?
        .to_dtype(DType::F32)?
        .broadcast_mul(&freqs.unsqueeze(0)?)?;
    let emb = Tensor::cat(&[args.cos()?, args.sin()?], D::Minus1)?.to_dtype(dtype)?;
    Ok(emb)
}

#[derive(Debug, Clone)]
struct EmbedNd {
    theta: usize,
    axes_dim: Vec<usize>,
}

impl Module for EmbedNd {
    fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let n_axes = ids.dim(D::Minus1)?;
        if n_axes != self.axes_dim.len() {
            candle_core::bail!(
                "position ids have {n_axes} axes, rope is configured for {}",
                self.axes_dim.len()
            )
        }
        let mut emb = Vec::with_capacity(n_axes);
        for idx in 0..n_axes {
            let r = rope(
                &ids.get_on_dim(D::Minus1, idx)?,
                self.axes_dim[idx],
                self.theta,
            )?;
            emb.push(r)
        }
        let emb = Tensor::cat(&emb, 2)?;
        emb.unsqueeze(1)
    }
}

#[derive(Debug, Clone)]
struct MlpEmbedder {
    in_layer: Linear,
    out_layer: Linear,
}

impl MlpEmbedder {
    fn new(in_sz: usize, h_sz: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            in_layer: linear(in_sz, h_sz, vb.pp("linear_1"))?,
            out_layer: linear(h_sz, h_sz, vb.pp("linear_2"))?,
        })
    }
}

impl Module for MlpEmbedder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.in_layer)?.silu()?.apply(&self.out_layer)
    }
}

#[derive(Debug, Clone)]
struct QkNorm {
    query_norm: RmsNorm,
    key_norm: RmsNorm,
}

impl QkNorm {
    fn new(dim: usize, vb_q: VarBuilder, vb_k: VarBuilder) -> Result<Self> {
        let query_norm = rms_norm(dim, 1e-6, vb_q)?;
        let key_norm = rms_norm(dim, 1e-6, vb_k)?;
        Ok(Self {
            query_norm,
            key_norm,
        })
    }
}

struct ModulationOut {
    shift: Tensor,
    scale: Tensor,
    gate: Tensor,
}

impl ModulationOut {
    fn scale_shift(&self, xs: &Tensor) -> Result<Tensor> {
        xs.broadcast_mul(&(&self.scale + 1.)?)?
            .broadcast_add(&self.shift)
    }

    fn gate(&self, xs: &Tensor) -> Result<Tensor> {
        self.gate.broadcast_mul(xs)
    }
}

fn modulation_chunks(lin: &Linear, vec_: &Tensor, n: usize) -> Result<Vec<ModulationOut>> {
    let ys = vec_.silu()?.apply(lin)?.unsqueeze(1)?.chunk(3 * n, D::Minus1)?;
    if ys.len() != 3 * n {
        candle_core::bail!("unexpected len from chunk {ys:?}")
    }
    Ok(ys
        .chunks_exact(3)
        .map(|c| ModulationOut {
            shift: c[0].clone(),
            scale: c[1].clone(),
            gate: c[2].clone(),
        })
        .collect())
}

#[derive(Debug, Clone)]
struct Modulation1 {
    lin: Linear,
    span: Span,
}

impl Modulation1 {
    fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            lin: linear(dim, 3 * dim, vb.pp("linear"))?,
            span: span!(tracing::Level::TRACE, "flux-mod1"),
        })
    }

    fn forward(&self, vec_: &Tensor) -> Result<ModulationOut> {
        let _span = self.span.enter();
        let mut outs = modulation_chunks(&self.lin, vec_, 1)?;
        outs.pop()
            .ok_or_else(|| candle_core::Error::Msg("empty modulation".to_string()))
    }
}

#[derive(Debug, Clone)]
struct Modulation2 {
    lin: Linear,
    span: Span,
}

impl Modulation2 {
    fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            lin: linear(dim, 6 * dim, vb.pp("linear"))?,
            span: span!(tracing::Level::TRACE, "flux-mod2"),
        })
    }

    fn forward(&self, vec_: &Tensor) -> Result<(ModulationOut, ModulationOut)> {
        let _span = self.span.enter();
        let mut outs = modulation_chunks(&self.lin, vec_, 2)?.into_iter();
        match (outs.next(), outs.next()) {
            (Some(mod1), Some(mod2)) => Ok((mod1, mod2)),
            _ => candle_core::bail!("expected two modulations"),
        }
    }
}

/// Splits `(b, l, heads * head_dim)` into `(b, heads, l, head_dim)`.
fn split_heads(xs: &Tensor, num_heads: usize) -> Result<Tensor> {
    let (b, l, _) = xs.dims3()?;
    xs.reshape((b, l, num_heads, ()))?.transpose(1, 2)
}

#[derive(Debug, Clone)]
struct SelfAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    norm: QkNorm,
    proj: Linear,
    num_attention_heads: usize,
    span: Span,
}

impl SelfAttention {
    /// The image stream uses the `to_*` projections, the text (context) stream `add_*_proj`.
    fn new(cfg: &FluxConfig, vb: VarBuilder, context: bool) -> Result<Self> {
        let dim = cfg.hidden_size();
        let head_dim = cfg.attention_head_dim;
        let (q, k, v, norm_q, norm_k, proj) = if context {
            (
                "add_q_proj",
                "add_k_proj",
                "add_v_proj",
                "norm_added_q",
                "norm_added_k",
                "to_add_out",
            )
        } else {
            ("to_q", "to_k", "to_v", "norm_q", "norm_k", "to_out.0")
        };
        Ok(Self {
            q: linear_b(dim, dim, true, vb.pp(q))?,
            k: linear_b(dim, dim, true, vb.pp(k))?,
            v: linear_b(dim, dim, true, vb.pp(v))?,
            norm: QkNorm::new(head_dim, vb.pp(norm_q), vb.pp(norm_k))?,
            proj: linear(dim, dim, vb.pp(proj))?,
            num_attention_heads: cfg.num_attention_heads,
            span: span!(tracing::Level::TRACE, "flux-selfattn-qkv"),
        })
    }

    fn qkv(&self, xs: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let _span = self.span.enter();
        let q = split_heads(&xs.apply(&self.q)?, self.num_attention_heads)?;
        let k = split_heads(&xs.apply(&self.k)?, self.num_attention_heads)?;
        let v = split_heads(&xs.apply(&self.v)?, self.num_attention_heads)?;
        let q = q.apply(&self.norm.query_norm)?;
        let k = k.apply(&self.norm.key_norm)?;
        Ok((q, k, v))
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    lin1: Linear,
    lin2: Linear,
    span: Span,
}

impl Mlp {
    fn new(in_sz: usize, mlp_sz: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            lin1: linear(in_sz, mlp_sz, vb.pp("0.proj"))?,
            lin2: linear(mlp_sz, in_sz, vb.pp("2"))?,
            span: span!(tracing::Level::TRACE, "flux-mlp"),
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _span = self.span.enter();
        xs.apply(&self.lin1)?.gelu()?.apply(&self.lin2)
    }
}

#[derive(Debug, Clone)]
struct DoubleStreamBlock {
    img_mod: Modulation2,
    img_norm1: LayerNorm,
    img_attn: SelfAttention,
    img_norm2: LayerNorm,
    img_mlp: Mlp,
    txt_mod: Modulation2,
    txt_norm1: LayerNorm,
    txt_attn: SelfAttention,
    txt_norm2: LayerNorm,
    txt_mlp: Mlp,
}

impl DoubleStreamBlock {
    fn new(cfg: &FluxConfig, vb: VarBuilder) -> Result<Self> {
        let h_sz = cfg.hidden_size();
        let mlp_sz = (h_sz as f64 * MLP_RATIO) as usize;
        Ok(Self {
            img_mod: Modulation2::new(h_sz, vb.pp("norm1"))?,
            img_norm1: layer_norm_no_affine(h_sz, 1e-6, &vb)?,
            img_attn: SelfAttention::new(cfg, vb.pp("attn"), false)?,
            img_norm2: layer_norm_no_affine(h_sz, 1e-6, &vb)?,
            img_mlp: Mlp::new(h_sz, mlp_sz, vb.pp("ff.net"))?,
            txt_mod: Modulation2::new(h_sz, vb.pp("norm1_context"))?,
            txt_norm1: layer_norm_no_affine(h_sz, 1e-6, &vb)?,
            txt_attn: SelfAttention::new(cfg, vb.pp("attn"), true)?,
            txt_norm2: layer_norm_no_affine(h_sz, 1e-6, &vb)?,
            txt_mlp: Mlp::new(h_sz, mlp_sz, vb.pp("ff_context.net"))?,
        })
    }

    fn forward(
        &self,
        img: &Tensor,
        txt: &Tensor,
        vec_: &Tensor,
        pe: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let (img_mod1, img_mod2) = self.img_mod.forward(vec_)?;
        let (txt_mod1, txt_mod2) = self.txt_mod.forward(vec_)?;
        let img_modulated = img_mod1.scale_shift(&img.apply(&self.img_norm1)?)?;
        let (img_q, img_k, img_v) = self.img_attn.qkv(&img_modulated)?;

        let txt_modulated = txt_mod1.scale_shift(&txt.apply(&self.txt_norm1)?)?;
        let (txt_q, txt_k, txt_v) = self.txt_attn.qkv(&txt_modulated)?;

        let q = Tensor::cat(&[txt_q, img_q], 2)?;
        let k = Tensor::cat(&[txt_k, img_k], 2)?;
        let v = Tensor::cat(&[txt_v, img_v], 2)?;

        let attn = attention(&q, &k, &v, pe)?;
        let txt_len = txt.dim(1)?;
        let txt_attn = attn.narrow(1, 0, txt_len)?;
        let img_attn = attn.narrow(1, txt_len, attn.dim(1)? - txt_len)?;

        let img = (img + img_mod1.gate(&img_attn.apply(&self.img_attn.proj)?))?;
        let img = (&img
            + img_mod2.gate(
                &img_mod2
                    .scale_shift(&img.apply(&self.img_norm2)?)?
                    .apply(&self.img_mlp)?,
            )?)?;

        let txt = (txt + txt_mod1.gate(&txt_attn.apply(&self.txt_attn.proj)?))?;
        let txt = (&txt
            + txt_mod2.gate(
                &txt_mod2
                    .scale_shift(&txt.apply(&self.txt_norm2)?)?
                    .apply(&self.txt_mlp)?,
            )?)?;

        Ok((img, txt))
    }
}

#[derive(Debug, Clone)]
struct SingleStreamBlock {
    q: Linear,
    k: Linear,
    v: Linear,
    proj_mlp: Linear,
    linear2: Linear,
    norm: QkNorm,
    pre_norm: LayerNorm,
    modulation: Modulation1,
    num_attention_heads: usize,
}

impl SingleStreamBlock {
    fn new(cfg: &FluxConfig, vb: VarBuilder) -> Result<Self> {
        let h_sz = cfg.hidden_size();
        let mlp_sz = (h_sz as f64 * MLP_RATIO) as usize;
        Ok(Self {
            q: linear_b(h_sz, h_sz, true, vb.pp("attn.to_q"))?,
            k: linear_b(h_sz, h_sz, true, vb.pp("attn.to_k"))?,
            v: linear_b(h_sz, h_sz, true, vb.pp("attn.to_v"))?,
            proj_mlp: linear_b(h_sz, mlp_sz, true, vb.pp("proj_mlp"))?,
            linear2: linear(h_sz + mlp_sz, h_sz, vb.pp("proj_out"))?,
            norm: QkNorm::new(
                cfg.attention_head_dim,
                vb.pp("attn.norm_q"),
                vb.pp("attn.norm_k"),
            )?,
            pre_norm: layer_norm_no_affine(h_sz, 1e-6, &vb)?,
            modulation: Modulation1::new(h_sz, vb.pp("norm"))?,
            num_attention_heads: cfg.num_attention_heads,
        })
    }

    fn forward(&self, xs: &Tensor, vec_: &Tensor, pe: &Tensor) -> Result<Tensor> {
        let mod_ = self.modulation.forward(vec_)?;
        let x_mod = mod_.scale_shift(&xs.apply(&self.pre_norm)?)?;
        let q = split_heads(&x_mod.apply(&self.q)?, self.num_attention_heads)?
            .apply(&self.norm.query_norm)?;
        let k = split_heads(&x_mod.apply(&self.k)?, self.num_attention_heads)?
            .apply(&self.norm.key_norm)?;
        let v = split_heads(&x_mod.apply(&self.v)?, self.num_attention_heads)?;
        let mlp = x_mod.apply(&self.proj_mlp)?;
        let attn = attention(&q, &k, &v, pe)?;
        let output = Tensor::cat(&[attn, mlp.gelu()?], 2)?.apply(&self.linear2)?;
        xs + mod_.gate(&output)
    }
}

#[derive(Debug, Clone)]
struct LastLayer {
    norm_final: LayerNorm,
    linear: Linear,
    ada_ln_modulation: Linear,
}

impl LastLayer {
    fn new(h_sz: usize, out_c: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm_final: layer_norm_no_affine(h_sz, 1e-6, &vb)?,
            linear: linear(h_sz, out_c, vb.pp("proj_out"))?,
            ada_ln_modulation: linear(h_sz, 2 * h_sz, vb.pp("norm_out.linear"))?,
        })
    }

    fn forward(&self, xs: &Tensor, vec: &Tensor) -> Result<Tensor> {
        let chunks = vec.silu()?.apply(&self.ada_ln_modulation)?.chunk(2, 1)?;
        let (scale, shift) = (&chunks[0], &chunks[1]);
        xs.apply(&self.norm_final)?
            .broadcast_mul(&(scale.unsqueeze(1)? + 1.0)?)?
            .broadcast_add(&shift.unsqueeze(1)?)?
            .apply(&self.linear)
    }
}

/// The FLUX.1 rectified-flow transformer, with diffusers tensor naming.
#[derive(Debug, Clone)]
pub struct FluxModel {
    img_in: Linear,
    txt_in: Linear,
    time_in: MlpEmbedder,
    vector_in: MlpEmbedder,
    guidance_in: Option<MlpEmbedder>,
    pe_embedder: EmbedNd,
    double_blocks: Vec<DoubleStreamBlock>,
    single_blocks: Vec<SingleStreamBlock>,
    final_layer: LastLayer,
}

impl FluxModel {
    pub fn new(cfg: &FluxConfig, vb: VarBuilder, silent: bool) -> Result<Self> {
        let h_sz = cfg.hidden_size();
        if cfg.axes_dims_rope.iter().sum::<usize>() != cfg.attention_head_dim {
            candle_core::bail!(
                "rope axes {:?} do not add up to the head dim {}",
                cfg.axes_dims_rope,
                cfg.attention_head_dim
            )
        }
        let img_in = linear(cfg.in_channels, h_sz, vb.pp("x_embedder"))?;
        let txt_in = linear(cfg.joint_attention_dim, h_sz, vb.pp("context_embedder"))?;

        let vb_d = vb.pp("transformer_blocks");
        let double_blocks = (0..cfg.num_layers)
            .with_progress(silent)
            .map(|idx| DoubleStreamBlock::new(cfg, vb_d.pp(idx)))
            .collect::<Result<Vec<_>>>()?;
        let vb_s = vb.pp("single_transformer_blocks");
        let single_blocks = (0..cfg.num_single_layers)
            .with_progress(silent)
            .map(|idx| SingleStreamBlock::new(cfg, vb_s.pp(idx)))
            .collect::<Result<Vec<_>>>()?;

        let time_in = MlpEmbedder::new(
            TIMESTEP_DIM,
            h_sz,
            vb.pp("time_text_embed.timestep_embedder"),
        )?;
        let vector_in = MlpEmbedder::new(
            cfg.pooled_projection_dim,
            h_sz,
            vb.pp("time_text_embed.text_embedder"),
        )?;
        let guidance_in = if cfg.guidance_embeds {
            Some(MlpEmbedder::new(
                TIMESTEP_DIM,
                h_sz,
                vb.pp("time_text_embed.guidance_embedder"),
            )?)
        } else {
            None
        };
        let final_layer = LastLayer::new(h_sz, cfg.in_channels, vb)?;
        let pe_embedder = EmbedNd {
            theta: THETA,
            axes_dim: cfg.axes_dims_rope.clone(),
        };

        Ok(Self {
            img_in,
            txt_in,
            time_in,
            vector_in,
            guidance_in,
            pe_embedder,
            double_blocks,
            single_blocks,
            final_layer,
        })
    }

    /// Run the transformer over packed image tokens `img` of shape `(b, seq, in_channels)`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        img: &Tensor,
        img_ids: &Tensor,
        txt: &Tensor,
        txt_ids: &Tensor,
        timesteps: &Tensor,
        y: &Tensor,
        guidance: Option<&Tensor>,
    ) -> Result<Tensor> {
        if txt.rank() != 3 {
            candle_core::bail!("unexpected shape for txt {:?}", txt.shape())
        }
        if img.rank() != 3 {
            candle_core::bail!("unexpected shape for img {:?}", img.shape())
        }
        let dtype = img.dtype();
        let pe = Tensor::cat(&[txt_ids, img_ids], 1)?.apply(&self.pe_embedder)?;
        let mut txt = txt.apply(&self.txt_in)?;
        let mut img = img.apply(&self.img_in)?;
        let vec_ = timestep_embedding(timesteps, TIMESTEP_DIM, dtype)?.apply(&self.time_in)?;
        let vec_ = match (self.guidance_in.as_ref(), guidance) {
            (Some(g_in), Some(guidance)) => {
                (vec_ + timestep_embedding(guidance, TIMESTEP_DIM, dtype)?.apply(g_in))?
            }
            _ => vec_,
        };
        let vec_ = (vec_ + y.apply(&self.vector_in))?;

        for block in self.double_blocks.iter() {
            (img, txt) = block.forward(&img, &txt, &vec_, &pe)?;
        }
        let mut img = Tensor::cat(&[&txt, &img], 1)?;
        for block in self.single_blocks.iter() {
            img = block.forward(&img, &vec_, &pe)?;
        }
        let img = img.i((.., txt.dim(1)?..))?;
        self.final_layer.forward(&img, &vec_)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::{rope, timestep_embedding};

    #[test]
    fn timestep_embedding_is_cos_then_sin() -> candle_core::Result<()> {
        let t = Tensor::new(&[0f32], &Device::Cpu)?;
        let emb = timestep_embedding(&t, 4, DType::F32)?.to_vec2::<f32>()?;
        assert_eq!(emb, vec![vec![1.0, 1.0, 0.0, 0.0]]);
        Ok(())
    }

    #[test]
    fn rope_at_origin_is_identity_rotation() -> candle_core::Result<()> {
        let pos = Tensor::zeros((1, 3), DType::F32, &Device::Cpu)?;
        let r = rope(&pos, 4, 10000)?;
        assert_eq!(r.dims(), &[1, 3, 2, 2, 2]);
        let flat = r.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(&flat[..4], &[1.0, 0.0, 0.0, 1.0]);
        Ok(())
    }
}
