use candle_core::{DType, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, LayerNorm, Linear, RmsNorm};

use crate::VarBuilder;

pub fn linear_no_bias(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let ws = vb.get((out_dim, in_dim), "weight")?;
    Ok(Linear::new(ws, None))
}

pub fn linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let ws = vb.get((out_dim, in_dim), "weight")?;
    let bs = vb.get(out_dim, "bias")?;
    Ok(Linear::new(ws, Some(bs)))
}

pub fn linear_b(in_dim: usize, out_dim: usize, bias: bool, vb: VarBuilder) -> Result<Linear> {
    if bias {
        linear(in_dim, out_dim, vb)
    } else {
        linear_no_bias(in_dim, out_dim, vb)
    }
}

pub fn conv2d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    cfg: Conv2dConfig,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let ws = vb.get(
        (
            out_channels,
            in_channels / cfg.groups,
            kernel_size,
            kernel_size,
        ),
        "weight",
    )?;
    let bs = vb.get(out_channels, "bias")?;
    Ok(Conv2d::new(ws, Some(bs), cfg))
}

pub fn group_norm(
    num_groups: usize,
    num_channels: usize,
    eps: f64,
    vb: VarBuilder,
) -> Result<GroupNorm> {
    let weight = vb.get(num_channels, "weight")?;
    let bias = vb.get(num_channels, "bias")?;
    GroupNorm::new(weight, bias, num_channels, num_groups, eps)
}

pub fn rms_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<RmsNorm> {
    let weight = vb.get(size, "weight")?;
    Ok(RmsNorm::new(weight, eps))
}

/// A layer norm without learned parameters.
pub fn layer_norm_no_affine(size: usize, eps: f64, vb: &VarBuilder) -> Result<LayerNorm> {
    let weight = Tensor::ones(size, vb.dtype(), vb.device())?;
    let bias = Tensor::zeros(size, vb.dtype(), vb.device())?;
    Ok(LayerNorm::new(weight, bias, eps))
}

/// Attention over `(batch, heads, seq, head_dim)` inputs, computed in f32.
pub fn scaled_dot_product_attention(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
    let dtype = q.dtype();
    let head_dim = q.dim(candle_core::D::Minus1)?;
    let scale = 1.0 / (head_dim as f64).sqrt();
    let q = q.to_dtype(DType::F32)?.contiguous()?;
    let k = k.to_dtype(DType::F32)?.contiguous()?;
    let v = v.to_dtype(DType::F32)?.contiguous()?;
    let att = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
    let att = candle_nn::ops::softmax_last_dim(&att)?;
    att.matmul(&v)?.to_dtype(dtype)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device, IndexOp, Module, Tensor};

    use super::{rms_norm, scaled_dot_product_attention};
    use crate::{Error, VarBuilder};

    #[test]
    fn attention_over_identical_keys_averages_values() -> candle_core::Result<()> {
        let dev = Device::Cpu;
        let q = Tensor::ones((1, 1, 2, 4), DType::F32, &dev)?;
        let k = Tensor::ones((1, 1, 3, 4), DType::F32, &dev)?;
        let v = Tensor::arange(0f32, 3., &dev)?.reshape((1, 1, 3, 1))?;
        let out = scaled_dot_product_attention(&q, &k, &v)?;
        assert_eq!(out.dims(), &[1, 1, 2, 1]);
        let first = out.i((0, 0, 0, 0))?.to_scalar::<f32>()?;
        assert!((first - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn rms_norm_loads_its_scale() -> candle_core::Result<()> {
        let dev = Device::Cpu;
        let ts = HashMap::from([(
            "attn.norm_q.weight".to_string(),
            Tensor::new(&[1f32, 2.], &dev)?,
        )]);
        let vb = VarBuilder::from_tensors(ts, DType::F32, &dev);
        let norm = rms_norm(2, 1e-6, vb.pp("attn").pp("norm_q"))?;
        let out = norm
            .forward(&Tensor::new(&[[3f32, 4.]], &dev)?)?
            .to_vec2::<f32>()?;
        let rms = (12.5f32 + 1e-6).sqrt();
        assert!((out[0][0] - 3.0 / rms).abs() < 1e-5);
        assert!((out[0][1] - 8.0 / rms).abs() < 1e-5);

        let err = rms_norm(2, 1e-6, vb.pp("attn").pp("norm_k")).unwrap_err();
        assert!(matches!(
            Error::from(err),
            Error::MissingWeight(name) if name == "attn.norm_k.weight"
        ));
        Ok(())
    }
}
