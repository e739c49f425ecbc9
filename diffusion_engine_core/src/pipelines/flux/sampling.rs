#![allow(clippy::cast_possible_truncation)]

use candle_core::{DType, Device, Result, Tensor};

/// Fold 2x2 latent patches into tokens: `(b, c, h, w)` to `(b, h/2 * w/2, c * 4)`.
pub fn pack(latent: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = latent.dims4()?;
    latent
        .reshape((b, c, h / 2, 2, w / 2, 2))? // (b, c, h, ph, w, pw)
        .permute((0, 2, 4, 1, 3, 5))? // (b, h, w, c, ph, pw)
        .reshape((b, h / 2 * w / 2, c * 4))
}

/// Inverse of [`pack`] for a latent of spatial size `h x w`.
pub fn unpack(xs: &Tensor, h: usize, w: usize) -> Result<Tensor> {
    let (b, _h_w, c_ph_pw) = xs.dims3()?;
    xs.reshape((b, h / 2, w / 2, c_ph_pw / 4, 2, 2))? // (b, h, w, c, ph, pw)
        .permute((0, 3, 1, 4, 2, 5))? // (b, c, h, ph, w, pw)
        .reshape((b, c_ph_pw / 4, h, w))
}

/// Rope position ids `(0, row, col)` of the packed tokens of an `h x w` latent.
pub fn img_ids(b: usize, h: usize, w: usize, dtype: DType, dev: &Device) -> Result<Tensor> {
    let (h, w) = (h / 2, w / 2);
    Tensor::stack(
        &[
            Tensor::full(0u32, (h, w), dev)?,
            Tensor::arange(0u32, h as u32, dev)?
                .reshape(((), 1))?
                .broadcast_as((h, w))?,
            Tensor::arange(0u32, w as u32, dev)?
                .reshape((1, ()))?
                .broadcast_as((h, w))?,
        ],
        2,
    )?
    .to_dtype(dtype)?
    .reshape((1, h * w, 3))?
    .repeat((b, 1, 1))
}
