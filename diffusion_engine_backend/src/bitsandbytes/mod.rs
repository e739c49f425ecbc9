use diffusion_engine_common::{Bnb4BitKind, Error, Result, TensorView};
use serde::Deserialize;

use crate::read_f32;

mod op;

pub(crate) use op::dequantize_int8_rows;

const SUPPORTED_BLOCKSIZE: [usize; 7] = [2048, 4096, 1024, 512, 256, 128, 64];

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum BnbDType {
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "bfloat16")]
    BF16,
    #[serde(rename = "float16")]
    F16,
}

/// JSON stored in the `<weight>.quant_state.bitsandbytes__<kind>` tensor.
#[derive(Debug, Deserialize)]
pub struct BnbQuantState {
    pub blocksize: usize,
    pub shape: Vec<usize>,
    pub dtype: BnbDType,
    pub nested_blocksize: Option<usize>,
    pub nested_offset: Option<f64>,
}

impl BnbQuantState {
    fn from_view(view: &TensorView<'_>) -> Result<Self> {
        let state = std::str::from_utf8(view.data())
            .map_err(|e| Error::corrupt(format!("`{}` is not utf-8: {e}", view.name())))?;
        serde_json::from_str(state)
            .map_err(|e| Error::corrupt(format!("`{}`: {e}", view.name())))
    }
}

fn check_blocksize(blocksize: usize, name: &str) -> Result<()> {
    if SUPPORTED_BLOCKSIZE.contains(&blocksize) {
        Ok(())
    } else {
        Err(Error::UnsupportedQuantization(format!(
            "blocksize {blocksize} of `{name}`, supported are {SUPPORTED_BLOCKSIZE:?}"
        )))
    }
}

fn companion<'a>(view: &TensorView<'a>, suffix: &str) -> Result<TensorView<'a>> {
    view.companion(suffix)
        .ok_or_else(|| Error::corrupt(format!("`{}` has no `{suffix}`", view.name())))
}

/// Recover the per-block scales, expanding nested (8-bit) absmax when present.
fn absmax(view: &TensorView<'_>, state: &BnbQuantState, blocks: usize) -> Result<Vec<f32>> {
    let absmax = companion(view, "absmax")?;
    let values = match view.companion("nested_absmax") {
        Some(nested_absmax) => {
            let nested_blocksize = state.nested_blocksize.ok_or_else(|| {
                Error::corrupt(format!("`{}` has nested absmax but no nested_blocksize", view.name()))
            })?;
            check_blocksize(nested_blocksize, view.name())?;
            let code = read_f32(&companion(view, "nested_quant_map")?)?;
            let scales = read_f32(&nested_absmax)?;
            let codes = absmax.data();
            if code.len() < 256 || scales.len() < codes.len().div_ceil(nested_blocksize) {
                return Err(Error::corrupt(format!(
                    "nested quantization tensors of `{}` are too small",
                    view.name()
                )));
            }
            let offset = state.nested_offset.unwrap_or(0.0) as f32;
            op::dequantize_8bit(codes, &code, &scales, nested_blocksize, offset)
        }
        None => read_f32(&absmax)?,
    };
    if values.len() < blocks {
        return Err(Error::corrupt(format!(
            "`{}` needs {blocks} absmax values, found {}",
            view.name(),
            values.len()
        )));
    }
    Ok(values)
}

/// Dequantize an NF4/FP4 weight, returning its values and logical shape.
pub(crate) fn dequantize_4bit(
    view: &TensorView<'_>,
    kind: Bnb4BitKind,
) -> Result<(Vec<f32>, Vec<usize>)> {
    let state_suffix = match kind {
        Bnb4BitKind::Nf4 => "quant_state.bitsandbytes__nf4",
        Bnb4BitKind::Fp4 => "quant_state.bitsandbytes__fp4",
    };
    let state = BnbQuantState::from_view(&companion(view, state_suffix)?)?;
    check_blocksize(state.blocksize, view.name())?;

    let numel = state.shape.iter().product::<usize>();
    let packed = view.data();
    if packed.len() < numel.div_ceil(2) {
        return Err(Error::corrupt(format!(
            "`{}` holds {} packed bytes for {numel} values",
            view.name(),
            packed.len()
        )));
    }

    let code = match view.companion("quant_map") {
        Some(map) => read_f32(&map)?,
        None => match kind {
            Bnb4BitKind::Nf4 => op::NF4_CODE.to_vec(),
            Bnb4BitKind::Fp4 => op::FP4_CODE.to_vec(),
        },
    };
    if code.len() < 16 {
        return Err(Error::corrupt(format!(
            "`{}` has a quant_map of {} entries",
            view.name(),
            code.len()
        )));
    }

    let absmax = absmax(view, &state, numel.div_ceil(state.blocksize))?;
    let values = op::dequantize_4bit(packed, &code, &absmax, state.blocksize, numel);
    Ok((values, state.shape))
}
