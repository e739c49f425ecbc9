//! Dequantization of checkpoint tensors into the numeric backend's native layout.
//!
//! Quantized checkpoints are expanded per tensor at load time, so every model sees plain
//! floating point weights regardless of how they were stored.

use byteorder::{ByteOrder, LittleEndian};
use candle_core::{DType, Device, Tensor};
use diffusion_engine_common::{Error, QuantScheme, Result, TensorView};
use safetensors::Dtype;
use serde::Deserialize;

mod bitsandbytes;
mod loading;

pub use bitsandbytes::{BnbDType, BnbQuantState};
pub use loading::{from_weight_files, DequantizingBackend};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub enum QuantMethodType {
    #[serde(rename = "bitsandbytes")]
    Bitsandbytes,
}

/// The `quantization_config` section of a component `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct QuantizationConfig {
    pub quant_method: String,
    #[serde(default)]
    pub load_in_4bit: bool,
    #[serde(default)]
    pub load_in_8bit: bool,
    pub bnb_4bit_quant_type: Option<String>,
}

#[derive(Deserialize)]
struct ConfigShim {
    quantization_config: Option<QuantizationConfig>,
}

impl QuantizationConfig {
    /// Read and validate the quantization section of a component config, if present.
    pub fn from_component_config(config_json: &str) -> Result<Option<Self>> {
        let ConfigShim {
            quantization_config,
        } = serde_json::from_str(config_json)?;
        let Some(config) = quantization_config else {
            return Ok(None);
        };
        config.method()?;
        if let Some(ty) = &config.bnb_4bit_quant_type {
            if !matches!(ty.as_str(), "nf4" | "fp4") {
                return Err(Error::UnsupportedQuantization(format!(
                    "bitsandbytes 4-bit type `{ty}`"
                )));
            }
        }
        Ok(Some(config))
    }

    pub fn method(&self) -> Result<QuantMethodType> {
        serde_json::from_value(serde_json::Value::String(self.quant_method.clone())).map_err(
            |_| Error::UnsupportedQuantization(format!("quant_method `{}`", self.quant_method)),
        )
    }
}

/// Decode a float tensor of any float dtype to `f32` values.
pub(crate) fn read_f32(view: &TensorView<'_>) -> Result<Vec<f32>> {
    let data = view.data();
    match view.dtype() {
        Dtype::F32 => {
            let mut out = vec![0f32; data.len() / 4];
            LittleEndian::read_f32_into(&data[..out.len() * 4], &mut out);
            Ok(out)
        }
        Dtype::F16 => Ok(data
            .chunks_exact(2)
            .map(|b| half::f16::from_bits(LittleEndian::read_u16(b)).to_f32())
            .collect()),
        Dtype::BF16 => Ok(data
            .chunks_exact(2)
            .map(|b| half::bf16::from_bits(LittleEndian::read_u16(b)).to_f32())
            .collect()),
        other => Err(Error::corrupt(format!(
            "`{}` must be a float tensor, found {other:?}",
            view.name()
        ))),
    }
}

/// Materialize `view` on `device` as `dtype`, dequantizing according to its scheme.
pub fn dequantize(view: &TensorView<'_>, dtype: DType, device: &Device) -> Result<Tensor> {
    let tensor = match view.scheme() {
        QuantScheme::None => view.to_tensor(&Device::Cpu)?,
        QuantScheme::Bnb4Bit(kind) => {
            let (values, shape) = bitsandbytes::dequantize_4bit(view, kind)?;
            Tensor::from_vec(values, shape, &Device::Cpu)?
        }
        QuantScheme::Int8RowWise => {
            let shape = view.shape();
            let (rows, cols) = match shape {
                [rows, rest @ ..] => (*rows, rest.iter().product::<usize>()),
                [] => (1, 1),
            };
            let scb = view
                .sibling(&format!(
                    "{}.SCB",
                    view.name().strip_suffix(".weight").unwrap_or(view.name())
                ))
                .ok_or_else(|| Error::corrupt(format!("`{}` has no SCB", view.name())))?;
            let scb = read_f32(&scb)?;
            if scb.len() < rows || view.data().len() < rows * cols {
                return Err(Error::corrupt(format!(
                    "`{}` has {} row scales for {rows} rows",
                    view.name(),
                    scb.len()
                )));
            }
            let weight = view.data().iter().map(|b| *b as i8).collect::<Vec<_>>();
            let values = bitsandbytes::dequantize_int8_rows(&weight, &scb, cols);
            Tensor::from_vec(values, shape, &Device::Cpu)?
        }
    };
    Ok(tensor.to_dtype(dtype)?.to_device(device)?)
}

#[cfg(test)]
mod tests {
    use super::QuantizationConfig;
    use diffusion_engine_common::Error;

    #[test]
    fn accepts_bitsandbytes_configs() {
        let cfg = QuantizationConfig::from_component_config(
            r#"{"in_channels": 64, "quantization_config": {"quant_method": "bitsandbytes", "load_in_4bit": true, "bnb_4bit_quant_type": "nf4"}}"#,
        )
        .unwrap()
        .unwrap();
        assert!(cfg.load_in_4bit);
        assert!(QuantizationConfig::from_component_config(r#"{"in_channels": 64}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn rejects_other_methods() {
        let err = QuantizationConfig::from_component_config(
            r#"{"quantization_config": {"quant_method": "gptq"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedQuantization(_)));
    }
}
