use std::sync::{Mutex, PoisonError};

use candle_core::{Module, Result, Tensor};
use candle_transformers::models::{
    clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer},
    t5::T5EncoderModel,
};
use serde::Deserialize;

use super::{Conditioning, Residency, TextEncoder};

fn default_hidden_act() -> String {
    "quick_gelu".to_string()
}

/// The `config.json` of a transformers `CLIPTextModel`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClipConfigShim {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub projection_dim: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
}

impl TryFrom<ClipConfigShim> for ClipTextConfig {
    type Error = candle_core::Error;

    fn try_from(cfg: ClipConfigShim) -> Result<Self> {
        let activation = match cfg.hidden_act.as_str() {
            "quick_gelu" => Activation::QuickGelu,
            other => candle_core::bail!("unsupported CLIP activation `{other}`"),
        };
        Ok(Self {
            vocab_size: cfg.vocab_size,
            embed_dim: cfg.hidden_size,
            activation,
            intermediate_size: cfg.intermediate_size,
            max_position_embeddings: cfg.max_position_embeddings,
            pad_with: None,
            num_hidden_layers: cfg.num_hidden_layers,
            num_attention_heads: cfg.num_attention_heads,
            projection_dim: cfg.projection_dim,
        })
    }
}

/// CLIP supplies the pooled embedding, T5 the per-token context.
pub struct FluxTextEncoder {
    clip: ClipTextTransformer,
    // T5's forward takes `&mut self`.
    t5: Residency<Mutex<T5EncoderModel>>,
}

impl FluxTextEncoder {
    pub fn new(clip: ClipTextTransformer, t5: Residency<Mutex<T5EncoderModel>>) -> Self {
        Self { clip, t5 }
    }
}

impl TextEncoder for FluxTextEncoder {
    fn encode(&self, input_ids: &[Tensor]) -> Result<Conditioning> {
        let [clip_ids, t5_ids] = input_ids else {
            candle_core::bail!(
                "expected CLIP and T5 token ids, got {} tensors",
                input_ids.len()
            )
        };
        let t5 = self.t5.acquire()?;
        let context = t5
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .forward(t5_ids);
        drop(t5);
        self.t5.release();
        let context = context?;
        let pooled = self.clip.forward(clip_ids)?;
        Ok(Conditioning {
            context,
            pooled: Some(pooled),
        })
    }
}
