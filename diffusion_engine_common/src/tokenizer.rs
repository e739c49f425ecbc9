use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokenizers::Tokenizer;
use tracing::warn;

use crate::{Error, Result};

/// What to do with prompts that tokenize to more than a tokenizer's maximum length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlengthPolicy {
    /// Keep the first tokens and log a warning.
    #[default]
    Truncate,
    /// Reject the request with [`Error::Validation`].
    Error,
}

/// Build a CLIP-style BPE tokenizer from `vocab.json` and `merges.txt` contents.
pub fn load_bpe_tokenizer(vocab_json: &str, merges_txt: &str) -> Result<Tokenizer> {
    let vocab: Map<String, Value> = serde_json::from_str(vocab_json)?;
    let merges = merges_txt
        .lines()
        .filter(|line| !line.starts_with("#version"))
        .filter(|line| line.split(' ').count() == 2)
        .map(|line| Value::String(line.to_string()))
        .collect::<Vec<_>>();

    let spec = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": { "type": "Lowercase" },
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "BPE",
            "dropout": null,
            "unk_token": null,
            "continuing_subword_prefix": null,
            "end_of_word_suffix": "</w>",
            "fuse_unk": false,
            "byte_fallback": false,
            "vocab": vocab,
            "merges": merges,
        }
    });
    Tokenizer::from_bytes(spec.to_string()).map_err(|e| Error::Tokenizer(e.to_string()))
}

pub fn load_tokenizer_json(contents: &str) -> Result<Tokenizer> {
    Tokenizer::from_bytes(contents).map_err(|e| Error::Tokenizer(e.to_string()))
}

/// A tokenizer bound to its text encoder's input contract: maximum length, padding id,
/// and optional begin/end markers added around every prompt.
#[derive(Clone)]
pub struct PromptTokenizer {
    name: String,
    tokenizer: Tokenizer,
    max_len: usize,
    pad_id: u32,
    pad_to_max: bool,
    bos: Option<u32>,
    eos: Option<u32>,
    end_marker: Option<u32>,
}

impl std::fmt::Debug for PromptTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptTokenizer")
            .field("name", &self.name)
            .field("max_len", &self.max_len)
            .field("pad_id", &self.pad_id)
            .field("pad_to_max", &self.pad_to_max)
            .finish()
    }
}

impl PromptTokenizer {
    pub fn new(name: impl ToString, tokenizer: Tokenizer, max_len: usize) -> Self {
        Self {
            name: name.to_string(),
            tokenizer,
            max_len,
            pad_id: 0,
            pad_to_max: false,
            bos: None,
            eos: None,
            end_marker: None,
        }
    }

    pub fn with_pad_id(mut self, pad_id: u32) -> Self {
        self.pad_id = pad_id;
        self
    }

    /// Pad every batch to `max_len` instead of the longest prompt.
    pub fn with_fixed_length(mut self, pad_to_max: bool) -> Self {
        self.pad_to_max = pad_to_max;
        self
    }

    pub fn with_special_tokens(mut self, bos: Option<u32>, eos: Option<u32>) -> Self {
        self.bos = bos;
        self.eos = eos;
        self
    }

    /// For tokenizers whose post-processor already appends `eos`: keep it as the last token of
    /// truncated prompts.
    pub fn with_end_marker(mut self, eos: Option<u32>) -> Self {
        self.end_marker = eos;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    fn encode_one(&self, prompt: &str, policy: OverlengthPolicy) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        let mut ids = Vec::with_capacity(encoding.len() + 2);
        ids.extend(self.bos);
        ids.extend_from_slice(encoding.get_ids());
        ids.extend(self.eos);
        let end = self
            .eos
            .or(self.end_marker.filter(|marker| ids.last() == Some(marker)));

        if ids.len() > self.max_len {
            match policy {
                OverlengthPolicy::Error => {
                    return Err(Error::validation(format!(
                        "prompt has {} {} tokens, the maximum is {}",
                        ids.len(),
                        self.name,
                        self.max_len
                    )))
                }
                OverlengthPolicy::Truncate => {
                    warn!(
                        "prompt has {} {} tokens, truncating to {}",
                        ids.len(),
                        self.name,
                        self.max_len
                    );
                    ids.truncate(self.max_len);
                    if let (Some(eos), Some(last)) = (end, ids.last_mut()) {
                        *last = eos;
                    }
                }
            }
        }
        Ok(ids)
    }

    /// Tokenize `prompts` and pad them to a common length.
    pub fn encode_batch(
        &self,
        prompts: &[String],
        policy: OverlengthPolicy,
    ) -> Result<Vec<Vec<u32>>> {
        let mut batch = prompts
            .iter()
            .map(|prompt| self.encode_one(prompt, policy))
            .collect::<Result<Vec<_>>>()?;
        let target = if self.pad_to_max {
            self.max_len
        } else {
            batch.iter().map(Vec::len).max().unwrap_or(0).max(1)
        };
        for ids in &mut batch {
            ids.resize(target, self.pad_id);
        }
        Ok(batch)
    }
}
