//! Model sources, packaged weight containers and loading utilities shared by the
//! `diffusion_engine` crates.

#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

mod container;
mod error;
mod hub;
mod model_source;
mod progress;
mod safetensors;
mod tokenizer;
mod tokens;
mod varbuilder;

pub mod nn;

pub use container::Container;
pub use error::{Error, Result};
pub use hub::{validate_model_id, HfHubResolver, HubResolver, RepoLayout};
pub use model_source::{FileData, ModelSource, ResolvedSource};
pub use progress::{IterWithProgress, NiceProgressBar};
pub use self::safetensors::{
    candle_dtype, Bnb4BitKind, QuantScheme, TensorEntry, TensorIndex, TensorView, WeightFile,
};
pub use tokenizer::{load_bpe_tokenizer, load_tokenizer_json, OverlengthPolicy, PromptTokenizer};
pub(crate) use tokens::get_token;
pub use tokens::TokenSource;
pub use varbuilder::{Backend, SimpleBackend, VarBuilder, VarBuilderArgs};
