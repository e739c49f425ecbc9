//! Core crate for interacting with diffusion_engine.
//!
//! The API is intentionally straightforward but strives to provide strong flexibility.
//!
//! ```rust,no_run
//! use std::time::Instant;
//!
//! use diffusion_engine_core::{DiffusionGenerationParams, ModelSource, ModelDType, Pipeline, TokenSource};
//!
//! let pipeline = Pipeline::load(
//!     ModelSource::dduf("FLUX.1-dev-Q4-bnb.dduf"),
//!     true,
//!     TokenSource::CacheToken,
//!     None,
//!     &ModelDType::Auto,
//! )?;
//!
//! let start = Instant::now();
//!
//! let images = pipeline.forward(
//!     vec!["Draw a picture of a sunrise.".to_string()],
//!     DiffusionGenerationParams {
//!         height: 720,
//!         width: 1280,
//!         num_steps: 50,
//!         guidance_scale: 3.5,
//!         seed: Some(0),
//!     },
//! )?;
//!
//! let end = Instant::now();
//! println!("Took: {:.2}s", end.duration_since(start).as_secs_f32());
//!
//! std::fs::write("image.png", &images[0])?;
//!
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! Other architectures can be plugged in by implementing [`Loader`] and registering it with
//! [`PipelineOptions::with_loader`] under the `_class_name` of their `model_index.json`.

mod models;
mod pipelines;
mod util;

pub use diffusion_engine_common::{
    Error, HubResolver, ModelSource, OverlengthPolicy, PromptTokenizer, RepoLayout, Result,
    TokenSource, VarBuilder,
};
pub use models::{
    Conditioning, Denoiser, GuidanceKind, ImageDecoder, Offloading, Residency, TextEncoder,
};
pub use pipelines::{
    take_component, CancellationToken, ComponentElem, ComponentName, DenoiseState,
    DenoisingExecutor, DiffusionGenerationParams, FluxLoader, GenerationConfig, GuidancePlan,
    LoadContext, LoadedModel, Loader, ModelConfig, OutputFormat, Pipeline, PipelineOptions,
    Schedule, ScheduleStep, SchedulerConfig, SchedulerType,
};
pub use util::{ModelDType, TryIntoDType};
