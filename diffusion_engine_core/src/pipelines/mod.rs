mod flux;
mod sampling;
mod scheduler;

use std::{collections::HashMap, fmt::Display, sync::Arc};

use candle_core::{DType, Device, Tensor};
use diffusion_engine_backend::{from_weight_files, DequantizingBackend, QuantizationConfig};
use diffusion_engine_common::{
    Error, FileData, HfHubResolver, HubResolver, IterWithProgress, ModelSource, OverlengthPolicy,
    PromptTokenizer, ResolvedSource, Result, TokenSource, VarBuilder,
};
use image::DynamicImage;
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, info};

use crate::{
    models::{Denoiser, ImageDecoder, Offloading, TextEncoder},
    ModelDType, TryIntoDType,
};

pub use flux::FluxLoader;
pub use sampling::{
    encode_image, initial_noise, to_images, CancellationToken, DenoiseState, DenoisingExecutor,
    GuidancePlan,
};
pub use scheduler::{Schedule, ScheduleStep, SchedulerConfig, SchedulerType};

/// Generation parameters.
#[derive(Debug, Clone)]
pub struct DiffusionGenerationParams {
    /// Must be a multiple of the model's spatial compression factor.
    pub height: usize,
    /// Must be a multiple of the model's spatial compression factor.
    pub width: usize,
    /// The number of denoising steps. More denoising steps usually lead to a higher quality image at the
    /// expense of slower inference but depends on the model being used.
    pub num_steps: usize,
    /// Higher guidance scale encourages to generate images that are closely linked to the text `prompt`,
    /// usually at the expense of lower image quality. `0.0` disables classifier-free guidance.
    pub guidance_scale: f64,
    /// Seed of the initial noise. Without one, every call samples fresh noise.
    pub seed: Option<u64>,
}

impl DiffusionGenerationParams {
    /// Check the parameters against a model with the given spatial compression factor.
    pub fn validate(&self, spatial_compression: usize) -> Result<()> {
        for (what, value) in [("height", self.height), ("width", self.width)] {
            if value == 0 {
                return Err(Error::validation(format!("{what} must be positive")));
            }
            if value % spatial_compression != 0 {
                return Err(Error::validation(format!(
                    "{what} {value} is not divisible by the spatial compression factor {spatial_compression}"
                )));
            }
        }
        if self.num_steps == 0 {
            return Err(Error::validation("`num_steps` must be at least 1"));
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale < 0.0 {
            return Err(Error::validation(format!(
                "guidance scale must be finite and non-negative, got {}",
                self.guidance_scale
            )));
        }
        Ok(())
    }
}

/// Encoding of the returned images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
}

fn default_max_batch_size() -> usize {
    1
}

/// Per-pipeline generation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    /// Prompts per denoising batch. `1` runs prompts one after the other.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub overlength: OverlengthPolicy,
    #[serde(default)]
    pub output_format: OutputFormat,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            overlength: OverlengthPolicy::default(),
            output_format: OutputFormat::default(),
        }
    }
}

/// The files of one pipeline component.
#[derive(Debug)]
pub enum ComponentElem {
    /// Weights and their `config.json`.
    Model {
        safetensors: HashMap<String, FileData>,
        config: FileData,
    },
    /// Only JSON files.
    Config { files: HashMap<String, FileData> },
    Other { files: HashMap<String, FileData> },
}

impl ComponentElem {
    /// The weight files, ordered by name, and the config of a model component.
    pub fn into_model(self) -> Result<(Vec<FileData>, FileData)> {
        match self {
            Self::Model {
                safetensors,
                config,
            } => {
                let mut files = safetensors.into_iter().collect::<Vec<_>>();
                files.sort_by(|a, b| a.0.cmp(&b.0));
                Ok((files.into_iter().map(|(_, f)| f).collect(), config))
            }
            Self::Config { .. } | Self::Other { .. } => Err(Error::InvalidSource(
                "expected a component with weights".to_string(),
            )),
        }
    }

    /// The files of a component without weights, keyed by path.
    pub fn into_files(self) -> Result<HashMap<String, FileData>> {
        match self {
            Self::Config { files } | Self::Other { files } => Ok(files),
            Self::Model { .. } => Err(Error::InvalidSource(
                "expected a component without weights".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentName {
    Scheduler,
    TextEncoder(usize),
    Tokenizer(usize),
    Transformer,
    Vae,
}

impl Display for ComponentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduler => write!(f, "scheduler"),
            Self::Transformer => write!(f, "transformer"),
            Self::Vae => write!(f, "vae"),
            Self::TextEncoder(1) => write!(f, "text_encoder"),
            Self::TextEncoder(x) => write!(f, "text_encoder_{x}"),
            Self::Tokenizer(1) => write!(f, "tokenizer"),
            Self::Tokenizer(x) => write!(f, "tokenizer_{x}"),
        }
    }
}

/// Remove a component collected for a loader.
pub fn take_component(
    components: &mut HashMap<ComponentName, ComponentElem>,
    name: ComponentName,
) -> Result<ComponentElem> {
    components
        .remove(&name)
        .ok_or_else(|| Error::InvalidSource(format!("missing component `{name}`")))
}

/// Device, dtype and weight access shared by every component of one load.
pub struct LoadContext {
    device: Device,
    dtype: DType,
    silent: bool,
    offloading: Option<Offloading>,
}

impl LoadContext {
    pub fn new(device: Device, dtype: DType, silent: bool) -> Self {
        Self {
            device,
            dtype,
            silent,
            offloading: None,
        }
    }

    pub fn with_offloading(mut self, offloading: Option<Offloading>) -> Self {
        self.offloading = offloading;
        self
    }

    /// Loaders keep their largest components in host memory when this is set.
    pub fn offloading(&self) -> Option<Offloading> {
        self.offloading
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn silent(&self) -> bool {
        self.silent
    }

    /// A lazily dequantizing `VarBuilder` over the weight files of a component.
    pub fn var_builder(&self, files: Vec<FileData>) -> Result<VarBuilder> {
        let files = files
            .iter()
            .map(FileData::weight_file)
            .collect::<Result<Vec<_>>>()?;
        Ok(from_weight_files(files, self.dtype, &self.device))
    }

    /// Every tensor of a component, dequantized.
    pub fn tensor_map(&self, files: Vec<FileData>) -> Result<HashMap<String, Tensor>> {
        let files = files
            .iter()
            .map(FileData::weight_file)
            .collect::<Result<Vec<_>>>()?;
        DequantizingBackend::new(files).load_all(self.dtype, &self.device, self.silent)
    }

    /// Like [`LoadContext::tensor_map`], keeping the tensors in host memory.
    pub fn host_tensor_map(&self, files: Vec<FileData>) -> Result<HashMap<String, Tensor>> {
        let files = files
            .iter()
            .map(FileData::weight_file)
            .collect::<Result<Vec<_>>>()?;
        DequantizingBackend::new(files).load_all(self.dtype, &Device::Cpu, self.silent)
    }

    /// Read a component config, rejecting quantization methods which cannot be loaded.
    pub fn read_config_str(&self, config: &FileData) -> Result<String> {
        let json = config.read_to_string()?;
        if let Some(quant) = QuantizationConfig::from_component_config(&json)? {
            debug!("{config:?} is quantized with {}", quant.quant_method);
        }
        Ok(json)
    }

    pub fn read_config<T: DeserializeOwned>(&self, config: &FileData) -> Result<T> {
        let json = self.read_config_str(config)?;
        serde_json::from_str(&json)
            .map_err(|e| Error::invalid_config(format!("{config:?}: {e}")))
    }
}

/// Builds a [`LoadedModel`] from the components of a pipeline, dispatched on the
/// `_class_name` of `model_index.json`.
pub trait Loader: Send + Sync {
    fn name(&self) -> &'static str;
    fn required_component_names(&self) -> Vec<ComponentName>;
    fn load_from_components(
        &self,
        components: HashMap<ComponentName, ComponentElem>,
        ctx: &LoadContext,
    ) -> Result<LoadedModel>;
}

/// Static properties of a loaded model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub name: String,
    pub latent_channels: usize,
    /// Pixels per latent element along each axis.
    pub latent_downscale: usize,
    /// Height and width of generated images must be multiples of this.
    pub spatial_compression: usize,
}

/// Everything needed to run generations. Immutable once built.
pub struct LoadedModel {
    pub config: ModelConfig,
    pub tokenizers: Vec<PromptTokenizer>,
    pub text_encoder: Box<dyn TextEncoder>,
    pub denoiser: Box<dyn Denoiser>,
    pub decoder: Box<dyn ImageDecoder>,
    pub scheduler: SchedulerConfig,
    pub device: Device,
    pub dtype: DType,
}

/// Options of [`Pipeline::load_with_options`].
#[derive(Clone, Default)]
pub struct PipelineOptions {
    pub silent: bool,
    /// Only used for Hugging Face models.
    pub token: TokenSource,
    /// Only used for Hugging Face models.
    pub revision: Option<String>,
    pub dtype: ModelDType,
    /// Defaults to the first CUDA (or Metal) device, else the CPU.
    pub device: Option<Device>,
    /// Defaults to the Hugging Face hub.
    pub resolver: Option<Arc<dyn HubResolver>>,
    /// Keep the largest components in host memory between uses.
    pub offloading: Option<Offloading>,
    /// Extra loaders keyed by `_class_name`, taking precedence over the builtin ones.
    pub loaders: HashMap<String, Arc<dyn Loader>>,
    pub generation: GenerationConfig,
}

impl PipelineOptions {
    pub fn with_loader(mut self, class_name: impl ToString, loader: impl Loader + 'static) -> Self {
        self.loaders.insert(class_name.to_string(), Arc::new(loader));
        self
    }
}

fn builtin_loader(class_name: &str) -> Option<Arc<dyn Loader>> {
    match class_name {
        "FluxPipeline" => Some(Arc::new(FluxLoader)),
        _ => None,
    }
}

fn default_device() -> Result<Device> {
    #[cfg(not(feature = "metal"))]
    let device = Device::cuda_if_available(0)?;
    #[cfg(feature = "metal")]
    let device = Device::new_metal(0)?;
    Ok(device)
}

#[derive(Clone, Debug, Deserialize)]
struct ModelIndex {
    #[serde(rename = "_class_name")]
    name: String,
}

fn collect_components(
    source: &ResolvedSource,
    names: Vec<ComponentName>,
    silent: bool,
) -> Result<HashMap<ComponentName, ComponentElem>> {
    let files = source.list_files()?;
    let transformer_files = source.list_transformer_files()?;

    let mut components = HashMap::new();
    for component in names.into_iter().with_progress(silent) {
        let (files, from_transformer, dir) = match (&component, &transformer_files) {
            (ComponentName::Transformer, Some(transformer_files)) => {
                (transformer_files, true, String::new())
            }
            _ => (&files, false, format!("{component}/")),
        };
        let files_for_component = files
            .iter()
            .filter(|file| file.starts_with(&dir))
            .filter(|file| !file.ends_with('/'))
            .collect::<Vec<_>>();
        if files_for_component.is_empty() {
            return Err(Error::InvalidSource(format!(
                "missing component `{component}`"
            )));
        }

        // 1) Model: safetensors and a config.json
        // 2) Config: only .json files
        // 3) Other: anything else, e.g. tokenizer vocabularies
        let read_all = |filter: &dyn Fn(&str) -> bool| -> Result<HashMap<String, FileData>> {
            files_for_component
                .iter()
                .filter(|file| filter(file))
                .map(|file| Ok(((*file).clone(), source.read_file(file, from_transformer)?)))
                .collect()
        };
        let component_elem = if files_for_component
            .iter()
            .any(|file| file.ends_with(".safetensors"))
        {
            let config = format!("{dir}config.json");
            if !files.contains(&config) {
                return Err(Error::InvalidSource(format!(
                    "component `{component}` has weights but no `{config}`"
                )));
            }
            ComponentElem::Model {
                safetensors: read_all(&|file| file.ends_with(".safetensors"))?,
                config: source.read_file(&config, from_transformer)?,
            }
        } else if files_for_component
            .iter()
            .all(|file| file.ends_with(".json"))
        {
            ComponentElem::Config {
                files: read_all(&|_| true)?,
            }
        } else {
            ComponentElem::Other {
                files: read_all(&|_| true)?,
            }
        };
        components.insert(component, component_elem);
    }
    Ok(components)
}

/// Represents the model and provides methods to load and interact with it.
///
/// A `Pipeline` can be shared between threads; concurrent `forward` calls each own their
/// latents and only serialize on text encoders which need exclusive access.
pub struct Pipeline {
    model: Arc<LoadedModel>,
    generation: GenerationConfig,
    silent: bool,
}

/// Inputs of one denoising batch, prepared before any model computation.
struct Chunk {
    offset: usize,
    len: usize,
    input_ids: Vec<Tensor>,
    uncond_ids: Option<Vec<Tensor>>,
}

impl Pipeline {
    /// Load the model.
    ///
    /// Note:
    /// - `token` and `revision` are only applicable for Hugging Face models.
    pub fn load(
        source: ModelSource,
        silent: bool,
        token: TokenSource,
        revision: Option<String>,
        dtype: &ModelDType,
    ) -> Result<Self> {
        Self::load_with_options(
            source,
            PipelineOptions {
                silent,
                token,
                revision,
                dtype: *dtype,
                ..Default::default()
            },
        )
    }

    pub fn load_with_options(source: ModelSource, options: PipelineOptions) -> Result<Self> {
        let PipelineOptions {
            silent,
            token,
            revision,
            dtype,
            device,
            resolver,
            offloading,
            loaders,
            generation,
        } = options;
        info!("loading from source: {source}.");

        let resolver =
            resolver.unwrap_or_else(|| Arc::new(HfHubResolver::new(token, revision, silent)));
        let resolved = source.resolve(resolver.as_ref())?;

        if !resolved
            .list_files()?
            .iter()
            .any(|file| file == "model_index.json")
        {
            return Err(Error::InvalidSource(
                "expected a `model_index.json` file".to_string(),
            ));
        }
        let ModelIndex { name } = serde_json::from_str(
            &resolved
                .read_file("model_index.json", false)?
                .read_to_string()?,
        )?;
        let loader = loaders
            .get(&name)
            .cloned()
            .or_else(|| builtin_loader(&name))
            .ok_or_else(|| Error::UnsupportedModel(format!("pipeline class `{name}`")))?;
        info!("model architecture is: {}", loader.name());

        let components = collect_components(&resolved, loader.required_component_names(), silent)?;

        let device = match device {
            Some(device) => device,
            None => default_device()?,
        };
        let dtype = dtype.try_into_dtype(&[&device], silent)?;
        if let Some(offloading) = offloading {
            info!("offloading: {offloading:?}");
        }
        let ctx = LoadContext::new(device, dtype, silent).with_offloading(offloading);
        let model = loader.load_from_components(components, &ctx)?;
        let ModelConfig {
            latent_channels,
            latent_downscale,
            spatial_compression,
            ..
        } = &model.config;
        if *latent_channels == 0 || *latent_downscale == 0 || *spatial_compression == 0 {
            return Err(Error::invalid_config(format!(
                "`{}` reports zero latent channels or compression factors",
                model.config.name
            )));
        }

        Ok(Self {
            model: Arc::new(model),
            generation,
            silent,
        })
    }

    pub fn model(&self) -> &LoadedModel {
        &self.model
    }

    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation
    }

    /// Generate one encoded image per prompt, in prompt order.
    ///
    /// Prompts are run in batches of at most `max_batch_size`, padded to a common length.
    pub fn forward(
        &self,
        prompts: Vec<String>,
        params: DiffusionGenerationParams,
    ) -> Result<Vec<Vec<u8>>> {
        self.encode_all(self.generate(&prompts, &params, None)?)
    }

    /// Like [`Pipeline::forward`], stopping with [`Error::Cancelled`] once `token` is cancelled.
    pub fn forward_with_cancellation(
        &self,
        prompts: Vec<String>,
        params: DiffusionGenerationParams,
        token: &CancellationToken,
    ) -> Result<Vec<Vec<u8>>> {
        self.encode_all(self.generate(&prompts, &params, Some(token))?)
    }

    /// Generate images without encoding them.
    pub fn forward_images(
        &self,
        prompts: Vec<String>,
        params: DiffusionGenerationParams,
    ) -> Result<Vec<DynamicImage>> {
        self.generate(&prompts, &params, None)
    }

    fn encode_all(&self, images: Vec<DynamicImage>) -> Result<Vec<Vec<u8>>> {
        images
            .iter()
            .map(|img| encode_image(img, self.generation.output_format))
            .collect()
    }

    fn tokenize(&self, prompts: &[String]) -> Result<Vec<Tensor>> {
        self.model
            .tokenizers
            .iter()
            .map(|tokenizer| {
                let ids = tokenizer.encode_batch(prompts, self.generation.overlength)?;
                Ok(Tensor::new(ids, &self.model.device)?)
            })
            .collect()
    }

    fn generate(
        &self,
        prompts: &[String],
        params: &DiffusionGenerationParams,
        cancellation: Option<&CancellationToken>,
    ) -> Result<Vec<DynamicImage>> {
        let config = &self.model.config;
        params.validate(config.spatial_compression)?;
        if self.generation.max_batch_size == 0 {
            return Err(Error::validation("`max_batch_size` must be at least 1"));
        }
        if prompts.is_empty() {
            return Ok(Vec::new());
        }

        let image_seq_len = (params.height / config.spatial_compression)
            * (params.width / config.spatial_compression);
        let schedule = self
            .model
            .scheduler
            .schedule(params.num_steps, image_seq_len)?;
        let plan = GuidancePlan::new(self.model.denoiser.guidance_kind(), params.guidance_scale);

        let chunks = prompts
            .chunks(self.generation.max_batch_size)
            .enumerate()
            .map(|(i, chunk)| {
                let uncond_ids = if plan.needs_unconditional() {
                    Some(self.tokenize(&vec![String::new(); chunk.len()])?)
                } else {
                    None
                };
                Ok(Chunk {
                    offset: i * self.generation.max_batch_size,
                    len: chunk.len(),
                    input_ids: self.tokenize(chunk)?,
                    uncond_ids,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "generating {} images in {} batches with {plan:?}",
            prompts.len(),
            chunks.len()
        );

        let mut images = Vec::with_capacity(prompts.len());
        for chunk in chunks {
            #[cfg(feature = "metal")]
            let chunk_images = objc::rc::autoreleasepool(|| {
                self.run_chunk(&chunk, params, &schedule, plan, cancellation)
            })?;
            #[cfg(not(feature = "metal"))]
            let chunk_images = self.run_chunk(&chunk, params, &schedule, plan, cancellation)?;
            images.extend(chunk_images);
        }
        Ok(images)
    }

    fn run_chunk(
        &self,
        chunk: &Chunk,
        params: &DiffusionGenerationParams,
        schedule: &Schedule,
        plan: GuidancePlan,
        cancellation: Option<&CancellationToken>,
    ) -> Result<Vec<DynamicImage>> {
        let model = &self.model;
        let cond = model.text_encoder.encode(&chunk.input_ids)?;
        let uncond = chunk
            .uncond_ids
            .as_ref()
            .map(|ids| model.text_encoder.encode(ids))
            .transpose()?;

        let downscale = model.config.latent_downscale;
        let noise = initial_noise(
            chunk.offset,
            chunk.len,
            (
                model.config.latent_channels,
                params.height / downscale,
                params.width / downscale,
            ),
            params.seed,
            &model.device,
            model.dtype,
        )?;

        let mut executor = DenoisingExecutor::new(model.denoiser.as_ref(), schedule, plan, &cond)
            .with_progress(self.silent);
        if let Some(uncond) = uncond.as_ref() {
            executor = executor.with_unconditional(uncond);
        }
        if let Some(token) = cancellation {
            executor = executor.with_cancellation(token);
        }
        let latents = executor.run(noise);
        model.denoiser.release()?;
        let latents = latents?;

        let pixels = model.decoder.decode(&latents)?;
        to_images(&pixels, params.height, params.width)
    }
}

#[cfg(test)]
mod tests {
    use diffusion_engine_common::Error;

    use super::{ComponentName, DiffusionGenerationParams, GenerationConfig, OutputFormat};

    fn params(height: usize, width: usize) -> DiffusionGenerationParams {
        DiffusionGenerationParams {
            height,
            width,
            num_steps: 4,
            guidance_scale: 3.5,
            seed: None,
        }
    }

    #[test]
    fn validates_dimensions_and_steps() {
        assert!(params(720, 1280).validate(16).is_ok());
        assert!(matches!(params(721, 64).validate(8), Err(Error::Validation(_))));
        assert!(matches!(params(0, 64).validate(8), Err(Error::Validation(_))));
        let mut p = params(64, 64);
        p.num_steps = 0;
        assert!(matches!(p.validate(8), Err(Error::Validation(_))));
        p.num_steps = 1;
        p.guidance_scale = -1.0;
        assert!(matches!(p.validate(8), Err(Error::Validation(_))));
        p.guidance_scale = f64::NAN;
        assert!(matches!(p.validate(8), Err(Error::Validation(_))));
    }

    #[test]
    fn generation_config_defaults() {
        let cfg: GenerationConfig = serde_json::from_str(r#"{"output_format": "jpeg"}"#).unwrap();
        assert_eq!(cfg.max_batch_size, 1);
        assert_eq!(cfg.output_format, OutputFormat::Jpeg);
        assert_eq!(GenerationConfig::default().output_format, OutputFormat::Png);
    }

    #[test]
    fn component_directories() {
        assert_eq!(ComponentName::TextEncoder(1).to_string(), "text_encoder");
        assert_eq!(ComponentName::Tokenizer(2).to_string(), "tokenizer_2");
    }
}
