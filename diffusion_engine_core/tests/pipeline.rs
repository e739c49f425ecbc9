use std::{
    collections::HashMap,
    io::{Cursor, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use candle_core::{DType, Device, Tensor, D};
use candle_nn::Linear;
use diffusion_engine_core::{
    take_component, CancellationToken, ComponentElem, ComponentName, Conditioning, Denoiser,
    DiffusionGenerationParams, Error, GenerationConfig, GuidanceKind, HubResolver, ImageDecoder,
    LoadContext, LoadedModel, Loader, ModelConfig, ModelDType, ModelSource, Offloading, Pipeline,
    PipelineOptions, PromptTokenizer, RepoLayout, Residency, SchedulerConfig, TextEncoder,
    VarBuilder,
};
use safetensors::{tensor::TensorView, Dtype};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

const WORD_LEVEL_TOKENIZER: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": { "type": "Whitespace" },
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": { "[UNK]": 0, "x": 1, "a": 2, "red": 3, "fox": 4 },
        "unk_token": "[UNK]"
    }
}"#;

struct Offline;

impl HubResolver for Offline {
    fn resolve(
        &self,
        model_id: &str,
        _layout: &RepoLayout,
    ) -> diffusion_engine_core::Result<PathBuf> {
        Err(Error::NotFound(model_id.to_string()))
    }
}

/// Sums token ids; padding with id 0 does not change the result.
struct SumEncoder;

impl TextEncoder for SumEncoder {
    fn encode(&self, input_ids: &[Tensor]) -> candle_core::Result<Conditioning> {
        let context = input_ids[0].to_dtype(DType::F32)?.sum_keepdim(D::Minus1)?;
        Ok(Conditioning {
            context,
            pooled: None,
        })
    }
}

/// `proj(latent) + 0.01 * sum(ids)`, counting calls.
struct IdentityDenoiser {
    proj: Residency<Linear>,
    kind: GuidanceKind,
    calls: Arc<AtomicUsize>,
}

impl Denoiser for IdentityDenoiser {
    fn guidance_kind(&self) -> GuidanceKind {
        self.kind
    }

    fn predict(
        &self,
        latent: &Tensor,
        _sigma: f64,
        cond: &Conditioning,
        _guidance: Option<f64>,
    ) -> candle_core::Result<Tensor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (b, _, _, _) = latent.dims4()?;
        let shift = (cond.context.reshape((b, 1, 1, 1))? * 0.01)?;
        let proj = self.proj.acquire()?;
        latent
            .permute((0, 2, 3, 1))?
            .contiguous()?
            .apply(proj.as_ref())?
            .permute((0, 3, 1, 2))?
            .broadcast_add(&shift)
    }

    fn release(&self) -> candle_core::Result<()> {
        self.proj.release();
        Ok(())
    }
}

/// Projects latent channels to RGB and upsamples by 8.
struct ProjectDecoder {
    post: Linear,
}

impl ImageDecoder for ProjectDecoder {
    fn decode(&self, latents: &Tensor) -> candle_core::Result<Tensor> {
        let (_, _, h, w) = latents.dims4()?;
        latents
            .permute((0, 2, 3, 1))?
            .contiguous()?
            .apply(&self.post)?
            .permute((0, 3, 1, 2))?
            .upsample_nearest2d(h * 8, w * 8)
    }
}

struct IdentityLoader {
    kind: GuidanceKind,
    calls: Arc<AtomicUsize>,
    latent_downscale: usize,
    /// Copies of offloaded weights made on the compute device.
    device_copies: Arc<AtomicUsize>,
}

impl IdentityLoader {
    fn new(kind: GuidanceKind, calls: &Arc<AtomicUsize>) -> Self {
        Self {
            kind,
            calls: calls.clone(),
            latent_downscale: 8,
            device_copies: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Loader for IdentityLoader {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn required_component_names(&self) -> Vec<ComponentName> {
        vec![
            ComponentName::Scheduler,
            ComponentName::Tokenizer(1),
            ComponentName::Transformer,
            ComponentName::Vae,
        ]
    }

    fn load_from_components(
        &self,
        mut components: HashMap<ComponentName, ComponentElem>,
        ctx: &LoadContext,
    ) -> diffusion_engine_core::Result<LoadedModel> {
        let scheduler_files =
            take_component(&mut components, ComponentName::Scheduler)?.into_files()?;
        let scheduler = SchedulerConfig::from_json(
            &scheduler_files["scheduler/scheduler_config.json"].read_to_string()?,
        )?;
        let tokenizer_files =
            take_component(&mut components, ComponentName::Tokenizer(1))?.into_files()?;
        let tokenizer = tokenizers::Tokenizer::from_bytes(
            tokenizer_files["tokenizer/tokenizer.json"].read_to_string()?,
        )
        .map_err(|e| Error::Tokenizer(e.to_string()))?;

        let (weights, config) =
            take_component(&mut components, ComponentName::Transformer)?.into_model()?;
        let config: serde_json::Value = ctx.read_config(&config)?;
        let channels = config["channels"].as_u64().unwrap_or(4) as usize;
        let proj = match ctx.offloading() {
            Some(Offloading::Full) => {
                let host = ctx.host_tensor_map(weights)?;
                let dtype = ctx.dtype();
                let copies = self.device_copies.clone();
                Residency::offloaded(ctx.device().clone(), move |dev| {
                    copies.fetch_add(1, Ordering::SeqCst);
                    let vb = VarBuilder::from_tensors(host.clone(), dtype, dev);
                    Ok(Linear::new(vb.get((channels, channels), "proj.weight")?, None))
                })
            }
            None => {
                let vb = ctx.var_builder(weights)?;
                Residency::on_device(Linear::new(
                    vb.get((channels, channels), "proj.weight")?,
                    None,
                ))
            }
        };

        let (weights, _) = take_component(&mut components, ComponentName::Vae)?.into_model()?;
        let vb = ctx.var_builder(weights)?;
        let post = Linear::new(vb.get((3, channels), "post.weight")?, None);

        Ok(LoadedModel {
            config: ModelConfig {
                name: "identity".to_string(),
                latent_channels: channels,
                latent_downscale: self.latent_downscale,
                spatial_compression: self.latent_downscale,
            },
            tokenizers: vec![PromptTokenizer::new("words", tokenizer, 8)],
            text_encoder: Box::new(SumEncoder),
            denoiser: Box::new(IdentityDenoiser {
                proj,
                kind: self.kind,
                calls: self.calls.clone(),
            }),
            decoder: Box::new(ProjectDecoder { post }),
            scheduler,
            device: ctx.device().clone(),
            dtype: ctx.dtype(),
        })
    }
}

fn f32_tensor(name: &str, shape: Vec<usize>, values: &[f32]) -> anyhow::Result<Vec<u8>> {
    let data = values
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect::<Vec<_>>();
    let views = HashMap::from([(name.to_string(), TensorView::new(Dtype::F32, shape, &data)?)]);
    Ok(safetensors::serialize(&views, &None)?)
}

fn identity(n: usize) -> Vec<f32> {
    (0..n * n)
        .map(|i| if i / n == i % n { 1.0 } else { 0.0 })
        .collect()
}

fn write_dduf(name: &str, members: &[(&str, Vec<u8>)]) -> anyhow::Result<PathBuf> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for (member, data) in members {
        zip.start_file(*member, options)?;
        zip.write_all(data)?;
    }
    let bytes = zip.finish()?.into_inner();
    let path = std::env::temp_dir().join(format!(
        "diffusion_engine_pipeline_{}_{name}.dduf",
        std::process::id()
    ));
    std::fs::write(&path, bytes)?;
    Ok(path)
}

fn identity_members(
    proj_shape: Vec<usize>,
    with_post: bool,
) -> anyhow::Result<Vec<(&'static str, Vec<u8>)>> {
    let proj = identity(4);
    let proj = if proj_shape == [4, 4] {
        proj
    } else {
        vec![0.0; proj_shape.iter().product()]
    };
    let mut post = vec![0f32; 12];
    for (c, row) in post.chunks_mut(4).enumerate() {
        row[c] = 1.0;
    }
    let vae_weights = if with_post {
        f32_tensor("post.weight", vec![3, 4], &post)?
    } else {
        f32_tensor("post.bias", vec![3], &[0.0; 3])?
    };
    Ok(vec![
        ("model_index.json", br#"{"_class_name": "IdentityPipeline"}"#.to_vec()),
        (
            "scheduler/scheduler_config.json",
            br#"{"_class_name": "FlowMatchEulerDiscreteScheduler", "shift": 1.0}"#.to_vec(),
        ),
        ("tokenizer/tokenizer.json", WORD_LEVEL_TOKENIZER.as_bytes().to_vec()),
        ("transformer/config.json", br#"{"channels": 4}"#.to_vec()),
        (
            "transformer/diffusion_pytorch_model.safetensors",
            f32_tensor("proj.weight", proj_shape, &proj)?,
        ),
        ("vae/config.json", br#"{"_class_name": "Projection"}"#.to_vec()),
        ("vae/diffusion_pytorch_model.safetensors", vae_weights),
    ])
}

fn options(
    kind: GuidanceKind,
    calls: &Arc<AtomicUsize>,
    max_batch_size: usize,
) -> PipelineOptions {
    options_with(IdentityLoader::new(kind, calls), max_batch_size)
}

fn options_with(loader: IdentityLoader, max_batch_size: usize) -> PipelineOptions {
    PipelineOptions {
        silent: true,
        dtype: ModelDType::F32,
        device: Some(Device::Cpu),
        resolver: Some(Arc::new(Offline)),
        generation: GenerationConfig {
            max_batch_size,
            ..Default::default()
        },
        ..Default::default()
    }
    .with_loader("IdentityPipeline", loader)
}

fn load(
    path: &Path,
    kind: GuidanceKind,
    calls: &Arc<AtomicUsize>,
    max_batch_size: usize,
) -> diffusion_engine_core::Result<Pipeline> {
    Pipeline::load_with_options(ModelSource::dduf(path), options(kind, calls, max_batch_size))
}

fn params(num_steps: usize, guidance_scale: f64) -> DiffusionGenerationParams {
    DiffusionGenerationParams {
        height: 64,
        width: 64,
        num_steps,
        guidance_scale,
        seed: Some(7),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn single_prompt_end_to_end() -> anyhow::Result<()> {
    init_tracing();
    let path = write_dduf("e2e", &identity_members(vec![4, 4], true)?)?;
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = load(&path, GuidanceKind::ClassifierFree, &calls, 1)?;
    assert_eq!(pipeline.model().config.spatial_compression, 8);

    let images = pipeline.forward(vec!["x".to_string()], params(1, 0.0))?;
    assert_eq!(images.len(), 1);
    let img = image::load_from_memory(&images[0])?;
    assert_eq!((img.width(), img.height()), (64, 64));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn guidance_controls_the_unconditional_pass() -> anyhow::Result<()> {
    let path = write_dduf("guidance", &identity_members(vec![4, 4], true)?)?;
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = load(&path, GuidanceKind::ClassifierFree, &calls, 1)?;
    let prompts = vec!["a red fox".to_string(), "x".to_string()];

    let images = pipeline.forward(prompts.clone(), params(3, 0.0))?;
    assert_eq!(images.len(), 2);
    assert_eq!(calls.swap(0, Ordering::SeqCst), 3 * 2);

    let images = pipeline.forward(prompts, params(3, 4.0))?;
    assert_eq!(images.len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3 * 2 * 2);
    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn distilled_models_never_run_an_unconditional_pass() -> anyhow::Result<()> {
    let path = write_dduf("distilled", &identity_members(vec![4, 4], true)?)?;
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = load(&path, GuidanceKind::Distilled, &calls, 1)?;
    pipeline.forward(vec!["x".to_string()], params(2, 3.5))?;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn invalid_params_fail_before_any_prediction() -> anyhow::Result<()> {
    let path = write_dduf("validation", &identity_members(vec![4, 4], true)?)?;
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = load(&path, GuidanceKind::ClassifierFree, &calls, 1)?;

    let mut bad = params(1, 0.0);
    bad.height = 721;
    let err = pipeline.forward(vec!["x".to_string()], bad).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    let err = pipeline
        .forward(vec!["x".to_string()], params(0, 0.0))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert!(pipeline.forward(Vec::new(), params(1, 0.0))?.is_empty());
    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn seeded_generation_is_reproducible_and_batch_independent() -> anyhow::Result<()> {
    let path = write_dduf("seeded", &identity_members(vec![4, 4], true)?)?;
    let calls = Arc::new(AtomicUsize::new(0));
    let sequential = load(&path, GuidanceKind::ClassifierFree, &calls, 1)?;
    let batched = load(&path, GuidanceKind::ClassifierFree, &calls, 2)?;
    let prompts = vec![
        "a red fox".to_string(),
        "x".to_string(),
        "fox".to_string(),
    ];

    let first = sequential.forward(prompts.clone(), params(2, 1.5))?;
    let second = sequential.forward(prompts.clone(), params(2, 1.5))?;
    let third = batched.forward(prompts, params(2, 1.5))?;
    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
    assert_eq!(first, third);
    assert_ne!(first[0], first[1]);
    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn cancellation_leaves_the_pipeline_usable() -> anyhow::Result<()> {
    let path = write_dduf("cancel", &identity_members(vec![4, 4], true)?)?;
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = load(&path, GuidanceKind::ClassifierFree, &calls, 1)?;

    let token = CancellationToken::new();
    token.cancel();
    let err = pipeline
        .forward_with_cancellation(vec!["x".to_string()], params(4, 0.0), &token)
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled(0)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let images = pipeline.forward_with_cancellation(
        vec!["x".to_string()],
        params(4, 0.0),
        &CancellationToken::new(),
    )?;
    assert_eq!(images.len(), 1);
    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn concurrent_forwards_share_one_pipeline() -> anyhow::Result<()> {
    let path = write_dduf("concurrent", &identity_members(vec![4, 4], true)?)?;
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = load(&path, GuidanceKind::ClassifierFree, &calls, 1)?;
    let results = std::thread::scope(|s| {
        let handles = (0..2)
            .map(|_| s.spawn(|| pipeline.forward(vec!["red".to_string()], params(2, 0.0))))
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|h| h.join().expect("forward thread panicked"))
            .collect::<Vec<_>>()
    });
    let results = results
        .into_iter()
        .collect::<diffusion_engine_core::Result<Vec<_>>>()?;
    assert_eq!(results[0], results[1]);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn decoded_images_are_exposed() -> anyhow::Result<()> {
    let path = write_dduf("images", &identity_members(vec![4, 4], true)?)?;
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = load(&path, GuidanceKind::ClassifierFree, &calls, 1)?;
    let images =
        pipeline.forward_images(vec!["x".to_string(), "fox".to_string()], params(1, 0.0))?;
    assert_eq!(images.len(), 2);
    assert_eq!((images[1].width(), images[1].height()), (64, 64));
    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn shape_mismatch_is_reported_on_load() -> anyhow::Result<()> {
    let path = write_dduf("shape", &identity_members(vec![4, 5], true)?)?;
    let calls = Arc::new(AtomicUsize::new(0));
    match load(&path, GuidanceKind::ClassifierFree, &calls, 1) {
        Err(Error::ShapeMismatch {
            name,
            expected,
            got,
        }) => {
            assert_eq!(name, "proj.weight");
            assert_eq!(expected, vec![4, 4]);
            assert_eq!(got, vec![4, 5]);
        }
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("loading should fail"),
    }
    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn missing_weight_is_reported_on_load() -> anyhow::Result<()> {
    let path = write_dduf("missing", &identity_members(vec![4, 4], false)?)?;
    let calls = Arc::new(AtomicUsize::new(0));
    match load(&path, GuidanceKind::ClassifierFree, &calls, 1) {
        Err(Error::MissingWeight(name)) => assert_eq!(name, "post.weight"),
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("loading should fail"),
    }
    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn unsupported_quantization_is_rejected() -> anyhow::Result<()> {
    let mut members = identity_members(vec![4, 4], true)?;
    for (name, data) in members.iter_mut() {
        if *name == "transformer/config.json" {
            *data = br#"{"channels": 4, "quantization_config": {"quant_method": "gguf"}}"#.to_vec();
        }
    }
    let path = write_dduf("quant", &members)?;
    let calls = Arc::new(AtomicUsize::new(0));
    let err = load(&path, GuidanceKind::ClassifierFree, &calls, 1).err();
    assert!(matches!(err, Some(Error::UnsupportedQuantization(_))));
    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn model_index_is_required_and_dispatched() -> anyhow::Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));

    let path = write_dduf("no_index", &[("scheduler/scheduler_config.json", b"{}".to_vec())])?;
    let err = load(&path, GuidanceKind::ClassifierFree, &calls, 1).err();
    assert!(matches!(err, Some(Error::InvalidSource(_))));
    std::fs::remove_file(path)?;

    let path = write_dduf(
        "unknown_class",
        &[("model_index.json", br#"{"_class_name": "StableCascadePipeline"}"#.to_vec())],
    )?;
    let err = load(&path, GuidanceKind::ClassifierFree, &calls, 1).err();
    assert!(matches!(err, Some(Error::UnsupportedModel(_))));
    std::fs::remove_file(path)?;

    let path = write_dduf(
        "missing_component",
        &[("model_index.json", br#"{"_class_name": "IdentityPipeline"}"#.to_vec())],
    )?;
    let err = load(&path, GuidanceKind::ClassifierFree, &calls, 1).err();
    assert!(matches!(err, Some(Error::InvalidSource(_))));
    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn offloaded_weights_match_resident_weights() -> anyhow::Result<()> {
    let path = write_dduf("offload", &identity_members(vec![4, 4], true)?)?;
    let calls = Arc::new(AtomicUsize::new(0));
    let prompts = vec!["a red fox".to_string(), "x".to_string()];

    let resident = load(&path, GuidanceKind::ClassifierFree, &calls, 1)?;
    let expected = resident.forward_images(prompts.clone(), params(2, 0.0))?;

    let loader = IdentityLoader::new(GuidanceKind::ClassifierFree, &calls);
    let copies = loader.device_copies.clone();
    let offloaded = Pipeline::load_with_options(
        ModelSource::dduf(&path),
        PipelineOptions {
            offloading: Some(Offloading::Full),
            ..options_with(loader, 1)
        },
    )?;
    assert_eq!(copies.load(Ordering::SeqCst), 0);

    let images = offloaded.forward_images(prompts, params(2, 0.0))?;
    assert_eq!(images.len(), expected.len());
    for (image, expected) in images.iter().zip(&expected) {
        assert_eq!(image.as_bytes(), expected.as_bytes());
    }
    // One copy per batch: the weights go back to host memory after each denoising loop.
    assert_eq!(copies.load(Ordering::SeqCst), 2);
    std::fs::remove_file(path)?;
    Ok(())
}

#[test]
fn zero_compression_factors_are_rejected_on_load() -> anyhow::Result<()> {
    let path = write_dduf("zero_factor", &identity_members(vec![4, 4], true)?)?;
    let calls = Arc::new(AtomicUsize::new(0));
    let loader = IdentityLoader {
        latent_downscale: 0,
        ..IdentityLoader::new(GuidanceKind::ClassifierFree, &calls)
    };
    let err = Pipeline::load_with_options(ModelSource::dduf(&path), options_with(loader, 1)).err();
    assert!(matches!(err, Some(Error::InvalidConfig(_))));
    std::fs::remove_file(path)?;
    Ok(())
}
