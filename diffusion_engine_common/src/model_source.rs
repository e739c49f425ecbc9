use std::{
    ffi::OsStr,
    fmt::{Debug, Display},
    fs,
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::info;

use crate::{
    container::{Container, ZIP_SIGNATURE},
    hub::{validate_model_id, HubResolver, RepoLayout},
    safetensors::WeightFile,
    Error, Result,
};

/// Source from which to load the model. This is easiest to create with the various constructor functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// A Hugging Face model id, or a path to a local diffusers-layout directory.
    ModelId(String),
    ModelIdWithTransformer {
        model_id: String,
        transformer_model_id: String,
    },
    /// A packaged `.dduf` container.
    DdufFile(PathBuf),
}

impl Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DdufFile(path) => write!(f, "dduf file: {}", path.display()),
            Self::ModelId(model_id) => write!(f, "model id: {model_id}"),
            Self::ModelIdWithTransformer {
                model_id,
                transformer_model_id,
            } => write!(
                f,
                "model id: {model_id}, transformer override: {transformer_model_id}"
            ),
        }
    }
}

impl ModelSource {
    /// Load the model from a Hugging Face model ID or a local path.
    pub fn from_model_id<S: ToString>(model_id: S) -> Self {
        Self::ModelId(model_id.to_string())
    }

    /// Load the transformer part of this model from a Hugging Face model ID or a local path.
    ///
    /// For example, this enables loading a quantized transformer model (for instance, [this](https://huggingface.co/sayakpaul/flux.1-dev-nf4-with-bnb-integration))
    /// with the same [base model](https://huggingface.co/black-forest-labs/FLUX.1-dev) as the original model ID.
    ///
    /// ```rust
    /// use diffusion_engine_common::ModelSource;
    ///
    /// let _ = ModelSource::from_model_id("black-forest-labs/FLUX.1-dev")
    ///     .override_transformer_model_id("sayakpaul/flux.1-dev-nf4-with-bnb-integration")?;
    ///
    /// # Ok::<(), diffusion_engine_common::Error>(())
    /// ```
    pub fn override_transformer_model_id<S: ToString>(self, model_id: S) -> Result<Self> {
        let Self::ModelId(base_id) = self else {
            return Err(Error::InvalidSource(
                "a transformer override needs a model id source".to_string(),
            ));
        };
        Ok(Self::ModelIdWithTransformer {
            model_id: base_id,
            transformer_model_id: model_id.to_string(),
        })
    }

    /// Load a DDUF model from a .dduf file.
    pub fn dduf<P: AsRef<Path>>(filename: P) -> Self {
        Self::DdufFile(filename.as_ref().to_path_buf())
    }

    /// Resolve this source into loadable files. Remote ids go through `resolver`.
    pub fn resolve(self, resolver: &dyn HubResolver) -> Result<ResolvedSource> {
        match self {
            Self::ModelId(model_id) => Ok(ResolvedSource::Directory {
                root: resolve_directory(&model_id, &RepoLayout::pipeline(), resolver)?,
                transformer_root: None,
            }),
            Self::ModelIdWithTransformer {
                model_id,
                transformer_model_id,
            } => {
                let base = RepoLayout::Pipeline {
                    skip_components: vec!["transformer".to_string()],
                };
                Ok(ResolvedSource::Directory {
                    root: resolve_directory(&model_id, &base, resolver)?,
                    transformer_root: Some(resolve_directory(
                        &transformer_model_id,
                        &RepoLayout::Component,
                        resolver,
                    )?),
                })
            }
            Self::DdufFile(path) => {
                check_dduf_signature(&path)?;
                let container = Container::open(&path)?;
                info!(
                    "opened dduf container {} with {} members",
                    path.display(),
                    container.names().count()
                );
                Ok(ResolvedSource::Packaged(Arc::new(container)))
            }
        }
    }
}

fn resolve_directory(
    model_id: &str,
    layout: &RepoLayout,
    resolver: &dyn HubResolver,
) -> Result<PathBuf> {
    let local = Path::new(model_id);
    if local.is_dir() {
        return Ok(local.to_path_buf());
    }
    validate_model_id(model_id)?;
    let root = resolver.resolve(model_id, layout)?;
    if !root.is_dir() {
        return Err(Error::NotFound(root.display().to_string()));
    }
    Ok(root)
}

fn check_dduf_signature(path: &Path) -> Result<()> {
    let is_dduf = path
        .extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dduf"));
    if !is_dduf {
        return Err(Error::InvalidSource(format!(
            "{} does not have the `.dduf` extension",
            path.display()
        )));
    }
    let mut file = fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        _ => Error::Io(e),
    })?;
    let mut signature = [0u8; 4];
    if file.read_exact(&mut signature).is_err() || signature != ZIP_SIGNATURE {
        return Err(Error::InvalidSource(format!(
            "{} is not a zip-based DDUF container",
            path.display()
        )));
    }
    Ok(())
}

/// A [`ModelSource`] after resolution: either a local directory tree or an opened container.
#[derive(Debug, Clone)]
pub enum ResolvedSource {
    Directory {
        root: PathBuf,
        transformer_root: Option<PathBuf>,
    },
    Packaged(Arc<Container>),
}

fn list_dir(root: &Path) -> Result<Vec<String>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                walk(root, &path, out)?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(rel);
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    walk(root, root, &mut out)?;
    out.sort();
    Ok(out)
}

impl ResolvedSource {
    /// All file names, `/` separated and relative to the model root.
    pub fn list_files(&self) -> Result<Vec<String>> {
        match self {
            Self::Directory { root, .. } => list_dir(root),
            Self::Packaged(container) => Ok(container.names().map(str::to_string).collect()),
        }
    }

    /// Files of the transformer override, if there is one.
    pub fn list_transformer_files(&self) -> Result<Option<Vec<String>>> {
        match self {
            Self::Directory {
                transformer_root: Some(root),
                ..
            } => list_dir(root).map(Some),
            Self::Directory { .. } | Self::Packaged(_) => Ok(None),
        }
    }

    /// Read a file.
    ///
    /// - If loading from a DDUF file, this returns a handle to the member instead of owned data.
    /// - For directory sources, a path is returned
    pub fn read_file(&self, name: &str, from_transformer: bool) -> Result<FileData> {
        match (self, from_transformer) {
            (
                Self::Directory {
                    transformer_root: Some(root),
                    ..
                },
                true,
            )
            | (Self::Directory { root, .. }, false) => {
                let path = root.join(name);
                if !path.is_file() {
                    return Err(Error::NotFound(path.display().to_string()));
                }
                Ok(FileData::Path(path))
            }
            (Self::Directory { .. } | Self::Packaged(_), true) => Err(Error::InvalidSource(
                "this model source has no transformer files".to_string(),
            )),
            (Self::Packaged(container), false) => {
                if !container.contains(name) {
                    return Err(Error::corrupt(format!("missing member `{name}`")));
                }
                Ok(FileData::Packaged {
                    container: container.clone(),
                    name: name.to_string(),
                })
            }
        }
    }
}

#[derive(Clone)]
pub enum FileData {
    Path(PathBuf),
    Packaged {
        container: Arc<Container>,
        name: String,
    },
}

impl Debug for FileData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(p) => write!(f, "path: {}", p.display()),
            Self::Packaged { name, .. } => write!(f, "dduf: {name}"),
        }
    }
}

impl FileData {
    pub fn read_to_string(&self) -> Result<String> {
        match self {
            Self::Path(p) => Ok(fs::read_to_string(p)?),
            Self::Packaged { container, name } => container.read_to_string(name),
        }
    }

    /// Open this file as indexed safetensors weights.
    pub fn weight_file(&self) -> Result<WeightFile> {
        match self {
            Self::Path(p) => WeightFile::open(p),
            Self::Packaged { container, name } => container.weight_file(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, path::PathBuf, sync::Mutex};

    use super::ModelSource;
    use crate::{
        hub::{HubResolver, RepoLayout},
        Error, Result,
    };

    struct Offline;

    impl HubResolver for Offline {
        fn resolve(&self, model_id: &str, _layout: &RepoLayout) -> Result<PathBuf> {
            Err(Error::NotFound(model_id.to_string()))
        }
    }

    /// Serves pre-populated snapshot directories and records the requested layouts.
    struct Snapshots {
        roots: HashMap<String, PathBuf>,
        requests: Mutex<Vec<(String, RepoLayout)>>,
    }

    impl HubResolver for Snapshots {
        fn resolve(&self, model_id: &str, layout: &RepoLayout) -> Result<PathBuf> {
            self.requests
                .lock()
                .unwrap()
                .push((model_id.to_string(), layout.clone()));
            self.roots
                .get(model_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(model_id.to_string()))
        }
    }

    #[test]
    fn malformed_ids_never_reach_the_hub() {
        let err = ModelSource::from_model_id("not a/valid/id")
            .resolve(&Offline)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSource(_)));
    }

    #[test]
    fn hub_failures_propagate() {
        let err = ModelSource::from_model_id("owner/missing-model")
            .resolve(&Offline)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn wrong_extension_is_invalid_source() {
        let path = std::env::temp_dir().join(format!("engine_src_{}.bin", std::process::id()));
        std::fs::write(&path, b"PK\x03\x04").unwrap();
        let err = ModelSource::dduf(&path).resolve(&Offline).unwrap_err();
        assert!(matches!(err, Error::InvalidSource(_)));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn wrong_signature_is_invalid_source() {
        let path = std::env::temp_dir().join(format!("engine_src_{}.dduf", std::process::id()));
        std::fs::write(&path, b"GGUF....").unwrap();
        let err = ModelSource::dduf(&path).resolve(&Offline).unwrap_err();
        assert!(matches!(err, Error::InvalidSource(_)));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn transformer_override_requires_model_id() {
        let err = ModelSource::dduf("model.dduf")
            .override_transformer_model_id("owner/transformer")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSource(_)));
    }

    #[test]
    fn transformer_override_needs_no_model_index() {
        let scratch = std::env::temp_dir().join(format!("engine_snapshots_{}", std::process::id()));
        let base = scratch.join("base");
        let transformer = scratch.join("transformer");
        std::fs::create_dir_all(base.join("vae")).unwrap();
        std::fs::create_dir_all(&transformer).unwrap();
        std::fs::write(base.join("model_index.json"), "{}").unwrap();
        std::fs::write(base.join("vae").join("config.json"), "{}").unwrap();
        std::fs::write(transformer.join("config.json"), "{}").unwrap();
        std::fs::write(transformer.join("diffusion_pytorch_model.safetensors"), b"").unwrap();

        let resolver = Snapshots {
            roots: HashMap::from([
                ("owner/base".to_string(), base),
                ("owner/transformer".to_string(), transformer),
            ]),
            requests: Mutex::new(Vec::new()),
        };
        let resolved = ModelSource::from_model_id("owner/base")
            .override_transformer_model_id("owner/transformer")
            .unwrap()
            .resolve(&resolver)
            .unwrap();

        assert_eq!(
            resolved.list_transformer_files().unwrap(),
            Some(vec![
                "config.json".to_string(),
                "diffusion_pytorch_model.safetensors".to_string()
            ])
        );
        assert!(resolved.read_file("config.json", true).is_ok());
        assert!(resolved.read_file("vae/config.json", false).is_ok());

        let requests = resolver.requests.into_inner().unwrap();
        assert_eq!(
            requests,
            [
                (
                    "owner/base".to_string(),
                    RepoLayout::Pipeline {
                        skip_components: vec!["transformer".to_string()]
                    }
                ),
                ("owner/transformer".to_string(), RepoLayout::Component),
            ]
        );
        std::fs::remove_dir_all(scratch).unwrap();
    }
}
