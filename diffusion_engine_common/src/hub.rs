use std::path::{Path, PathBuf};

use hf_hub::{
    api::sync::{ApiBuilder, ApiError},
    Repo, RepoType,
};
use serde_json::{Map, Value};
use tracing::info;

use crate::{get_token, Error, Result, TokenSource};

/// Extensions of the repository files needed to build a pipeline.
const WANTED_EXTENSIONS: [&str; 4] = [".json", ".safetensors", ".txt", ".model"];

const MODEL_INDEX: &str = "model_index.json";

/// Which files of a repository are needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoLayout {
    /// A diffusers pipeline: `model_index.json` and the directories of the components it names,
    /// except `skip_components`.
    Pipeline { skip_components: Vec<String> },
    /// A single component stored at the repository root, e.g. a transformer override.
    Component,
}

impl RepoLayout {
    pub fn pipeline() -> Self {
        Self::Pipeline {
            skip_components: Vec::new(),
        }
    }
}

/// Turns a remote model identifier into a local directory holding its files.
pub trait HubResolver: Send + Sync {
    /// Fails with [`Error::NotFound`] or [`Error::NetworkError`].
    fn resolve(&self, model_id: &str, layout: &RepoLayout) -> Result<PathBuf>;
}

/// Resolves model ids through the Hugging Face hub cache, downloading missing files.
#[derive(Debug, Clone, Default)]
pub struct HfHubResolver {
    pub token: TokenSource,
    pub revision: Option<String>,
    pub silent: bool,
}

impl HfHubResolver {
    pub fn new(token: TokenSource, revision: Option<String>, silent: bool) -> Self {
        Self {
            token,
            revision,
            silent,
        }
    }
}

fn classify(model_id: &str, err: ApiError) -> Error {
    match err {
        ApiError::RequestError(e) => match *e {
            ureq::Error::Status(401 | 403 | 404, _) => {
                Error::NotFound(format!("model `{model_id}` on the hub"))
            }
            other => Error::NetworkError(format!("{model_id}: {other}")),
        },
        ApiError::IoError(e) => Error::Io(e),
        other => Error::NetworkError(format!("{model_id}: {other}")),
    }
}

/// Component directories named by a `model_index.json`. Entries such as
/// `"feature_extractor": [null, null]` mark absent components.
pub(crate) fn pipeline_components(model_index: &str) -> Result<Vec<String>> {
    let index: Map<String, Value> = serde_json::from_str(model_index)
        .map_err(|e| Error::InvalidSource(format!("`{MODEL_INDEX}`: {e}")))?;
    Ok(index
        .into_iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .filter(|(_, value)| {
            value
                .as_array()
                .is_some_and(|entry| entry.iter().any(|v| !v.is_null()))
        })
        .map(|(name, _)| name)
        .collect())
}

/// The repository files to download for `layout`.
pub(crate) fn select_files<'a>(
    siblings: &'a [String],
    layout: &RepoLayout,
    components: &[String],
) -> Vec<&'a str> {
    siblings
        .iter()
        .map(String::as_str)
        .filter(|file| WANTED_EXTENSIONS.iter().any(|ext| file.ends_with(ext)))
        .filter(|file| match layout {
            RepoLayout::Component => !file.contains('/'),
            RepoLayout::Pipeline { skip_components } => {
                *file == MODEL_INDEX
                    || file.split_once('/').is_some_and(|(dir, _)| {
                        components.iter().any(|c| c == dir)
                            && !skip_components.iter().any(|c| c == dir)
                    })
            }
        })
        .collect()
}

/// The snapshot directory containing `path`, the local copy of repository file `rfilename`.
pub(crate) fn snapshot_root(path: &Path, rfilename: &str) -> Option<PathBuf> {
    path.ancestors()
        .nth(rfilename.split('/').count())
        .map(Path::to_path_buf)
}

impl HubResolver for HfHubResolver {
    fn resolve(&self, model_id: &str, layout: &RepoLayout) -> Result<PathBuf> {
        let api = ApiBuilder::new()
            .with_progress(!self.silent)
            .with_token(get_token(&self.token)?)
            .build()
            .map_err(|e| classify(model_id, e))?;
        let revision = self.revision.clone().unwrap_or("main".to_string());
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision,
        ));

        let info = repo.info().map_err(|e| classify(model_id, e))?;
        let siblings = info
            .siblings
            .into_iter()
            .map(|s| s.rfilename)
            .collect::<Vec<_>>();

        let components = match layout {
            RepoLayout::Pipeline { .. } => {
                if !siblings.iter().any(|s| s == MODEL_INDEX) {
                    return Err(Error::InvalidSource(format!(
                        "`{model_id}` has no `{MODEL_INDEX}`"
                    )));
                }
                let index = repo.get(MODEL_INDEX).map_err(|e| classify(model_id, e))?;
                pipeline_components(&std::fs::read_to_string(index)?)?
            }
            RepoLayout::Component => Vec::new(),
        };

        let wanted = select_files(&siblings, layout, &components);
        if wanted.is_empty() {
            return Err(Error::InvalidSource(format!(
                "`{model_id}` has no loadable files"
            )));
        }
        let mut root = None;
        for file in wanted {
            let path = repo.get(file).map_err(|e| classify(model_id, e))?;
            if root.is_none() {
                root = snapshot_root(&path, file);
            }
        }
        if !self.silent {
            info!("resolved `{model_id}` from the hub cache");
        }
        root.ok_or_else(|| Error::NotFound(format!("snapshot of `{model_id}`")))
    }
}

/// Check that `model_id` looks like `name` or `owner/name`.
pub fn validate_model_id(model_id: &str) -> Result<()> {
    let invalid = |why: &str| Err(Error::InvalidSource(format!("model id `{model_id}` {why}")));
    let parts = model_id.split('/').collect::<Vec<_>>();
    if parts.len() > 2 {
        return invalid("has more than one `/`");
    }
    for part in parts {
        if part.is_empty() || part.len() > 96 {
            return invalid("has an empty or overlong component");
        }
        if !part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return invalid("contains characters other than alphanumerics, `-`, `_` and `.`");
        }
        if part.starts_with(['-', '.']) || part.ends_with(['-', '.']) {
            return invalid("starts or ends with a separator");
        }
        if part.contains("--") || part.contains("..") {
            return invalid("contains `--` or `..`");
        }
    }
    Ok(())
}
