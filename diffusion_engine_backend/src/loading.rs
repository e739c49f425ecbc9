use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use candle_core::{DType, Device, Tensor};
use diffusion_engine_common::{
    Error, IterWithProgress, Result, SimpleBackend, VarBuilder, WeightFile,
};
use tracing::{debug, warn};

use crate::dequantize;

/// Serves tensors from one or more indexed weight files, dequantizing on first access.
///
/// Materialized tensors are memoized by name, so a weight requested twice while building a
/// model is only expanded once. The cache lives as long as the backend, which is dropped
/// together with the last `VarBuilder` once loading is done.
pub struct DequantizingBackend {
    files: Vec<WeightFile>,
    owner: HashMap<String, usize>,
    cache: Mutex<HashMap<String, Tensor>>,
}

impl DequantizingBackend {
    pub fn new(files: Vec<WeightFile>) -> Self {
        let mut owner = HashMap::new();
        for (i, file) in files.iter().enumerate() {
            for name in file.names() {
                if let Some(prev) = owner.insert(name.to_string(), i) {
                    warn!(
                        "tensor `{name}` is present in both `{}` and `{}`, using the latter",
                        files[prev].name(),
                        file.name()
                    );
                }
            }
        }
        Self {
            files,
            owner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn load(&self, name: &str, dtype: DType, dev: &Device) -> Result<Tensor> {
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        if let Some(tensor) = cached {
            return Ok(tensor.to_dtype(dtype)?.to_device(dev)?);
        }

        let file = self
            .owner
            .get(name)
            .map(|i| &self.files[*i])
            .ok_or_else(|| Error::MissingWeight(name.to_string()))?;
        let view = file
            .view(name)
            .ok_or_else(|| Error::MissingWeight(name.to_string()))?;
        let tensor = dequantize(&view, dtype, dev)?;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), tensor.clone());
        Ok(tensor)
    }

    /// Materialize every tensor of every file.
    pub fn load_all(
        &self,
        dtype: DType,
        dev: &Device,
        silent: bool,
    ) -> Result<HashMap<String, Tensor>> {
        let mut names = self.owner.keys().cloned().collect::<Vec<_>>();
        names.sort();
        let mut tensors = HashMap::with_capacity(names.len());
        for name in names.into_iter().with_progress(silent) {
            let tensor = self.load(&name, dtype, dev)?;
            tensors.insert(name, tensor);
        }
        Ok(tensors)
    }
}

impl SimpleBackend for DequantizingBackend {
    fn get_unchecked(
        &self,
        name: &str,
        dtype: DType,
        dev: &Device,
    ) -> candle_core::Result<Tensor> {
        self.load(name, dtype, dev).map_err(|e| match e {
            Error::MissingWeight(path) => candle_core::Error::CannotFindTensor { path }.bt(),
            other => other.into_candle(),
        })
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.owner.contains_key(name)
    }
}

/// Build a `VarBuilder` which lazily dequantizes tensors from `files`.
pub fn from_weight_files(files: Vec<WeightFile>, dtype: DType, device: &Device) -> VarBuilder {
    let backend = DequantizingBackend::new(files);
    debug!(
        "serving {} tensors from {} weight files",
        backend.owner.len(),
        backend.files.len()
    );
    VarBuilder::from_backend(Box::new(backend), dtype, device.clone())
}
