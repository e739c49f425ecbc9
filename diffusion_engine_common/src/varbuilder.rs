//! A `VarBuilder` is used to retrieve the weights used by a model. The weights come from a
//! backend: typically the dequantizing loader over safetensors files, or an in-memory map.
use candle_core::{DType, Device, Error, Result, Shape, Tensor};
use std::collections::HashMap;
use std::sync::Arc;

/// A structure used to retrieve variables from a backend at a dotted path.
pub struct VarBuilderArgs<B: Backend> {
    data: Arc<TensorData<B>>,
    path: Vec<String>,
    pub dtype: DType,
}

impl<B: Backend> Clone for VarBuilderArgs<B> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            path: self.path.clone(),
            dtype: self.dtype,
        }
    }
}

/// A simple `VarBuilder`, this is less generic than `VarBuilderArgs` but should cover most common
/// use cases.
pub type VarBuilder = VarBuilderArgs<Box<dyn SimpleBackend>>;

struct TensorData<B: Backend> {
    backend: Arc<B>,
    pub device: Device,
}

/// A trait that defines how tensor data is retrieved.
pub trait Backend: Send + Sync {
    /// Retrieve a tensor with some target shape.
    fn get(&self, s: Shape, name: &str, dtype: DType, dev: &Device) -> Result<Tensor>;

    /// Retrieve a tensor based on the name.
    fn get_unchecked(&self, name: &str, dtype: DType, dev: &Device) -> Result<Tensor>;

    fn contains_tensor(&self, name: &str) -> bool;
}

pub trait SimpleBackend: Send + Sync {
    /// Retrieve a tensor based on a target name and shape.
    fn get(&self, s: Shape, name: &str, dtype: DType, dev: &Device) -> Result<Tensor> {
        let tensor = self.get_unchecked(name, dtype, dev)?;
        if tensor.shape() != &s {
            Err(Error::UnexpectedShape {
                msg: format!("shape mismatch for {name}"),
                expected: s,
                got: tensor.shape().clone(),
            }
            .bt())?
        }
        Ok(tensor)
    }

    /// Retrieve a tensor based on the name.
    fn get_unchecked(&self, name: &str, dtype: DType, dev: &Device) -> Result<Tensor>;

    fn contains_tensor(&self, name: &str) -> bool;
}

impl Backend for Box<dyn SimpleBackend> {
    fn get(&self, s: Shape, name: &str, dtype: DType, dev: &Device) -> Result<Tensor> {
        self.as_ref().get(s, name, dtype, dev)
    }

    fn get_unchecked(&self, name: &str, dtype: DType, dev: &Device) -> Result<Tensor> {
        self.as_ref().get_unchecked(name, dtype, dev)
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.as_ref().contains_tensor(name)
    }
}

impl<B: Backend> VarBuilderArgs<B> {
    pub fn new_with_args(backend: B, dtype: DType, dev: &Device) -> Self {
        let data = TensorData {
            backend: Arc::new(backend),
            device: dev.clone(),
        };
        Self {
            data: Arc::new(data),
            path: vec![],
            dtype,
        }
    }

    /// Return a new `VarBuilder` adding `s` to the current prefix. This can be think of as `cd`
    /// into a directory.
    pub fn push_prefix<S: ToString>(&self, s: S) -> Self {
        let mut path = self.path.clone();
        path.push(s.to_string());
        Self {
            data: self.data.clone(),
            path,
            dtype: self.dtype,
        }
    }

    /// Short alias for `push_prefix`.
    pub fn pp<S: ToString>(&self, s: S) -> Self {
        self.push_prefix(s)
    }

    /// The device used by default.
    pub fn device(&self) -> &Device {
        &self.data.device
    }

    /// The dtype used by default.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    fn path(&self, tensor_name: &str) -> String {
        if self.path.is_empty() {
            tensor_name.to_string()
        } else {
            [&self.path.join("."), tensor_name].join(".")
        }
    }

    /// This returns true only if a tensor with the passed in name is available. E.g. when passed
    /// `a`, true is returned if `prefix.a` exists but false is returned if only `prefix.a.b`
    /// exists.
    pub fn contains_tensor(&self, tensor_name: &str) -> bool {
        let path = self.path(tensor_name);
        self.data.backend.contains_tensor(&path)
    }

    /// Retrieve the tensor associated with the given name at the current path.
    pub fn get<S: Into<Shape>>(&self, s: S, name: &str) -> Result<Tensor> {
        self.get_with_dtype(s, name, self.dtype)
    }

    /// Retrieve the tensor associated with the given name & dtype at the current path.
    pub fn get_with_dtype<S: Into<Shape>>(&self, s: S, name: &str, dtype: DType) -> Result<Tensor> {
        let path = self.path(name);
        self.data
            .backend
            .get(s.into(), &path, dtype, &self.data.device)
    }
}

impl VarBuilder {
    /// Initializes a `VarBuilder` using a custom backend.
    pub fn from_backend(backend: Box<dyn SimpleBackend>, dtype: DType, device: Device) -> Self {
        Self::new_with_args(backend, dtype, &device)
    }

    /// Initializes a `VarBuilder` that retrieves tensors stored in a hashtable. An error is
    /// returned if no tensor is available under the requested path or on shape mismatches.
    pub fn from_tensors(ts: HashMap<String, Tensor>, dtype: DType, dev: &Device) -> Self {
        Self::from_backend(Box::new(ts), dtype, dev.clone())
    }
}

impl SimpleBackend for HashMap<String, Tensor> {
    fn get_unchecked(&self, name: &str, dtype: DType, dev: &Device) -> Result<Tensor> {
        let tensor = self
            .get(name)
            .ok_or_else(|| {
                Error::CannotFindTensor {
                    path: name.to_string(),
                }
                .bt()
            })?
            .clone();
        tensor.to_device(dev)?.to_dtype(dtype)
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device, Tensor};

    use super::VarBuilder;
    use crate::Error;

    fn builder() -> candle_core::Result<VarBuilder> {
        let ts = HashMap::from([
            ("block.0.w".to_string(), Tensor::ones((2, 3), DType::F32, &Device::Cpu)?),
            ("block.1.w".to_string(), Tensor::ones(3, DType::F32, &Device::Cpu)?),
        ]);
        Ok(VarBuilder::from_tensors(ts, DType::F32, &Device::Cpu))
    }

    #[test]
    fn prefixes_compose() -> candle_core::Result<()> {
        let vb = builder()?;
        let w = vb.pp("block").pp(0).get((2, 3), "w")?;
        assert_eq!(w.dims(), &[2, 3]);
        assert!(vb.pp("block.1").contains_tensor("w"));
        assert!(!vb.pp("block").contains_tensor("w"));
        Ok(())
    }

    #[test]
    fn wrong_shape_is_shape_mismatch() -> candle_core::Result<()> {
        let err = builder()?.pp("block.0").get((3, 2), "w").unwrap_err();
        assert!(matches!(
            Error::from(err),
            Error::ShapeMismatch { name, .. } if name == "block.0.w"
        ));
        Ok(())
    }

    #[test]
    fn absent_tensor_is_missing_weight() -> candle_core::Result<()> {
        let err = builder()?.get(3, "block.2.w").unwrap_err();
        assert!(matches!(Error::from(err), Error::MissingWeight(name) if name == "block.2.w"));
        Ok(())
    }}
