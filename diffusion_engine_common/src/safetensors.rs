//! Indexing of safetensors payloads, either standalone files or members of a packaged container.
//!
//! Nothing is copied while indexing: only the header is parsed, and tensor bytes are borrowed
//! from the backing storage when a [`TensorView`] is requested.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    path::Path,
    sync::Arc,
};

use candle_core::{DType, Device, Tensor};
use memmap2::Mmap;
use safetensors::{Dtype, SafeTensors};

use crate::{Error, Result};

const BNB_STATE_PREFIX: &str = "bitsandbytes__";
const BNB_COMPANIONS: [&str; 4] = ["absmax", "quant_map", "nested_absmax", "nested_quant_map"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bnb4BitKind {
    Nf4,
    Fp4,
}

/// How the bytes of a tensor encode its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantScheme {
    None,
    /// Packed 4-bit codes with per-block absmax scales, optionally themselves quantized.
    Bnb4Bit(Bnb4BitKind),
    /// Int8 weights with a per-row `SCB` scale.
    Int8RowWise,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorEntry {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub scheme: QuantScheme,
    /// Absolute byte range into the backing storage.
    pub start: usize,
    pub end: usize,
}

/// Tensor name to entry mapping of one safetensors payload.
#[derive(Debug, Clone, Default)]
pub struct TensorIndex {
    entries: BTreeMap<String, TensorEntry>,
    companions: BTreeSet<String>,
}

impl TensorIndex {
    /// Parse the header of the safetensors payload stored at `storage[start..end]`.
    ///
    /// Offsets in the returned entries are absolute into `storage`.
    pub fn parse(storage: &[u8], start: usize, end: usize, label: &str) -> Result<Self> {
        if start > end || end > storage.len() {
            return Err(Error::corrupt(format!(
                "`{label}` spans bytes {start}..{end} but the file has {} bytes",
                storage.len()
            )));
        }
        let payload = &storage[start..end];
        let (header_len, metadata) = SafeTensors::read_metadata(payload)
            .map_err(|e| Error::corrupt(format!("`{label}`: {e:?}")))?;
        let data_start = start + 8 + header_len;

        let mut entries = BTreeMap::new();
        for (name, info) in metadata.tensors() {
            let (rel_start, rel_end) = info.data_offsets;
            let abs_start = data_start.checked_add(rel_start);
            let abs_end = data_start.checked_add(rel_end);
            match (abs_start, abs_end) {
                (Some(s), Some(e)) if s <= e && e <= end => {
                    entries.insert(
                        name,
                        TensorEntry {
                            dtype: info.dtype,
                            shape: info.shape.clone(),
                            scheme: QuantScheme::None,
                            start: s,
                            end: e,
                        },
                    );
                }
                _ => {
                    return Err(Error::corrupt(format!(
                        "tensor `{name}` in `{label}` declares bytes {rel_start}..{rel_end} beyond its payload"
                    )))
                }
            }
        }

        let mut index = Self {
            entries,
            companions: BTreeSet::new(),
        };
        index.detect_schemes()?;
        Ok(index)
    }

    fn detect_schemes(&mut self) -> Result<()> {
        let mut schemes = Vec::new();
        for name in self.entries.keys() {
            if let Some((primary, state)) = name.split_once(".quant_state.") {
                let kind = state.strip_prefix(BNB_STATE_PREFIX).ok_or_else(|| {
                    Error::UnsupportedQuantization(format!("`{state}` for `{primary}`"))
                })?;
                let kind = match kind {
                    "nf4" => Bnb4BitKind::Nf4,
                    "fp4" => Bnb4BitKind::Fp4,
                    other => {
                        return Err(Error::UnsupportedQuantization(format!(
                            "bitsandbytes `{other}` for `{primary}`"
                        )))
                    }
                };
                if !self.entries.contains_key(primary) {
                    return Err(Error::corrupt(format!(
                        "quantization state `{name}` has no weight `{primary}`"
                    )));
                }
                let mut companions = vec![name.clone()];
                companions.extend(BNB_COMPANIONS.iter().map(|c| format!("{primary}.{c}")));
                schemes.push((primary.to_string(), QuantScheme::Bnb4Bit(kind), companions));
            } else if let Some(module) = name.strip_suffix(".SCB") {
                let weight = format!("{module}.weight");
                if self.entries.get(&weight).map(|e| e.dtype) == Some(Dtype::I8) {
                    let companions = vec![name.clone(), format!("{module}.weight_format")];
                    schemes.push((weight, QuantScheme::Int8RowWise, companions));
                }
            }
        }

        for (primary, scheme, companions) in schemes {
            if let Some(entry) = self.entries.get_mut(&primary) {
                entry.scheme = scheme;
            }
            self.companions.extend(
                companions
                    .into_iter()
                    .filter(|c| self.entries.contains_key(c)),
            );
        }

        for (name, entry) in &self.entries {
            if self.companions.contains(name) {
                continue;
            }
            if matches!(entry.dtype, Dtype::F8_E4M3 | Dtype::F8_E5M2) {
                return Err(Error::UnsupportedQuantization(format!(
                    "float8 tensor `{name}`"
                )));
            }
        }
        Ok(())
    }

    /// Names of the loadable tensors, excluding quantization companions.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries
            .keys()
            .filter(|name| !self.companions.contains(*name))
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name) && !self.companions.contains(name)
    }

    pub fn get(&self, name: &str) -> Option<&TensorEntry> {
        self.entries.get(name)
    }

    /// A view of the loadable tensor `name`, borrowing its bytes from `storage`.
    pub fn view<'a>(&'a self, storage: &'a [u8], name: &str) -> Option<TensorView<'a>> {
        if self.companions.contains(name) {
            return None;
        }
        let (name, entry) = self.entries.get_key_value(name)?;
        Some(TensorView {
            name,
            entry,
            index: self,
            storage,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.companions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A typed, borrowed view over the raw bytes of one tensor.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    name: &'a str,
    entry: &'a TensorEntry,
    index: &'a TensorIndex,
    storage: &'a [u8],
}

impl<'a> TensorView<'a> {
    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn dtype(&self) -> Dtype {
        self.entry.dtype
    }

    pub fn shape(&self) -> &'a [usize] {
        &self.entry.shape
    }

    pub fn scheme(&self) -> QuantScheme {
        self.entry.scheme
    }

    pub fn data(&self) -> &'a [u8] {
        &self.storage[self.entry.start..self.entry.end]
    }

    /// Look up a quantization companion of this tensor, e.g. `absmax` for `x.weight.absmax`.
    pub fn companion(&self, suffix: &str) -> Option<TensorView<'a>> {
        let name = format!("{}.{suffix}", self.name);
        self.sibling(&name)
    }

    /// Look up another tensor of the same payload by its full name.
    pub fn sibling(&self, name: &str) -> Option<TensorView<'a>> {
        let (name, entry) = self.index.entries.get_key_value(name)?;
        Some(TensorView {
            name,
            entry,
            index: self.index,
            storage: self.storage,
        })
    }

    /// Copy an unquantized tensor into the numeric backend.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let dtype = candle_dtype(self.dtype())?;
        Tensor::from_raw_buffer(self.data(), dtype, self.shape(), device).map_err(Error::from)
    }
}

pub fn candle_dtype(dtype: Dtype) -> Result<DType> {
    match dtype {
        Dtype::U8 => Ok(DType::U8),
        Dtype::U32 => Ok(DType::U32),
        Dtype::I64 => Ok(DType::I64),
        Dtype::F16 => Ok(DType::F16),
        Dtype::BF16 => Ok(DType::BF16),
        Dtype::F32 => Ok(DType::F32),
        Dtype::F64 => Ok(DType::F64),
        other => Err(Error::UnsupportedQuantization(format!(
            "tensor dtype {other:?} has no backend representation"
        ))),
    }
}

/// An indexed safetensors payload together with its backing storage.
#[derive(Clone)]
pub struct WeightFile {
    name: String,
    storage: Arc<Mmap>,
    index: Arc<TensorIndex>,
}

impl std::fmt::Debug for WeightFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightFile")
            .field("name", &self.name)
            .field("tensors", &self.index.len())
            .finish()
    }
}

impl WeightFile {
    /// Memory-map and index a standalone `.safetensors` file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
            _ => Error::Io(e),
        })?;
        let mmap = unsafe { Mmap::map(&file)? };
        let len = mmap.len();
        let label = path.display().to_string();
        let index = TensorIndex::parse(&mmap, 0, len, &label)?;
        Ok(Self {
            name: label,
            storage: Arc::new(mmap),
            index: Arc::new(index),
        })
    }

    pub(crate) fn from_parts(name: String, storage: Arc<Mmap>, index: Arc<TensorIndex>) -> Self {
        Self {
            name,
            storage,
            index,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> &TensorIndex {
        &self.index
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.index.names()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains(name)
    }

    pub fn view(&self, name: &str) -> Option<TensorView<'_>> {
        self.index.view(&self.storage, name)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use safetensors::{tensor::TensorView as StView, Dtype};

    use super::{Bnb4BitKind, QuantScheme, TensorIndex};
    use crate::Error;

    fn serialize(tensors: &[(&str, Dtype, Vec<usize>, Vec<u8>)]) -> Vec<u8> {
        let views = tensors
            .iter()
            .map(|(name, dtype, shape, data)| {
                (
                    name.to_string(),
                    StView::new(*dtype, shape.clone(), data).unwrap(),
                )
            })
            .collect::<HashMap<_, _>>();
        safetensors::serialize(&views, &None).unwrap()
    }

    #[test]
    fn indexes_plain_tensors_with_absolute_offsets() {
        let bytes = serialize(&[("a", Dtype::F32, vec![2], vec![0u8; 8])]);
        let mut storage = vec![0xAAu8; 16];
        storage.extend_from_slice(&bytes);
        let len = storage.len();
        let index = TensorIndex::parse(&storage, 16, len, "test").unwrap();
        let entry = index.get("a").unwrap();
        assert_eq!(entry.end - entry.start, 8);
        assert_eq!(entry.end, len);
        assert_eq!(entry.scheme, QuantScheme::None);
    }

    #[test]
    fn detects_bnb_nf4_and_hides_companions() {
        let state = br#"{"quant_type":"nf4","blocksize":64,"dtype":"float32","shape":[2,2]}"#;
        let bytes = serialize(&[
            ("w.weight", Dtype::U8, vec![2, 1], vec![0x12, 0x34]),
            ("w.weight.absmax", Dtype::F32, vec![1], 1f32.to_le_bytes().to_vec()),
            ("w.weight.quant_map", Dtype::F32, vec![1], 1f32.to_le_bytes().to_vec()),
            (
                "w.weight.quant_state.bitsandbytes__nf4",
                Dtype::U8,
                vec![state.len()],
                state.to_vec(),
            ),
        ]);
        let index = TensorIndex::parse(&bytes, 0, bytes.len(), "test").unwrap();
        assert_eq!(
            index.get("w.weight").unwrap().scheme,
            QuantScheme::Bnb4Bit(Bnb4BitKind::Nf4)
        );
        assert_eq!(index.names().collect::<Vec<_>>(), vec!["w.weight"]);
    }

    #[test]
    fn rejects_unknown_bnb_kind() {
        let bytes = serialize(&[
            ("w.weight", Dtype::U8, vec![1], vec![0]),
            ("w.weight.quant_state.bitsandbytes__int2", Dtype::U8, vec![1], vec![0]),
        ]);
        let err = TensorIndex::parse(&bytes, 0, bytes.len(), "test").unwrap_err();
        assert!(matches!(err, Error::UnsupportedQuantization(_)));
    }

    #[test]
    fn detects_int8_row_wise() {
        let bytes = serialize(&[
            ("l.weight", Dtype::I8, vec![1, 2], vec![1, 255]),
            ("l.SCB", Dtype::F32, vec![1], 127f32.to_le_bytes().to_vec()),
        ]);
        let index = TensorIndex::parse(&bytes, 0, bytes.len(), "test").unwrap();
        assert_eq!(index.get("l.weight").unwrap().scheme, QuantScheme::Int8RowWise);
        assert!(!index.contains("l.SCB"));
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let bytes = serialize(&[("a", Dtype::F32, vec![4], vec![0u8; 16])]);
        let truncated = &bytes[..bytes.len() - 4];
        let err = TensorIndex::parse(truncated, 0, truncated.len(), "test").unwrap_err();
        assert!(matches!(err, Error::CorruptContainer(_)));
    }

    #[test]
    fn range_outside_storage_is_corrupt() {
        let bytes = serialize(&[("a", Dtype::F32, vec![1], vec![0u8; 4])]);
        let err = TensorIndex::parse(&bytes, 0, bytes.len() + 1, "test").unwrap_err();
        assert!(matches!(err, Error::CorruptContainer(_)));
    }
}
