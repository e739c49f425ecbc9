//! Reader for DDUF packaged models: a zip archive of uncompressed members holding the
//! `model_index.json`, per-component configs, tokenizer files and safetensors weights.

use std::{
    collections::BTreeMap,
    fs::File,
    io::Cursor,
    path::{Path, PathBuf},
    sync::Arc,
};

use memmap2::Mmap;
use tracing::debug;
use zip::{CompressionMethod, ZipArchive};

use crate::{
    safetensors::{TensorIndex, WeightFile},
    Error, Result,
};

pub(crate) const ZIP_SIGNATURE: [u8; 4] = *b"PK\x03\x04";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Member {
    start: usize,
    end: usize,
}

/// A parsed DDUF container. Member payloads and tensor headers are validated at open time,
/// tensor bytes are only read when a weight is requested.
pub struct Container {
    path: PathBuf,
    mmap: Arc<Mmap>,
    members: BTreeMap<String, Member>,
    tensors: BTreeMap<String, Arc<TensorIndex>>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("path", &self.path)
            .field("members", &self.members.len())
            .finish()
    }
}

impl Container {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
            _ => Error::Io(e),
        })?;
        let mmap = unsafe { Mmap::map(&file)? };
        Self::from_mmap(path.to_path_buf(), mmap)
    }

    fn from_mmap(path: PathBuf, mmap: Mmap) -> Result<Self> {
        let file_len = mmap.len();
        let members = {
            let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))
                .map_err(|e| Error::corrupt(format!("{}: {e}", path.display())))?;
            let mut members = BTreeMap::new();
            for i in 0..archive.len() {
                let file = archive
                    .by_index_raw(i)
                    .map_err(|e| Error::corrupt(format!("{}: member {i}: {e}", path.display())))?;
                if file.is_dir() {
                    continue;
                }
                let name = file.name().to_string();
                if file.compression() != CompressionMethod::Stored {
                    return Err(Error::corrupt(format!(
                        "member `{name}` is compressed with {:?}, DDUF members must be stored",
                        file.compression()
                    )));
                }
                let start = usize::try_from(file.data_start())
                    .map_err(|_| Error::corrupt(format!("member `{name}` offset overflows")))?;
                let len = usize::try_from(file.size())
                    .map_err(|_| Error::corrupt(format!("member `{name}` size overflows")))?;
                let end = start
                    .checked_add(len)
                    .filter(|end| *end <= file_len)
                    .ok_or_else(|| {
                        Error::corrupt(format!(
                            "member `{name}` spans {start}+{len} bytes but the file has {file_len}"
                        ))
                    })?;
                members.insert(name, Member { start, end });
            }
            members
        };

        let mut ranges = members.iter().collect::<Vec<_>>();
        ranges.sort_by_key(|(_, m)| m.start);
        for pair in ranges.windows(2) {
            let [(a_name, a), (b_name, b)] = pair else {
                continue;
            };
            if a.end > b.start {
                return Err(Error::corrupt(format!(
                    "members `{a_name}` and `{b_name}` overlap"
                )));
            }
        }

        let mut tensors = BTreeMap::new();
        for (name, member) in &members {
            if name.ends_with(".safetensors") {
                let index = TensorIndex::parse(&mmap, member.start, member.end, name)?;
                debug!("indexed {} tensors in `{name}`", index.len());
                tensors.insert(name.clone(), Arc::new(index));
            }
        }

        Ok(Self {
            path,
            mmap: Arc::new(mmap),
            members,
            tensors,
        })
    }

    /// Member paths, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    pub fn read_bytes(&self, name: &str) -> Result<&[u8]> {
        let member = self.members.get(name).ok_or_else(|| self.missing(name))?;
        Ok(&self.mmap[member.start..member.end])
    }

    pub fn read_to_string(&self, name: &str) -> Result<String> {
        String::from_utf8(self.read_bytes(name)?.to_vec())
            .map_err(|e| Error::corrupt(format!("member `{name}` is not utf-8: {e}")))
    }

    /// The indexed safetensors member `name`.
    pub fn weight_file(&self, name: &str) -> Result<WeightFile> {
        let index = self.tensors.get(name).ok_or_else(|| self.missing(name))?;
        Ok(WeightFile::from_parts(
            format!("{}:{name}", self.path.display()),
            self.mmap.clone(),
            index.clone(),
        ))
    }

    fn missing(&self, name: &str) -> Error {
        Error::corrupt(format!(
            "{} has no member `{name}`",
            self.path.display()
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        io::{Cursor, Write},
    };

    use safetensors::{tensor::TensorView, Dtype};
    use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

    use super::Container;
    use crate::Error;

    fn write_container(name: &str, members: &[(&str, Vec<u8>)], method: CompressionMethod) -> std::path::PathBuf {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(method);
        for (member, data) in members {
            zip.start_file(*member, options).unwrap();
            zip.write_all(data).unwrap();
        }
        let bytes = zip.finish().unwrap().into_inner();
        let path = std::env::temp_dir().join(format!(
            "diffusion_engine_container_{}_{name}.dduf",
            std::process::id()
        ));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn weights() -> Vec<u8> {
        let data = [1f32, 2., 3., 4.]
            .iter()
            .flat_map(|x| x.to_le_bytes())
            .collect::<Vec<_>>();
        let views = HashMap::from([(
            "proj.weight".to_string(),
            TensorView::new(Dtype::F32, vec![2, 2], &data).unwrap(),
        )]);
        safetensors::serialize(&views, &None).unwrap()
    }

    #[test]
    fn opens_stored_members() -> anyhow::Result<()> {
        let path = write_container(
            "stored",
            &[
                ("model_index.json", br#"{"_class_name":"Test"}"#.to_vec()),
                ("transformer/model.safetensors", weights()),
            ],
            CompressionMethod::Stored,
        );
        let container = Container::open(&path)?;
        assert_eq!(
            container.read_to_string("model_index.json")?,
            r#"{"_class_name":"Test"}"#
        );
        let weights = container.weight_file("transformer/model.safetensors")?;
        let view = weights.view("proj.weight").unwrap();
        assert_eq!(view.shape(), &[2, 2]);
        assert_eq!(&view.data()[..4], &1f32.to_le_bytes());
        std::fs::remove_file(path)?;
        Ok(())
    }

    #[test]
    fn compressed_members_are_corrupt() {
        let path = write_container(
            "deflated",
            &[("model_index.json", vec![b'{'; 512])],
            CompressionMethod::Deflated,
        );
        let err = Container::open(&path).unwrap_err();
        assert!(matches!(err, Error::CorruptContainer(_)));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn truncated_archive_is_corrupt() {
        let path = write_container(
            "truncated",
            &[("transformer/model.safetensors", weights())],
            CompressionMethod::Stored,
        );
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        let err = Container::open(&path).unwrap_err();
        assert!(matches!(err, Error::CorruptContainer(_)));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = Container::open("/nonexistent/model.dduf").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
