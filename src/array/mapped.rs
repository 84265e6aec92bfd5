//! Memory-mapped arrays
//!
//! A [`MappedArray`] is an explicit resource handle over a `.npy` file: the
//! path, the mapping mode, the dtype/shape read from the header and the
//! mapping itself. Nothing converts implicitly; callers either borrow a typed
//! view, [`MappedArray::materialize`] the data into an owned [`ArrayData`], or
//! [`MappedArray::flush`] pending writes back to the file.
//!
//! ## Modes
//!
//! | Mode | Mapping | Writes reach the file |
//! |---|---|---|
//! | `r+` | shared, read-write | yes, on flush (and on drop) |
//! | `r`  | shared, read-only | n/a |
//! | `c`  | private, copy-on-write | never |
//!
//! Clones share one mapping. The last clone to go away flushes a read-write
//! mapping.

use super::{with_dtype, ArrayData, DType, Element};
use crate::error::{Error, Result};
use crate::fs_util::write_atomic;
use memmap2::{Mmap, MmapMut, MmapOptions};
use ndarray::{ArrayViewD, ArrayViewMutD};
use ndarray_npy::{ViewMutNpyExt, ViewNpyExt, WriteNpyExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// How an array file is memory-mapped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapMode {
    #[default]
    #[serde(rename = "r+")]
    ReadWrite,
    #[serde(rename = "r")]
    ReadOnly,
    #[serde(rename = "c")]
    CopyOnWrite,
}

impl MapMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MapMode::ReadWrite => "r+",
            MapMode::ReadOnly => "r",
            MapMode::CopyOnWrite => "c",
        }
    }
}

impl FromStr for MapMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r+" => Ok(MapMode::ReadWrite),
            "r" => Ok(MapMode::ReadOnly),
            "c" => Ok(MapMode::CopyOnWrite),
            other => Err(Error::Config(format!(
                "Invalid mmap mode '{}', expected one of 'r+', 'r', 'c'",
                other
            ))),
        }
    }
}

impl fmt::Display for MapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

enum Mapping {
    Shared(MmapMut),
    ReadOnly(Mmap),
    Private(MmapMut),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Mapping::Shared(m) | Mapping::Private(m) => &m[..],
            Mapping::ReadOnly(m) => &m[..],
        }
    }

    fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Mapping::Shared(m) | Mapping::Private(m) => Some(&mut m[..]),
            Mapping::ReadOnly(_) => None,
        }
    }

    fn flush(&self) -> std::io::Result<()> {
        match self {
            Mapping::Shared(m) => m.flush(),
            Mapping::ReadOnly(_) | Mapping::Private(_) => Ok(()),
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Failed to flush memory-mapped array on drop: {}", e);
        }
    }
}

/// An array backed by a memory-mapped `.npy` file
#[derive(Clone)]
pub struct MappedArray {
    path: PathBuf,
    mode: MapMode,
    dtype: DType,
    shape: Vec<usize>,
    file_len: u64,
    map: Arc<Mapping>,
}

impl fmt::Debug for MappedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedArray")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .finish()
    }
}

impl MappedArray {
    /// Memory-map the `.npy` file at `path`
    ///
    /// Fails if the file cannot be opened or mapped, if its header does not
    /// describe a `dtype` array, or if the data is not aligned for in-place
    /// viewing. Callers fall back to [`ArrayData::read_npy`] in that case.
    pub fn open(path: &Path, dtype: DType, mode: MapMode) -> Result<Self> {
        let file = match mode {
            MapMode::ReadWrite => OpenOptions::new().read(true).write(true).open(path),
            MapMode::ReadOnly | MapMode::CopyOnWrite => File::open(path),
        }
        .map_err(|e| Error::Array(format!("Failed to open {:?}: {}", path, e)))?;

        let file_len = file
            .metadata()
            .map_err(|e| Error::Array(format!("Failed to stat {:?}: {}", path, e)))?
            .len();

        // SAFETY: mapping a file is unsafe because another process may change
        // it underneath us. Pack directories have a single reader/writer, and
        // every rewrite of an array file goes through a temp file + rename, so
        // the inode backing this mapping is never truncated in place.
        let map = unsafe {
            match mode {
                MapMode::ReadWrite => MmapMut::map_mut(&file).map(Mapping::Shared),
                MapMode::ReadOnly => Mmap::map(&file).map(Mapping::ReadOnly),
                MapMode::CopyOnWrite => MmapOptions::new().map_copy(&file).map(Mapping::Private),
            }
        }
        .map_err(|e| Error::Array(format!("Failed to memory-map {:?}: {}", path, e)))?;

        let shape = with_dtype!(dtype, T => {
            ArrayViewD::<T>::view_npy(map.bytes())
                .map_err(|e| Error::Array(format!("Cannot view {:?} as {}: {}", path, dtype, e)))?
                .shape()
                .to_vec()
        });

        Ok(Self {
            path: path.to_path_buf(),
            mode,
            dtype,
            shape,
            file_len,
            map: Arc::new(map),
        })
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> MapMode {
        self.mode
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the backing file on disk
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Borrow the mapped data as a typed view
    pub fn view<T: Element>(&self) -> Result<ArrayViewD<'_, T>> {
        self.check_dtype::<T>()?;
        ArrayViewD::<T>::view_npy(self.map.bytes())
            .map_err(|e| Error::Array(format!("Cannot view {:?}: {}", self.path, e)))
    }

    /// Borrow the mapped data mutably
    ///
    /// Not available for read-only mappings, nor while clones of this handle
    /// share the mapping.
    pub fn view_mut<T: Element>(&mut self) -> Result<ArrayViewMutD<'_, T>> {
        self.check_dtype::<T>()?;
        let path = &self.path;
        let map = Arc::get_mut(&mut self.map).ok_or_else(|| {
            Error::InvalidArgument(format!("Mapping of {:?} is shared by clones", path))
        })?;
        let bytes = map.bytes_mut().ok_or_else(|| {
            Error::InvalidArgument(format!("Mapping of {:?} is read-only", path))
        })?;
        ArrayViewMutD::<T>::view_mut_npy(bytes)
            .map_err(|e| Error::Array(format!("Cannot view {:?}: {}", path, e)))
    }

    /// Copy the mapped data into an owned array
    pub fn materialize(&self) -> Result<ArrayData> {
        ArrayData::from_npy_bytes(self.dtype, self.map.bytes())
    }

    /// Write the mapped contents (including private copy-on-write changes) to
    /// a new `.npy` file without copying them into memory first
    pub fn write_npy(&self, path: &Path) -> Result<()> {
        let bytes = self.map.bytes();
        with_dtype!(self.dtype, T => {
            let view = ArrayViewD::<T>::view_npy(bytes)
                .map_err(|e| Error::Array(format!("Cannot view {:?}: {}", self.path, e)))?;
            write_atomic(path, |writer| {
                view.write_npy(writer)
                    .map_err(|e| Error::Array(format!("Failed to write {:?}: {}", path, e)))
            })
        })
    }

    /// Force pending writes of a read-write mapping to disk
    pub fn flush(&self) -> Result<()> {
        self.map
            .flush()
            .map_err(|e| Error::Array(format!("Failed to flush {:?}: {}", self.path, e)))
    }

    fn check_dtype<T: Element>(&self) -> Result<()> {
        if T::DTYPE != self.dtype {
            return Err(Error::InvalidArgument(format!(
                "{:?} holds {} elements, not {}",
                self.path,
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(())
    }
}
