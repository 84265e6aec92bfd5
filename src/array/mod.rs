//! Numeric arrays
//!
//! Arrays are kept as owned `ndarray` arrays tagged with their element type.
//! On disk every array is a single `.npy` file (numeric dtypes only, no object
//! payloads), which gives a stable dtype/shape header that can be either read
//! whole or memory-mapped in place.
//!
//! # Layout
//!
//! ```text
//! ArrayData
//!   ├─→ F64(ArrayD<f64>)   "float64"
//!   ├─→ F32(ArrayD<f32>)   "float32"
//!   ├─→ I64(ArrayD<i64>)   "int64"
//!   ├─→ I32(ArrayD<i32>)   "int32"
//!   └─→ U8(ArrayD<u8>)     "uint8"
//! ```

pub mod mapped;

use crate::error::{Error, Result};
use crate::fs_util::write_atomic;
use ndarray::{Array, ArrayD, ArrayViewD, Dimension, IxDyn};
use ndarray_npy::{
    ReadNpyExt, ReadableElement, ViewElement, ViewMutElement, ViewNpyExt, WritableElement,
    WriteNpyExt,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Element type of an array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    #[serde(rename = "float64")]
    F64,
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "int64")]
    I64,
    #[serde(rename = "int32")]
    I32,
    #[serde(rename = "uint8")]
    U8,
}

impl DType {
    /// Size of one element in bytes
    pub fn itemsize(&self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::U8 => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::F64 => "float64",
            DType::F32 => "float32",
            DType::I64 => "int64",
            DType::I32 => "int32",
            DType::U8 => "uint8",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Runs `$body` with `$t` bound to the Rust element type of `$dtype`.
macro_rules! with_dtype {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            $crate::array::DType::F64 => {
                type $t = f64;
                $body
            }
            $crate::array::DType::F32 => {
                type $t = f32;
                $body
            }
            $crate::array::DType::I64 => {
                type $t = i64;
                $body
            }
            $crate::array::DType::I32 => {
                type $t = i32;
                $body
            }
            $crate::array::DType::U8 => {
                type $t = u8;
                $body
            }
        }
    };
}
pub(crate) use with_dtype;

/// Runs `$body` with `$a` bound to the typed array inside `$data`.
macro_rules! for_each_array {
    ($data:expr, $a:ident => $body:expr) => {
        match $data {
            ArrayData::F64($a) => $body,
            ArrayData::F32($a) => $body,
            ArrayData::I64($a) => $body,
            ArrayData::I32($a) => $body,
            ArrayData::U8($a) => $body,
        }
    };
}

/// Rust element types that can live in an [`ArrayData`]
pub trait Element:
    Copy
    + PartialEq
    + fmt::Debug
    + Default
    + ReadableElement
    + WritableElement
    + ViewElement
    + ViewMutElement
    + 'static
{
    const DTYPE: DType;

    fn into_data(array: ArrayD<Self>) -> ArrayData;

    fn from_data(data: &ArrayData) -> Option<&ArrayD<Self>>;

    fn from_data_mut(data: &mut ArrayData) -> Option<&mut ArrayD<Self>>;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$variant;

            fn into_data(array: ArrayD<Self>) -> ArrayData {
                ArrayData::$variant(array)
            }

            fn from_data(data: &ArrayData) -> Option<&ArrayD<Self>> {
                match data {
                    ArrayData::$variant(a) => Some(a),
                    _ => None,
                }
            }

            fn from_data_mut(data: &mut ArrayData) -> Option<&mut ArrayD<Self>> {
                match data {
                    ArrayData::$variant(a) => Some(a),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(f64, F64);
impl_element!(f32, F32);
impl_element!(i64, I64);
impl_element!(i32, I32);
impl_element!(u8, U8);

/// An owned n-dimensional array with a runtime element type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayData {
    F64(ArrayD<f64>),
    F32(ArrayD<f32>),
    I64(ArrayD<i64>),
    I32(ArrayD<i32>),
    U8(ArrayD<u8>),
}

impl ArrayData {
    /// Create a zero-filled array
    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        with_dtype!(dtype, T => T::into_data(ArrayD::<T>::default(IxDyn(shape))))
    }

    pub fn dtype(&self) -> DType {
        match self {
            ArrayData::F64(_) => DType::F64,
            ArrayData::F32(_) => DType::F32,
            ArrayData::I64(_) => DType::I64,
            ArrayData::I32(_) => DType::I32,
            ArrayData::U8(_) => DType::U8,
        }
    }

    pub fn shape(&self) -> &[usize] {
        for_each_array!(self, a => a.shape())
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        for_each_array!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the element buffer in bytes
    pub fn nbytes(&self) -> u64 {
        (self.len() * self.dtype().itemsize()) as u64
    }

    /// Borrow as a typed array, `None` if `T` does not match the dtype
    pub fn as_array<T: Element>(&self) -> Option<&ArrayD<T>> {
        T::from_data(self)
    }

    pub fn as_array_mut<T: Element>(&mut self) -> Option<&mut ArrayD<T>> {
        T::from_data_mut(self)
    }

    /// Write the array to `path` as a `.npy` file
    ///
    /// The file is written to a temporary sibling and renamed into place, so
    /// an existing mapping of the old file keeps its contents.
    pub fn write_npy(&self, path: &Path) -> Result<()> {
        write_atomic(path, |writer| {
            for_each_array!(self, a => a.write_npy(writer))
                .map_err(|e| Error::Array(format!("Failed to write {:?}: {}", path, e)))
        })
    }

    /// Read a whole `.npy` file into memory
    pub fn read_npy(path: &Path, dtype: DType) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::Array(format!("Failed to open {:?}: {}", path, e)))?;
        let reader = BufReader::new(file);
        with_dtype!(dtype, T => {
            let array = ArrayD::<T>::read_npy(reader)
                .map_err(|e| Error::Array(format!("Failed to read {:?}: {}", path, e)))?;
            Ok(T::into_data(array))
        })
    }

    /// Copy an array out of the bytes of a `.npy` file
    pub(crate) fn from_npy_bytes(dtype: DType, bytes: &[u8]) -> Result<Self> {
        with_dtype!(dtype, T => {
            let view = ArrayViewD::<T>::view_npy(bytes)
                .map_err(|e| Error::Array(format!("Invalid {} array data: {}", dtype, e)))?;
            Ok(T::into_data(view.to_owned()))
        })
    }
}

impl<T: Element, D: Dimension> From<Array<T, D>> for ArrayData {
    fn from(array: Array<T, D>) -> Self {
        T::into_data(array.into_dyn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array2};

    #[test]
    fn test_dtype_metadata() {
        assert_eq!(DType::F64.itemsize(), 8);
        assert_eq!(DType::U8.itemsize(), 1);
        assert_eq!(DType::I32.to_string(), "int32");
        assert_eq!(serde_json::to_string(&DType::F32).unwrap(), "\"float32\"");
    }

    #[test]
    fn test_array_data_shape_and_size() {
        let data = ArrayData::from(Array2::<i32>::zeros((3, 4)));
        assert_eq!(data.dtype(), DType::I32);
        assert_eq!(data.shape(), &[3, 4]);
        assert_eq!(data.len(), 12);
        assert_eq!(data.nbytes(), 48);
        assert!(data.as_array::<i32>().is_some());
        assert!(data.as_array::<f64>().is_none());
    }

    #[test]
    fn test_npy_file_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.npy");

        let data = ArrayData::from(arr1(&[1.5f64, -2.0, 3.25]));
        data.write_npy(&path)?;

        let loaded = ArrayData::read_npy(&path, DType::F64)?;
        assert_eq!(loaded, data);

        // Reading with the wrong dtype is an error, not a reinterpretation
        assert!(ArrayData::read_npy(&path, DType::I64).is_err());
        Ok(())
    }

    #[test]
    fn test_zeros() {
        let data = ArrayData::zeros(DType::U8, &[2, 2, 2]);
        assert_eq!(data.len(), 8);
        assert!(data.as_array::<u8>().unwrap().iter().all(|&v| v == 0));
    }
}
