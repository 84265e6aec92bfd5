//! Array placeholders
//!
//! When a mapping variable holds large arrays, each large entry is written to
//! its own `.npy` file and the entry is swapped for an [`ArrayPlaceholder`]
//! before the mapping goes through the object codec. Loading reverses this:
//! every placeholder is resolved back into a live array, memory-mapped when
//! possible.
//!
//! ```text
//! {"key1": Array(10M)}  --spill-->  {"key1": Placeholder("d1c0f...npy")}
//!                                              │
//!                                              └─→ d1c0f....npy
//! ```

use crate::array::mapped::{MapMode, MappedArray};
use crate::array::{ArrayData, DType};
use crate::error::{Error, Result};
use crate::fs_util::{copy_file, is_in_dir};
use crate::value::Value;
use crate::ARRAY_EXT;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use tracing::{debug, warn};

/// Reference to a single-array file inside the pack directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayPlaceholder {
    /// Base name of the array file
    pub filename: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
}

/// Hash used to tell apart the spill files of different keys of one mapping
pub fn key_hash(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

impl ArrayPlaceholder {
    /// File name for the entry with `key_hash` of variable `var_name`
    pub fn file_name_for(var_name: &str, key_hash: u64) -> String {
        format!("{}{:016x}.{}", var_name, key_hash, ARRAY_EXT)
    }

    /// Spill an array entry into `dir`
    ///
    /// Returns `None` when `value` is not an array or when the file could not
    /// be produced; the caller then leaves the original value in place.
    pub fn spill(value: &Value, dir: &Path, var_name: &str, key_hash: u64) -> Option<Self> {
        match value {
            Value::Mapped(mapped) => {
                let filename = Self::file_name_for(var_name, key_hash);
                let written = Self::place_mapped(mapped, dir, &filename);
                Self::spilled(written, filename, mapped.dtype(), mapped.shape())
            }
            Value::Array(data) => {
                let filename = Self::file_name_for(var_name, key_hash);
                let written = data.write_npy(&dir.join(&filename));
                Self::spilled(written, filename, data.dtype(), data.shape())
            }
            _ => None,
        }
    }

    /// Make `filename` in `dir` hold the contents of `mapped`
    ///
    /// Only a shared mapping of that very file is left in place. Other files
    /// in `dir` may belong to another variable; those and private pages are
    /// written from the mapping.
    fn place_mapped(mapped: &MappedArray, dir: &Path, filename: &str) -> Result<()> {
        let target = dir.join(filename);
        if mapped.mode() == MapMode::CopyOnWrite {
            return mapped.write_npy(&target);
        }
        if !is_in_dir(mapped.path(), dir) {
            mapped.flush()?;
            return copy_file(mapped.path(), &target);
        }

        let same_file = mapped
            .path()
            .file_name()
            .map(|n| n == filename)
            .unwrap_or(false);
        if same_file {
            mapped.flush()
        } else {
            mapped.write_npy(&target)
        }
    }

    fn spilled(written: Result<()>, filename: String, dtype: DType, shape: &[usize]) -> Option<Self> {
        match written {
            Ok(()) => {
                debug!(file = %filename, shape = ?shape, "Spilled array placeholder");
                Some(Self {
                    filename,
                    dtype,
                    shape: shape.to_vec(),
                })
            }
            Err(e) => {
                warn!(file = %filename, error = %e, "Failed in saving array placeholder file");
                None
            }
        }
    }

    /// Turn the placeholder back into a live array
    ///
    /// Memory-maps the file with `mode`, falling back to a full read. If both
    /// fail the manifest promised data that cannot be recovered, which is an
    /// error.
    pub fn resolve(&self, dir: &Path, mode: Option<MapMode>) -> Result<Value> {
        let path = dir.join(&self.filename);

        if let Some(mode) = mode {
            match MappedArray::open(&path, self.dtype, mode) {
                Ok(mapped) => return Ok(Value::Mapped(mapped)),
                Err(e) => debug!(file = %self.filename, error = %e, "Memory-mapping placeholder failed, reading instead"),
            }
        }

        ArrayData::read_npy(&path, self.dtype)
            .map(Value::Array)
            .map_err(|e| Error::Placeholder {
                file: self.filename.clone(),
                reason: e.to_string(),
            })
    }
}

/// Replace every placeholder reachable from `value` with its live array
pub fn resolve_placeholders(value: &mut Value, dir: &Path, mode: Option<MapMode>) -> Result<()> {
    match value {
        Value::Placeholder(placeholder) => {
            *value = placeholder.resolve(dir, mode)?;
            Ok(())
        }
        Value::Sequence(items) => items
            .iter_mut()
            .try_for_each(|item| resolve_placeholders(item, dir, mode)),
        Value::Mapping(map) => map
            .values_mut()
            .try_for_each(|item| resolve_placeholders(item, dir, mode)),
        _ => Ok(()),
    }
}

/// Spill files referenced by placeholders inside `value`
pub fn placeholder_files(value: &Value) -> Vec<String> {
    let mut files = Vec::new();
    collect_files(value, &mut files);
    files
}

fn collect_files(value: &Value, files: &mut Vec<String>) {
    match value {
        Value::Placeholder(p) => files.push(p.filename.clone()),
        Value::Sequence(items) => items.iter().for_each(|v| collect_files(v, files)),
        Value::Mapping(map) => map.values().for_each(|v| collect_files(v, files)),
        _ => {}
    }
}
