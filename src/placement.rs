//! Placement policy
//!
//! Decides, for every variable of one save, which file it lands in:
//!
//! ```text
//! array (owned / mapped)      → <var>.npy
//! mapping with large arrays   → arrays spilled to <var><hash>.npy, mapping
//!                               continues as an object candidate
//! object, requested or large  → <var>.vpk
//! everything else             → misc_vars.vpk (one shared file)
//! ```
//!
//! Array writes that fail demote the variable to object handling instead of
//! failing the save. Spilling rewrites mapping entries in place; the caller
//! resolves the placeholders again once the files are written.

use crate::array::mapped::{MapMode, MappedArray};
use crate::array::DType;
use crate::codec;
use crate::config::PackConfig;
use crate::error::{Error, Result};
use crate::fs_util::{copy_file, is_in_dir};
use crate::manifest::{Manifest, ManifestEntry};
use crate::placeholder::{key_hash, placeholder_files, ArrayPlaceholder};
use crate::size::estimate_size;
use crate::value::Value;
use crate::{ARRAY_EXT, MISC_FILENAME, OBJECT_EXT};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// Thresholds driving one save
#[derive(Debug, Clone)]
pub struct PlacementPolicy {
    pub max_dict_keys: usize,
    pub min_dict_array_len: usize,
    pub sep_var_min_size: u64,
    /// Variables that always get their own object file
    pub separate_vars: BTreeSet<String>,
}

impl PlacementPolicy {
    pub fn from_config(config: &PackConfig) -> Self {
        Self {
            max_dict_keys: config.max_dict_keys,
            min_dict_array_len: config.min_dict_array_len,
            sep_var_min_size: config.sep_var_min_size,
            separate_vars: BTreeSet::new(),
        }
    }

    /// Override the separate-file size threshold
    pub fn with_sep_var_min_size(mut self, size: Option<u64>) -> Self {
        if let Some(size) = size {
            self.sep_var_min_size = size;
        }
        self
    }

    /// Request separate object files for `names`
    pub fn with_separate_vars<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.separate_vars.extend(names.into_iter().map(Into::into));
        self
    }

    /// Classify every variable not in `skip`, writing array and spill files
    /// into `dir` on the way
    pub fn place(
        &self,
        vars: &mut BTreeMap<String, Value>,
        skip: &BTreeSet<String>,
        dir: &Path,
    ) -> Placement {
        let mut placement = Placement::default();

        for (name, value) in vars.iter_mut() {
            if skip.contains(name) {
                debug!(var = %name, "Skipping variable on save");
                continue;
            }

            let mut entry = ManifestEntry::new(estimate_size(value));

            if value.is_array() {
                match write_array(name, value, dir) {
                    Ok((filename, dtype, shape)) => {
                        debug!(var = %name, file = %filename, "Placed array variable");
                        entry.filename = filename;
                        entry.dtype = Some(dtype);
                        entry.shape = Some(shape);
                        placement.manifest.insert(name.clone(), entry);
                        placement.array_vars.push(name.clone());
                        continue;
                    }
                    Err(e) => {
                        warn!(var = %name, error = %e, "Failed to write array file, storing as object");
                        placement.demoted.push(name.clone());
                    }
                }
            } else {
                self.spill_entries(name, value, dir, &mut entry, &mut placement.spill_failures);
            }

            if self.separate_vars.contains(name) || entry.size >= self.sep_var_min_size {
                placement.separate_vars.push(name.clone());
            } else {
                placement.misc_vars.push(name.clone());
            }
            placement.manifest.insert(name.clone(), entry);
        }

        placement
    }

    fn spill_entries(
        &self,
        name: &str,
        value: &mut Value,
        dir: &Path,
        entry: &mut ManifestEntry,
        failures: &mut Vec<String>,
    ) {
        let map = match value {
            Value::Mapping(map) if map.len() < self.max_dict_keys => map,
            _ => return,
        };

        let size_before = entry.size;
        let mut spilled = 0usize;
        for (key, item) in map.iter_mut() {
            let large = item
                .array_len()
                .map(|len| len >= self.min_dict_array_len)
                .unwrap_or(false);
            if !large {
                continue;
            }

            match ArrayPlaceholder::spill(item, dir, name, key_hash(key)) {
                Some(placeholder) => {
                    *item = Value::Placeholder(placeholder);
                    spilled += 1;
                }
                None => failures.push(format!("{}[{}]", name, key)),
            }
        }

        if spilled > 0 {
            entry.uses_placeholders = Some(true);
            entry.size_before_placeholders = Some(size_before);
            entry.size = estimate_size(value);
            entry.placeholder_files = placeholder_files(value);
            debug!(var = name, spilled, size_before, size = entry.size, "Spilled mapping arrays");
        }
    }
}

/// Write an array variable to `<name>.npy`
///
/// A read-write or read-only mapping of exactly that file only needs a flush.
/// Mappings of other files in `dir` are rewritten from the mapped pages, since
/// their file may belong to another variable; files elsewhere are copied.
fn write_array(name: &str, value: &Value, dir: &Path) -> Result<(String, DType, Vec<usize>)> {
    let filename = format!("{}.{}", name, ARRAY_EXT);
    let target = dir.join(&filename);

    let (dtype, shape) = match value {
        Value::Mapped(mapped) if mapped.mode() != MapMode::CopyOnWrite => {
            mapped.flush()?;
            place_mapped_file(mapped, &filename, dir)?;
            (mapped.dtype(), mapped.shape().to_vec())
        }
        Value::Mapped(mapped) => {
            mapped.write_npy(&target)?;
            (mapped.dtype(), mapped.shape().to_vec())
        }
        Value::Array(data) => {
            data.write_npy(&target)?;
            (data.dtype(), data.shape().to_vec())
        }
        other => {
            return Err(Error::InvalidArgument(format!(
                "{} is a {}, not an array",
                name,
                other.kind()
            )))
        }
    };

    Ok((filename, dtype, shape))
}

fn place_mapped_file(mapped: &MappedArray, filename: &str, dir: &Path) -> Result<()> {
    let target = dir.join(filename);
    if !is_in_dir(mapped.path(), dir) {
        return copy_file(mapped.path(), &target);
    }

    let same_name = mapped
        .path()
        .file_name()
        .map(|n| n == filename)
        .unwrap_or(false);
    if same_name {
        Ok(())
    } else {
        mapped.write_npy(&target)
    }
}

/// Outcome of running the policy over a namespace
#[derive(Debug, Default)]
pub struct Placement {
    pub manifest: Manifest,
    /// Variables written as standalone array files
    pub array_vars: Vec<String>,
    /// Object variables with their own file
    pub separate_vars: Vec<String>,
    /// Object variables sharing the misc file
    pub misc_vars: Vec<String>,
    /// Arrays whose file could not be written
    pub demoted: Vec<String>,
    /// `var[key]` entries that stayed inline because spilling failed
    pub spill_failures: Vec<String>,
    carried: BTreeMap<String, Value>,
}

impl Placement {
    /// Keep a variable that is not live in the namespace
    ///
    /// With a value it is rewritten into the misc file; without one its
    /// existing files are taken over unchanged.
    pub fn carry(&mut self, name: String, entry: ManifestEntry, value: Option<Value>) {
        if let Some(value) = value {
            self.misc_vars.push(name.clone());
            self.carried.insert(name.clone(), value);
        }
        self.manifest.insert(name, entry);
    }

    /// Write separate object files and the misc file into `dir`
    pub fn write_objects(&mut self, vars: &BTreeMap<String, Value>, dir: &Path) -> Result<()> {
        for name in &self.separate_vars {
            let filename = format!("{}.{}", name, OBJECT_EXT);
            codec::write_value(&dir.join(&filename), lookup(vars, &self.carried, name)?)?;
            if let Some(entry) = self.manifest.get_mut(name) {
                entry.filename = filename;
            }
        }

        if self.misc_vars.is_empty() {
            return Ok(());
        }

        let group = self
            .misc_vars
            .iter()
            .map(|name| Ok((name.as_str(), lookup(vars, &self.carried, name)?)))
            .collect::<Result<Vec<_>>>()?;
        codec::write_values(&dir.join(MISC_FILENAME), group)?;

        for name in &self.misc_vars {
            if let Some(entry) = self.manifest.get_mut(name) {
                entry.filename = MISC_FILENAME.to_string();
            }
        }

        info!(
            dir = ?dir,
            separate = self.separate_vars.len(),
            misc = self.misc_vars.len(),
            "Wrote object files"
        );
        Ok(())
    }
}

fn lookup<'a>(
    vars: &'a BTreeMap<String, Value>,
    carried: &'a BTreeMap<String, Value>,
    name: &str,
) -> Result<&'a Value> {
    vars.get(name)
        .or_else(|| carried.get(name))
        .ok_or_else(|| Error::NotFound(format!("Variable {} vanished during save", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::ArrayData;
    use ndarray::Array1;

    fn policy() -> PlacementPolicy {
        PlacementPolicy {
            max_dict_keys: 10,
            min_dict_array_len: 100,
            sep_var_min_size: 10_000,
            separate_vars: BTreeSet::new(),
        }
    }

    fn vars() -> BTreeMap<String, Value> {
        let mut dict = BTreeMap::new();
        dict.insert("big".to_string(), Value::from(Array1::<f64>::zeros(500)));
        dict.insert("small".to_string(), Value::from(Array1::<f64>::zeros(5)));

        let mut vars = BTreeMap::new();
        vars.insert("arr".to_string(), Value::from(Array1::<i64>::zeros(20)));
        vars.insert("dict".to_string(), Value::Mapping(dict));
        vars.insert("n".to_string(), Value::from(1));
        vars.insert("text".to_string(), Value::from("x".repeat(20_000)));
        vars
    }

    #[test]
    fn test_classification() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut vars = vars();

        let placement = policy().place(&mut vars, &BTreeSet::new(), dir.path());
        assert_eq!(placement.array_vars, vec!["arr"]);
        assert_eq!(placement.separate_vars, vec!["text"]);
        assert_eq!(placement.misc_vars, vec!["dict", "n"]);
        assert!(placement.demoted.is_empty());

        let arr = placement.manifest.get("arr").unwrap();
        assert_eq!(arr.filename, "arr.npy");
        assert_eq!(arr.shape, Some(vec![20]));
        assert_eq!(arr.dtype, Some(DType::I64));
        assert!(dir.path().join("arr.npy").exists());

        let dict = placement.manifest.get("dict").unwrap();
        assert!(dict.uses_placeholders());
        assert!(dict.size_before_placeholders.unwrap() > dict.size);
        assert_eq!(dict.placeholder_files.len(), 1);
        assert!(dir.path().join(&dict.placeholder_files[0]).exists());

        let live = vars["dict"].as_mapping().unwrap();
        assert!(matches!(live["big"], Value::Placeholder(_)));
        assert!(matches!(live["small"], Value::Array(_)));
        Ok(())
    }

    #[test]
    fn test_requested_and_skipped_vars() {
        let dir = tempfile::tempdir().unwrap();
        let mut vars = vars();
        let skip: BTreeSet<String> = ["arr".to_string()].into_iter().collect();

        let placement = policy()
            .with_separate_vars(["n", "missing"])
            .place(&mut vars, &skip, dir.path());

        assert!(placement.array_vars.is_empty());
        assert!(!placement.manifest.contains("arr"));
        assert!(!placement.manifest.contains("missing"));
        assert_eq!(placement.separate_vars, vec!["n", "text"]);
        assert!(!dir.path().join("arr.npy").exists());
    }

    #[test]
    fn test_mapping_with_many_keys_is_not_scanned() {
        let dir = tempfile::tempdir().unwrap();
        let mut dict = BTreeMap::new();
        for i in 0..10 {
            dict.insert(format!("k{}", i), Value::from(Array1::<u8>::zeros(1000)));
        }
        let mut vars = BTreeMap::new();
        vars.insert("wide".to_string(), Value::Mapping(dict));

        let placement = policy().place(&mut vars, &BTreeSet::new(), dir.path());
        assert!(!placement.manifest.get("wide").unwrap().uses_placeholders());
        assert!(!vars["wide"].contains_placeholders());
    }

    #[test]
    fn test_failed_array_write_demotes() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("arr.npy")).unwrap();
        let mut vars = BTreeMap::new();
        vars.insert("arr".to_string(), Value::from(Array1::<f32>::ones(4)));

        let mut placement = policy().place(&mut vars, &BTreeSet::new(), dir.path());
        assert_eq!(placement.demoted, vec!["arr"]);
        assert_eq!(placement.misc_vars, vec!["arr"]);

        placement.write_objects(&vars, dir.path())?;
        assert_eq!(placement.manifest.get("arr").unwrap().filename, MISC_FILENAME);
        let group = codec::read_values(&dir.path().join(MISC_FILENAME))?;
        assert_eq!(group["arr"], Value::from(Array1::<f32>::ones(4)));
        Ok(())
    }

    #[test]
    fn test_mapped_array_from_other_dir_is_copied() -> Result<()> {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let path = src.path().join("elsewhere.npy");
        ArrayData::from(Array1::<i32>::from_elem(6, 3)).write_npy(&path)?;

        let mut vars = BTreeMap::new();
        vars.insert(
            "m".to_string(),
            Value::Mapped(MappedArray::open(&path, DType::I32, MapMode::ReadOnly)?),
        );

        let placement = policy().place(&mut vars, &BTreeSet::new(), dst.path());
        assert_eq!(placement.manifest.get("m").unwrap().filename, "m.npy");
        let copied = ArrayData::read_npy(&dst.path().join("m.npy"), DType::I32)?;
        assert_eq!(copied, ArrayData::from(Array1::<i32>::from_elem(6, 3)));
        Ok(())
    }

    #[test]
    fn test_carried_values_join_misc_file() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut vars = BTreeMap::new();
        vars.insert("live".to_string(), Value::from(2));

        let mut placement = policy().place(&mut vars, &BTreeSet::new(), dir.path());
        placement.carry("old".to_string(), ManifestEntry::new(28), Some(Value::from(7)));
        placement.write_objects(&vars, dir.path())?;

        let group = codec::read_values(&dir.path().join(MISC_FILENAME))?;
        assert_eq!(group["old"], Value::from(7));
        assert_eq!(group["live"], Value::from(2));
        assert!(placement.manifest.get("old").unwrap().is_misc());
        Ok(())
    }
}
