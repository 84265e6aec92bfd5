//! Pack manifest
//!
//! The manifest is the single source of truth for rebuilding a pack from its
//! directory. It is a human-readable JSON object keyed by variable name:
//!
//! ```text
//! {
//!   "np_arr": {"filename": "np_arr.npy", "size": 80000112,
//!              "shape": [100, 1000, 100], "dtype": "float64"},
//!   "scalar": {"filename": "misc_vars.vpk", "size": 28},
//!   "dict_of_np_arr": {"filename": "misc_vars.vpk", "size": 322,
//!                      "uses_placeholders": true,
//!                      "size_before_placeholders": 240000416,
//!                      "placeholder_files": ["dict_of_np_arr5f1c...npy", ...]}
//! }
//! ```

use crate::array::DType;
use crate::error::{Error, Result};
use crate::fs_util::write_text_atomic;
use crate::{ARRAY_EXT, MANIFEST_FILENAME, MISC_FILENAME};
use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Persistence metadata of one variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// File holding the variable, relative to the pack directory
    pub filename: String,
    /// Estimated in-memory size in bytes
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<DType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses_placeholders: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_before_placeholders: Option<u64>,
    /// Spilled array files the variable's placeholders point at
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub placeholder_files: Vec<String>,
}

impl ManifestEntry {
    /// Fresh entry with only the size known
    pub fn new(size: u64) -> Self {
        Self {
            filename: String::new(),
            size,
            shape: None,
            dtype: None,
            uses_placeholders: None,
            size_before_placeholders: None,
            placeholder_files: Vec::new(),
        }
    }

    pub fn is_array_file(&self) -> bool {
        Path::new(&self.filename)
            .extension()
            .map(|ext| ext == ARRAY_EXT)
            .unwrap_or(false)
    }

    pub fn is_misc(&self) -> bool {
        self.filename == MISC_FILENAME
    }

    pub fn uses_placeholders(&self) -> bool {
        self.uses_placeholders.unwrap_or(false)
    }

    /// Every file this entry needs in the directory
    pub fn files(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.filename.as_str())
            .chain(self.placeholder_files.iter().map(String::as_str))
    }
}

/// Ordered mapping from variable name to its entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        entry: ManifestEntry,
    ) -> Option<ManifestEntry> {
        self.entries.insert(name.into(), entry)
    }

    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ManifestEntry> {
        self.entries.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ManifestEntry> {
        self.entries.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, ManifestEntry> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Every file referenced by any entry, without duplicates
    pub fn files(&self) -> Vec<&str> {
        let mut files: Vec<&str> = self.entries.values().flat_map(|e| e.files()).collect();
        files.sort_unstable();
        files.dedup();
        files
    }

    /// Read `varpack.json` from `dir`
    pub fn read_from(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILENAME);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::Manifest(format!("Failed to read {:?}: {}", path, e)))?;
        let manifest: Manifest = serde_json::from_str(&text)
            .map_err(|e| Error::Manifest(format!("Failed to parse {:?}: {}", path, e)))?;

        debug!(path = ?path, entries = manifest.len(), "Read manifest");
        Ok(manifest)
    }

    /// Write `varpack.json` into `dir`
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILENAME);
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize manifest: {}", e)))?;
        write_text_atomic(&path, &text)?;

        info!(path = ?path, entries = self.len(), "Wrote manifest");
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Manifest {
    type Item = (&'a String, &'a ManifestEntry);
    type IntoIter = btree_map::Iter<'a, String, ManifestEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        let mut manifest = Manifest::new();

        let mut array = ManifestEntry::new(80_000_112);
        array.filename = "np_arr.npy".to_string();
        array.shape = Some(vec![100, 1000, 100]);
        array.dtype = Some(DType::F64);
        manifest.insert("np_arr", array);

        let mut scalar = ManifestEntry::new(28);
        scalar.filename = MISC_FILENAME.to_string();
        manifest.insert("scalar", scalar);

        let mut dict = ManifestEntry::new(322);
        dict.filename = MISC_FILENAME.to_string();
        dict.uses_placeholders = Some(true);
        dict.size_before_placeholders = Some(240_000_416);
        dict.placeholder_files = vec!["dict00.npy".to_string()];
        manifest.insert("dict", dict);

        manifest
    }

    #[test]
    fn test_manifest_file_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let manifest = sample();
        manifest.write_to(dir.path())?;

        let loaded = Manifest::read_from(dir.path())?;
        assert_eq!(loaded, manifest);
        Ok(())
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let json = serde_json::to_value(sample()).unwrap();
        let scalar = json["scalar"].as_object().unwrap();
        assert_eq!(scalar.len(), 2);
        assert_eq!(scalar["filename"], MISC_FILENAME);

        assert_eq!(json["np_arr"]["dtype"], "float64");
        assert_eq!(json["dict"]["uses_placeholders"], true);
    }

    #[test]
    fn test_entry_classification() {
        let manifest = sample();
        assert!(manifest.get("np_arr").unwrap().is_array_file());
        assert!(manifest.get("scalar").unwrap().is_misc());
        assert!(manifest.get("dict").unwrap().uses_placeholders());
        assert_eq!(
            manifest.files(),
            vec!["dict00.npy", MISC_FILENAME, "np_arr.npy"]
        );
    }

    #[test]
    fn test_missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Manifest::read_from(dir.path()),
            Err(Error::Manifest(_))
        ));
    }
}
