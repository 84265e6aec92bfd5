//! Save/load options and the reports returned by both

use crate::array::mapped::MapMode;
use crate::config::PackConfig;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Per-call save options
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Variables that always get their own object file; unknown names are
    /// ignored
    pub separate_vars: Vec<String>,
    /// Overrides [`PackConfig::sep_var_min_size`] for this save
    pub sep_var_min_size: Option<u64>,
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn separate<S: Into<String>>(mut self, name: S) -> Self {
        self.separate_vars.push(name.into());
        self
    }

    pub fn sep_var_min_size(mut self, size: u64) -> Self {
        self.sep_var_min_size = Some(size);
        self
    }
}

/// Per-call load options
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// How array files are opened; `None` reads them fully into memory
    pub mmap_mode: Option<MapMode>,
    /// Abort on the first file that fails to load
    pub stop_on_error: bool,
    /// Variables left on disk
    pub skip_loading: BTreeSet<String>,
    /// Load skipped variables anyway when they share the misc file with
    /// variables that are loaded
    pub keep_loaded_skips: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self::from_config(&PackConfig::default())
    }
}

impl LoadOptions {
    pub fn from_config(config: &PackConfig) -> Self {
        Self {
            mmap_mode: config.mmap_mode,
            stop_on_error: true,
            skip_loading: BTreeSet::new(),
            keep_loaded_skips: false,
        }
    }

    pub fn mmap_mode(mut self, mode: Option<MapMode>) -> Self {
        self.mmap_mode = mode;
        self
    }

    pub fn stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    pub fn skip<S: Into<String>>(mut self, name: S) -> Self {
        self.skip_loading.insert(name.into());
        self
    }

    pub fn keep_loaded_skips(mut self, keep: bool) -> Self {
        self.keep_loaded_skips = keep;
        self
    }
}

/// What a save wrote where
#[derive(Debug, Clone, Default)]
pub struct SaveReport {
    pub dir: PathBuf,
    pub array_vars: Vec<String>,
    pub separate_vars: Vec<String>,
    pub misc_vars: Vec<String>,
    /// Arrays stored as objects because their array file could not be written
    pub demoted: Vec<String>,
    /// `var[key]` mapping entries that could not be spilled
    pub spill_failures: Vec<String>,
    /// Variables never loaded that were kept from the previous directory
    pub carried: Vec<String>,
    /// Variables never loaded whose data could no longer be found
    pub dropped: Vec<String>,
    /// Files of the previous save that nothing references any more
    pub removed_files: Vec<String>,
}

/// A file that could not be loaded
#[derive(Debug, Clone, PartialEq)]
pub struct LoadFailure {
    pub file: String,
    pub reason: String,
    pub vars: Vec<String>,
}

/// What a load brought into memory
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub dir: PathBuf,
    pub loaded: Vec<String>,
    /// Variables left on disk, requested or after a failure
    pub skipped: Vec<String>,
    pub failures: Vec<LoadFailure>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}
