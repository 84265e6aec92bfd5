//! Pack object lifecycle
//!
//! A [`Pack`] is an ordered namespace of named [`Value`]s plus the bookkeeping
//! needed to persist it: the directory it is attached to, how arrays are
//! memory-mapped, which variables were left on disk, which ones are not to be
//! saved, and the last manifest seen.
//!
//! # States
//!
//! ```text
//! new ──save_to/load──→ attached ──save──→ attached
//!                          │
//!                          └──save_as(dir)──→ new Pack attached to dir
//! ```
//!
//! The attached directory is set once. Saving somewhere else goes through
//! [`Pack::save_as`], which leaves `self` untouched and returns the relocated
//! copy.

mod load;
mod options;
mod save;

pub use options::{LoadFailure, LoadOptions, LoadReport, SaveOptions, SaveReport};

use crate::array::mapped::MapMode;
use crate::config::PackConfig;
use crate::error::{Error, Result};
use crate::fs_util::same_dir;
use crate::manifest::Manifest;
use crate::value::Value;
use std::collections::{btree_map, BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Named variables persisted to a directory
#[derive(Debug)]
pub struct Pack {
    vars: BTreeMap<String, Value>,
    attached_dir: Option<PathBuf>,
    mmap_mode: Option<MapMode>,
    skipped_on_load: BTreeSet<String>,
    skip_on_save: BTreeSet<String>,
    manifest: Option<Manifest>,
    config: PackConfig,
}

impl Default for Pack {
    fn default() -> Self {
        Self::new()
    }
}

impl Pack {
    /// Empty, unattached pack with default configuration
    pub fn new() -> Self {
        Self::with_config(PackConfig::default())
    }

    pub fn with_config(config: PackConfig) -> Self {
        Self {
            vars: BTreeMap::new(),
            attached_dir: None,
            mmap_mode: config.mmap_mode,
            skipped_on_load: BTreeSet::new(),
            skip_on_save: BTreeSet::new(),
            manifest: None,
            config,
        }
    }

    /// Load the pack stored in `dir` with the default configuration
    pub fn open<P: AsRef<Path>>(dir: P, options: &LoadOptions) -> Result<Self> {
        Self::open_with_config(dir, PackConfig::default(), options)
    }

    /// Load the pack stored in `dir`; later saves place variables by `config`
    pub fn open_with_config<P: AsRef<Path>>(
        dir: P,
        config: PackConfig,
        options: &LoadOptions,
    ) -> Result<Self> {
        let mut pack = Self::with_config(config);
        pack.load(dir, options)?;
        Ok(pack)
    }

    pub fn config(&self) -> &PackConfig {
        &self.config
    }

    /// Bind the pack to `dir`
    ///
    /// Re-attaching to the same directory is a no-op; any other directory is
    /// [`Error::AlreadyAttached`].
    pub fn attach<P: AsRef<Path>>(&mut self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        self.check_attachable(dir)?;
        if self.attached_dir.is_none() {
            info!(dir = ?dir, "Attached pack");
            self.attached_dir = Some(dir.to_path_buf());
        }
        Ok(())
    }

    fn check_attachable(&self, dir: &Path) -> Result<()> {
        match &self.attached_dir {
            Some(current) if !same_dir(current, dir) => Err(Error::AlreadyAttached {
                current: current.clone(),
                requested: dir.to_path_buf(),
            }),
            _ => Ok(()),
        }
    }

    pub fn attached_dir(&self) -> Option<&Path> {
        self.attached_dir.as_deref()
    }

    pub fn mmap_mode(&self) -> Option<MapMode> {
        self.mmap_mode
    }

    /// Mode used when placeholders are resolved after a save
    pub fn set_mmap_mode(&mut self, mode: Option<MapMode>) {
        self.mmap_mode = mode;
    }

    /// Manifest of the last load or save
    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Set a variable, returning the previous value
    ///
    /// Names must be non-empty and must not contain path separators, since
    /// they become file names.
    pub fn set<S, V>(&mut self, name: S, value: V) -> Result<Option<Value>>
    where
        S: Into<String>,
        V: Into<Value>,
    {
        let name = name.into();
        validate_name(&name)?;
        self.skipped_on_load.remove(&name);
        Ok(self.vars.insert(name, value.into()))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.vars.get_mut(name)
    }

    /// Remove a variable; a variable left on disk is forgotten as well
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.skipped_on_load.remove(name);
        self.vars.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Leave `name` out of subsequent saves
    pub fn skip_saving<S: Into<String>>(&mut self, name: S) {
        self.skip_on_save.insert(name.into());
    }

    pub fn unskip_saving(&mut self, name: &str) -> bool {
        self.skip_on_save.remove(name)
    }

    /// Variables present in the attached directory but not loaded
    pub fn skipped_on_load(&self) -> &BTreeSet<String> {
        &self.skipped_on_load
    }

    /// Flush every read-write mapped array to its file
    pub fn flush(&self) -> Result<()> {
        for (name, value) in &self.vars {
            value.flush_mapped()?;
            debug!(var = %name, "Flushed variable");
        }
        Ok(())
    }

    /// Unattached deep copy with every mapped array read into memory
    ///
    /// Variables left on disk are not part of the copy.
    pub fn detach(&self) -> Result<Pack> {
        let vars = self
            .vars
            .iter()
            .map(|(name, value)| Ok((name.clone(), value.materialized()?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Pack {
            vars,
            attached_dir: None,
            mmap_mode: self.mmap_mode,
            skipped_on_load: BTreeSet::new(),
            skip_on_save: self.skip_on_save.clone(),
            manifest: None,
            config: self.config.clone(),
        })
    }
}

impl<'a> IntoIterator for &'a Pack {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.vars.iter()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("Variable name is empty".to_string()));
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(Error::InvalidArgument(format!(
            "Variable name {:?} is not a valid file name",
            name
        )));
    }
    Ok(())
}
