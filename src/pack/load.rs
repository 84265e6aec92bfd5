//! Loading a pack from its directory

use super::{LoadFailure, LoadOptions, LoadReport, Pack};
use crate::array::mapped::{MapMode, MappedArray};
use crate::array::ArrayData;
use crate::codec;
use crate::error::{Error, Result};
use crate::manifest::{Manifest, ManifestEntry};
use crate::placeholder::resolve_placeholders;
use crate::value::Value;
use crate::MISC_FILENAME;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, warn};

impl Pack {
    /// Load the variables stored in `dir` into this pack
    ///
    /// The manifest is read first and is required. Files are then loaded one
    /// by one: array files are memory-mapped with `options.mmap_mode` (or
    /// read fully) and object files are decoded. With `stop_on_error` the
    /// first failing file aborts the load and the pack is left unchanged;
    /// otherwise the failure is reported and its variables are treated as
    /// skipped. Placeholders are resolved once every file is in, and one that
    /// cannot be resolved always fails the load. The directory is attached
    /// last.
    pub fn load<P: AsRef<Path>>(&mut self, dir: P, options: &LoadOptions) -> Result<LoadReport> {
        let dir = dir.as_ref();
        self.check_attachable(dir)?;

        let manifest = Manifest::read_from(dir)?;
        let mut skipped: BTreeSet<String> = manifest
            .names()
            .filter(|name| options.skip_loading.contains(*name))
            .map(str::to_string)
            .collect();

        let mut report = LoadReport {
            dir: dir.to_path_buf(),
            ..LoadReport::default()
        };
        let mut loaded = BTreeMap::new();

        for (file, names) in group_by_file(&manifest, &skipped, options.keep_loaded_skips) {
            match load_file(dir, &file, &names, &manifest, options.mmap_mode) {
                Ok(values) => {
                    debug!(file = %file, vars = values.len(), "Loaded file");
                    for name in &names {
                        skipped.remove(name);
                    }
                    loaded.extend(values);
                }
                Err(e) if options.stop_on_error => {
                    return Err(Error::Load {
                        file,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(file = %file, error = %e, "Failed to load file, skipping its variables");
                    skipped.extend(names.iter().cloned());
                    report.failures.push(LoadFailure {
                        file,
                        reason: e.to_string(),
                        vars: names,
                    });
                }
            }
        }

        resolve_loaded(&mut loaded, dir, options.mmap_mode)?;

        report.loaded = loaded.keys().cloned().collect();
        report.skipped = skipped.iter().cloned().collect();
        info!(
            dir = ?dir,
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "Loaded pack"
        );

        self.vars.extend(loaded);
        self.skipped_on_load = skipped
            .into_iter()
            .filter(|name| !self.vars.contains_key(name))
            .collect();
        self.manifest = Some(manifest);
        self.mmap_mode = options.mmap_mode;
        self.attach(dir)?;
        Ok(report)
    }
}

/// Map each file to the variables to load from it
///
/// Skipped variables only appear next to loaded ones in the misc file, and
/// only with `keep_loaded_skips`.
fn group_by_file(
    manifest: &Manifest,
    skipped: &BTreeSet<String>,
    keep_loaded_skips: bool,
) -> BTreeMap<String, Vec<String>> {
    let mut files: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, entry) in manifest {
        if !skipped.contains(name) {
            files.entry(entry.filename.clone()).or_default().push(name.clone());
        }
    }

    if keep_loaded_skips {
        if let Some(misc) = files.get_mut(MISC_FILENAME) {
            let co_resident = manifest
                .iter()
                .filter(|(name, entry)| entry.is_misc() && skipped.contains(*name))
                .map(|(name, _)| name.clone());
            misc.extend(co_resident);
        }
    }

    files
}

fn load_file(
    dir: &Path,
    file: &str,
    names: &[String],
    manifest: &Manifest,
    mode: Option<MapMode>,
) -> Result<Vec<(String, Value)>> {
    let path = dir.join(file);

    let values = if file == MISC_FILENAME {
        let mut group = codec::read_values(&path)?;
        names
            .iter()
            .map(|name| {
                group
                    .remove(name)
                    .map(|value| (name.clone(), value))
                    .ok_or_else(|| Error::NotFound(format!("{} is not in {}", name, file)))
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        let entry = names
            .first()
            .and_then(|name| manifest.get(name))
            .ok_or_else(|| Error::Manifest(format!("No entry refers to {}", file)))?;
        let value = if entry.is_array_file() {
            load_array(&path, entry, mode)?
        } else {
            codec::read_value(&path)?
        };
        names.iter().map(|name| (name.clone(), value.clone())).collect()
    };
    Ok(values)
}

/// Resolve the placeholders of every loaded value, failing on the first one
/// whose file is gone
fn resolve_loaded(
    loaded: &mut BTreeMap<String, Value>,
    dir: &Path,
    mode: Option<MapMode>,
) -> Result<()> {
    for (name, value) in loaded.iter_mut() {
        if !value.contains_placeholders() {
            continue;
        }
        if let Err(e) = resolve_placeholders(value, dir, mode) {
            warn!(var = %name, error = %e, "Unresolvable placeholder, aborting load");
            return Err(e);
        }
    }
    Ok(())
}

fn load_array(path: &Path, entry: &ManifestEntry, mode: Option<MapMode>) -> Result<Value> {
    let dtype = entry
        .dtype
        .ok_or_else(|| Error::Manifest(format!("Array entry {} has no dtype", entry.filename)))?;

    if let Some(mode) = mode {
        match MappedArray::open(path, dtype, mode) {
            Ok(mapped) => return Ok(Value::Mapped(mapped)),
            Err(e) => debug!(file = %entry.filename, error = %e, "Memory-mapping failed, reading instead"),
        }
    }
    ArrayData::read_npy(path, dtype).map(Value::Array)
}
