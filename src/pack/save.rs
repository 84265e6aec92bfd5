//! Saving a pack
//!
//! Every save runs in the directory the pack is attached to:
//! 1. variables never loaded are carried over (misc-resident ones are read
//!    back before the misc file is rewritten);
//! 2. the placement policy writes array and spill files;
//! 3. object files and the manifest are written;
//! 4. placeholders in the live namespace are resolved, even after a failure;
//! 5. files only the previous manifest referenced are removed.

use super::{Pack, SaveOptions, SaveReport};
use crate::codec;
use crate::error::{Error, Result};
use crate::fs_util::{copy_dir_all, copy_file, same_dir};
use crate::manifest::{Manifest, ManifestEntry};
use crate::placeholder::resolve_placeholders;
use crate::placement::{Placement, PlacementPolicy};
use crate::value::Value;
use crate::{MANIFEST_FILENAME, MISC_FILENAME};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// File stems owned by the pack itself
const RESERVED_STEMS: [&str; 2] = ["varpack", "misc_vars"];

/// Where variables that were never loaded currently live
struct Source<'a> {
    dir: &'a Path,
    manifest: &'a Manifest,
}

impl Pack {
    /// Save into the attached directory
    pub fn save(&mut self, options: &SaveOptions) -> Result<SaveReport> {
        let dir = self
            .attached_dir
            .clone()
            .ok_or_else(|| Error::Config("Pack is not attached to a directory".to_string()))?;
        let previous = self.manifest.clone();
        let source = previous.as_ref().map(|manifest| Source {
            dir: &dir,
            manifest,
        });
        self.save_into(&dir, source, options)
    }

    /// Attach to `dir` (set-once) and save there
    pub fn save_to<P: AsRef<Path>>(&mut self, dir: P, options: &SaveOptions) -> Result<SaveReport> {
        self.attach(dir)?;
        self.save(options)
    }

    /// Save a relocated copy into `dir` and return it
    ///
    /// The copy is detached from `self`, attached to `dir` and saved there.
    /// Variables that were never loaded are copied over verbatim from the
    /// current directory. `self` is left untouched.
    pub fn save_as<P: AsRef<Path>>(&self, dir: P, options: &SaveOptions) -> Result<Pack> {
        let dir = dir.as_ref();
        if let Some(current) = &self.attached_dir {
            if same_dir(current, dir) {
                return Err(Error::InvalidArgument(format!(
                    "{:?} is the attached directory; use save instead",
                    dir
                )));
            }
        }

        let mut copy = self.detach()?;
        copy.skipped_on_load = self.skipped_on_load.clone();
        copy.attach(dir)?;

        let source = match (&self.attached_dir, &self.manifest) {
            (Some(dir), Some(manifest)) => Some(Source { dir, manifest }),
            _ => None,
        };
        let report = copy.save_into(dir, source, options)?;
        info!(dir = ?dir, vars = copy.len(), carried = report.carried.len(), "Saved relocated pack");
        Ok(copy)
    }

    /// Save, then copy the whole attached directory to `copy_dir`
    ///
    /// The pack stays attached to its own directory.
    pub fn save_then_copy<P: AsRef<Path>>(
        &mut self,
        copy_dir: P,
        options: &SaveOptions,
    ) -> Result<SaveReport> {
        let report = self.save(options)?;
        copy_dir_all(&report.dir, copy_dir.as_ref())?;
        debug!(from = ?report.dir, to = ?copy_dir.as_ref(), "Copied saved pack");
        Ok(report)
    }

    fn save_into(
        &mut self,
        dir: &Path,
        source: Option<Source<'_>>,
        options: &SaveOptions,
    ) -> Result<SaveReport> {
        self.check_reserved_names()?;
        fs::create_dir_all(dir)
            .map_err(|e| Error::Storage(format!("Failed to create {:?}: {}", dir, e)))?;

        let mut report = SaveReport {
            dir: dir.to_path_buf(),
            ..SaveReport::default()
        };
        let carried = match &source {
            Some(source) => self.collect_carried(source, dir, &mut report),
            None => Vec::new(),
        };
        for name in &report.dropped {
            self.skipped_on_load.remove(name);
        }

        let policy = PlacementPolicy::from_config(&self.config)
            .with_sep_var_min_size(options.sep_var_min_size)
            .with_separate_vars(options.separate_vars.iter().cloned());
        let mut placement = policy.place(&mut self.vars, &self.skip_on_save, dir);
        for (name, entry, value) in carried {
            placement.carry(name, entry, value);
        }

        let written = placement
            .write_objects(&self.vars, dir)
            .and_then(|_| placement.manifest.write_to(dir));
        let resolved = self.resolve_live_placeholders(dir);
        written?;
        resolved?;

        if let Some(source) = &source {
            if same_dir(source.dir, dir) {
                report.removed_files = remove_orphans(source.manifest, &placement.manifest, dir);
            }
        }

        fill_report(&mut report, &placement);
        info!(
            dir = ?dir,
            vars = placement.manifest.len(),
            arrays = report.array_vars.len(),
            separate = report.separate_vars.len(),
            misc = report.misc_vars.len(),
            "Saved pack"
        );
        self.manifest = Some(placement.manifest);
        Ok(report)
    }

    fn check_reserved_names(&self) -> Result<()> {
        let reserved = self
            .vars
            .keys()
            .filter(|name| !self.skip_on_save.contains(*name))
            .find(|name| RESERVED_STEMS.contains(&name.as_str()));
        match reserved {
            Some(name) => Err(Error::InvalidArgument(format!(
                "Variable name {:?} collides with the pack's own files",
                name
            ))),
            None => Ok(()),
        }
    }

    /// Gather the variables that were never loaded so the new manifest keeps
    /// them
    ///
    /// Misc-resident values are read back from the current misc file. When
    /// relocating, files owned by a variable are copied into `dir`; a variable
    /// whose data cannot be found is dropped with a warning.
    fn collect_carried(
        &self,
        source: &Source<'_>,
        dir: &Path,
        report: &mut SaveReport,
    ) -> Vec<(String, ManifestEntry, Option<Value>)> {
        let relocating = !same_dir(source.dir, dir);
        let mut misc: Option<Result<BTreeMap<String, Value>>> = None;
        let mut carried = Vec::new();

        for name in &self.skipped_on_load {
            if self.vars.contains_key(name) || self.skip_on_save.contains(name) {
                continue;
            }
            let entry = match source.manifest.get(name) {
                Some(entry) => entry.clone(),
                None => {
                    warn!(var = %name, "Skipped variable missing from manifest, dropping");
                    report.dropped.push(name.clone());
                    continue;
                }
            };

            let value = if entry.is_misc() {
                let group = misc
                    .get_or_insert_with(|| codec::read_values(&source.dir.join(MISC_FILENAME)));
                match group {
                    Ok(group) => group.remove(name),
                    Err(e) => {
                        warn!(var = %name, error = %e, "Cannot read skipped variable, dropping");
                        report.dropped.push(name.clone());
                        continue;
                    }
                }
            } else {
                None
            };
            if entry.is_misc() && value.is_none() {
                warn!(var = %name, "Skipped variable not found in misc file, dropping");
                report.dropped.push(name.clone());
                continue;
            }

            let own_files = entry.files().filter(|file| *file != MISC_FILENAME);
            let available = if relocating {
                copy_files(own_files, source.dir, dir)
            } else {
                check_files(own_files, source.dir)
            };
            if let Err(e) = available {
                warn!(var = %name, error = %e, "Backing file of skipped variable missing, dropping");
                report.dropped.push(name.clone());
                continue;
            }

            debug!(var = %name, file = %entry.filename, "Carrying skipped variable");
            report.carried.push(name.clone());
            carried.push((name.clone(), entry, value));
        }

        carried
    }

    fn resolve_live_placeholders(&mut self, dir: &Path) -> Result<()> {
        let base = self.attached_dir.clone().unwrap_or_else(|| dir.to_path_buf());
        let mode = self.mmap_mode;
        let mut first_error = None;
        for (name, value) in self.vars.iter_mut() {
            if !value.contains_placeholders() {
                continue;
            }
            if let Err(e) = resolve_placeholders(value, &base, mode) {
                warn!(var = %name, error = %e, "Failed to resolve placeholders after save");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn copy_files<'a, I>(files: I, from: &Path, to: &Path) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    files
        .into_iter()
        .try_for_each(|file| copy_file(&from.join(file), &to.join(file)))
}

fn check_files<'a, I>(files: I, dir: &Path) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    match files.into_iter().find(|file| !dir.join(file).is_file()) {
        Some(file) => Err(Error::NotFound(format!("{} is not in {:?}", file, dir))),
        None => Ok(()),
    }
}

/// Delete files named by `old` but not by `new`
fn remove_orphans(old: &Manifest, new: &Manifest, dir: &Path) -> Vec<String> {
    let keep = new.files();
    let mut removed = Vec::new();
    for file in old.files() {
        if keep.contains(&file) || file == MANIFEST_FILENAME {
            continue;
        }
        match fs::remove_file(dir.join(file)) {
            Ok(()) => {
                debug!(file, "Removed orphaned file");
                removed.push(file.to_string());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(file, error = %e, "Failed to remove orphaned file"),
        }
    }
    removed
}

fn fill_report(report: &mut SaveReport, placement: &Placement) {
    report.array_vars = placement.array_vars.clone();
    report.separate_vars = placement.separate_vars.clone();
    report.misc_vars = placement
        .misc_vars
        .iter()
        .filter(|name| !report.carried.contains(*name))
        .cloned()
        .collect();
    report.demoted = placement.demoted.clone();
    report.spill_failures = placement.spill_failures.clone();
}
