//! Filesystem helpers shared by save, load and relocation

use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Write a file through a temporary sibling and rename it into place
///
/// The temp file is removed again if `write` or the rename fails, so the final
/// name only ever holds a complete file.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Storage(format!("Not a file path: {:?}", path)))?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    let result = (|| {
        let file = File::create(&temp_path)
            .map_err(|e| Error::Storage(format!("Failed to create {:?}: {}", temp_path, e)))?;
        let mut writer = BufWriter::new(file);
        write(&mut writer)?;
        let file = writer
            .into_inner()
            .map_err(|e| Error::Storage(format!("Failed to flush {:?}: {}", temp_path, e)))?;
        file.sync_all()
            .map_err(|e| Error::Storage(format!("Failed to sync {:?}: {}", temp_path, e)))?;
        fs::rename(&temp_path, path)
            .map_err(|e| Error::Storage(format!("Failed to rename {:?}: {}", temp_path, e)))
    })();

    if result.is_err() {
        fs::remove_file(&temp_path).ok();
    }
    result
}

/// Write a small text file atomically
pub fn write_text_atomic(path: &Path, text: &str) -> Result<()> {
    write_atomic(path, |writer| {
        writer
            .write_all(text.as_bytes())
            .map_err(|e| Error::Storage(format!("Failed to write {:?}: {}", path, e)))
    })
}

/// Compare two directories, resolving symlinks and relative components when
/// both exist
pub fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Whether `file` sits directly inside `dir`
pub fn is_in_dir(file: &Path, dir: &Path) -> bool {
    file.parent().map(|p| same_dir(p, dir)).unwrap_or(false)
}

/// Copy a single file, replacing the target
pub fn copy_file(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to)
        .map_err(|e| Error::Storage(format!("Failed to copy {:?} to {:?}: {}", from, to, e)))?;
    debug!(from = ?from, to = ?to, "Copied file");
    Ok(())
}

/// Recursively copy the directory tree at `src` into `dst`
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)
        .map_err(|e| Error::Storage(format!("Failed to create {:?}: {}", dst, e)))?;

    let entries = fs::read_dir(src)
        .map_err(|e| Error::Storage(format!("Failed to read {:?}: {}", src, e)))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| Error::Storage(format!("Failed to read {:?}: {}", src, e)))?;
        let path = entry.path();
        let target: PathBuf = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| Error::Storage(format!("Failed to stat {:?}: {}", path, e)))?;

        if file_type.is_dir() {
            copy_dir_all(&path, &target)?;
        } else {
            copy_file(&path, &target)?;
        }
    }

    Ok(())
}
