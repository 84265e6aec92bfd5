//! Object codec for `.vpk` files
//!
//! # Format
//!
//! ```text
//! [8-byte magic "VARPACK\0"][4-byte LE format version][bincode payload]
//! ```
//!
//! The payload is the `bincode` (standard configuration) encoding of either a
//! single [`Value`] (separated variables) or a `BTreeMap<String, Value>` (the
//! shared miscellaneous file). Memory-mapped arrays are materialized before
//! encoding, so payloads never depend on files outside themselves except
//! through explicit placeholders.

use crate::error::{Error, Result};
use crate::fs_util::write_atomic;
use crate::value::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use tracing::debug;

const MAGIC: &[u8; 8] = b"VARPACK\0";

/// Current payload format version
pub const FORMAT_VERSION: u32 = 1;

fn bin_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

/// Value with every memory-mapped array replaced by an owned copy
fn encodable(value: &Value) -> Result<Cow<'_, Value>> {
    if value.contains_mapped() {
        Ok(Cow::Owned(value.materialized()?))
    } else {
        Ok(Cow::Borrowed(value))
    }
}

/// Write one value to `path`
pub fn write_value(path: &Path, value: &Value) -> Result<()> {
    let value = encodable(value)?;
    write_payload(path, value.as_ref())
}

/// Write a group of named values to `path`
pub fn write_values<'a, I>(path: &Path, values: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, &'a Value)>,
{
    let group = values
        .into_iter()
        .map(|(name, value)| Ok((name, encodable(value)?)))
        .collect::<Result<BTreeMap<&str, Cow<'_, Value>>>>()?;
    write_payload(path, &group)
}

/// Read one value from `path`
pub fn read_value(path: &Path) -> Result<Value> {
    read_payload(path)
}

/// Read a group of named values from `path`
pub fn read_values(path: &Path) -> Result<BTreeMap<String, Value>> {
    read_payload(path)
}

fn write_payload<T: Serialize + ?Sized>(path: &Path, payload: &T) -> Result<()> {
    write_atomic(path, |writer| {
        writer
            .write_all(MAGIC)
            .and_then(|_| writer.write_all(&FORMAT_VERSION.to_le_bytes()))
            .map_err(|e| Error::Storage(format!("Failed to write header of {:?}: {}", path, e)))?;

        let written = bincode::serde::encode_into_std_write(payload, writer, bin_config())
            .map_err(|e| Error::Serialization(format!("Failed to encode {:?}: {}", path, e)))?;

        debug!(path = ?path, bytes = written, "Wrote object file");
        Ok(())
    })
}

fn read_payload<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)
        .map_err(|e| Error::Storage(format!("Failed to open {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let mut header = [0u8; 12];
    reader
        .read_exact(&mut header)
        .map_err(|e| Error::Serialization(format!("Failed to read header of {:?}: {}", path, e)))?;

    if &header[0..8] != MAGIC {
        return Err(Error::Serialization(format!(
            "{:?} is not a varpack object file",
            path
        )));
    }

    let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    if version != FORMAT_VERSION {
        return Err(Error::Serialization(format!(
            "Unsupported object format version {} in {:?} (expected {})",
            version, path, FORMAT_VERSION
        )));
    }

    bincode::serde::decode_from_std_read(&mut reader, bin_config())
        .map_err(|e| Error::Serialization(format!("Failed to decode {:?}: {}", path, e)))
}
