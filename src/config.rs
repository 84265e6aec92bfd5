//! Placement configuration
//!
//! Defaults can be overridden from TOML, either directly from a string or
//! from a file layered with `VARPACK_*` environment variables:
//!
//! ```toml
//! max_dict_keys = 1000
//! min_dict_array_len = 10000
//! sep_var_min_size = 104857600
//! mmap_mode = "r+"        # "r+", "r", "c" or "none"
//! ```

use crate::array::mapped::MapMode;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default size (bytes) at which a variable gets its own object file
pub const DEFAULT_SEP_VAR_MIN_SIZE: u64 = 100 * 1024 * 1024;

/// Tuning knobs for the placement policy and loading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// Mappings with this many keys or more are never scanned for arrays
    pub max_dict_keys: usize,
    /// Arrays inside mappings with at least this many elements are spilled
    pub min_dict_array_len: usize,
    /// Variables whose estimated size reaches this get their own file
    pub sep_var_min_size: u64,
    /// How array files are mapped on load; `None` reads them into memory
    #[serde(with = "mode_option")]
    pub mmap_mode: Option<MapMode>,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            max_dict_keys: 1000,
            min_dict_array_len: 10_000,
            sep_var_min_size: DEFAULT_SEP_VAR_MIN_SIZE,
            mmap_mode: Some(MapMode::ReadWrite),
        }
    }
}

impl PackConfig {
    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("Invalid pack config: {}", e)))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(format!("Failed to render config: {}", e)))
    }

    /// Load from a config file, then apply `VARPACK_*` environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::layered(path, config::Environment::with_prefix("VARPACK"))
    }

    fn layered(path: &Path, env: config::Environment) -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(env.try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(format!("Failed to load {:?}: {}", path, e)))
    }
}

/// `Option<MapMode>` as a plain string, `"none"` meaning no mapping
mod mode_option {
    use super::MapMode;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        mode: &Option<MapMode>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(mode.map(|m| m.as_str()).unwrap_or("none"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<MapMode>, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        text.parse().map(Some).map_err(serde::de::Error::custom)
    }
}
