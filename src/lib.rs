// Varpack - Rust Implementation
// Directory-backed persistence for named variables and numeric arrays

#![warn(rust_2018_idioms)]

pub mod array;
pub mod codec;
pub mod config;
pub mod fs_util;
pub mod manifest;
pub mod pack;
pub mod placeholder;
pub mod placement;
pub mod size;
pub mod value;

// Re-exports for convenience
pub use array::mapped::{MapMode, MappedArray};
pub use array::{ArrayData, DType, Element};
pub use config::PackConfig;
pub use manifest::{Manifest, ManifestEntry};
pub use pack::{LoadFailure, LoadOptions, LoadReport, Pack, SaveOptions, SaveReport};
pub use placeholder::ArrayPlaceholder;
pub use value::Value;

/// Fixed name of the manifest file inside every pack directory
pub const MANIFEST_FILENAME: &str = "varpack.json";

/// Fixed name of the shared object file holding all non-separated variables
pub const MISC_FILENAME: &str = "misc_vars.vpk";

/// Extension of standalone and spilled array files
pub const ARRAY_EXT: &str = "npy";

/// Extension of individually separated object files
pub const OBJECT_EXT: &str = "vpk";

/// Varpack error types
pub mod error {
    use std::path::PathBuf;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Pack already attached to {current:?}, refusing to attach to {requested:?}")]
        AlreadyAttached { current: PathBuf, requested: PathBuf },

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Manifest error: {0}")]
        Manifest(String),

        #[error("Failed to load {file}: {reason}")]
        Load { file: String, reason: String },

        #[error("Failed to resolve array placeholder {file}: {reason}")]
        Placeholder { file: String, reason: String },

        #[error("Storage error: {0}")]
        Storage(String),

        #[error("Serialization error: {0}")]
        Serialization(String),

        #[error("Array error: {0}")]
        Array(String),

        #[error("Not found: {0}")]
        NotFound(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
