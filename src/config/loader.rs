// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Load a graph file from `path` and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a graph file and validate it.
///
/// A missing `[graph].id` defaults to the file stem (`release.toml` gives
/// `release`).
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    let mut raw_config = load_from_path(path)?;
    if raw_config.graph.id.is_none() {
        raw_config.graph.id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned());
    }
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// `Dagwave.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Dagwave.toml")
}
