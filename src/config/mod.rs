// src/config/mod.rs

//! Graph files.
//!
//! - [`model`] is the TOML data model, raw and validated.
//! - [`loader`] reads a file from disk.
//! - [`validate`] turns the raw model into nodes, run options and backend
//!   settings, rejecting anything that cannot run.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{ConfigFile, NodeConfig, RawConfigFile, RetrySection};
