// src/errors.rs

//! Crate-wide error aliases and helpers.
//!
//! Task-level failures are not represented here; they travel as
//! [`TaskError`](crate::dag::TaskError) values inside backend responses.

use thiserror::Error;

use crate::dag::NodeStatus;

#[derive(Error, Debug)]
pub enum DagwaveError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Cycle detected in DAG: {0}")]
    DagCycle(String),

    #[error("Invalid state transition for node '{node}': {from} -> {to}")]
    InvalidStateTransition {
        node: String,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, DagwaveError>;
