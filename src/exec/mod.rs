// src/exec/mod.rs

//! Task execution backends.
//!
//! - [`backend`] defines the [`TaskBackend`] contract and its payload types.
//! - [`process`], [`worktree`] and [`shared_context`] are the built-in
//!   backends; [`registry`] picks between them.
//! - [`task_runner`] spawns child processes for the first two;
//!   [`prompt`] renders their input and parses their output.

pub mod backend;
pub mod batch;
pub mod process;
pub mod prompt;
pub mod registry;
pub mod shared_context;
pub(crate) mod task_runner;
pub mod worktree;

pub use backend::{
    BackendCapabilities, BackendFuture, ExecutionProgress, ExecutionRequest, ExecutionResponse,
    ProgressCallback, ProgressStatus, ResponseMetadata, TaskBackend,
};
pub use process::{ProcessBackend, ProcessBackendConfig};
pub use registry::{
    BackendComparison, BackendRegistry, BackendRequirements, BackendSettings,
};
pub use shared_context::{SharedContextBackend, SharedContextConfig, TaskToolCall};
pub use worktree::{MergeOutcome, WorktreeBackend, WorktreeBackendConfig, WorktreeInfo};
