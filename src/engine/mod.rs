// src/engine/mod.rs

//! Wave executor.
//!
//! A run is planned once (validation + wave plan) and then executed wave by
//! wave against a [`TaskBackend`](crate::exec::TaskBackend):
//!
//! - [`executor`] owns the run loop, concurrency bounds, deadline and
//!   cancellation handling, and skip propagation.
//! - [`node_runner`] drives one node through its attempts and backoff.
//! - [`result`] is what the caller gets back.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::types::FailurePolicy;

pub mod executor;
pub mod node_runner;
pub mod result;

pub use executor::WaveExecutor;
pub use result::{ExecutionResult, RunError, RunErrorKind};

pub const DEFAULT_GLOBAL_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Knobs of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub failure_policy: FailurePolicy,
    /// Upper bound on concurrent nodes per wave. `None` means the wave size
    /// (still capped by the backend).
    pub max_concurrency: Option<usize>,
    /// Run-wide deadline measured from the start of planning. `None` disables
    /// it.
    pub global_timeout: Option<Duration>,
    /// Per-attempt timeout for nodes that do not set their own.
    pub node_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Continue,
            max_concurrency: None,
            global_timeout: Some(DEFAULT_GLOBAL_TIMEOUT),
            node_timeout: DEFAULT_NODE_TIMEOUT,
        }
    }
}

impl RunOptions {
    pub fn fail_fast(mut self) -> Self {
        self.failure_policy = FailurePolicy::FailFast;
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_global_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.global_timeout = timeout;
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }
}

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "phase", content = "wave")]
pub enum RunPhase {
    NotStarted,
    Planning,
    Executing(usize),
    Succeeded,
    Failed,
    Aborted,
}

impl RunPhase {
    pub fn is_finished(&self) -> bool {
        matches!(self, RunPhase::Succeeded | RunPhase::Failed | RunPhase::Aborted)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::NotStarted => f.write_str("not-started"),
            RunPhase::Planning => f.write_str("planning"),
            RunPhase::Executing(wave) => write!(f, "executing(wave={wave})"),
            RunPhase::Succeeded => f.write_str("succeeded"),
            RunPhase::Failed => f.write_str("failed"),
            RunPhase::Aborted => f.write_str("aborted"),
        }
    }
}
