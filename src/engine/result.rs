// src/engine/result.rs

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::dag::{NodeId, NodeStatus, RunSnapshot, TaskError, TokenUsage};
use crate::engine::RunPhase;

/// Why a run stopped short of success at the run level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunErrorKind {
    /// The graph failed validation; nothing was dispatched.
    Structural,
    /// An illegal state transition was requested.
    SchedulerInvariant,
    DeadlineExceeded,
    Cancelled,
    BackendUnavailable,
    /// A node failed under the fail-fast policy.
    FailFast,
}

impl RunErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunErrorKind::Structural => "STRUCTURAL",
            RunErrorKind::SchedulerInvariant => "SCHEDULER_INVARIANT",
            RunErrorKind::DeadlineExceeded => "DEADLINE_EXCEEDED",
            RunErrorKind::Cancelled => "CANCELLED",
            RunErrorKind::BackendUnavailable => "BACKEND_UNAVAILABLE",
            RunErrorKind::FailFast => "FAIL_FAST",
        }
    }
}

impl fmt::Display for RunErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RunError {
    pub kind: RunErrorKind,
    pub message: String,
    /// Nodes the cause is about, if any.
    pub node_ids: Vec<NodeId>,
}

impl RunError {
    pub fn new(kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            node_ids: Vec::new(),
        }
    }

    pub fn with_nodes(mut self, node_ids: Vec<NodeId>) -> Self {
        self.node_ids = node_ids;
        self
    }
}

/// Everything a caller needs to know about a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub run_id: String,
    pub success: bool,
    pub phase: RunPhase,
    pub snapshot: RunSnapshot,
    pub usage: TokenUsage,
    #[serde(rename = "elapsed_ms", serialize_with = "duration_ms")]
    pub elapsed: Duration,
    /// Node-level errors, in the order the nodes failed.
    pub errors: Vec<TaskError>,
    /// Run-level cause when the run did not succeed for a reason other than
    /// (or in addition to) node failures.
    pub run_error: Option<RunError>,
}

impl ExecutionResult {
    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.snapshot.status_of(node_id)
    }

    pub fn total_waves(&self) -> usize {
        self.snapshot.total_waves
    }

    pub fn run_error_kind(&self) -> Option<RunErrorKind> {
        self.run_error.as_ref().map(|e| e.kind)
    }
}

fn duration_ms<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
