// src/dag/node_state.rs

//! Per-node status, transition table and the stored per-node state of a run.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::outcome::{TaskError, TaskResult};

/// Status of a node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Retrying => "retrying",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped
        )
    }

    /// The legal transition table.
    ///
    /// `Failed` has no outgoing edge: whether a failure is retried is decided
    /// when it happens (`Running -> Retrying`).
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Retrying)
                | (Retrying, Running)
                | (Retrying, Failed)
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a node never ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    /// A dependency failed or was itself skipped.
    DependencyFailed,
    /// Another node failed and the run uses fail-fast.
    FailFast,
    Cancelled,
    DeadlineExceeded,
    BackendUnavailable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::DependencyFailed => "DEPENDENCY_FAILED",
            SkipReason::FailFast => "FAIL_FAST",
            SkipReason::Cancelled => "CANCELLED",
            SkipReason::DeadlineExceeded => "DEADLINE_EXCEEDED",
            SkipReason::BackendUnavailable => "BACKEND_UNAVAILABLE",
        };
        f.write_str(s)
    }
}

/// Stored state of one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeState {
    pub status: NodeStatus,
    /// Wave the node was first dispatched in. `None` for nodes skipped before
    /// dispatch.
    pub wave: Option<usize>,
    /// Number of times the node entered `Running`.
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<TaskResult>,
    /// Last error seen, including ones that were retried.
    pub error: Option<TaskError>,
    pub skip_reason: Option<SkipReason>,
}

impl NodeState {
    pub(crate) fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            wave: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            skip_reason: None,
        }
    }
}
