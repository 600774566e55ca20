// src/dag/outcome.rs

//! Outcome of a single execution attempt: [`TaskResult`] on success,
//! [`TaskError`] on failure.

use std::fmt;
use std::ops::AddAssign;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::dag::node::NodeId;

/// Classified failure kind reported by a backend or by the executor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskErrorKind {
    Timeout,
    RateLimited,
    ModelError,
    ToolError,
    PermissionDenied,
    InvalidInput,
    InvalidOutput,
    Cancelled,
    DeadlineExceeded,
    InternalError,
    UnknownError,
}

impl TaskErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskErrorKind::Timeout => "TIMEOUT",
            TaskErrorKind::RateLimited => "RATE_LIMITED",
            TaskErrorKind::ModelError => "MODEL_ERROR",
            TaskErrorKind::ToolError => "TOOL_ERROR",
            TaskErrorKind::PermissionDenied => "PERMISSION_DENIED",
            TaskErrorKind::InvalidInput => "INVALID_INPUT",
            TaskErrorKind::InvalidOutput => "INVALID_OUTPUT",
            TaskErrorKind::Cancelled => "CANCELLED",
            TaskErrorKind::DeadlineExceeded => "DEADLINE_EXCEEDED",
            TaskErrorKind::InternalError => "INTERNAL_ERROR",
            TaskErrorKind::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Whether a freshly constructed error of this kind is flagged retryable.
    fn transient(&self) -> bool {
        matches!(
            self,
            TaskErrorKind::RateLimited | TaskErrorKind::ModelError | TaskErrorKind::ToolError
        )
    }
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{kind} in node '{node_id}': {message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
    pub node_id: NodeId,
    pub retryable: bool,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, node_id: impl Into<NodeId>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            node_id: node_id.into(),
            retryable: kind.transient(),
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn timeout(node_id: impl Into<NodeId>, after: Duration) -> Self {
        Self::new(
            TaskErrorKind::Timeout,
            node_id,
            format!("timed out after {}ms", after.as_millis()),
        )
    }

    pub fn cancelled(node_id: impl Into<NodeId>) -> Self {
        Self::new(TaskErrorKind::Cancelled, node_id, "run was cancelled")
    }

    pub fn deadline_exceeded(node_id: impl Into<NodeId>) -> Self {
        Self::new(
            TaskErrorKind::DeadlineExceeded,
            node_id,
            "run deadline exceeded",
        )
    }
}

/// Token accounting reported by backends that know about it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cache_read_tokens += rhs.cache_read_tokens;
        self.cache_write_tokens += rhs.cache_write_tokens;
    }
}

/// A successful attempt. `output` is opaque to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub output: Value,
    pub confidence: Option<f64>,
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl TaskResult {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            confidence: None,
            usage: None,
            warnings: Vec::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}
