// src/dag/node.rs

//! Node definitions: one schedulable unit of work plus its retry policy.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use crate::dag::outcome::{TaskError, TaskErrorKind};

/// Node identifier (unique within a graph).
pub type NodeId = String;

/// Retry classification and backoff for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `1` disables retries.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Kinds that are always retried (subject to `max_attempts`).
    pub retryable: Vec<TaskErrorKind>,
    /// Kinds that are never retried, whatever the backend says.
    pub non_retryable: Vec<TaskErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            retryable: vec![TaskErrorKind::RateLimited, TaskErrorKind::ModelError],
            non_retryable: vec![TaskErrorKind::PermissionDenied, TaskErrorKind::InvalidInput],
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether `error` is eligible for another attempt, ignoring the attempt
    /// budget.
    ///
    /// The non-retryable list wins, then the retryable list, then the flag
    /// on the error itself. Timeouts and cancellations raised by the
    /// executor carry `retryable = false`, so they only retry when listed.
    pub fn classifies_retryable(&self, error: &TaskError) -> bool {
        if self.non_retryable.contains(&error.kind) {
            return false;
        }
        if self.retryable.contains(&error.kind) {
            return true;
        }
        error.retryable
    }

    /// Whether another attempt fits in the budget after `attempts_made`.
    pub fn has_attempts_left(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before retry number `retry` (0 for the first retry):
    /// `min(base_delay * multiplier^retry, max_delay)`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

/// One unit of work. Read-only once it is part of a [`Graph`](crate::dag::Graph).
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub description: String,
    pub prompt: String,
    pub skill_id: Option<String>,
    /// Nodes that must complete before this one may start.
    pub dependencies: Vec<NodeId>,
    pub retry_policy: RetryPolicy,
    /// Higher runs earlier within a wave when concurrency is constrained.
    pub priority: i32,
    /// Per-node timeout; `None` falls back to the run default.
    pub timeout: Option<Duration>,
    pub model: Option<String>,
    pub context: BTreeMap<String, Value>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>) -> Self {
        let id = id.into();
        Self {
            description: id.clone(),
            prompt: String::new(),
            id,
            skill_id: None,
            dependencies: Vec::new(),
            retry_policy: RetryPolicy::default(),
            priority: 0,
            timeout: None,
            model: None,
            context: BTreeMap::new(),
        }
    }

    pub fn depends_on(mut self, dep: impl Into<NodeId>) -> Self {
        let dep = dep.into();
        if !self.dependencies.contains(&dep) {
            self.dependencies.push(dep);
        }
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_skill(mut self, skill_id: impl Into<String>) -> Self {
        self.skill_id = Some(skill_id.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}
