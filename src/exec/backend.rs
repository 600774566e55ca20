// src/exec/backend.rs

//! Pluggable task-execution backend abstraction.
//!
//! The executor talks to a [`TaskBackend`] instead of spawning anything
//! itself. Backends differ in isolation, cost and parallelism; those
//! differences are described by [`BackendCapabilities`] rather than by
//! which methods a backend happens to implement.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::dag::{Node, NodeId, TaskError, TaskResult};
use crate::errors::Result;
use crate::types::BackendKind;

/// Boxed future returned by backend methods.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Static description of what a backend can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendCapabilities {
    /// Hard ceiling on concurrent tasks; `0` means unbounded.
    pub max_parallelism: usize,
    /// Fixed token cost paid per task regardless of payload.
    pub token_overhead_per_task: u64,
    /// Tasks can see the orchestrator's own session state.
    pub shared_context: bool,
    pub supports_streaming: bool,
    /// No possibility of cross-task interference.
    pub true_isolation: bool,
    /// Dependency outputs are handed over without serializing them into a
    /// prompt or file.
    pub efficient_dependency_passing: bool,
}

impl BackendCapabilities {
    pub fn parallelism_ceiling(&self) -> Option<usize> {
        (self.max_parallelism > 0).then_some(self.max_parallelism)
    }
}

/// Dispatch payload for one node attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub node_id: NodeId,
    pub description: String,
    pub prompt: String,
    pub skill_id: Option<String>,
    pub model: Option<String>,
    /// Results of the node's direct dependencies.
    pub dependency_results: BTreeMap<NodeId, TaskResult>,
    pub context: BTreeMap<String, Value>,
    pub timeout: Option<Duration>,
    /// Fires when the attempt should stop (node timeout or run cancellation).
    pub cancel: CancellationToken,
}

impl ExecutionRequest {
    pub fn new(node_id: impl Into<NodeId>, prompt: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            description: node_id.clone(),
            node_id,
            prompt: prompt.into(),
            skill_id: None,
            model: None,
            dependency_results: BTreeMap::new(),
            context: BTreeMap::new(),
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn for_node(
        node: &Node,
        dependency_results: BTreeMap<NodeId, TaskResult>,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node_id: node.id.clone(),
            description: node.description.clone(),
            prompt: node.prompt.clone(),
            skill_id: node.skill_id.clone(),
            model: node.model.clone(),
            dependency_results,
            context: node.context.clone(),
            timeout,
            cancel,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseMetadata {
    pub backend: Option<BackendKind>,
    pub duration_ms: u64,
    pub branch: Option<String>,
    pub exit_code: Option<i32>,
    pub raw_output: Option<String>,
}

impl ResponseMetadata {
    pub fn new(backend: BackendKind, duration: Duration) -> Self {
        Self {
            backend: Some(backend),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            ..Self::default()
        }
    }
}

/// What a backend returns for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResponse {
    pub node_id: NodeId,
    pub outcome: std::result::Result<TaskResult, TaskError>,
    pub metadata: ResponseMetadata,
}

impl ExecutionResponse {
    pub fn success(node_id: impl Into<NodeId>, result: TaskResult, metadata: ResponseMetadata) -> Self {
        Self {
            node_id: node_id.into(),
            outcome: Ok(result),
            metadata,
        }
    }

    pub fn failure(error: TaskError, metadata: ResponseMetadata) -> Self {
        Self {
            node_id: error.node_id.clone(),
            outcome: Err(error),
            metadata,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Queued,
    Starting,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionProgress {
    pub node_id: NodeId,
    pub status: ProgressStatus,
    pub message: Option<String>,
}

pub type ProgressCallback = Arc<dyn Fn(ExecutionProgress) + Send + Sync>;

/// Contract every backend implements in full.
pub trait TaskBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Human-readable name used in logs and comparison tables.
    fn name(&self) -> &str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Environment probe, e.g. "is the external binary on PATH".
    fn is_available(&self) -> BackendFuture<'_, bool>;

    /// Run one attempt. Failures are reported in the response, never as a
    /// panic or a dropped future.
    fn execute(&self, request: ExecutionRequest) -> BackendFuture<'_, ExecutionResponse>;

    /// Run a batch, respecting `max_parallelism`, reporting progress per task.
    fn execute_parallel(
        &self,
        requests: Vec<ExecutionRequest>,
        on_progress: Option<ProgressCallback>,
    ) -> BackendFuture<'_, HashMap<NodeId, ExecutionResponse>>;

    /// Release processes, checkouts and anything else the backend holds.
    fn cleanup(&self) -> BackendFuture<'_, Result<()>>;
}
