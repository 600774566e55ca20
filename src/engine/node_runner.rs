// src/engine/node_runner.rs

//! Drives one node through its attempts: dispatch, per-attempt timeout,
//! retry with backoff, and interruption by cancellation or the run deadline.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::{FailDisposition, Node, NodeId, StateManager, TaskError, TaskResult};
use crate::errors::Result;
use crate::exec::{ExecutionRequest, TaskBackend};

/// Everything a node attempt needs from the surrounding run.
pub(crate) struct NodeContext<'a> {
    pub backend: &'a dyn TaskBackend,
    pub state: &'a StateManager,
    pub cancel: &'a CancellationToken,
    pub deadline: Option<Instant>,
    pub default_timeout: Duration,
}

impl NodeContext<'_> {
    /// Cancelled, or past the run deadline.
    pub fn interrupted(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline_passed()
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Terminal state a dispatched node ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeEnd {
    Completed,
    Failed,
}

enum AttemptEnd {
    Finished(std::result::Result<TaskResult, TaskError>),
    /// The run itself stopped the attempt; never retried.
    Interrupted(TaskError),
}

/// Run `node` until it completes or fails for good.
///
/// `Err` only for state-machine violations, which abort the run.
pub(crate) async fn run_node(ctx: &NodeContext<'_>, node: &Node, wave: usize) -> Result<NodeEnd> {
    let timeout = node.timeout.unwrap_or(ctx.default_timeout);

    loop {
        let attempt = ctx.state.start(&node.id, wave)?;
        debug!(node = %node.id, attempt, wave, timeout_ms = timeout.as_millis() as u64, "dispatching node");

        let error = match run_attempt(ctx, node, timeout).await {
            AttemptEnd::Finished(Ok(result)) => {
                ctx.state.complete(&node.id, result)?;
                info!(node = %node.id, attempt, "node completed");
                return Ok(NodeEnd::Completed);
            }
            AttemptEnd::Finished(Err(error)) => error,
            AttemptEnd::Interrupted(error) => {
                ctx.state.fail_permanently(&node.id, error)?;
                return Ok(NodeEnd::Failed);
            }
        };

        warn!(node = %node.id, attempt, kind = %error.kind, error = %error.message, "node attempt failed");
        match ctx.state.fail(&node.id, error)? {
            FailDisposition::Failed => return Ok(NodeEnd::Failed),
            FailDisposition::Retrying { attempt, delay } => {
                info!(node = %node.id, attempt, delay_ms = delay.as_millis() as u64, "retrying node after backoff");
                if let Some(error) = backoff(ctx, &node.id, delay).await {
                    ctx.state.fail_permanently(&node.id, error)?;
                    return Ok(NodeEnd::Failed);
                }
            }
        }
    }
}

async fn run_attempt(ctx: &NodeContext<'_>, node: &Node, timeout: Duration) -> AttemptEnd {
    let attempt_cancel = ctx.cancel.child_token();
    let request = ExecutionRequest::for_node(
        node,
        dependency_results(ctx.state, &node.dependencies),
        Some(timeout),
        attempt_cancel.clone(),
    );

    let end = tokio::select! {
        biased;

        _ = ctx.cancel.cancelled() => AttemptEnd::Interrupted(TaskError::cancelled(&node.id)),

        _ = deadline_reached(ctx.deadline) => {
            AttemptEnd::Interrupted(TaskError::deadline_exceeded(&node.id))
        }

        response = tokio::time::timeout(timeout, ctx.backend.execute(request)) => match response {
            Ok(response) => AttemptEnd::Finished(response.outcome),
            Err(_) => AttemptEnd::Finished(Err(TaskError::timeout(&node.id, timeout))),
        },
    };

    // Stops backends that keep working after their future is dropped.
    attempt_cancel.cancel();
    end
}

/// Sleep out a retry delay. Returns the interrupting error if the run was
/// cancelled or hit its deadline first.
async fn backoff(ctx: &NodeContext<'_>, node_id: &str, delay: Duration) -> Option<TaskError> {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Some(TaskError::cancelled(node_id)),
        _ = deadline_reached(ctx.deadline) => Some(TaskError::deadline_exceeded(node_id)),
        _ = tokio::time::sleep(delay) => None,
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Results of the direct dependencies; all of them are completed by the time
/// a node is dispatched.
fn dependency_results(state: &StateManager, deps: &[NodeId]) -> BTreeMap<NodeId, TaskResult> {
    deps.iter()
        .filter_map(|dep| state.result_of(dep).map(|r| (dep.clone(), r)))
        .collect()
}
