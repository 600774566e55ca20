// src/dag/events.rs

//! Execution events and listener delivery.
//!
//! Events are emitted by the [`StateManager`](crate::dag::StateManager) in
//! transition order. Delivery is synchronous; a listener that returns an
//! error or panics is logged and skipped, the run carries on.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dag::node::NodeId;
use crate::dag::node_state::SkipReason;
use crate::dag::outcome::{TaskError, TaskResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionEvent {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        graph_id: String,
        total_nodes: usize,
        total_waves: usize,
    },
    WaveStarted {
        wave: usize,
        node_ids: Vec<NodeId>,
    },
    WaveCompleted {
        wave: usize,
        completed: usize,
        failed: usize,
        skipped: usize,
    },
    NodeStarted {
        node_id: NodeId,
        wave: Option<usize>,
        attempt: u32,
    },
    NodeCompleted {
        node_id: NodeId,
        result: TaskResult,
    },
    NodeFailed {
        node_id: NodeId,
        error: TaskError,
    },
    NodeRetrying {
        node_id: NodeId,
        /// Attempt that just failed (1-based).
        attempt: u32,
        delay_ms: u64,
        error: TaskError,
    },
    NodeSkipped {
        node_id: NodeId,
        reason: SkipReason,
    },
    RunCompleted {
        duration_ms: u64,
    },
    RunFailed {
        duration_ms: u64,
        reason: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::RunStarted { .. } => "run:started",
            EventKind::WaveStarted { .. } => "wave:started",
            EventKind::WaveCompleted { .. } => "wave:completed",
            EventKind::NodeStarted { .. } => "node:start",
            EventKind::NodeCompleted { .. } => "node:complete",
            EventKind::NodeFailed { .. } => "node:failed",
            EventKind::NodeRetrying { .. } => "node:retrying",
            EventKind::NodeSkipped { .. } => "node:skipped",
            EventKind::RunCompleted { .. } => "run:completed",
            EventKind::RunFailed { .. } => "run:failed",
        }
    }

    /// The node this event is about, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            EventKind::NodeStarted { node_id, .. }
            | EventKind::NodeCompleted { node_id, .. }
            | EventKind::NodeFailed { node_id, .. }
            | EventKind::NodeRetrying { node_id, .. }
            | EventKind::NodeSkipped { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

/// Receives every event of a run.
///
/// Listeners run while the state table is locked, so they must not call back
/// into the `StateManager` that emitted the event.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ExecutionEvent) -> anyhow::Result<()>;
}

impl<F> EventListener for F
where
    F: Fn(&ExecutionEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &ExecutionEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

/// Forwards events into an unbounded channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventListener for ChannelListener {
    fn on_event(&self, event: &ExecutionEvent) -> anyhow::Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("event receiver dropped"))
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl EventListener for TracingListener {
    fn on_event(&self, event: &ExecutionEvent) -> anyhow::Result<()> {
        let run_id = event.run_id.as_str();
        match &event.kind {
            EventKind::RunStarted {
                graph_id,
                total_nodes,
                total_waves,
            } => info!(run_id, graph = %graph_id, total_nodes, total_waves, "run started"),
            EventKind::WaveStarted { wave, node_ids } => {
                info!(run_id, wave, nodes = ?node_ids, "wave started")
            }
            EventKind::WaveCompleted {
                wave,
                completed,
                failed,
                skipped,
            } => info!(run_id, wave, completed, failed, skipped, "wave completed"),
            EventKind::NodeStarted {
                node_id, attempt, ..
            } => debug!(run_id, node = %node_id, attempt, "node started"),
            EventKind::NodeCompleted { node_id, .. } => {
                info!(run_id, node = %node_id, "node completed")
            }
            EventKind::NodeFailed { node_id, error } => {
                warn!(run_id, node = %node_id, kind = %error.kind, error = %error.message, "node failed")
            }
            EventKind::NodeRetrying {
                node_id,
                attempt,
                delay_ms,
                error,
            } => warn!(
                run_id,
                node = %node_id,
                attempt,
                delay_ms,
                kind = %error.kind,
                "node failed; retrying"
            ),
            EventKind::NodeSkipped { node_id, reason } => {
                info!(run_id, node = %node_id, %reason, "node skipped")
            }
            EventKind::RunCompleted { duration_ms } => {
                info!(run_id, duration_ms, "run completed")
            }
            EventKind::RunFailed {
                duration_ms,
                reason,
            } => warn!(run_id, duration_ms, %reason, "run failed"),
        }
        Ok(())
    }
}

pub(crate) type ListenerList = Vec<(SubscriptionId, Arc<dyn EventListener>)>;

/// Deliver one event to every listener, isolating failures.
pub(crate) fn deliver(listeners: &ListenerList, event: &ExecutionEvent) {
    for (id, listener) in listeners {
        match panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(
                subscription = id.0,
                event = event.kind.name(),
                error = %err,
                "event listener failed"
            ),
            Err(_) => warn!(
                subscription = id.0,
                event = event.kind.name(),
                "event listener panicked"
            ),
        }
    }
}
