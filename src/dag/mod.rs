// src/dag/mod.rs

//! Graph model, topology analysis and per-run state.
//!
//! - [`graph`] holds the immutable node graph and its builder.
//! - [`topology`] contains the pure queries: waves, cycles, critical path,
//!   closures and validation.
//! - [`state_manager`] is the run state machine; [`events`] is what it emits.

pub mod events;
pub mod graph;
pub mod node;
pub mod node_state;
pub mod outcome;
pub mod state_manager;
pub mod topology;

pub use events::{ChannelListener, EventKind, EventListener, ExecutionEvent, SubscriptionId, TracingListener};
pub use graph::{Graph, GraphBuilder};
pub use node::{Node, NodeId, RetryPolicy};
pub use node_state::{NodeState, NodeStatus, SkipReason};
pub use outcome::{TaskError, TaskErrorKind, TaskResult, TokenUsage};
pub use state_manager::{FailDisposition, RunSnapshot, RunStatus, StateCounts, StateManager, WaveRecord};
pub use topology::{
    CriticalPath, DagStats, IssueKind, TopologicalOrder, TopologyError, ValidationIssue,
    ValidationReport, Wave,
};
