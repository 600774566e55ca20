// src/dag/state_manager.rs

//! Authoritative per-run state.
//!
//! Every node transition goes through [`StateManager`]. The whole table sits
//! behind one lock, so wave bookkeeping always sees a consistent view and the
//! event stream matches transition order even when nodes finish concurrently.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::dag::events::{EventKind, EventListener, ExecutionEvent, ListenerList, SubscriptionId, deliver};
use crate::dag::graph::Graph;
use crate::dag::node::{NodeId, RetryPolicy};
use crate::dag::node_state::{NodeState, NodeStatus, SkipReason};
use crate::dag::outcome::{TaskError, TaskResult, TokenUsage};
use crate::errors::{DagwaveError, Result};

/// Lifecycle of the run as seen by the state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaveRecord {
    pub index: usize,
    pub node_ids: Vec<NodeId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StateCounts {
    fn add(&mut self, status: NodeStatus) {
        match status {
            NodeStatus::Pending => self.pending += 1,
            NodeStatus::Running => self.running += 1,
            NodeStatus::Retrying => self.retrying += 1,
            NodeStatus::Completed => self.completed += 1,
            NodeStatus::Failed => self.failed += 1,
            NodeStatus::Skipped => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.retrying + self.completed + self.failed + self.skipped
    }

    pub fn terminal(&self) -> usize {
        self.completed + self.failed + self.skipped
    }
}

/// Point-in-time copy of the run. Owns all of its data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub graph_id: String,
    pub status: RunStatus,
    pub nodes: BTreeMap<NodeId, NodeState>,
    pub waves: Vec<WaveRecord>,
    pub current_wave: Option<usize>,
    pub total_waves: usize,
    pub counts: StateCounts,
    pub usage: TokenUsage,
    /// Errors of nodes that ended `failed`, in the order they failed.
    pub errors: Vec<TaskError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSnapshot {
    pub fn node(&self, id: &str) -> Option<&NodeState> {
        self.nodes.get(id)
    }

    pub fn status_of(&self, id: &str) -> Option<NodeStatus> {
        self.nodes.get(id).map(|s| s.status)
    }

    /// Number of waves that were actually started.
    pub fn waves_taken(&self) -> usize {
        self.waves.len()
    }

    /// Nodes that were dispatched in wave `index`.
    pub fn nodes_in_wave(&self, index: usize) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|(_, s)| s.wave == Some(index))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn is_wave_complete(&self, index: usize) -> bool {
        self.waves
            .iter()
            .find(|w| w.index == index)
            .is_some_and(|w| {
                w.node_ids.iter().all(|id| {
                    self.nodes
                        .get(id)
                        .is_some_and(|s| s.status.is_terminal())
                })
            })
    }

    pub fn is_finished(&self) -> bool {
        self.counts.terminal() == self.counts.total()
    }
}

/// Result of [`StateManager::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// The node moved to `retrying`; dispatch again after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// The node moved to `failed`.
    Failed,
}

struct RunTable {
    status: RunStatus,
    nodes: BTreeMap<NodeId, NodeState>,
    policies: HashMap<NodeId, RetryPolicy>,
    waves: Vec<WaveRecord>,
    current_wave: Option<usize>,
    total_waves: usize,
    usage: TokenUsage,
    errors: Vec<TaskError>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl RunTable {
    fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for state in self.nodes.values() {
            counts.add(state.status);
        }
        counts
    }

    /// Check and apply `to`; nothing is touched when the move is illegal.
    fn transition(&mut self, node_id: &str, to: NodeStatus) -> Result<&mut NodeState> {
        let state = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| DagwaveError::NodeNotFound(node_id.to_string()))?;

        if !state.status.can_transition_to(to) {
            return Err(DagwaveError::InvalidStateTransition {
                node: node_id.to_string(),
                from: state.status,
                to,
            });
        }

        debug!(node = %node_id, from = %state.status, to = %to, "node transition");
        state.status = to;
        Ok(state)
    }
}

/// Owns the node-state table of a single run and emits events.
///
/// All methods take `&self`; share it with `Arc` across concurrent dispatches.
pub struct StateManager {
    run_id: String,
    graph_id: String,
    table: Mutex<RunTable>,
    listeners: Mutex<ListenerList>,
    next_subscription: AtomicU64,
}

impl StateManager {
    pub fn new(graph: &Graph, run_id: impl Into<String>) -> Self {
        let nodes = graph
            .node_ids()
            .map(|id| (id.to_string(), NodeState::pending()))
            .collect();
        let policies = graph
            .nodes()
            .map(|n| (n.id.clone(), n.retry_policy.clone()))
            .collect();

        Self {
            run_id: run_id.into(),
            graph_id: graph.id().to_string(),
            table: Mutex::new(RunTable {
                status: RunStatus::Pending,
                nodes,
                policies,
                waves: Vec::new(),
                current_wave: None,
                total_waves: 0,
                usage: TokenUsage::default(),
                errors: Vec::new(),
                started_at: None,
                finished_at: None,
            }),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.lock_listeners().push((id, listener));
        id
    }

    /// Returns `false` when the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.lock_listeners();
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    pub fn begin_run(&self, total_waves: usize) {
        let mut table = self.lock_table();
        table.status = RunStatus::Running;
        table.total_waves = total_waves;
        table.started_at = Some(Utc::now());
        let total_nodes = table.nodes.len();
        self.emit(EventKind::RunStarted {
            graph_id: self.graph_id.clone(),
            total_nodes,
            total_waves,
        });
    }

    pub fn begin_wave(&self, index: usize, node_ids: &[NodeId]) {
        let mut table = self.lock_table();
        table.current_wave = Some(index);
        table.waves.push(WaveRecord {
            index,
            node_ids: node_ids.to_vec(),
            started_at: Utc::now(),
            finished_at: None,
        });
        self.emit(EventKind::WaveStarted {
            wave: index,
            node_ids: node_ids.to_vec(),
        });
    }

    pub fn end_wave(&self, index: usize) {
        let mut table = self.lock_table();
        let members: Vec<NodeId> = match table.waves.iter_mut().find(|w| w.index == index) {
            Some(record) => {
                record.finished_at = Some(Utc::now());
                record.node_ids.clone()
            }
            None => return,
        };

        let mut counts = StateCounts::default();
        for id in &members {
            if let Some(state) = table.nodes.get(id) {
                counts.add(state.status);
            }
        }
        self.emit(EventKind::WaveCompleted {
            wave: index,
            completed: counts.completed,
            failed: counts.failed,
            skipped: counts.skipped,
        });
    }

    /// `pending | retrying -> running`. Records the dispatch wave on the first
    /// start.
    pub fn start(&self, node_id: &str, wave: usize) -> Result<u32> {
        let mut table = self.lock_table();
        let state = table.transition(node_id, NodeStatus::Running)?;
        state.attempts += 1;
        if state.wave.is_none() {
            state.wave = Some(wave);
        }
        if state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
        let attempt = state.attempts;
        let wave = state.wave;

        self.emit(EventKind::NodeStarted {
            node_id: node_id.to_string(),
            wave,
            attempt,
        });
        Ok(attempt)
    }

    /// `running -> completed`.
    pub fn complete(&self, node_id: &str, result: TaskResult) -> Result<()> {
        let mut table = self.lock_table();
        let state = table.transition(node_id, NodeStatus::Completed)?;
        state.finished_at = Some(Utc::now());
        state.result = Some(result.clone());
        if let Some(usage) = result.usage {
            table.usage += usage;
        }

        self.emit(EventKind::NodeCompleted {
            node_id: node_id.to_string(),
            result,
        });
        Ok(())
    }

    /// `running -> retrying` when the node's policy classifies the error as
    /// retryable and attempts remain, otherwise `running | retrying -> failed`.
    pub fn fail(&self, node_id: &str, error: TaskError) -> Result<FailDisposition> {
        let mut table = self.lock_table();

        let (current, attempts) = table
            .nodes
            .get(node_id)
            .map(|s| (s.status, s.attempts))
            .ok_or_else(|| DagwaveError::NodeNotFound(node_id.to_string()))?;

        let retry = current == NodeStatus::Running
            && table.policies.get(node_id).is_some_and(|p| {
                p.classifies_retryable(&error) && p.has_attempts_left(attempts)
            });

        if retry {
            let delay = table
                .policies
                .get(node_id)
                .map(|p| p.backoff(attempts.saturating_sub(1)))
                .unwrap_or_default();
            let state = table.transition(node_id, NodeStatus::Retrying)?;
            state.error = Some(error.clone());

            self.emit(EventKind::NodeRetrying {
                node_id: node_id.to_string(),
                attempt: attempts,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error,
            });
            return Ok(FailDisposition::Retrying {
                attempt: attempts,
                delay,
            });
        }

        self.fail_locked(&mut table, node_id, error)?;
        Ok(FailDisposition::Failed)
    }

    /// `running | retrying -> failed` without consulting the retry policy.
    /// Used when the run itself stopped the node.
    pub fn fail_permanently(&self, node_id: &str, error: TaskError) -> Result<()> {
        let mut table = self.lock_table();
        self.fail_locked(&mut table, node_id, error)
    }

    fn fail_locked(&self, table: &mut RunTable, node_id: &str, error: TaskError) -> Result<()> {
        let state = table.transition(node_id, NodeStatus::Failed)?;
        state.finished_at = Some(Utc::now());
        state.error = Some(error.clone());
        table.errors.push(error.clone());

        self.emit(EventKind::NodeFailed {
            node_id: node_id.to_string(),
            error,
        });
        Ok(())
    }

    /// `pending -> skipped`.
    pub fn skip(&self, node_id: &str, reason: SkipReason) -> Result<()> {
        let mut table = self.lock_table();
        self.skip_locked(&mut table, node_id, reason)
    }

    fn skip_locked(&self, table: &mut RunTable, node_id: &str, reason: SkipReason) -> Result<()> {
        let state = table.transition(node_id, NodeStatus::Skipped)?;
        state.finished_at = Some(Utc::now());
        state.skip_reason = Some(reason);

        self.emit(EventKind::NodeSkipped {
            node_id: node_id.to_string(),
            reason,
        });
        Ok(())
    }

    /// Skip every pending node downstream of `origin`, transitively.
    ///
    /// Nodes that already left `pending` are left alone (and their
    /// descendants are not visited through them). Returns the newly skipped
    /// IDs.
    pub fn skip_descendants(
        &self,
        graph: &Graph,
        origin: &str,
        reason: SkipReason,
    ) -> Result<Vec<NodeId>> {
        let mut table = self.lock_table();
        let mut stack: Vec<&str> = graph.dependents_of(origin).iter().map(String::as_str).collect();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut skipped = Vec::new();

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let is_pending = table
                .nodes
                .get(id)
                .is_some_and(|s| s.status == NodeStatus::Pending);
            if !is_pending {
                continue;
            }

            debug!(node = %id, upstream = %origin, "skipping dependent of unsuccessful node");
            self.skip_locked(&mut table, id, reason)?;
            skipped.push(id.to_string());
            stack.extend(graph.dependents_of(id).iter().map(String::as_str));
        }

        Ok(skipped)
    }

    /// Skip every node still `pending`, in ID order.
    pub fn skip_all_pending(&self, reason: SkipReason) -> Result<Vec<NodeId>> {
        let mut table = self.lock_table();
        let pending: Vec<NodeId> = table
            .nodes
            .iter()
            .filter(|(_, s)| s.status == NodeStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &pending {
            self.skip_locked(&mut table, id, reason)?;
        }
        Ok(pending)
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.lock_table().nodes.get(node_id).map(|s| s.status)
    }

    /// Result of a completed node, for passing downstream.
    pub fn result_of(&self, node_id: &str) -> Option<TaskResult> {
        self.lock_table()
            .nodes
            .get(node_id)
            .and_then(|s| s.result.clone())
    }

    pub fn complete_run(&self) {
        let mut table = self.lock_table();
        let finished = Utc::now();
        table.status = RunStatus::Completed;
        table.finished_at = Some(finished);
        let duration_ms = elapsed_ms(table.started_at, finished);
        self.emit(EventKind::RunCompleted { duration_ms });
    }

    pub fn fail_run(&self, reason: impl Into<String>) {
        let mut table = self.lock_table();
        let finished = Utc::now();
        table.status = RunStatus::Failed;
        table.finished_at = Some(finished);
        let duration_ms = elapsed_ms(table.started_at, finished);
        self.emit(EventKind::RunFailed {
            duration_ms,
            reason: reason.into(),
        });
    }

    /// Owned copy of the whole table.
    pub fn snapshot(&self) -> RunSnapshot {
        let table = self.lock_table();
        RunSnapshot {
            run_id: self.run_id.clone(),
            graph_id: self.graph_id.clone(),
            status: table.status,
            nodes: table.nodes.clone(),
            waves: table.waves.clone(),
            current_wave: table.current_wave,
            total_waves: table.total_waves,
            counts: table.counts(),
            usage: table.usage,
            errors: table.errors.clone(),
            started_at: table.started_at,
            finished_at: table.finished_at,
        }
    }

    fn emit(&self, kind: EventKind) {
        let event = ExecutionEvent {
            run_id: self.run_id.clone(),
            timestamp: Utc::now(),
            kind,
        };
        let listeners = self.lock_listeners().clone();
        deliver(&listeners, &event);
    }

    fn lock_table(&self) -> MutexGuard<'_, RunTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, ListenerList> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn elapsed_ms(started: Option<DateTime<Utc>>, finished: DateTime<Utc>) -> u64 {
    started
        .map(|s| (finished - s).num_milliseconds().max(0) as u64)
        .unwrap_or(0)
}
