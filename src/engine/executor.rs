// src/engine/executor.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dag::topology::{topological_sort, validate_dag};
use crate::dag::{
    EventListener, Graph, Node, NodeId, NodeStatus, SkipReason, StateManager, TopologicalOrder,
};
use crate::engine::node_runner::{NodeContext, NodeEnd, run_node};
use crate::engine::result::{ExecutionResult, RunError, RunErrorKind};
use crate::engine::{RunOptions, RunPhase};
use crate::errors::{DagwaveError, Result};
use crate::exec::TaskBackend;
use crate::types::FailurePolicy;

/// Executes graphs wave by wave on one backend.
///
/// The executor owns a cancellation token; cancelling it stops the current
/// run and every later one.
pub struct WaveExecutor {
    backend: Arc<dyn TaskBackend>,
    options: RunOptions,
    cancel: CancellationToken,
    listeners: Mutex<Vec<Arc<dyn EventListener>>>,
    phase: Mutex<RunPhase>,
}

impl WaveExecutor {
    pub fn new(backend: Arc<dyn TaskBackend>) -> Self {
        Self {
            backend,
            options: RunOptions::default(),
            cancel: CancellationToken::new(),
            listeners: Mutex::new(Vec::new()),
            phase: Mutex::new(RunPhase::NotStarted),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn backend(&self) -> &Arc<dyn TaskBackend> {
        &self.backend
    }

    /// Attach `listener` to the event stream of every subsequent run.
    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        lock(&self.listeners).push(listener);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn phase(&self) -> RunPhase {
        *lock(&self.phase)
    }

    fn set_phase(&self, phase: RunPhase) {
        debug!(%phase, "run phase");
        *lock(&self.phase) = phase;
    }

    /// Effective per-wave concurrency: wave size, backend ceiling and the
    /// configured limit, whichever is smallest.
    pub fn concurrency_limit(&self, wave_size: usize) -> usize {
        let mut limit = wave_size;
        if let Some(ceiling) = self.backend.capabilities().parallelism_ceiling() {
            limit = limit.min(ceiling);
        }
        if let Some(configured) = self.options.max_concurrency {
            limit = limit.min(configured);
        }
        limit.max(1)
    }

    /// Plan and execute `graph`. Never panics and never returns early without
    /// a full per-node status table.
    pub async fn run(&self, graph: &Graph) -> ExecutionResult {
        let started = Instant::now();
        let deadline = self.options.global_timeout.and_then(|t| started.checked_add(t));
        let run_id = Uuid::new_v4().to_string();

        let state = StateManager::new(graph, run_id.clone());
        for listener in lock(&self.listeners).iter() {
            state.subscribe(Arc::clone(listener));
        }

        self.set_phase(RunPhase::Planning);
        info!(
            run_id = %run_id,
            graph = %graph.id(),
            nodes = graph.len(),
            backend = self.backend.name(),
            "planning run"
        );

        let order = match self.plan(graph) {
            Ok(order) => order,
            Err(run_error) => {
                error!(run_id = %run_id, error = %run_error, "graph failed validation");
                state.fail_run(run_error.to_string());
                return self.finish(&state, started, RunPhase::Failed, Some(run_error));
            }
        };

        state.begin_run(order.waves.len());

        if !self.backend.is_available().await {
            let run_error = RunError::new(
                RunErrorKind::BackendUnavailable,
                format!("backend '{}' is not available", self.backend.name()),
            );
            error!(run_id = %run_id, error = %run_error, "aborting run");
            let phase = match state.skip_all_pending(SkipReason::BackendUnavailable) {
                Ok(_) => RunPhase::Failed,
                Err(err) => return self.abort_invariant(&state, started, err),
            };
            state.fail_run(run_error.to_string());
            return self.finish(&state, started, phase, Some(run_error));
        }

        let ctx = NodeContext {
            backend: self.backend.as_ref(),
            state: &state,
            cancel: &self.cancel,
            deadline,
            default_timeout: self.options.node_timeout,
        };

        match self.execute_waves(graph, &order, &ctx).await {
            Err(err) => self.abort_invariant(&state, started, err),
            Ok(Some(run_error)) => {
                let phase = match run_error.kind {
                    RunErrorKind::FailFast => RunPhase::Failed,
                    _ => RunPhase::Aborted,
                };
                warn!(run_id = %run_id, error = %run_error, "run stopped early");
                state.fail_run(run_error.to_string());
                self.finish(&state, started, phase, Some(run_error))
            }
            Ok(None) => {
                let failed = state.snapshot().counts.failed;
                if failed == 0 {
                    state.complete_run();
                    info!(run_id = %run_id, "run succeeded");
                    self.finish(&state, started, RunPhase::Succeeded, None)
                } else {
                    warn!(run_id = %run_id, failed, "run finished with failed nodes");
                    state.fail_run(format!("{failed} node(s) failed"));
                    self.finish(&state, started, RunPhase::Failed, None)
                }
            }
        }
    }

    fn plan(&self, graph: &Graph) -> std::result::Result<TopologicalOrder, RunError> {
        let report = validate_dag(graph);
        for warning in &report.warnings {
            warn!(graph = %graph.id(), "{}", warning.message);
        }
        if !report.is_valid() {
            let mut node_ids: Vec<NodeId> = Vec::new();
            for issue in &report.errors {
                for id in &issue.node_ids {
                    if !node_ids.contains(id) {
                        node_ids.push(id.clone());
                    }
                }
            }
            return Err(RunError::new(RunErrorKind::Structural, report.summary()).with_nodes(node_ids));
        }

        topological_sort(graph)
            .map_err(|err| RunError::new(RunErrorKind::Structural, err.to_string()))
    }

    /// `Ok(Some(_))` when the run stopped early, `Err` on a state-machine
    /// violation.
    async fn execute_waves(
        &self,
        graph: &Graph,
        order: &TopologicalOrder,
        ctx: &NodeContext<'_>,
    ) -> Result<Option<RunError>> {
        for wave in &order.waves {
            if let Some(run_error) = self.interruption(ctx)? {
                return Ok(Some(run_error));
            }

            self.set_phase(RunPhase::Executing(wave.index));
            ctx.state.begin_wave(wave.index, &wave.node_ids);

            let mut ready: Vec<&Node> = Vec::new();
            for id in &wave.node_ids {
                if ctx.state.status_of(id) != Some(NodeStatus::Pending) {
                    continue;
                }
                let deps_completed = graph
                    .dependencies_of(id)
                    .iter()
                    .all(|dep| ctx.state.status_of(dep) == Some(NodeStatus::Completed));
                if !deps_completed {
                    ctx.state.skip(id, SkipReason::DependencyFailed)?;
                    continue;
                }
                if let Some(node) = graph.node(id) {
                    ready.push(node);
                }
            }

            let limit = self.concurrency_limit(ready.len());
            info!(
                wave = wave.index,
                ready = ready.len(),
                limit,
                "executing wave"
            );
            let failed = self.dispatch_wave(wave.index, ready, limit, ctx).await?;
            ctx.state.end_wave(wave.index);

            if let Some(run_error) = self.interruption(ctx)? {
                return Ok(Some(run_error));
            }

            if failed.is_empty() {
                continue;
            }
            match self.options.failure_policy {
                FailurePolicy::FailFast => {
                    let skipped = ctx.state.skip_all_pending(SkipReason::FailFast)?;
                    info!(wave = wave.index, skipped = skipped.len(), "fail-fast: skipped remaining nodes");
                    return Ok(Some(
                        RunError::new(
                            RunErrorKind::FailFast,
                            format!("node(s) failed: {}", failed.join(", ")),
                        )
                        .with_nodes(failed),
                    ));
                }
                FailurePolicy::Continue => {
                    for id in &failed {
                        let skipped =
                            ctx.state
                                .skip_descendants(graph, id, SkipReason::DependencyFailed)?;
                        if !skipped.is_empty() {
                            debug!(node = %id, ?skipped, "skipped descendants of failed node");
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    /// Run the ready nodes of one wave, at most `limit` at a time. Returns the
    /// IDs of nodes that ended failed.
    async fn dispatch_wave(
        &self,
        wave: usize,
        ready: Vec<&Node>,
        limit: usize,
        ctx: &NodeContext<'_>,
    ) -> Result<Vec<NodeId>> {
        let semaphore = Semaphore::new(limit);
        let semaphore = &semaphore;
        let halted = AtomicBool::new(false);
        let halted = &halted;
        let fail_fast = self.options.failure_policy == FailurePolicy::FailFast;

        let mut in_flight = FuturesUnordered::new();
        for node in ready {
            in_flight.push(async move {
                // The semaphore is never closed, so acquiring cannot fail.
                let _permit = semaphore.acquire().await.ok();
                if ctx.interrupted() || halted.load(Ordering::SeqCst) {
                    debug!(node = %node.id, "not dispatching; run is stopping");
                    return Ok::<_, DagwaveError>((node.id.as_str(), None));
                }
                let end = run_node(ctx, node, wave).await?;
                if fail_fast && end == NodeEnd::Failed {
                    halted.store(true, Ordering::SeqCst);
                }
                Ok((node.id.as_str(), Some(end)))
            });
        }

        let mut failed = Vec::new();
        while let Some(outcome) = in_flight.next().await {
            let (id, end) = outcome?;
            if end == Some(NodeEnd::Failed) {
                failed.push(id.to_string());
            }
        }
        Ok(failed)
    }

    /// If the run was cancelled or ran out of time, skip whatever is still
    /// pending and report why.
    fn interruption(&self, ctx: &NodeContext<'_>) -> Result<Option<RunError>> {
        let (kind, reason, message) = if self.cancel.is_cancelled() {
            (RunErrorKind::Cancelled, SkipReason::Cancelled, "run was cancelled")
        } else if ctx.deadline_passed() {
            (
                RunErrorKind::DeadlineExceeded,
                SkipReason::DeadlineExceeded,
                "run deadline exceeded",
            )
        } else {
            return Ok(None);
        };

        let skipped = ctx.state.skip_all_pending(reason)?;
        Ok(Some(RunError::new(kind, message).with_nodes(skipped)))
    }

    fn abort_invariant(
        &self,
        state: &StateManager,
        started: Instant,
        err: DagwaveError,
    ) -> ExecutionResult {
        error!(run_id = %state.run_id(), error = %err, "scheduler invariant violated; aborting run");
        let mut run_error = RunError::new(RunErrorKind::SchedulerInvariant, err.to_string());
        if let DagwaveError::InvalidStateTransition { node, .. } = &err {
            run_error = run_error.with_nodes(vec![node.clone()]);
        }
        state.fail_run(run_error.to_string());
        self.finish(state, started, RunPhase::Aborted, Some(run_error))
    }

    fn finish(
        &self,
        state: &StateManager,
        started: Instant,
        phase: RunPhase,
        run_error: Option<RunError>,
    ) -> ExecutionResult {
        self.set_phase(phase);
        let snapshot = state.snapshot();
        ExecutionResult {
            run_id: snapshot.run_id.clone(),
            success: phase == RunPhase::Succeeded,
            phase,
            usage: snapshot.usage,
            elapsed: started.elapsed(),
            errors: snapshot.errors.clone(),
            run_error,
            snapshot,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
