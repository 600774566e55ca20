use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dagwave::dag::{NodeId, TaskError, TaskErrorKind, TaskResult, TokenUsage};
use dagwave::errors::Result;
use dagwave::exec::batch::execute_batched;
use dagwave::exec::{
    BackendCapabilities, BackendFuture, ExecutionRequest, ExecutionResponse, ProgressCallback,
    ResponseMetadata, TaskBackend,
};
use dagwave::types::BackendKind;
use serde_json::{Value, json};

/// What one scripted attempt does.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(Value),
    Fail {
        kind: TaskErrorKind,
        retryable: bool,
    },
    /// Never finishes on its own; ends only when the attempt is cancelled or
    /// dropped.
    Hang,
}

impl Step {
    pub fn fail(kind: TaskErrorKind) -> Self {
        Step::Fail {
            kind,
            retryable: false,
        }
    }

    pub fn transient(kind: TaskErrorKind) -> Self {
        Step::Fail {
            kind,
            retryable: true,
        }
    }
}

/// One observed dispatch.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub node_id: NodeId,
    pub at: Instant,
    /// Dependency results that came with the request.
    pub dependency_ids: Vec<NodeId>,
}

/// Usage reported by every default success.
pub const SCRIPTED_USAGE: TokenUsage = TokenUsage {
    input_tokens: 10,
    output_tokens: 5,
    cache_read_tokens: 0,
    cache_write_tokens: 0,
};

/// A backend that:
/// - records every attempt (node, time, dependency results it received)
/// - plays back a per-node script of outcomes, succeeding once a script is
///   exhausted
/// - tracks peak concurrency
/// - honours request cancellation.
pub struct ScriptedBackend {
    kind: BackendKind,
    name: String,
    capabilities: BackendCapabilities,
    available: bool,
    delay: Duration,
    node_delays: HashMap<NodeId, Duration>,
    scripts: Mutex<HashMap<NodeId, VecDeque<Step>>>,
    attempts: Mutex<Vec<Attempt>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    cleaned_up: AtomicBool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            kind: BackendKind::Process,
            name: "scripted".to_string(),
            capabilities: BackendCapabilities {
                max_parallelism: 0,
                token_overhead_per_task: 0,
                shared_context: false,
                supports_streaming: false,
                true_isolation: true,
                efficient_dependency_passing: false,
            },
            available: true,
            delay: Duration::ZERO,
            node_delays: HashMap::new(),
            scripts: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            cleaned_up: AtomicBool::new(false),
        }
    }

    pub fn named(mut self, kind: BackendKind, name: &str) -> Self {
        self.kind = kind;
        self.name = name.to_string();
        self
    }

    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_max_parallelism(mut self, max: usize) -> Self {
        self.capabilities.max_parallelism = max;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Latency of every attempt.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Latency of attempts of one node, overriding `with_delay`.
    pub fn with_node_delay(mut self, node_id: &str, delay: Duration) -> Self {
        self.node_delays.insert(node_id.to_string(), delay);
        self
    }

    pub fn script(self, node_id: &str, steps: Vec<Step>) -> Self {
        lock(&self.scripts).insert(node_id.to_string(), steps.into());
        self
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        lock(&self.attempts).clone()
    }

    pub fn attempts_for(&self, node_id: &str) -> Vec<Attempt> {
        lock(&self.attempts)
            .iter()
            .filter(|a| a.node_id == node_id)
            .cloned()
            .collect()
    }

    /// Node IDs in dispatch order (one entry per attempt).
    pub fn dispatched(&self) -> Vec<NodeId> {
        lock(&self.attempts).iter().map(|a| a.node_id.clone()).collect()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn was_cleaned_up(&self) -> bool {
        self.cleaned_up.load(Ordering::SeqCst)
    }

    fn next_step(&self, node_id: &str) -> Step {
        lock(&self.scripts)
            .get_mut(node_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Step::Succeed(json!({ "node": node_id })))
    }

    async fn run(&self, request: ExecutionRequest) -> ExecutionResponse {
        let started = Instant::now();
        let node_id = request.node_id.clone();
        lock(&self.attempts).push(Attempt {
            node_id: node_id.clone(),
            at: started,
            dependency_ids: request.dependency_results.keys().cloned().collect(),
        });

        let _guard = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        let step = self.next_step(&node_id);
        let delay = self.node_delays.get(&node_id).copied().unwrap_or(self.delay);

        let cancelled = tokio::select! {
            _ = request.cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        };
        let metadata = ResponseMetadata::new(self.kind, started.elapsed());
        if cancelled {
            return ExecutionResponse::failure(TaskError::cancelled(&node_id), metadata);
        }

        match step {
            Step::Succeed(output) => ExecutionResponse::success(
                node_id,
                TaskResult::new(output).with_usage(SCRIPTED_USAGE),
                metadata,
            ),
            Step::Fail { kind, retryable } => ExecutionResponse::failure(
                TaskError::new(kind, &node_id, "scripted failure").with_retryable(retryable),
                metadata,
            ),
            Step::Hang => {
                request.cancel.cancelled().await;
                ExecutionResponse::failure(TaskError::cancelled(&node_id), metadata)
            }
        }
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn is_available(&self) -> BackendFuture<'_, bool> {
        let available = self.available;
        Box::pin(async move { available })
    }

    fn execute(&self, request: ExecutionRequest) -> BackendFuture<'_, ExecutionResponse> {
        Box::pin(self.run(request))
    }

    fn execute_parallel(
        &self,
        requests: Vec<ExecutionRequest>,
        on_progress: Option<ProgressCallback>,
    ) -> BackendFuture<'_, HashMap<NodeId, ExecutionResponse>> {
        let ceiling = self.capabilities.parallelism_ceiling();
        Box::pin(execute_batched(self, requests, ceiling, on_progress))
    }

    fn cleanup(&self) -> BackendFuture<'_, Result<()>> {
        self.cleaned_up.store(true, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// Counts an attempt as in flight until dropped, even if its future is
/// cancelled by the caller.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
