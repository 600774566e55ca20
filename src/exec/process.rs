// src/exec/process.rs

//! Process backend: one independent OS process per task.
//!
//! The program is spawned directly (no shell) from an argument template in
//! which `{prompt}` and `{model}` are substituted. Everything the task needs,
//! including upstream results, is serialized into the prompt.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dag::{NodeId, TaskError, TaskErrorKind};
use crate::errors::Result;
use crate::exec::backend::{
    BackendCapabilities, BackendFuture, ExecutionRequest, ExecutionResponse, ProgressCallback,
    ResponseMetadata, TaskBackend,
};
use crate::exec::batch::execute_batched;
use crate::exec::prompt::{parse_task_output, render_process_prompt};
use crate::exec::task_runner::{ChildEnd, run_program};
use crate::types::BackendKind;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessBackendConfig {
    pub program: String,
    /// Argument template; `{prompt}` and `{model}` are substituted per task.
    pub args: Vec<String>,
    pub default_model: String,
    pub default_timeout: Duration,
    pub max_processes: usize,
    pub working_dir: Option<PathBuf>,
}

impl Default for ProcessBackendConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec![
                "-p".to_string(),
                "{prompt}".to_string(),
                "--model".to_string(),
                "{model}".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
            ],
            default_model: "sonnet".to_string(),
            default_timeout: Duration::from_secs(300),
            max_processes: 10,
            working_dir: None,
        }
    }
}

pub struct ProcessBackend {
    config: ProcessBackendConfig,
    /// Kill switches of in-flight children, used by `cleanup`.
    active: Mutex<HashMap<u64, CancellationToken>>,
    next_slot: AtomicU64,
}

impl ProcessBackend {
    pub fn new(config: ProcessBackendConfig) -> Self {
        Self {
            config,
            active: Mutex::new(HashMap::new()),
            next_slot: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ProcessBackendConfig {
        &self.config
    }

    /// Number of children currently running.
    pub fn active_processes(&self) -> usize {
        self.lock_active().len()
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<u64, CancellationToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn render_args(&self, prompt: &str, model: &str) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|a| a.replace("{prompt}", prompt).replace("{model}", model))
            .collect()
    }

    async fn run(&self, request: ExecutionRequest) -> ExecutionResponse {
        let started = Instant::now();
        let node_id = request.node_id.clone();
        let prompt = render_process_prompt(&request);
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);

        let kill = request.cancel.child_token();
        let _slot = ActiveSlot::register(self, kill.clone());

        let args = self.render_args(&prompt, &model);
        let end = run_program(
            &node_id,
            &self.config.program,
            &args,
            self.config.working_dir.as_deref(),
            timeout,
            &kill,
        )
        .await;

        let mut metadata = ResponseMetadata::new(BackendKind::Process, started.elapsed());
        match end {
            Ok(ChildEnd::Exited {
                code,
                success: true,
                stdout,
            }) => {
                metadata.exit_code = code;
                let result = parse_task_output(&stdout);
                metadata.raw_output = Some(stdout);
                ExecutionResponse::success(node_id, result, metadata)
            }
            Ok(ChildEnd::Exited { code, stdout, .. }) => {
                metadata.exit_code = code;
                metadata.raw_output = Some(stdout);
                let error = TaskError::new(
                    TaskErrorKind::ToolError,
                    &node_id,
                    format!(
                        "'{}' exited with code {}",
                        self.config.program,
                        code.map_or_else(|| "none".to_string(), |c| c.to_string())
                    ),
                )
                .with_retryable(true);
                ExecutionResponse::failure(error, metadata)
            }
            Ok(ChildEnd::TimedOut(after)) => {
                ExecutionResponse::failure(TaskError::timeout(&node_id, after), metadata)
            }
            Ok(ChildEnd::Cancelled) => {
                ExecutionResponse::failure(TaskError::cancelled(&node_id), metadata)
            }
            Err(err) => {
                let error = TaskError::new(TaskErrorKind::ToolError, &node_id, format!("{err:#}"))
                    .with_retryable(false);
                ExecutionResponse::failure(error, metadata)
            }
        }
    }
}

/// Entry in the in-flight table, removed when the attempt's future ends or
/// is dropped mid-run.
struct ActiveSlot<'a> {
    backend: &'a ProcessBackend,
    id: u64,
}

impl<'a> ActiveSlot<'a> {
    fn register(backend: &'a ProcessBackend, kill: CancellationToken) -> Self {
        let id = backend.next_slot.fetch_add(1, Ordering::Relaxed);
        backend.lock_active().insert(id, kill);
        Self { backend, id }
    }
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.backend.lock_active().remove(&self.id);
    }
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new(ProcessBackendConfig::default())
    }
}

impl TaskBackend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    fn name(&self) -> &str {
        "process"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            max_parallelism: self.config.max_processes,
            token_overhead_per_task: 0,
            shared_context: false,
            supports_streaming: false,
            true_isolation: true,
            efficient_dependency_passing: false,
        }
    }

    fn is_available(&self) -> BackendFuture<'_, bool> {
        Box::pin(async move {
            let found = which::which(&self.config.program).is_ok();
            debug!(program = %self.config.program, found, "probed process backend");
            found
        })
    }

    fn execute(&self, request: ExecutionRequest) -> BackendFuture<'_, ExecutionResponse> {
        Box::pin(self.run(request))
    }

    fn execute_parallel(
        &self,
        requests: Vec<ExecutionRequest>,
        on_progress: Option<ProgressCallback>,
    ) -> BackendFuture<'_, HashMap<NodeId, ExecutionResponse>> {
        let ceiling = self.capabilities().parallelism_ceiling();
        Box::pin(execute_batched(self, requests, ceiling, on_progress))
    }

    fn cleanup(&self) -> BackendFuture<'_, Result<()>> {
        Box::pin(async move {
            let tokens: Vec<CancellationToken> =
                self.lock_active().drain().map(|(_, t)| t).collect();
            if !tokens.is_empty() {
                info!(count = tokens.len(), "killing in-flight task processes");
            }
            for token in tokens {
                token.cancel();
            }
            Ok(())
        })
    }
}
