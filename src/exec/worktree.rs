// src/exec/worktree.rs

//! Worktree backend: each task runs in its own git worktree on its own
//! branch, so file edits of concurrent tasks never collide.
//!
//! Task input is written to `TASK.md` in the checkout; the task is expected to
//! leave its result in `.dag-results/output.json`. Checkouts and branches are
//! kept until [`TaskBackend::cleanup`] so they can be inspected or merged with
//! [`WorktreeBackend::merge_all`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::dag::{NodeId, TaskError, TaskErrorKind, TaskResult};
use crate::errors::Result;
use crate::exec::backend::{
    BackendCapabilities, BackendFuture, ExecutionRequest, ExecutionResponse, ProgressCallback,
    ResponseMetadata, TaskBackend,
};
use crate::exec::batch::execute_batched;
use crate::exec::prompt::{RAW_TEXT_CONFIDENCE, parse_task_output, render_task_file};
use crate::exec::task_runner::{ChildEnd, run_captured, run_program};
use crate::fs::{FileSystem, RealFileSystem};
use crate::types::BackendKind;

const TASK_FILE: &str = "TASK.md";
const RESULTS_DIR: &str = ".dag-results";
const OUTPUT_FILE: &str = "output.json";

#[derive(Debug, Clone, PartialEq)]
pub struct WorktreeBackendConfig {
    pub program: String,
    /// Argument template; `{prompt}` and `{model}` are substituted per task.
    pub args: Vec<String>,
    pub default_model: String,
    /// Where checkouts are created, relative to the repository root.
    pub base_dir: PathBuf,
    pub branch_prefix: String,
    pub max_worktrees: usize,
    pub default_timeout: Duration,
    /// Repository to branch from; defaults to the one containing the cwd.
    pub repo_dir: Option<PathBuf>,
}

impl Default for WorktreeBackendConfig {
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
            base_dir: PathBuf::from("../.dag-worktrees"),
            branch_prefix: "dag/".to_string(),
            max_worktrees: 5,
            default_timeout: Duration::from_secs(600),
            repo_dir: None,
        }
    }
}

/// A checkout created for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeInfo {
    pub node_id: NodeId,
    pub path: PathBuf,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub node_id: NodeId,
    pub branch: String,
    pub merged: bool,
    pub message: Option<String>,
}

pub struct WorktreeBackend {
    config: WorktreeBackendConfig,
    fs: Arc<dyn FileSystem>,
    repo_root: OnceCell<PathBuf>,
    worktrees: Mutex<Vec<WorktreeInfo>>,
}

impl WorktreeBackend {
    pub fn new(config: WorktreeBackendConfig) -> Self {
        Self::with_fs(config, Arc::new(RealFileSystem))
    }

    pub fn with_fs(config: WorktreeBackendConfig, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            config,
            fs,
            repo_root: OnceCell::new(),
            worktrees: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &WorktreeBackendConfig {
        &self.config
    }

    /// Checkouts created so far and not yet cleaned up.
    pub fn worktrees(&self) -> Vec<WorktreeInfo> {
        self.lock_worktrees().clone()
    }

    fn lock_worktrees(&self) -> MutexGuard<'_, Vec<WorktreeInfo>> {
        self.worktrees.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn repo_root(&self) -> anyhow::Result<&Path> {
        let root = self
            .repo_root
            .get_or_try_init(|| async {
                let start = match &self.config.repo_dir {
                    Some(dir) => dir.clone(),
                    None => std::env::current_dir().context("resolving current directory")?,
                };
                let top = run_captured("git", &["rev-parse", "--show-toplevel"], &start).await?;
                Ok::<_, anyhow::Error>(PathBuf::from(top))
            })
            .await?;
        Ok(root.as_path())
    }

    /// Create the checkout and branch for `node_id`.
    async fn create_worktree(&self, node_id: &str) -> anyhow::Result<WorktreeInfo> {
        let root = self.repo_root().await?;
        let slug = branch_slug(node_id);
        let stamp = chrono::Utc::now().timestamp_millis();
        let branch = format!("{}{}-{}", self.config.branch_prefix, slug, stamp);
        let path = root.join(&self.config.base_dir).join(format!("{slug}-{stamp}"));

        if let Some(parent) = path.parent() {
            self.fs.create_dir_all(parent)?;
        }
        let path_arg = path.to_string_lossy().into_owned();
        run_captured("git", &["worktree", "add", "-b", &branch, &path_arg], root).await?;

        let info = WorktreeInfo {
            node_id: node_id.to_string(),
            path,
            branch,
        };
        info!(node = %node_id, branch = %info.branch, path = ?info.path, "created worktree");
        self.lock_worktrees().push(info.clone());
        Ok(info)
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

        let worktree = match self.prepare(&request).await {
            Ok(w) => w,
            Err(err) => {
                warn!(node = %node_id, error = %err, "worktree setup failed");
                let error = TaskError::new(
                    TaskErrorKind::ToolError,
                    &node_id,
                    format!("worktree setup failed: {err:#}"),
                )
                .with_retryable(true);
                let metadata = ResponseMetadata::new(BackendKind::Worktree, started.elapsed());
                return ExecutionResponse::failure(error, metadata);
            }
        };

        let task = self.fs.read_to_string(&worktree.path.join(TASK_FILE)).unwrap_or_default();
        let prompt = format!(
            "Read and execute the task in {TASK_FILE}. Write your results to {RESULTS_DIR}/{OUTPUT_FILE}.\n\n{task}"
        );
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());
        let args = self.render_args(&prompt, &model);
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);

        let end = run_program(
            &node_id,
            &self.config.program,
            &args,
            Some(&worktree.path),
            timeout,
            &request.cancel,
        )
        .await;

        let mut metadata = ResponseMetadata::new(BackendKind::Worktree, started.elapsed());
        metadata.branch = Some(worktree.branch.clone());

        match end {
            Ok(ChildEnd::Exited {
                code,
                success: true,
                stdout,
            }) => {
                metadata.exit_code = code;
                let result = self.collect_result(&worktree).await;
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
                        "'{}' exited with code {} in {}",
                        self.config.program,
                        code.map_or_else(|| "none".to_string(), |c| c.to_string()),
                        worktree.branch
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

    /// Checkout plus `TASK.md` and an empty results directory.
    async fn prepare(&self, request: &ExecutionRequest) -> anyhow::Result<WorktreeInfo> {
        let worktree = self.create_worktree(&request.node_id).await?;
        let task = render_task_file(request, &self.config.default_model);
        self.fs
            .write(&worktree.path.join(TASK_FILE), task.as_bytes())?;
        self.fs.create_dir_all(&worktree.path.join(RESULTS_DIR))?;
        Ok(worktree)
    }

    /// Result file if the task wrote one, otherwise a summary of the diff.
    async fn collect_result(&self, worktree: &WorktreeInfo) -> TaskResult {
        let output_path = worktree.path.join(RESULTS_DIR).join(OUTPUT_FILE);
        if self.fs.exists(&output_path) {
            match self.fs.read_to_string(&output_path) {
                Ok(text) => return parse_task_output(&text),
                Err(err) => {
                    warn!(node = %worktree.node_id, error = %err, "unreadable result file");
                }
            }
        }

        let changes = run_captured("git", &["diff", "--stat", "HEAD"], &worktree.path)
            .await
            .unwrap_or_default();
        let changes = if changes.is_empty() {
            "No changes detected".to_string()
        } else {
            changes
        };
        debug!(node = %worktree.node_id, "no result file; falling back to diff summary");
        TaskResult::new(json!({ "changes": changes, "branch": worktree.branch }))
            .with_confidence(RAW_TEXT_CONFIDENCE)
    }

    /// Merge every task branch into `target` with `--no-ff`. A conflicting
    /// merge is aborted and reported; the rest continue.
    pub async fn merge_all(&self, target: &str) -> Result<Vec<MergeOutcome>> {
        let root = self.repo_root().await?.to_path_buf();
        run_captured("git", &["checkout", target], &root).await?;

        let mut outcomes = Vec::new();
        for wt in self.worktrees() {
            let message = format!("Merge {} ({})", wt.branch, wt.node_id);
            match run_captured("git", &["merge", "--no-ff", "-m", &message, &wt.branch], &root).await
            {
                Ok(_) => {
                    info!(node = %wt.node_id, branch = %wt.branch, target, "merged task branch");
                    outcomes.push(MergeOutcome {
                        node_id: wt.node_id,
                        branch: wt.branch,
                        merged: true,
                        message: None,
                    });
                }
                Err(err) => {
                    warn!(node = %wt.node_id, branch = %wt.branch, error = %err, "merge failed; aborting");
                    if let Err(abort) = run_captured("git", &["merge", "--abort"], &root).await {
                        debug!(error = %abort, "merge --abort failed");
                    }
                    outcomes.push(MergeOutcome {
                        node_id: wt.node_id,
                        branch: wt.branch,
                        merged: false,
                        message: Some(format!("{err:#}")),
                    });
                }
            }
        }
        Ok(outcomes)
    }
}

impl Default for WorktreeBackend {
    fn default() -> Self {
        Self::new(WorktreeBackendConfig::default())
    }
}

/// Node ids may contain anything; branch names may not.
pub fn branch_slug(node_id: &str) -> String {
    let slug: String = node_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug.to_string()
    }
}

impl TaskBackend for WorktreeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Worktree
    }

    fn name(&self) -> &str {
        "worktree"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            max_parallelism: self.config.max_worktrees,
            token_overhead_per_task: 0,
            shared_context: false,
            supports_streaming: false,
            true_isolation: true,
            efficient_dependency_passing: false,
        }
    }

    fn is_available(&self) -> BackendFuture<'_, bool> {
        Box::pin(async move {
            if which::which("git").is_err() || which::which(&self.config.program).is_err() {
                return false;
            }
            match self.repo_root().await {
                Ok(_) => true,
                Err(err) => {
                    debug!(error = %err, "worktree backend: not inside a git repository");
                    false
                }
            }
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
            let worktrees: Vec<WorktreeInfo> = self.lock_worktrees().drain(..).collect();
            if worktrees.is_empty() {
                return Ok(());
            }
            let root = self.repo_root().await?.to_path_buf();
            for wt in worktrees {
                let path_arg = wt.path.to_string_lossy().into_owned();
                if let Err(err) =
                    run_captured("git", &["worktree", "remove", "--force", &path_arg], &root).await
                {
                    warn!(node = %wt.node_id, error = %err, "failed to remove worktree");
                }
                if let Err(err) = run_captured("git", &["branch", "-D", &wt.branch], &root).await {
                    warn!(node = %wt.node_id, error = %err, "failed to delete branch");
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_slug_replaces_unsafe_characters() {
        assert_eq!(branch_slug("build:api v2"), "build-api-v2");
        assert_eq!(branch_slug("lint_all"), "lint_all");
        assert_eq!(branch_slug("///"), "task");
    }

    #[test]
    fn capabilities_follow_config() {
        let backend = WorktreeBackend::new(WorktreeBackendConfig {
            max_worktrees: 3,
            ..WorktreeBackendConfig::default()
        });
        let caps = backend.capabilities();
        assert_eq!(caps.max_parallelism, 3);
        assert!(caps.true_isolation);
        assert!(!caps.shared_context);
    }
}
