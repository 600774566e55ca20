// src/exec/shared_context.rs

//! Shared-context backend: instead of running anything, each task is turned
//! into a sub-agent tool-call descriptor for a host session that already holds
//! the conversation. The host issues the calls (in parallel, in one message)
//! and feeds the answers back.
//!
//! Dependency results travel by reference inside the host session, which is
//! why this backend advertises efficient dependency passing. Every call pays a
//! fixed context overhead.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::dag::NodeId;
use crate::dag::TaskResult;
use crate::errors::Result;
use crate::exec::backend::{
    BackendCapabilities, BackendFuture, ExecutionRequest, ExecutionResponse, ProgressCallback,
    ResponseMetadata, TaskBackend,
};
use crate::exec::batch::execute_batched;
use crate::exec::prompt::{summarize_output, truncate};
use crate::types::BackendKind;

/// Fixed per-call context cost of a sub-agent.
pub const SHARED_CONTEXT_TOKEN_OVERHEAD: u64 = 20_000;

const DESCRIPTION_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct SharedContextConfig {
    pub max_parallel: usize,
    pub default_agent: String,
    pub default_model: Option<String>,
    pub max_turns: u32,
    pub run_in_background: bool,
}

impl Default for SharedContextConfig {
    fn default() -> Self {
        Self {
            max_parallel: 10,
            default_agent: "general-purpose".to_string(),
            default_model: None,
            max_turns: 10,
            run_in_background: false,
        }
    }
}

/// One sub-agent invocation as the host expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskToolCall {
    pub description: String,
    pub prompt: String,
    pub subagent_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub max_turns: u32,
    pub run_in_background: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SharedContextBackend {
    config: SharedContextConfig,
}

impl SharedContextBackend {
    pub fn new(config: SharedContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SharedContextConfig {
        &self.config
    }

    /// Build the tool call for one request.
    pub fn tool_call(&self, request: &ExecutionRequest) -> TaskToolCall {
        TaskToolCall {
            description: truncate(&request.description, DESCRIPTION_LIMIT),
            prompt: self.render_prompt(request),
            subagent_type: request
                .skill_id
                .clone()
                .unwrap_or_else(|| self.config.default_agent.clone()),
            model: request
                .model
                .clone()
                .or_else(|| self.config.default_model.clone()),
            max_turns: self.config.max_turns,
            run_in_background: self.config.run_in_background,
        }
    }

    fn render_prompt(&self, request: &ExecutionRequest) -> String {
        let mut out = request.prompt.clone();
        if !request.dependency_results.is_empty() {
            out.push_str("\n\n## Results from dependencies\n");
            for (dep, result) in &request.dependency_results {
                out.push_str(&format!("- {dep}: {}\n", summarize_output(&result.output)));
            }
        }
        out
    }
}

/// Instruction block asking the host to issue all calls in one message.
pub fn format_parallel_message(calls: &[TaskToolCall]) -> String {
    let mut lines = vec![format!(
        "Launch the following {} task(s) in parallel, in a single message:",
        calls.len()
    )];
    for (i, call) in calls.iter().enumerate() {
        lines.push(String::new());
        lines.push(format!("{}. {} ({})", i + 1, call.description, call.subagent_type));
        lines.push(serde_json::to_string_pretty(call).unwrap_or_default());
    }
    lines.join("\n")
}

impl TaskBackend for SharedContextBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SharedContext
    }

    fn name(&self) -> &str {
        "shared-context"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            max_parallelism: self.config.max_parallel,
            token_overhead_per_task: SHARED_CONTEXT_TOKEN_OVERHEAD,
            shared_context: true,
            supports_streaming: false,
            true_isolation: false,
            efficient_dependency_passing: true,
        }
    }

    fn is_available(&self) -> BackendFuture<'_, bool> {
        Box::pin(async { true })
    }

    fn execute(&self, request: ExecutionRequest) -> BackendFuture<'_, ExecutionResponse> {
        Box::pin(async move {
            let started = Instant::now();
            let call = self.tool_call(&request);
            debug!(node = %request.node_id, agent = %call.subagent_type, "prepared tool call");
            let result = TaskResult::new(json!({ "type": "task-tool-call", "call": call }))
                .with_confidence(1.0);
            let metadata = ResponseMetadata::new(BackendKind::SharedContext, started.elapsed());
            ExecutionResponse::success(request.node_id, result, metadata)
        })
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
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[tokio::test]
    async fn execute_returns_tool_call_descriptor() {
        let backend = SharedContextBackend::default();
        let mut request = ExecutionRequest::new("summarize", "Summarize the findings");
        request.description = "Summarize every finding from the research phase".to_string();
        request.dependency_results = BTreeMap::from([(
            "research".to_string(),
            TaskResult::new(json!("three findings")),
        )]);

        let response = backend.execute(request).await;
        let result = response.outcome.expect("shared-context execution succeeds");
        assert_eq!(result.confidence, Some(1.0));
        assert_eq!(result.output["type"], "task-tool-call");
        assert_eq!(result.output["call"]["subagent_type"], "general-purpose");
        let prompt = result.output["call"]["prompt"].as_str().unwrap_or_default();
        assert!(prompt.contains("research: three findings"));
    }

    #[test]
    fn descriptions_are_truncated() {
        let backend = SharedContextBackend::default();
        let mut request = ExecutionRequest::new("n", "p");
        request.description = "x".repeat(80);
        let call = backend.tool_call(&request);
        assert_eq!(call.description.chars().count(), DESCRIPTION_LIMIT + 3);
    }

    #[test]
    fn parallel_message_lists_every_call() {
        let backend = SharedContextBackend::default();
        let calls: Vec<TaskToolCall> = ["a", "b"]
            .iter()
            .map(|id| backend.tool_call(&ExecutionRequest::new(*id, "do it")))
            .collect();
        let message = format_parallel_message(&calls);
        assert!(message.starts_with("Launch the following 2 task(s)"));
        assert!(message.contains("1. a (general-purpose)"));
        assert!(message.contains("2. b (general-purpose)"));
    }
}
