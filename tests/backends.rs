mod common;
use crate::common::{ScriptedBackend, Step, init_tracing, with_timeout};

use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dagwave::dag::{TaskErrorKind, TaskResult};
use dagwave::exec::prompt::{
    RAW_TEXT_CONFIDENCE, parse_task_output, render_process_prompt, summarize_output, truncate,
};
use dagwave::exec::{
    ExecutionProgress, ExecutionRequest, ProcessBackend, ProcessBackendConfig, ProgressStatus,
    SharedContextBackend, TaskBackend,
};
use dagwave::types::BackendKind;
use serde_json::json;

type TestResult = Result<(), Box<dyn Error>>;

#[test]
fn structured_output_is_parsed() {
    let result = parse_task_output(r#"{"output": {"files": 3}, "confidence": 0.8}"#);
    assert_eq!(result.output, json!({"files": 3}));
    assert_eq!(result.confidence, Some(0.8));

    let fenced = parse_task_output("Done.\n```json\n{\"output\": \"ok\"}\n```\nBye");
    assert_eq!(fenced.output, json!("ok"));

    let raw = parse_task_output("  just some prose  ");
    assert_eq!(raw.output, json!("just some prose"));
    assert_eq!(raw.confidence, Some(RAW_TEXT_CONFIDENCE));
}

#[test]
fn cli_envelope_is_unwrapped_with_usage() {
    let stdout = json!({
        "type": "result",
        "result": "{\"output\": \"inner\", \"confidence\": 1.0}",
        "usage": {"input_tokens": 120, "output_tokens": 30, "cache_read_input_tokens": 5}
    })
    .to_string();

    let result = parse_task_output(&stdout);
    assert_eq!(result.output, json!("inner"));
    let usage = result.usage.expect("usage is kept");
    assert_eq!(usage.input_tokens, 120);
    assert_eq!(usage.cache_read_tokens, 5);
    assert_eq!(usage.total(), 155);
}

#[test]
fn process_prompt_carries_dependencies_and_context() {
    let mut request = ExecutionRequest::new("report", "Write the report.");
    request.skill_id = Some("writer".to_string());
    request
        .dependency_results
        .insert("scan".to_string(), TaskResult::new(json!("found 2 issues")));
    request.context.insert("audience".to_string(), json!("ops"));

    let prompt = render_process_prompt(&request);
    assert!(prompt.starts_with("# Task: report"));
    assert!(prompt.contains("\"writer\" skill"));
    assert!(prompt.contains("- scan: found 2 issues"));
    assert!(prompt.contains("\"audience\": \"ops\""));
    assert!(prompt.contains("## Instructions\nWrite the report."));
}

#[test]
fn summaries_are_truncated() {
    assert_eq!(truncate("abcdef", 3), "abc...");
    assert_eq!(truncate("abc", 3), "abc");
    assert_eq!(summarize_output(&json!(null)), "completed");
    assert_eq!(summarize_output(&json!("x".repeat(300))).len(), 203);
}

#[tokio::test]
async fn execute_parallel_respects_the_ceiling() {
    init_tracing();
    with_timeout(async {
        let backend = ScriptedBackend::new()
            .with_max_parallelism(2)
            .with_delay(Duration::from_millis(20))
            .script("t3", vec![Step::fail(TaskErrorKind::InvalidOutput)]);
        let seen: Arc<Mutex<Vec<ExecutionProgress>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let requests = (0..5)
            .map(|i| ExecutionRequest::new(format!("t{i}"), "work"))
            .collect();
        let responses = backend
            .execute_parallel(
                requests,
                Some(Arc::new(move |p: ExecutionProgress| {
                    sink.lock().unwrap().push(p)
                })),
            )
            .await;

        assert_eq!(responses.len(), 5);
        assert!(responses["t0"].is_success());
        assert!(!responses["t3"].is_success());
        assert_eq!(backend.peak_concurrency(), 2);

        let seen = seen.lock().unwrap();
        let count = |status: ProgressStatus| seen.iter().filter(|p| p.status == status).count();
        assert_eq!(count(ProgressStatus::Queued), 5);
        assert_eq!(count(ProgressStatus::Completed), 4);
        assert_eq!(count(ProgressStatus::Failed), 1);
    })
    .await
}

#[tokio::test]
async fn shared_context_backend_emits_call_descriptors() -> TestResult {
    with_timeout(async {
        let backend = SharedContextBackend::default();
        assert!(backend.is_available().await);
        assert_eq!(backend.kind(), BackendKind::SharedContext);

        let mut request = ExecutionRequest::new("review", "Review the diff.");
        request.skill_id = Some("code-reviewer".to_string());
        let response = backend.execute(request).await;

        let result = response.outcome.map_err(|e| e.to_string())?;
        assert_eq!(result.output["type"], json!("task-tool-call"));
        assert_eq!(result.output["call"]["subagent_type"], json!("code-reviewer"));
        assert_eq!(result.confidence, Some(1.0));
        Ok(())
    })
    .await
}

#[cfg(unix)]
mod process {
    use super::*;
    use dagwave::dag::{Graph, Node, NodeStatus, RetryPolicy};
    use dagwave::engine::WaveExecutor;

    fn shell(script: &str) -> ProcessBackend {
        ProcessBackend::new(ProcessBackendConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            default_timeout: Duration::from_secs(5),
            ..ProcessBackendConfig::default()
        })
    }

    #[tokio::test]
    async fn json_stdout_becomes_the_result() -> TestResult {
        init_tracing();
        with_timeout(async {
            let backend = shell(r#"printf '{"output": "hi", "confidence": 0.6}'"#);
            assert!(backend.is_available().await);

            let response = backend.execute(ExecutionRequest::new("greet", "say hi")).await;

            assert_eq!(response.metadata.exit_code, Some(0));
            assert_eq!(response.metadata.backend, Some(BackendKind::Process));
            let result = response.outcome.map_err(|e| e.to_string())?;
            assert_eq!(result.output, json!("hi"));
            assert_eq!(result.confidence, Some(0.6));
            assert_eq!(backend.active_processes(), 0);
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn prompt_is_substituted_into_arguments() -> TestResult {
        with_timeout(async {
            let backend = ProcessBackend::new(ProcessBackendConfig {
                program: "sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    r#"printf '%s' "$1""#.to_string(),
                    "sh".to_string(),
                    "{model}: {prompt}".to_string(),
                ],
                default_model: "tiny".to_string(),
                ..ProcessBackendConfig::default()
            });

            let response = backend.execute(ExecutionRequest::new("echo", "repeat me")).await;

            let result = response.outcome.map_err(|e| e.to_string())?;
            let text = result.output.as_str().unwrap_or_default().to_string();
            assert!(text.starts_with("tiny: # Task: echo"));
            assert!(text.contains("repeat me"));
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_retryable_tool_error() {
        with_timeout(async {
            let backend = shell("echo partial; exit 3");

            let response = backend.execute(ExecutionRequest::new("broken", "x")).await;

            assert_eq!(response.metadata.exit_code, Some(3));
            let error = response.outcome.expect_err("exit code 3");
            assert_eq!(error.kind, TaskErrorKind::ToolError);
            assert!(error.retryable);
            assert!(error.message.contains("code 3"));
        })
        .await
    }

    #[tokio::test]
    async fn slow_process_times_out() {
        with_timeout(async {
            let backend = shell("sleep 5");
            let mut request = ExecutionRequest::new("slow", "x");
            request.timeout = Some(Duration::from_millis(100));

            let response = backend.execute(request).await;

            let error = response.outcome.expect_err("process is killed");
            assert_eq!(error.kind, TaskErrorKind::Timeout);
            assert!(!error.retryable);
        })
        .await
    }

    #[tokio::test]
    async fn cancelling_the_request_kills_the_process() {
        with_timeout(async {
            let backend = shell("sleep 5");
            let request = ExecutionRequest::new("stopped", "x");
            let cancel = request.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            });

            let response = backend.execute(request).await;

            let error = response.outcome.expect_err("process is cancelled");
            assert_eq!(error.kind, TaskErrorKind::Cancelled);
        })
        .await
    }

    #[tokio::test]
    async fn node_timeout_releases_the_process_slot() -> TestResult {
        init_tracing();
        with_timeout(async {
            let backend = Arc::new(shell("sleep 5"));
            let graph = Graph::builder("slow")
                .node(
                    Node::new("slow")
                        .with_timeout(Duration::from_millis(200))
                        .with_retry_policy(RetryPolicy::no_retry()),
                )
                .build()
                .expect("valid graph");

            let result = WaveExecutor::new(backend.clone()).run(&graph).await;

            assert_eq!(result.status_of("slow"), Some(NodeStatus::Failed));
            assert_eq!(result.errors[0].kind, TaskErrorKind::Timeout);
            assert_eq!(backend.active_processes(), 0);
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn missing_program_is_unavailable_and_fails_permanently() {
        with_timeout(async {
            let backend = ProcessBackend::new(ProcessBackendConfig {
                program: "dagwave-no-such-binary".to_string(),
                ..ProcessBackendConfig::default()
            });
            assert!(!backend.is_available().await);

            let response = backend.execute(ExecutionRequest::new("ghost", "x")).await;
            let error = response.outcome.expect_err("spawn fails");
            assert_eq!(error.kind, TaskErrorKind::ToolError);
            assert!(!error.retryable);
        })
        .await
    }
}
