// src/exec/prompt.rs

//! Prompt rendering and output parsing shared by the process and worktree
//! backends.
//!
//! Neither backend shares memory with the orchestrator, so dependency results
//! are serialized into the text handed to the child process.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::dag::{TaskResult, TokenUsage};
use crate::exec::backend::ExecutionRequest;

/// Confidence attached to structured output that did not state one.
pub const DEFAULT_CONFIDENCE: f64 = 0.9;

/// Confidence attached to output that had to be taken as raw text.
pub const RAW_TEXT_CONFIDENCE: f64 = 0.7;

const SUMMARY_LIMIT: usize = 200;

const OUTPUT_CONTRACT: &str =
    r#"Respond with valid JSON: {"output": <your result>, "confidence": 0.0-1.0}"#;

static FENCED_JSON: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").ok());

/// Full prompt for a one-shot process: task header, skill, upstream summaries,
/// extra context and the output contract.
pub fn render_process_prompt(request: &ExecutionRequest) -> String {
    let mut parts: Vec<String> = Vec::new();

    parts.push(format!("# Task: {}", request.description));
    parts.push(String::new());

    if let Some(skill) = &request.skill_id {
        parts.push(format!("You are executing the \"{skill}\" skill."));
        parts.push(String::new());
    }

    if !request.dependency_results.is_empty() {
        parts.push("## Context from Previous Steps".to_string());
        for (dep_id, result) in &request.dependency_results {
            parts.push(format!("- {dep_id}: {}", summarize_output(&result.output)));
        }
        parts.push(String::new());
    }

    if !request.context.is_empty() {
        parts.push("## Additional Context".to_string());
        parts.push(serde_json::to_string_pretty(&request.context).unwrap_or_default());
        parts.push(String::new());
    }

    parts.push("## Instructions".to_string());
    parts.push(request.prompt.clone());
    parts.push(String::new());

    parts.push("## Output Format".to_string());
    parts.push(OUTPUT_CONTRACT.to_string());

    parts.join("\n")
}

/// `TASK.md` for a worktree checkout. Dependency outputs are embedded whole.
pub fn render_task_file(request: &ExecutionRequest, default_model: &str) -> String {
    let mut lines: Vec<String> = Vec::new();

    lines.push(format!("# Task: {}", request.description));
    lines.push(String::new());
    lines.push(format!("**Node ID:** {}", request.node_id));
    lines.push(format!(
        "**Skill:** {}",
        request.skill_id.as_deref().unwrap_or("general")
    ));
    lines.push(format!(
        "**Model:** {}",
        request.model.as_deref().unwrap_or(default_model)
    ));
    lines.push(String::new());

    lines.push("## Instructions".to_string());
    lines.push(String::new());
    lines.push(request.prompt.clone());
    lines.push(String::new());

    if !request.dependency_results.is_empty() {
        lines.push("## Context from Dependencies".to_string());
        lines.push(String::new());
        for (dep_id, result) in &request.dependency_results {
            lines.push(format!("### {dep_id}"));
            lines.push("```json".to_string());
            lines.push(serde_json::to_string_pretty(&result.output).unwrap_or_default());
            lines.push("```".to_string());
            lines.push(String::new());
        }
    }

    lines.push("## Output".to_string());
    lines.push(String::new());
    lines.push("When complete, write your results to `.dag-results/output.json`:".to_string());
    lines.push("```json".to_string());
    lines.push(r#"{"output": <your result>, "confidence": 0.0-1.0}"#.to_string());
    lines.push("```".to_string());

    lines.join("\n")
}

/// Compact one-line rendering of an upstream output.
pub fn summarize_output(output: &Value) -> String {
    let text = match output {
        Value::Null => return "completed".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    truncate(&text, SUMMARY_LIMIT)
}

/// Cut `text` to at most `limit` characters, marking the cut with `...`.
pub fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Turn child-process output into a [`TaskResult`].
///
/// Tries, in order: the whole text as JSON, a fenced JSON block inside the
/// text, then the raw text with a lowered confidence. A JSON envelope with a
/// string `result` field (CLI wrappers) is unwrapped once, keeping its
/// `usage`.
pub fn parse_task_output(stdout: &str) -> TaskResult {
    let trimmed = stdout.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return from_json(value);
    }

    if let Some(value) = fenced_json(trimmed) {
        return from_json(value);
    }

    TaskResult::new(Value::String(trimmed.to_string())).with_confidence(RAW_TEXT_CONFIDENCE)
}

fn fenced_json(text: &str) -> Option<Value> {
    let regex = FENCED_JSON.as_ref()?;
    regex
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .filter_map(|m| serde_json::from_str::<Value>(m.as_str()).ok())
        .last()
}

fn from_json(value: Value) -> TaskResult {
    let Value::Object(mut map) = value else {
        return TaskResult::new(value).with_confidence(DEFAULT_CONFIDENCE);
    };

    let usage = map.get("usage").and_then(usage_from_json);

    let mut result = if let Some(output) = map.remove("output") {
        let confidence = map
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_CONFIDENCE);
        TaskResult::new(output).with_confidence(confidence)
    } else if let Some(Value::String(inner)) = map.get("result") {
        let inner = parse_task_output(inner);
        if map.get("is_error").and_then(Value::as_bool) == Some(true) {
            inner.with_warning("wrapper reported is_error = true")
        } else {
            inner
        }
    } else {
        TaskResult::new(Value::Object(map)).with_confidence(DEFAULT_CONFIDENCE)
    };

    if let Some(usage) = usage {
        result = result.with_usage(usage);
    }
    result
}

fn usage_from_json(value: &Value) -> Option<TokenUsage> {
    let obj = value.as_object()?;
    let field = |names: &[&str]| -> u64 {
        names
            .iter()
            .find_map(|n| obj.get(*n).and_then(Value::as_u64))
            .unwrap_or(0)
    };

    Some(TokenUsage {
        input_tokens: field(&["input_tokens", "input"]),
        output_tokens: field(&["output_tokens", "output"]),
        cache_read_tokens: field(&["cache_read_input_tokens", "cache_read_tokens"]),
        cache_write_tokens: field(&["cache_creation_input_tokens", "cache_write_tokens"]),
    })
}
