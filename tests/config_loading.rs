mod common;
use crate::common::builders::{ConfigFileBuilder, NodeConfigBuilder};
use crate::common::init_tracing;

use std::error::Error;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use dagwave::cli::CliArgs;
use dagwave::config::{
    ConfigFile, RetrySection, default_config_path, load_and_validate, load_from_path,
};
use dagwave::dag::TaskErrorKind;
use dagwave::dag::topology::topological_sort;
use dagwave::errors::DagwaveError;
use dagwave::types::{BackendChoice, FailurePolicy};
use serde_json::json;
use tempfile::NamedTempFile;

type TestResult = Result<(), Box<dyn Error>>;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

fn expect_config_error(contents: &str) -> String {
    let file = write_config(contents);
    match load_and_validate(file.path()) {
        Err(DagwaveError::ConfigError(msg)) => msg,
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn release_demo_loads_and_plans() -> TestResult {
    init_tracing();

    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let cfg = load_and_validate(manifest.join("demos/release.toml"))?;

    assert_eq!(cfg.graph_id, "release");
    assert_eq!(cfg.graph_name.as_deref(), Some("Release pipeline"));
    assert_eq!(cfg.run.failure_policy, FailurePolicy::Continue);
    assert_eq!(cfg.run.max_concurrency, Some(4));
    assert_eq!(cfg.run.global_timeout, Some(Duration::from_secs(30 * 60)));
    assert_eq!(cfg.run.node_timeout, Duration::from_secs(5 * 60));
    assert_eq!(cfg.backend, BackendChoice::Auto);
    assert_eq!(cfg.backends.process.max_processes, 4);
    assert_eq!(cfg.backends.worktree.branch_prefix, "release/");

    let graph = cfg.to_graph()?;
    let order = topological_sort(&graph)?;
    assert_eq!(order.waves.len(), 3);
    assert_eq!(order.waves[1].node_ids, vec!["lint", "test"]);

    let test = graph.node("test").expect("test node");
    assert_eq!(test.timeout, Some(Duration::from_secs(15 * 60)));
    assert_eq!(test.retry_policy.max_attempts, 1);
    assert_eq!(test.retry_policy.base_delay, Duration::from_secs(2));

    let changelog = graph.node("changelog").expect("changelog node");
    assert_eq!(changelog.skill_id.as_deref(), Some("writer"));
    assert_eq!(changelog.context.get("audience"), Some(&json!("users")));
    assert_eq!(changelog.retry_policy.max_attempts, 3);
    assert!(changelog.retry_policy.retryable.contains(&TaskErrorKind::ToolError));
    Ok(())
}

#[test]
fn raw_load_skips_validation() -> TestResult {
    let file = write_config(
        r#"
[node.a]
prompt = "a"
after = ["missing"]
"#,
    );

    let raw = load_from_path(file.path())?;
    assert_eq!(raw.node["a"].after, vec!["missing"]);
    Ok(())
}

#[test]
fn cycle_returns_structured_error() {
    let file = write_config(
        r#"
[node.A]
prompt = "A"
after = ["B"]

[node.B]
prompt = "B"
after = ["A"]
"#,
    );

    match load_and_validate(file.path()) {
        Err(DagwaveError::DagCycle(msg)) => {
            assert!(msg.contains("cycle detected"));
            assert!(msg.contains("A") || msg.contains("B"));
        }
        Err(e) => panic!("Expected DagCycle error, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn unknown_dependency_is_rejected() {
    let msg = expect_config_error(
        r#"
[node.A]
prompt = "A"
after = ["NonExistent"]
"#,
    );
    assert!(msg.contains("unknown dependency"));
    assert!(msg.contains("NonExistent"));
}

#[test]
fn self_dependency_is_rejected() {
    let msg = expect_config_error(
        r#"
[node.A]
prompt = "A"
after = ["A"]
"#,
    );
    assert!(msg.contains("cannot depend on itself"));
}

#[test]
fn empty_graph_is_rejected() {
    let msg = expect_config_error(
        r#"
[graph]
id = "nothing"
"#,
    );
    assert!(msg.contains("at least one"));
}

#[test]
fn bad_values_are_rejected() {
    let zero_concurrency = expect_config_error(
        r#"
[run]
max_concurrency = 0

[node.a]
prompt = "a"
"#,
    );
    assert!(zero_concurrency.contains("max_concurrency"));

    let bad_duration = expect_config_error(
        r#"
[run]
node_timeout = "soon"

[node.a]
prompt = "a"
"#,
    );
    assert!(bad_duration.contains("[run].node_timeout"));

    let huge_duration = expect_config_error(
        r#"
[run]
global_timeout = "10000000000000000h"

[node.a]
prompt = "a"
"#,
    );
    assert!(huge_duration.contains("too large"));

    let inverted_delays = expect_config_error(
        r#"
[node.a]
prompt = "a"

[node.a.retry]
base_delay = "1m"
max_delay = "1s"
"#,
    );
    assert!(inverted_delays.contains("[node.a].retry.base_delay"));

    let shrinking = expect_config_error(
        r#"
[retry]
multiplier = 0.5

[node.a]
prompt = "a"
"#,
    );
    assert!(shrinking.contains("multiplier"));
}

#[test]
fn unknown_backend_is_a_toml_error() {
    let file = write_config(
        r#"
[run]
backend = "carrier-pigeon"

[node.a]
prompt = "a"
"#,
    );

    let err = load_and_validate(file.path()).expect_err("backend name is invalid");
    assert!(matches!(err, DagwaveError::TomlError(_)));
    assert!(err.to_string().contains("carrier-pigeon"));
}

#[test]
fn missing_graph_id_falls_back_to_default() {
    let cfg = ConfigFileBuilder::new()
        .with_node("only", NodeConfigBuilder::new("do it").build())
        .build();
    assert_eq!(cfg.graph_id, "dag");

    let cfg = ConfigFileBuilder::new()
        .with_graph_id("named")
        .with_node("only", NodeConfigBuilder::new("do it").build())
        .build();
    assert_eq!(cfg.graph_id, "named");
}

#[test]
fn node_retry_overrides_inherit_from_defaults() -> TestResult {
    let raw = ConfigFileBuilder::new()
        .with_default_retry(RetrySection {
            max_attempts: Some(4),
            base_delay: Some("100ms".to_string()),
            ..RetrySection::default()
        })
        .with_max_concurrency(2)
        .with_node("a", NodeConfigBuilder::new("a").priority(3).build())
        .with_node(
            "b",
            NodeConfigBuilder::new("b")
                .after(&["a"])
                .timeout("10s")
                .retry(RetrySection {
                    max_attempts: Some(1),
                    ..RetrySection::default()
                })
                .build(),
        )
        .raw();

    let cfg = ConfigFile::try_from(raw)?;
    assert_eq!(cfg.run.max_concurrency, Some(2));

    let graph = cfg.to_graph()?;
    let a = graph.node("a").expect("a");
    let b = graph.node("b").expect("b");
    assert_eq!(a.priority, 3);
    assert_eq!(a.retry_policy.max_attempts, 4);
    assert_eq!(b.retry_policy.max_attempts, 1);
    assert_eq!(b.retry_policy.base_delay, Duration::from_millis(100));
    assert_eq!(b.timeout, Some(Duration::from_secs(10)));
    assert_eq!(b.dependencies, vec!["a"]);
    Ok(())
}

#[test]
fn cli_defaults_to_the_conventional_graph_file() {
    let args = CliArgs::try_parse_from(["dagwave"]).expect("no arguments needed");
    assert_eq!(args.graph, default_config_path());

    let args = CliArgs::try_parse_from(["dagwave", "--graph", "demos/release.toml"])
        .expect("explicit path");
    assert_eq!(args.graph, PathBuf::from("demos/release.toml"));
}
