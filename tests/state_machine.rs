mod common;
use crate::common::builders::{chain, diamond, instant_retry, with_policy};
use crate::common::init_tracing;

use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dagwave::dag::{
    ChannelListener, EventKind, ExecutionEvent, FailDisposition, NodeStatus, RetryPolicy,
    RunStatus, SkipReason, StateManager, TaskError, TaskErrorKind, TaskResult, TokenUsage,
};
use dagwave::errors::DagwaveError;
use serde_json::json;

type TestResult = Result<(), Box<dyn Error>>;

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ExecutionEvent>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.kind.name());
    }
    names
}

#[test]
fn transition_table_matches_the_lifecycle() {
    use NodeStatus::*;

    assert!(Pending.can_transition_to(Running));
    assert!(Pending.can_transition_to(Skipped));
    assert!(Running.can_transition_to(Completed));
    assert!(Running.can_transition_to(Failed));
    assert!(Running.can_transition_to(Retrying));
    assert!(Retrying.can_transition_to(Running));
    assert!(Retrying.can_transition_to(Failed));

    assert!(!Pending.can_transition_to(Completed));
    assert!(!Completed.can_transition_to(Running));
    assert!(!Failed.can_transition_to(Retrying));
    assert!(!Skipped.can_transition_to(Running));
    assert!(!Running.can_transition_to(Skipped));
}

#[test]
fn node_walks_pending_running_completed() -> TestResult {
    init_tracing();

    let graph = chain(&["a", "b"]);
    let state = StateManager::new(&graph, "run-1");
    let (listener, mut rx) = ChannelListener::new();
    state.subscribe(Arc::new(listener));

    state.begin_run(2);
    state.begin_wave(0, &["a".to_string()]);
    assert_eq!(state.start("a", 0)?, 1);
    assert_eq!(state.status_of("a"), Some(NodeStatus::Running));

    let result = TaskResult::new(json!({"ok": true})).with_usage(TokenUsage {
        input_tokens: 7,
        output_tokens: 3,
        ..TokenUsage::default()
    });
    state.complete("a", result)?;
    state.end_wave(0);

    let snap = state.snapshot();
    assert_eq!(snap.status, RunStatus::Running);
    assert_eq!(snap.status_of("a"), Some(NodeStatus::Completed));
    assert_eq!(snap.status_of("b"), Some(NodeStatus::Pending));
    assert_eq!(snap.node("a").map(|s| s.wave), Some(Some(0)));
    assert_eq!(snap.usage.total(), 10);
    assert_eq!(snap.counts.completed, 1);
    assert_eq!(snap.counts.pending, 1);
    assert!(snap.is_wave_complete(0));
    assert!(!snap.is_finished());
    assert_eq!(state.result_of("a").map(|r| r.output), Some(json!({"ok": true})));

    assert_eq!(
        drain(&mut rx),
        vec![
            "run:started",
            "wave:started",
            "node:start",
            "node:complete",
            "wave:completed"
        ]
    );
    Ok(())
}

#[test]
fn illegal_transition_leaves_state_untouched() -> TestResult {
    let graph = chain(&["a"]);
    let state = StateManager::new(&graph, "run-2");
    let before = state.snapshot();

    let err = state
        .complete("a", TaskResult::new(json!(null)))
        .expect_err("pending cannot complete");
    assert!(matches!(
        err,
        DagwaveError::InvalidStateTransition {
            from: NodeStatus::Pending,
            to: NodeStatus::Completed,
            ..
        }
    ));
    assert_eq!(state.snapshot(), before);

    state.start("a", 0)?;
    state.complete("a", TaskResult::new(json!(1)))?;
    let settled = state.snapshot();

    assert!(state.start("a", 0).is_err());
    assert!(state.skip("a", SkipReason::Cancelled).is_err());
    assert!(
        state
            .fail("a", TaskError::new(TaskErrorKind::ToolError, "a", "late"))
            .is_err()
    );
    assert_eq!(state.snapshot(), settled);

    assert!(matches!(
        state.start("ghost", 0),
        Err(DagwaveError::NodeNotFound(id)) if id == "ghost"
    ));
    Ok(())
}

#[test]
fn snapshots_are_owned_copies() -> TestResult {
    let graph = chain(&["a", "b"]);
    let state = StateManager::new(&graph, "run-3");

    let first = state.snapshot();
    let second = state.snapshot();
    assert_eq!(first, second);

    state.start("a", 0)?;
    assert_eq!(first.status_of("a"), Some(NodeStatus::Pending));
    assert_eq!(state.snapshot().status_of("a"), Some(NodeStatus::Running));
    Ok(())
}

#[test]
fn retryable_failure_moves_to_retrying_with_backoff() -> TestResult {
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(150),
        multiplier: 2.0,
        ..RetryPolicy::default()
    };
    let graph = with_policy(&chain(&["a"]), policy);
    let state = StateManager::new(&graph, "run-4");
    let transient = || TaskError::new(TaskErrorKind::RateLimited, "a", "slow down");

    state.start("a", 0)?;
    assert_eq!(
        state.fail("a", transient())?,
        FailDisposition::Retrying {
            attempt: 1,
            delay: Duration::from_millis(100)
        }
    );
    assert_eq!(state.status_of("a"), Some(NodeStatus::Retrying));

    assert_eq!(state.start("a", 0)?, 2);
    assert_eq!(
        state.fail("a", transient())?,
        FailDisposition::Retrying {
            attempt: 2,
            delay: Duration::from_millis(150)
        }
    );

    state.start("a", 0)?;
    assert_eq!(state.fail("a", transient())?, FailDisposition::Failed);

    let snap = state.snapshot();
    assert_eq!(snap.status_of("a"), Some(NodeStatus::Failed));
    assert_eq!(snap.node("a").map(|s| s.attempts), Some(3));
    assert_eq!(snap.errors.len(), 1);
    Ok(())
}

#[test]
fn non_retryable_kind_fails_immediately() -> TestResult {
    let graph = with_policy(&chain(&["a"]), instant_retry(5));
    let state = StateManager::new(&graph, "run-5");

    state.start("a", 0)?;
    let timeout = TaskError::timeout("a", Duration::from_secs(1));
    assert_eq!(state.fail("a", timeout)?, FailDisposition::Failed);

    let graph = with_policy(&chain(&["b"]), instant_retry(5));
    let state = StateManager::new(&graph, "run-6");
    state.start("b", 0)?;
    let denied = TaskError::new(TaskErrorKind::PermissionDenied, "b", "no").with_retryable(true);
    assert_eq!(state.fail("b", denied)?, FailDisposition::Failed);
    Ok(())
}

#[test]
fn timeout_retries_only_when_listed() -> TestResult {
    let policy = RetryPolicy {
        retryable: vec![TaskErrorKind::Timeout],
        ..instant_retry(2)
    };
    let graph = with_policy(&chain(&["a"]), policy);
    let state = StateManager::new(&graph, "run-7");

    state.start("a", 0)?;
    let disposition = state.fail("a", TaskError::timeout("a", Duration::from_millis(5)))?;
    assert!(matches!(disposition, FailDisposition::Retrying { attempt: 1, .. }));
    Ok(())
}

#[test]
fn retrying_node_can_be_failed_for_good() -> TestResult {
    let graph = with_policy(&chain(&["a"]), instant_retry(3));
    let state = StateManager::new(&graph, "run-8");

    state.start("a", 0)?;
    let transient = TaskError::new(TaskErrorKind::ToolError, "a", "flaky");
    assert!(matches!(
        state.fail("a", transient)?,
        FailDisposition::Retrying { .. }
    ));

    assert_eq!(state.fail("a", TaskError::cancelled("a"))?, FailDisposition::Failed);
    let snap = state.snapshot();
    assert_eq!(snap.status_of("a"), Some(NodeStatus::Failed));
    assert_eq!(
        snap.node("a").and_then(|s| s.error.as_ref()).map(|e| e.kind),
        Some(TaskErrorKind::Cancelled)
    );
    Ok(())
}

#[test]
fn permanent_failure_ignores_a_retrying_policy() -> TestResult {
    let policy = RetryPolicy {
        retryable: vec![TaskErrorKind::Cancelled],
        ..instant_retry(3)
    };
    let graph = with_policy(&chain(&["a"]), policy);
    let state = StateManager::new(&graph, "run-8b");
    let (listener, mut rx) = ChannelListener::new();
    state.subscribe(Arc::new(listener));

    state.start("a", 0)?;
    state.fail_permanently("a", TaskError::cancelled("a"))?;

    assert_eq!(drain(&mut rx), vec!["node:start", "node:failed"]);
    assert_eq!(state.status_of("a"), Some(NodeStatus::Failed));
    assert_eq!(state.snapshot().errors.len(), 1);

    let err = state
        .fail_permanently("a", TaskError::cancelled("a"))
        .expect_err("failed is terminal");
    assert!(matches!(err, DagwaveError::InvalidStateTransition { .. }));
    Ok(())
}

#[test]
fn skip_descendants_reaches_each_node_once() -> TestResult {
    init_tracing();

    let graph = diamond();
    let state = StateManager::new(&graph, "run-9");
    let (listener, mut rx) = ChannelListener::new();
    state.subscribe(Arc::new(listener));

    state.start("a", 0)?;
    state.fail("a", TaskError::new(TaskErrorKind::InvalidInput, "a", "bad"))?;
    let mut skipped = state.skip_descendants(&graph, "a", SkipReason::DependencyFailed)?;
    skipped.sort();
    assert_eq!(skipped, vec!["b", "c", "d"]);

    let mut skip_events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let EventKind::NodeSkipped { node_id, reason } = event.kind {
            assert_eq!(reason, SkipReason::DependencyFailed);
            skip_events.push(node_id);
        }
    }
    skip_events.sort();
    assert_eq!(skip_events, vec!["b", "c", "d"]);

    let snap = state.snapshot();
    assert!(snap.is_finished());
    assert_eq!(
        snap.node("d").and_then(|s| s.skip_reason),
        Some(SkipReason::DependencyFailed)
    );
    assert_eq!(snap.node("a").and_then(|s| s.wave), Some(0));
    assert_eq!(snap.node("d").and_then(|s| s.wave), None);
    Ok(())
}

#[test]
fn skip_all_pending_leaves_running_nodes_alone() -> TestResult {
    let graph = chain(&["a", "b", "c"]);
    let state = StateManager::new(&graph, "run-10");

    state.start("a", 0)?;
    let skipped = state.skip_all_pending(SkipReason::Cancelled)?;
    assert_eq!(skipped, vec!["b", "c"]);
    assert_eq!(state.status_of("a"), Some(NodeStatus::Running));
    Ok(())
}

#[test]
fn failing_listeners_do_not_break_delivery() -> TestResult {
    init_tracing();

    let graph = chain(&["a"]);
    let state = StateManager::new(&graph, "run-11");
    let seen = Arc::new(Mutex::new(Vec::new()));

    state.subscribe(Arc::new(|_: &ExecutionEvent| -> anyhow::Result<()> {
        anyhow::bail!("listener is broken")
    }));
    state.subscribe(Arc::new(|_: &ExecutionEvent| -> anyhow::Result<()> {
        panic!("listener exploded")
    }));
    let sink = Arc::clone(&seen);
    state.subscribe(Arc::new(move |event: &ExecutionEvent| -> anyhow::Result<()> {
        sink.lock().unwrap().push(event.kind.name());
        Ok(())
    }));

    state.begin_run(1);
    state.start("a", 0)?;
    state.complete("a", TaskResult::new(json!("done")))?;
    state.complete_run();

    assert_eq!(state.snapshot().status, RunStatus::Completed);
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["run:started", "node:start", "node:complete", "run:completed"]
    );
    Ok(())
}

#[test]
fn unsubscribed_listener_receives_nothing_more() -> TestResult {
    let graph = chain(&["a"]);
    let state = StateManager::new(&graph, "run-12");
    let (listener, mut rx) = ChannelListener::new();

    let id = state.subscribe(Arc::new(listener));
    state.begin_run(1);
    assert!(state.unsubscribe(id));
    assert!(!state.unsubscribe(id));

    state.start("a", 0)?;
    state.fail_run("stopped");

    assert_eq!(drain(&mut rx), vec!["run:started"]);
    assert_eq!(state.snapshot().status, RunStatus::Failed);
    Ok(())
}
