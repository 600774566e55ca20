// src/exec/task_runner.rs

//! Child-process runner shared by the process and worktree backends.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a child process ended.
#[derive(Debug)]
pub(crate) enum ChildEnd {
    Exited {
        code: Option<i32>,
        success: bool,
        stdout: String,
    },
    TimedOut(Duration),
    Cancelled,
}

/// Spawn `program args...` (no shell), wait for it, and collect stdout.
///
/// - stderr is drained and logged at debug so pipes never fill up.
/// - On timeout or cancellation the child is killed; `Err` is reserved for
///   spawn/wait failures.
pub(crate) async fn run_program(
    node_id: &str,
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ChildEnd> {
    info!(
        node = %node_id,
        program,
        timeout_ms = timeout.as_millis() as u64,
        "starting task process"
    );

    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning '{}' for node '{}'", program, node_id))?;

    if let Some(stderr) = child.stderr.take() {
        let node = node_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(node = %node, "stderr: {}", line);
            }
        });
    }

    let stdout = child.stdout.take();
    let stdout_reader = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout {
            let _ = out.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    });

    tokio::select! {
        status = child.wait() => {
            let status = status
                .with_context(|| format!("waiting for process of node '{}'", node_id))?;
            let stdout = stdout_reader.await.unwrap_or_default();

            info!(
                node = %node_id,
                exit_code = status.code().unwrap_or(-1),
                success = status.success(),
                "task process exited"
            );
            Ok(ChildEnd::Exited {
                code: status.code(),
                success: status.success(),
                stdout,
            })
        }

        _ = tokio::time::sleep(timeout) => {
            warn!(
                node = %node_id,
                timeout_ms = timeout.as_millis() as u64,
                "task process timed out; killing"
            );
            if let Err(e) = child.kill().await {
                warn!(node = %node_id, error = %e, "failed to kill timed-out process");
            }
            Ok(ChildEnd::TimedOut(timeout))
        }

        _ = cancel.cancelled() => {
            info!(node = %node_id, "cancellation requested; killing task process");
            if let Err(e) = child.kill().await {
                warn!(node = %node_id, error = %e, "failed to kill child process on cancellation");
            }
            Ok(ChildEnd::Cancelled)
        }
    }
}

/// Run a short helper command (e.g. `git`) to completion and return stdout.
/// A non-zero exit is an error carrying stderr.
pub(crate) async fn run_captured(program: &str, args: &[&str], cwd: &Path) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("running {} {}", program, args.join(" ")))?;

    if !output.status.success() {
        anyhow::bail!(
            "{} {} failed ({}): {}",
            program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
