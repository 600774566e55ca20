// src/exec/batch.rs

//! Shared bounded driver behind every backend's `execute_parallel`.

use std::collections::HashMap;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::dag::NodeId;
use crate::exec::backend::{
    ExecutionProgress, ExecutionRequest, ExecutionResponse, ProgressCallback, ProgressStatus,
    TaskBackend,
};

/// Execute `requests` through `backend.execute`, at most `ceiling` at a time
/// (`None` means all at once).
pub async fn execute_batched<B>(
    backend: &B,
    requests: Vec<ExecutionRequest>,
    ceiling: Option<usize>,
    on_progress: Option<ProgressCallback>,
) -> HashMap<NodeId, ExecutionResponse>
where
    B: TaskBackend + ?Sized,
{
    let limit = ceiling.unwrap_or(requests.len()).max(1);
    debug!(
        backend = backend.name(),
        tasks = requests.len(),
        limit,
        "executing batch"
    );

    for request in &requests {
        report(&on_progress, &request.node_id, ProgressStatus::Queued, None);
    }

    let semaphore = Semaphore::new(limit);
    let semaphore = &semaphore;
    let mut in_flight = FuturesUnordered::new();

    for request in requests {
        let on_progress = on_progress.clone();
        in_flight.push(async move {
            let node_id = request.node_id.clone();
            // The semaphore is never closed, so acquiring cannot fail.
            let _permit = semaphore.acquire().await.ok();

            report(&on_progress, &node_id, ProgressStatus::Starting, None);
            report(&on_progress, &node_id, ProgressStatus::Running, None);

            let response = backend.execute(request).await;
            match &response.outcome {
                Ok(_) => report(&on_progress, &node_id, ProgressStatus::Completed, None),
                Err(err) => report(
                    &on_progress,
                    &node_id,
                    ProgressStatus::Failed,
                    Some(err.message.clone()),
                ),
            }
            (node_id, response)
        });
    }

    let mut responses = HashMap::new();
    while let Some((node_id, response)) = in_flight.next().await {
        responses.insert(node_id, response);
    }
    responses
}

fn report(
    on_progress: &Option<ProgressCallback>,
    node_id: &str,
    status: ProgressStatus,
    message: Option<String>,
) {
    if let Some(callback) = on_progress {
        callback(ExecutionProgress {
            node_id: node_id.to_string(),
            status,
            message,
        });
    }
}
