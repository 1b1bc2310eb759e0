use axum::http::StatusCode;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::warn;

use crate::error::Result;
use crate::model::{BatchItemResult, BatchReport, ObjectRef};

impl BatchReport {
    pub fn from_results(results: Vec<BatchItemResult>) -> Self {
        let successful = results.iter().filter(|result| result.success).count();
        Self {
            total: results.len(),
            successful,
            failed: results.len() - successful,
            results,
        }
    }

    /// 206 whenever any item failed; a batch never fails as a whole.
    pub fn status_code(&self) -> StatusCode {
        if self.failed == 0 {
            StatusCode::OK
        } else {
            StatusCode::PARTIAL_CONTENT
        }
    }
}

/// Runs `operation` once per item, each on its own task, and reports
/// results in completion order. Items still running when `deadline` passes
/// are aborted and reported as failed.
pub async fn run_batch<F, Fut>(items: Vec<ObjectRef>, deadline: Duration, operation: F) -> BatchReport
where
    F: Fn(ObjectRef) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut tasks = JoinSet::new();
    let mut pending = HashMap::with_capacity(items.len());
    let mut results = Vec::with_capacity(items.len());
    for item in items {
        if let Some(problem) = missing_field(&item) {
            results.push(item_result(item, Err(problem.to_string())));
            continue;
        }
        let handle = tasks.spawn(operation(item.clone()));
        pending.insert(handle.id(), item);
    }

    let expires = Instant::now() + deadline;
    loop {
        match timeout_at(expires, tasks.join_next_with_id()).await {
            Ok(Some(Ok((id, outcome)))) => {
                if let Some(item) = pending.remove(&id) {
                    results.push(item_result(item, outcome.map_err(|error| error.to_string())));
                }
            }
            Ok(Some(Err(join_error))) => {
                if let Some(item) = pending.remove(&join_error.id()) {
                    results.push(item_result(item, Err(format!("task failed: {join_error}"))));
                }
            }
            Ok(None) => break,
            Err(_) => {
                warn!(remaining = pending.len(), "batch deadline reached, aborting remaining items");
                tasks.abort_all();
                for (_, item) in pending.drain() {
                    results.push(item_result(item, Err("operation timed out".to_string())));
                }
                break;
            }
        }
    }

    BatchReport::from_results(results)
}

fn missing_field(item: &ObjectRef) -> Option<&'static str> {
    if item.namespace.trim().is_empty() {
        Some("namespace is required")
    } else if item.name.trim().is_empty() {
        Some("name is required")
    } else {
        None
    }
}

fn item_result(item: ObjectRef, outcome: std::result::Result<(), String>) -> BatchItemResult {
    BatchItemResult {
        namespace: item.namespace,
        name: item.name,
        success: outcome.is_ok(),
        error: outcome.err(),
    }
}
