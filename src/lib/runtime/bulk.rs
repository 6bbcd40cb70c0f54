use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::types::{RuntimeError, RuntimeResult};
use crate::lib::error::{Classify, ErrorClass};

pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

#[derive(Clone)]
pub struct BulkConfig {
    pub max_concurrency: usize,
    pub per_operation_timeout: Duration,
    /// Stop starting new targets after the first failure.
    pub fail_fast: bool,
    /// Called with `(completed, total)` after every target.
    pub progress: Option<ProgressFn>,
}

impl Default for BulkConfig {
    fn default() -> Self {
        BulkConfig {
            max_concurrency: 5,
            per_operation_timeout: Duration::from_secs(60),
            fail_fast: false,
            progress: None,
        }
    }
}

impl std::fmt::Debug for BulkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkConfig")
            .field("max_concurrency", &self.max_concurrency)
            .field("per_operation_timeout", &self.per_operation_timeout)
            .field("fail_fast", &self.fail_fast)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkItemResult<T> {
    pub target: String,
    pub success: bool,
    pub skipped: bool,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub duration: Duration,
    pub output: Option<T>,
}

impl<T> BulkItemResult<T> {
    fn completed(target: String, result: RuntimeResult<T>, duration: Duration) -> Self {
        match result {
            Ok(output) => BulkItemResult {
                target,
                success: true,
                skipped: false,
                error: None,
                error_class: None,
                duration,
                output: Some(output),
            },
            Err(err) => BulkItemResult {
                target,
                success: false,
                skipped: false,
                error: Some(err.to_string()),
                error_class: Some(err.class()),
                duration,
                output: None,
            },
        }
    }

    fn skipped(target: String) -> Self {
        BulkItemResult {
            target,
            success: false,
            skipped: true,
            error: Some("skipped after an earlier failure".to_string()),
            error_class: Some(ErrorClass::Permanent),
            duration: Duration::ZERO,
            output: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkSummary {
    pub total: usize,
    pub succeeded: usize,
    /// Includes skipped targets.
    pub failed: usize,
    pub skipped: usize,
    pub total_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub avg_duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkOperationResult<T> {
    pub results: Vec<BulkItemResult<T>>,
    pub summary: BulkSummary,
}

impl<T> BulkOperationResult<T> {
    fn new(results: Vec<BulkItemResult<T>>, total_duration: Duration) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        let skipped = results.iter().filter(|r| r.skipped).count();
        let ran: Vec<Duration> = results
            .iter()
            .filter(|r| !r.skipped)
            .map(|r| r.duration)
            .collect();
        let avg_duration = if ran.is_empty() {
            Duration::ZERO
        } else {
            ran.iter().sum::<Duration>() / ran.len() as u32
        };

        let summary = BulkSummary {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            skipped,
            total_duration,
            min_duration: ran.iter().min().copied().unwrap_or_default(),
            max_duration: ran.iter().max().copied().unwrap_or_default(),
            avg_duration,
        };
        BulkOperationResult { results, summary }
    }

    pub fn all_succeeded(&self) -> bool {
        self.summary.failed == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &BulkItemResult<T>> {
        self.results.iter().filter(|r| !r.success)
    }
}

enum Slot<T> {
    Skipped(String),
    Running(String, JoinHandle<BulkItemResult<T>>),
}

/// Runs `op` once per target under bounded concurrency.
///
/// Permits are taken in input order, so with `fail_fast` every target queued
/// behind the first failure is reported as skipped. Targets already started
/// run to completion. Cancelling `cancel` aborts in-flight operations.
pub async fn run_bulk<T, F, Fut>(
    cancel: &CancellationToken,
    targets: &[String],
    config: &BulkConfig,
    op: F,
) -> BulkOperationResult<T>
where
    T: Send + 'static,
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RuntimeResult<T>> + Send + 'static,
{
    let started = Instant::now();
    let total = targets.len();
    let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
    let batch = cancel.child_token();
    let completed = Arc::new(AtomicUsize::new(0));
    let op = Arc::new(op);

    let report = {
        let completed = completed.clone();
        let progress = config.progress.clone();
        move || {
            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(progress) = &progress {
                progress(done, total);
            }
        }
    };

    let mut slots = Vec::with_capacity(total);
    for target in targets {
        let permit = tokio::select! {
            biased;
            _ = batch.cancelled() => None,
            permit = semaphore.clone().acquire_owned() => permit.ok(),
        };
        let permit = match permit {
            Some(permit) if !batch.is_cancelled() => permit,
            _ => {
                debug!("bulk: skipping {}", target);
                report();
                slots.push(Slot::Skipped(target.clone()));
                continue;
            }
        };

        let op = op.clone();
        let caller = cancel.clone();
        let batch = batch.clone();
        let report = report.clone();
        let fail_fast = config.fail_fast;
        let timeout = config.per_operation_timeout;
        let id = target.clone();

        let handle = tokio::spawn(async move {
            let _permit = permit;
            let op_started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = caller.cancelled() => Err(RuntimeError::Cancelled),
                result = tokio::time::timeout(timeout, op(id.clone())) => {
                    result.unwrap_or(Err(RuntimeError::Timeout(timeout)))
                }
            };
            if let Err(err) = &result {
                warn!("bulk: {} failed: {}", id, err);
                if fail_fast {
                    batch.cancel();
                }
            }
            report();
            BulkItemResult::completed(id, result, op_started.elapsed())
        });
        slots.push(Slot::Running(target.clone(), handle));
    }

    let mut results = Vec::with_capacity(total);
    for slot in slots {
        let item = match slot {
            Slot::Skipped(target) => BulkItemResult::skipped(target),
            Slot::Running(target, handle) => match handle.await {
                Ok(item) => item,
                Err(join_err) => BulkItemResult::completed(
                    target,
                    Err(RuntimeError::RuntimeUnavailable(format!(
                        "bulk worker failed: {}",
                        join_err
                    ))),
                    Duration::ZERO,
                ),
            },
        };
        results.push(item);
    }

    BulkOperationResult::new(results, started.elapsed())
}
