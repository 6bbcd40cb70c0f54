use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::lib::config::{Backoff, SchedulerConfig};
use crate::lib::error::{Classify, ErrorClass};
use crate::lib::tasks::types::{ExecutionStatus, ScheduledTask, TaskError, TaskExecution};
use crate::lib::worker::types::{TaskContext, TaskRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        RetryPolicy {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            max_retry_delay: config.max_retry_delay,
            backoff: config.retry_backoff,
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.retry_delay,
            Backoff::Exponential => {
                let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
                self.retry_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_retry_delay)
                    .min(self.max_retry_delay)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub success: bool,
    pub attempts: u32,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub output: Option<JsonValue>,
}

/// Observes an execution. Hooks see shared references only and cannot
/// change the outcome.
pub trait ExecutionHooks: Send + Sync {
    fn before_execution(&self, _task: &ScheduledTask, _execution: &TaskExecution) {}

    fn on_retry(&self, _task: &ScheduledTask, _execution: &TaskExecution, _error: &TaskError, _delay: Duration) {}

    fn after_execution(&self, _task: &ScheduledTask, _result: &TaskResult) {}

    fn on_error(&self, _task: &ScheduledTask, _result: &TaskResult) {}
}

enum Outcome {
    Succeeded(JsonValue),
    Failed(TaskError),
    TimedOut,
    Cancelled,
}

/// Runs one execution of a task: body construction, retries, deadline.
pub struct TaskExecutor {
    registry: Arc<TaskRegistry>,
    retry: RetryPolicy,
    timeout: Duration,
    hooks: Vec<Arc<dyn ExecutionHooks>>,
}

impl TaskExecutor {
    pub fn new(registry: Arc<TaskRegistry>, config: &SchedulerConfig) -> Self {
        TaskExecutor {
            registry,
            retry: RetryPolicy::from_config(config),
            timeout: config.task_timeout,
            hooks: Vec::new(),
        }
    }

    pub fn add_hooks(&mut self, hooks: Arc<dyn ExecutionHooks>) {
        self.hooks.push(hooks);
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Drives `execution` from `Pending` to a terminal status.
    ///
    /// Each attempt runs under its own `task_timeout`; retry delays are not
    /// counted against it. Only transient errors are retried. Cancelling
    /// `cancel` ends the execution as `Cancelled`, including during a retry
    /// delay.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        task: &ScheduledTask,
        execution: &mut TaskExecution,
    ) -> TaskResult {
        let started_at = Utc::now();
        let started = Instant::now();

        if let Err(e) = execution.transition(ExecutionStatus::Running) {
            error!("Execution {} of {} not startable: {}", execution.id, task.name, e);
        }
        for hooks in &self.hooks {
            hooks.before_execution(task, execution);
        }

        let body_cancel = cancel.child_token();
        let mut attempts = 0;
        let outcome = match self.registry.build(task) {
            Err(err) => Outcome::Failed(err),
            Ok(body) => loop {
                if cancel.is_cancelled() {
                    break Outcome::Cancelled;
                }
                attempts += 1;
                let ctx = TaskContext {
                    task: task.clone(),
                    execution_id: execution.id,
                    attempt: attempts,
                    cancel: body_cancel.clone(),
                };

                let deadline = Instant::now() + self.timeout;
                let run = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Outcome::Cancelled,
                    _ = sleep_until(deadline) => break Outcome::TimedOut,
                    run = body.run(&ctx) => run,
                };

                let err = match run {
                    Ok(output) => break Outcome::Succeeded(output),
                    Err(err) => err,
                };
                if !err.is_retryable() || execution.retry_count >= self.retry.max_retries {
                    break Outcome::Failed(err);
                }

                let delay = self.retry.delay_for(execution.retry_count);
                if let Err(e) = execution.transition(ExecutionStatus::Retrying) {
                    error!("Execution {} cannot retry: {}", execution.id, e);
                    break Outcome::Failed(err);
                }
                warn!(
                    "Task {} attempt {} failed ({}), retrying in {:?}",
                    task.name, attempts, err, delay
                );
                for hooks in &self.hooks {
                    hooks.on_retry(task, execution, &err, delay);
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Outcome::Cancelled,
                    _ = sleep(delay) => {}
                }
                if let Err(e) = execution.transition(ExecutionStatus::Running) {
                    error!("Execution {} cannot resume: {}", execution.id, e);
                    break Outcome::Failed(err);
                }
            },
        };
        body_cancel.cancel();

        let (status, error, error_class, output) = match outcome {
            Outcome::Succeeded(output) => (ExecutionStatus::Succeeded, None, None, Some(output)),
            Outcome::Failed(err) => (
                ExecutionStatus::Failed,
                Some(err.to_string()),
                Some(err.class()),
                None,
            ),
            Outcome::TimedOut => (
                ExecutionStatus::TimedOut,
                Some(format!("timed out after {:?}", self.timeout)),
                Some(ErrorClass::Transient),
                None,
            ),
            Outcome::Cancelled => (
                ExecutionStatus::Cancelled,
                Some("cancelled".to_string()),
                None,
                None,
            ),
        };

        if let Err(e) = execution.finish(status, error.clone(), error_class, output.clone()) {
            error!("Execution {} could not finish: {}", execution.id, e);
        }

        let result = TaskResult {
            task_id: task.id,
            execution_id: execution.id,
            status,
            success: status == ExecutionStatus::Succeeded,
            attempts,
            retry_count: execution.retry_count,
            started_at,
            finished_at: execution.finished_at.unwrap_or_else(Utc::now),
            duration: started.elapsed(),
            error,
            error_class,
            output,
        };

        match result.status {
            ExecutionStatus::Succeeded => info!(
                "Task {} succeeded after {} attempt(s) in {:?}",
                task.name, result.attempts, result.duration
            ),
            status => warn!(
                "Task {} ended {:?} after {} attempt(s): {}",
                task.name,
                status,
                result.attempts,
                result.error.as_deref().unwrap_or("-")
            ),
        }

        for hooks in &self.hooks {
            hooks.after_execution(task, &result);
        }
        if !result.success {
            for hooks in &self.hooks {
                hooks.on_error(task, &result);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::tasks::types::{TaskType, TriggerSource};
    use crate::lib::worker::types::TaskBody;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        calls: Arc<AtomicU32>,
        /// Errors returned on successive attempts; success afterwards.
        errors: Vec<TaskError>,
        delay: Duration,
    }

    #[async_trait]
    impl TaskBody for Scripted {
        async fn run(&self, _ctx: &TaskContext) -> Result<JsonValue, TaskError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.errors.get(n) {
                Some(err) => Err(err.clone()),
                None => Ok(json!({ "attempt": n + 1 })),
            }
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl ExecutionHooks for Recorder {
        fn before_execution(&self, _: &ScheduledTask, _: &TaskExecution) {
            self.0.lock().unwrap().push("before".into());
        }
        fn on_retry(&self, _: &ScheduledTask, _: &TaskExecution, _: &TaskError, _: Duration) {
            self.0.lock().unwrap().push("retry".into());
        }
        fn after_execution(&self, _: &ScheduledTask, _: &TaskResult) {
            self.0.lock().unwrap().push("after".into());
        }
        fn on_error(&self, _: &ScheduledTask, _: &TaskResult) {
            self.0.lock().unwrap().push("error".into());
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(5),
            retry_backoff: Backoff::Exponential,
            task_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn executor(errors: Vec<TaskError>, delay: Duration, config: &SchedulerConfig) -> (TaskExecutor, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = Arc::new(TaskRegistry::new());
        let c = calls.clone();
        registry.register(TaskType::Cleanup, move |_| {
            Ok(Box::new(Scripted {
                calls: c.clone(),
                errors: errors.clone(),
                delay,
            }) as Box<dyn TaskBody>)
        });
        (TaskExecutor::new(registry, config), calls)
    }

    async fn run(executor: &TaskExecutor, cancel: &CancellationToken) -> (TaskResult, TaskExecution) {
        let task = ScheduledTask::new("cleanup", TaskType::Cleanup, "@hourly");
        let mut execution = TaskExecution::new(task.id, TriggerSource::Manual);
        let result = executor.execute(cancel, &task, &mut execution).await;
        (result, execution)
    }

    #[tokio::test]
    async fn always_transient_failure_makes_four_attempts() {
        let errors = vec![TaskError::Transient("registry busy".into()); 10];
        let (executor, calls) = executor(errors, Duration::ZERO, &config());
        let (result, execution) = run(&executor, &CancellationToken::new()).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.attempts, 4);
        assert_eq!(result.retry_count, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(result.error_class, Some(ErrorClass::Transient));
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let errors = vec![TaskError::Transient("a".into()), TaskError::Transient("b".into())];
        let (executor, _) = executor(errors, Duration::ZERO, &config());
        let (result, _) = run(&executor, &CancellationToken::new()).await;
        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.output, Some(json!({ "attempt": 3 })));
    }

    #[tokio::test]
    async fn permanent_and_partial_failures_are_not_retried() {
        for err in [
            TaskError::Permanent("gone".into()),
            TaskError::Validation("bad".into()),
            TaskError::PartialFailure {
                failed: 1,
                total: 3,
                details: vec!["web: not found".into()],
            },
        ] {
            let class = err.class();
            let (executor, calls) = executor(vec![err], Duration::ZERO, &config());
            let (result, _) = run(&executor, &CancellationToken::new()).await;
            assert_eq!(result.status, ExecutionStatus::Failed);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(result.error_class, Some(class));
        }
    }

    #[tokio::test]
    async fn retry_delays_do_not_count_against_the_timeout() {
        // Default ratios scaled down: 30m timeout, 5m delay doubling to a 1h cap.
        let defaults = SchedulerConfig::default();
        let scale = |d: Duration| d / 3000;
        let cfg = SchedulerConfig {
            task_timeout: scale(defaults.task_timeout),
            retry_delay: scale(defaults.retry_delay),
            max_retry_delay: scale(defaults.max_retry_delay),
            ..defaults
        };
        assert!(cfg.retry_delay * 7 > cfg.task_timeout);

        let (executor, calls) = executor(vec![TaskError::Transient("x".into()); 10], Duration::ZERO, &cfg);
        let (result, execution) = run(&executor, &CancellationToken::new()).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(execution.retry_count, 3);
    }

    #[tokio::test]
    async fn each_attempt_gets_the_full_timeout() {
        let cfg = SchedulerConfig {
            task_timeout: Duration::from_millis(150),
            retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(1),
            ..config()
        };
        // Three 100ms attempts exceed one 150ms budget but fit three of them.
        let errors = vec![TaskError::Transient("a".into()), TaskError::Transient("b".into())];
        let (executor, calls) = executor(errors, Duration::from_millis(100), &cfg);
        let (result, _) = run(&executor, &CancellationToken::new()).await;
        assert!(result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_interrupts_retry_delay() {
        let cfg = SchedulerConfig {
            retry_delay: Duration::from_secs(60),
            max_retry_delay: Duration::from_secs(60),
            ..config()
        };
        let (executor, calls) = executor(vec![TaskError::Transient("x".into()); 5], Duration::ZERO, &cfg);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let (result, execution) = run(&executor, &cancel).await;
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(execution.finished_at.is_some());
    }

    #[tokio::test]
    async fn slow_body_times_out() {
        let cfg = SchedulerConfig {
            task_timeout: Duration::from_millis(20),
            ..config()
        };
        let (executor, _) = executor(Vec::new(), Duration::from_secs(5), &cfg);
        let (result, _) = run(&executor, &CancellationToken::new()).await;
        assert_eq!(result.status, ExecutionStatus::TimedOut);
    }

    #[tokio::test]
    async fn cancellation_is_distinct_from_timeout() {
        let (executor, _) = executor(Vec::new(), Duration::from_secs(5), &config());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let (result, execution) = run(&executor, &cancel).await;
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn unknown_task_type_fails_validation() {
        let executor = TaskExecutor::new(Arc::new(TaskRegistry::new()), &config());
        let (result, _) = run(&executor, &CancellationToken::new()).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error_class, Some(ErrorClass::Validation));
        assert_eq!(result.attempts, 0);
    }

    #[tokio::test]
    async fn hooks_run_in_order() {
        let (mut executor, _) = executor(
            vec![TaskError::Transient("x".into()); 10],
            Duration::ZERO,
            &SchedulerConfig {
                max_retries: 1,
                ..config()
            },
        );
        let recorder = Arc::new(Recorder::default());
        executor.add_hooks(recorder.clone());
        run(&executor, &CancellationToken::new()).await;
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["before", "retry", "after", "error"]
        );
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            retry_delay: Duration::from_secs(300),
            max_retry_delay: Duration::from_secs(3600),
            backoff: Backoff::Exponential,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(300));
        assert_eq!(policy.delay_for(1), Duration::from_secs(600));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2400));
        assert_eq!(policy.delay_for(4), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(40), Duration::from_secs(3600));

        let fixed = RetryPolicy {
            backoff: Backoff::Fixed,
            ..policy
        };
        assert_eq!(fixed.delay_for(3), Duration::from_secs(300));
    }
}
