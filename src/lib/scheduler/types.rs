use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::lib::error::{Classify, ErrorClass};
use crate::lib::tasks::types::{ScheduledTask, TaskExecution, TaskType, TriggerSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SchedulerEventKind {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskTimeout,
    TaskRetried,
    TaskCancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerEvent {
    pub kind: SchedulerEventKind,
    pub task_id: Uuid,
    pub task_name: String,
    pub execution_id: Uuid,
    pub at: DateTime<Utc>,
    /// Error text for failures and retries.
    pub detail: Option<String>,
}

impl SchedulerEvent {
    pub fn new(kind: SchedulerEventKind, task: &ScheduledTask, execution_id: Uuid) -> Self {
        SchedulerEvent {
            kind,
            task_id: task.id,
            task_name: task.name.clone(),
            execution_id,
            at: Utc::now(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Receives scheduler events synchronously on the dispatching task.
/// Implementations must return quickly.
pub trait TaskEventListener: Send + Sync {
    fn on_event(&self, event: &SchedulerEvent);
}

/// Forwards events into an unbounded channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelListener { tx }, rx)
    }
}

impl TaskEventListener for ChannelListener {
    fn on_event(&self, event: &SchedulerEvent) {
        // The receiver may be gone during shutdown.
        let _ = self.tx.send(event.clone());
    }
}

/// Writes every event to the log.
pub struct LogListener;

impl TaskEventListener for LogListener {
    fn on_event(&self, event: &SchedulerEvent) {
        let detail = event.detail.as_deref().unwrap_or("");
        match event.kind {
            SchedulerEventKind::TaskFailed
            | SchedulerEventKind::TaskTimeout
            | SchedulerEventKind::TaskRetried => warn!(
                "{} {} ({}) {}",
                event.kind, event.task_name, event.execution_id, detail
            ),
            _ => info!("{} {} ({})", event.kind, event.task_name, event.execution_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression: {0}")]
    InvalidCronExpression(String),
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),
    #[error("task {0} is paused")]
    TaskPaused(Uuid),
    #[error("task {0} is already running")]
    AlreadyRunning(Uuid),
    #[error("scheduler already started")]
    AlreadyStarted,
    #[error("scheduler is not running")]
    NotRunning,
    #[error("store error: {0}")]
    Store(String),
}

impl Classify for SchedulerError {
    fn class(&self) -> ErrorClass {
        match self {
            SchedulerError::InvalidCronExpression(_) | SchedulerError::InvalidTask(_) => {
                ErrorClass::Validation
            }
            SchedulerError::Store(_) => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

pub(crate) fn store_err(err: anyhow::Error) -> SchedulerError {
    SchedulerError::Store(format!("{:#}", err))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunningTaskInfo {
    pub task_id: Uuid,
    pub task_name: String,
    pub task_type: TaskType,
    pub execution_id: Uuid,
    pub triggered_by: TriggerSource,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub task: ScheduledTask,
    pub running: Option<RunningTaskInfo>,
    pub last_execution: Option<TaskExecution>,
}

impl fmt::Display for SchedulerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
