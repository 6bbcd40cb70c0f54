use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use crate::lib::error::{Classify, ErrorClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    UpdateChecker,
    ContainerUpdater,
    Cleanup,
    HealthChecker,
    Backup,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::UpdateChecker => "update-checker",
            TaskType::ContainerUpdater => "container-updater",
            TaskType::Cleanup => "cleanup",
            TaskType::HealthChecker => "health-checker",
            TaskType::Backup => "backup",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub name: String,
    pub task_type: TaskType,
    pub cron_expression: String,
    /// Managed container ids. Empty means every managed container.
    #[serde(default)]
    pub target_containers: Vec<String>,
    #[serde(default)]
    pub parameters: HashMap<String, JsonValue>,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn new(name: &str, task_type: TaskType, cron_expression: &str) -> Self {
        let now = Utc::now();
        ScheduledTask {
            id: Uuid::new_v4(),
            name: name.to_string(),
            task_type,
            cron_expression: cron_expression.to_string(),
            target_containers: Vec::new(),
            parameters: HashMap::new(),
            is_active: true,
            last_run_at: None,
            next_run_at: None,
            run_count: 0,
            failure_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_containers = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parameter(mut self, key: &str, value: JsonValue) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.parameters.get(key).and_then(JsonValue::as_bool)
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(JsonValue::as_u64)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(JsonValue::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded
                | ExecutionStatus::Failed
                | ExecutionStatus::TimedOut
                | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Schedule,
    Manual,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::Schedule => write!(f, "schedule"),
            TriggerSource::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: ExecutionStatus,
    pub triggered_by: TriggerSource,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub output: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid execution transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

/// Error returned by a task body.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    #[error("invalid task: {0}")]
    Validation(String),
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
    #[error("{failed} of {total} targets failed: {}", .details.join("; "))]
    PartialFailure {
        failed: usize,
        total: usize,
        details: Vec<String>,
    },
}

impl TaskError {
    /// Wraps any classified error, keeping its class.
    pub fn classified<E>(err: &E) -> Self
    where
        E: Classify + fmt::Display,
    {
        match err.class() {
            ErrorClass::Validation => TaskError::Validation(err.to_string()),
            ErrorClass::Transient => TaskError::Transient(err.to_string()),
            ErrorClass::Permanent => TaskError::Permanent(err.to_string()),
            ErrorClass::PartialFailure => TaskError::PartialFailure {
                failed: 1,
                total: 1,
                details: vec![err.to_string()],
            },
        }
    }
}

impl Classify for TaskError {
    fn class(&self) -> ErrorClass {
        match self {
            TaskError::Validation(_) => ErrorClass::Validation,
            TaskError::Transient(_) => ErrorClass::Transient,
            TaskError::Permanent(_) => ErrorClass::Permanent,
            TaskError::PartialFailure { .. } => ErrorClass::PartialFailure,
        }
    }
}
