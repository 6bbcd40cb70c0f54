//! Persistence seams. The engine only talks to these traits; the in-memory
//! implementation backs the binary and the tests.

pub mod memory;

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::lib::manager::types::{ManagedContainer, UpdateHistoryRecord};
use crate::lib::registry::types::UpdateCheckResult;
use crate::lib::tasks::types::{ScheduledTask, TaskExecution};

pub use memory::MemoryStore;

pub trait TaskStore: Send + Sync {
    fn save_task(&self, task: &ScheduledTask) -> Result<()>;
    fn get_task(&self, id: Uuid) -> Result<Option<ScheduledTask>>;
    fn list_tasks(&self) -> Result<Vec<ScheduledTask>>;
    /// Returns false when the task did not exist.
    fn delete_task(&self, id: Uuid) -> Result<bool>;
}

pub trait ExecutionStore: Send + Sync {
    fn save_execution(&self, execution: &TaskExecution) -> Result<()>;
    fn get_execution(&self, id: Uuid) -> Result<Option<TaskExecution>>;
    /// Most recently created execution of a task.
    fn last_execution(&self, task_id: Uuid) -> Result<Option<TaskExecution>>;
    /// Newest first.
    fn list_executions(&self, task_id: Uuid, limit: usize) -> Result<Vec<TaskExecution>>;
    /// Deletes finished executions that ended before `before`.
    fn prune_executions(&self, before: DateTime<Utc>) -> Result<usize>;
}

pub trait ContainerStore: Send + Sync {
    fn save_container(&self, container: &ManagedContainer) -> Result<()>;
    fn get_container(&self, id: &str) -> Result<Option<ManagedContainer>>;
    fn list_containers(&self) -> Result<Vec<ManagedContainer>>;
    fn delete_container(&self, id: &str) -> Result<bool>;
    fn save_check(&self, container_id: &str, result: &UpdateCheckResult) -> Result<()>;
    fn last_check(&self, container_id: &str) -> Result<Option<UpdateCheckResult>>;
}

pub trait UpdateHistoryStore: Send + Sync {
    /// Inserts or replaces the record with the same id.
    fn save_record(&self, record: &UpdateHistoryRecord) -> Result<()>;
    fn get_record(&self, id: Uuid) -> Result<Option<UpdateHistoryRecord>>;
    /// Oldest first.
    fn history_for(&self, container_id: &str) -> Result<Vec<UpdateHistoryRecord>>;
}
