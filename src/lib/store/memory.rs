use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{ContainerStore, ExecutionStore, TaskStore, UpdateHistoryStore};
use crate::lib::manager::types::{ManagedContainer, UpdateHistoryRecord};
use crate::lib::registry::types::UpdateCheckResult;
use crate::lib::tasks::types::{ScheduledTask, TaskExecution};

#[derive(Default)]
struct Tables {
    tasks: HashMap<Uuid, ScheduledTask>,
    /// Insertion order doubles as creation order.
    executions: Vec<TaskExecution>,
    containers: HashMap<String, ManagedContainer>,
    checks: HashMap<String, UpdateCheckResult>,
    history: Vec<UpdateHistoryRecord>,
}

/// Process-local store implementing every persistence trait.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TaskStore for MemoryStore {
    fn save_task(&self, task: &ScheduledTask) -> Result<()> {
        self.tables().tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn get_task(&self, id: Uuid) -> Result<Option<ScheduledTask>> {
        Ok(self.tables().tasks.get(&id).cloned())
    }

    fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let mut tasks: Vec<_> = self.tables().tasks.values().cloned().collect();
        tasks.sort_by_key(|task| task.created_at);
        Ok(tasks)
    }

    fn delete_task(&self, id: Uuid) -> Result<bool> {
        Ok(self.tables().tasks.remove(&id).is_some())
    }
}

impl ExecutionStore for MemoryStore {
    fn save_execution(&self, execution: &TaskExecution) -> Result<()> {
        let mut tables = self.tables();
        match tables.executions.iter_mut().find(|e| e.id == execution.id) {
            Some(existing) => *existing = execution.clone(),
            None => tables.executions.push(execution.clone()),
        }
        Ok(())
    }

    fn get_execution(&self, id: Uuid) -> Result<Option<TaskExecution>> {
        Ok(self.tables().executions.iter().find(|e| e.id == id).cloned())
    }

    fn last_execution(&self, task_id: Uuid) -> Result<Option<TaskExecution>> {
        Ok(self
            .tables()
            .executions
            .iter()
            .rev()
            .find(|e| e.task_id == task_id)
            .cloned())
    }

    fn list_executions(&self, task_id: Uuid, limit: usize) -> Result<Vec<TaskExecution>> {
        Ok(self
            .tables()
            .executions
            .iter()
            .rev()
            .filter(|e| e.task_id == task_id)
            .take(limit)
            .cloned()
            .collect())
    }

    fn prune_executions(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.tables();
        let len = tables.executions.len();
        tables
            .executions
            .retain(|e| !(e.status.is_terminal() && e.finished_at.is_some_and(|at| at < before)));
        Ok(len - tables.executions.len())
    }
}

impl ContainerStore for MemoryStore {
    fn save_container(&self, container: &ManagedContainer) -> Result<()> {
        self.tables()
            .containers
            .insert(container.id.clone(), container.clone());
        Ok(())
    }

    fn get_container(&self, id: &str) -> Result<Option<ManagedContainer>> {
        Ok(self.tables().containers.get(id).cloned())
    }

    fn list_containers(&self) -> Result<Vec<ManagedContainer>> {
        let mut containers: Vec<_> = self.tables().containers.values().cloned().collect();
        containers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(containers)
    }

    fn delete_container(&self, id: &str) -> Result<bool> {
        let mut tables = self.tables();
        tables.checks.remove(id);
        Ok(tables.containers.remove(id).is_some())
    }

    fn save_check(&self, container_id: &str, result: &UpdateCheckResult) -> Result<()> {
        self.tables()
            .checks
            .insert(container_id.to_string(), result.clone());
        Ok(())
    }

    fn last_check(&self, container_id: &str) -> Result<Option<UpdateCheckResult>> {
        Ok(self.tables().checks.get(container_id).cloned())
    }
}

impl UpdateHistoryStore for MemoryStore {
    fn save_record(&self, record: &UpdateHistoryRecord) -> Result<()> {
        let mut tables = self.tables();
        match tables.history.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => tables.history.push(record.clone()),
        }
        Ok(())
    }

    fn get_record(&self, id: Uuid) -> Result<Option<UpdateHistoryRecord>> {
        Ok(self.tables().history.iter().find(|r| r.id == id).cloned())
    }

    fn history_for(&self, container_id: &str) -> Result<Vec<UpdateHistoryRecord>> {
        Ok(self
            .tables()
            .history
            .iter()
            .filter(|r| r.container_id == container_id)
            .cloned()
            .collect())
    }
}
