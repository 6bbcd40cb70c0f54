use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::lib::tasks::types::{ScheduledTask, TaskError, TaskType};

/// What a task body sees while it runs.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: ScheduledTask,
    pub execution_id: Uuid,
    /// 1 on the first attempt.
    pub attempt: u32,
    /// Cancelled on timeout, explicit cancellation or shutdown.
    pub cancel: CancellationToken,
}

/// The work a scheduled task performs.
#[async_trait]
pub trait TaskBody: Send + Sync {
    async fn run(&self, ctx: &TaskContext) -> Result<JsonValue, TaskError>;
}

/// Builds a body for one task, validating its parameters.
pub type TaskFactory =
    Arc<dyn Fn(&ScheduledTask) -> Result<Box<dyn TaskBody>, TaskError> + Send + Sync>;

/// Maps task types to body factories.
#[derive(Default)]
pub struct TaskRegistry {
    factories: RwLock<HashMap<TaskType, TaskFactory>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        TaskRegistry::default()
    }

    pub fn register<F>(&self, task_type: TaskType, factory: F)
    where
        F: Fn(&ScheduledTask) -> Result<Box<dyn TaskBody>, TaskError> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_type, Arc::new(factory));
    }

    pub fn is_registered(&self, task_type: TaskType) -> bool {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&task_type)
    }

    pub fn build(&self, task: &ScheduledTask) -> Result<Box<dyn TaskBody>, TaskError> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task.task_type)
            .cloned()
            .ok_or_else(|| {
                TaskError::Validation(format!("no task body registered for {}", task.task_type))
            })?;
        factory(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl TaskBody for Echo {
        async fn run(&self, ctx: &TaskContext) -> Result<JsonValue, TaskError> {
            Ok(json!({ "task": ctx.task.name }))
        }
    }

    #[tokio::test]
    async fn builds_registered_bodies() {
        let registry = TaskRegistry::new();
        registry.register(TaskType::Cleanup, |_| Ok(Box::new(Echo) as Box<dyn TaskBody>));
        assert!(registry.is_registered(TaskType::Cleanup));

        let task = ScheduledTask::new("nightly cleanup", TaskType::Cleanup, "@daily");
        let body = registry.build(&task).unwrap();
        let ctx = TaskContext {
            task: task.clone(),
            execution_id: Uuid::new_v4(),
            attempt: 1,
            cancel: CancellationToken::new(),
        };
        assert_eq!(body.run(&ctx).await.unwrap(), json!({ "task": "nightly cleanup" }));
    }

    #[test]
    fn unknown_type_is_a_validation_error() {
        let registry = TaskRegistry::new();
        let task = ScheduledTask::new("backup", TaskType::Backup, "@daily");
        assert!(matches!(registry.build(&task), Err(TaskError::Validation(_))));
    }
}
