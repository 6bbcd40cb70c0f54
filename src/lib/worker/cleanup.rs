use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use tracing::info;

use super::types::{TaskBody, TaskContext};
use super::{TaskServices, store_error};
use crate::lib::tasks::types::{ScheduledTask, TaskError};

/// Prunes execution history, expired version checks and, when asked,
/// dangling images.
pub struct Cleanup {
    services: Arc<TaskServices>,
    retention: Duration,
    prune_images: bool,
}

impl Cleanup {
    pub fn from_task(services: Arc<TaskServices>, task: &ScheduledTask) -> Result<Self, TaskError> {
        let retention = match task.parameters.get("retention_hours") {
            None => services.history_retention,
            Some(value) => match value.as_u64() {
                Some(hours) if hours > 0 => Duration::from_secs(hours * 3600),
                _ => {
                    return Err(TaskError::Validation(format!(
                        "retention_hours must be a positive integer, got {}",
                        value
                    )));
                }
            },
        };
        Ok(Cleanup {
            prune_images: task.param_bool("prune_images").unwrap_or(false),
            services,
            retention,
        })
    }
}

#[async_trait]
impl TaskBody for Cleanup {
    async fn run(&self, ctx: &TaskContext) -> Result<JsonValue, TaskError> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| TaskError::Validation(format!("retention out of range: {}", e)))?;
        let cutoff = Utc::now() - retention;
        let executions = self
            .services
            .executions
            .prune_executions(cutoff)
            .map_err(store_error)?;
        let cache_entries = self.services.checker.purge_expired();

        let images = if self.prune_images {
            let removed = self
                .services
                .gateway
                .prune_images(&ctx.cancel)
                .await
                .map_err(|e| TaskError::classified(&e))?;
            Some(removed)
        } else {
            None
        };

        info!(
            "Cleanup removed {} execution(s), {} cached check(s), {} image(s)",
            executions,
            cache_entries,
            images.unwrap_or(0)
        );
        Ok(json!({
            "executions_pruned": executions,
            "cache_entries_purged": cache_entries,
            "images_pruned": images,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::runtime::types::RuntimeError;
    use crate::lib::store::ExecutionStore;
    use crate::lib::tasks::types::{ExecutionStatus, TaskExecution, TaskType, TriggerSource};
    use crate::lib::worker::testing::Fixture;
    use uuid::Uuid;

    fn task() -> ScheduledTask {
        ScheduledTask::new("cleanup", TaskType::Cleanup, "@daily")
    }

    fn finished_execution(age: chrono::Duration) -> TaskExecution {
        let mut execution = TaskExecution::new(Uuid::new_v4(), TriggerSource::Schedule);
        execution.transition(ExecutionStatus::Running).unwrap();
        execution.transition(ExecutionStatus::Succeeded).unwrap();
        execution.finished_at = Some(Utc::now() - age);
        execution
    }

    #[test]
    fn rejects_bad_retention() {
        let f = Fixture::new();
        let t = task().with_parameter("retention_hours", json!(0));
        assert!(matches!(
            Cleanup::from_task(f.services.clone(), &t),
            Err(TaskError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn prunes_old_executions_only() {
        let f = Fixture::new();
        let old = finished_execution(chrono::Duration::hours(48));
        let recent = finished_execution(chrono::Duration::hours(1));
        f.store.save_execution(&old).unwrap();
        f.store.save_execution(&recent).unwrap();

        let body = Cleanup::from_task(f.services.clone(), &task()).unwrap();
        let output = body.run(&f.context(&task())).await.unwrap();
        assert_eq!(output["executions_pruned"], 1);
        assert_eq!(output["images_pruned"], JsonValue::Null);
        assert!(f.store.get_execution(old.id).unwrap().is_none());
        assert!(f.store.get_execution(recent.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn retention_parameter_overrides_default() {
        let f = Fixture::new();
        let execution = finished_execution(chrono::Duration::hours(3));
        f.store.save_execution(&execution).unwrap();

        let t = task().with_parameter("retention_hours", json!(2));
        let body = Cleanup::from_task(f.services.clone(), &t).unwrap();
        let output = body.run(&f.context(&t)).await.unwrap();
        assert_eq!(output["executions_pruned"], 1);
    }

    #[tokio::test]
    async fn prunes_dangling_images_when_asked() {
        let f = Fixture::new();
        f.runtime.set_dangling_images(4);
        let t = task().with_parameter("prune_images", json!(true));
        let body = Cleanup::from_task(f.services.clone(), &t).unwrap();

        let output = body.run(&f.context(&t)).await.unwrap();
        assert_eq!(output["images_pruned"], 4);

        f.runtime
            .fail("prune", "", RuntimeError::RuntimeUnavailable("daemon restarting".to_string()));
        let err = body.run(&f.context(&t)).await.unwrap_err();
        assert!(matches!(err, TaskError::Transient(_)));
    }
}
