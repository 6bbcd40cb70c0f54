use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use super::TaskServices;
use super::types::{TaskBody, TaskContext};
use crate::lib::manager::types::{
    TriggeredBy, UpdateError, UpdateOptions, UpdateOutcome, UpdateStrategy,
};
use crate::lib::tasks::types::{ScheduledTask, TaskError};

/// Runs the orchestrator's check-and-update for every target.
///
/// Parameters: `strategy` overrides each container's strategy, `backup`
/// snapshots before updating, `force` applies updates awaiting approval.
pub struct ContainerUpdater {
    services: Arc<TaskServices>,
    options: UpdateOptions,
}

impl ContainerUpdater {
    pub fn from_task(services: Arc<TaskServices>, task: &ScheduledTask) -> Result<Self, TaskError> {
        let strategy = match task.parameters.get("strategy") {
            None => None,
            Some(JsonValue::String(s)) => Some(
                s.parse::<UpdateStrategy>()
                    .map_err(|e| TaskError::Validation(e.to_string()))?,
            ),
            Some(other) => {
                return Err(TaskError::Validation(format!(
                    "strategy must be a string, got {}",
                    other
                )));
            }
        };
        Ok(ContainerUpdater {
            services,
            options: UpdateOptions {
                strategy,
                backup: task.param_bool("backup").unwrap_or(false),
                force: task.param_bool("force").unwrap_or(false),
            },
        })
    }
}

#[async_trait]
impl TaskBody for ContainerUpdater {
    async fn run(&self, ctx: &TaskContext) -> Result<JsonValue, TaskError> {
        let targets = self.services.targets(&ctx.task)?;
        let mut tally = targets.tally();
        let mut updated = Vec::new();
        let mut up_to_date = Vec::new();
        let mut not_recommended = Vec::new();
        let mut skipped = Vec::new();

        for container in targets.found {
            let outcome = self
                .services
                .orchestrator
                .check_and_update(&ctx.cancel, &container.id, TriggeredBy::Scheduled, &self.options)
                .await;
            match outcome {
                Ok(UpdateOutcome::Updated(record)) => {
                    tally.success();
                    updated.push(json!({
                        "container": container.id,
                        "record": record.id,
                        "old_image": record.old_image,
                        "new_image": record.new_image,
                        "strategy": record.strategy,
                    }));
                }
                Ok(UpdateOutcome::NoUpdate) => {
                    tally.success();
                    up_to_date.push(container.id);
                }
                Ok(UpdateOutcome::NotRecommended(recommendation)) => {
                    tally.success();
                    not_recommended.push(json!({
                        "container": container.id,
                        "recommendation": recommendation,
                    }));
                }
                Err(UpdateError::AlreadyInProgress(_)) => {
                    info!("Skipping {}: an update is already running", container.id);
                    skipped.push(container.id);
                }
                Err(e) => {
                    warn!("Updating {} failed: {}", container.id, e);
                    tally.failure(&container.id, &e);
                }
            }
        }

        info!(
            "Container update: {} updated, {} up to date, {} not recommended, {} skipped, {} failed",
            updated.len(),
            up_to_date.len(),
            not_recommended.len(),
            skipped.len(),
            tally.failed()
        );
        tally.finish(json!({
            "updated": updated,
            "up_to_date": up_to_date,
            "not_recommended": not_recommended,
            "skipped": skipped,
        }))
    }
}
