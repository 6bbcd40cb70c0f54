use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use super::TaskServices;
use super::types::{TaskBody, TaskContext};
use crate::lib::tasks::types::TaskError;

/// Commits every target to `<repository>:backup-<timestamp>`.
pub struct Backup {
    services: Arc<TaskServices>,
}

impl Backup {
    pub fn new(services: Arc<TaskServices>) -> Self {
        Backup { services }
    }
}

#[async_trait]
impl TaskBody for Backup {
    async fn run(&self, ctx: &TaskContext) -> Result<JsonValue, TaskError> {
        let targets = self.services.targets(&ctx.task)?;
        let mut tally = targets.tally();
        let tag = format!("backup-{}", Utc::now().format("%Y%m%d%H%M%S"));
        let mut images = Vec::new();

        for container in targets.found {
            match self
                .services
                .gateway
                .commit(&ctx.cancel, container.runtime_ref(), &container.image, &tag)
                .await
            {
                Ok(image_id) => {
                    info!("Backed up {} as {}:{}", container.id, container.image, tag);
                    tally.success();
                    images.push(json!({
                        "container": container.id,
                        "image": format!("{}:{}", container.image, tag),
                        "image_id": image_id,
                    }));
                }
                Err(e) => {
                    warn!("Backup of {} failed: {}", container.id, e);
                    tally.failure(&container.id, &e);
                }
            }
        }

        tally.finish(json!({ "tag": tag, "backups": images }))
    }
}
