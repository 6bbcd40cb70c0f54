use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use super::TaskServices;
use super::types::{TaskBody, TaskContext};
use crate::lib::registry::types::UpdatePolicy;
use crate::lib::tasks::types::TaskError;

/// Checks every target against its registry and records the result.
pub struct UpdateChecker {
    services: Arc<TaskServices>,
}

impl UpdateChecker {
    pub fn new(services: Arc<TaskServices>) -> Self {
        UpdateChecker { services }
    }
}

#[async_trait]
impl TaskBody for UpdateChecker {
    async fn run(&self, ctx: &TaskContext) -> Result<JsonValue, TaskError> {
        let targets = self.services.targets(&ctx.task)?;
        let mut tally = targets.tally();
        let mut updates = Vec::new();
        let mut up_to_date = Vec::new();
        let mut disabled = Vec::new();

        for container in targets.found {
            if container.update_policy == UpdatePolicy::Disabled {
                disabled.push(container.id);
                continue;
            }

            let result = match self
                .services
                .checker
                .check_update(
                    &ctx.cancel,
                    &container.image_ref(),
                    container.current_digest.as_deref(),
                    container.registry_url.as_deref(),
                )
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    warn!("Update check for {} failed: {}", container.id, e);
                    tally.failure(&container.id, &e);
                    continue;
                }
            };
            tally.success();

            if let Err(e) = self.services.containers.save_check(&container.id, &result) {
                warn!("Failed to store check result for {}: {:#}", container.id, e);
            }

            if result.update_available {
                let recommendation = self
                    .services
                    .checker
                    .should_update(&result, container.update_policy);
                updates.push(json!({
                    "container": container.id,
                    "current_tag": result.current_tag,
                    "latest_tag": result.latest_tag,
                    "update_type": result.update_type,
                    "security_issues": result.security_issues.len(),
                    "recommendation": recommendation,
                }));
            } else {
                up_to_date.push(container.id);
            }
        }

        info!(
            "Update check: {} update(s), {} up to date, {} failed",
            updates.len(),
            up_to_date.len(),
            tally.failed()
        );
        tally.finish(json!({
            "updates": updates,
            "up_to_date": up_to_date,
            "disabled": disabled,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::registry::types::RegistryError;
    use crate::lib::store::ContainerStore;
    use crate::lib::tasks::types::{ScheduledTask, TaskType};
    use crate::lib::worker::testing::Fixture;

    fn task() -> ScheduledTask {
        ScheduledTask::new("check updates", TaskType::UpdateChecker, "*/15 * * * *")
    }

    #[tokio::test]
    async fn reports_available_updates_and_stores_checks() {
        let f = Fixture::new();
        f.manage("legacy", "nginx", "1.25.0", UpdatePolicy::Disabled);
        let body = UpdateChecker::new(f.services.clone());

        let output = body.run(&f.context(&task())).await.unwrap();
        let updates = output["updates"].as_array().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["container"], "web");
        assert_eq!(updates[0]["latest_tag"], "1.25.0");
        assert_eq!(updates[0]["update_type"], "minor");
        assert_eq!(updates[0]["recommendation"]["action"], "apply");
        assert_eq!(output["disabled"], json!(["legacy"]));

        let check = f.store.last_check("web").unwrap().unwrap();
        assert!(check.update_available);
        assert!(f.store.last_check("legacy").unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_repository_is_a_partial_failure() {
        let f = Fixture::new();
        f.manage("db", "postgres", "15.4", UpdatePolicy::Manual);
        let body = UpdateChecker::new(f.services.clone());

        let err = body.run(&f.context(&task())).await.unwrap_err();
        let TaskError::PartialFailure { failed, total, details } = err else {
            panic!("expected a partial failure, got {:?}", err);
        };
        assert_eq!((failed, total), (1, 2));
        assert!(details[0].starts_with("db: "));
    }

    #[tokio::test]
    async fn registry_outage_is_transient() {
        let f = Fixture::new();
        f.registry.fail_with(Some(RegistryError::RateLimited));
        let body = UpdateChecker::new(f.services.clone());

        let err = body.run(&f.context(&task())).await.unwrap_err();
        assert!(matches!(err, TaskError::Transient(_)));
    }

    #[tokio::test]
    async fn only_targets_are_checked() {
        let f = Fixture::new();
        f.manage("db", "postgres", "15.4", UpdatePolicy::Manual);
        let body = UpdateChecker::new(f.services.clone());

        let output = body
            .run(&f.context(&task().with_targets(["web"])))
            .await
            .unwrap();
        assert_eq!(output["updates"].as_array().unwrap().len(), 1);
        assert_eq!(f.registry.lookups(), 1);
    }
}
