use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use super::TaskServices;
use super::types::{TaskBody, TaskContext};
use crate::lib::error::ErrorClass;
use crate::lib::tasks::types::{ScheduledTask, TaskError};

/// Inspects the targets, syncs their runtime state into the container store
/// and optionally restarts the unhealthy ones.
pub struct HealthChecker {
    services: Arc<TaskServices>,
    restart_unhealthy: bool,
}

impl HealthChecker {
    pub fn from_task(services: Arc<TaskServices>, task: &ScheduledTask) -> Self {
        HealthChecker {
            services,
            restart_unhealthy: task.param_bool("restart_unhealthy").unwrap_or(false),
        }
    }
}

#[async_trait]
impl TaskBody for HealthChecker {
    async fn run(&self, ctx: &TaskContext) -> Result<JsonValue, TaskError> {
        let targets = self.services.targets(&ctx.task)?;
        let mut tally = targets.tally();
        let refs: Vec<String> = targets
            .found
            .iter()
            .map(|c| c.runtime_ref().to_string())
            .collect();
        let inspected = self
            .services
            .gateway
            .bulk_inspect(&ctx.cancel, &refs, &self.services.bulk)
            .await;

        let mut healthy = Vec::new();
        let mut unhealthy = Vec::new();
        let mut restarted = Vec::new();

        for (mut container, item) in targets.found.into_iter().zip(inspected.results) {
            let Some(details) = item.output else {
                let message = item.error.unwrap_or_else(|| "inspect skipped".to_string());
                warn!("Health check of {} failed: {}", container.id, message);
                tally.record(
                    &container.id,
                    message,
                    item.error_class.unwrap_or(ErrorClass::Permanent),
                );
                continue;
            };

            if container.runtime_id.as_deref() != Some(details.id.as_str())
                || container.status != details.status
            {
                container.runtime_id = Some(details.id.clone());
                container.status = details.status;
                if let Err(e) = self.services.containers.save_container(&container) {
                    warn!("Failed to store state of {}: {:#}", container.id, e);
                }
            }

            if details.is_healthy() {
                tally.success();
                healthy.push(container.id);
                continue;
            }

            warn!(
                "{} is unhealthy (status {}, health {:?})",
                container.id, details.status, details.health
            );
            unhealthy.push(json!({
                "container": container.id,
                "status": details.status,
                "health": details.health,
                "exit_code": details.exit_code,
            }));

            if !self.restart_unhealthy {
                tally.success();
                continue;
            }
            match self.services.gateway.restart(&ctx.cancel, &details.id).await {
                Ok(()) => {
                    info!("Restarted unhealthy container {}", container.id);
                    tally.success();
                    restarted.push(container.id);
                }
                Err(e) => {
                    warn!("Restarting {} failed: {}", container.id, e);
                    tally.failure(&container.id, &e);
                }
            }
        }

        let host = self.services.host.snapshot(refs.len() as u64);
        info!(
            "Health check: {} healthy, {} unhealthy, {} restarted",
            healthy.len(),
            unhealthy.len(),
            restarted.len()
        );
        tally.finish(json!({
            "healthy": healthy,
            "unhealthy": unhealthy,
            "restarted": restarted,
            "host": host,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::registry::types::UpdatePolicy;
    use crate::lib::runtime::types::{ContainerStatus, HealthState, RuntimeError};
    use crate::lib::store::ContainerStore;
    use crate::lib::tasks::types::TaskType;
    use crate::lib::worker::testing::Fixture;

    fn task() -> ScheduledTask {
        ScheduledTask::new("health", TaskType::HealthChecker, "*/5 * * * *")
    }

    #[tokio::test]
    async fn reports_unhealthy_and_syncs_status() {
        let f = Fixture::new();
        f.manage("db", "postgres", "15.4", UpdatePolicy::Manual);
        f.runtime.set_health("db", Some(HealthState::Unhealthy));
        f.runtime.set_status("web", ContainerStatus::Running);

        let body = HealthChecker::from_task(f.services.clone(), &task());
        let output = body.run(&f.context(&task())).await.unwrap();
        assert_eq!(output["healthy"], json!(["web"]));
        assert_eq!(output["unhealthy"][0]["container"], "db");
        assert_eq!(output["unhealthy"][0]["health"], "unhealthy");
        assert_eq!(output["restarted"], json!([]));
        assert!(output["host"]["hostname"].is_string());

        let web = f.store.get_container("web").unwrap().unwrap();
        assert_eq!(web.status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn restarts_unhealthy_when_asked() {
        let f = Fixture::new();
        f.runtime.set_status("web", ContainerStatus::Exited);
        let t = task().with_parameter("restart_unhealthy", json!(true));

        let body = HealthChecker::from_task(f.services.clone(), &t);
        let output = body.run(&f.context(&t)).await.unwrap();
        assert_eq!(output["restarted"], json!(["web"]));
        assert_eq!(f.runtime.container("web").unwrap().status, ContainerStatus::Running);
        assert_eq!(
            f.store.get_container("web").unwrap().unwrap().status,
            ContainerStatus::Exited
        );
    }

    #[tokio::test]
    async fn vanished_container_is_a_failure() {
        let f = Fixture::new();
        f.manage("db", "postgres", "15.4", UpdatePolicy::Manual);
        f.runtime
            .fail("inspect", "db", RuntimeError::NotFound("db".to_string()));

        let body = HealthChecker::from_task(f.services.clone(), &task());
        let err = body.run(&f.context(&task())).await.unwrap_err();
        let TaskError::PartialFailure { failed, total, details } = err else {
            panic!("expected a partial failure, got {:?}", err);
        };
        assert_eq!((failed, total), (1, 2));
        assert!(details[0].contains("not found"));
    }
}
