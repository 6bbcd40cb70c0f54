//! Task bodies and the registry that builds them from a task type.

pub mod backup;
pub mod cleanup;
pub mod container_updater;
pub mod health_checker;
pub mod stats;
pub mod types;
pub mod update_checker;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::lib::error::{Classify, ErrorClass};
use crate::lib::manager::orchestrator::UpdateOrchestrator;
use crate::lib::manager::types::{ManagedContainer, UpdateError};
use crate::lib::registry::checker::VersionChecker;
use crate::lib::runtime::bulk::BulkConfig;
use crate::lib::runtime::gateway::RuntimeGateway;
use crate::lib::store::{ContainerStore, ExecutionStore};
use crate::lib::tasks::types::{ScheduledTask, TaskError, TaskType};

use self::stats::HostMonitor;
use self::types::{TaskBody, TaskRegistry};

/// Collaborators shared by every task body.
pub struct TaskServices {
    pub gateway: RuntimeGateway,
    pub checker: Arc<VersionChecker>,
    pub orchestrator: Arc<UpdateOrchestrator>,
    pub containers: Arc<dyn ContainerStore>,
    pub executions: Arc<dyn ExecutionStore>,
    /// Default age after which finished executions are pruned.
    pub history_retention: Duration,
    pub bulk: BulkConfig,
    pub host: HostMonitor,
}

pub(crate) fn store_error(err: anyhow::Error) -> TaskError {
    TaskError::Transient(format!("store error: {:#}", err))
}

impl TaskServices {
    /// Managed containers a task applies to. Ids that are no longer managed
    /// are returned separately so callers can report them.
    pub(crate) fn targets(&self, task: &ScheduledTask) -> Result<Targets, TaskError> {
        if task.target_containers.is_empty() {
            return Ok(Targets {
                found: self.containers.list_containers().map_err(store_error)?,
                missing: Vec::new(),
            });
        }
        let mut targets = Targets::default();
        for id in &task.target_containers {
            match self.containers.get_container(id).map_err(store_error)? {
                Some(container) => targets.found.push(container),
                None => targets.missing.push(id.clone()),
            }
        }
        Ok(targets)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Targets {
    pub found: Vec<ManagedContainer>,
    pub missing: Vec<String>,
}

impl Targets {
    /// Starts a tally with every missing target already counted as failed.
    pub fn tally(&self) -> Tally {
        let mut tally = Tally::default();
        for id in &self.missing {
            tally.failure(id, &UpdateError::NotFound(id.clone()));
        }
        tally
    }
}

/// Per-target outcome counter turning individual failures into one task error.
#[derive(Debug, Default)]
pub(crate) struct Tally {
    succeeded: usize,
    failures: Vec<(String, String, ErrorClass)>,
}

impl Tally {
    pub fn success(&mut self) {
        self.succeeded += 1;
    }

    pub fn failure<E>(&mut self, target: &str, err: &E)
    where
        E: Classify + fmt::Display,
    {
        self.record(target, err.to_string(), err.class());
    }

    pub fn record(&mut self, target: &str, message: String, class: ErrorClass) {
        self.failures.push((target.to_string(), message, class));
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// `Transient` when every target failed transiently, so the executor
    /// retries the whole run; `PartialFailure` for any other failure mix.
    pub fn finish(self, output: JsonValue) -> Result<JsonValue, TaskError> {
        if self.failures.is_empty() {
            return Ok(output);
        }
        let total = self.succeeded + self.failures.len();
        let all_transient = self
            .failures
            .iter()
            .all(|(_, _, class)| *class == ErrorClass::Transient);
        let details: Vec<String> = self
            .failures
            .into_iter()
            .map(|(target, err, _)| format!("{}: {}", target, err))
            .collect();
        if self.succeeded == 0 && all_transient {
            return Err(TaskError::Transient(details.join("; ")));
        }
        Err(TaskError::PartialFailure {
            failed: details.len(),
            total,
            details,
        })
    }
}

/// Registers a body factory for every task type.
pub fn register_default_tasks(registry: &TaskRegistry, services: Arc<TaskServices>) {
    let s = services.clone();
    registry.register(TaskType::UpdateChecker, move |_| {
        Ok(Box::new(update_checker::UpdateChecker::new(s.clone())) as Box<dyn TaskBody>)
    });

    let s = services.clone();
    registry.register(TaskType::ContainerUpdater, move |task| {
        Ok(Box::new(container_updater::ContainerUpdater::from_task(s.clone(), task)?) as Box<dyn TaskBody>)
    });

    let s = services.clone();
    registry.register(TaskType::Cleanup, move |task| {
        Ok(Box::new(cleanup::Cleanup::from_task(s.clone(), task)?) as Box<dyn TaskBody>)
    });

    let s = services.clone();
    registry.register(TaskType::HealthChecker, move |task| {
        Ok(Box::new(health_checker::HealthChecker::from_task(s.clone(), task)) as Box<dyn TaskBody>)
    });

    let s = services;
    registry.register(TaskType::Backup, move |_| {
        Ok(Box::new(backup::Backup::new(s.clone())) as Box<dyn TaskBody>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::runtime::types::RuntimeError;
    use serde_json::json;

    #[test]
    fn tally_without_failures_returns_output() {
        let mut tally = Tally::default();
        tally.success();
        assert_eq!(tally.finish(json!({ "ok": 1 })).unwrap(), json!({ "ok": 1 }));
    }

    #[test]
    fn tally_all_transient_is_retryable() {
        let mut tally = Tally::default();
        tally.failure("web", &RuntimeError::RuntimeUnavailable("down".to_string()));
        tally.failure("db", &RuntimeError::Timeout(Duration::from_secs(1)));
        let err = tally.finish(json!({})).unwrap_err();
        assert!(matches!(err, TaskError::Transient(_)));
        assert!(err.to_string().contains("web: container runtime unavailable: down"));
    }

    #[test]
    fn tally_mixed_outcomes_are_partial() {
        let mut tally = Tally::default();
        tally.success();
        tally.failure("db", &RuntimeError::RuntimeUnavailable("down".to_string()));
        assert_eq!(tally.failed(), 1);
        let err = tally.finish(json!({})).unwrap_err();
        assert_eq!(
            err,
            TaskError::PartialFailure {
                failed: 1,
                total: 2,
                details: vec!["db: container runtime unavailable: down".to_string()],
            }
        );
    }

    #[test]
    fn tally_permanent_failure_of_everything_is_partial() {
        let mut tally = Tally::default();
        tally.failure("web", &RuntimeError::NotFound("web".to_string()));
        assert!(matches!(
            tally.finish(json!({})),
            Err(TaskError::PartialFailure { failed: 1, total: 1, .. })
        ));
    }

    #[test]
    fn registers_every_task_type() {
        let fixture = testing::Fixture::new();
        let registry = TaskRegistry::new();
        register_default_tasks(&registry, fixture.services.clone());
        for task_type in [
            TaskType::UpdateChecker,
            TaskType::ContainerUpdater,
            TaskType::Cleanup,
            TaskType::HealthChecker,
            TaskType::Backup,
        ] {
            assert!(registry.is_registered(task_type));
        }
    }

    #[test]
    fn missing_targets_are_reported() {
        let fixture = testing::Fixture::new();
        let task = ScheduledTask::new("check", TaskType::UpdateChecker, "@hourly")
            .with_targets(["web", "ghost"]);
        let targets = fixture.services.targets(&task).unwrap();
        assert_eq!(targets.found.len(), 1);
        assert_eq!(targets.missing, vec!["ghost".to_string()]);
        assert_eq!(targets.tally().failed(), 1);
    }
}
