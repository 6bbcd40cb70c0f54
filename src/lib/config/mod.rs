mod file_config;

pub use file_config::{
    ContainerConfig, FileConfig, GatewayFileConfig, MaintenanceWindowConfig, OrchestratorFileConfig,
    RegistryFileConfig, SchedulerFileConfig, TaskConfig,
};

use std::collections::HashSet;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lib::error::{Classify, ErrorClass};
use crate::lib::manager::types::ManagedContainer;
use crate::lib::registry::advisories::SecurityAdvisory;
use crate::lib::registry::types::RegistryKind;
use crate::lib::scheduler::cron::CronExpression;
use crate::lib::scheduler::window::CronMaintenanceWindow;
use crate::lib::tasks::types::ScheduledTask;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("unknown time zone: {0}")]
    UnknownTimeZone(String),
    #[error("invalid cron expression for {owner}: {reason}")]
    InvalidCron { owner: String, reason: String },
    #[error("task {task} targets unknown container {container}")]
    UnknownContainer { task: String, container: String },
    #[error("duplicate {0}")]
    Duplicate(String),
}

impl Classify for ConfigError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    #[default]
    Exponential,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_tasks: usize,
    /// Deadline for one execution, retries included.
    pub task_timeout: Duration,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub retry_backoff: Backoff,
    pub max_retries: u32,
    pub cleanup_interval: Duration,
    pub history_retention: Duration,
    pub time_zone: Tz,
    pub tick_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            task_timeout: Duration::from_secs(30 * 60),
            retry_delay: Duration::from_secs(5 * 60),
            max_retry_delay: Duration::from_secs(60 * 60),
            retry_backoff: Backoff::Exponential,
            max_retries: 3,
            cleanup_interval: Duration::from_secs(60 * 60),
            history_retention: Duration::from_secs(24 * 60 * 60),
            time_zone: chrono_tz::UTC,
            tick_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub operation_timeout: Duration,
    /// Grace period handed to the runtime on stop and restart.
    pub stop_timeout: Duration,
    pub pool_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
            pool_size: 4,
        }
    }
}

/// Credentials and API flavour for one registry host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEndpoint {
    /// Host as it appears in image references, e.g. `harbor.corp:8443`.
    pub host: String,
    pub kind: RegistryKind,
    /// API base URL when it differs from `https://<host>`.
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RegistryEndpoint {
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub cache_ttl: Duration,
    pub request_timeout: Duration,
    pub endpoints: Vec<RegistryEndpoint>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(15 * 60),
            request_timeout: Duration::from_secs(30),
            endpoints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub health_timeout: Duration,
    pub health_poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(60),
            health_poll_interval: Duration::from_secs(2),
        }
    }
}

/// CLI arguments that can be overridden by the TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub docker_host: Option<String>,
    pub max_concurrent_tasks: usize,
    pub tick_interval_ms: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            max_concurrent_tasks: 10,
            tick_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `None` uses the local daemon defaults.
    pub docker_host: Option<String>,
    pub scheduler: SchedulerConfig,
    pub gateway: GatewayConfig,
    pub registry: RegistryConfig,
    pub orchestrator: OrchestratorConfig,
    pub maintenance_window: Option<CronMaintenanceWindow>,

    pub containers: Vec<ManagedContainer>,
    pub tasks: Vec<ScheduledTask>,
    pub advisories: Vec<SecurityAdvisory>,
}

fn secs(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

fn positive(field: &'static str, value: Duration) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self, ConfigError> {
        let file = file_config.unwrap_or_default();
        let docker_host = file.docker_host.or_else(|| cli.docker_host.clone());

        let s = file.scheduler.unwrap_or_default();
        let defaults = SchedulerConfig::default();
        let time_zone = match s.time_zone {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| ConfigError::UnknownTimeZone(name.clone()))?,
            None => defaults.time_zone,
        };
        let scheduler = SchedulerConfig {
            max_concurrent_tasks: s.max_concurrent_tasks.unwrap_or(cli.max_concurrent_tasks),
            task_timeout: positive("task_timeout", secs(s.task_timeout_secs, defaults.task_timeout))?,
            retry_delay: secs(s.retry_delay_secs, defaults.retry_delay),
            max_retry_delay: secs(s.max_retry_delay_secs, defaults.max_retry_delay),
            retry_backoff: s.retry_backoff.unwrap_or(defaults.retry_backoff),
            max_retries: s.max_retries.unwrap_or(defaults.max_retries),
            cleanup_interval: positive(
                "cleanup_interval",
                secs(s.cleanup_interval_secs, defaults.cleanup_interval),
            )?,
            history_retention: s
                .history_retention_hours
                .map(|h| Duration::from_secs(h * 3600))
                .unwrap_or(defaults.history_retention),
            time_zone,
            tick_interval: positive(
                "tick_interval",
                Duration::from_millis(s.tick_interval_ms.unwrap_or(cli.tick_interval_ms)),
            )?,
            shutdown_grace: secs(s.shutdown_grace_secs, defaults.shutdown_grace),
        };
        if scheduler.max_concurrent_tasks == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_tasks",
                reason: "must be at least 1".to_string(),
            });
        }
        if scheduler.retry_delay > scheduler.max_retry_delay {
            return Err(ConfigError::InvalidValue {
                field: "retry_delay",
                reason: "exceeds max_retry_delay".to_string(),
            });
        }

        let g = file.gateway.unwrap_or_default();
        let defaults = GatewayConfig::default();
        let gateway = GatewayConfig {
            operation_timeout: positive(
                "operation_timeout",
                secs(g.operation_timeout_secs, defaults.operation_timeout),
            )?,
            stop_timeout: secs(g.stop_timeout_secs, defaults.stop_timeout),
            pool_size: g.pool_size.unwrap_or(defaults.pool_size),
        };
        if gateway.pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pool_size",
                reason: "must be at least 1".to_string(),
            });
        }

        let r = file.registry.unwrap_or_default();
        let defaults = RegistryConfig::default();
        let mut hosts = HashSet::new();
        for endpoint in &r.endpoints {
            if !hosts.insert(endpoint.host.as_str()) {
                return Err(ConfigError::Duplicate(format!("registry endpoint {}", endpoint.host)));
            }
        }
        let registry = RegistryConfig {
            cache_ttl: secs(r.cache_ttl_secs, defaults.cache_ttl),
            request_timeout: positive(
                "request_timeout",
                secs(r.request_timeout_secs, defaults.request_timeout),
            )?,
            endpoints: r.endpoints,
        };

        let o = file.orchestrator.unwrap_or_default();
        let defaults = OrchestratorConfig::default();
        let orchestrator = OrchestratorConfig {
            health_timeout: positive(
                "health_timeout",
                secs(o.health_timeout_secs, defaults.health_timeout),
            )?,
            health_poll_interval: positive(
                "health_poll_interval",
                millis(o.health_poll_interval_ms, defaults.health_poll_interval),
            )?,
        };

        let maintenance_window = match file.maintenance_window {
            Some(window) => {
                let duration = positive(
                    "maintenance_window.duration_minutes",
                    Duration::from_secs(window.duration_minutes * 60),
                )?;
                Some(
                    CronMaintenanceWindow::new(&window.cron, duration, scheduler.time_zone).map_err(
                        |e| ConfigError::InvalidCron {
                            owner: "maintenance_window".to_string(),
                            reason: e.to_string(),
                        },
                    )?,
                )
            }
            None => None,
        };

        let containers = resolve_containers(file.containers)?;
        let tasks = resolve_tasks(file.tasks, &containers)?;

        Ok(Self {
            docker_host,
            scheduler,
            gateway,
            registry,
            orchestrator,
            maintenance_window,
            containers,
            tasks,
            advisories: file.advisories,
        })
    }
}

fn resolve_containers(configs: Vec<ContainerConfig>) -> Result<Vec<ManagedContainer>, ConfigError> {
    let mut seen = HashSet::new();
    let mut containers = Vec::with_capacity(configs.len());
    for c in configs {
        if !seen.insert(c.id.clone()) {
            return Err(ConfigError::Duplicate(format!("container {}", c.id)));
        }
        if c.image.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "containers.image",
                reason: format!("container {} has no image", c.id),
            });
        }
        let name = c.name.unwrap_or_else(|| c.id.clone());
        let mut container = ManagedContainer::new(&c.id, &name, &c.image, &c.tag);
        container.current_digest = c.current_digest;
        container.update_policy = c.update_policy.unwrap_or_default();
        container.update_strategy = c.update_strategy.unwrap_or_default();
        container.registry_url = c.registry_url;
        containers.push(container);
    }
    Ok(containers)
}

fn resolve_tasks(
    configs: Vec<TaskConfig>,
    containers: &[ManagedContainer],
) -> Result<Vec<ScheduledTask>, ConfigError> {
    let known: HashSet<&str> = containers.iter().map(|c| c.id.as_str()).collect();
    let mut names = HashSet::new();
    let mut tasks = Vec::with_capacity(configs.len());
    for t in configs {
        if !names.insert(t.name.clone()) {
            return Err(ConfigError::Duplicate(format!("task {}", t.name)));
        }
        CronExpression::parse(&t.cron).map_err(|e| ConfigError::InvalidCron {
            owner: format!("task {}", t.name),
            reason: e.to_string(),
        })?;
        if let Some(missing) = t.targets.iter().find(|id| !known.contains(id.as_str())) {
            return Err(ConfigError::UnknownContainer {
                task: t.name.clone(),
                container: missing.clone(),
            });
        }
        let mut task = ScheduledTask::new(&t.name, t.task_type, &t.cron).with_targets(t.targets);
        task.parameters = t.parameters;
        task.is_active = t.active;
        tasks.push(task);
    }
    Ok(tasks)
}
