use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use super::{Backoff, RegistryEndpoint};
use crate::lib::manager::types::UpdateStrategy;
use crate::lib::registry::advisories::SecurityAdvisory;
use crate::lib::registry::types::UpdatePolicy;
use crate::lib::tasks::types::TaskType;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub docker_host: Option<String>,

    pub scheduler: Option<SchedulerFileConfig>,
    pub gateway: Option<GatewayFileConfig>,
    pub registry: Option<RegistryFileConfig>,
    pub orchestrator: Option<OrchestratorFileConfig>,
    pub maintenance_window: Option<MaintenanceWindowConfig>,

    // Seed data
    pub containers: Vec<ContainerConfig>,
    pub tasks: Vec<TaskConfig>,
    pub advisories: Vec<SecurityAdvisory>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerFileConfig {
    pub max_concurrent_tasks: Option<usize>,
    pub task_timeout_secs: Option<u64>,
    pub retry_delay_secs: Option<u64>,
    pub max_retry_delay_secs: Option<u64>,
    pub retry_backoff: Option<Backoff>,
    pub max_retries: Option<u32>,
    pub cleanup_interval_secs: Option<u64>,
    pub history_retention_hours: Option<u64>,
    /// IANA zone name, e.g. `Europe/Berlin`.
    pub time_zone: Option<String>,
    pub tick_interval_ms: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct GatewayFileConfig {
    pub operation_timeout_secs: Option<u64>,
    pub stop_timeout_secs: Option<u64>,
    pub pool_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RegistryFileConfig {
    pub cache_ttl_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub endpoints: Vec<RegistryEndpoint>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct OrchestratorFileConfig {
    pub health_timeout_secs: Option<u64>,
    pub health_poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MaintenanceWindowConfig {
    /// Cron expression for the window start.
    pub cron: String,
    pub duration_minutes: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContainerConfig {
    pub id: String,
    /// Defaults to the id.
    pub name: Option<String>,
    pub image: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    pub current_digest: Option<String>,
    pub update_policy: Option<UpdatePolicy>,
    pub update_strategy: Option<UpdateStrategy>,
    pub registry_url: Option<String>,
}

fn default_tag() -> String {
    "latest".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TaskConfig {
    pub name: String,
    pub task_type: TaskType,
    pub cron: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub parameters: HashMap<String, JsonValue>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
