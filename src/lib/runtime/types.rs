use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lib::error::{Classify, ErrorClass};

/// Lifecycle status mirroring the runtime's container states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Running,
    Stopped,
    Paused,
    Restarting,
    Removing,
    Dead,
    Exited,
    #[default]
    Unknown,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
}

/// Everything needed to (re)create a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Container ports such as `80/tcp`.
    pub exposed_ports: Vec<String>,
    /// Container port -> host ports.
    pub port_bindings: HashMap<String, Vec<String>>,
    /// Bind mounts in `host:container[:mode]` form.
    pub binds: Vec<String>,
    pub restart_policy: String,
    pub network_mode: Option<String>,
    pub memory: Option<i64>,
    pub nano_cpus: Option<i64>,
}

impl ContainerSpec {
    pub fn new(name: &str, image: &str) -> Self {
        ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            restart_policy: "unless-stopped".to_string(),
            ..Default::default()
        }
    }

    /// Same configuration under a different image and name.
    pub fn derive(&self, name: &str, image: &str) -> Self {
        ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    /// Image id (`sha256:...`) the container was created from.
    pub image_id: String,
    pub status: ContainerStatus,
    pub health: Option<HealthState>,
    pub started_at: Option<String>,
    pub exit_code: Option<i64>,
    pub spec: ContainerSpec,
}

impl ContainerDetails {
    pub fn is_healthy(&self) -> bool {
        self.status == ContainerStatus::Running
            && matches!(self.health, None | Some(HealthState::Healthy))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDetails {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
}

impl ImageDetails {
    /// Content digest (`sha256:...`) of the image, if the runtime knows one.
    pub fn digest(&self) -> Option<String> {
        self.repo_digests
            .iter()
            .find_map(|d| d.split_once('@').map(|(_, digest)| digest.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("runtime api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("operation cancelled")]
    Cancelled,
}

impl Classify for RuntimeError {
    fn class(&self) -> ErrorClass {
        match self {
            RuntimeError::InvalidArgument(_) => ErrorClass::Validation,
            RuntimeError::Timeout(_) | RuntimeError::RuntimeUnavailable(_) => ErrorClass::Transient,
            RuntimeError::Api { status, .. } if *status >= 500 => ErrorClass::Transient,
            RuntimeError::NotFound(_)
            | RuntimeError::Conflict(_)
            | RuntimeError::Api { .. }
            | RuntimeError::Cancelled => ErrorClass::Permanent,
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Container runtime API. The Docker daemon is the production implementation.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> RuntimeResult<()>;

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String>;
    async fn start_container(&self, id: &str) -> RuntimeResult<()>;
    async fn stop_container(&self, id: &str, timeout: Duration) -> RuntimeResult<()>;
    async fn restart_container(&self, id: &str, timeout: Duration) -> RuntimeResult<()>;
    async fn pause_container(&self, id: &str) -> RuntimeResult<()>;
    async fn unpause_container(&self, id: &str) -> RuntimeResult<()>;
    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()>;
    async fn rename_container(&self, id: &str, name: &str) -> RuntimeResult<()>;
    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerDetails>;
    async fn container_stats(&self, id: &str) -> RuntimeResult<ContainerStats>;
    async fn container_logs(&self, id: &str, tail: usize) -> RuntimeResult<Vec<String>>;
    async fn exec(&self, id: &str, cmd: &[String]) -> RuntimeResult<ExecOutput>;

    /// Pulls `image` and returns its content digest when the runtime reports one.
    async fn pull_image(&self, image: &str) -> RuntimeResult<Option<String>>;
    async fn inspect_image(&self, image: &str) -> RuntimeResult<ImageDetails>;
    /// Snapshots a container into `repo:tag`, returning the new image id.
    async fn commit_container(&self, id: &str, repo: &str, tag: &str) -> RuntimeResult<String>;
    /// Removes dangling images, returning how many were deleted.
    async fn prune_images(&self) -> RuntimeResult<u64>;
}

impl fmt::Debug for dyn ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContainerRuntime")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_errors_classify() {
        assert!(RuntimeError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(RuntimeError::RuntimeUnavailable("down".into()).is_retryable());
        assert!(
            RuntimeError::Api {
                status: 503,
                message: "busy".into()
            }
            .is_retryable()
        );
        assert_eq!(
            RuntimeError::NotFound("c1".into()).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            RuntimeError::InvalidArgument("bad".into()).class(),
            ErrorClass::Validation
        );
    }

    #[test]
    fn image_digest_comes_from_repo_digests() {
        let image = ImageDetails {
            id: "sha256:img".to_string(),
            repo_tags: vec!["nginx:1.25.0".to_string()],
            repo_digests: vec!["nginx@sha256:bbb".to_string()],
        };
        assert_eq!(image.digest().as_deref(), Some("sha256:bbb"));
    }

    #[test]
    fn derived_spec_keeps_configuration() {
        let mut spec = ContainerSpec::new("web", "nginx:1.24.0");
        spec.env.push("A=1".to_string());
        spec.binds.push("/data:/data".to_string());
        let next = spec.derive("web-next", "nginx:1.25.0");
        assert_eq!(next.env, spec.env);
        assert_eq!(next.binds, spec.binds);
        assert_eq!(next.image, "nginx:1.25.0");
        assert_eq!(next.name, "web-next");
    }
}
