use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, LogsOptions,
        RemoveContainerOptions, RenameContainerOptions, RestartContainerOptions,
        StartContainerOptions, StatsOptions, StopContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::{CommitContainerOptions, CreateImageOptions, PruneImagesOptions},
    models::{
        ContainerInspectResponse, ContainerStateStatusEnum, HealthStatusEnum, HostConfig,
        PortBinding, RestartPolicy, RestartPolicyNameEnum,
    },
};
use futures_util::stream::StreamExt;
use tracing::{debug, info};

use super::types::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ContainerStats, ContainerStatus,
    ExecOutput, HealthState, ImageDetails, RuntimeError, RuntimeResult,
};

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Docker daemon backend.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connects to `host` (`unix://`, `tcp://` or `http://`), or to the local
    /// defaults when no host is given.
    pub fn connect(host: Option<&str>) -> RuntimeResult<Self> {
        let client = match host {
            None => Docker::connect_with_local_defaults(),
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(host) => Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION),
        }
        .map_err(map_err)?;

        Ok(DockerRuntime { client })
    }
}

fn map_err(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => RuntimeError::NotFound(message),
            400 => RuntimeError::InvalidArgument(message),
            409 => RuntimeError::Conflict(message),
            status => RuntimeError::Api { status, message },
        },
        BollardError::RequestTimeoutError => {
            RuntimeError::Timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        }
        other => RuntimeError::RuntimeUnavailable(other.to_string()),
    }
}

fn restart_policy_name(policy: &str) -> RestartPolicyNameEnum {
    match policy {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::NO,
    }
}

fn restart_policy_str(policy: &RestartPolicyNameEnum) -> &'static str {
    match policy {
        RestartPolicyNameEnum::ALWAYS => "always",
        RestartPolicyNameEnum::UNLESS_STOPPED => "unless-stopped",
        RestartPolicyNameEnum::ON_FAILURE => "on-failure",
        _ => "no",
    }
}

fn status_from(status: Option<ContainerStateStatusEnum>) -> ContainerStatus {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
        Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
        Some(ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => ContainerStatus::Removing,
        Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited,
        Some(ContainerStateStatusEnum::DEAD) => ContainerStatus::Dead,
        _ => ContainerStatus::Unknown,
    }
}

fn health_from(status: Option<HealthStatusEnum>) -> Option<HealthState> {
    match status {
        Some(HealthStatusEnum::STARTING) => Some(HealthState::Starting),
        Some(HealthStatusEnum::HEALTHY) => Some(HealthState::Healthy),
        Some(HealthStatusEnum::UNHEALTHY) => Some(HealthState::Unhealthy),
        _ => None,
    }
}

fn details_from(resp: ContainerInspectResponse) -> ContainerDetails {
    let config = resp.config.unwrap_or_default();
    let host = resp.host_config.unwrap_or_default();
    let state = resp.state.unwrap_or_default();

    let port_bindings = host
        .port_bindings
        .unwrap_or_default()
        .into_iter()
        .map(|(port, bindings)| {
            let host_ports = bindings
                .unwrap_or_default()
                .into_iter()
                .filter_map(|b| b.host_port)
                .collect();
            (port, host_ports)
        })
        .collect();

    let spec = ContainerSpec {
        name: resp
            .name
            .clone()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string(),
        image: config.image.unwrap_or_default(),
        env: config.env.unwrap_or_default(),
        cmd: config.cmd.unwrap_or_default(),
        labels: config.labels.unwrap_or_default(),
        exposed_ports: config
            .exposed_ports
            .unwrap_or_default()
            .into_keys()
            .collect(),
        port_bindings,
        binds: host.binds.unwrap_or_default(),
        restart_policy: host
            .restart_policy
            .and_then(|p| p.name)
            .map(|name| restart_policy_str(&name).to_string())
            .unwrap_or_else(|| "no".to_string()),
        network_mode: host.network_mode,
        memory: host.memory,
        nano_cpus: host.nano_cpus,
    };

    ContainerDetails {
        id: resp.id.unwrap_or_default(),
        name: spec.name.clone(),
        image_id: resp.image.unwrap_or_default(),
        status: status_from(state.status),
        health: health_from(state.health.and_then(|h| h.status)),
        started_at: state.started_at,
        exit_code: state.exit_code,
        spec,
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
        .port_bindings
        .iter()
        .map(|(port, host_ports)| {
            let bindings = host_ports
                .iter()
                .map(|host_port| PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.clone()),
                })
                .collect();
            (port.clone(), Some(bindings))
        })
        .collect();

    let host_config = HostConfig {
        restart_policy: Some(RestartPolicy {
            name: Some(restart_policy_name(&spec.restart_policy)),
            maximum_retry_count: None,
        }),
        binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        network_mode: spec.network_mode.clone(),
        memory: spec.memory,
        nano_cpus: spec.nano_cpus,
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        env: Some(spec.env.clone()),
        cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
        labels: Some(spec.labels.clone()),
        exposed_ports: Some(
            spec.exposed_ports
                .iter()
                .map(|port| (port.clone(), HashMap::new()))
                .collect(),
        ),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        self.client.ping().await.map_err(map_err)?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        if spec.image.is_empty() {
            return Err(RuntimeError::InvalidArgument(
                "container image must not be empty".to_string(),
            ));
        }

        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        });
        let resp = self
            .client
            .create_container(options, container_config(spec))
            .await
            .map_err(map_err)?;

        for warning in &resp.warnings {
            debug!("create_container {}: {}", spec.name, warning);
        }
        info!("Container created: {} ({})", spec.name, resp.id);
        Ok(resp.id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_err)
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> RuntimeResult<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        self.client
            .stop_container(id, Some(options))
            .await
            .map_err(map_err)
    }

    async fn restart_container(&self, id: &str, timeout: Duration) -> RuntimeResult<()> {
        let options = RestartContainerOptions {
            t: timeout.as_secs() as isize,
        };
        self.client
            .restart_container(id, Some(options))
            .await
            .map_err(map_err)
    }

    async fn pause_container(&self, id: &str) -> RuntimeResult<()> {
        self.client.pause_container(id).await.map_err(map_err)
    }

    async fn unpause_container(&self, id: &str) -> RuntimeResult<()> {
        self.client.unpause_container(id).await.map_err(map_err)
    }

    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(map_err)
    }

    async fn rename_container(&self, id: &str, name: &str) -> RuntimeResult<()> {
        let options = RenameContainerOptions {
            name: name.to_string(),
        };
        self.client
            .rename_container(id, options)
            .await
            .map_err(map_err)
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerDetails> {
        let resp = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_err)?;
        Ok(details_from(resp))
    }

    async fn container_stats(&self, id: &str) -> RuntimeResult<ContainerStats> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.client.stats(id, Some(options));
        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => return Err(map_err(e)),
            None => {
                return Err(RuntimeError::RuntimeUnavailable(format!(
                    "no stats returned for {}",
                    id
                )));
            }
        };

        let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
            - stats.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
            - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
        let cpus = stats.cpu_stats.online_cpus.unwrap_or(1) as f64;
        let cpu_percent = if system_delta > 0.0 && cpu_delta > 0.0 {
            (cpu_delta / system_delta) * cpus * 100.0
        } else {
            0.0
        };

        let (rx, tx) = stats
            .networks
            .unwrap_or_default()
            .values()
            .fold((0, 0), |(rx, tx), net| (rx + net.rx_bytes, tx + net.tx_bytes));

        Ok(ContainerStats {
            cpu_percent: (cpu_percent * 100.0).round() / 100.0,
            memory_usage: stats.memory_stats.usage.unwrap_or(0),
            memory_limit: stats.memory_stats.limit.unwrap_or(0),
            network_rx_bytes: rx,
            network_tx_bytes: tx,
        })
    }

    async fn container_logs(&self, id: &str, tail: usize) -> RuntimeResult<Vec<String>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.logs(id, Some(options));
        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_err)?;
            let text = String::from_utf8_lossy(&chunk.into_bytes()).to_string();
            lines.extend(text.lines().map(str::to_string));
        }
        Ok(lines)
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> RuntimeResult<ExecOutput> {
        if cmd.is_empty() {
            return Err(RuntimeError::InvalidArgument(
                "exec command must not be empty".to_string(),
            ));
        }

        let options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(cmd.to_vec()),
            ..Default::default()
        };
        let exec = self
            .client
            .create_exec(id, options)
            .await
            .map_err(map_err)?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(map_err)?
        {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(map_err)?;
                output.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await.map_err(map_err)?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code,
            output,
        })
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult<Option<String>> {
        info!("Pulling image: {}", image);

        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(msg) = stream.next().await {
            let info = msg.map_err(map_err)?;
            if let Some(status) = info.status {
                debug!("pull {}: {}", image, status);
            }
        }

        info!("Image pulled: {}", image);
        Ok(self.inspect_image(image).await?.digest())
    }

    async fn inspect_image(&self, image: &str) -> RuntimeResult<ImageDetails> {
        let resp = self.client.inspect_image(image).await.map_err(map_err)?;
        Ok(ImageDetails {
            id: resp.id.unwrap_or_default(),
            repo_tags: resp.repo_tags.unwrap_or_default(),
            repo_digests: resp.repo_digests.unwrap_or_default(),
        })
    }

    async fn commit_container(&self, id: &str, repo: &str, tag: &str) -> RuntimeResult<String> {
        let options = CommitContainerOptions {
            container: id.to_string(),
            repo: repo.to_string(),
            tag: tag.to_string(),
            pause: true,
            ..Default::default()
        };
        self.client
            .commit_container(options, Config::<String>::default())
            .await
            .map_err(map_err)?;

        let image = self.inspect_image(&format!("{}:{}", repo, tag)).await?;
        Ok(image.id)
    }

    async fn prune_images(&self) -> RuntimeResult<u64> {
        let resp = self
            .client
            .prune_images(None::<PruneImagesOptions<String>>)
            .await
            .map_err(map_err)?;
        let deleted = resp.images_deleted.map(|d| d.len() as u64).unwrap_or(0);
        info!(
            "Pruned {} dangling images ({} bytes reclaimed)",
            deleted,
            resp.space_reclaimed.unwrap_or(0)
        );
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_map_to_typed_errors() {
        let not_found = map_err(BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: web".to_string(),
        });
        assert!(matches!(not_found, RuntimeError::NotFound(_)));

        let busy = map_err(BollardError::DockerResponseServerError {
            status_code: 500,
            message: "daemon busy".to_string(),
        });
        assert!(matches!(busy, RuntimeError::Api { status: 500, .. }));

        assert!(matches!(
            map_err(BollardError::RequestTimeoutError),
            RuntimeError::Timeout(_)
        ));
    }

    #[test]
    fn restart_policy_round_trips_through_docker_names() {
        for policy in ["always", "unless-stopped", "on-failure", "no"] {
            assert_eq!(restart_policy_str(&restart_policy_name(policy)), policy);
        }
        assert_eq!(restart_policy_str(&restart_policy_name("bogus")), "no");
    }

    #[test]
    fn container_config_carries_spec() {
        let mut spec = ContainerSpec::new("web", "nginx:1.25.0");
        spec.exposed_ports.push("80/tcp".to_string());
        spec.port_bindings
            .insert("80/tcp".to_string(), vec!["8080".to_string()]);
        spec.binds.push("/srv/www:/usr/share/nginx/html:ro".to_string());

        let config = container_config(&spec);
        assert_eq!(config.image.as_deref(), Some("nginx:1.25.0"));
        assert!(config.exposed_ports.unwrap().contains_key("80/tcp"));

        let host = config.host_config.unwrap();
        assert_eq!(host.binds.unwrap().len(), 1);
        let bindings = host.port_bindings.unwrap();
        let binding = bindings["80/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8080"));
    }
}
