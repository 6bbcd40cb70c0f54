//! In-memory container runtime for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::types::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ContainerStats, ContainerStatus,
    ExecOutput, HealthState, ImageDetails, RuntimeError, RuntimeResult,
};

#[derive(Default)]
struct FakeState {
    next_id: u64,
    containers: HashMap<String, ContainerDetails>,
    images: HashMap<String, ImageDetails>,
    remote_digests: HashMap<String, String>,
    unhealthy_images: HashSet<String>,
    failures: HashMap<(String, String), RuntimeError>,
    delay: Duration,
    target_delays: HashMap<String, Duration>,
    dangling_images: u64,
    calls: Vec<String>,
    in_flight: usize,
    peak: usize,
}

impl FakeState {
    fn resolve(&self, id_or_name: &str) -> Option<String> {
        if self.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.containers
            .values()
            .find(|c| c.name == id_or_name)
            .map(|c| c.id.clone())
    }

    fn container_mut(&mut self, id_or_name: &str) -> RuntimeResult<&mut ContainerDetails> {
        let id = self
            .resolve(id_or_name)
            .ok_or_else(|| RuntimeError::NotFound(id_or_name.to_string()))?;
        self.containers
            .get_mut(&id)
            .ok_or_else(|| RuntimeError::NotFound(id_or_name.to_string()))
    }

    fn image_id(&self, image: &str) -> String {
        self.images
            .get(image)
            .map(|i| i.id.clone())
            .unwrap_or_else(|| format!("sha256:local-{}", image))
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        FakeRuntime::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Adds a running container and returns its id.
    pub fn add_container(&self, spec: ContainerSpec) -> String {
        let mut s = self.lock();
        s.next_id += 1;
        let id = format!("ctr-{}", s.next_id);
        let image_id = s.image_id(&spec.image);
        s.containers.insert(
            id.clone(),
            ContainerDetails {
                id: id.clone(),
                name: spec.name.clone(),
                image_id,
                status: ContainerStatus::Running,
                health: None,
                started_at: None,
                exit_code: None,
                spec,
            },
        );
        id
    }

    pub fn set_remote_digest(&self, image: &str, digest: &str) {
        self.lock()
            .remote_digests
            .insert(image.to_string(), digest.to_string());
    }

    /// Containers started from `image` report `unhealthy`.
    pub fn mark_unhealthy_image(&self, image: &str) {
        self.lock().unhealthy_images.insert(image.to_string());
    }

    pub fn set_health(&self, id_or_name: &str, health: Option<HealthState>) {
        if let Ok(c) = self.lock().container_mut(id_or_name) {
            c.health = health;
        }
    }

    pub fn set_status(&self, id_or_name: &str, status: ContainerStatus) {
        if let Ok(c) = self.lock().container_mut(id_or_name) {
            c.status = status;
        }
    }

    /// Makes `op` fail for `target` (container id, name or image).
    pub fn fail(&self, op: &str, target: &str, err: RuntimeError) {
        self.lock()
            .failures
            .insert((op.to_string(), target.to_string()), err);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    /// Delay for calls on one target, overriding `set_delay`.
    pub fn set_target_delay(&self, target: &str, delay: Duration) {
        self.lock().target_delays.insert(target.to_string(), delay);
    }

    pub fn set_dangling_images(&self, count: u64) {
        self.lock().dangling_images = count;
    }

    pub fn container(&self, id_or_name: &str) -> Option<ContainerDetails> {
        let s = self.lock();
        s.resolve(id_or_name)
            .and_then(|id| s.containers.get(&id).cloned())
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().containers.values().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.lock().peak
    }

    async fn enter(&self, op: &str, target: &str) -> RuntimeResult<()> {
        let delay = {
            let mut s = self.lock();
            s.calls.push(format!("{} {}", op, target));
            s.in_flight += 1;
            s.peak = s.peak.max(s.in_flight);
            s.target_delays.get(target).copied().unwrap_or(s.delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut s = self.lock();
        s.in_flight -= 1;
        let key = (op.to_string(), target.to_string());
        if let Some(err) = s.failures.get(&key) {
            return Err(err.clone());
        }
        if let Some(id) = s.resolve(target) {
            let name = s.containers[&id].name.clone();
            for alias in [id, name] {
                if let Some(err) = s.failures.get(&(op.to_string(), alias)) {
                    return Err(err.clone());
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        self.enter("ping", "").await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.enter("create", &spec.name).await?;
        if spec.image.is_empty() {
            return Err(RuntimeError::InvalidArgument("empty image".to_string()));
        }
        if self.lock().resolve(&spec.name).is_some() {
            return Err(RuntimeError::Conflict(format!("name {} in use", spec.name)));
        }
        let id = self.add_container(spec.clone());
        self.set_status(&id, ContainerStatus::Created);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.enter("start", id).await?;
        let mut s = self.lock();
        let unhealthy = s.unhealthy_images.clone();
        let c = s.container_mut(id)?;
        c.status = ContainerStatus::Running;
        if unhealthy.contains(&c.spec.image) {
            c.health = Some(HealthState::Unhealthy);
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> RuntimeResult<()> {
        self.enter("stop", id).await?;
        self.lock().container_mut(id)?.status = ContainerStatus::Exited;
        Ok(())
    }

    async fn restart_container(&self, id: &str, _timeout: Duration) -> RuntimeResult<()> {
        self.enter("restart", id).await?;
        let mut s = self.lock();
        let c = s.container_mut(id)?;
        c.status = ContainerStatus::Running;
        c.health = None;
        Ok(())
    }

    async fn pause_container(&self, id: &str) -> RuntimeResult<()> {
        self.enter("pause", id).await?;
        self.lock().container_mut(id)?.status = ContainerStatus::Paused;
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> RuntimeResult<()> {
        self.enter("unpause", id).await?;
        self.lock().container_mut(id)?.status = ContainerStatus::Running;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()> {
        self.enter("remove", id).await?;
        let mut s = self.lock();
        let key = s
            .resolve(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if !force && s.containers[&key].status == ContainerStatus::Running {
            return Err(RuntimeError::Conflict(format!("{} is running", id)));
        }
        s.containers.remove(&key);
        Ok(())
    }

    async fn rename_container(&self, id: &str, name: &str) -> RuntimeResult<()> {
        self.enter("rename", id).await?;
        let mut s = self.lock();
        if s.resolve(name).is_some() {
            return Err(RuntimeError::Conflict(format!("name {} in use", name)));
        }
        let c = s.container_mut(id)?;
        c.name = name.to_string();
        c.spec.name = name.to_string();
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerDetails> {
        self.enter("inspect", id).await?;
        self.container(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn container_stats(&self, id: &str) -> RuntimeResult<ContainerStats> {
        self.enter("stats", id).await?;
        self.container(id)
            .map(|_| ContainerStats {
                cpu_percent: 1.5,
                memory_usage: 64 * 1024 * 1024,
                memory_limit: 512 * 1024 * 1024,
                ..Default::default()
            })
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn container_logs(&self, id: &str, tail: usize) -> RuntimeResult<Vec<String>> {
        self.enter("logs", id).await?;
        Ok((0..tail.min(3)).map(|i| format!("line {}", i)).collect())
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> RuntimeResult<ExecOutput> {
        self.enter("exec", id).await?;
        Ok(ExecOutput {
            exit_code: Some(0),
            output: cmd.join(" "),
        })
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult<Option<String>> {
        self.enter("pull", image).await?;
        let mut s = self.lock();
        let digest = s
            .remote_digests
            .get(image)
            .cloned()
            .unwrap_or_else(|| format!("sha256:{}", image.replace([':', '/'], "-")));
        let repo = image.rsplit_once(':').map(|(r, _)| r).unwrap_or(image);
        s.images.insert(
            image.to_string(),
            ImageDetails {
                id: format!("sha256:img-{}", image.replace([':', '/'], "-")),
                repo_tags: vec![image.to_string()],
                repo_digests: vec![format!("{}@{}", repo, digest)],
            },
        );
        Ok(Some(digest))
    }

    async fn inspect_image(&self, image: &str) -> RuntimeResult<ImageDetails> {
        self.enter("inspect_image", image).await?;
        let s = self.lock();
        s.images
            .get(image)
            .or_else(|| s.images.values().find(|i| i.id == image))
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(image.to_string()))
    }

    async fn commit_container(&self, id: &str, repo: &str, tag: &str) -> RuntimeResult<String> {
        self.enter("commit", id).await?;
        let mut s = self.lock();
        s.resolve(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let reference = format!("{}:{}", repo, tag);
        let image_id = format!("sha256:commit-{}", reference.replace([':', '/'], "-"));
        s.images.insert(
            reference.clone(),
            ImageDetails {
                id: image_id.clone(),
                repo_tags: vec![reference],
                repo_digests: Vec::new(),
            },
        );
        Ok(image_id)
    }

    async fn prune_images(&self) -> RuntimeResult<u64> {
        self.enter("prune", "").await?;
        let mut s = self.lock();
        Ok(std::mem::take(&mut s.dangling_images))
    }
}
