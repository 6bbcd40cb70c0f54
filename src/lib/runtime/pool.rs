use std::ops::Deref;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info};

use super::docker::DockerRuntime;
use super::types::{ContainerRuntime, RuntimeResult};

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<Arc<dyn ContainerRuntime>>,
    leased: usize,
    fallbacks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub leased: usize,
    /// Leases served by the primary handle because every pooled one was out.
    pub fallbacks: u64,
}

/// Fixed set of runtime handles shared by the gateway.
///
/// `lease` never blocks: when every pooled handle is out, the caller shares
/// the primary handle instead.
pub struct ClientPool {
    primary: Arc<dyn ContainerRuntime>,
    size: usize,
    state: Mutex<PoolState>,
}

impl ClientPool {
    pub fn new(primary: Arc<dyn ContainerRuntime>, handles: Vec<Arc<dyn ContainerRuntime>>) -> Self {
        ClientPool {
            primary,
            size: handles.len(),
            state: Mutex::new(PoolState {
                idle: handles,
                ..Default::default()
            }),
        }
    }

    /// Pool where every lease shares one handle. Used for fakes and tiny setups.
    pub fn single(runtime: Arc<dyn ContainerRuntime>) -> Self {
        ClientPool::new(runtime, Vec::new())
    }

    /// Opens `size` Docker connections plus the primary one.
    pub fn connect_docker(host: Option<&str>, size: usize) -> RuntimeResult<Self> {
        let primary: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect(host)?);
        let mut handles: Vec<Arc<dyn ContainerRuntime>> = Vec::with_capacity(size);
        for _ in 0..size {
            handles.push(Arc::new(DockerRuntime::connect(host)?));
        }
        info!("Runtime client pool ready with {} handles", size);
        Ok(ClientPool::new(primary, handles))
    }

    pub fn lease(&self) -> PooledRuntime<'_> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.idle.pop() {
            Some(handle) => {
                state.leased += 1;
                PooledRuntime {
                    pool: self,
                    handle,
                    pooled: true,
                }
            }
            None => {
                state.fallbacks += 1;
                debug!("Client pool exhausted, sharing primary handle");
                PooledRuntime {
                    pool: self,
                    handle: self.primary.clone(),
                    pooled: false,
                }
            }
        }
    }

    pub fn primary(&self) -> Arc<dyn ContainerRuntime> {
        self.primary.clone()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        PoolStats {
            size: self.size,
            idle: state.idle.len(),
            leased: state.leased,
            fallbacks: state.fallbacks,
        }
    }

    fn give_back(&self, handle: Arc<dyn ContainerRuntime>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.leased = state.leased.saturating_sub(1);
        state.idle.push(handle);
    }
}

/// A leased handle. Goes back to the pool when dropped.
pub struct PooledRuntime<'a> {
    pool: &'a ClientPool,
    handle: Arc<dyn ContainerRuntime>,
    pooled: bool,
}

impl PooledRuntime<'_> {
    pub fn handle(&self) -> Arc<dyn ContainerRuntime> {
        self.handle.clone()
    }
}

impl Deref for PooledRuntime<'_> {
    type Target = dyn ContainerRuntime;

    fn deref(&self) -> &Self::Target {
        self.handle.as_ref()
    }
}

impl Drop for PooledRuntime<'_> {
    fn drop(&mut self) {
        if self.pooled {
            self.pool.give_back(self.handle.clone());
        }
    }
}
