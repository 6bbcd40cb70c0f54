use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::TaskServices;
use super::stats::HostMonitor;
use super::types::TaskContext;
use crate::lib::config::{GatewayConfig, OrchestratorConfig};
use crate::lib::manager::orchestrator::UpdateOrchestrator;
use crate::lib::manager::types::ManagedContainer;
use crate::lib::registry::advisories::StaticAdvisoryDb;
use crate::lib::registry::checker::VersionChecker;
use crate::lib::registry::resolver::RegistryResolver;
use crate::lib::registry::testing::FakeRegistry;
use crate::lib::registry::types::UpdatePolicy;
use crate::lib::runtime::bulk::BulkConfig;
use crate::lib::runtime::gateway::RuntimeGateway;
use crate::lib::runtime::pool::ClientPool;
use crate::lib::runtime::testing::FakeRuntime;
use crate::lib::runtime::types::ContainerSpec;
use crate::lib::store::{ContainerStore, MemoryStore};
use crate::lib::tasks::types::ScheduledTask;

/// Services wired to in-memory fakes, with `web` (nginx 1.24.0, auto policy)
/// managed and nginx 1.25.0 published.
pub struct Fixture {
    pub runtime: Arc<FakeRuntime>,
    pub registry: Arc<FakeRegistry>,
    pub store: Arc<MemoryStore>,
    pub services: Arc<TaskServices>,
}

impl Fixture {
    pub fn new() -> Self {
        let runtime = Arc::new(FakeRuntime::new());
        let registry = Arc::new(FakeRegistry::new());
        registry.add_tag("library/nginx", "1.24.0", "sha256:aaa");
        registry.add_tag("library/nginx", "1.25.0", "sha256:bbb");

        let resolver = Arc::new(RegistryResolver::new(Vec::new(), Duration::from_secs(5)));
        resolver.register("docker.io", registry.clone());
        let checker = Arc::new(VersionChecker::new(
            resolver,
            Arc::new(StaticAdvisoryDb::default()),
            None,
            Duration::from_secs(60),
        ));

        let store = Arc::new(MemoryStore::new());
        let gateway = RuntimeGateway::new(
            Arc::new(ClientPool::single(runtime.clone())),
            &GatewayConfig::default(),
        );
        let orchestrator = Arc::new(UpdateOrchestrator::new(
            gateway.clone(),
            checker.clone(),
            store.clone(),
            store.clone(),
            OrchestratorConfig {
                health_timeout: Duration::from_millis(200),
                health_poll_interval: Duration::from_millis(5),
            },
        ));
        let services = Arc::new(TaskServices {
            gateway,
            checker,
            orchestrator,
            containers: store.clone(),
            executions: store.clone(),
            history_retention: Duration::from_secs(24 * 3600),
            bulk: BulkConfig::default(),
            host: HostMonitor::new(),
        });

        let fixture = Fixture {
            runtime,
            registry,
            store,
            services,
        };
        fixture.manage("web", "nginx", "1.24.0", UpdatePolicy::Auto);
        fixture
    }

    /// Starts a container for `image:tag` and manages it under `id`.
    pub fn manage(&self, id: &str, image: &str, tag: &str, policy: UpdatePolicy) -> ManagedContainer {
        let runtime_id = self
            .runtime
            .add_container(ContainerSpec::new(id, &format!("{}:{}", image, tag)));
        let mut container = ManagedContainer::new(id, id, image, tag);
        container.current_digest = Some("sha256:aaa".to_string());
        container.runtime_id = Some(runtime_id);
        container.update_policy = policy;
        self.store.save_container(&container).unwrap();
        container
    }

    pub fn context(&self, task: &ScheduledTask) -> TaskContext {
        TaskContext {
            task: task.clone(),
            execution_id: Uuid::new_v4(),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }
}
