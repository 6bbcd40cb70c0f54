use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::bulk::{BulkConfig, BulkOperationResult, run_bulk};
use super::pool::{ClientPool, PoolStats};
use super::types::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ContainerStats, ExecOutput, ImageDetails,
    RuntimeError, RuntimeResult,
};
use crate::lib::config::GatewayConfig;

#[derive(Debug, Default)]
pub struct GatewayMetrics {
    operations: AtomicU64,
    failures: AtomicU64,
    total_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub operations: u64,
    pub failures: u64,
    pub avg_duration: Duration,
}

impl GatewayMetrics {
    fn record(&self, elapsed: Duration, ok: bool) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let operations = self.operations.load(Ordering::Relaxed);
        let total = self.total_micros.load(Ordering::Relaxed);
        MetricsSnapshot {
            operations,
            failures: self.failures.load(Ordering::Relaxed),
            avg_duration: Duration::from_micros(total.checked_div(operations).unwrap_or(0)),
        }
    }
}

/// Every runtime call goes through here: bounded by a timeout, cancellable,
/// and counted.
#[derive(Clone)]
pub struct RuntimeGateway {
    pool: Arc<ClientPool>,
    operation_timeout: Duration,
    stop_timeout: Duration,
    metrics: Arc<GatewayMetrics>,
}

async fn timed<T, Fut>(
    metrics: &GatewayMetrics,
    cancel: &CancellationToken,
    timeout: Duration,
    name: &str,
    fut: Fut,
) -> RuntimeResult<T>
where
    Fut: Future<Output = RuntimeResult<T>>,
{
    let started = Instant::now();
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RuntimeError::Cancelled),
        result = tokio::time::timeout(timeout, fut) => {
            result.unwrap_or(Err(RuntimeError::Timeout(timeout)))
        }
    };
    let elapsed = started.elapsed();
    metrics.record(elapsed, result.is_ok());
    match &result {
        Ok(_) => debug!("runtime {} took {:?}", name, elapsed),
        Err(err) => warn!("runtime {} failed after {:?}: {}", name, elapsed, err),
    }
    result
}

macro_rules! bulk_op {
    ($fn_name:ident, $label:literal, $out:ty, |$rt:ident, $id:ident, $stop:ident| $body:expr) => {
        pub async fn $fn_name(
            &self,
            cancel: &CancellationToken,
            targets: &[String],
            config: &BulkConfig,
        ) -> BulkOperationResult<$out> {
            let pool = self.pool.clone();
            let metrics = self.metrics.clone();
            let $stop = self.stop_timeout;
            let result = run_bulk(cancel, targets, config, move |$id: String| {
                let pool = pool.clone();
                let metrics = metrics.clone();
                async move {
                    let started = Instant::now();
                    let lease = pool.lease();
                    let $rt = lease.handle();
                    let result: RuntimeResult<$out> = $body.await;
                    metrics.record(started.elapsed(), result.is_ok());
                    result
                }
            })
            .await;
            debug!(
                "bulk {}: {}/{} succeeded in {:?}",
                $label,
                result.summary.succeeded,
                result.summary.total,
                result.summary.total_duration
            );
            result
        }
    };
}

impl RuntimeGateway {
    pub fn new(pool: Arc<ClientPool>, config: &GatewayConfig) -> Self {
        RuntimeGateway {
            pool,
            operation_timeout: config.operation_timeout,
            stop_timeout: config.stop_timeout,
            metrics: Arc::new(GatewayMetrics::default()),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    async fn call<T, F, Fut>(&self, cancel: &CancellationToken, name: &str, op: F) -> RuntimeResult<T>
    where
        F: FnOnce(Arc<dyn ContainerRuntime>) -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        let lease = self.pool.lease();
        let fut = op(lease.handle());
        timed(&self.metrics, cancel, self.operation_timeout, name, fut).await
    }

    pub async fn ping(&self, cancel: &CancellationToken) -> RuntimeResult<()> {
        self.call(cancel, "ping", |rt| async move { rt.ping().await })
            .await
    }

    pub async fn create(&self, cancel: &CancellationToken, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.call(cancel, "create", |rt| async move { rt.create_container(spec).await })
            .await
    }

    pub async fn start(&self, cancel: &CancellationToken, id: &str) -> RuntimeResult<()> {
        self.call(cancel, "start", |rt| async move { rt.start_container(id).await })
            .await
    }

    pub async fn stop(&self, cancel: &CancellationToken, id: &str) -> RuntimeResult<()> {
        let t = self.stop_timeout;
        self.call(cancel, "stop", |rt| async move { rt.stop_container(id, t).await })
            .await
    }

    pub async fn restart(&self, cancel: &CancellationToken, id: &str) -> RuntimeResult<()> {
        let t = self.stop_timeout;
        self.call(cancel, "restart", |rt| async move { rt.restart_container(id, t).await })
            .await
    }

    pub async fn pause(&self, cancel: &CancellationToken, id: &str) -> RuntimeResult<()> {
        self.call(cancel, "pause", |rt| async move { rt.pause_container(id).await })
            .await
    }

    pub async fn unpause(&self, cancel: &CancellationToken, id: &str) -> RuntimeResult<()> {
        self.call(cancel, "unpause", |rt| async move { rt.unpause_container(id).await })
            .await
    }

    pub async fn remove(&self, cancel: &CancellationToken, id: &str, force: bool) -> RuntimeResult<()> {
        self.call(cancel, "remove", |rt| async move { rt.remove_container(id, force).await })
            .await
    }

    pub async fn rename(&self, cancel: &CancellationToken, id: &str, name: &str) -> RuntimeResult<()> {
        self.call(cancel, "rename", |rt| async move { rt.rename_container(id, name).await })
            .await
    }

    pub async fn inspect(&self, cancel: &CancellationToken, id: &str) -> RuntimeResult<ContainerDetails> {
        self.call(cancel, "inspect", |rt| async move { rt.inspect_container(id).await })
            .await
    }

    pub async fn stats(&self, cancel: &CancellationToken, id: &str) -> RuntimeResult<ContainerStats> {
        self.call(cancel, "stats", |rt| async move { rt.container_stats(id).await })
            .await
    }

    pub async fn logs(&self, cancel: &CancellationToken, id: &str, tail: usize) -> RuntimeResult<Vec<String>> {
        self.call(cancel, "logs", |rt| async move { rt.container_logs(id, tail).await })
            .await
    }

    pub async fn exec(&self, cancel: &CancellationToken, id: &str, cmd: &[String]) -> RuntimeResult<ExecOutput> {
        self.call(cancel, "exec", |rt| async move { rt.exec(id, cmd).await })
            .await
    }

    pub async fn pull_image(&self, cancel: &CancellationToken, image: &str) -> RuntimeResult<Option<String>> {
        self.call(cancel, "pull_image", |rt| async move { rt.pull_image(image).await })
            .await
    }

    pub async fn inspect_image(&self, cancel: &CancellationToken, image: &str) -> RuntimeResult<ImageDetails> {
        self.call(cancel, "inspect_image", |rt| async move { rt.inspect_image(image).await })
            .await
    }

    pub async fn commit(
        &self,
        cancel: &CancellationToken,
        id: &str,
        repo: &str,
        tag: &str,
    ) -> RuntimeResult<String> {
        self.call(cancel, "commit", |rt| async move {
            rt.commit_container(id, repo, tag).await
        })
        .await
    }

    pub async fn prune_images(&self, cancel: &CancellationToken) -> RuntimeResult<u64> {
        self.call(cancel, "prune_images", |rt| async move { rt.prune_images().await })
            .await
    }

    bulk_op!(bulk_start, "start", (), |rt, id, _stop| rt.start_container(&id));
    bulk_op!(bulk_stop, "stop", (), |rt, id, stop| rt.stop_container(&id, stop));
    bulk_op!(bulk_restart, "restart", (), |rt, id, stop| rt.restart_container(&id, stop));
    bulk_op!(bulk_remove, "remove", (), |rt, id, _stop| rt.remove_container(&id, true));
    bulk_op!(bulk_stats, "stats", ContainerStats, |rt, id, _stop| rt.container_stats(&id));
    bulk_op!(bulk_inspect, "inspect", ContainerDetails, |rt, id, _stop| rt.inspect_container(&id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::runtime::testing::FakeRuntime;
    use crate::lib::runtime::types::ContainerStatus;

    fn gateway(fake: Arc<FakeRuntime>) -> RuntimeGateway {
        let pool = Arc::new(ClientPool::single(fake));
        RuntimeGateway::new(pool, &GatewayConfig::default())
    }

    fn seed(fake: &FakeRuntime, n: usize) -> Vec<String> {
        (0..n)
            .map(|i| fake.add_container(ContainerSpec::new(&format!("web-{}", i), "nginx:1.25.0")))
            .collect()
    }

    #[tokio::test]
    async fn single_operations_record_metrics() {
        let fake = Arc::new(FakeRuntime::new());
        let ids = seed(&fake, 1);
        let gw = gateway(fake.clone());
        let cancel = CancellationToken::new();

        gw.stop(&cancel, &ids[0]).await.unwrap();
        assert!(gw.inspect(&cancel, "missing").await.is_err());

        let metrics = gw.metrics();
        assert_eq!(metrics.operations, 2);
        assert_eq!(metrics.failures, 1);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let fake = Arc::new(FakeRuntime::new());
        fake.set_delay(Duration::from_secs(10));
        let gw = gateway(fake);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(gw.ping(&cancel).await, Err(RuntimeError::Cancelled));
    }

    #[tokio::test]
    async fn operation_timeout_applies() {
        let fake = Arc::new(FakeRuntime::new());
        fake.set_delay(Duration::from_millis(200));
        let pool = Arc::new(ClientPool::single(fake));
        let config = GatewayConfig {
            operation_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let gw = RuntimeGateway::new(pool, &config);
        let err = gw.ping(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout(_)));
    }

    #[tokio::test]
    async fn bulk_stop_returns_entry_per_target() {
        let fake = Arc::new(FakeRuntime::new());
        fake.set_delay(Duration::from_millis(5));
        let ids = seed(&fake, 12);
        let gw = gateway(fake.clone());
        let config = BulkConfig {
            max_concurrency: 4,
            ..Default::default()
        };

        let result = gw.bulk_stop(&CancellationToken::new(), &ids, &config).await;
        assert_eq!(result.results.len(), 12);
        assert!(result.all_succeeded());
        assert!(fake.peak_concurrency() <= 4);
        assert_eq!(gw.metrics().operations, 12);
    }

    #[tokio::test]
    async fn fail_fast_bulk_stop_skips_later_targets() {
        let fake = Arc::new(FakeRuntime::new());
        let ids = seed(&fake, 4);
        fake.fail("stop", &ids[1], RuntimeError::Conflict("stuck".to_string()));
        let gw = gateway(fake.clone());
        let config = BulkConfig {
            max_concurrency: 1,
            fail_fast: true,
            ..Default::default()
        };

        let result = gw.bulk_stop(&CancellationToken::new(), &ids, &config).await;
        assert!(result.results[0].success);
        assert!(!result.results[1].success && !result.results[1].skipped);
        assert!(result.results[2].skipped && result.results[3].skipped);
        assert!(!fake.calls().iter().any(|c| c == &format!("stop {}", ids[3])));
    }

    #[tokio::test]
    async fn fail_fast_lets_in_flight_targets_finish() {
        let fake = Arc::new(FakeRuntime::new());
        let ids = seed(&fake, 5);
        fake.set_target_delay(&ids[0], Duration::from_millis(100));
        fake.fail("stop", &ids[1], RuntimeError::Conflict("stuck".to_string()));
        let gw = gateway(fake.clone());
        let config = BulkConfig {
            max_concurrency: 2,
            fail_fast: true,
            ..Default::default()
        };

        let result = gw.bulk_stop(&CancellationToken::new(), &ids, &config).await;
        assert_eq!(result.results.len(), 5);
        // Started alongside the failing target and allowed to complete.
        assert!(result.results[0].success);
        assert_eq!(fake.container(&ids[0]).unwrap().status, ContainerStatus::Exited);
        assert!(!result.results[1].success && !result.results[1].skipped);
        assert!(result.results[1].error.as_deref().unwrap().contains("stuck"));
        for item in &result.results[2..] {
            assert!(item.skipped, "{} should be skipped", item.target);
        }
        for id in &ids[2..] {
            assert!(!fake.calls().contains(&format!("stop {}", id)));
        }
        assert_eq!(result.summary.skipped, 3);
        assert_eq!(result.summary.failed, 4);
        assert_eq!(result.summary.succeeded, 1);
    }

    #[tokio::test]
    async fn bulk_inspect_returns_details() {
        let fake = Arc::new(FakeRuntime::new());
        let ids = seed(&fake, 2);
        let gw = gateway(fake);
        let result = gw
            .bulk_inspect(&CancellationToken::new(), &ids, &BulkConfig::default())
            .await;
        let names: Vec<_> = result
            .results
            .iter()
            .map(|r| r.output.as_ref().unwrap().name.clone())
            .collect();
        assert_eq!(names, vec!["web-0", "web-1"]);
    }
}
