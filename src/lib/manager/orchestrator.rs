use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::strategy::{Strategy, StrategyContext, strategy_for};
use super::types::{
    ManagedContainer, TriggeredBy, UpdateError, UpdateHistoryRecord, UpdateOptions, UpdateOutcome,
    UpdatePhase, UpdateRequest, UpdateResult, UpdateStrategy,
};
use crate::lib::config::OrchestratorConfig;
use crate::lib::registry::checker::VersionChecker;
use crate::lib::registry::types::UpdateRecommendation;
use crate::lib::runtime::gateway::RuntimeGateway;
use crate::lib::runtime::types::{ContainerStatus, HealthState, RuntimeError};
use crate::lib::store::{ContainerStore, UpdateHistoryStore};

/// Releases the per-container update slot on every exit path.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Target of one orchestrator run.
struct Plan {
    tag: String,
    /// Digest the registry reported for `tag`, if known.
    digest: Option<String>,
    strategy: UpdateStrategy,
    backup: bool,
}

pub struct UpdateOrchestrator {
    gateway: RuntimeGateway,
    checker: Arc<VersionChecker>,
    containers: Arc<dyn ContainerStore>,
    history: Arc<dyn UpdateHistoryStore>,
    config: OrchestratorConfig,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl UpdateOrchestrator {
    pub fn new(
        gateway: RuntimeGateway,
        checker: Arc<VersionChecker>,
        containers: Arc<dyn ContainerStore>,
        history: Arc<dyn UpdateHistoryStore>,
        config: OrchestratorConfig,
    ) -> Self {
        UpdateOrchestrator {
            gateway,
            checker,
            containers,
            history,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_updating(&self, container_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(container_id)
    }

    fn claim(&self, container_id: &str) -> UpdateResult<InFlightGuard> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(container_id.to_string()) {
            return Err(UpdateError::AlreadyInProgress(container_id.to_string()));
        }
        Ok(InFlightGuard {
            set: self.in_flight.clone(),
            id: container_id.to_string(),
        })
    }

    fn load(&self, container_id: &str) -> UpdateResult<ManagedContainer> {
        self.containers
            .get_container(container_id)
            .map_err(|e| UpdateError::Store(format!("{:#}", e)))?
            .ok_or_else(|| UpdateError::NotFound(container_id.to_string()))
    }

    /// Checks the registry, applies the policy and updates when recommended.
    pub async fn check_and_update(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        triggered_by: TriggeredBy,
        options: &UpdateOptions,
    ) -> UpdateResult<UpdateOutcome> {
        let _guard = self.claim(container_id)?;
        let container = self.load(container_id)?;
        let checked_at = Utc::now();

        let check = self
            .checker
            .check_update(
                cancel,
                &container.image_ref(),
                container.current_digest.as_deref(),
                container.registry_url.as_deref(),
            )
            .await?;
        if let Err(e) = self.containers.save_check(&container.id, &check) {
            warn!("Failed to store check result for {}: {:#}", container.id, e);
        }
        if !check.update_available {
            info!("{} is up to date ({})", container.name, container.image_ref());
            return Ok(UpdateOutcome::NoUpdate);
        }

        let recommendation = self.checker.should_update(&check, container.update_policy);
        let forced = options.force
            && matches!(recommendation, UpdateRecommendation::AwaitApproval { .. });
        if !recommendation.is_apply() && !forced {
            info!("Not updating {}: {}", container.name, recommendation);
            return Ok(UpdateOutcome::NotRecommended(recommendation));
        }

        let plan = Plan {
            tag: check.latest_tag.clone(),
            digest: check.latest_digest.clone(),
            strategy: options.strategy.unwrap_or(container.update_strategy),
            backup: options.backup,
        };
        let mut record = UpdateHistoryRecord::new(
            &container.id,
            &container.image_ref(),
            &container.image_with_tag(&plan.tag),
            plan.strategy,
            triggered_by,
            UpdatePhase::CheckingForUpdate,
        );
        record.phases[0].at = checked_at;
        record.advance(
            UpdatePhase::UpdateFound,
            Some(format!(
                "{} -> {} ({}), {}",
                check.current_tag, check.latest_tag, check.update_type, recommendation
            )),
        )?;
        self.run(cancel, container, plan, record)
            .await
            .map(UpdateOutcome::Updated)
    }

    /// Updates to an explicit tag without consulting the registry.
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        request: &UpdateRequest,
    ) -> UpdateResult<UpdateHistoryRecord> {
        let _guard = self.claim(&request.container_id)?;
        let container = self.load(&request.container_id)?;
        let plan = Plan {
            tag: request
                .target_tag
                .clone()
                .unwrap_or_else(|| container.tag.clone()),
            digest: None,
            strategy: request.strategy.unwrap_or(container.update_strategy),
            backup: request.backup,
        };
        let record = UpdateHistoryRecord::new(
            &container.id,
            &container.image_ref(),
            &container.image_with_tag(&plan.tag),
            plan.strategy,
            request.triggered_by,
            UpdatePhase::UpdateFound,
        );
        self.run(cancel, container, plan, record).await
    }

    fn persist(&self, record: &UpdateHistoryRecord) {
        if let Err(e) = self.history.save_record(record) {
            warn!("Failed to store update record {}: {:#}", record.id, e);
        }
    }

    fn advance(
        &self,
        record: &mut UpdateHistoryRecord,
        phase: UpdatePhase,
        detail: Option<String>,
    ) -> UpdateResult<()> {
        record.advance(phase, detail)?;
        self.persist(record);
        Ok(())
    }

    /// Ends the record in the terminal `phase`, forcing it when the phase
    /// table rejects the move.
    fn settle(&self, record: &mut UpdateHistoryRecord, phase: UpdatePhase, detail: Option<String>) {
        if let Err(e) = record.advance(phase, detail.clone()) {
            warn!("Update {}: {}, closing as {:?}", record.id, e, phase);
            record.close(phase, detail);
        }
        self.persist(record);
    }

    /// Fails the record before anything was changed in the runtime.
    fn abort(&self, record: &mut UpdateHistoryRecord, source: RuntimeError) -> UpdateError {
        let phase = record.phase();
        record.error = Some(source.to_string());
        self.settle(record, UpdatePhase::Failed, None);
        UpdateError::Aborted {
            record_id: record.id,
            phase,
            source,
        }
    }

    /// Fails the record once the replacement is live. Neither rollback nor a
    /// retry is attempted.
    fn fail_after_cutover(&self, record: &mut UpdateHistoryRecord, reason: String) -> UpdateError {
        record.error = Some(reason.clone());
        self.settle(record, UpdatePhase::Failed, None);
        UpdateError::FailedAfterCutover {
            record_id: record.id,
            reason,
        }
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        mut container: ManagedContainer,
        plan: Plan,
        mut record: UpdateHistoryRecord,
    ) -> UpdateResult<UpdateHistoryRecord> {
        self.persist(&record);
        info!(
            "Updating {} {} -> {} using {}",
            container.name, record.old_image, record.new_image, plan.strategy
        );

        let old = match self.gateway.inspect(cancel, container.runtime_ref()).await {
            Ok(old) => old,
            Err(e) => return Err(self.abort(&mut record, e)),
        };

        if plan.backup {
            self.advance(&mut record, UpdatePhase::BackingUp, None)?;
            let tag = format!("backup-{}", Utc::now().format("%Y%m%d%H%M%S"));
            match self.gateway.commit(cancel, &old.id, &container.image, &tag).await {
                Ok(image_id) => {
                    info!("Backed up {} as {}:{}", container.name, container.image, tag);
                    record.backup_image = Some(image_id);
                }
                Err(e) => return Err(self.abort(&mut record, e)),
            }
        }

        let pull_detail = Some(record.new_image.clone());
        self.advance(&mut record, UpdatePhase::Pulling, pull_detail)?;
        let pulled_digest = match self.gateway.pull_image(cancel, &record.new_image).await {
            Ok(digest) => digest,
            Err(e) => return Err(self.abort(&mut record, e)),
        };

        self.advance(&mut record, UpdatePhase::ApplyingStrategy, Some(plan.strategy.to_string()))?;
        let rollback_image = record
            .backup_image
            .clone()
            .unwrap_or_else(|| old.image_id.clone());
        let new_image = record.new_image.clone();
        let strategy = strategy_for(plan.strategy);
        let ctx = StrategyContext {
            gateway: &self.gateway,
            cancel,
            name: &container.name,
            old: &old,
            new_image: &new_image,
            rollback_image: &rollback_image,
        };

        let new_id = match strategy.apply(&ctx).await {
            Ok(id) => id,
            Err(e) => {
                record.error = Some(format!("apply failed: {}", e));
                return Err(self.roll_back(&ctx, strategy.as_ref(), &mut record, None).await);
            }
        };

        self.advance(&mut record, UpdatePhase::Verifying, Some(new_id.clone()))?;
        if let Err(reason) = self.verify(cancel, &new_id).await {
            record.error = Some(format!("verification failed: {}", reason));
            return Err(self
                .roll_back(&ctx, strategy.as_ref(), &mut record, Some(&new_id))
                .await);
        }

        self.advance(&mut record, UpdatePhase::Finalizing, None)?;
        let runtime_id = match strategy.finalize(&ctx, &new_id).await {
            Ok(id) => id,
            Err(e) => {
                error!("Finalizing update of {} failed: {}", container.name, e);
                return Err(self.fail_after_cutover(&mut record, format!("finalize failed: {}", e)));
            }
        };

        container.tag = plan.tag;
        // The registry digest is what later checks compare against.
        container.current_digest = plan.digest.or(pulled_digest).or(container.current_digest);
        container.runtime_id = Some(runtime_id);
        container.status = ContainerStatus::Running;
        container.last_updated_at = Some(Utc::now());
        if let Err(e) = self.containers.save_container(&container) {
            error!("Storing updated state of {} failed: {:#}", container.name, e);
            return Err(self.fail_after_cutover(
                &mut record,
                format!("container store update failed: {:#}", e),
            ));
        }

        self.settle(&mut record, UpdatePhase::Completed, None);
        info!("Updated {} to {}", container.name, record.new_image);
        Ok(record)
    }

    async fn roll_back(
        &self,
        ctx: &StrategyContext<'_>,
        strategy: &dyn Strategy,
        record: &mut UpdateHistoryRecord,
        new_id: Option<&str>,
    ) -> UpdateError {
        let reason = record.error.clone().unwrap_or_default();
        warn!("Rolling back {}: {}", ctx.name, reason);
        if let Err(e) = self.advance(record, UpdatePhase::RollingBack, None) {
            return e;
        }

        // Rollback must run to completion even when the update was cancelled.
        let detached = CancellationToken::new();
        let rollback_ctx = StrategyContext {
            cancel: &detached,
            ..*ctx
        };
        match strategy.rollback(&rollback_ctx, new_id).await {
            Ok(id) => {
                self.settle(record, UpdatePhase::RolledBack, Some(id));
                UpdateError::RolledBack {
                    record_id: record.id,
                    reason,
                }
            }
            Err(e) => {
                error!("Rollback of {} failed: {}", ctx.name, e);
                let reason = format!("{}; rollback: {}", reason, e);
                record.error = Some(reason.clone());
                self.settle(record, UpdatePhase::Failed, None);
                UpdateError::RollbackFailed {
                    record_id: record.id,
                    reason,
                }
            }
        }
    }

    /// Waits for `id` to be running and, when it has a health check, healthy.
    async fn verify(&self, cancel: &CancellationToken, id: &str) -> Result<(), String> {
        let deadline = Instant::now() + self.config.health_timeout;
        loop {
            let details = self.gateway.inspect(cancel, id).await.map_err(|e| e.to_string())?;
            match (details.status, details.health) {
                (_, Some(HealthState::Unhealthy)) => return Err("container is unhealthy".to_string()),
                (ContainerStatus::Exited | ContainerStatus::Dead, _) => {
                    return Err(format!(
                        "container {} (exit code {:?})",
                        details.status, details.exit_code
                    ));
                }
                (ContainerStatus::Running, None | Some(HealthState::Healthy)) => return Ok(()),
                _ => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(format!(
                    "not healthy after {:?}",
                    self.config.health_timeout
                ));
            }
            let wait = self.config.health_poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err("cancelled".to_string()),
                _ = sleep(wait.max(Duration::from_millis(1))) => {}
            }
        }
    }
}
