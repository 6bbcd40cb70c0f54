use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::lib::error::{Classify, ErrorClass};
use crate::lib::registry::types::{RegistryError, UpdatePolicy, UpdateRecommendation};
use crate::lib::runtime::types::{ContainerStatus, RuntimeError};

/// A container whose image this service keeps up to date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    /// Image repository without tag, e.g. `nginx` or `ghcr.io/org/app`.
    pub image: String,
    pub tag: String,
    pub current_digest: Option<String>,
    /// Unknown until the container was first seen in the runtime.
    pub runtime_id: Option<String>,
    #[serde(default)]
    pub status: ContainerStatus,
    #[serde(default)]
    pub update_policy: UpdatePolicy,
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
    pub registry_url: Option<String>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl ManagedContainer {
    pub fn new(id: &str, name: &str, image: &str, tag: &str) -> Self {
        ManagedContainer {
            id: id.to_string(),
            name: name.to_string(),
            image: image.to_string(),
            tag: tag.to_string(),
            current_digest: None,
            runtime_id: None,
            status: ContainerStatus::Unknown,
            update_policy: UpdatePolicy::default(),
            update_strategy: UpdateStrategy::default(),
            registry_url: None,
            last_updated_at: None,
        }
    }

    pub fn image_ref(&self) -> String {
        self.image_with_tag(&self.tag)
    }

    pub fn image_with_tag(&self, tag: &str) -> String {
        format!("{}:{}", self.image, tag)
    }

    /// Identifier the runtime knows this container by.
    pub fn runtime_ref(&self) -> &str {
        self.runtime_id.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    #[default]
    Recreate,
    Rolling,
    BlueGreen,
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateStrategy::Recreate => write!(f, "recreate"),
            UpdateStrategy::Rolling => write!(f, "rolling"),
            UpdateStrategy::BlueGreen => write!(f, "blue_green"),
        }
    }
}

impl std::str::FromStr for UpdateStrategy {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recreate" => Ok(UpdateStrategy::Recreate),
            "rolling" => Ok(UpdateStrategy::Rolling),
            "blue_green" | "blue-green" => Ok(UpdateStrategy::BlueGreen),
            other => Err(UpdateError::UnsupportedStrategy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdatePhase {
    CheckingForUpdate,
    NoUpdate,
    UpdateFound,
    BackingUp,
    Pulling,
    ApplyingStrategy,
    Verifying,
    Finalizing,
    Completed,
    RollingBack,
    RolledBack,
    Failed,
}

impl UpdatePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdatePhase::NoUpdate | UpdatePhase::Completed | UpdatePhase::RolledBack | UpdatePhase::Failed
        )
    }
}

pub fn valid_phase_transition(src: &UpdatePhase, dst: &UpdatePhase) -> bool {
    use UpdatePhase::*;

    match src {
        CheckingForUpdate => matches!(dst, NoUpdate | UpdateFound | Failed),
        UpdateFound => matches!(dst, BackingUp | Pulling | Failed),
        BackingUp => matches!(dst, Pulling | Failed),
        Pulling => matches!(dst, ApplyingStrategy | Failed),
        ApplyingStrategy => matches!(dst, Verifying | RollingBack | Failed),
        Verifying => matches!(dst, Finalizing | RollingBack),
        Finalizing => matches!(dst, Completed | Failed),
        RollingBack => matches!(dst, RolledBack | Failed),
        NoUpdate | Completed | RolledBack | Failed => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStatus {
    Running,
    Completed,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseEntry {
    pub phase: UpdatePhase,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

/// Audit trail of one update attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateHistoryRecord {
    pub id: Uuid,
    pub container_id: String,
    pub old_image: String,
    pub new_image: String,
    pub strategy: UpdateStrategy,
    pub status: UpdateStatus,
    pub triggered_by: TriggeredBy,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseEntry>,
    pub backup_image: Option<String>,
    pub error: Option<String>,
}

impl UpdateHistoryRecord {
    pub fn new(
        container_id: &str,
        old_image: &str,
        new_image: &str,
        strategy: UpdateStrategy,
        triggered_by: TriggeredBy,
        first_phase: UpdatePhase,
    ) -> Self {
        let now = Utc::now();
        UpdateHistoryRecord {
            id: Uuid::new_v4(),
            container_id: container_id.to_string(),
            old_image: old_image.to_string(),
            new_image: new_image.to_string(),
            strategy,
            status: UpdateStatus::Running,
            triggered_by,
            started_at: now,
            completed_at: None,
            phases: vec![PhaseEntry {
                phase: first_phase,
                at: now,
                detail: None,
            }],
            backup_image: None,
            error: None,
        }
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phases
            .last()
            .map(|entry| entry.phase)
            .unwrap_or(UpdatePhase::CheckingForUpdate)
    }

    pub fn advance(&mut self, to: UpdatePhase, detail: Option<String>) -> Result<(), UpdateError> {
        let from = self.phase();
        if !valid_phase_transition(&from, &to) {
            return Err(UpdateError::InvalidPhaseTransition { from, to });
        }
        self.phases.push(PhaseEntry {
            phase: to,
            at: Utc::now(),
            detail,
        });
        match to {
            UpdatePhase::Completed => self.finish(UpdateStatus::Completed, None),
            UpdatePhase::RolledBack => self.finish(UpdateStatus::RolledBack, self.error.clone()),
            UpdatePhase::Failed => self.finish(UpdateStatus::Failed, self.error.clone()),
            _ => {}
        }
        Ok(())
    }

    /// Ends the record in a terminal `to` even when the phase table has no
    /// edge from the current phase. A record that already ended is left as is.
    pub fn close(&mut self, to: UpdatePhase, detail: Option<String>) {
        if self.phase().is_terminal() || !to.is_terminal() {
            return;
        }
        if self.advance(to, detail.clone()).is_ok() {
            return;
        }
        self.phases.push(PhaseEntry {
            phase: to,
            at: Utc::now(),
            detail,
        });
        let status = match to {
            UpdatePhase::Completed => UpdateStatus::Completed,
            UpdatePhase::RolledBack => UpdateStatus::RolledBack,
            _ => UpdateStatus::Failed,
        };
        let error = self.error.clone();
        self.finish(status, error);
    }

    fn finish(&mut self, status: UpdateStatus, error: Option<String>) {
        if self.status == UpdateStatus::Running {
            self.status = status;
            self.error = error;
            self.completed_at = Some(Utc::now());
        }
    }
}

/// What to update to, bypassing the registry check.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub container_id: String,
    /// `None` re-pulls the current tag.
    pub target_tag: Option<String>,
    pub strategy: Option<UpdateStrategy>,
    pub backup: bool,
    pub triggered_by: TriggeredBy,
}

/// Knobs for `check_and_update`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOptions {
    pub strategy: Option<UpdateStrategy>,
    pub backup: bool,
    /// Apply even when the policy only recommends awaiting approval.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    NoUpdate,
    NotRecommended(UpdateRecommendation),
    Updated(UpdateHistoryRecord),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpdateError {
    #[error("container {0} is not managed")]
    NotFound(String),
    #[error("an update of {0} is already in progress")]
    AlreadyInProgress(String),
    #[error("unsupported update strategy: {0}")]
    UnsupportedStrategy(String),
    #[error("update check failed: {0}")]
    Check(#[from] RegistryError),
    #[error("update {record_id} aborted while {phase:?}: {source}")]
    Aborted {
        record_id: Uuid,
        phase: UpdatePhase,
        source: RuntimeError,
    },
    #[error("update {record_id} rolled back: {reason}")]
    RolledBack { record_id: Uuid, reason: String },
    #[error("update {record_id} failed and rollback failed: {reason}")]
    RollbackFailed { record_id: Uuid, reason: String },
    /// The replacement was already live when the update failed, so it can be
    /// neither rolled back nor safely repeated.
    #[error("update {record_id} failed after cutover: {reason}")]
    FailedAfterCutover { record_id: Uuid, reason: String },
    #[error("invalid update phase transition from {from:?} to {to:?}")]
    InvalidPhaseTransition { from: UpdatePhase, to: UpdatePhase },
    #[error("store error: {0}")]
    Store(String),
}

impl Classify for UpdateError {
    fn class(&self) -> ErrorClass {
        match self {
            UpdateError::UnsupportedStrategy(_) => ErrorClass::Validation,
            UpdateError::Check(err) => err.class(),
            UpdateError::Aborted { source, .. } => source.class(),
            UpdateError::Store(_) => ErrorClass::Transient,
            UpdateError::NotFound(_)
            | UpdateError::AlreadyInProgress(_)
            | UpdateError::RolledBack { .. }
            | UpdateError::RollbackFailed { .. }
            | UpdateError::FailedAfterCutover { .. }
            | UpdateError::InvalidPhaseTransition { .. } => ErrorClass::Permanent,
        }
    }
}

pub type UpdateResult<T> = Result<T, UpdateError>;
