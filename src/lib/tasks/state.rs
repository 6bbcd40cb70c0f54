use chrono::Utc;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::types::{ExecutionStatus, InvalidTransition, TaskExecution, TriggerSource};
use crate::lib::error::ErrorClass;

pub fn valid_state_transition(src: &ExecutionStatus, dst: &ExecutionStatus) -> bool {
    use ExecutionStatus::*;

    match src {
        Pending => matches!(dst, Running | Cancelled),
        Running => matches!(dst, Retrying | Succeeded | Failed | TimedOut | Cancelled),
        Retrying => matches!(dst, Running | Failed | TimedOut | Cancelled),
        Succeeded | Failed | TimedOut | Cancelled => false,
    }
}

impl TaskExecution {
    pub fn new(task_id: Uuid, triggered_by: TriggerSource) -> Self {
        TaskExecution {
            id: Uuid::new_v4(),
            task_id,
            status: ExecutionStatus::Pending,
            triggered_by,
            started_at: None,
            finished_at: None,
            retry_count: 0,
            error: None,
            error_class: None,
            output: None,
        }
    }

    pub fn transition(&mut self, to: ExecutionStatus) -> Result<(), InvalidTransition> {
        if !valid_state_transition(&self.status, &to) {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }

        match to {
            ExecutionStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            ExecutionStatus::Retrying => self.retry_count += 1,
            _ => {}
        }
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.status = to;
        Ok(())
    }

    /// Moves the execution to its terminal status, recording the outcome.
    pub fn finish(
        &mut self,
        status: ExecutionStatus,
        error: Option<String>,
        error_class: Option<ErrorClass>,
        output: Option<JsonValue>,
    ) -> Result<(), InvalidTransition> {
        if !status.is_terminal() {
            return Err(InvalidTransition {
                from: self.status,
                to: status,
            });
        }
        self.transition(status)?;
        self.error = error;
        self.error_class = error_class;
        self.output = output;
        Ok(())
    }
}
