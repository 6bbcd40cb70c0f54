use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use super::cron::{CronError, CronExpression};

/// When scheduled-policy updates may run.
pub trait MaintenanceWindow: Send + Sync {
    fn is_open(&self, at: DateTime<Utc>) -> bool;

    /// Start of the next window strictly after `after`.
    fn next_opening(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// Window opening at every firing of `start` and lasting `duration`.
#[derive(Debug, Clone)]
pub struct CronMaintenanceWindow {
    start: CronExpression,
    duration: chrono::Duration,
    tz: Tz,
}

impl CronMaintenanceWindow {
    pub fn new(start: &str, duration: Duration, tz: Tz) -> Result<Self, CronError> {
        let duration = chrono::Duration::from_std(duration).map_err(|_| CronError::InvalidField {
            field: "duration",
            value: format!("{:?}", duration),
            reason: "window duration too large".to_string(),
        })?;
        Ok(CronMaintenanceWindow {
            start: CronExpression::parse(start)?,
            duration,
            tz,
        })
    }
}

impl MaintenanceWindow for CronMaintenanceWindow {
    fn is_open(&self, at: DateTime<Utc>) -> bool {
        // Open iff some opening falls in (at - duration, at].
        self.start
            .next_after(&(at - self.duration), &self.tz)
            .is_some_and(|opening| opening <= at)
    }

    fn next_opening(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.start.next_after(&after, &self.tz)
    }
}
