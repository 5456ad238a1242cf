//! Deterministic cron evaluation for schedule triggers: a trigger's cron
//! expression is evaluated against its declared IANA timezone, and the
//! caller gets back the single next UTC instant it should fire — computing
//! that once here keeps the trigger engine's poll loop free of timezone
//! arithmetic.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::QueueError;

/// A parsed, validated cron expression bound to a timezone.
///
/// Constructing one validates the expression eagerly, so a malformed cron
/// expression is rejected at trigger-definition time, not discovered at the
/// next scheduled tick.
pub struct CronSchedule {
    schedule: Schedule,
    timezone: Tz,
}

impl CronSchedule {
    pub fn parse(expression: &str, timezone: &str) -> Result<Self, QueueError> {
        let schedule = Schedule::from_str(expression)
            .map_err(|e| QueueError::Validation(format!("invalid cron expression: {e}")))?;
        let timezone = timezone
            .parse::<Tz>()
            .map_err(|_| QueueError::Validation(format!("unknown timezone: {timezone}")))?;
        Ok(Self { schedule, timezone })
    }

    /// The next fire time strictly after `after`, in UTC.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local_after = after.with_timezone(&self.timezone);
        self.schedule
            .after(&local_after)
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }
}
