use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{QueueError, Result};

/// A validated cron expression.
///
/// Accepts standard 5-field expressions (`minute hour day-of-month month
/// day-of-week`, e.g. `"0 9 * * *"` for 09:00 daily). The `cron` crate wants
/// a leading seconds field, so 5-field input is normalised by prefixing `0 `;
/// 6- and 7-field expressions pass through unchanged. The original expression
/// string is what gets persisted.
#[derive(Debug, Clone)]
pub struct CronSpec {
    schedule: Schedule,
    expression: String,
}

impl CronSpec {
    pub fn parse(expression: &str) -> Result<Self> {
        let normalised = if expression.split_whitespace().count() == 5 {
            format!("0 {expression}")
        } else {
            expression.to_string()
        };

        let schedule = Schedule::from_str(&normalised).map_err(|e| QueueError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            schedule,
            expression: expression.to_string(),
        })
    }

    /// The expression as the caller wrote it.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The next occurrence strictly after `after`.
    ///
    /// Errors if the schedule yields nothing in the future (e.g. an
    /// expression pinned to a year that has passed).
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.schedule
            .after(&after)
            .next()
            .ok_or_else(|| QueueError::InvalidCron {
                expression: self.expression.clone(),
                reason: "no upcoming occurrence".to_string(),
            })
    }
}
