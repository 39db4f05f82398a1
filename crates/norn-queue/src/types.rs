use chrono::{DateTime, SecondsFormat, Utc};
use norn_core::Arguments;
use serde::{Deserialize, Serialize};

/// A persisted one-off task row (or one occurrence of a recurring schedule).
///
/// State is encoded by the two nullable timestamps:
/// - `started_at == None` and `run_at <= now` — eligible for leasing
/// - `started_at == Some, finished_at == None` — leased (or abandoned by a
///   crashed worker; see `Queue::reclaim_stale`)
/// - `finished_at == Some` — terminal success
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: i64,
    pub name: String,
    pub arguments: Arguments,
    pub run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when this row is an occurrence of a recurring schedule.
    pub from_schedule_id: Option<i64>,
}

/// A persisted cron recurrence.
///
/// While `is_enabled`, `next_task_id` references exactly one live
/// [`QueuedTask`], the schedule's next occurrence. The 1:1 link is
/// maintained by `Queue::create_schedule` and `Queue::advance_schedule` so
/// the chain never breaks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringSchedule {
    pub id: i64,
    pub name: String,
    pub arguments: Arguments,
    pub cron_expression: String,
    pub is_enabled: bool,
    pub next_task_id: Option<i64>,
}

/// Format a timestamp for storage.
///
/// Fixed-width RFC3339 UTC with microseconds (`2026-08-07T09:00:00.000000Z`)
/// so that SQL string comparison orders chronologically.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp back into `DateTime<Utc>`.
pub(crate) fn parse_ts(s: &str) -> chrono::ParseResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}
