//! Built-in housekeeping tasks registered by the worker command.

use chrono::{Duration, Utc};
use norn_registry::{Result, TaskContext, TaskRegistry};
use tracing::info;

/// Finished rows older than this are dropped by `delete-old-tasks`.
const RETAIN_FINISHED_DAYS: i64 = 7;

/// Register the scheduler's own maintenance tasks.
///
/// `delete-old-tasks` allows skipping: one deletion pass catches up on any
/// number of missed intervals, so there is no point queueing them all.
pub fn register_builtin_tasks(registry: &mut TaskRegistry) -> Result<()> {
    registry
        .task("delete-old-tasks")
        .allow_skip(true)
        .register(|ctx: TaskContext| async move {
            let deleted = ctx
                .queue
                .delete_old(Duration::days(RETAIN_FINISHED_DAYS), Utc::now())?;
            info!(deleted, "old finished tasks purged");
            Ok(())
        })?;
    Ok(())
}
