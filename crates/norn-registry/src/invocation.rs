use chrono::{DateTime, Utc};
use norn_core::Arguments;
use norn_queue::Queue;
use tracing::warn;

use crate::registry::{TaskBody, TaskContext};

/// A task with bound arguments, not yet executed.
///
/// Must be resolved exactly once: [`run_now`](Invocation::run_now) executes
/// in-process (bypassing the queue), [`defer`](Invocation::defer) persists a
/// one-off row, [`schedule`](Invocation::schedule) creates a cron recurrence.
/// All three take `self` by value, so consuming a handle twice does not
/// compile. A handle dropped without being consumed warns, since that call site
/// built an invocation and then silently did nothing.
pub struct Invocation {
    name: String,
    arguments: Arguments,
    body: TaskBody,
    consumed: bool,
}

impl Invocation {
    pub(crate) fn new(name: String, arguments: Arguments, body: TaskBody) -> Self {
        Self {
            name,
            arguments,
            body,
            consumed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    /// Execute the body right here, in the caller's own context; the queue
    /// tables are never touched. `queue` is handed to the body so it
    /// can read and write the store like any worker-run execution would.
    pub async fn run_now(mut self, queue: &Queue) -> anyhow::Result<()> {
        self.consumed = true;
        let body = std::sync::Arc::clone(&self.body);
        let ctx = TaskContext {
            arguments: self.arguments.clone(),
            queue: queue.clone(),
        };
        body(ctx).await
    }

    /// Persist a one-off task row; `run_at` defaults to now.
    ///
    /// Returns the queued row's id.
    pub fn defer(
        mut self,
        queue: &Queue,
        run_at: Option<DateTime<Utc>>,
    ) -> norn_queue::Result<i64> {
        self.consumed = true;
        queue.enqueue(&self.name, &self.arguments, run_at)
    }

    /// Create a recurring schedule; the first occurrence lands on the next
    /// cron boundary strictly after now.
    ///
    /// Returns the schedule's id.
    pub fn schedule(mut self, queue: &Queue, cron_expression: &str) -> norn_queue::Result<i64> {
        self.consumed = true;
        queue.create_schedule(&self.name, &self.arguments, cron_expression, Utc::now())
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        if !self.consumed {
            warn!(
                task_name = %self.name,
                "invocation dropped without being run, deferred, or scheduled"
            );
        }
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .field("consumed", &self.consumed)
            .finish_non_exhaustive()
    }
}
