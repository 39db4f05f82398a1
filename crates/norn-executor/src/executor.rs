use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use norn_core::config::DEFAULT_POLL_INTERVAL_SECS;
use norn_queue::{Queue, QueuedTask};
use norn_registry::{RegisteredTask, TaskContext, TaskRegistry};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{ExecutorError, Result};

/// Savepoint name an atomic task body runs under.
const BODY_SAVEPOINT: &str = "task_body";

/// One worker: a loop that leases due tasks and executes them.
///
/// The executor owns its [`Queue`] handle (its own SQLite connection), so the
/// transaction it holds open for an atomic task can never interleave with
/// another worker's statements.
pub struct Executor {
    registry: Arc<TaskRegistry>,
    queue: Queue,
    poll_interval: Duration,
}

impl Executor {
    pub fn new(registry: Arc<TaskRegistry>, queue: Queue) -> Self {
        Self {
            registry,
            queue,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        }
    }

    /// Idle sleep between lease attempts when nothing is due. This is the
    /// idle backoff, not the failure backoff.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Loop forever executing tasks until `shutdown` flips to `true`.
    ///
    /// Each iteration runs on a detached task so that cancelling or shutting
    /// down the loop never abandons a claimed row mid-flight: a leased task
    /// always reaches `mark_finished` or `mark_failed`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let registry = Arc::clone(&self.registry);
            let queue = self.queue.clone();
            let iteration = tokio::spawn(async move { step(registry, queue, Utc::now()).await });

            let outcome = match iteration.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    error!(error = %join_error, "worker iteration panicked");
                    if self.idle(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match outcome {
                // Ran something; immediately try for the next due task.
                Ok(true) => {}
                Ok(false) => {
                    if self.idle(&mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    // Store-level trouble: back off and retry the whole lease
                    // cycle. Not a task failure, so no row is touched.
                    error!(error = %e, "lease cycle failed, backing off");
                    if self.idle(&mut shutdown).await {
                        break;
                    }
                }
            }
        }
        info!("worker stopped");
    }

    /// Run a single lease-execute-record iteration at the given instant.
    ///
    /// Returns `Ok(true)` if a task was executed (successfully or not),
    /// `Ok(false)` if nothing was due.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<bool> {
        step(Arc::clone(&self.registry), self.queue.clone(), now).await
    }

    /// Sleep out the poll interval, waking early on shutdown. Returns `true`
    /// when the loop should stop (flag flipped, or the sender is gone).
    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => false,
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }
}

/// One worker iteration: lease, dispatch by atomicity, record the outcome.
async fn step(registry: Arc<TaskRegistry>, queue: Queue, now: DateTime<Utc>) -> Result<bool> {
    let outcome = lease_cycle(&registry, &queue, now).await;
    if outcome.is_err() {
        // Leave no transaction open on this connection; a no-op when the
        // cycle failed after its commit.
        let _ = queue.rollback();
    }
    outcome
}

async fn lease_cycle(
    registry: &TaskRegistry,
    queue: &Queue,
    now: DateTime<Utc>,
) -> Result<bool> {
    // The claim happens inside an explicit transaction. For atomic tasks the
    // same transaction stays open through body execution and bookkeeping and
    // commits once at the end; for everything else it commits right away.
    queue.begin()?;
    let task = match queue.lease_next(now) {
        Ok(Some(task)) => task,
        Ok(None) => {
            queue.commit()?;
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };

    info!(
        task_id = task.id,
        task_name = %task.name,
        task_arguments = ?task.arguments,
        "executing task"
    );

    let registered = match registry.resolve(&task.name) {
        Ok(registered) => registered.clone(),
        Err(e) => {
            // Version skew between enqueuer and worker. Keep the row
            // retryable so a worker that knows the task can pick it up.
            warn!(task_id = task.id, task_name = %task.name, error = %e, "cannot resolve task");
            queue.mark_failed(task.id)?;
            queue.commit()?;
            return Ok(true);
        }
    };

    if registered.atomic() {
        execute_atomic(queue, &registered, &task, now).await?;
    } else {
        // Release the lease lock before the body runs: external I/O must
        // never hold a database transaction open.
        queue.commit()?;
        execute_plain(queue, &registered, &task, now).await?;
    }
    Ok(true)
}

/// Atomic dispatch: the body runs inside the still-open lease transaction,
/// nested under a savepoint so its own failure rolls back without discarding
/// the bookkeeping already written.
async fn execute_atomic(
    queue: &Queue,
    task: &RegisteredTask,
    row: &QueuedTask,
    now: DateTime<Utc>,
) -> Result<()> {
    queue.savepoint(BODY_SAVEPOINT)?;
    match run_body(queue, task, row).await {
        Ok(()) => {
            queue.release_savepoint(BODY_SAVEPOINT)?;
            record_success(queue, task, row, now)?;
        }
        Err(e) => {
            log_failure(&e, row);
            queue.rollback_savepoint(BODY_SAVEPOINT)?;
            queue.mark_failed(row.id)?;
        }
    }
    queue.commit()?;
    Ok(())
}

/// Non-atomic dispatch: the lease is already committed; the body runs with no
/// enclosing transaction, and only the outcome bookkeeping touches the store.
async fn execute_plain(
    queue: &Queue,
    task: &RegisteredTask,
    row: &QueuedTask,
    now: DateTime<Utc>,
) -> Result<()> {
    match run_body(queue, task, row).await {
        Ok(()) => record_success(queue, task, row, now)?,
        Err(e) => {
            log_failure(&e, row);
            queue.mark_failed(row.id)?;
        }
    }
    Ok(())
}

/// Run the body under its registered timeout. A timeout is indistinguishable
/// from any other body failure further up.
///
/// The body gets this worker's own queue handle: for an atomic task its
/// statements join the transaction opened for the lease.
async fn run_body(queue: &Queue, task: &RegisteredTask, row: &QueuedTask) -> Result<()> {
    let ctx = TaskContext {
        arguments: row.arguments.clone(),
        queue: queue.clone(),
    };
    match tokio::time::timeout(task.timeout(), task.execute(ctx)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ExecutorError::Body(e)),
        Err(_) => Err(ExecutorError::Timeout {
            name: task.name().to_string(),
            secs: task.timeout().as_secs(),
        }),
    }
}

fn record_success(
    queue: &Queue,
    task: &RegisteredTask,
    row: &QueuedTask,
    now: DateTime<Utc>,
) -> Result<()> {
    queue.mark_finished(row.id)?;
    info!(task_id = row.id, task_name = %row.name, "task finished");

    if let Some(schedule_id) = row.from_schedule_id {
        // allow_skip collapses missed intervals into one occurrence from now;
        // otherwise missed intervals are caught up one-by-one from the
        // occurrence that just completed.
        let reference = if task.allow_skip() { now } else { row.run_at };
        queue.advance_schedule(schedule_id, reference)?;
    }
    Ok(())
}

fn log_failure(error: &ExecutorError, row: &QueuedTask) {
    error!(
        task_id = row.id,
        task_name = %row.name,
        task_arguments = ?row.arguments,
        error = %error,
        "task failed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use norn_core::types::object_arguments;
    use norn_core::Arguments;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 7, h, m, s).unwrap()
    }

    fn executor_with(registry: TaskRegistry) -> Executor {
        Executor::new(Arc::new(registry), Queue::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn successful_task_reaches_terminal_state() {
        let mut registry = TaskRegistry::new();
        registry
            .task("ok")
            .register(|_: TaskContext| async { Ok(()) })
            .unwrap();
        let executor = executor_with(registry);

        let id = executor
            .queue
            .enqueue("ok", &Arguments::new(), Some(t(9, 0, 0)))
            .unwrap();

        assert!(executor.run_once(t(9, 0, 0)).await.unwrap());
        let row = executor.queue.get(id).unwrap().unwrap();
        assert!(row.finished_at.is_some());

        // Terminal: nothing further is due.
        assert!(!executor.run_once(t(23, 0, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn failing_body_is_rescheduled_with_backoff() {
        let mut registry = TaskRegistry::new();
        registry
            .task("always-fails")
            .register(|_: TaskContext| async { anyhow::bail!("boom") })
            .unwrap();
        let executor = executor_with(registry);

        let run_at = t(9, 0, 0);
        let id = executor
            .queue
            .enqueue("always-fails", &Arguments::new(), Some(run_at))
            .unwrap();

        // The failure is recorded, not propagated.
        assert!(executor.run_once(run_at).await.unwrap());

        let row = executor.queue.get(id).unwrap().unwrap();
        assert!(row.started_at.is_none());
        assert!(row.finished_at.is_none());
        assert_eq!(row.run_at, run_at + ChronoDuration::seconds(30));

        // Leasable again once the backoff has elapsed.
        assert!(!executor.run_once(run_at).await.unwrap());
        assert!(executor.run_once(row.run_at).await.unwrap());
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let mut registry = TaskRegistry::new();
        registry
            .task("sleepy")
            .timeout(Duration::from_millis(20))
            .register(|_: TaskContext| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .unwrap();
        let executor = executor_with(registry);

        let run_at = t(9, 0, 0);
        let id = executor
            .queue
            .enqueue("sleepy", &Arguments::new(), Some(run_at))
            .unwrap();

        assert!(executor.run_once(run_at).await.unwrap());
        let row = executor.queue.get(id).unwrap().unwrap();
        assert!(row.started_at.is_none());
        assert_eq!(row.run_at, run_at + ChronoDuration::seconds(30));
    }

    #[tokio::test]
    async fn unknown_task_is_retried_not_fatal() {
        let executor = executor_with(TaskRegistry::new());
        let run_at = t(9, 0, 0);
        let id = executor
            .queue
            .enqueue("from-a-newer-deploy", &Arguments::new(), Some(run_at))
            .unwrap();

        // The loop survives and the row stays retryable.
        assert!(executor.run_once(run_at).await.unwrap());
        let row = executor.queue.get(id).unwrap().unwrap();
        assert!(row.started_at.is_none());
        assert_eq!(row.run_at, run_at + ChronoDuration::seconds(30));
    }

    #[tokio::test]
    async fn non_atomic_task_executes_outside_any_transaction() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_by_body = Arc::clone(&calls);

        let mut registry = TaskRegistry::new();
        registry
            .task("external-poll")
            .atomic(false)
            .register(move |_: TaskContext| {
                let calls = Arc::clone(&calls_by_body);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        let executor = executor_with(registry);

        let id = executor
            .queue
            .enqueue("external-poll", &Arguments::new(), Some(t(9, 0, 0)))
            .unwrap();

        assert!(executor.run_once(t(9, 0, 0)).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(executor.queue.get(id).unwrap().unwrap().finished_at.is_some());
    }

    #[tokio::test]
    async fn body_receives_its_arguments() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_by_body = Arc::clone(&seen);

        let mut registry = TaskRegistry::new();
        registry
            .task("with-args")
            .register(move |ctx: TaskContext| {
                let seen = Arc::clone(&seen_by_body);
                async move {
                    seen.store(
                        ctx.arguments["user_id"].as_u64().unwrap() as usize,
                        Ordering::SeqCst,
                    );
                    Ok(())
                }
            })
            .unwrap();
        let executor = executor_with(registry);

        executor
            .queue
            .enqueue(
                "with-args",
                &object_arguments(serde_json::json!({"user_id": 7})),
                Some(t(9, 0, 0)),
            )
            .unwrap();

        executor.run_once(t(9, 0, 0)).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn idle_iteration_reports_nothing_due() {
        let executor = executor_with(TaskRegistry::new());
        assert!(!executor.run_once(t(9, 0, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn atomic_body_writes_commit_with_the_bookkeeping() {
        let mut registry = TaskRegistry::new();
        registry
            .task("chain")
            .register(|ctx: TaskContext| async move {
                // Writes issued through the worker's handle join its open
                // transaction.
                ctx.queue.enqueue("follow-up", &Arguments::new(), None)?;
                Ok(())
            })
            .unwrap();
        let executor = executor_with(registry);

        executor
            .queue
            .enqueue("chain", &Arguments::new(), Some(t(9, 0, 0)))
            .unwrap();
        assert!(executor.run_once(t(9, 0, 0)).await.unwrap());

        let names: Vec<String> = executor
            .queue
            .list(true)
            .unwrap()
            .into_iter()
            .map(|task| task.name)
            .collect();
        assert!(names.contains(&"follow-up".to_string()));
    }

    #[tokio::test]
    async fn atomic_body_failure_rolls_back_its_writes_but_not_the_lease() {
        let mut registry = TaskRegistry::new();
        registry
            .task("half-done")
            .register(|ctx: TaskContext| async move {
                ctx.queue.enqueue("orphan", &Arguments::new(), None)?;
                anyhow::bail!("failed after writing")
            })
            .unwrap();
        let executor = executor_with(registry);

        let run_at = t(9, 0, 0);
        let id = executor
            .queue
            .enqueue("half-done", &Arguments::new(), Some(run_at))
            .unwrap();
        assert!(executor.run_once(run_at).await.unwrap());

        // The body's write vanished with the savepoint…
        let names: Vec<String> = executor
            .queue
            .list(true)
            .unwrap()
            .into_iter()
            .map(|task| task.name)
            .collect();
        assert!(!names.contains(&"orphan".to_string()));

        // …while the failure bookkeeping survived the rollback.
        let row = executor.queue.get(id).unwrap().unwrap();
        assert!(row.started_at.is_none());
        assert_eq!(row.run_at, run_at + ChronoDuration::seconds(30));
    }
}
