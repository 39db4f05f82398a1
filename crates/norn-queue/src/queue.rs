use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use norn_core::Arguments;
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use tracing::{info, instrument, warn};

use crate::db::init_db;
use crate::error::{QueueError, Result};
use crate::schedule::CronSpec;
use crate::types::{fmt_ts, parse_ts, QueuedTask, RecurringSchedule};

/// Default seconds a failed task's `run_at` is pushed forward.
pub const DEFAULT_FAILURE_BACKOFF_SECS: i64 = 30;

/// Handle to the persistent queue store.
///
/// Wraps a single SQLite connection in a `Mutex`, one statement at a time.
/// Transactions are connection-scoped, so each worker gets its own `Queue`
/// (own connection) and an open atomic-task transaction can never interleave
/// with another worker's statements. Clones share the connection; they exist
/// so a worker can move its handle into a detached execution task.
#[derive(Clone)]
pub struct Queue {
    db: Arc<Mutex<Connection>>,
    failure_backoff_secs: i64,
}

impl Queue {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
            failure_backoff_secs: DEFAULT_FAILURE_BACKOFF_SECS,
        }
    }

    /// Open (or create) the queue database at `path`.
    ///
    /// Applies the WAL/foreign-key/busy-timeout pragmas and runs the schema
    /// migration. Each worker should call this for a connection of its own.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )?;
        init_db(&conn)?;
        Ok(Self::new(conn))
    }

    /// Private in-memory queue, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_db(&conn)?;
        Ok(Self::new(conn))
    }

    /// Override the fixed failure backoff (seconds).
    pub fn with_failure_backoff(mut self, secs: i64) -> Self {
        self.failure_backoff_secs = secs;
        self
    }

    // --- transaction scopes for the executor --------------------------------

    /// Open the outer transaction an atomic task executes under.
    ///
    /// IMMEDIATE so the write lock is taken up front; the matching
    /// [`Queue::commit`]/[`Queue::rollback`] must run on this same handle.
    pub fn begin(&self) -> Result<()> {
        self.db.lock().unwrap().execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.db.lock().unwrap().execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.db.lock().unwrap().execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Open a named nested scope that can roll back independently of the
    /// enclosing transaction (the sub-transaction boundary an atomic task
    /// body runs inside).
    pub fn savepoint(&self, name: &str) -> Result<()> {
        self.db
            .lock()
            .unwrap()
            .execute_batch(&format!("SAVEPOINT {name}"))?;
        Ok(())
    }

    pub fn release_savepoint(&self, name: &str) -> Result<()> {
        self.db
            .lock()
            .unwrap()
            .execute_batch(&format!("RELEASE {name}"))?;
        Ok(())
    }

    /// Rewind the savepoint and pop it from the stack.
    pub fn rollback_savepoint(&self, name: &str) -> Result<()> {
        self.db
            .lock()
            .unwrap()
            .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))?;
        Ok(())
    }

    // --- one-off tasks -------------------------------------------------------

    /// Queue a task to run at the given time (defaults to now).
    #[instrument(skip(self, arguments))]
    pub fn enqueue(
        &self,
        name: &str,
        arguments: &Arguments,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let run_at = run_at.unwrap_or_else(Utc::now);
        let args_json = serde_json::to_string(arguments)?;

        let db = self.db.lock().unwrap();
        let id: i64 = db.query_row(
            "INSERT INTO task (name, arguments, run_at)
             VALUES (?1, ?2, ?3)
             RETURNING id",
            params![name, args_json, fmt_ts(run_at)],
            |row| row.get(0),
        )?;
        info!(task_id = id, task_name = %name, run_at = %run_at, "task queued");
        Ok(id)
    }

    /// Claim the next due task, stamping `started_at` in the same statement.
    ///
    /// This is the single-statement equivalent of `SELECT … FOR UPDATE SKIP
    /// LOCKED LIMIT 1` followed by a started-at update: the oldest row with
    /// `run_at <= now` and no `started_at` is claimed atomically, so
    /// concurrent claimers can never obtain the same row, and a claimed row
    /// is excluded from later claims because `started_at` is set.
    #[instrument(skip(self))]
    pub fn lease_next(&self, now: DateTime<Utc>) -> Result<Option<QueuedTask>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "UPDATE task SET started_at = ?1
             WHERE id = (SELECT id FROM task
                          WHERE run_at <= ?1 AND started_at IS NULL
                          ORDER BY run_at
                          LIMIT 1)
             RETURNING id, name, arguments, run_at, started_at, finished_at,
                       from_schedule_id",
            params![fmt_ts(now)],
            row_to_task,
        ) {
            Ok(task) => Ok(Some(task)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(QueueError::Database(e)),
        }
    }

    /// Record a successful execution. Terminal: the row is never leased again.
    #[instrument(skip(self))]
    pub fn mark_finished(&self, id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE task SET finished_at = ?1 WHERE id = ?2",
            params![fmt_ts(Utc::now()), id],
        )?;
        Ok(())
    }

    /// Reset a failed task for retry.
    ///
    /// `started_at` goes back to NULL and `run_at` is pushed forward by the
    /// fixed failure backoff. Deliberately a constant rather than exponential:
    /// a persistently failing task surfaces in logs once per interval and the
    /// retry cadence stays predictable.
    #[instrument(skip(self))]
    pub fn mark_failed(&self, id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let run_at: DateTime<Utc> = db.query_row(
            "SELECT run_at FROM task WHERE id = ?1",
            params![id],
            |row| ts_col(row, 0),
        )?;
        let retry_at = run_at + Duration::seconds(self.failure_backoff_secs);
        db.execute(
            "UPDATE task SET started_at = NULL, run_at = ?1 WHERE id = ?2",
            params![fmt_ts(retry_at), id],
        )?;
        Ok(())
    }

    /// Fetch one task row by id.
    pub fn get(&self, id: i64) -> Result<Option<QueuedTask>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, name, arguments, run_at, started_at, finished_at,
                    from_schedule_id
             FROM task WHERE id = ?1",
            params![id],
            row_to_task,
        ) {
            Ok(task) => Ok(Some(task)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(QueueError::Database(e)),
        }
    }

    /// List queued tasks ordered by `run_at`: pending only, or everything.
    ///
    /// Read-only operational visibility; not part of the scheduling contract.
    pub fn list(&self, show_all: bool) -> Result<Vec<QueuedTask>> {
        let db = self.db.lock().unwrap();
        let sql = if show_all {
            "SELECT id, name, arguments, run_at, started_at, finished_at,
                    from_schedule_id
             FROM task ORDER BY run_at"
        } else {
            "SELECT id, name, arguments, run_at, started_at, finished_at,
                    from_schedule_id
             FROM task WHERE started_at IS NULL ORDER BY run_at"
        };
        let mut stmt = db.prepare(sql)?;
        let rows = stmt.query_map([], row_to_task)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(QueueError::Database)
    }

    // --- recurring schedules -------------------------------------------------

    /// Create a recurring schedule and queue its first occurrence.
    ///
    /// Two-step creation inside one atomic unit: the schedule is inserted
    /// disabled, its first occurrence (next cron boundary strictly after
    /// `now`) is inserted and linked, and only then is the schedule enabled.
    /// There is never a window where an enabled schedule has no live
    /// occurrence.
    #[instrument(skip(self, arguments))]
    pub fn create_schedule(
        &self,
        name: &str,
        arguments: &Arguments,
        cron_expression: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let spec = CronSpec::parse(cron_expression)?;
        let first_run = spec.next_after(now)?;
        let args_json = serde_json::to_string(arguments)?;

        let db = self.db.lock().unwrap();
        with_savepoint(&db, "create_schedule", || {
            let schedule_id: i64 = db.query_row(
                "INSERT INTO scheduled_task (name, arguments, cron_expression, is_enabled)
                 VALUES (?1, ?2, ?3, 0)
                 RETURNING id",
                params![name, args_json, cron_expression],
                |row| row.get(0),
            )?;
            let task_id: i64 = db.query_row(
                "INSERT INTO task (name, arguments, run_at, from_schedule_id)
                 VALUES (?1, ?2, ?3, ?4)
                 RETURNING id",
                params![name, args_json, fmt_ts(first_run), schedule_id],
                |row| row.get(0),
            )?;
            db.execute(
                "UPDATE scheduled_task SET next_task_id = ?1, is_enabled = 1
                 WHERE id = ?2",
                params![task_id, schedule_id],
            )?;
            info!(
                schedule_id,
                task_id,
                task_name = %name,
                first_run = %first_run,
                "schedule created"
            );
            Ok(schedule_id)
        })
    }

    /// Queue the next occurrence of a schedule after a successful run.
    ///
    /// `previous` is the reference instant: the completed occurrence's
    /// original `run_at` for catch-up-one-by-one schedules, or "now" for
    /// tasks that may skip missed intervals. Insert and link happen as one
    /// atomic unit so `next_task_id` always points at the live successor.
    #[instrument(skip(self))]
    pub fn advance_schedule(&self, schedule_id: i64, previous: DateTime<Utc>) -> Result<i64> {
        let db = self.db.lock().unwrap();
        with_savepoint(&db, "advance_schedule", || {
            let (name, args_json, cron_expression) = match db.query_row(
                "SELECT name, arguments, cron_expression
                 FROM scheduled_task WHERE id = ?1",
                params![schedule_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            ) {
                Ok(row) => row,
                Err(rusqlite::Error::QueryReturnedNoRows) => {
                    return Err(QueueError::ScheduleNotFound { id: schedule_id })
                }
                Err(e) => return Err(QueueError::Database(e)),
            };

            let run_at = CronSpec::parse(&cron_expression)?.next_after(previous)?;
            let task_id: i64 = db.query_row(
                "INSERT INTO task (name, arguments, run_at, from_schedule_id)
                 VALUES (?1, ?2, ?3, ?4)
                 RETURNING id",
                params![name, args_json, fmt_ts(run_at), schedule_id],
                |row| row.get(0),
            )?;
            db.execute(
                "UPDATE scheduled_task SET next_task_id = ?1 WHERE id = ?2",
                params![task_id, schedule_id],
            )?;
            info!(schedule_id, task_id, run_at = %run_at, "schedule advanced");
            Ok(task_id)
        })
    }

    /// Fetch one schedule row by id.
    pub fn get_schedule(&self, id: i64) -> Result<RecurringSchedule> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, name, arguments, cron_expression, is_enabled, next_task_id
             FROM scheduled_task WHERE id = ?1",
            params![id],
            row_to_schedule,
        ) {
            Ok(schedule) => Ok(schedule),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(QueueError::ScheduleNotFound { id })
            }
            Err(e) => Err(QueueError::Database(e)),
        }
    }

    // --- housekeeping --------------------------------------------------------

    /// Make abandoned leases retryable again.
    ///
    /// A worker that died hard leaves `started_at` set with no outcome
    /// recorded. The worker loop never resets these itself; operators run
    /// this (`norn tasks reclaim`) with a threshold comfortably above the
    /// longest task timeout.
    #[instrument(skip(self))]
    pub fn reclaim_stale(&self, older_than: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = fmt_ts(now - older_than);
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE task SET started_at = NULL
             WHERE started_at IS NOT NULL
               AND finished_at IS NULL
               AND started_at <= ?1",
            params![cutoff],
        )?;
        if n > 0 {
            warn!(count = n, "stale leases reclaimed");
        }
        Ok(n)
    }

    /// Delete finished rows whose `finished_at` is older than `older_than`.
    #[instrument(skip(self))]
    pub fn delete_old(&self, older_than: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = fmt_ts(now - older_than);
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM task
             WHERE finished_at IS NOT NULL AND finished_at <= ?1",
            params![cutoff],
        )?;
        if n > 0 {
            info!(count = n, "old finished tasks deleted");
        }
        Ok(n)
    }
}

/// Run `f` inside a SQLite SAVEPOINT scope.
///
/// Savepoints nest: with no enclosing transaction this behaves like
/// BEGIN/COMMIT, while inside the executor's open atomic-task transaction it
/// becomes a nested scope committed or rolled back with its parent.
fn with_savepoint<T>(
    db: &Connection,
    name: &str,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    db.execute_batch(&format!("SAVEPOINT {name}"))?;
    match f() {
        Ok(value) => {
            db.execute_batch(&format!("RELEASE {name}"))?;
            Ok(value)
        }
        Err(e) => {
            let _ = db.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"));
            Err(e)
        }
    }
}

/// Map a SQLite row to a `QueuedTask`.
fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedTask> {
    let args_json: String = row.get(2)?;
    let arguments = serde_json::from_str(&args_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(QueuedTask {
        id: row.get(0)?,
        name: row.get(1)?,
        arguments,
        run_at: ts_col(row, 3)?,
        started_at: opt_ts_col(row, 4)?,
        finished_at: opt_ts_col(row, 5)?,
        from_schedule_id: row.get(6)?,
    })
}

/// Map a SQLite row to a `RecurringSchedule`.
fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecurringSchedule> {
    let args_json: String = row.get(2)?;
    let arguments = serde_json::from_str(&args_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(RecurringSchedule {
        id: row.get(0)?,
        name: row.get(1)?,
        arguments,
        cron_expression: row.get(3)?,
        is_enabled: row.get(4)?,
        next_task_id: row.get(5)?,
    })
}

fn ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(&s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| {
        parse_ts(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}
