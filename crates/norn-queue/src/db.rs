use rusqlite::Connection;

use crate::error::Result;

/// Initialise the queue schema in `conn`.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout. The
/// partial index keeps the lease query fast even when the table accumulates
/// finished rows (the scheduler never deletes them itself; see
/// `Queue::delete_old`).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS task (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            name             TEXT    NOT NULL,
            arguments        TEXT    NOT NULL DEFAULT '{}',  -- JSON object
            run_at           TEXT    NOT NULL,               -- RFC3339 UTC
            started_at       TEXT,
            finished_at      TEXT,
            from_schedule_id INTEGER REFERENCES scheduled_task(id)
        );

        -- Lease query: WHERE run_at <= ? AND started_at IS NULL ORDER BY run_at
        CREATE INDEX IF NOT EXISTS idx_task_due
            ON task (run_at) WHERE started_at IS NULL;

        CREATE TABLE IF NOT EXISTS scheduled_task (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            name            TEXT    NOT NULL,
            arguments       TEXT    NOT NULL DEFAULT '{}',
            cron_expression TEXT    NOT NULL,
            is_enabled      INTEGER NOT NULL DEFAULT 0,
            next_task_id    INTEGER REFERENCES task(id)
        );
        ",
    )?;
    Ok(())
}
