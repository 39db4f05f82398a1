//! `norn-queue` — the durable task queue behind the norn scheduler.
//!
//! # Overview
//!
//! Two SQLite tables hold all shared mutable state: `task` (one-off rows and
//! schedule occurrences) and `scheduled_task` (cron recurrences). The
//! [`Queue`] handle exposes the narrow store contract the executor relies on:
//! enqueue, lease, success/failure bookkeeping, and schedule chaining, each
//! operation transactional on its own.
//!
//! # Leasing
//!
//! A lease is an exclusive claim on one due row. SQLite has no
//! `SELECT … FOR UPDATE SKIP LOCKED`; the claim is instead a single atomic
//! `UPDATE … RETURNING` statement that picks the oldest due row and stamps
//! `started_at` in one step. Writers are serialised by the engine, so two
//! claimers can never obtain the same row, and a claimed row is excluded from
//! later claims because `started_at` is no longer NULL.

pub mod db;
pub mod error;
pub mod queue;
pub mod schedule;
pub mod types;

pub use schedule::CronSpec;
pub use error::{QueueError, Result};
pub use queue::Queue;
pub use types::{QueuedTask, RecurringSchedule};
