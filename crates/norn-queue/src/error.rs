use thiserror::Error;

/// Errors that can occur within the queue store.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Underlying SQLite / rusqlite error. Indicates store trouble, never a
    /// statement about the task itself.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The cron expression could not be parsed or yields no future occurrence.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// No schedule row with the given ID exists.
    #[error("no such schedule: {id}")]
    ScheduleNotFound { id: i64 },

    /// Task arguments failed JSON (de)serialisation.
    #[error("bad task arguments: {0}")]
    BadArguments(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
