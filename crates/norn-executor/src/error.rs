use thiserror::Error;

/// Errors raised while executing queued tasks.
///
/// Only store-level trouble ([`ExecutorError::Queue`]) ever escapes a worker
/// iteration; body failures and timeouts are recorded against the task row
/// and swallowed by the loop.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The store misbehaved (connection trouble, transaction abort). Says
    /// nothing about the task itself.
    #[error("queue error: {0}")]
    Queue(#[from] norn_queue::QueueError),

    /// The body exceeded its registered timeout.
    #[error("task '{name}' timed out after {secs}s")]
    Timeout { name: String, secs: u64 },

    /// The body itself returned an error.
    #[error("task body error: {0}")]
    Body(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
