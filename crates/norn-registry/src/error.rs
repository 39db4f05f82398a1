use thiserror::Error;

/// Errors from task registration and lookup.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A task name was registered twice: a programming mistake, not a
    /// runtime condition. Callers should abort startup.
    #[error("task already registered: {name}")]
    DuplicateTask { name: String },

    /// No task with this name exists in the registry. During execution this
    /// usually means deployment/version skew between enqueuer and worker.
    #[error("unknown task: {name}")]
    UnknownTask { name: String },
}

pub type Result<T> = std::result::Result<T, RegistryError>;
