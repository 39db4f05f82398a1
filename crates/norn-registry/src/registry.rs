use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use norn_core::config::DEFAULT_TASK_TIMEOUT_SECS;
use norn_core::Arguments;
use norn_queue::Queue;

use crate::error::{RegistryError, Result};
use crate::invocation::Invocation;

/// Everything a task body gets to work with.
///
/// `queue` is the handle of the worker executing the body, the same
/// connection that holds the lease. For an atomic task, statements issued
/// through it join the worker's open transaction, so the body's own writes
/// commit or roll back together with the scheduler's bookkeeping. For a
/// non-atomic task no transaction is open and every statement stands alone.
pub struct TaskContext {
    pub arguments: Arguments,
    pub queue: Queue,
}

/// The executable body of a task: an opaque async function over its context.
/// The scheduler treats bodies as black boxes and expects them to be
/// idempotent: at-least-once delivery means a body can run more than once
/// for the same logical occurrence.
pub type TaskBody =
    Arc<dyn Fn(TaskContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A task body bound to its name and execution metadata.
///
/// Immutable once registered. Calling [`RegisteredTask::call`] binds
/// arguments and hands back an [`Invocation`] without executing anything.
#[derive(Clone)]
pub struct RegisteredTask {
    name: String,
    body: TaskBody,
    allow_skip: bool,
    atomic: bool,
    timeout: Duration,
}

impl RegisteredTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether missed cron occurrences may be collapsed into a single next
    /// occurrence from "now" instead of being caught up one-by-one.
    pub fn allow_skip(&self) -> bool {
        self.allow_skip
    }

    /// Whether the body executes inside the same transaction as its lease
    /// bookkeeping.
    pub fn atomic(&self) -> bool {
        self.atomic
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Bind arguments, producing a single-use invocation handle.
    pub fn call(&self, arguments: Arguments) -> Invocation {
        Invocation::new(self.name.clone(), arguments, Arc::clone(&self.body))
    }

    /// Start the body running. Used by the executor; timeout enforcement is
    /// the executor's job, not the body's.
    pub fn execute(&self, ctx: TaskContext) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.body)(ctx)
    }
}

impl std::fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("name", &self.name)
            .field("allow_skip", &self.allow_skip)
            .field("atomic", &self.atomic)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Process-wide mapping of task names to registered tasks.
///
/// Built once at startup, then shared as `Arc<TaskRegistry>` with the
/// executor and with invocation call sites, an explicit object rather than
/// hidden module-level state.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin declaring a task. Finish with [`TaskBuilder::register`].
    ///
    /// Defaults: `allow_skip = false`, `atomic = true`, `timeout = 10s`.
    pub fn task(&mut self, name: impl Into<String>) -> TaskBuilder<'_> {
        TaskBuilder {
            registry: self,
            name: name.into(),
            allow_skip: false,
            atomic: true,
            timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
        }
    }

    /// Look a task up by name.
    pub fn resolve(&self, name: &str) -> Result<&RegisteredTask> {
        self.tasks.get(name).ok_or_else(|| RegistryError::UnknownTask {
            name: name.to_string(),
        })
    }

    /// Bind arguments to a named task, producing an invocation handle.
    ///
    /// The entry point for enqueuing callers (CLI commands, other task
    /// bodies): `registry.invoke("send-digest", args)?.defer(&queue, None)`.
    pub fn invoke(&self, name: &str, arguments: Arguments) -> Result<Invocation> {
        Ok(self.resolve(name)?.call(arguments))
    }

    /// Names of all registered tasks, for diagnostics.
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.keys().map(String::as_str).collect()
    }
}

/// Builder for one task registration.
pub struct TaskBuilder<'a> {
    registry: &'a mut TaskRegistry,
    name: String,
    allow_skip: bool,
    atomic: bool,
    timeout: Duration,
}

impl TaskBuilder<'_> {
    /// Allow missed schedule steps to be skipped.
    pub fn allow_skip(mut self, allow_skip: bool) -> Self {
        self.allow_skip = allow_skip;
        self
    }

    /// Run the task fully atomically in a transaction. Disable for bodies
    /// doing external I/O so no row lock is held for their duration.
    pub fn atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    /// Maximum time the body may execute for.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register the body under the builder's name.
    ///
    /// Errors with [`RegistryError::DuplicateTask`] if the name is taken;
    /// registration happens at startup, so callers propagate this with `?`
    /// and let the process die.
    pub fn register<F, Fut>(self, body: F) -> Result<()>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.registry.tasks.contains_key(&self.name) {
            return Err(RegistryError::DuplicateTask { name: self.name });
        }

        let body: TaskBody = Arc::new(move |ctx| Box::pin(body(ctx)));
        let task = RegisteredTask {
            name: self.name.clone(),
            body,
            allow_skip: self.allow_skip,
            atomic: self.atomic,
            timeout: self.timeout,
        };
        self.registry.tasks.insert(self.name, task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn noop(_: TaskContext) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn registration_defaults() {
        let mut registry = TaskRegistry::new();
        registry.task("plain").register(noop).unwrap();

        let task = registry.resolve("plain").unwrap();
        assert!(!task.allow_skip());
        assert!(task.atomic());
        assert_eq!(task.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn builder_overrides_stick() {
        let mut registry = TaskRegistry::new();
        registry
            .task("fetch-observations")
            .allow_skip(true)
            .atomic(false)
            .timeout(Duration::from_secs(60))
            .register(noop)
            .unwrap();

        let task = registry.resolve("fetch-observations").unwrap();
        assert!(task.allow_skip());
        assert!(!task.atomic());
        assert_eq!(task.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut registry = TaskRegistry::new();
        registry.task("twice").register(noop).unwrap();

        let err = registry.task("twice").register(noop).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTask { name } if name == "twice"));
    }

    #[test]
    fn unknown_name_is_a_typed_error() {
        let registry = TaskRegistry::new();
        assert!(matches!(
            registry.resolve("missing"),
            Err(RegistryError::UnknownTask { .. })
        ));
    }

    #[tokio::test]
    async fn execute_runs_the_body_with_its_arguments() {
        use std::sync::atomic::{AtomicI64, Ordering};

        let seen = Arc::new(AtomicI64::new(0));
        let seen_by_body = Arc::clone(&seen);

        let mut registry = TaskRegistry::new();
        registry
            .task("record")
            .register(move |ctx: TaskContext| {
                let seen = Arc::clone(&seen_by_body);
                async move {
                    seen.store(ctx.arguments["value"].as_i64().unwrap(), Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        let ctx = TaskContext {
            arguments: norn_core::types::object_arguments(serde_json::json!({"value": 41})),
            queue: Queue::open_in_memory().unwrap(),
        };
        registry.resolve("record").unwrap().execute(ctx).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 41);
    }
}
