//! `norn-registry` — task declaration and the deferred invocation handle.
//!
//! A [`TaskRegistry`] is built once at process startup: each task name is
//! bound to an async body plus its execution metadata (atomicity, timeout,
//! recurrence skip policy). Registering a name twice is a typed error the
//! caller should treat as startup-fatal.
//!
//! Calling a registered task binds arguments without executing anything,
//! producing an [`Invocation`]: a single-use handle resolved exactly once by
//! running it in-process, deferring it into the queue, or turning it into a
//! recurring schedule. The consuming methods take the handle by value, so the
//! type system rules out double consumption; a handle that is dropped without
//! ever being consumed logs a warning, since that call site silently did
//! nothing.

pub mod error;
pub mod invocation;
pub mod registry;

pub use error::{RegistryError, Result};
pub use invocation::Invocation;
pub use registry::{RegisteredTask, TaskBody, TaskBuilder, TaskContext, TaskRegistry};
