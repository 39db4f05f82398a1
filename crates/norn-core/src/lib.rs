//! `norn-core` — shared types and configuration for the norn scheduler.
//!
//! Everything the other crates agree on lives here: the [`Arguments`] payload
//! type every task carries, and the [`config::NornConfig`] loaded from
//! `norn.toml` with `NORN_*` environment overrides.

pub mod config;
pub mod error;
pub mod types;

pub use config::NornConfig;
pub use error::{ConfigError, Result};
pub use types::Arguments;
