use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Idle poll cadence of a worker with nothing due, in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;
/// Fixed amount a failed task's `run_at` is pushed forward, in seconds.
pub const DEFAULT_FAILURE_BACKOFF_SECS: i64 = 30;
/// Per-task execution deadline when a registration does not override it.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 10;

/// Top-level config (norn.toml + NORN_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NornConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Default for NornConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Worker-loop tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent worker loops the `worker` command runs.
    #[serde(default = "default_worker_count")]
    pub count: usize,
    /// Idle sleep between lease attempts when nothing is due.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// How far `run_at` is pushed on failure. Fixed, not exponential.
    #[serde(default = "default_failure_backoff")]
    pub failure_backoff_secs: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            poll_interval_secs: default_poll_interval(),
            failure_backoff_secs: default_failure_backoff(),
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.norn/norn.db")
}

fn default_worker_count() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_failure_backoff() -> i64 {
    DEFAULT_FAILURE_BACKOFF_SECS
}

impl NornConfig {
    /// Load config from a TOML file with NORN_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.norn/norn.toml
    ///
    /// A missing file is not an error; all fields have defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: NornConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("NORN_").split("_"))
            .extract()
            .map_err(|e| crate::error::ConfigError::Invalid(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.norn/norn.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = NornConfig::default();
        assert_eq!(config.worker.count, 1);
        assert_eq!(config.worker.poll_interval_secs, 1);
        assert_eq!(config.worker.failure_backoff_secs, 30);
        assert!(config.database.path.ends_with("norn.db"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = NornConfig::load(Some("/nonexistent/norn.toml")).unwrap();
        assert_eq!(config.worker.poll_interval_secs, 1);
    }
}
