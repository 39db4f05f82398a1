use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use norn_core::{Arguments, NornConfig};
use norn_executor::Executor;
use norn_queue::Queue;
use norn_registry::TaskRegistry;
use tokio::sync::watch;
use tracing::{info, warn};

mod builtin;

/// Persistent background task scheduler.
#[derive(Parser)]
#[command(name = "norn", version, about)]
struct Cli {
    /// Path to norn.toml (default: NORN_CONFIG env, then ~/.norn/norn.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run worker loops that execute queued tasks
    Worker {
        /// Number of worker loops to run (default: worker.count from config)
        #[arg(long)]
        num_workers: Option<usize>,
    },
    /// Inspect and manage the task queue
    #[command(subcommand)]
    Tasks(TasksCommand),
}

#[derive(Subcommand)]
enum TasksCommand {
    /// List queued tasks, pending by default
    List {
        /// Include leased and finished rows
        #[arg(long)]
        all: bool,
    },
    /// Queue a one-off execution of a task known to the workers
    Enqueue {
        name: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        arguments: String,
        /// RFC3339 timestamp; defaults to now
        #[arg(long)]
        run_at: Option<String>,
    },
    /// Create a cron recurrence for a task known to the workers
    Schedule {
        name: String,
        /// Standard 5-field cron expression, e.g. "0 9 * * *"
        cron_expression: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        arguments: String,
    },
    /// Reset leases abandoned by crashed workers back to retryable
    Reclaim {
        /// Only leases older than this many seconds are reset
        #[arg(long, default_value_t = 3600)]
        older_than_secs: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: explicit path > NORN_CONFIG env > ~/.norn/norn.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("NORN_CONFIG").ok());
    let config = NornConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        NornConfig::default()
    });

    ensure_parent_dir(&config.database.path);

    match cli.command {
        Command::Worker { num_workers } => {
            let count = num_workers.unwrap_or(config.worker.count).max(1);
            run_workers(&config, count).await
        }
        Command::Tasks(command) => run_tasks_command(&config, command),
    }
}

/// Spawn `count` worker loops and block until ctrl-c.
///
/// Every worker gets its own database connection; shutdown is broadcast over
/// a watch channel and each loop finishes its in-flight task before exiting.
async fn run_workers(config: &NornConfig, count: usize) -> anyhow::Result<()> {
    let mut registry = TaskRegistry::new();
    builtin::register_builtin_tasks(&mut registry)?;
    let registry = Arc::new(registry);

    info!(path = %config.database.path, "opening task queue");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::with_capacity(count);
    for _ in 0..count {
        let queue = Queue::open(&config.database.path)?
            .with_failure_backoff(config.worker.failure_backoff_secs);
        let executor = Executor::new(Arc::clone(&registry), queue)
            .with_poll_interval(Duration::from_secs(config.worker.poll_interval_secs));
        workers.push(tokio::spawn(executor.run(shutdown_rx.clone())));
    }
    info!(count, "workers started");

    tokio::signal::ctrl_c().await?;
    info!("shutting down, letting in-flight tasks finish");
    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

fn run_tasks_command(config: &NornConfig, command: TasksCommand) -> anyhow::Result<()> {
    let queue = Queue::open(&config.database.path)?;

    match command {
        TasksCommand::List { all } => {
            let tasks = queue.list(all)?;
            if tasks.is_empty() {
                println!("no queued tasks");
                return Ok(());
            }
            for task in tasks {
                let state = if task.finished_at.is_some() {
                    "finished"
                } else if task.started_at.is_some() {
                    "running"
                } else {
                    "pending"
                };
                let origin = task
                    .from_schedule_id
                    .map(|id| format!("  schedule={id}"))
                    .unwrap_or_default();
                println!(
                    "{:>6}  {:<9} {:<24} run_at={}{}  arguments={}",
                    task.id,
                    state,
                    task.name,
                    task.run_at.to_rfc3339(),
                    origin,
                    serde_json::Value::Object(task.arguments),
                );
            }
        }
        TasksCommand::Enqueue {
            name,
            arguments,
            run_at,
        } => {
            let arguments = parse_arguments(&arguments)?;
            let run_at = run_at.map(|s| parse_run_at(&s)).transpose()?;
            let id = queue.enqueue(&name, &arguments, run_at)?;
            println!("queued task {id}");
        }
        TasksCommand::Schedule {
            name,
            cron_expression,
            arguments,
        } => {
            let arguments = parse_arguments(&arguments)?;
            let id = queue.create_schedule(&name, &arguments, &cron_expression, Utc::now())?;
            println!("created schedule {id}");
        }
        TasksCommand::Reclaim { older_than_secs } => {
            let reclaimed = queue.reclaim_stale(
                chrono::Duration::seconds(older_than_secs),
                Utc::now(),
            )?;
            println!("reclaimed {reclaimed} stale lease(s)");
        }
    }
    Ok(())
}

fn parse_arguments(raw: &str) -> anyhow::Result<Arguments> {
    serde_json::from_str(raw).context("arguments must be a JSON object")
}

fn parse_run_at(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .context("run-at must be an RFC3339 timestamp")
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
}
