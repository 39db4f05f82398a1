//! Full scheduling scenarios driven through worker iterations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use norn_core::types::object_arguments;
use norn_core::Arguments;
use norn_executor::Executor;
use norn_queue::{CronSpec, Queue};
use norn_registry::{TaskContext, TaskRegistry};
use tokio::sync::watch;

fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 7, h, m, s).unwrap()
}

#[tokio::test]
async fn daily_digest_schedule_chains_through_a_worker() {
    let mut registry = TaskRegistry::new();
    registry
        .task("send-digest")
        .timeout(Duration::from_secs(5))
        .register(|_: TaskContext| async { Ok(()) })
        .unwrap();

    let queue = Queue::open_in_memory().unwrap();

    // Enqueuer side: bind arguments, create the recurrence.
    let before = Utc::now();
    let schedule_id = registry
        .invoke("send-digest", object_arguments(serde_json::json!({"user_id": 7})))
        .unwrap()
        .schedule(&queue, "0 9 * * *")
        .unwrap();
    let after = Utc::now();

    let schedule = queue.get_schedule(schedule_id).unwrap();
    assert!(schedule.is_enabled);
    let first_id = schedule.next_task_id.expect("one live occurrence");
    let first = queue.get(first_id).unwrap().unwrap();

    // The first occurrence sits on the next 09:00 boundary after creation.
    let spec = CronSpec::parse("0 9 * * *").unwrap();
    assert!(
        first.run_at == spec.next_after(before).unwrap()
            || first.run_at == spec.next_after(after).unwrap()
    );
    assert_eq!(first.arguments["user_id"], 7);
    assert_eq!(first.from_schedule_id, Some(schedule_id));
    assert_eq!(queue.list(false).unwrap().len(), 1);

    // Worker side: one iteration at the boundary.
    let executor = Executor::new(Arc::new(registry), queue.clone());
    assert!(executor.run_once(first.run_at).await.unwrap());

    let done = queue.get(first_id).unwrap().unwrap();
    assert!(done.finished_at.is_some());

    // The chain advanced: a fresh occurrence exactly one day later.
    let advanced = queue.get_schedule(schedule_id).unwrap();
    let second_id = advanced.next_task_id.unwrap();
    assert_ne!(second_id, first_id);
    let second = queue.get(second_id).unwrap().unwrap();
    assert_eq!(second.run_at, first.run_at + ChronoDuration::days(1));
    assert_eq!(second.arguments["user_id"], 7);
}

#[tokio::test]
async fn missed_intervals_are_caught_up_one_by_one_by_default() {
    let mut registry = TaskRegistry::new();
    registry
        .task("ingest-interval")
        .register(|_: TaskContext| async { Ok(()) })
        .unwrap();

    let queue = Queue::open_in_memory().unwrap();
    let created_at = t(9, 0, 30);
    let schedule_id = queue
        .create_schedule("ingest-interval", &Arguments::new(), "* * * * *", created_at)
        .unwrap();

    let first_id = queue.get_schedule(schedule_id).unwrap().next_task_id.unwrap();
    let first = queue.get(first_id).unwrap().unwrap();
    assert_eq!(first.run_at, t(9, 1, 0));

    // The worker wakes up an hour late.
    let executor = Executor::new(Arc::new(registry), queue.clone());
    assert!(executor.run_once(t(10, 0, 30)).await.unwrap());

    // Successor chains from the occurrence that ran, not from "now": the
    // backlog is worked through one interval at a time.
    let second_id = queue.get_schedule(schedule_id).unwrap().next_task_id.unwrap();
    let second = queue.get(second_id).unwrap().unwrap();
    assert_eq!(second.run_at, t(9, 2, 0));
}

#[tokio::test]
async fn allow_skip_collapses_missed_intervals_into_one() {
    let mut registry = TaskRegistry::new();
    registry
        .task("daily-aggregate")
        .allow_skip(true)
        .register(|_: TaskContext| async { Ok(()) })
        .unwrap();

    let queue = Queue::open_in_memory().unwrap();
    let created_at = t(9, 0, 30);
    let schedule_id = queue
        .create_schedule("daily-aggregate", &Arguments::new(), "* * * * *", created_at)
        .unwrap();

    // Complete the 09:01 occurrence with "now" a full hour later.
    let executor = Executor::new(Arc::new(registry), queue.clone());
    assert!(executor.run_once(t(10, 0, 30)).await.unwrap());

    // One successor, computed from now, not sixty catch-up occurrences.
    let pending = queue.list(false).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].run_at, t(10, 1, 0));
}

#[tokio::test]
async fn worker_loop_drains_the_queue_and_honours_shutdown() {
    let executed = Arc::new(AtomicUsize::new(0));
    let executed_by_body = Arc::clone(&executed);

    let mut registry = TaskRegistry::new();
    registry
        .task("tick")
        .register(move |_: TaskContext| {
            let executed = Arc::clone(&executed_by_body);
            async move {
                executed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

    let queue = Queue::open_in_memory().unwrap();
    for _ in 0..3 {
        queue.enqueue("tick", &Arguments::new(), None).unwrap();
    }

    let executor = Executor::new(Arc::new(registry), queue.clone())
        .with_poll_interval(Duration::from_millis(10));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(executor.run(shutdown_rx));

    // Wait for the backlog to drain.
    for _ in 0..200 {
        if executed.load(Ordering::SeqCst) == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(executed.load(Ordering::SeqCst), 3);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), worker)
        .await
        .expect("worker loop stops on shutdown")
        .unwrap();

    assert!(queue
        .list(true)
        .unwrap()
        .iter()
        .all(|task| task.finished_at.is_some()));
}
