//! Shared backend checks and multi-connection behavior on SQLite

use std::collections::HashSet;
use std::sync::Arc;

use backlog_persist::{SqliteConfig, SqliteQueue};
use backlog_queue::contract;
use backlog_queue::{
    ManualClock, MemoryEventSink, QueueBackend, Worker, WorkerOptions, WorkerState,
};

const RETRY_AFTER: u64 = 30;

async fn backend() -> anyhow::Result<(Arc<SqliteQueue>, Arc<ManualClock>)> {
    let clock = Arc::new(ManualClock::starting_now());
    let config = SqliteConfig {
        retry_after_secs: RETRY_AFTER,
        ..SqliteConfig::memory()
    };
    let queue = SqliteQueue::connect(config, contract::registry())
        .await?
        .with_clock(clock.clone());
    Ok((Arc::new(queue), clock))
}

fn file_config(path: &std::path::Path) -> SqliteConfig {
    SqliteConfig {
        url: format!("sqlite://{}", path.display()),
        max_connections: 4,
        ..SqliteConfig::default()
    }
}

#[tokio::test]
async fn push_then_pop() -> anyhow::Result<()> {
    let (queue, _clock) = backend().await?;
    contract::push_then_pop(queue.as_ref()).await?;
    Ok(())
}

#[tokio::test]
async fn delayed_job_waits() -> anyhow::Result<()> {
    let (queue, clock) = backend().await?;
    contract::delayed_job_waits(queue.as_ref(), &clock).await?;
    Ok(())
}

#[tokio::test]
async fn fifo_and_priority_order() -> anyhow::Result<()> {
    let (queue, _clock) = backend().await?;
    contract::fifo_order(queue.as_ref()).await?;
    contract::priority_order(queue.as_ref()).await?;
    Ok(())
}

#[tokio::test]
async fn reservations() -> anyhow::Result<()> {
    let (queue, clock) = backend().await?;
    contract::reserved_job_is_hidden(queue.as_ref()).await?;
    contract::reservation_expires(queue.as_ref(), &clock, RETRY_AFTER as i64).await?;
    contract::release_and_delete(queue.as_ref(), &clock).await?;
    Ok(())
}

#[tokio::test]
async fn size_clear_and_isolation() -> anyhow::Result<()> {
    let (queue, _clock) = backend().await?;
    contract::size_and_clear(queue.as_ref()).await?;
    contract::queues_are_isolated(queue.as_ref()).await?;
    contract::bulk_and_pop_batch(queue.as_ref()).await?;
    contract::stats_breakdown(queue.as_ref()).await?;
    Ok(())
}

#[tokio::test]
async fn failed_store() -> anyhow::Result<()> {
    let (queue, _clock) = backend().await?;
    contract::failed_store_lifecycle(queue.as_ref()).await?;
    contract::unknown_job_type_is_failed(queue.as_ref()).await?;
    Ok(())
}

#[tokio::test]
async fn round_trip() -> anyhow::Result<()> {
    let (queue, _clock) = backend().await?;
    contract::round_trip(queue.as_ref()).await?;
    Ok(())
}

#[tokio::test]
async fn retry_policy() -> anyhow::Result<()> {
    let (queue, clock) = backend().await?;
    let shared: Arc<dyn QueueBackend> = queue;
    contract::single_attempt_is_never_released(shared.clone()).await?;
    contract::retries_then_fails(shared, &clock).await?;
    Ok(())
}

#[tokio::test]
async fn far_future_delays() -> anyhow::Result<()> {
    let (queue, _clock) = backend().await?;
    contract::far_future_delays(queue).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers() -> anyhow::Result<()> {
    let (queue, _clock) = backend().await?;
    contract::concurrent_producers(queue).await?;
    Ok(())
}

#[tokio::test]
async fn jobs_survive_a_reconnect() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("jobs.db");

    let id = {
        let queue = SqliteQueue::connect(file_config(&path), contract::registry()).await?;
        queue.push(&contract::echo("durable"), "default", 0).await?
    };

    let queue = SqliteQueue::connect(file_config(&path), contract::registry()).await?;
    let job = queue.pop("default").await?.expect("job stored on disk");
    assert_eq!(job.id(), id);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_pools_never_reserve_the_same_job() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("shared.db");

    let first = Arc::new(SqliteQueue::connect(file_config(&path), contract::registry()).await?);
    let second = Arc::new(SqliteQueue::connect(file_config(&path), contract::registry()).await?);

    let mut pushed = HashSet::new();
    for n in 0..40 {
        pushed.insert(first.push(&contract::echo(&format!("job-{n}")), "shared", 0).await?);
    }

    let mut consumers = Vec::new();
    for queue in [first.clone(), second.clone(), first.clone(), second.clone()] {
        consumers.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some(job) = queue.pop("shared").await? {
                ids.push(job.id().to_string());
            }
            Ok::<_, backlog_queue::QueueError>(ids)
        }));
    }

    let mut popped = Vec::new();
    for consumer in consumers {
        popped.extend(consumer.await??);
    }

    let unique: HashSet<String> = popped.iter().cloned().collect();
    assert_eq!(popped.len(), 40, "every job handed out exactly once");
    assert_eq!(unique, pushed);
    assert_eq!(second.stats("shared").await?.reserved, 40);
    Ok(())
}

#[tokio::test]
async fn worker_drains_a_sqlite_queue() -> anyhow::Result<()> {
    let (queue, _clock) = backend().await?;
    for n in 0..5 {
        queue.push(&contract::echo(&format!("w{n}")), "default", 0).await?;
    }

    let events = Arc::new(MemoryEventSink::new());
    let options = WorkerOptions {
        sleep_secs: 0,
        memory_limit_mb: 0,
        stop_on_empty: true,
        ..WorkerOptions::default()
    };
    let mut worker = Worker::new(queue.clone(), events).with_options(options.clone());

    let status = worker.start("default", options).await;

    assert_eq!(status.state, WorkerState::Stopped);
    assert_eq!(status.processed, 5);
    assert_eq!(queue.stats("default").await?.pending, 0);
    assert_eq!(queue.stats("default").await?.reserved, 0);
    Ok(())
}
