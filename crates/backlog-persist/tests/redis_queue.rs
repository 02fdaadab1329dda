//! Shared backend checks against a live Redis.
//!
//! Runs only with the `redis` feature and `REDIS_URL` set, e.g.
//! `REDIS_URL=redis://127.0.0.1/ cargo test -p backlog-persist --features redis`.
//! Every test works under its own key prefix.
#![cfg(feature = "redis")]

use std::sync::Arc;
use std::time::Duration;

use backlog_persist::{RedisConfig, RedisQueue};
use backlog_queue::contract;
use backlog_queue::{ManualClock, QueueBackend};

const RETRY_AFTER: u64 = 30;

async fn backend() -> anyhow::Result<Option<(Arc<RedisQueue>, Arc<ManualClock>)>> {
    backend_with_retry_after(RETRY_AFTER).await
}

async fn backend_with_retry_after(
    retry_after_secs: u64,
) -> anyhow::Result<Option<(Arc<RedisQueue>, Arc<ManualClock>)>> {
    Ok(connect(retry_after_secs)
        .await?
        .map(|(queue, clock, _config)| (queue, clock)))
}

async fn connect(
    retry_after_secs: u64,
) -> anyhow::Result<Option<(Arc<RedisQueue>, Arc<ManualClock>, RedisConfig)>> {
    let Ok(url) = std::env::var("REDIS_URL") else {
        eprintln!("REDIS_URL not set, skipping");
        return Ok(None);
    };

    let clock = Arc::new(ManualClock::starting_now());
    let config = RedisConfig {
        prefix: format!("backlog-test:{}", uuid::Uuid::new_v4()),
        retry_after_secs,
        ..RedisConfig::new(url)
    };
    let queue = RedisQueue::connect(config.clone(), contract::registry())
        .await?
        .with_clock(clock.clone());
    Ok(Some((Arc::new(queue), clock, config)))
}

#[tokio::test]
async fn push_pop_and_delay() -> anyhow::Result<()> {
    let Some((queue, clock)) = backend().await? else {
        return Ok(());
    };
    assert!(queue.is_healthy().await);
    contract::push_then_pop(queue.as_ref()).await?;
    contract::delayed_job_waits(queue.as_ref(), &clock).await?;
    Ok(())
}

#[tokio::test]
async fn fifo_and_priority_order() -> anyhow::Result<()> {
    let Some((queue, _clock)) = backend().await? else {
        return Ok(());
    };
    contract::fifo_order(queue.as_ref()).await?;
    contract::priority_order(queue.as_ref()).await?;
    Ok(())
}

#[tokio::test]
async fn reservations() -> anyhow::Result<()> {
    let Some((queue, clock)) = backend().await? else {
        return Ok(());
    };
    contract::reserved_job_is_hidden(queue.as_ref()).await?;
    contract::release_and_delete(queue.as_ref(), &clock).await?;
    Ok(())
}

/// Reservation markers expire on the server clock, so this waits for real
#[tokio::test]
async fn reservation_marker_expires() -> anyhow::Result<()> {
    let Some((queue, clock)) = backend_with_retry_after(1).await? else {
        return Ok(());
    };
    let id = queue.push(&contract::echo("stranded"), "expiry", 0).await?;
    let held = queue.pop("expiry").await?.expect("first pop");
    assert_eq!(held.id(), id);
    assert!(queue.pop("expiry").await?.is_none());

    // Old enough by the backend clock, but the marker is still alive
    clock.advance_secs(2);
    assert!(queue.pop("expiry").await?.is_none());

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let again = queue.pop("expiry").await?.expect("reservation lapsed");
    assert_eq!(again.id(), id);
    assert_eq!(queue.stats("expiry").await?.reserved, 1);
    Ok(())
}

#[tokio::test]
async fn size_clear_and_isolation() -> anyhow::Result<()> {
    let Some((queue, _clock)) = backend().await? else {
        return Ok(());
    };
    contract::size_and_clear(queue.as_ref()).await?;
    contract::queues_are_isolated(queue.as_ref()).await?;
    contract::bulk_and_pop_batch(queue.as_ref()).await?;
    contract::stats_breakdown(queue.as_ref()).await?;
    Ok(())
}

#[tokio::test]
async fn failed_store() -> anyhow::Result<()> {
    let Some((queue, _clock)) = backend().await? else {
        return Ok(());
    };
    contract::failed_store_lifecycle(queue.as_ref()).await?;
    contract::unknown_job_type_is_failed(queue.as_ref()).await?;

    // Flushing every queue also empties the id index
    assert_eq!(queue.flush_failed(None).await?, 1);
    assert!(!queue.retry_failed("missing").await?);
    Ok(())
}

#[tokio::test]
async fn unreadable_record_is_parked_in_failed_store() -> anyhow::Result<()> {
    let Some((queue, _clock, config)) = connect(RETRY_AFTER).await? else {
        return Ok(());
    };
    let id = queue.push(&contract::echo("garbled"), "corrupt", 0).await?;

    let client = redis::Client::open(config.url.as_str())?;
    let mut conn = client.get_multiplexed_async_connection().await?;
    let _: () = redis::cmd("HSET")
        .arg(format!("{}:queues:corrupt:jobs", config.prefix))
        .arg(&id)
        .arg("{not json")
        .query_async(&mut conn)
        .await?;

    assert!(queue.pop("corrupt").await?.is_none());
    let stats = queue.stats("corrupt").await?;
    assert_eq!(stats.pending + stats.reserved + stats.delayed, 0);
    assert_eq!(stats.failed, 1);

    // Not listed, cannot be revived, but can be dropped
    assert!(queue.failed("corrupt").await?.is_empty());
    assert!(queue.retry_failed(&id).await.is_err());
    assert!(queue.forget_failed(&id).await?);
    assert_eq!(queue.stats("corrupt").await?.failed, 0);
    Ok(())
}

#[tokio::test]
async fn round_trip_and_retries() -> anyhow::Result<()> {
    let Some((queue, clock)) = backend().await? else {
        return Ok(());
    };
    contract::round_trip(queue.as_ref()).await?;

    let shared: Arc<dyn QueueBackend> = queue;
    contract::single_attempt_is_never_released(shared.clone()).await?;
    contract::retries_then_fails(shared, &clock).await?;
    Ok(())
}

#[tokio::test]
async fn far_future_delays() -> anyhow::Result<()> {
    let Some((queue, _clock)) = backend().await? else {
        return Ok(());
    };
    contract::far_future_delays(queue).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers() -> anyhow::Result<()> {
    let Some((queue, _clock)) = backend().await? else {
        return Ok(());
    };
    contract::concurrent_producers(queue).await?;
    Ok(())
}
