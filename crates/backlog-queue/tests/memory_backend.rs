//! Shared backend checks against the in-memory queue

use std::sync::Arc;

use backlog_queue::contract;
use backlog_queue::{ManualClock, MemoryQueue, QueueBackend};

const RETRY_AFTER: u64 = 30;

fn backend() -> (Arc<MemoryQueue>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let queue = MemoryQueue::new(contract::registry())
        .with_clock(clock.clone())
        .with_retry_after(RETRY_AFTER);
    (Arc::new(queue), clock)
}

#[tokio::test]
async fn push_then_pop() -> anyhow::Result<()> {
    let (queue, _clock) = backend();
    contract::push_then_pop(queue.as_ref()).await?;
    Ok(())
}

#[tokio::test]
async fn delayed_job_waits() -> anyhow::Result<()> {
    let (queue, clock) = backend();
    contract::delayed_job_waits(queue.as_ref(), &clock).await?;
    Ok(())
}

#[tokio::test]
async fn fifo_and_priority_order() -> anyhow::Result<()> {
    let (queue, _clock) = backend();
    contract::fifo_order(queue.as_ref()).await?;
    contract::priority_order(queue.as_ref()).await?;
    Ok(())
}

#[tokio::test]
async fn reservations() -> anyhow::Result<()> {
    let (queue, clock) = backend();
    contract::reserved_job_is_hidden(queue.as_ref()).await?;
    contract::reservation_expires(queue.as_ref(), &clock, RETRY_AFTER as i64).await?;
    contract::release_and_delete(queue.as_ref(), &clock).await?;
    Ok(())
}

#[tokio::test]
async fn size_clear_and_isolation() -> anyhow::Result<()> {
    let (queue, _clock) = backend();
    contract::size_and_clear(queue.as_ref()).await?;
    contract::queues_are_isolated(queue.as_ref()).await?;
    contract::bulk_and_pop_batch(queue.as_ref()).await?;
    contract::stats_breakdown(queue.as_ref()).await?;
    Ok(())
}

#[tokio::test]
async fn failed_store() -> anyhow::Result<()> {
    let (queue, _clock) = backend();
    contract::failed_store_lifecycle(queue.as_ref()).await?;
    contract::unknown_job_type_is_failed(queue.as_ref()).await?;
    Ok(())
}

#[tokio::test]
async fn round_trip() -> anyhow::Result<()> {
    let (queue, _clock) = backend();
    contract::round_trip(queue.as_ref()).await?;
    Ok(())
}

#[tokio::test]
async fn retry_policy() -> anyhow::Result<()> {
    let (queue, clock) = backend();
    let shared: Arc<dyn QueueBackend> = queue;
    contract::single_attempt_is_never_released(shared.clone()).await?;
    contract::retries_then_fails(shared, &clock).await?;
    Ok(())
}

#[tokio::test]
async fn far_future_delays() -> anyhow::Result<()> {
    let (queue, _clock) = backend();
    contract::far_future_delays(queue).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers() -> anyhow::Result<()> {
    let (queue, _clock) = backend();
    contract::concurrent_producers(queue).await?;
    Ok(())
}
