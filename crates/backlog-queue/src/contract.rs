//! Behavioral checks shared by every `QueueBackend` test suite.
//!
//! Each check uses its own queue name and clears it first, so the checks can
//! run against one long-lived backend in any order. Checks panic on a
//! violated expectation and return backend errors as-is.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

use crate::backend::{QueueBackend, QueueError};
use crate::clock::ManualClock;
use crate::events::{MemoryEventSink, JOB_RETRYING};
use crate::job::{BackoffStrategy, Job, JobContext, JobError, QueuedJob};
use crate::processor::{FailureOutcome, JobProcessor};
use crate::registry::JobRegistry;

pub const ECHO_JOB: &str = "contract.echo";
pub const FLAKY_JOB: &str = "contract.flaky";

/// Returns its label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoJob {
    pub label: String,
}

#[async_trait]
impl Job for EchoJob {
    fn name(&self) -> &str {
        ECHO_JOB
    }

    async fn handle(&mut self, _ctx: &JobContext) -> Result<Option<Value>, JobError> {
        Ok(Some(json!({ "label": self.label })))
    }
}

/// Fails its first `fail_times` attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlakyJob {
    pub label: String,
    pub fail_times: u32,
}

impl FlakyJob {
    pub fn new(label: impl Into<String>, fail_times: u32) -> Self {
        Self {
            label: label.into(),
            fail_times,
        }
    }
}

#[async_trait]
impl Job for FlakyJob {
    fn name(&self) -> &str {
        FLAKY_JOB
    }

    async fn handle(&mut self, ctx: &JobContext) -> Result<Option<Value>, JobError> {
        if ctx.attempt <= self.fail_times {
            return Err(JobError::failed(format!(
                "{} failed on attempt {}",
                self.label, ctx.attempt
            )));
        }
        Ok(Some(json!({ "label": self.label, "attempt": ctx.attempt })))
    }
}

/// Never registered, so backends cannot rebuild it
#[derive(Debug, Serialize, Deserialize)]
pub struct OrphanJob;

#[async_trait]
impl Job for OrphanJob {
    fn name(&self) -> &str {
        "contract.orphan"
    }

    async fn handle(&mut self, _ctx: &JobContext) -> Result<Option<Value>, JobError> {
        Ok(None)
    }
}

/// Registry knowing the echo and flaky jobs
pub fn registry() -> Arc<JobRegistry> {
    let mut registry = JobRegistry::new();
    registry
        .register::<EchoJob>(ECHO_JOB)
        .register::<FlakyJob>(FLAKY_JOB);
    Arc::new(registry)
}

pub fn echo(label: &str) -> QueuedJob {
    QueuedJob::new(EchoJob {
        label: label.to_string(),
    })
}

fn reserved(job: Option<QueuedJob>, what: &str) -> QueuedJob {
    match job {
        Some(job) => job,
        None => panic!("expected a job: {what}"),
    }
}

async fn fresh(backend: &dyn QueueBackend, queue: &str) -> Result<(), QueueError> {
    backend.clear(queue).await?;
    backend.flush_failed(Some(queue)).await?;
    Ok(())
}

/// Push then pop returns the same job, attempts only move on `process`
pub async fn push_then_pop(backend: &dyn QueueBackend) -> Result<(), QueueError> {
    let queue = "contract-push-pop";
    fresh(backend, queue).await?;

    let id = backend.push(&echo("a"), queue, 0).await?;
    let mut job = reserved(backend.pop(queue).await?, "pushed job is visible");
    assert_eq!(job.id(), id);
    assert_eq!(job.name(), ECHO_JOB);
    assert_eq!(job.attempts(), 0);

    let processor = JobProcessor::new(Arc::new(MemoryEventSink::new()));
    let result = processor
        .process(&mut job)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;
    assert_eq!(job.attempts(), 1);
    assert_eq!(result, Some(json!({ "label": "a" })));

    assert!(backend.delete(&job, queue).await?);
    assert!(backend.pop(queue).await?.is_none());
    Ok(())
}

/// A delayed job stays hidden until its delay elapsed
pub async fn delayed_job_waits(
    backend: &dyn QueueBackend,
    clock: &ManualClock,
) -> Result<(), QueueError> {
    let queue = "contract-delayed";
    fresh(backend, queue).await?;

    let id = backend.push(&echo("later"), queue, 5).await?;
    assert!(backend.pop(queue).await?.is_none());
    assert_eq!(backend.size(queue).await?, 0);

    clock.advance_secs(4);
    assert!(backend.pop(queue).await?.is_none());

    clock.advance_secs(1);
    let job = reserved(backend.pop(queue).await?, "delay elapsed");
    assert_eq!(job.id(), id);
    Ok(())
}

pub async fn fifo_order(backend: &dyn QueueBackend) -> Result<(), QueueError> {
    let queue = "contract-fifo";
    fresh(backend, queue).await?;

    let mut pushed = Vec::new();
    for label in ["first", "second", "third"] {
        pushed.push(backend.push(&echo(label), queue, 0).await?);
    }

    let mut popped = Vec::new();
    while let Some(job) = backend.pop(queue).await? {
        popped.push(job.id().to_string());
    }
    assert_eq!(popped, pushed);
    Ok(())
}

/// Higher priority first, ties broken by push order
pub async fn priority_order(backend: &dyn QueueBackend) -> Result<(), QueueError> {
    let queue = "contract-priority";
    fresh(backend, queue).await?;

    let low = backend.push(&echo("low").with_priority(1), queue, 0).await?;
    let high = backend.push(&echo("high").with_priority(5), queue, 0).await?;
    let plain = backend.push(&echo("plain"), queue, 0).await?;
    let high_too = backend.push(&echo("high-too").with_priority(5), queue, 0).await?;

    let mut popped = Vec::new();
    while let Some(job) = backend.pop(queue).await? {
        popped.push(job.id().to_string());
    }
    assert_eq!(popped, vec![high, high_too, low, plain]);
    Ok(())
}

/// A reserved job is invisible to every other `pop`
pub async fn reserved_job_is_hidden(backend: &dyn QueueBackend) -> Result<(), QueueError> {
    let queue = "contract-reserved";
    fresh(backend, queue).await?;

    backend.push(&echo("only"), queue, 0).await?;
    let _held = reserved(backend.pop(queue).await?, "first pop");
    assert!(backend.pop(queue).await?.is_none());
    assert_eq!(backend.size(queue).await?, 0);

    let stats = backend.stats(queue).await?;
    assert_eq!(stats.reserved, 1);
    assert_eq!(stats.pending, 0);
    Ok(())
}

/// An expired reservation makes the job visible again
pub async fn reservation_expires(
    backend: &dyn QueueBackend,
    clock: &ManualClock,
    retry_after_secs: i64,
) -> Result<(), QueueError> {
    let queue = "contract-expiry";
    fresh(backend, queue).await?;

    let id = backend.push(&echo("stranded"), queue, 0).await?;
    let _held = reserved(backend.pop(queue).await?, "first pop");

    clock.advance_secs(retry_after_secs);
    assert!(
        backend.pop(queue).await?.is_none(),
        "reservation still valid at exactly retry_after"
    );

    clock.advance_secs(1);
    let stats = backend.stats(queue).await?;
    assert_eq!((stats.pending, stats.reserved), (1, 0), "lapsed reservation counts as pending");
    assert_eq!(backend.size(queue).await?, 1);

    let again = reserved(backend.pop(queue).await?, "reservation expired");
    assert_eq!(again.id(), id);
    Ok(())
}

/// `release` stores the mutated job and honors the delay, `delete` is final
pub async fn release_and_delete(
    backend: &dyn QueueBackend,
    clock: &ManualClock,
) -> Result<(), QueueError> {
    let queue = "contract-release";
    fresh(backend, queue).await?;

    let id = backend.push(&echo("again"), queue, 0).await?;
    let mut job = reserved(backend.pop(queue).await?, "first pop");
    job.increment_attempts();
    job.add_metadata("note", "released once");
    assert!(backend.release(&job, queue, 5).await?);

    assert!(backend.pop(queue).await?.is_none());
    clock.advance_secs(5);
    let job = reserved(backend.pop(queue).await?, "released job");
    assert_eq!(job.id(), id);
    assert_eq!(job.attempts(), 1);
    assert_eq!(
        job.metadata().get("note").and_then(|v| v.as_str()),
        Some("released once")
    );

    assert!(backend.delete(&job, queue).await?);
    assert!(!backend.delete(&job, queue).await?);
    assert!(backend.pop(queue).await?.is_none());
    Ok(())
}

/// `size` counts only visible jobs, `clear` removes everything
pub async fn size_and_clear(backend: &dyn QueueBackend) -> Result<(), QueueError> {
    let queue = "contract-size";
    fresh(backend, queue).await?;

    backend.push(&echo("a"), queue, 0).await?;
    backend.push(&echo("b"), queue, 0).await?;
    backend.push(&echo("c"), queue, 60).await?;
    assert_eq!(backend.size(queue).await?, 2);

    let _held = reserved(backend.pop(queue).await?, "first pop");
    assert_eq!(backend.size(queue).await?, 1);

    assert_eq!(backend.clear(queue).await?, 3);
    assert_eq!(backend.size(queue).await?, 0);
    assert!(backend.pop(queue).await?.is_none());
    Ok(())
}

/// Failed store CRUD; `retry_failed` is idempotent
pub async fn failed_store_lifecycle(backend: &dyn QueueBackend) -> Result<(), QueueError> {
    let queue = "contract-failed";
    fresh(backend, queue).await?;

    let a = backend.push(&echo("a"), queue, 0).await?;
    let b = backend.push(&echo("b"), queue, 0).await?;
    let mut job_a = reserved(backend.pop(queue).await?, "pop a");
    assert_eq!(job_a.id(), a);
    job_a.increment_attempts();
    backend.fail(&job_a, queue, "boom").await?;

    let failed = backend.failed(queue).await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, a);
    assert_eq!(failed[0].queue, queue);
    assert_eq!(failed[0].reason, "boom");
    assert_eq!(failed[0].job.attempts, 1);
    assert_eq!(backend.size(queue).await?, 1);

    assert!(backend.retry_failed(&a).await?);
    assert!(!backend.retry_failed(&a).await?, "second retry must not re-enqueue");
    assert!(backend.failed(queue).await?.is_empty());
    assert_eq!(backend.size(queue).await?, 2);

    let mut seen = Vec::new();
    while let Some(job) = backend.pop(queue).await? {
        if job.id() == a {
            assert_eq!(job.attempts(), 0, "retried job gets a fresh budget");
        }
        seen.push(job);
    }
    assert_eq!(seen.len(), 2);

    for job in &seen {
        backend.fail(job, queue, "again").await?;
    }
    assert!(backend.forget_failed(&a).await?);
    assert!(!backend.forget_failed(&a).await?);
    assert_eq!(backend.failed(queue).await?.len(), 1);
    assert_eq!(backend.failed(queue).await?[0].id, b);

    assert_eq!(backend.flush_failed(Some(queue)).await?, 1);
    assert!(backend.failed(queue).await?.is_empty());
    Ok(())
}

/// A record with an unregistered job type lands in the failed store
pub async fn unknown_job_type_is_failed(backend: &dyn QueueBackend) -> Result<(), QueueError> {
    let queue = "contract-unknown";
    fresh(backend, queue).await?;

    let orphan = backend.push(&QueuedJob::new(OrphanJob), queue, 0).await?;
    let known = backend.push(&echo("known"), queue, 0).await?;

    let job = reserved(backend.pop(queue).await?, "known job behind orphan");
    assert_eq!(job.id(), known);

    let failed = backend.failed(queue).await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, orphan);
    assert!(failed[0].reason.contains("contract.orphan"));
    Ok(())
}

pub async fn queues_are_isolated(backend: &dyn QueueBackend) -> Result<(), QueueError> {
    let (left, right) = ("contract-left", "contract-right");
    fresh(backend, left).await?;
    fresh(backend, right).await?;

    backend.push(&echo("l"), left, 0).await?;
    assert!(backend.pop(right).await?.is_none());
    assert_eq!(backend.size(right).await?, 0);
    assert_eq!(backend.clear(right).await?, 0);
    assert_eq!(backend.size(left).await?, 1);
    Ok(())
}

pub async fn bulk_and_pop_batch(backend: &dyn QueueBackend) -> Result<(), QueueError> {
    let queue = "contract-batch";
    fresh(backend, queue).await?;

    let jobs = vec![echo("x"), echo("y"), echo("z")];
    let ids = backend.bulk(&jobs, queue, 0).await?;
    assert_eq!(ids.len(), 3);

    let batch = backend.pop_batch(queue, 10).await?;
    let popped: Vec<String> = batch.iter().map(|job| job.id().to_string()).collect();
    assert_eq!(popped, ids);
    assert!(backend.pop_batch(queue, 10).await?.is_empty());
    assert_eq!(backend.stats(queue).await?.reserved, 3);
    Ok(())
}

/// Snapshot fields survive storage unchanged
pub async fn round_trip(backend: &dyn QueueBackend) -> Result<(), QueueError> {
    let queue = "contract-round-trip";
    fresh(backend, queue).await?;

    let mut job = QueuedJob::new(FlakyJob::new("rt", 2))
        .with_max_attempts(7)
        .with_timeout(30)
        .with_retry_delay(4)
        .with_backoff(BackoffStrategy::Exponential {
            initial_secs: 3,
            multiplier: 2.5,
        })
        .with_priority(2);
    job.add_metadata("origin", "contract");
    job.add_metadata("ratio", 0.5);
    job.add_metadata("flag", true);
    let original = job.serialize()?;

    backend.push(&job, queue, 0).await?;
    let popped = reserved(backend.pop(queue).await?, "round trip");
    let mut stored = popped.serialize()?;
    stored.queue = original.queue.clone();
    assert_eq!(stored, original);
    Ok(())
}

pub async fn stats_breakdown(backend: &dyn QueueBackend) -> Result<(), QueueError> {
    let queue = "contract-stats";
    fresh(backend, queue).await?;

    backend.push(&echo("ready"), queue, 0).await?;
    backend.push(&echo("busy"), queue, 0).await?;
    backend.push(&echo("later"), queue, 120).await?;
    let first = reserved(backend.pop(queue).await?, "pop ready");
    let second = reserved(backend.pop(queue).await?, "pop busy");
    backend.release(&first, queue, 0).await?;
    backend.fail(&second, queue, "nope").await?;
    backend.push(&echo("held"), queue, 0).await?;
    let _held = reserved(backend.pop(queue).await?, "pop one of released and held");

    let stats = backend.stats(queue).await?;
    assert_eq!(stats.name, queue);
    assert_eq!(stats.driver, backend.driver());
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.size, 1);
    assert_eq!(stats.reserved, 1);
    assert_eq!(stats.delayed, 1);
    assert_eq!(stats.failed, 1);
    Ok(())
}

/// A job allowed one attempt goes straight to the failed store
pub async fn single_attempt_is_never_released(
    backend: Arc<dyn QueueBackend>,
) -> Result<(), QueueError> {
    let queue = "contract-single-attempt";
    fresh(backend.as_ref(), queue).await?;

    let events = Arc::new(MemoryEventSink::new());
    let processor = JobProcessor::new(events.clone()).with_queue(backend.clone());
    let job = QueuedJob::new(FlakyJob::new("once", 1))
        .on_queue(queue)
        .with_max_attempts(1);
    backend.push(&job, queue, 0).await?;

    let mut job = reserved(backend.pop(queue).await?, "single attempt job");
    let err = match processor.process(&mut job).await {
        Ok(_) => panic!("flaky job must fail its first attempt"),
        Err(err) => err,
    };
    let outcome = processor.handle_failure(&mut job, &err).await;

    assert_eq!(outcome, FailureOutcome::Failed);
    assert_eq!(events.count(JOB_RETRYING), 0);
    assert_eq!(backend.size(queue).await?, 0);
    let failed = backend.failed(queue).await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].job.attempts, 1);
    Ok(())
}

/// Failing every attempt: released with growing delays, then failed
pub async fn retries_then_fails(
    backend: Arc<dyn QueueBackend>,
    clock: &ManualClock,
) -> Result<(), QueueError> {
    let queue = "contract-retries";
    fresh(backend.as_ref(), queue).await?;

    let events = Arc::new(MemoryEventSink::new());
    let processor = JobProcessor::new(events.clone()).with_queue(backend.clone());
    let job = QueuedJob::new(FlakyJob::new("always", u32::MAX))
        .on_queue(queue)
        .with_max_attempts(3)
        .with_backoff(BackoffStrategy::Linear { step_secs: 10 });
    let id = backend.push(&job, queue, 0).await?;

    for attempt in 1..=3u32 {
        let mut job = reserved(backend.pop(queue).await?, "retryable job");
        assert_eq!(job.id(), id);
        assert_eq!(job.attempts(), attempt - 1);

        let err = match processor.process(&mut job).await {
            Ok(_) => panic!("job must fail on attempt {attempt}"),
            Err(err) => err,
        };
        let outcome = processor.handle_failure(&mut job, &err).await;

        if attempt < 3 {
            assert_eq!(outcome, FailureOutcome::Retried);
            assert!(backend.pop(queue).await?.is_none(), "retry is delayed");
            clock.advance_secs(10 * i64::from(attempt));
        } else {
            assert_eq!(outcome, FailureOutcome::Failed);
        }
    }

    let delays: Vec<Value> = events
        .payloads(JOB_RETRYING)
        .into_iter()
        .map(|payload| payload["delay"].clone())
        .collect();
    assert_eq!(delays, vec![json!(10), json!(20)]);

    assert_eq!(backend.size(queue).await?, 0);
    let failed = backend.failed(queue).await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
    assert_eq!(failed[0].job.attempts, 3);
    assert_eq!(failed[0].reason, "Job contract.flaky failed: always failed on attempt 3");
    Ok(())
}

/// Delays far beyond any real schedule park the job instead of failing
pub async fn far_future_delays(backend: Arc<dyn QueueBackend>) -> Result<(), QueueError> {
    let queue = "contract-far-future";
    fresh(backend.as_ref(), queue).await?;

    backend.push(&echo("decades"), queue, 10_000_000_000_000_000).await?;
    backend.push(&echo("never"), queue, u64::MAX).await?;
    assert!(backend.pop(queue).await?.is_none());

    backend.push(&echo("now"), queue, 0).await?;
    let job = reserved(backend.pop(queue).await?, "undelayed job");
    assert!(backend.release(&job, queue, u64::MAX).await?);
    assert!(backend.pop(queue).await?.is_none());

    // A steep exponential backoff gets there on its own by attempt 17
    let events = Arc::new(MemoryEventSink::new());
    let processor = JobProcessor::new(events.clone()).with_queue(backend.clone());
    let steep = QueuedJob::new(FlakyJob::new("steep", u32::MAX))
        .on_queue(queue)
        .with_max_attempts(100)
        .with_backoff(BackoffStrategy::Exponential {
            initial_secs: 1,
            multiplier: 10.0,
        });
    backend.push(&steep, queue, 0).await?;
    let mut job = reserved(backend.pop(queue).await?, "steep job");
    for _ in 0..16 {
        job.increment_attempts();
    }
    let err = match processor.process(&mut job).await {
        Ok(_) => panic!("steep job must fail"),
        Err(err) => err,
    };
    assert_eq!(processor.handle_failure(&mut job, &err).await, FailureOutcome::Retried);
    let delay = events.payloads(JOB_RETRYING)[0]["delay"].as_u64();
    assert!(delay.is_some_and(|secs| secs >= 1_000_000_000_000_000));
    assert!(backend.pop(queue).await?.is_none());

    let stats = backend.stats(queue).await?;
    assert_eq!((stats.pending, stats.reserved, stats.delayed), (0, 0, 4));
    fresh(backend.as_ref(), queue).await?;
    Ok(())
}

/// Concurrent producers never lose or duplicate a push
pub async fn concurrent_producers(backend: Arc<dyn QueueBackend>) -> Result<(), QueueError> {
    let queue = "contract-concurrent";
    fresh(backend.as_ref(), queue).await?;

    let mut tasks = Vec::new();
    for producer in 0..4 {
        let backend = backend.clone();
        tasks.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for n in 0..5 {
                let job = echo(&format!("p{producer}-{n}"));
                ids.push(backend.push(&job, queue, 0).await?);
            }
            Ok::<_, QueueError>(ids)
        }));
    }

    let mut pushed = HashSet::new();
    for task in tasks {
        let ids = task
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))??;
        pushed.extend(ids);
    }
    assert_eq!(pushed.len(), 20);
    assert_eq!(backend.size(queue).await?, 20);

    let mut popped = HashSet::new();
    while let Some(job) = backend.pop(queue).await? {
        assert!(popped.insert(job.id().to_string()), "job delivered twice");
    }
    assert_eq!(popped, pushed);
    Ok(())
}
