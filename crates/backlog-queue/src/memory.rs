//! In-memory queue implementation with priority scheduling
//!
//! Ready jobs sit in a priority heap, delayed jobs in a heap ordered by
//! `available_at`. Every `pop` first promotes due delayed jobs and expired
//! reservations, then reserves the best ready job, all under one lock.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::{revive, snapshot_for, FailedJob, QueueBackend, QueueError, QueueStats};
use crate::clock::{Clock, SystemClock};
use crate::events::{EventSink, NoopEventSink, QUEUE_JOB_PUSHED};
use crate::job::{JobId, JobSnapshot, QueuedJob};
use crate::registry::JobRegistry;

/// Default visibility timeout for reserved jobs
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Ready heap entry: higher priority first, then oldest first
#[derive(Debug, Clone, Eq, PartialEq)]
struct ReadyEntry {
    priority: i64,
    seq: u64,
    generation: u64,
    id: JobId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| self.generation.cmp(&other.generation))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Delayed heap entry: earliest `available_at` first
#[derive(Debug, Clone, Eq, PartialEq)]
struct DelayedEntry {
    available_at: DateTime<Utc>,
    generation: u64,
    id: JobId,
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .available_at
            .cmp(&self.available_at)
            .then_with(|| other.generation.cmp(&self.generation))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Heap entries are never removed eagerly; an entry whose generation no
/// longer matches its record is stale and skipped.
#[derive(Debug)]
struct StoredJob {
    snapshot: JobSnapshot,
    seq: u64,
    generation: u64,
    available_at: DateTime<Utc>,
    reserved_until: Option<DateTime<Utc>>,
}

impl StoredJob {
    fn ready_entry(&self) -> ReadyEntry {
        ReadyEntry {
            priority: self.snapshot.priority(),
            seq: self.seq,
            generation: self.generation,
            id: self.snapshot.id.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    records: HashMap<JobId, StoredJob>,
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    reserved: HashSet<JobId>,
}

impl QueueState {
    fn insert(
        &mut self,
        snapshot: JobSnapshot,
        seq: u64,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let id = snapshot.id.clone();
        // A stored job keeps its place in line; only the generation moves
        let (seq, generation) = self
            .records
            .get(&id)
            .map_or((seq, 0), |existing| (existing.seq, existing.generation + 1));
        self.reserved.remove(&id);

        let record = StoredJob {
            snapshot,
            seq,
            generation,
            available_at,
            reserved_until: None,
        };

        if available_at <= now {
            self.ready.push(record.ready_entry());
        } else {
            self.delayed.push(DelayedEntry {
                available_at,
                generation,
                id: id.clone(),
            });
        }
        self.records.insert(id, record);
    }

    fn remove(&mut self, id: &str) -> Option<StoredJob> {
        self.reserved.remove(id);
        self.records.remove(id)
    }

    /// Move due delayed jobs and expired reservations into the ready heap
    fn promote(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.delayed.peek() {
            if entry.available_at > now {
                break;
            }
            let Some(entry) = self.delayed.pop() else {
                break;
            };
            if let Some(record) = self.records.get(&entry.id) {
                if record.generation == entry.generation && record.reserved_until.is_none() {
                    self.ready.push(record.ready_entry());
                }
            }
        }

        let expired: Vec<JobId> = self
            .reserved
            .iter()
            .filter(|id| {
                self.records
                    .get(*id)
                    .and_then(|record| record.reserved_until)
                    .is_some_and(|until| now > until)
            })
            .cloned()
            .collect();

        for id in expired {
            self.reserved.remove(&id);
            if let Some(record) = self.records.get_mut(&id) {
                debug!(job_id = %id, "Reservation expired, job visible again");
                record.reserved_until = None;
                record.generation += 1;
                self.ready.push(record.ready_entry());
            }
        }
    }

    fn reserve_next(&mut self, until: DateTime<Utc>) -> Option<JobSnapshot> {
        while let Some(entry) = self.ready.pop() {
            let Some(record) = self.records.get_mut(&entry.id) else {
                continue;
            };
            if record.generation != entry.generation || record.reserved_until.is_some() {
                continue;
            }
            record.reserved_until = Some(until);
            self.reserved.insert(entry.id);
            return Some(record.snapshot.clone());
        }
        None
    }

    fn stats(&self, now: DateTime<Utc>) -> (usize, usize, usize) {
        let mut pending = 0;
        let mut reserved = 0;
        let mut delayed = 0;
        for record in self.records.values() {
            // A lapsed reservation is visible again, even before `pop` notices
            if record.reserved_until.is_some_and(|until| now <= until) {
                reserved += 1;
            } else if record.available_at <= now {
                pending += 1;
            } else {
                delayed += 1;
            }
        }
        (pending, reserved, delayed)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    queues: HashMap<String, QueueState>,
    failed: Vec<FailedJob>,
    seq: u64,
}

impl MemoryState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// Whole seconds as a chrono duration, saturating at its maximum
fn seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// Process-local backend for tests and single-process deployments
#[derive(Debug)]
pub struct MemoryQueue {
    state: Arc<Mutex<MemoryState>>,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    retry_after: Duration,
}

impl MemoryQueue {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            registry,
            clock: Arc::new(SystemClock),
            events: Arc::new(NoopEventSink),
            retry_after: seconds(DEFAULT_RETRY_AFTER_SECS),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Seconds a reservation stays exclusive before the job is handed out again
    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = seconds(secs);
        self
    }

    fn available_at(&self, now: DateTime<Utc>, delay_secs: u64) -> DateTime<Utc> {
        now.checked_add_signed(seconds(delay_secs)).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    fn driver(&self) -> &str {
        "memory"
    }

    async fn push(
        &self,
        job: &QueuedJob,
        queue: &str,
        delay_secs: u64,
    ) -> Result<JobId, QueueError> {
        job.validate()?;
        let snapshot = snapshot_for(job, queue)?;
        let id = snapshot.id.clone();
        let now = self.clock.now();
        let available_at = self.available_at(now, delay_secs);

        {
            let mut state = self.state.lock().await;
            let seq = state.next_seq();
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .insert(snapshot, seq, available_at, now);
        }

        debug!(job_id = %id, queue = %queue, delay_secs, "Job pushed");
        self.events.trigger(
            QUEUE_JOB_PUSHED,
            json!({ "id": id, "name": job.name(), "queue": queue, "delay": delay_secs }),
        );

        Ok(id)
    }

    async fn pop(&self, queue: &str) -> Result<Option<QueuedJob>, QueueError> {
        let now = self.clock.now();
        let until = now
            .checked_add_signed(self.retry_after)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut state = self.state.lock().await;

        loop {
            let Some(queue_state) = state.queues.get_mut(queue) else {
                return Ok(None);
            };
            queue_state.promote(now);

            let Some(snapshot) = queue_state.reserve_next(until) else {
                return Ok(None);
            };

            match QueuedJob::unserialize(snapshot.clone(), &self.registry) {
                Ok(job) => return Ok(Some(job)),
                Err(e) => {
                    warn!(
                        job_id = %snapshot.id,
                        name = %snapshot.name,
                        error = %e,
                        "Undecodable job moved to failed store"
                    );
                    queue_state.remove(&snapshot.id);
                    state.failed.retain(|failed| failed.id != snapshot.id);
                    state.failed.push(FailedJob {
                        id: snapshot.id.clone(),
                        queue: queue.to_string(),
                        job: snapshot,
                        reason: e.to_string(),
                        failed_at: now,
                    });
                }
            }
        }
    }

    async fn release(
        &self,
        job: &QueuedJob,
        queue: &str,
        delay_secs: u64,
    ) -> Result<bool, QueueError> {
        let snapshot = snapshot_for(job, queue)?;
        let now = self.clock.now();
        let available_at = self.available_at(now, delay_secs);

        let mut state = self.state.lock().await;
        let seq = state.next_seq();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .insert(snapshot, seq, available_at, now);

        debug!(job_id = %job.id(), queue = %queue, delay_secs, "Job released");
        Ok(true)
    }

    async fn delete(&self, job: &QueuedJob, queue: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let removed = state
            .queues
            .get_mut(queue)
            .and_then(|queue_state| queue_state.remove(job.id()))
            .is_some();
        Ok(removed)
    }

    async fn fail(&self, job: &QueuedJob, queue: &str, reason: &str) -> Result<(), QueueError> {
        let snapshot = snapshot_for(job, queue)?;
        let now = self.clock.now();

        let mut state = self.state.lock().await;
        if let Some(queue_state) = state.queues.get_mut(queue) {
            queue_state.remove(job.id());
        }
        state.failed.retain(|failed| failed.id != job.id());
        state.failed.push(FailedJob {
            id: job.id().to_string(),
            queue: queue.to_string(),
            job: snapshot,
            reason: reason.to_string(),
            failed_at: now,
        });
        Ok(())
    }

    async fn size(&self, queue: &str) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        Ok(state
            .queues
            .get(queue)
            .map_or(0, |queue_state| queue_state.stats(now).0))
    }

    async fn clear(&self, queue: &str) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        Ok(state
            .queues
            .remove(queue)
            .map_or(0, |queue_state| queue_state.records.len()))
    }

    async fn failed(&self, queue: &str) -> Result<Vec<FailedJob>, QueueError> {
        let state = self.state.lock().await;
        Ok(state
            .failed
            .iter()
            .filter(|failed| failed.queue == queue)
            .cloned()
            .collect())
    }

    async fn retry_failed(&self, id: &str) -> Result<bool, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let Some(position) = state.failed.iter().position(|failed| failed.id == id) else {
            return Ok(false);
        };
        let failed = state.failed.remove(position);
        let seq = state.next_seq();
        state
            .queues
            .entry(failed.queue.clone())
            .or_default()
            .insert(revive(failed.job), seq, now, now);

        debug!(job_id = %id, queue = %failed.queue, "Failed job queued again");
        Ok(true)
    }

    async fn forget_failed(&self, id: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let before = state.failed.len();
        state.failed.retain(|failed| failed.id != id);
        Ok(state.failed.len() < before)
    }

    async fn flush_failed(&self, queue: Option<&str>) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let before = state.failed.len();
        match queue {
            Some(queue) => state.failed.retain(|failed| failed.queue != queue),
            None => state.failed.clear(),
        }
        Ok(before - state.failed.len())
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let (pending, reserved, delayed) = state
            .queues
            .get(queue)
            .map_or((0, 0, 0), |queue_state| queue_state.stats(now));
        let failed = state.failed.iter().filter(|failed| failed.queue == queue).count();

        Ok(QueueStats {
            name: queue.to_string(),
            driver: self.driver().to_string(),
            size: pending,
            pending,
            reserved,
            delayed,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::contract::{echo, registry, EchoJob};

    fn queue_with_clock() -> (MemoryQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let queue = MemoryQueue::new(registry())
            .with_clock(clock.clone())
            .with_retry_after(30);
        (queue, clock)
    }

    #[tokio::test]
    async fn test_enqueue_dequeue() {
        let (queue, _clock) = queue_with_clock();

        let id = queue.push(&echo("a"), "default", 0).await.unwrap();

        let job = queue.pop("default").await.unwrap().expect("Should have job");
        assert_eq!(job.id(), id);
        assert_eq!(job.name(), "contract.echo");
        assert_eq!(job.attempts(), 0);

        // Dequeue empty
        let empty = queue.pop("default").await.unwrap();
        assert!(empty.is_none());
    }

    #[tokio::test]
    async fn test_delayed_job() {
        let (queue, clock) = queue_with_clock();
        let id = queue.push(&echo("later"), "default", 5).await.unwrap();

        // Should be none immediately
        assert!(queue.pop("default").await.unwrap().is_none());

        clock.advance_secs(4);
        assert!(queue.pop("default").await.unwrap().is_none());

        clock.advance_secs(1);
        let job = queue
            .pop("default")
            .await
            .unwrap()
            .expect("Should have delayed job");
        assert_eq!(job.id(), id);
    }

    #[tokio::test]
    async fn test_huge_delays_saturate() {
        let (queue, clock) = queue_with_clock();
        queue
            .push(&echo("decades"), "default", 10_000_000_000_000_000)
            .await
            .unwrap();
        queue.push(&echo("now"), "default", 0).await.unwrap();

        let job = queue.pop("default").await.unwrap().unwrap();
        assert!(queue
            .release(&job, "default", 10_000_000_000_000_000)
            .await
            .unwrap());

        clock.advance_secs(1_000_000);
        assert!(queue.pop("default").await.unwrap().is_none());
        let stats = queue.stats("default").await.unwrap();
        assert_eq!((stats.pending, stats.reserved, stats.delayed), (0, 0, 2));
    }

    #[test]
    fn test_huge_retry_after_saturates() {
        let queue = MemoryQueue::new(registry()).with_retry_after(u64::MAX);
        assert_eq!(queue.retry_after, Duration::MAX);
    }

    #[tokio::test]
    async fn test_stale_heap_entries_are_skipped() {
        let (queue, clock) = queue_with_clock();
        queue.push(&echo("a"), "default", 0).await.unwrap();

        let job = queue.pop("default").await.unwrap().unwrap();
        // Released twice: only the latest generation may be handed out
        queue.release(&job, "default", 0).await.unwrap();
        queue.release(&job, "default", 10).await.unwrap();

        assert!(queue.pop("default").await.unwrap().is_none());
        clock.advance_secs(10);
        let again = queue.pop("default").await.unwrap().unwrap();
        assert_eq!(again.id(), job.id());
        assert!(queue.pop("default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_reservation_keeps_fifo_position() {
        let (queue, clock) = queue_with_clock();
        let first = queue.push(&echo("first"), "default", 0).await.unwrap();
        let second = queue.push(&echo("second"), "default", 0).await.unwrap();

        let held = queue.pop("default").await.unwrap().unwrap();
        assert_eq!(held.id(), first);

        clock.advance_secs(31);
        let next = queue.pop("default").await.unwrap().unwrap();
        assert_eq!(next.id(), first, "expired reservation is redelivered first");
        let last = queue.pop("default").await.unwrap().unwrap();
        assert_eq!(last.id(), second);
    }

    #[tokio::test]
    async fn test_released_job_keeps_its_place() {
        let (queue, _clock) = queue_with_clock();
        let first = queue.push(&echo("first"), "default", 0).await.unwrap();
        let second = queue.push(&echo("second"), "default", 0).await.unwrap();

        let job = queue.pop("default").await.unwrap().unwrap();
        assert_eq!(job.id(), first);
        queue.release(&job, "default", 0).await.unwrap();

        assert_eq!(queue.pop("default").await.unwrap().unwrap().id(), first);
        assert_eq!(queue.pop("default").await.unwrap().unwrap().id(), second);
    }

    #[tokio::test]
    async fn test_push_rejects_invalid_job() {
        let (queue, _clock) = queue_with_clock();
        let job = QueuedJob::new(EchoJob {
            label: "x".into(),
        })
        .on_queue("");
        let err = queue.push(&job, "", 0).await.unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[tokio::test]
    async fn test_release_persists_mutated_state() {
        let (queue, _clock) = queue_with_clock();
        queue.push(&echo("a"), "default", 0).await.unwrap();

        let mut job = queue.pop("default").await.unwrap().unwrap();
        job.increment_attempts();
        job.add_metadata("last_error", "boom");
        queue.release(&job, "default", 0).await.unwrap();

        let again = queue.pop("default").await.unwrap().unwrap();
        assert_eq!(again.attempts(), 1);
        assert_eq!(
            again.metadata().get("last_error").and_then(|v| v.as_str()),
            Some("boom")
        );
    }
}
