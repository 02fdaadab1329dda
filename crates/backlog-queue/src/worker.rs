//! Worker run loop
//!
//! A worker pulls jobs from one queue and runs them one at a time. It never
//! executes jobs in parallel; run several workers (in one process or many)
//! against a shared backend to scale out. Control from other tasks goes
//! through a cloneable [`WorkerHandle`].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::backend::{QueueBackend, QueueError};
use crate::config::WorkerOptions;
use crate::container::ServiceResolver;
use crate::events::{
    EventSink, QUEUE_BATCH_POPPED, WORKER_PAUSED, WORKER_RESUMED, WORKER_STARTED, WORKER_STOPPED,
};
use crate::job::{JobId, QueuedJob};
use crate::processor::JobProcessor;

const RECENT_CAPACITY: usize = 100;
const HOUSEKEEPING_EVERY: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Paused,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Running => 1,
            Self::Paused => 2,
            Self::Stopping => 3,
            Self::Stopped => 4,
        }
    }
}

/// Live snapshot of a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub started_at: Option<DateTime<Utc>>,
    /// Jobs that completed successfully
    pub processed: u64,
    /// Attempts that ended in an error
    pub failed: u64,
    /// Resident memory in bytes
    pub memory_peak: u64,
    pub memory_current: u64,
    pub uptime_secs: u64,
    pub last_job_at: Option<DateTime<Utc>>,
}

/// What one poll of the queue did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Ran this many jobs
    Processed(u64),
    Empty,
    Paused,
    /// The backend errored; counts as an idle cycle
    Unavailable,
}

/// Idle sleep after `empty_cycles` consecutive polls that found nothing
pub fn backoff_for(empty_cycles: u32) -> Duration {
    let secs = match empty_cycles {
        0..=2 => 0,
        3..=9 => 1,
        10..=29 => 3,
        _ => 5,
    };
    Duration::from_secs(secs)
}

/// Resident set size of this process in bytes, 0 where unsupported
pub fn resident_memory() -> u64 {
    #[cfg(target_os = "linux")]
    {
        const PAGE_SIZE: u64 = 4096;
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|statm| {
                statm
                    .split_whitespace()
                    .nth(1)
                    .and_then(|pages| pages.parse::<u64>().ok())
            })
            .map_or(0, |pages| pages * PAGE_SIZE)
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    (millis != 0)
        .then(|| Utc.timestamp_millis_opt(millis).single())
        .flatten()
}

/// State shared between a worker and its handles
#[derive(Debug, Default)]
struct Shared {
    state: AtomicU8,
    stop: AtomicBool,
    paused: AtomicBool,
    wake: Notify,
    processed: AtomicU64,
    failed: AtomicU64,
    memory_peak: AtomicU64,
    memory_current: AtomicU64,
    started_at: AtomicI64,
    stopped_at: AtomicI64,
    last_job_at: AtomicI64,
}

impl Shared {
    fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn refresh_memory(&self) -> u64 {
        let current = resident_memory();
        self.memory_current.store(current, Ordering::Relaxed);
        self.memory_peak.fetch_max(current, Ordering::Relaxed);
        current
    }

    fn status(&self) -> WorkerStatus {
        self.refresh_memory();

        // `Paused` is only reported once the loop has seen the flag
        let mut state = WorkerState::from_u8(self.state.load(Ordering::SeqCst));
        if matches!(state, WorkerState::Running | WorkerState::Paused)
            && self.stop.load(Ordering::SeqCst)
        {
            state = WorkerState::Stopping;
        }

        let started_at = from_millis(self.started_at.load(Ordering::SeqCst));
        let until = from_millis(self.stopped_at.load(Ordering::SeqCst)).unwrap_or_else(Utc::now);
        let uptime_secs = started_at
            .map(|started| (until - started).num_seconds().max(0) as u64)
            .unwrap_or(0);

        WorkerStatus {
            state,
            started_at,
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            memory_peak: self.memory_peak.load(Ordering::Relaxed),
            memory_current: self.memory_current.load(Ordering::Relaxed),
            uptime_secs,
            last_job_at: from_millis(self.last_job_at.load(Ordering::SeqCst)),
        }
    }
}

/// Control surface for a running worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
    events: Arc<dyn EventSink>,
}

impl WorkerHandle {
    /// Ask the loop to stop at its next iteration. The job in flight, if
    /// any, runs to completion.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            info!("Worker paused");
            self.events.trigger(WORKER_PAUSED, json!({ "status": self.status() }));
        }
    }

    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            info!("Worker resumed");
            self.events.trigger(WORKER_RESUMED, json!({ "status": self.status() }));
            self.shared.wake.notify_one();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.status()
    }
}

#[derive(Debug)]
pub struct Worker {
    queue: Arc<dyn QueueBackend>,
    processor: JobProcessor,
    events: Arc<dyn EventSink>,
    options: WorkerOptions,
    shared: Arc<Shared>,
    recent: VecDeque<JobId>,
    since_housekeeping: u32,
    empty_cycles: u32,
}

impl Worker {
    pub fn new(queue: Arc<dyn QueueBackend>, events: Arc<dyn EventSink>) -> Self {
        let processor = JobProcessor::new(events.clone()).with_queue(queue.clone());
        Self {
            queue,
            processor,
            events,
            options: WorkerOptions::default(),
            shared: Arc::new(Shared::default()),
            recent: VecDeque::with_capacity(RECENT_CAPACITY),
            since_housekeeping: 0,
            empty_cycles: 0,
        }
    }

    /// Build a worker from resolved services
    pub fn from_services(services: &dyn ServiceResolver) -> Result<Self, QueueError> {
        let queue = services
            .queue()
            .ok_or_else(|| QueueError::Configuration("worker needs a queue backend".into()))?;
        let processor = services
            .processor()
            .ok_or_else(|| QueueError::Configuration("worker needs a job processor".into()))?;

        let mut worker = Self::new(queue, services.events());
        worker.processor = processor;
        Ok(worker)
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: self.shared.clone(),
            events: self.events.clone(),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.status()
    }

    /// Ids of the most recently completed jobs, oldest first
    pub fn recent_jobs(&self) -> impl Iterator<Item = &str> {
        self.recent.iter().map(String::as_str)
    }

    /// Run `queue` with `options` until stopped, `max_jobs` is reached or
    /// (with `stop_on_empty`) the queue runs dry
    pub async fn start(&mut self, queue: &str, options: WorkerOptions) -> WorkerStatus {
        self.options = options;
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.processed.store(0, Ordering::SeqCst);
        self.shared.failed.store(0, Ordering::SeqCst);
        self.shared.started_at.store(to_millis(Utc::now()), Ordering::SeqCst);
        self.shared.stopped_at.store(0, Ordering::SeqCst);
        self.shared.last_job_at.store(0, Ordering::SeqCst);
        self.shared.memory_peak.store(0, Ordering::Relaxed);
        self.shared.refresh_memory();
        self.shared.set_state(WorkerState::Running);
        self.empty_cycles = 0;

        info!(queue = %queue, options = ?self.options, "Worker started");
        self.events.trigger(
            WORKER_STARTED,
            json!({ "queue": queue, "options": self.options }),
        );

        let handled = self.run(queue, self.options.max_jobs).await;

        self.shared.stopped_at.store(to_millis(Utc::now()), Ordering::SeqCst);
        self.shared.set_state(WorkerState::Stopped);
        let status = self.status();
        info!(
            queue = %queue,
            handled,
            processed = status.processed,
            failed = status.failed,
            "Worker stopped"
        );
        self.events.trigger(
            WORKER_STOPPED,
            json!({ "queue": queue, "handled": handled, "status": status }),
        );
        status
    }

    /// The loop itself. Returns how many jobs it ran, failed ones included.
    pub async fn run(&mut self, queue: &str, max_jobs: Option<u64>) -> u64 {
        let mut handled = 0u64;
        let mut previous_empty = false;

        loop {
            if self.shared.stop.load(Ordering::SeqCst) {
                debug!(queue = %queue, "Stop requested");
                break;
            }
            if max_jobs.is_some_and(|max| handled >= max) {
                info!(queue = %queue, handled, "Job limit reached");
                break;
            }
            if self.since_housekeeping >= HOUSEKEEPING_EVERY {
                self.housekeeping();
            }
            if previous_empty {
                self.idle_backoff().await;
                if self.shared.stop.load(Ordering::SeqCst) {
                    break;
                }
            }
            if self.memory_exceeded() {
                self.shared.stop.store(true, Ordering::SeqCst);
                break;
            }

            let batch_size = self.options.batch_size.max(1);
            let outcome = if batch_size > 1 {
                let remaining = max_jobs.map(|max| max.saturating_sub(handled));
                let size = remaining.map_or(batch_size, |left| {
                    batch_size.min(usize::try_from(left).unwrap_or(usize::MAX))
                });
                self.process_batch(queue, size).await
            } else {
                self.process_next_job(queue).await
            };

            self.shared.set_state(if outcome == PollOutcome::Paused {
                WorkerState::Paused
            } else {
                WorkerState::Running
            });

            match outcome {
                PollOutcome::Processed(count) => {
                    handled += count;
                    self.empty_cycles = 0;
                    previous_empty = false;
                }
                PollOutcome::Empty => {
                    self.empty_cycles = self.empty_cycles.saturating_add(1);
                    previous_empty = true;
                    if self.options.stop_on_empty {
                        info!(queue = %queue, "Queue empty, stopping");
                        break;
                    }
                }
                PollOutcome::Paused | PollOutcome::Unavailable => {
                    self.empty_cycles = self.empty_cycles.saturating_add(1);
                    previous_empty = true;
                }
            }
        }

        handled
    }

    /// Pop one job and run it. A no-op while paused.
    pub async fn process_next_job(&mut self, queue: &str) -> PollOutcome {
        if self.shared.paused.load(Ordering::SeqCst) {
            return PollOutcome::Paused;
        }

        match self.queue.pop(queue).await {
            Ok(Some(job)) => {
                self.handle_job(job, queue).await;
                PollOutcome::Processed(1)
            }
            Ok(None) => PollOutcome::Empty,
            Err(e) => {
                error!(queue = %queue, error = %e, "Failed to pop job");
                PollOutcome::Unavailable
            }
        }
    }

    /// Reserve up to `size` jobs and run them highest priority first. Jobs
    /// of equal priority keep their pop order.
    pub async fn process_batch(&mut self, queue: &str, size: usize) -> PollOutcome {
        if self.shared.paused.load(Ordering::SeqCst) {
            return PollOutcome::Paused;
        }

        let mut jobs = match self.queue.pop_batch(queue, size).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(queue = %queue, error = %e, "Failed to pop batch");
                return PollOutcome::Unavailable;
            }
        };
        if jobs.is_empty() {
            return PollOutcome::Empty;
        }

        jobs.sort_by_key(|job| Reverse(job.priority()));
        let ids: Vec<&str> = jobs.iter().map(QueuedJob::id).collect();
        self.events.trigger(
            QUEUE_BATCH_POPPED,
            json!({ "queue": queue, "count": jobs.len(), "ids": ids }),
        );
        debug!(queue = %queue, count = jobs.len(), "Batch popped");

        let popped = jobs.len() as u64;
        let mut count = 0u64;
        let mut jobs = jobs.into_iter();
        for job in jobs.by_ref() {
            self.handle_job(job, queue).await;
            count += 1;
            if self.shared.stop.load(Ordering::SeqCst) {
                break;
            }
        }
        for job in jobs {
            // Reserved but never run: hand it straight back
            if let Err(e) = self.queue.release(&job, queue, 0).await {
                error!(job_id = %job.id(), queue = %queue, error = %e, "Failed to release job");
            }
        }
        if count < popped {
            info!(
                queue = %queue,
                handled = count,
                released = popped - count,
                "Batch cut short by stop"
            );
        }
        PollOutcome::Processed(count)
    }

    async fn handle_job(&mut self, mut job: QueuedJob, queue: &str) {
        self.apply_options(&mut job);

        if job.is_exhausted() {
            warn!(
                job_id = %job.id(),
                attempts = job.attempts(),
                max_attempts = job.max_attempts(),
                "Job popped with no attempts left"
            );
            let reason = format!(
                "Job {} has exhausted its {} attempts",
                job.name(),
                job.max_attempts()
            );
            self.processor.mark_as_failed(&mut job, &reason).await;
            self.shared.failed.fetch_add(1, Ordering::SeqCst);
            self.touch();
            return;
        }

        match self.processor.process(&mut job).await {
            Ok(result) => {
                self.processor.handle_success(&job, result.as_ref());
                if let Err(e) = self.queue.delete(&job, queue).await {
                    error!(job_id = %job.id(), error = %e, "Failed to delete completed job");
                }
                self.shared.processed.fetch_add(1, Ordering::SeqCst);
                self.recent.push_back(job.id().to_string());
                self.since_housekeeping += 1;
            }
            Err(e) => {
                self.shared.failed.fetch_add(1, Ordering::SeqCst);
                let outcome = self.processor.handle_failure(&mut job, &e).await;
                debug!(job_id = %job.id(), ?outcome, "Job attempt failed");
            }
        }
        self.touch();
    }

    /// Worker-wide limits that override what the job declares
    fn apply_options(&self, job: &mut QueuedJob) {
        if let Some(cap) = self.options.max_retries {
            if job.max_attempts() > cap {
                job.set_max_attempts(cap);
            }
        }
        if job.timeout() == 0 && self.options.timeout_seconds > 0 {
            job.set_timeout(self.options.timeout_seconds);
        }
    }

    fn touch(&self) {
        self.shared.last_job_at.store(to_millis(Utc::now()), Ordering::SeqCst);
        self.shared.refresh_memory();
    }

    fn housekeeping(&mut self) {
        while self.recent.len() > RECENT_CAPACITY {
            self.recent.pop_front();
        }
        self.since_housekeeping = 0;
        debug!(recent = self.recent.len(), "Worker housekeeping");
    }

    async fn idle_backoff(&self) {
        let cap = Duration::from_secs(self.options.sleep_secs);
        let delay = backoff_for(self.empty_cycles).min(cap);
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return;
        }

        debug!(
            empty_cycles = self.empty_cycles,
            secs = delay.as_secs(),
            "Queue idle, backing off"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shared.wake.notified() => {}
        }
    }

    fn memory_exceeded(&self) -> bool {
        let limit_mb = self.options.memory_limit_mb;
        if limit_mb == 0 {
            return false;
        }
        let current = self.shared.refresh_memory();
        let exceeded = current > limit_mb.saturating_mul(1024 * 1024);
        if exceeded {
            warn!(current_bytes = current, limit_mb, "Memory limit exceeded, stopping worker");
        }
        exceeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_tiers() {
        assert_eq!(backoff_for(0), Duration::ZERO);
        assert_eq!(backoff_for(2), Duration::ZERO);
        assert_eq!(backoff_for(3), Duration::from_secs(1));
        assert_eq!(backoff_for(9), Duration::from_secs(1));
        assert_eq!(backoff_for(10), Duration::from_secs(3));
        assert_eq!(backoff_for(29), Duration::from_secs(3));
        assert_eq!(backoff_for(30), Duration::from_secs(5));
        assert_eq!(backoff_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            WorkerState::Idle,
            WorkerState::Running,
            WorkerState::Paused,
            WorkerState::Stopping,
            WorkerState::Stopped,
        ] {
            assert_eq!(WorkerState::from_u8(state.as_u8()), state);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_memory_is_reported_on_linux() {
        assert!(resident_memory() > 0);
    }

    #[test]
    fn test_idle_status_before_start() {
        let shared = Shared::default();
        let status = shared.status();
        assert_eq!(status.state, WorkerState::Idle);
        assert_eq!(status.started_at, None);
        assert_eq!(status.uptime_secs, 0);
        assert_eq!(status.processed, 0);
    }
}
