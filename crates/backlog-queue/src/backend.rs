//! Queue Backend Trait
//!
//! Every backend honours the same visibility rule: a record can be popped
//! once `available_at <= now` and it is either unreserved or its reservation
//! is older than the backend's `retry_after`. Reservations are not durable;
//! a job held by a worker that died is delivered again (at-least-once).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::job::{JobId, JobSnapshot, QueuedJob};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Job not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),
    #[error("Invalid job: {0}")]
    Validation(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// A job that exhausted its attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    pub id: JobId,
    pub queue: String,
    pub job: JobSnapshot,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Point-in-time counters for one queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub name: String,
    pub driver: String,
    /// Records `pop` could return right now
    pub size: usize,
    pub pending: usize,
    pub reserved: usize,
    pub delayed: usize,
    pub failed: usize,
}

#[async_trait]
pub trait QueueBackend: Send + Sync + Debug {
    /// Driver name, e.g. "memory" or "sqlite"
    fn driver(&self) -> &str;

    /// Persist a job, available after `delay_secs`
    async fn push(
        &self,
        job: &QueuedJob,
        queue: &str,
        delay_secs: u64,
    ) -> Result<JobId, QueueError>;

    /// Reserve the next visible job, `None` when the queue is empty
    async fn pop(&self, queue: &str) -> Result<Option<QueuedJob>, QueueError>;

    /// Store the job's current state again and drop its reservation
    async fn release(
        &self,
        job: &QueuedJob,
        queue: &str,
        delay_secs: u64,
    ) -> Result<bool, QueueError>;

    /// Remove a reserved job for good
    async fn delete(&self, job: &QueuedJob, queue: &str) -> Result<bool, QueueError>;

    /// Move a reserved job into the failed store
    async fn fail(&self, job: &QueuedJob, queue: &str, reason: &str) -> Result<(), QueueError>;

    /// Number of pending jobs that are neither reserved nor delayed
    async fn size(&self, queue: &str) -> Result<usize, QueueError>;

    /// Remove every record of a queue, returning how many were removed
    async fn clear(&self, queue: &str) -> Result<usize, QueueError>;

    async fn bulk(
        &self,
        jobs: &[QueuedJob],
        queue: &str,
        delay_secs: u64,
    ) -> Result<Vec<JobId>, QueueError> {
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            ids.push(self.push(job, queue, delay_secs).await?);
        }
        Ok(ids)
    }

    /// Reserve up to `batch_size` jobs
    async fn pop_batch(
        &self,
        queue: &str,
        batch_size: usize,
    ) -> Result<Vec<QueuedJob>, QueueError> {
        let mut jobs = Vec::with_capacity(batch_size);
        while jobs.len() < batch_size {
            match self.pop(queue).await? {
                Some(job) => jobs.push(job),
                None => break,
            }
        }
        Ok(jobs)
    }

    /// Failed jobs of a queue, oldest failure first
    async fn failed(&self, queue: &str) -> Result<Vec<FailedJob>, QueueError>;

    /// Move a failed job back to pending with a fresh attempt budget.
    /// Returns false when no failed job has this id.
    async fn retry_failed(&self, id: &str) -> Result<bool, QueueError>;

    async fn forget_failed(&self, id: &str) -> Result<bool, QueueError>;

    /// Drop failed jobs of one queue, or of all queues when `queue` is `None`
    async fn flush_failed(&self, queue: Option<&str>) -> Result<usize, QueueError>;

    /// Liveness check; never errors
    async fn is_healthy(&self) -> bool;

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError>;
}

/// Snapshot to store for a job that is about to (re-)enter pending
pub fn snapshot_for(job: &QueuedJob, queue: &str) -> Result<JobSnapshot, QueueError> {
    let mut snapshot = job.serialize()?;
    snapshot.queue = queue.to_string();
    Ok(snapshot)
}

/// Snapshot of a failed job as it re-enters pending through `retry_failed`
pub fn revive(mut snapshot: JobSnapshot) -> JobSnapshot {
    snapshot.attempts = 0;
    snapshot
}
