//! Job Processor
//!
//! Runs one attempt of a job and decides what happens next: completion,
//! another attempt after a delay, or the failed store.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::QueueBackend;
use crate::events::{
    EventSink, JOB_COMPLETED, JOB_FAILED, JOB_HANDLED, JOB_PROCESSING, JOB_RETRYING,
    JOB_RETRY_FAILED,
};
use crate::job::{JobContext, JobError, QueuedJob};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    #[error("Job {job} failed: {message}")]
    Execution {
        job: String,
        message: String,
        fatal: bool,
    },
    #[error("Job {job} timed out after {secs}s")]
    Timeout { job: String, secs: u64 },
}

impl ProcessorError {
    /// Wrap a handler error with the name of the job that raised it
    pub fn execution(job: &str, err: JobError) -> Self {
        let fatal = err.is_fatal();
        let message = match err {
            JobError::Failed(message) | JobError::Fatal(message) => message,
        };
        Self::Execution {
            job: job.to_string(),
            message,
            fatal,
        }
    }

    /// Fatal errors skip the remaining attempts
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Execution { fatal: true, .. })
    }
}

/// What `handle_failure` did with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Released back to the queue for another attempt
    Retried,
    /// Release was not possible; the job stays reserved until its
    /// reservation expires
    RetryFailed,
    /// Moved to the failed store
    Failed,
}

#[derive(Debug, Clone)]
pub struct JobProcessor {
    queue: Option<Arc<dyn QueueBackend>>,
    events: Arc<dyn EventSink>,
}

impl JobProcessor {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            queue: None,
            events,
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn QueueBackend>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn queue(&self) -> Option<&Arc<dyn QueueBackend>> {
        self.queue.as_ref()
    }

    /// Execute one attempt of `job`.
    ///
    /// Increments the attempt counter exactly once, then runs the handler
    /// under the job's timeout. On expiry the handler future is dropped and
    /// its cancellation token fired.
    pub async fn process(&self, job: &mut QueuedJob) -> Result<Option<Value>, ProcessorError> {
        let attempt = job.increment_attempts();
        let name = job.name().to_string();
        self.events.trigger(
            JOB_PROCESSING,
            json!({
                "id": job.id(),
                "name": name,
                "queue": job.queue(),
                "attempt": attempt,
                "max_attempts": job.max_attempts(),
            }),
        );
        debug!(job_id = %job.id(), name = %name, attempt, "Processing job");

        let timeout_secs = job.timeout();
        let token = CancellationToken::new();
        // A timeout too far out to represent runs unbounded
        let deadline = (timeout_secs > 0)
            .then(|| Instant::now().checked_add(Duration::from_secs(timeout_secs)))
            .flatten();
        let ctx = JobContext::new(job, deadline, token.clone());

        let outcome = if let Some(deadline) = deadline {
            match tokio::time::timeout_at(deadline, job.job_mut().handle(&ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    token.cancel();
                    warn!(job_id = %ctx.job_id, name = %name, timeout_secs, "Job timed out");
                    return Err(ProcessorError::Timeout {
                        job: name,
                        secs: timeout_secs,
                    });
                }
            }
        } else {
            job.job_mut().handle(&ctx).await
        };

        let result = outcome.map_err(|e| ProcessorError::execution(&name, e))?;
        self.events.trigger(
            JOB_HANDLED,
            json!({ "id": job.id(), "name": name, "attempt": attempt }),
        );
        Ok(result)
    }

    /// Mark a processed job completed. Deleting it from the backend is the
    /// caller's job.
    pub fn handle_success(&self, job: &QueuedJob, result: Option<&Value>) {
        self.events.trigger(
            JOB_COMPLETED,
            json!({
                "id": job.id(),
                "name": job.name(),
                "queue": job.queue(),
                "attempts": job.attempts(),
                "result": result,
            }),
        );
        info!(
            job_id = %job.id(),
            name = %job.name(),
            attempts = job.attempts(),
            "Job completed"
        );
    }

    pub async fn handle_failure(
        &self,
        job: &mut QueuedJob,
        error: &ProcessorError,
    ) -> FailureOutcome {
        let reason = error.to_string();
        job.add_metadata("last_error", reason.as_str());

        if error.is_fatal() || job.is_exhausted() {
            self.mark_as_failed(job, &reason).await;
            return FailureOutcome::Failed;
        }

        let delay = job.retry_delay();
        if self.retry(job, delay).await {
            FailureOutcome::Retried
        } else {
            FailureOutcome::RetryFailed
        }
    }

    /// Terminal failure: emit the event, run the job's `failed` hook and
    /// move it to the failed store
    pub async fn mark_as_failed(&self, job: &mut QueuedJob, reason: &str) {
        self.events.trigger(
            JOB_FAILED,
            json!({
                "id": job.id(),
                "name": job.name(),
                "queue": job.queue(),
                "attempts": job.attempts(),
                "error": reason,
            }),
        );
        warn!(
            job_id = %job.id(),
            name = %job.name(),
            attempts = job.attempts(),
            error = %reason,
            "Job failed permanently"
        );

        job.job_mut().failed(reason).await;

        if let Some(queue) = &self.queue {
            let queue_name = job.queue().to_string();
            if let Err(e) = queue.fail(job, &queue_name, reason).await {
                error!(job_id = %job.id(), error = %e, "Failed to record job in failed store");
            }
        }
    }

    /// Release `job` for another attempt. A zero `delay` falls back to the
    /// job's next retry delay. Never errors; returns false when the job
    /// could not be released.
    pub async fn retry(&self, job: &QueuedJob, delay: u64) -> bool {
        let effective = if delay > 0 {
            delay
        } else {
            job.next_retry_delay()
        };

        let Some(queue) = &self.queue else {
            self.retry_failed(job, effective, "no queue backend available");
            return false;
        };

        match queue.release(job, job.queue(), effective).await {
            Ok(true) => {
                self.events.trigger(
                    JOB_RETRYING,
                    json!({
                        "id": job.id(),
                        "name": job.name(),
                        "queue": job.queue(),
                        "attempts": job.attempts(),
                        "delay": effective,
                    }),
                );
                info!(
                    job_id = %job.id(),
                    attempt = job.attempts(),
                    delay_secs = effective,
                    "Job scheduled for retry"
                );
                true
            }
            Ok(false) => {
                self.retry_failed(job, effective, "release was rejected");
                false
            }
            Err(e) => {
                self.retry_failed(job, effective, &e.to_string());
                false
            }
        }
    }

    fn retry_failed(&self, job: &QueuedJob, delay: u64, reason: &str) {
        warn!(job_id = %job.id(), error = %reason, "Job retry failed");
        self.events.trigger(
            JOB_RETRY_FAILED,
            json!({
                "id": job.id(),
                "name": job.name(),
                "queue": job.queue(),
                "delay": delay,
                "error": reason,
            }),
        );
    }
}
