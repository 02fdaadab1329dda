//! Producer-side entry point

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::QueueError;
use crate::container::ServiceResolver;
use crate::events::{JOB_BULK_DISPATCHED, JOB_DISPATCHED};
use crate::job::{JobId, QueuedJob, DEFAULT_QUEUE};
use crate::processor::ProcessorError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid dispatch: {0}")]
    Validation(String),
    #[error("No queue backend configured")]
    NoQueue,
    #[error("No job processor available")]
    NoProcessor,
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Processing(#[from] ProcessorError),
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    services: Arc<dyn ServiceResolver>,
}

impl Dispatcher {
    pub fn new(services: Arc<dyn ServiceResolver>) -> Self {
        Self { services }
    }

    /// Queue the job on its own queue, or on the default queue when the job
    /// does not name one
    pub async fn dispatch(&self, job: QueuedJob) -> Result<JobId, DispatchError> {
        let queue = self.queue_for(&job);
        self.dispatch_to_queue(job, &queue).await
    }

    pub async fn dispatch_to_queue(
        &self,
        job: QueuedJob,
        queue: &str,
    ) -> Result<JobId, DispatchError> {
        let delay = job.delay();
        self.push(job, queue, delay).await
    }

    /// Queue the job so it becomes available after `delay_secs`
    pub async fn dispatch_with_delay(
        &self,
        mut job: QueuedJob,
        delay_secs: u64,
    ) -> Result<JobId, DispatchError> {
        job.add_metadata("delay", delay_secs);
        let queue = self.queue_for(&job);
        self.push(job, &queue, delay_secs).await
    }

    /// Run the job inline, bypassing the queue. Processing errors are
    /// returned to the caller after the usual failure handling.
    pub async fn dispatch_now(&self, mut job: QueuedJob) -> Result<Option<Value>, DispatchError> {
        job.validate()?;
        let processor = self.services.processor().ok_or(DispatchError::NoProcessor)?;

        debug!(job_id = %job.id(), name = %job.name(), "Running job inline");
        match processor.process(&mut job).await {
            Ok(result) => {
                processor.handle_success(&job, result.as_ref());
                Ok(result)
            }
            Err(e) => {
                processor.handle_failure(&mut job, &e).await;
                Err(e.into())
            }
        }
    }

    /// Validate every job, then queue them all. Nothing is queued when any
    /// job is invalid.
    pub async fn dispatch_bulk(&self, jobs: Vec<QueuedJob>) -> Result<Vec<JobId>, DispatchError> {
        if jobs.is_empty() {
            return Err(DispatchError::Validation(
                "bulk dispatch needs at least one job".to_string(),
            ));
        }
        for (index, job) in jobs.iter().enumerate() {
            job.validate().map_err(|e| {
                DispatchError::Validation(format!("job at index {index} rejected: {e}"))
            })?;
        }

        let count = jobs.len();
        let mut ids = Vec::with_capacity(count);
        for job in jobs {
            ids.push(self.dispatch(job).await?);
        }

        self.services
            .events()
            .trigger(JOB_BULK_DISPATCHED, json!({ "count": count, "ids": ids }));
        info!(count, "Bulk dispatch complete");
        Ok(ids)
    }

    fn queue_for(&self, job: &QueuedJob) -> String {
        if job.queue() == DEFAULT_QUEUE {
            self.services.default_queue().to_string()
        } else {
            job.queue().to_string()
        }
    }

    async fn push(
        &self,
        mut job: QueuedJob,
        queue: &str,
        delay: u64,
    ) -> Result<JobId, DispatchError> {
        job.set_queue(queue);
        job.validate()?;
        let backend = self.services.queue().ok_or(DispatchError::NoQueue)?;

        let id = backend.push(&job, queue, delay).await?;
        self.services.events().trigger(
            JOB_DISPATCHED,
            json!({ "id": id, "name": job.name(), "queue": queue, "delay": delay }),
        );
        debug!(job_id = %id, name = %job.name(), queue = %queue, delay, "Job dispatched");
        Ok(id)
    }
}
