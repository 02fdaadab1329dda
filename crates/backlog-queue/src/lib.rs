//! # Backlog Queue
//!
//! Background job queue with pluggable storage.
//!
//! Features:
//! - `Job` trait with per-job retry policy and backoff
//! - `QueueBackend` contract with an in-memory implementation
//! - `JobProcessor` for attempts, timeouts, retries and the failed store
//! - `Worker` run loop with adaptive idle backoff, batching and pause/resume
//! - `Dispatcher` for queued, delayed, bulk and inline dispatch

pub mod backend;
pub mod clock;
pub mod config;
pub mod container;
#[cfg(any(test, feature = "test-util"))]
pub mod contract;
pub mod dispatcher;
pub mod events;
pub mod job;
pub mod memory;
pub mod processor;
pub mod registry;
pub mod telemetry;
pub mod worker;

pub use backend::{FailedJob, QueueBackend, QueueError, QueueStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, Driver, QueueSettings, WorkerOptions};
pub use container::{Container, ServiceResolver};
pub use dispatcher::{DispatchError, Dispatcher};
pub use events::{EventSink, MemoryEventSink, NoopEventSink, TracingEventSink};
pub use job::{
    BackoffStrategy, Job, JobContext, JobError, JobId, JobPolicy, JobSnapshot, MetaValue,
    Metadata, QueuedJob, DEFAULT_QUEUE,
};
pub use memory::MemoryQueue;
pub use processor::{FailureOutcome, JobProcessor, ProcessorError};
pub use registry::JobRegistry;
pub use worker::{PollOutcome, Worker, WorkerHandle, WorkerState, WorkerStatus};
