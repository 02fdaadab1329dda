//! Lifecycle events
//!
//! The queue never logs or reports on its own; it emits named events to an
//! injected [`EventSink`]. Events for one job arrive in lifecycle order.

use serde_json::Value;
use std::fmt::Debug;
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const JOB_DISPATCHED: &str = "job.dispatched";
pub const JOB_BULK_DISPATCHED: &str = "job.bulk_dispatched";
pub const JOB_PROCESSING: &str = "job.processing";
pub const JOB_HANDLED: &str = "job.handled";
pub const JOB_COMPLETED: &str = "job.completed";
pub const JOB_FAILED: &str = "job.failed";
pub const JOB_RETRYING: &str = "job.retrying";
pub const JOB_RETRY_FAILED: &str = "job.retry_failed";
pub const QUEUE_JOB_PUSHED: &str = "queue.job.pushed";
pub const QUEUE_BATCH_POPPED: &str = "queue.batch_popped";
pub const WORKER_STARTED: &str = "worker.started";
pub const WORKER_STOPPED: &str = "worker.stopped";
pub const WORKER_PAUSED: &str = "worker.paused";
pub const WORKER_RESUMED: &str = "worker.resumed";

/// Listener for queue lifecycle events
pub trait EventSink: Send + Sync + Debug {
    fn trigger(&self, event: &str, payload: Value);
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn trigger(&self, _event: &str, _payload: Value) {}
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn trigger(&self, event: &str, payload: Value) {
        match event {
            JOB_FAILED | JOB_RETRY_FAILED => warn!(event, %payload, "queue event"),
            WORKER_STARTED | WORKER_STOPPED | WORKER_PAUSED | WORKER_RESUMED => {
                info!(event, %payload, "queue event")
            }
            _ => debug!(event, %payload, "queue event"),
        }
    }
}

/// Records events in memory (for testing)
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<(String, Value)>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        self.events().into_iter().map(|(name, _)| name).collect()
    }

    /// Payloads of every event with the given name, in emission order
    pub fn payloads(&self, event: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload)
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.payloads(event).len()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for MemoryEventSink {
    fn trigger(&self, event: &str, payload: Value) {
        if let Ok(mut events) = self.events.lock() {
            events.push((event.to_string(), payload));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemoryEventSink::new();
        sink.trigger(JOB_PROCESSING, json!({ "id": "a" }));
        sink.trigger(JOB_COMPLETED, json!({ "id": "a" }));
        sink.trigger(JOB_PROCESSING, json!({ "id": "b" }));

        assert_eq!(
            sink.names(),
            vec![JOB_PROCESSING, JOB_COMPLETED, JOB_PROCESSING]
        );
        assert_eq!(sink.count(JOB_PROCESSING), 2);
        assert_eq!(sink.payloads(JOB_COMPLETED), vec![json!({ "id": "a" })]);

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_tracing_sink_accepts_any_event() {
        let sink = TracingEventSink;
        sink.trigger(JOB_FAILED, json!({ "id": "x", "error": "boom" }));
        sink.trigger("custom.event", Value::Null);
    }
}
