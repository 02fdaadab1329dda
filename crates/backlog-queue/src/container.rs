//! Service resolution
//!
//! Dispatcher and Worker reach their collaborators through [`ServiceResolver`]
//! instead of global state. [`Container`] is the plain implementation used by
//! applications and tests; a host application's own DI layer can implement
//! the trait instead.

use std::fmt::Debug;
use std::sync::Arc;

use crate::backend::QueueBackend;
use crate::events::{EventSink, NoopEventSink};
use crate::job::DEFAULT_QUEUE;
use crate::processor::JobProcessor;

pub trait ServiceResolver: Send + Sync + Debug {
    /// Active queue backend, if one is configured
    fn queue(&self) -> Option<Arc<dyn QueueBackend>>;

    fn events(&self) -> Arc<dyn EventSink>;

    /// Processor wired to this resolver's queue and events
    fn processor(&self) -> Option<JobProcessor>;

    /// Queue used by `dispatch` when the caller names none
    fn default_queue(&self) -> &str {
        DEFAULT_QUEUE
    }
}

/// Shared queue services
#[derive(Debug, Clone)]
pub struct Container {
    queue: Option<Arc<dyn QueueBackend>>,
    events: Arc<dyn EventSink>,
    default_queue: String,
}

impl Default for Container {
    fn default() -> Self {
        Self {
            queue: None,
            events: Arc::new(NoopEventSink),
            default_queue: DEFAULT_QUEUE.to_string(),
        }
    }
}

impl Container {
    pub fn new(queue: Arc<dyn QueueBackend>, events: Arc<dyn EventSink>) -> Self {
        Self {
            queue: Some(queue),
            events,
            default_queue: DEFAULT_QUEUE.to_string(),
        }
    }

    /// Container with events only; every job has to run inline
    pub fn without_queue(events: Arc<dyn EventSink>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }
}

impl ServiceResolver for Container {
    fn queue(&self) -> Option<Arc<dyn QueueBackend>> {
        self.queue.clone()
    }

    fn events(&self) -> Arc<dyn EventSink> {
        self.events.clone()
    }

    fn processor(&self) -> Option<JobProcessor> {
        let processor = JobProcessor::new(self.events.clone());
        Some(match &self.queue {
            Some(queue) => processor.with_queue(queue.clone()),
            None => processor,
        })
    }

    fn default_queue(&self) -> &str {
        &self.default_queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::registry;
    use crate::memory::MemoryQueue;

    #[test]
    fn test_processor_shares_the_container_queue() {
        let queue: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(registry()));
        let container = Container::new(queue.clone(), Arc::new(NoopEventSink))
            .with_default_queue("mail");

        let processor = container.processor().unwrap();
        let resolved = processor.queue().unwrap();
        assert!(Arc::ptr_eq(resolved, &queue));
        assert_eq!(container.default_queue(), "mail");
    }

    #[test]
    fn test_container_without_queue_still_builds_a_processor() {
        let container = Container::without_queue(Arc::new(NoopEventSink));
        assert!(container.queue().is_none());
        assert!(container.processor().unwrap().queue().is_none());
        assert_eq!(container.default_queue(), DEFAULT_QUEUE);
    }
}
