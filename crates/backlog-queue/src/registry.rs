//! Job type registry
//!
//! Maps the stable name stored with every job to the factory that rebuilds
//! it. Populate it before handing it to a backend; it is read-only afterwards.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::backend::QueueError;
use crate::job::Job;

type JobFactory = Box<dyn Fn(Value) -> Result<Box<dyn Job>, serde_json::Error> + Send + Sync>;

#[derive(Default)]
pub struct JobRegistry {
    factories: HashMap<String, JobFactory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type that deserializes straight from its payload
    pub fn register<J: Job + DeserializeOwned + 'static>(&mut self, name: &str) -> &mut Self {
        let factory = Box::new(|payload: Value| {
            let job: J = serde_json::from_value(payload)?;
            Ok(Box::new(job) as Box<dyn Job>)
        });

        self.factories.insert(name.to_string(), factory);
        self
    }

    /// Register a custom factory (useful for jobs with dependency injection)
    pub fn register_factory<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(Value) -> Result<Box<dyn Job>, serde_json::Error> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn build(&self, name: &str, payload: Value) -> Result<Box<dyn Job>, QueueError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| QueueError::UnknownJobType(name.to_string()))?;
        Ok(factory(payload)?)
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobContext, JobError};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Debug, Serialize, Deserialize)]
    struct Resize {
        width: u32,
    }

    #[async_trait::async_trait]
    impl Job for Resize {
        fn name(&self) -> &str {
            "resize"
        }

        async fn handle(&mut self, _ctx: &JobContext) -> Result<Option<Value>, JobError> {
            Ok(None)
        }
    }

    #[derive(Debug, Serialize)]
    struct Notify {
        channel: String,
        #[serde(skip)]
        sent: Arc<std::sync::atomic::AtomicU32>,
    }

    #[async_trait::async_trait]
    impl Job for Notify {
        fn name(&self) -> &str {
            "notify"
        }

        async fn handle(&mut self, _ctx: &JobContext) -> Result<Option<Value>, JobError> {
            self.sent.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(None)
        }
    }

    #[test]
    fn test_build_registered_type() {
        let mut registry = JobRegistry::new();
        registry.register::<Resize>("resize");

        assert!(registry.contains("resize"));
        let job = registry.build("resize", json!({ "width": 640 })).unwrap();
        assert_eq!(job.name(), "resize");
    }

    #[test]
    fn test_unknown_type_is_reported() {
        let registry = JobRegistry::new();
        let err = registry.build("missing", json!({})).unwrap_err();
        assert!(matches!(err, QueueError::UnknownJobType(name) if name == "missing"));
    }

    #[test]
    fn test_bad_payload_is_serialization_error() {
        let mut registry = JobRegistry::new();
        registry.register::<Resize>("resize");
        let err = registry.build("resize", json!({ "width": "wide" })).unwrap_err();
        assert!(matches!(err, QueueError::Serialization(_)));
    }

    #[test]
    fn test_factory_injects_dependencies() {
        let sent = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let shared = sent.clone();

        let mut registry = JobRegistry::new();
        registry
            .register::<Resize>("resize")
            .register_factory("notify", move |payload| {
                let channel = payload["channel"].as_str().unwrap_or_default().to_string();
                Ok(Box::new(Notify {
                    channel,
                    sent: shared.clone(),
                }) as Box<dyn Job>)
            });

        assert_eq!(registry.names(), vec!["notify", "resize"]);
        let job = registry.build("notify", json!({ "channel": "ops" })).unwrap();
        assert_eq!(job.name(), "notify");
        assert_eq!(sent.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
