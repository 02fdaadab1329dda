//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::QueueError;
use crate::registry::JobRegistry;

/// Job Identifier
pub type JobId = String;

/// Queue used when neither the job nor the caller names one
pub const DEFAULT_QUEUE: &str = "default";

/// Metadata key consulted for priority ordering
pub const PRIORITY_KEY: &str = "priority";

/// Error raised by a job handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// Failed but may be retried while attempts remain
    #[error("{0}")]
    Failed(String),
    /// Failed permanently, never retried
    #[error("{0}")]
    Fatal(String),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Retry backoff strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    Constant { secs: u64 },
    Linear { step_secs: u64 },
    Exponential { initial_secs: u64, multiplier: f64 },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Linear { step_secs: 5 }
    }
}

impl BackoffStrategy {
    /// Seconds to wait after the `attempts`-th failed attempt (1-indexed).
    pub fn delay_secs(&self, attempts: u32) -> u64 {
        let attempts = attempts.max(1);
        match *self {
            Self::Constant { secs } => secs,
            Self::Linear { step_secs } => step_secs.saturating_mul(u64::from(attempts)),
            Self::Exponential {
                initial_secs,
                multiplier,
            } => {
                let exponent = i32::try_from(attempts - 1).unwrap_or(i32::MAX);
                (initial_secs as f64 * multiplier.powi(exponent)) as u64
            }
        }
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        Duration::from_secs(self.delay_secs(attempts))
    }
}

/// Scheduling and retry policy carried with every queued job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPolicy {
    pub max_attempts: u32,
    /// 0 means unbounded
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub delay_secs: u64,
    /// Fixed retry delay; 0 defers to `next_retry_delay_secs` or the backoff
    #[serde(default)]
    pub retry_delay_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_secs: 0,
            delay_secs: 0,
            retry_delay_secs: 0,
            next_retry_delay_secs: None,
            backoff: BackoffStrategy::default(),
        }
    }
}

/// Restricted value type for job metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Map(BTreeMap<String, MetaValue>),
}

impl MetaValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for MetaValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for MetaValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u64> for MetaValue {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(Self::Float(value as f64), Self::Int)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<BTreeMap<String, MetaValue>> for MetaValue {
    fn from(value: BTreeMap<String, MetaValue>) -> Self {
        Self::Map(value)
    }
}

/// Open annotations that travel with a job
pub type Metadata = BTreeMap<String, MetaValue>;

fn priority_of(metadata: &Metadata) -> i64 {
    metadata
        .get(PRIORITY_KEY)
        .and_then(MetaValue::as_i64)
        .unwrap_or(0)
}

/// Execution context handed to [`Job::handle`]
///
/// The deadline is advisory for the handler; the processor enforces it by
/// dropping the handler future and cancelling the token.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub name: String,
    pub queue: String,
    pub attempt: u32,
    pub deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(
        job: &QueuedJob,
        deadline: Option<Instant>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job_id: job.id().to_string(),
            name: job.name().to_string(),
            queue: job.queue().to_string(),
            attempt: job.attempts(),
            deadline,
            cancellation,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Time left before the deadline, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Payload serialization for jobs, provided for every `Serialize` type
pub trait JobPayload {
    fn to_payload(&self) -> Result<Value, serde_json::Error>;
}

impl<T: Serialize> JobPayload for T {
    fn to_payload(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Generic Job Trait
///
/// The job's own fields are its payload. Policy hooks provide defaults for a
/// freshly created [`QueuedJob`]; once queued, the stored policy wins.
#[async_trait::async_trait]
pub trait Job: JobPayload + Send + Sync + Debug {
    /// Job type name, the key under which it is registered
    fn name(&self) -> &str;

    /// Execute the job
    async fn handle(&mut self, ctx: &JobContext) -> Result<Option<Value>, JobError>;

    /// Called once the job has exhausted its attempts
    async fn failed(&mut self, _reason: &str) {}

    fn queue(&self) -> &str {
        DEFAULT_QUEUE
    }

    fn max_attempts(&self) -> u32 {
        3
    }

    fn timeout_secs(&self) -> u64 {
        0
    }

    fn delay_secs(&self) -> u64 {
        0
    }

    fn retry_delay_secs(&self) -> u64 {
        0
    }

    fn backoff(&self) -> BackoffStrategy {
        BackoffStrategy::default()
    }
}

/// Serialized form of a queued job, stored by every backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: String,
    pub queue: String,
    pub payload: Value,
    pub attempts: u32,
    pub policy: JobPolicy,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn to_json(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, QueueError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn priority(&self) -> i64 {
        priority_of(&self.metadata)
    }
}

/// A job together with its identity and lifecycle state
#[derive(Debug)]
pub struct QueuedJob {
    id: JobId,
    name: String,
    queue: String,
    attempts: u32,
    policy: JobPolicy,
    metadata: Metadata,
    created_at: DateTime<Utc>,
    job: Box<dyn Job>,
}

impl QueuedJob {
    pub fn new<J: Job + 'static>(job: J) -> Self {
        Self::from_boxed(Box::new(job))
    }

    pub fn from_boxed(job: Box<dyn Job>) -> Self {
        let policy = JobPolicy {
            max_attempts: job.max_attempts().max(1),
            timeout_secs: job.timeout_secs(),
            delay_secs: job.delay_secs(),
            retry_delay_secs: job.retry_delay_secs(),
            next_retry_delay_secs: None,
            backoff: job.backoff(),
        };

        Self {
            id: Uuid::new_v4().to_string(),
            name: job.name().to_string(),
            queue: job.queue().to_string(),
            attempts: 0,
            policy,
            metadata: Metadata::new(),
            created_at: Utc::now(),
            job,
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_delay(mut self, secs: u64) -> Self {
        self.policy.delay_secs = secs;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.set_max_attempts(max_attempts);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.policy.timeout_secs = secs;
        self
    }

    pub fn with_retry_delay(mut self, secs: u64) -> Self {
        self.policy.retry_delay_secs = secs;
        self
    }

    pub fn with_next_retry_delay(mut self, secs: u64) -> Self {
        self.policy.next_retry_delay_secs = Some(secs);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.policy.backoff = backoff;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.add_metadata(PRIORITY_KEY, priority);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn set_queue(&mut self, queue: impl Into<String>) {
        self.queue = queue.into();
    }

    /// Current payload, re-serialized from the job's fields
    pub fn payload(&self) -> Result<Value, QueueError> {
        Ok(JobPayload::to_payload(self.job.as_ref())?)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Count a new execution attempt, returning the updated count
    pub fn increment_attempts(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    pub fn set_max_attempts(&mut self, max_attempts: u32) {
        self.policy.max_attempts = max_attempts.max(1);
    }

    /// No further attempt may run
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    pub fn delay(&self) -> u64 {
        self.policy.delay_secs
    }

    pub fn timeout(&self) -> u64 {
        self.policy.timeout_secs
    }

    pub fn set_timeout(&mut self, secs: u64) {
        self.policy.timeout_secs = secs;
    }

    pub fn retry_delay(&self) -> u64 {
        self.policy.retry_delay_secs
    }

    /// Delay before the next retry, from the explicit override or the backoff
    pub fn next_retry_delay(&self) -> u64 {
        self.policy
            .next_retry_delay_secs
            .unwrap_or_else(|| self.policy.backoff.delay_secs(self.attempts))
    }

    pub fn policy(&self) -> &JobPolicy {
        &self.policy
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn priority(&self) -> i64 {
        priority_of(&self.metadata)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn job(&self) -> &dyn Job {
        self.job.as_ref()
    }

    pub fn job_mut(&mut self) -> &mut dyn Job {
        self.job.as_mut()
    }

    /// Reject jobs no backend should accept
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.name.trim().is_empty() {
            return Err(QueueError::Validation(format!("job {} has no name", self.id)));
        }
        if self.queue.trim().is_empty() {
            return Err(QueueError::Validation(format!(
                "job {} ({}) has no queue",
                self.id, self.name
            )));
        }
        if self.policy.max_attempts == 0 {
            return Err(QueueError::Validation(format!(
                "job {} ({}) allows no attempts",
                self.id, self.name
            )));
        }
        Ok(())
    }

    pub fn serialize(&self) -> Result<JobSnapshot, QueueError> {
        Ok(JobSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            queue: self.queue.clone(),
            payload: self.payload()?,
            attempts: self.attempts,
            policy: self.policy.clone(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
        })
    }

    /// Rebuild a job from its snapshot through the registered factory
    pub fn unserialize(snapshot: JobSnapshot, registry: &JobRegistry) -> Result<Self, QueueError> {
        let job = registry.build(&snapshot.name, snapshot.payload)?;

        Ok(Self {
            id: snapshot.id,
            name: snapshot.name,
            queue: snapshot.queue,
            attempts: snapshot.attempts,
            policy: snapshot.policy,
            metadata: snapshot.metadata,
            created_at: snapshot.created_at,
            job,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Greet {
        who: String,
    }

    #[async_trait::async_trait]
    impl Job for Greet {
        fn name(&self) -> &str {
            "greet"
        }

        async fn handle(&mut self, _ctx: &JobContext) -> Result<Option<Value>, JobError> {
            Ok(Some(json!({ "greeting": format!("hello {}", self.who) })))
        }

        fn max_attempts(&self) -> u32 {
            4
        }

        fn backoff(&self) -> BackoffStrategy {
            BackoffStrategy::Exponential {
                initial_secs: 2,
                multiplier: 3.0,
            }
        }
    }

    fn registry() -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.register::<Greet>("greet");
        registry
    }

    #[test]
    fn test_new_job_takes_policy_from_hooks() {
        let job = QueuedJob::new(Greet { who: "ada".into() });

        assert_eq!(job.name(), "greet");
        assert_eq!(job.queue(), DEFAULT_QUEUE);
        assert_eq!(job.attempts(), 0);
        assert_eq!(job.max_attempts(), 4);
        assert_eq!(job.timeout(), 0);
        assert!(!job.id().is_empty());
        assert_eq!(job.payload().unwrap(), json!({ "who": "ada" }));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut job = QueuedJob::new(Greet { who: "grace".into() })
            .on_queue("mail")
            .with_delay(30)
            .with_timeout(12)
            .with_retry_delay(7)
            .with_next_retry_delay(9)
            .with_priority(5);
        job.increment_attempts();
        job.add_metadata("source", "api");
        job.add_metadata("ratio", 0.25);
        job.add_metadata("flag", true);

        let snapshot = job.serialize().unwrap();
        let raw = snapshot.to_json().unwrap();
        let decoded = JobSnapshot::from_json(&raw).unwrap();
        assert_eq!(decoded, snapshot);

        let restored = QueuedJob::unserialize(decoded, &registry()).unwrap();
        assert_eq!(restored.id(), job.id());
        assert_eq!(restored.name(), "greet");
        assert_eq!(restored.queue(), "mail");
        assert_eq!(restored.attempts(), 1);
        assert_eq!(restored.policy(), job.policy());
        assert_eq!(restored.metadata(), job.metadata());
        assert_eq!(restored.priority(), 5);
        assert_eq!(restored.created_at(), job.created_at());
        assert_eq!(restored.payload().unwrap(), job.payload().unwrap());
    }

    #[test]
    fn test_unserialize_unknown_type_fails() {
        let snapshot = QueuedJob::new(Greet { who: "x".into() })
            .serialize()
            .unwrap();
        let err = QueuedJob::unserialize(snapshot, &JobRegistry::new()).unwrap_err();
        assert!(matches!(err, QueueError::UnknownJobType(name) if name == "greet"));
    }

    #[test]
    fn test_increment_attempts_and_exhaustion() {
        let mut job = QueuedJob::new(Greet { who: "x".into() }).with_max_attempts(2);
        assert!(!job.is_exhausted());
        assert_eq!(job.increment_attempts(), 1);
        assert!(!job.is_exhausted());
        assert_eq!(job.increment_attempts(), 2);
        assert!(job.is_exhausted());
    }

    #[test]
    fn test_max_attempts_floor_is_one() {
        let job = QueuedJob::new(Greet { who: "x".into() }).with_max_attempts(0);
        assert_eq!(job.max_attempts(), 1);
    }

    #[test]
    fn test_next_retry_delay_uses_backoff_then_override() {
        let mut job = QueuedJob::new(Greet { who: "x".into() });
        job.increment_attempts();
        assert_eq!(job.next_retry_delay(), 2);
        job.increment_attempts();
        assert_eq!(job.next_retry_delay(), 6);

        let job = job.with_next_retry_delay(42);
        assert_eq!(job.next_retry_delay(), 42);
    }

    #[test]
    fn test_backoff_strategy_constant() {
        let strategy = BackoffStrategy::Constant { secs: 5 };
        assert_eq!(strategy.delay(0).as_secs(), 5);
        assert_eq!(strategy.delay(3).as_secs(), 5);
        assert_eq!(strategy.delay(10).as_secs(), 5);
    }

    #[test]
    fn test_backoff_strategy_linear() {
        let strategy = BackoffStrategy::Linear { step_secs: 5 };
        assert_eq!(strategy.delay_secs(1), 5);
        assert_eq!(strategy.delay_secs(2), 10);
        assert_eq!(strategy.delay_secs(3), 15);
    }

    #[test]
    fn test_backoff_strategy_exponential() {
        let strategy = BackoffStrategy::Exponential {
            initial_secs: 1,
            multiplier: 2.0,
        };
        assert_eq!(strategy.delay(1).as_secs(), 1); // 1 * 2^0
        assert_eq!(strategy.delay(2).as_secs(), 2); // 1 * 2^1
        assert_eq!(strategy.delay(3).as_secs(), 4); // 1 * 2^2
        assert_eq!(strategy.delay(4).as_secs(), 8); // 1 * 2^3
    }

    #[test]
    fn test_backoff_saturates_at_high_attempts() {
        let steep = BackoffStrategy::Exponential {
            initial_secs: 1,
            multiplier: 10.0,
        };
        assert_eq!(steep.delay_secs(17), 10_000_000_000_000_000);
        assert_eq!(steep.delay_secs(400), u64::MAX);
        assert_eq!(steep.delay_secs(u32::MAX), u64::MAX);

        let linear = BackoffStrategy::Linear {
            step_secs: u64::MAX,
        };
        assert_eq!(linear.delay_secs(3), u64::MAX);

        let mut job = QueuedJob::new(Greet { who: "x".into() })
            .with_max_attempts(1000)
            .with_backoff(steep);
        for _ in 0..400 {
            job.increment_attempts();
        }
        assert_eq!(job.next_retry_delay(), u64::MAX);
    }

    #[test]
    fn test_metadata_values_keep_their_kind() {
        let mut metadata = Metadata::new();
        metadata.insert("int".into(), MetaValue::from(3));
        metadata.insert("float".into(), MetaValue::from(2.0));
        metadata.insert("text".into(), MetaValue::from("x"));
        let mut nested = BTreeMap::new();
        nested.insert("inner".to_string(), MetaValue::from(false));
        metadata.insert("map".into(), MetaValue::from(nested));

        let raw = serde_json::to_string(&metadata).unwrap();
        let decoded: Metadata = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded, metadata);
        assert_eq!(decoded["float"], MetaValue::Float(2.0));
    }

    #[test]
    fn test_validate_rejects_blank_queue() {
        let job = QueuedJob::new(Greet { who: "x".into() }).on_queue("  ");
        assert!(matches!(job.validate(), Err(QueueError::Validation(_))));
    }
}
