//! # Backlog Persist
//!
//! Durable queue backends for backlog.
//!
//! - `sqlite` (default feature): single-file or in-memory SQLite via sqlx
//! - `redis`: sorted sets and hashes, for workers spread over several hosts
//!
//! [`connect`] turns [`QueueSettings`] into a ready backend.

#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "redis")]
pub use self::redis::{RedisConfig, RedisQueue};
#[cfg(feature = "sqlite")]
pub use self::sqlite::{SqliteConfig, SqliteQueue};

use std::sync::Arc;
use tracing::info;

use backlog_queue::{
    Driver, EventSink, JobRegistry, MemoryQueue, QueueBackend, QueueError, QueueSettings,
};

/// Build the backend named by `settings.driver`
pub async fn connect(
    settings: &QueueSettings,
    registry: Arc<JobRegistry>,
    events: Arc<dyn EventSink>,
) -> Result<Arc<dyn QueueBackend>, QueueError> {
    settings
        .validate()
        .map_err(|e| QueueError::Configuration(e.to_string()))?;

    let backend: Arc<dyn QueueBackend> = match settings.driver {
        Driver::Memory => Arc::new(
            MemoryQueue::new(registry)
                .with_events(events)
                .with_retry_after(settings.retry_after_secs),
        ),
        Driver::Sqlite => sqlite_backend(settings, registry, events).await?,
        Driver::Redis => redis_backend(settings, registry, events).await?,
    };

    info!(driver = %settings.driver, "Queue backend ready");
    Ok(backend)
}

#[cfg(feature = "sqlite")]
async fn sqlite_backend(
    settings: &QueueSettings,
    registry: Arc<JobRegistry>,
    events: Arc<dyn EventSink>,
) -> Result<Arc<dyn QueueBackend>, QueueError> {
    let config = SqliteConfig::from_settings(settings)?;
    let queue = SqliteQueue::connect(config, registry).await?;
    Ok(Arc::new(queue.with_events(events)))
}

#[cfg(not(feature = "sqlite"))]
async fn sqlite_backend(
    _settings: &QueueSettings,
    _registry: Arc<JobRegistry>,
    _events: Arc<dyn EventSink>,
) -> Result<Arc<dyn QueueBackend>, QueueError> {
    Err(QueueError::Configuration(
        "sqlite driver requested but backlog-persist was built without the `sqlite` feature"
            .to_string(),
    ))
}

#[cfg(feature = "redis")]
async fn redis_backend(
    settings: &QueueSettings,
    registry: Arc<JobRegistry>,
    events: Arc<dyn EventSink>,
) -> Result<Arc<dyn QueueBackend>, QueueError> {
    let config = RedisConfig::from_settings(settings)?;
    let queue = RedisQueue::connect(config, registry).await?;
    Ok(Arc::new(queue.with_events(events)))
}

#[cfg(not(feature = "redis"))]
async fn redis_backend(
    _settings: &QueueSettings,
    _registry: Arc<JobRegistry>,
    _events: Arc<dyn EventSink>,
) -> Result<Arc<dyn QueueBackend>, QueueError> {
    Err(QueueError::Configuration(
        "redis driver requested but backlog-persist was built without the `redis` feature"
            .to_string(),
    ))
}
