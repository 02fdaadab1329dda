//! SQLite queue backend
//!
//! Jobs live in one `jobs` table. Visibility is carried by two epoch-second
//! columns: `available_at`, and `reserved_at` which is 0 while unreserved.
//! `pop` reserves with a single conditional `UPDATE ... RETURNING`. SQLite
//! runs it under its write lock, so two workers never hold the same row,
//! whether they share a pool or not. A reservation older than `retry_after`
//! is handed out again.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Executor, Row, Sqlite};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use backlog_queue::backend::{revive, snapshot_for};
use backlog_queue::events::QUEUE_JOB_PUSHED;
use backlog_queue::{
    Clock, EventSink, FailedJob, JobId, JobRegistry, JobSnapshot, NoopEventSink, QueueBackend,
    QueueError, QueueSettings, QueueStats, QueuedJob, SystemClock,
};

const UPSERT_JOB: &str = r#"
    INSERT INTO jobs (id, queue, name, payload, attempts, priority, reserved_at,
                      available_at, created_at)
    VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        queue = excluded.queue,
        name = excluded.name,
        payload = excluded.payload,
        attempts = excluded.attempts,
        priority = excluded.priority,
        reserved_at = 0,
        available_at = excluded.available_at
"#;

const RESERVE_NEXT: &str = r#"
    UPDATE jobs
    SET reserved_at = ?
    WHERE id = (
        SELECT id FROM jobs
        WHERE queue = ?
          AND available_at <= ?
          AND (reserved_at = 0 OR reserved_at < ?)
        ORDER BY priority DESC, created_at ASC, rowid ASC
        LIMIT 1
    )
    RETURNING id, payload
"#;

const UPSERT_FAILED: &str = r#"
    INSERT INTO failed_jobs (id, queue, payload, reason, failed_at)
    VALUES (?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        queue = excluded.queue,
        payload = excluded.payload,
        reason = excluded.reason,
        failed_at = excluded.failed_at
"#;

const COUNT_VISIBLE: &str = r#"
    SELECT COUNT(*) FROM jobs
    WHERE queue = ?
      AND available_at <= ?
      AND (reserved_at = 0 OR reserved_at < ?)
"#;

const QUEUE_COUNTS: &str = r#"
    SELECT
        COALESCE(SUM(CASE WHEN available_at <= ?
                           AND (reserved_at = 0 OR reserved_at < ?) THEN 1 ELSE 0 END), 0),
        COALESCE(SUM(CASE WHEN reserved_at != 0 AND reserved_at >= ? THEN 1 ELSE 0 END), 0),
        COALESCE(SUM(CASE WHEN reserved_at = 0 AND available_at > ? THEN 1 ELSE 0 END), 0)
    FROM jobs
    WHERE queue = ?
"#;

/// SQLite connection options
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:backlog.db?mode=rwc" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode so readers don't block the writer
    pub wal_mode: bool,
    pub busy_timeout_secs: u64,
    /// Visibility timeout for reserved jobs
    pub retry_after_secs: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:backlog.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
            retry_after_secs: 60,
        }
    }
}

impl SqliteConfig {
    /// In-memory database (testing). An in-memory database exists per
    /// connection, so the pool is pinned to a single one.
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
            ..Self::default()
        }
    }

    pub fn from_settings(settings: &QueueSettings) -> Result<Self, QueueError> {
        let url = settings
            .url
            .clone()
            .ok_or_else(|| QueueError::Configuration("sqlite driver needs a url".into()))?;

        let base = if is_memory_url(&url) {
            Self::memory()
        } else {
            Self {
                max_connections: settings.max_connections,
                ..Self::default()
            }
        };
        Ok(Self {
            url,
            retry_after_secs: settings.retry_after_secs,
            ..base
        })
    }

    fn is_memory(&self) -> bool {
        is_memory_url(&self.url)
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// Durable queue backend using SQLite
#[derive(Debug)]
pub struct SqliteQueue {
    pool: SqlitePool,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    retry_after: i64,
}

impl SqliteQueue {
    /// Wrap an existing pool. The schema must already exist, see [`migrate`](Self::migrate).
    pub fn new(pool: SqlitePool, registry: Arc<JobRegistry>) -> Self {
        Self {
            pool,
            registry,
            clock: Arc::new(SystemClock),
            events: Arc::new(NoopEventSink),
            retry_after: 60,
        }
    }

    /// Open the database and bring the schema up to date
    pub async fn connect(
        config: SqliteConfig,
        registry: Arc<JobRegistry>,
    ) -> Result<Self, QueueError> {
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| QueueError::Configuration(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

        if config.wal_mode && !config.is_memory() {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
        if config.is_memory() {
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        info!(
            url = %config.url,
            wal = config.wal_mode,
            max_connections = config.max_connections,
            "Connected to SQLite queue"
        );

        let queue = Self::new(pool, registry).with_retry_after(config.retry_after_secs);
        queue.migrate().await?;
        Ok(queue)
    }

    /// Create or upgrade the `jobs` and `failed_jobs` tables; safe to run repeatedly
    pub async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(format!("Migration failed: {e}")))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = i64::try_from(secs).unwrap_or(i64::MAX);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn now(&self) -> i64 {
        self.clock.now().timestamp()
    }

    /// Reservations taken before this are lapsed
    fn reservation_cutoff(&self, now: i64) -> i64 {
        now.saturating_sub(self.retry_after)
    }

    fn available_at(now: i64, delay_secs: u64) -> i64 {
        now.saturating_add(i64::try_from(delay_secs).unwrap_or(i64::MAX))
    }

    /// Remove a job record and store it in `failed_jobs`, in one transaction
    async fn move_to_failed(
        &self,
        id: &str,
        queue: &str,
        payload: String,
        reason: &str,
    ) -> Result<(), QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        sqlx::query(UPSERT_FAILED)
            .bind(id.to_string())
            .bind(queue.to_string())
            .bind(payload)
            .bind(reason.to_string())
            .bind(self.now())
            .execute(&mut *tx)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))
    }
}

async fn upsert<'e, E>(
    executor: E,
    snapshot: &JobSnapshot,
    available_at: i64,
    now: i64,
) -> Result<(), QueueError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let payload = snapshot.to_json()?;
    sqlx::query(UPSERT_JOB)
        .bind(snapshot.id.clone())
        .bind(snapshot.queue.clone())
        .bind(snapshot.name.clone())
        .bind(payload)
        .bind(i64::from(snapshot.attempts))
        .bind(snapshot.priority())
        .bind(available_at)
        .bind(now)
        .execute(executor)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;
    Ok(())
}

#[async_trait]
impl QueueBackend for SqliteQueue {
    fn driver(&self) -> &str {
        "sqlite"
    }

    async fn push(
        &self,
        job: &QueuedJob,
        queue: &str,
        delay_secs: u64,
    ) -> Result<JobId, QueueError> {
        job.validate()?;
        let snapshot = snapshot_for(job, queue)?;
        let now = self.now();
        upsert(&self.pool, &snapshot, Self::available_at(now, delay_secs), now).await?;

        debug!(job_id = %snapshot.id, queue = %queue, delay_secs, "Job pushed");
        self.events.trigger(
            QUEUE_JOB_PUSHED,
            json!({ "id": snapshot.id, "name": job.name(), "queue": queue, "delay": delay_secs }),
        );
        Ok(snapshot.id)
    }

    async fn pop(&self, queue: &str) -> Result<Option<QueuedJob>, QueueError> {
        loop {
            let now = self.now();
            let row = sqlx::query(RESERVE_NEXT)
                .bind(now)
                .bind(queue.to_string())
                .bind(now)
                .bind(self.reservation_cutoff(now))
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| QueueError::Backend(e.to_string()))?;

            let Some(row) = row else {
                return Ok(None);
            };

            let id: String = row
                .try_get("id")
                .map_err(|e| QueueError::Backend(e.to_string()))?;
            let payload: String = row
                .try_get("payload")
                .map_err(|e| QueueError::Backend(e.to_string()))?;

            let decoded = JobSnapshot::from_json(&payload)
                .and_then(|snapshot| QueuedJob::unserialize(snapshot, &self.registry));
            match decoded {
                Ok(job) => return Ok(Some(job)),
                Err(e) => {
                    warn!(
                        job_id = %id,
                        queue = %queue,
                        error = %e,
                        "Undecodable job moved to failed store"
                    );
                    self.move_to_failed(&id, queue, payload, &e.to_string())
                        .await?;
                }
            }
        }
    }

    async fn release(
        &self,
        job: &QueuedJob,
        queue: &str,
        delay_secs: u64,
    ) -> Result<bool, QueueError> {
        let snapshot = snapshot_for(job, queue)?;
        let now = self.now();
        upsert(&self.pool, &snapshot, Self::available_at(now, delay_secs), now).await?;
        debug!(job_id = %snapshot.id, queue = %queue, delay_secs, "Job released");
        Ok(true)
    }

    async fn delete(&self, job: &QueuedJob, queue: &str) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ? AND queue = ?")
            .bind(job.id().to_string())
            .bind(queue.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail(&self, job: &QueuedJob, queue: &str, reason: &str) -> Result<(), QueueError> {
        let payload = snapshot_for(job, queue)?.to_json()?;
        self.move_to_failed(job.id(), queue, payload, reason).await?;
        info!(job_id = %job.id(), queue = %queue, reason = %reason, "Job moved to failed store");
        Ok(())
    }

    async fn size(&self, queue: &str) -> Result<usize, QueueError> {
        let now = self.now();
        let count: i64 = sqlx::query_scalar(COUNT_VISIBLE)
            .bind(queue.to_string())
            .bind(now)
            .bind(self.reservation_cutoff(now))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(count.max(0) as usize)
    }

    async fn clear(&self, queue: &str) -> Result<usize, QueueError> {
        let result = sqlx::query("DELETE FROM jobs WHERE queue = ?")
            .bind(queue.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(result.rows_affected() as usize)
    }

    async fn failed(&self, queue: &str) -> Result<Vec<FailedJob>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT id, queue, payload, reason, failed_at
            FROM failed_jobs
            WHERE queue = ?
            ORDER BY failed_at ASC, rowid ASC
            "#,
        )
        .bind(queue.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        let mut failed = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row
                .try_get("id")
                .map_err(|e| QueueError::Backend(e.to_string()))?;
            let payload: String = row
                .try_get("payload")
                .map_err(|e| QueueError::Backend(e.to_string()))?;
            let failed_at: i64 = row
                .try_get("failed_at")
                .map_err(|e| QueueError::Backend(e.to_string()))?;

            let job = match JobSnapshot::from_json(&payload) {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Skipping unreadable failed job");
                    continue;
                }
            };

            failed.push(FailedJob {
                id,
                queue: row
                    .try_get("queue")
                    .map_err(|e| QueueError::Backend(e.to_string()))?,
                job,
                reason: row
                    .try_get("reason")
                    .map_err(|e| QueueError::Backend(e.to_string()))?,
                failed_at: Utc.timestamp_opt(failed_at, 0).single().unwrap_or_default(),
            });
        }
        Ok(failed)
    }

    async fn retry_failed(&self, id: &str) -> Result<bool, QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        // Deleting first makes a second retry of the same id a no-op
        let row = sqlx::query("DELETE FROM failed_jobs WHERE id = ? RETURNING payload")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        let Some(row) = row else {
            return Ok(false);
        };
        let payload: String = row
            .try_get("payload")
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        let snapshot = revive(JobSnapshot::from_json(&payload)?);
        let now = self.now();
        upsert(&mut *tx, &snapshot, now, now).await?;

        tx.commit()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        info!(job_id = %id, queue = %snapshot.queue, "Failed job queued again");
        Ok(true)
    }

    async fn forget_failed(&self, id: &str) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM failed_jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn flush_failed(&self, queue: Option<&str>) -> Result<usize, QueueError> {
        let query = match queue {
            Some(queue) => {
                sqlx::query("DELETE FROM failed_jobs WHERE queue = ?").bind(queue.to_string())
            }
            None => sqlx::query("DELETE FROM failed_jobs"),
        };
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(result.rows_affected() as usize)
    }

    async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let now = self.now();
        let cutoff = self.reservation_cutoff(now);
        let (pending, reserved, delayed): (i64, i64, i64) = sqlx::query_as(QUEUE_COUNTS)
            .bind(now)
            .bind(cutoff)
            .bind(cutoff)
            .bind(now)
            .bind(queue.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        let failed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM failed_jobs WHERE queue = ?")
            .bind(queue.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        let pending = pending.max(0) as usize;
        Ok(QueueStats {
            name: queue.to_string(),
            driver: self.driver().to_string(),
            size: pending,
            pending,
            reserved: reserved.max(0) as usize,
            delayed: delayed.max(0) as usize,
            failed: failed.max(0) as usize,
        })
    }
}
