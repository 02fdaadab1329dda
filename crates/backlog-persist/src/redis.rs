//! Redis queue backend
//!
//! Keys for queue `q` under prefix `p`:
//!
//! | key                        | type   | content                                |
//! |----------------------------|--------|----------------------------------------|
//! | `p:queues:q:pending`       | zset   | visible ids, scored by rank            |
//! | `p:queues:q:delayed`       | zset   | delayed ids, scored by availability ms |
//! | `p:queues:q:reserved`      | zset   | reserved ids, scored by reservation ms |
//! | `p:queues:q:reserved:<id>` | string | marker, expires after `retry_after`    |
//! | `p:queues:q:jobs`          | hash   | id -> snapshot JSON                    |
//! | `p:queues:q:rank`          | hash   | id -> rank, kept across releases       |
//! | `p:queues:q:failed`        | hash   | id -> failed record JSON               |
//! | `p:failed`                 | hash   | id -> queue, for lookups by id         |
//!
//! A rank packs priority and push order into one exact score, so the lowest
//! score is the next job to run. `pop` moves the head of `pending` into
//! `reserved` inside one Lua script, so a job is never handed to two workers
//! at once. A reservation lapses when its marker key expires on the server.
//! `pop` only inspects reservations older than `retry_after`, oldest first,
//! and puts those without a marker back into `pending`. Delays and
//! reservation age are measured with the backend's [`Clock`].
//!
//! Marker keys are derived inside the scripts, so this backend expects a
//! single Redis node rather than a cluster.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use backlog_queue::backend::{revive, snapshot_for};
use backlog_queue::events::QUEUE_JOB_PUSHED;
use backlog_queue::{
    Clock, EventSink, FailedJob, JobId, JobRegistry, JobSnapshot, NoopEventSink, QueueBackend,
    QueueError, QueueSettings, QueueStats, QueuedJob, SystemClock,
};

/// Priorities beyond this magnitude share the outermost bucket
const PRIORITY_LIMIT: i64 = 1000;
/// Push-order slots per priority bucket; (2 * PRIORITY_LIMIT + 1) * RANK_SPAN < 2^53
const RANK_SPAN: i64 = 1 << 40;

// KEYS: pending, delayed, reserved, jobs, rank
// ARGV: id, snapshot, rank, available_at, now
const PUSH: &str = r#"
redis.call('DEL', KEYS[3] .. ':' .. ARGV[1])
local rank = redis.call('HGET', KEYS[5], ARGV[1])
if not rank then
    rank = ARGV[3]
    redis.call('HSET', KEYS[5], ARGV[1], rank)
end
redis.call('HSET', KEYS[4], ARGV[1], ARGV[2])
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
if tonumber(ARGV[4]) > tonumber(ARGV[5]) then
    redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
else
    redis.call('ZADD', KEYS[1], rank, ARGV[1])
end
return 1
"#;

// KEYS: pending, delayed, reserved, jobs, rank
// ARGV: now, retry_after_ms, reservation cutoff
const POP: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('ZADD', KEYS[1], redis.call('HGET', KEYS[5], id) or '0', id)
end
local stale = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[3])
for _, id in ipairs(stale) do
    if redis.call('EXISTS', KEYS[3] .. ':' .. id) == 0 then
        redis.call('ZREM', KEYS[3], id)
        redis.call('ZADD', KEYS[1], redis.call('HGET', KEYS[5], id) or '0', id)
    end
end
local head = redis.call('ZRANGE', KEYS[1], 0, 0)
if #head == 0 then
    return false
end
local id = head[1]
redis.call('ZREM', KEYS[1], id)
redis.call('ZADD', KEYS[3], ARGV[1], id)
redis.call('SET', KEYS[3] .. ':' .. id, ARGV[1], 'PX', ARGV[2])
return {id, redis.call('HGET', KEYS[4], id) or ''}
"#;

// KEYS: pending, delayed, reserved, jobs, rank
const CLEAR: &str = r#"
local count = redis.call('HLEN', KEYS[4])
for _, id in ipairs(redis.call('ZRANGE', KEYS[3], 0, -1)) do
    redis.call('DEL', KEYS[3] .. ':' .. id)
end
redis.call('DEL', KEYS[1], KEYS[2], KEYS[3], KEYS[4], KEYS[5])
return count
"#;

// KEYS: failed, failed index, jobs, pending, rank
// ARGV: id, snapshot, rank
const REQUEUE: &str = r#"
if redis.call('HDEL', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[5], ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[4], ARGV[3], ARGV[1])
return 1
"#;

// KEYS: failed, failed index
const FLUSH_FAILED: &str = r#"
local ids = redis.call('HKEYS', KEYS[1])
for _, id in ipairs(ids) do
    redis.call('HDEL', KEYS[2], id)
end
redis.call('DEL', KEYS[1])
return #ids
"#;

fn redis_err(e: redis::RedisError) -> QueueError {
    QueueError::Backend(e.to_string())
}

/// Score of a job in the pending set: higher priority first, then push order
fn rank(priority: i64, seq: i64) -> i64 {
    let bucket = PRIORITY_LIMIT - priority.clamp(-PRIORITY_LIMIT, PRIORITY_LIMIT);
    bucket * RANK_SPAN + seq.rem_euclid(RANK_SPAN)
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    /// Namespace for every key this backend touches
    pub prefix: String,
    pub retry_after_secs: u64,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            prefix: "backlog".to_string(),
            retry_after_secs: 60,
        }
    }

    pub fn from_settings(settings: &QueueSettings) -> Result<Self, QueueError> {
        let url = settings
            .url
            .clone()
            .ok_or_else(|| QueueError::Configuration("redis driver needs a url".into()))?;
        Ok(Self {
            url,
            prefix: settings.prefix.clone(),
            retry_after_secs: settings.retry_after_secs,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueKeys {
    pending: String,
    delayed: String,
    reserved: String,
    jobs: String,
    rank: String,
    failed: String,
}

impl QueueKeys {
    fn new(prefix: &str, queue: &str) -> Self {
        let base = format!("{prefix}:queues:{queue}");
        Self {
            pending: format!("{base}:pending"),
            delayed: format!("{base}:delayed"),
            reserved: format!("{base}:reserved"),
            jobs: format!("{base}:jobs"),
            rank: format!("{base}:rank"),
            failed: format!("{base}:failed"),
        }
    }

    fn marker(&self, id: &str) -> String {
        format!("{}:{id}", self.reserved)
    }
}

struct Scripts {
    push: Script,
    pop: Script,
    clear: Script,
    requeue: Script,
    flush_failed: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            push: Script::new(PUSH),
            pop: Script::new(POP),
            clear: Script::new(CLEAR),
            requeue: Script::new(REQUEUE),
            flush_failed: Script::new(FLUSH_FAILED),
        }
    }
}

/// Queue backend on Redis sorted sets and hashes
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    scripts: Arc<Scripts>,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    prefix: String,
    retry_after_ms: i64,
}

impl fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisQueue")
            .field("prefix", &self.prefix)
            .field("retry_after_ms", &self.retry_after_ms)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager, registry: Arc<JobRegistry>) -> Self {
        Self {
            conn,
            scripts: Arc::new(Scripts::load()),
            registry,
            clock: Arc::new(SystemClock),
            events: Arc::new(NoopEventSink),
            prefix: "backlog".to_string(),
            retry_after_ms: 60_000,
        }
    }

    pub async fn connect(
        config: RedisConfig,
        registry: Arc<JobRegistry>,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| QueueError::Configuration(e.to_string()))?;
        let conn = ConnectionManager::new(client).await.map_err(redis_err)?;

        info!(prefix = %config.prefix, "Connected to Redis queue");
        Ok(Self::new(conn, registry)
            .with_prefix(config.prefix)
            .with_retry_after(config.retry_after_secs))
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
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
        self.retry_after_ms = i64::try_from(secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        self
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        QueueKeys::new(&self.prefix, queue)
    }

    fn failed_index(&self) -> String {
        format!("{}:failed", self.prefix)
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    async fn next_rank(&self, priority: i64) -> Result<i64, QueueError> {
        let mut conn = self.conn.clone();
        let seq: i64 = redis::cmd("INCR")
            .arg(format!("{}:seq", self.prefix))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(rank(priority, seq))
    }

    async fn store(
        &self,
        snapshot: &JobSnapshot,
        queue: &str,
        delay_secs: u64,
    ) -> Result<(), QueueError> {
        let keys = self.keys(queue);
        let rank = self.next_rank(snapshot.priority()).await?;
        let now = self.now_ms();
        let delay_ms = i64::try_from(delay_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);

        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.push.prepare_invoke();
        invocation
            .key(&keys.pending)
            .key(&keys.delayed)
            .key(&keys.reserved)
            .key(&keys.jobs)
            .key(&keys.rank)
            .arg(&snapshot.id)
            .arg(snapshot.to_json()?)
            .arg(rank)
            .arg(now.saturating_add(delay_ms))
            .arg(now);
        let _: i64 = invocation.invoke_async(&mut conn).await.map_err(redis_err)?;
        Ok(())
    }

    /// Drop every trace of a record from the queue's live keys
    async fn remove(&self, keys: &QueueKeys, id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let (removed,): (i64,) = redis::pipe()
            .atomic()
            .zrem(&keys.pending, id)
            .ignore()
            .zrem(&keys.delayed, id)
            .ignore()
            .zrem(&keys.reserved, id)
            .ignore()
            .del(keys.marker(id))
            .ignore()
            .hdel(&keys.rank, id)
            .ignore()
            .hdel(&keys.jobs, id)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(removed > 0)
    }

    async fn move_to_failed(&self, record: FailedJob) -> Result<(), QueueError> {
        let entry = serde_json::to_string(&record)?;
        self.park_failed(&record.queue, &record.id, entry).await
    }

    /// Swap a live record for `entry` in the queue's failed hash
    async fn park_failed(&self, queue: &str, id: &str, entry: String) -> Result<(), QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(&keys.pending, id)
            .ignore()
            .zrem(&keys.delayed, id)
            .ignore()
            .zrem(&keys.reserved, id)
            .ignore()
            .del(keys.marker(id))
            .ignore()
            .hdel(&keys.rank, id)
            .ignore()
            .hdel(&keys.jobs, id)
            .ignore()
            .hset(&keys.failed, id, entry)
            .ignore()
            .hset(self.failed_index(), id, queue)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn flush_queue_failed(&self, queue: &str) -> Result<usize, QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.flush_failed.prepare_invoke();
        invocation.key(&keys.failed).key(self.failed_index());
        let flushed: usize = invocation.invoke_async(&mut conn).await.map_err(redis_err)?;
        Ok(flushed)
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    fn driver(&self) -> &str {
        "redis"
    }

    async fn push(
        &self,
        job: &QueuedJob,
        queue: &str,
        delay_secs: u64,
    ) -> Result<JobId, QueueError> {
        job.validate()?;
        let snapshot = snapshot_for(job, queue)?;
        self.store(&snapshot, queue, delay_secs).await?;

        debug!(job_id = %snapshot.id, queue = %queue, delay_secs, "Job pushed");
        self.events.trigger(
            QUEUE_JOB_PUSHED,
            json!({ "id": snapshot.id, "name": job.name(), "queue": queue, "delay": delay_secs }),
        );
        Ok(snapshot.id)
    }

    async fn pop(&self, queue: &str) -> Result<Option<QueuedJob>, QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();

        loop {
            let now = self.now_ms();
            let mut invocation = self.scripts.pop.prepare_invoke();
            invocation
                .key(&keys.pending)
                .key(&keys.delayed)
                .key(&keys.reserved)
                .key(&keys.jobs)
                .key(&keys.rank)
                .arg(now)
                .arg(self.retry_after_ms.max(1))
                .arg(now.saturating_sub(self.retry_after_ms));
            let reply: Option<(String, String)> =
                invocation.invoke_async(&mut conn).await.map_err(redis_err)?;

            let Some((id, raw)) = reply else {
                return Ok(None);
            };

            let snapshot = match JobSnapshot::from_json(&raw) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(
                        job_id = %id,
                        queue = %queue,
                        error = %e,
                        "Unreadable job record moved to failed store"
                    );
                    // Kept raw; `failed()` skips it, forget and flush remove it
                    let entry = json!({
                        "id": id,
                        "queue": queue,
                        "reason": e.to_string(),
                        "failed_at": self.clock.now(),
                        "payload": raw,
                    });
                    self.park_failed(queue, &id, entry.to_string()).await?;
                    continue;
                }
            };

            match QueuedJob::unserialize(snapshot.clone(), &self.registry) {
                Ok(job) => return Ok(Some(job)),
                Err(e) => {
                    warn!(
                        job_id = %id,
                        name = %snapshot.name,
                        error = %e,
                        "Undecodable job moved to failed store"
                    );
                    self.move_to_failed(FailedJob {
                        id,
                        queue: queue.to_string(),
                        job: snapshot,
                        reason: e.to_string(),
                        failed_at: self.clock.now(),
                    })
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
        self.store(&snapshot, queue, delay_secs).await?;
        debug!(job_id = %snapshot.id, queue = %queue, delay_secs, "Job released");
        Ok(true)
    }

    async fn delete(&self, job: &QueuedJob, queue: &str) -> Result<bool, QueueError> {
        self.remove(&self.keys(queue), job.id()).await
    }

    async fn fail(&self, job: &QueuedJob, queue: &str, reason: &str) -> Result<(), QueueError> {
        self.move_to_failed(FailedJob {
            id: job.id().to_string(),
            queue: queue.to_string(),
            job: snapshot_for(job, queue)?,
            reason: reason.to_string(),
            failed_at: self.clock.now(),
        })
        .await?;
        info!(job_id = %job.id(), queue = %queue, reason = %reason, "Job moved to failed store");
        Ok(())
    }

    async fn size(&self, queue: &str) -> Result<usize, QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let (pending, due): (usize, usize) = redis::pipe()
            .zcard(&keys.pending)
            .zcount(&keys.delayed, "-inf", self.now_ms())
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(pending + due)
    }

    async fn clear(&self, queue: &str) -> Result<usize, QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.clear.prepare_invoke();
        invocation
            .key(&keys.pending)
            .key(&keys.delayed)
            .key(&keys.reserved)
            .key(&keys.jobs)
            .key(&keys.rank);
        let cleared: usize = invocation.invoke_async(&mut conn).await.map_err(redis_err)?;
        Ok(cleared)
    }

    async fn failed(&self, queue: &str) -> Result<Vec<FailedJob>, QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("HVALS")
            .arg(&keys.failed)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let mut failed: Vec<FailedJob> = raw
            .iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Skipping unreadable failed job");
                    None
                }
            })
            .collect();
        failed.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then_with(|| a.id.cmp(&b.id)));
        Ok(failed)
    }

    async fn retry_failed(&self, id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let queue: Option<String> = redis::cmd("HGET")
            .arg(self.failed_index())
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        let Some(queue) = queue else {
            return Ok(false);
        };

        let keys = self.keys(&queue);
        let raw: Option<String> = redis::cmd("HGET")
            .arg(&keys.failed)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        let Some(raw) = raw else {
            return Ok(false);
        };

        let record: FailedJob = serde_json::from_str(&raw)?;
        let snapshot = revive(record.job);
        let rank = self.next_rank(snapshot.priority()).await?;

        // The HDEL inside the script is the guard against a double retry
        let mut invocation = self.scripts.requeue.prepare_invoke();
        invocation
            .key(&keys.failed)
            .key(self.failed_index())
            .key(&keys.jobs)
            .key(&keys.pending)
            .key(&keys.rank)
            .arg(id)
            .arg(snapshot.to_json()?)
            .arg(rank);
        let moved: i64 = invocation.invoke_async(&mut conn).await.map_err(redis_err)?;

        if moved == 1 {
            info!(job_id = %id, queue = %queue, "Failed job queued again");
        }
        Ok(moved == 1)
    }

    async fn forget_failed(&self, id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let queue: Option<String> = redis::cmd("HGET")
            .arg(self.failed_index())
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        let Some(queue) = queue else {
            return Ok(false);
        };

        let (removed, _): (i64, i64) = redis::pipe()
            .atomic()
            .hdel(self.keys(&queue).failed, id)
            .hdel(self.failed_index(), id)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(removed > 0)
    }

    async fn flush_failed(&self, queue: Option<&str>) -> Result<usize, QueueError> {
        if let Some(queue) = queue {
            return self.flush_queue_failed(queue).await;
        }

        let mut conn = self.conn.clone();
        let index: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.failed_index())
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let queues: BTreeSet<String> = index.into_values().collect();
        let mut flushed = 0;
        for queue in queues {
            flushed += self.flush_queue_failed(&queue).await?;
        }
        Ok(flushed)
    }

    async fn is_healthy(&self) -> bool {
        let mut conn = self.conn.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let keys = self.keys(queue);
        let now = self.now_ms();
        let mut conn = self.conn.clone();
        let (pending, due, reserved, delayed, failed): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .zcard(&keys.pending)
                .zcount(&keys.delayed, "-inf", now)
                .zcard(&keys.reserved)
                .zcount(&keys.delayed, format!("({now}"), "+inf")
                .hlen(&keys.failed)
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;

        let pending = pending + due;
        Ok(QueueStats {
            name: queue.to_string(),
            driver: self.driver().to_string(),
            size: pending,
            pending,
            reserved,
            delayed,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_orders_priority_then_push_order() {
        let mut ranks = vec![
            ("low", rank(1, 1)),
            ("high", rank(5, 2)),
            ("plain", rank(0, 3)),
            ("high-too", rank(5, 4)),
        ];
        ranks.sort_by_key(|(_, rank)| *rank);
        let order: Vec<&str> = ranks.iter().map(|(label, _)| *label).collect();
        assert_eq!(order, vec!["high", "high-too", "low", "plain"]);
    }

    #[test]
    fn test_rank_stays_exact_as_a_float_score() {
        let extremes = [
            rank(-PRIORITY_LIMIT, RANK_SPAN - 1),
            rank(i64::MIN, -1),
            rank(i64::MAX, i64::MAX),
        ];
        for value in extremes {
            assert!(value >= 0);
            assert!(value < 1 << 53);
            assert_eq!(value as f64 as i64, value);
        }
    }

    #[test]
    fn test_queue_keys() {
        let keys = QueueKeys::new("app", "mail");
        assert_eq!(keys.pending, "app:queues:mail:pending");
        assert_eq!(keys.reserved, "app:queues:mail:reserved");
        assert_eq!(keys.marker("42"), "app:queues:mail:reserved:42");
        assert_eq!(keys.failed, "app:queues:mail:failed");
    }

    #[test]
    fn test_config_from_settings() {
        let settings = QueueSettings {
            driver: backlog_queue::Driver::Redis,
            url: Some("redis://127.0.0.1/".into()),
            prefix: "jobs".into(),
            retry_after_secs: 45,
            ..QueueSettings::default()
        };
        let config = RedisConfig::from_settings(&settings).unwrap();
        assert_eq!(config.prefix, "jobs");
        assert_eq!(config.retry_after_secs, 45);

        let settings = QueueSettings { url: None, ..settings };
        assert!(matches!(
            RedisConfig::from_settings(&settings),
            Err(QueueError::Configuration(_))
        ));
    }
}
