//! Redis-backed durable queue (§4.5 Queue Producer, §4.6 Reliable Processor
//! consumer side). Keys are scoped under the configured queue name:
//!
//! - `{queue}:job:{jobId}` — the job's JSON envelope (payload + attempts + priority)
//! - `{queue}:pending` — sorted set of ready job ids, scored `priority * 1e13 + seq`
//!   so pop-minimum yields highest priority first, FIFO within a priority tier
//! - `{queue}:delayed` — sorted set of deferred job ids, scored by `availableAt` (ms)
//! - `{queue}:active:{jobId}` — hash `{leaseUntil, attempts}` while a worker holds the job
//! - `{queue}:active_count` — counter mirroring the active hash population
//! - `{queue}:active_ids` — set mirroring which job ids currently have an
//!   active hash, so [`RedisJobQueue::reclaim_expired`] can find lease-expiry
//!   candidates with `SMEMBERS` instead of a blocking `KEYS`/`SCAN` pattern
//!   match
//! - `{queue}:dlq` — list of dead-lettered job ids
//! - `{queue}:dlq:record:{jobId}` — the dead-lettered job plus its failure chain
//! - `{queue}:dedup` — hash mapping a deduplication key to the job id currently
//!   occupying it (removed once that job reaches a terminal state)
//! - `{queue}:seq` — monotonic counter used to break priority ties FIFO

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::audit::event::AuditEvent;
use crate::error::Result;
use crate::jobs::types::{FailureRecord, JobId, LeasedJob, Priority, QueueJob, QueueStats};
use crate::Error;

/// The durable queue's full surface: producer-side enqueue plus the
/// consumer-side lease/ack/requeue/dead-letter operations a
/// [`crate::jobs::executor::ReliableProcessor`] drives.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        payload: AuditEvent,
        priority: Priority,
        delay_ms: u64,
        dedup_key: Option<String>,
    ) -> Result<JobId>;

    async fn dequeue(&self, lease_ms: u64) -> Result<Option<LeasedJob>>;
    async fn ack(&self, job_id: &JobId) -> Result<()>;
    async fn requeue(&self, job_id: &JobId, delay_ms: u64) -> Result<()>;
    async fn dead_letter(&self, leased: &LeasedJob, failure_chain: Vec<FailureRecord>) -> Result<()>;
    async fn stats(&self) -> Result<QueueStats>;
}

/// Thin producer-facing wrapper over a [`JobQueue`], matching §4.5's narrow
/// "submit an event, get a job id" contract used by [`crate::audit::producer::AuditProducer`].
pub struct QueueProducer {
    queue: std::sync::Arc<dyn JobQueue>,
}

impl QueueProducer {
    pub fn new(queue: std::sync::Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    pub async fn submit(
        &self,
        payload: AuditEvent,
        priority: Priority,
        delay_ms: u64,
        dedup_key: Option<String>,
    ) -> Result<JobId> {
        self.queue.enqueue(payload, priority, delay_ms, dedup_key).await
    }
}

fn job_key(queue_name: &str, job_id: &JobId) -> String {
    format!("{}:job:{}", queue_name, job_id.as_str())
}
fn pending_key(queue_name: &str) -> String {
    format!("{}:pending", queue_name)
}
fn delayed_key(queue_name: &str) -> String {
    format!("{}:delayed", queue_name)
}
fn active_key(queue_name: &str, job_id: &JobId) -> String {
    format!("{}:active:{}", queue_name, job_id.as_str())
}
fn dlq_key(queue_name: &str) -> String {
    format!("{}:dlq", queue_name)
}
fn active_ids_key(queue_name: &str) -> String {
    format!("{}:active_ids", queue_name)
}

/// Sorting score for the pending set: integer priority dominates, sequence
/// number breaks ties FIFO within a priority tier (lower priority value
/// dequeues first; `zpopmin` pops the smallest score).
fn priority_score(priority: Priority, seq: i64) -> f64 {
    (priority.0 as f64) * 1e13 + seq as f64
}

pub struct RedisJobQueue {
    redis: ConnectionManager,
    queue_name: String,
}

impl RedisJobQueue {
    pub fn new(redis: ConnectionManager, queue_name: impl Into<String>) -> Self {
        Self {
            redis,
            queue_name: queue_name.into(),
        }
    }

    fn job_key(&self, job_id: &JobId) -> String {
        job_key(&self.queue_name, job_id)
    }
    fn pending_key(&self) -> String {
        pending_key(&self.queue_name)
    }
    fn delayed_key(&self) -> String {
        delayed_key(&self.queue_name)
    }
    fn active_key(&self, job_id: &JobId) -> String {
        active_key(&self.queue_name, job_id)
    }
    fn active_count_key(&self) -> String {
        format!("{}:active_count", self.queue_name)
    }
    fn dlq_key(&self) -> String {
        dlq_key(&self.queue_name)
    }
    fn active_ids_key(&self) -> String {
        active_ids_key(&self.queue_name)
    }
    fn dlq_record_key(&self, job_id: &JobId) -> String {
        format!("{}:dlq:record:{}", self.queue_name, job_id.as_str())
    }
    /// Sorted set of dead-letter arrival timestamps (ms), scored by
    /// themselves so `zcount` over a trailing window gives the arrival
    /// rate the Dead-Letter Handler's alert hook polls.
    fn dlq_arrivals_key(&self) -> String {
        format!("{}:dlq:arrivals", self.queue_name)
    }
    fn dedup_key(&self) -> String {
        format!("{}:dedup", self.queue_name)
    }
    fn seq_key(&self) -> String {
        format!("{}:seq", self.queue_name)
    }

    async fn store_job(&self, job: &QueueJob) -> Result<()> {
        let mut conn = self.redis.clone();
        let json = serde_json::to_string(job)?;
        conn.set::<_, _, ()>(self.job_key(&job.job_id), json).await?;
        Ok(())
    }

    async fn load_job(&self, job_id: &JobId) -> Result<Option<QueueJob>> {
        let mut conn = self.redis.clone();
        let json: Option<String> = conn.get(self.job_key(job_id)).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn push_ready(&self, job: &QueueJob) -> Result<()> {
        let mut conn = self.redis.clone();
        let seq: i64 = conn.incr(self.seq_key(), 1).await?;
        let score = priority_score(job.priority, seq);
        conn.zadd::<_, _, _, ()>(self.pending_key(), job.job_id.as_str(), score).await?;
        Ok(())
    }

    /// Moves every delayed job whose `available_at` has passed onto the
    /// pending set. Run at the top of every `dequeue` so a single poller
    /// loop is enough to drive delayed-job promotion.
    async fn promote_delayed(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        let now = Utc::now().timestamp_millis();
        let ready: Vec<String> = conn.zrangebyscore_limit(self.delayed_key(), 0, now, 0, 500).await?;

        for job_id_str in ready {
            let job_id = JobId(job_id_str);
            let _: i64 = conn.zrem(self.delayed_key(), job_id.as_str()).await?;
            if let Some(job) = self.load_job(&job_id).await? {
                self.push_ready(&job).await?;
            }
        }
        Ok(())
    }

    /// Removes `dedup_key`'s entry from the dedup index, but only if it
    /// still points at `job_id` — guards against a newer job having since
    /// claimed the same key.
    async fn release_dedup(&self, dedup_key: &str, job_id: &JobId) -> Result<()> {
        let mut conn = self.redis.clone();
        let current: Option<String> = conn.hget(self.dedup_key(), dedup_key).await?;
        if current.as_deref() == Some(job_id.as_str()) {
            let _: i64 = conn.hdel(self.dedup_key(), dedup_key).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(
        &self,
        payload: AuditEvent,
        priority: Priority,
        delay_ms: u64,
        dedup_key: Option<String>,
    ) -> Result<JobId> {
        let mut conn = self.redis.clone();

        if let Some(key) = &dedup_key {
            let existing: Option<String> = conn.hget(self.dedup_key(), key).await?;
            if let Some(existing_id) = existing {
                return Ok(JobId(existing_id));
            }
        }

        let now = Utc::now();
        let available_at = now + chrono::Duration::milliseconds(delay_ms as i64);
        let dedup_key = dedup_key.unwrap_or_else(|| payload.hash.clone().unwrap_or_default());
        let job = QueueJob::new(payload, priority, dedup_key.clone(), available_at);

        self.store_job(&job).await?;

        if delay_ms > 0 {
            let mut conn = self.redis.clone();
            conn.zadd::<_, _, _, ()>(self.delayed_key(), job.job_id.as_str(), available_at.timestamp_millis())
                .await?;
        } else {
            self.push_ready(&job).await?;
        }

        if !dedup_key.is_empty() {
            let mut conn = self.redis.clone();
            conn.hset::<_, _, _, ()>(self.dedup_key(), &dedup_key, job.job_id.as_str()).await?;
        }

        tracing::debug!(job_id = %job.job_id, "enqueued audit job");
        Ok(job.job_id)
    }

    async fn dequeue(&self, lease_ms: u64) -> Result<Option<LeasedJob>> {
        self.promote_delayed().await?;

        let mut conn = self.redis.clone();
        let popped: Vec<(String, f64)> = conn.zpopmin(self.pending_key(), 1).await?;
        let Some((job_id_str, _score)) = popped.into_iter().next() else {
            return Ok(None);
        };
        let job_id = JobId(job_id_str);

        let Some(job) = self.load_job(&job_id).await? else {
            return Ok(None);
        };

        let lease_until = Utc::now() + chrono::Duration::milliseconds(lease_ms as i64);
        let _: () = conn
            .hset_multiple(
                self.active_key(&job_id),
                &[
                    ("lease_until", lease_until.timestamp_millis().to_string()),
                    ("attempts", job.attempts.to_string()),
                ],
            )
            .await?;
        let _: i64 = conn.incr(self.active_count_key(), 1).await?;
        let _: i64 = conn.sadd(self.active_ids_key(), job_id.as_str()).await?;

        Ok(Some(LeasedJob { job, lease_until }))
    }

    async fn ack(&self, job_id: &JobId) -> Result<()> {
        let mut conn = self.redis.clone();
        if let Some(job) = self.load_job(job_id).await? {
            self.release_dedup(&job.dedup_key, job_id).await?;
        }
        let removed: i64 = conn.del(self.active_key(job_id)).await?;
        if removed > 0 {
            let _: i64 = conn.decr(self.active_count_key(), 1).await?;
        }
        let _: i64 = conn.srem(self.active_ids_key(), job_id.as_str()).await?;
        let _: i64 = conn.del(self.job_key(job_id)).await?;
        Ok(())
    }

    async fn requeue(&self, job_id: &JobId, delay_ms: u64) -> Result<()> {
        let mut conn = self.redis.clone();
        let mut job = self
            .load_job(job_id)
            .await?
            .ok_or_else(|| Error::queue(format!("cannot requeue unknown job {}", job_id)))?;

        job.attempts += 1;
        let available_at = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
        job.available_at = available_at;
        self.store_job(&job).await?;

        let removed: i64 = conn.del(self.active_key(job_id)).await?;
        if removed > 0 {
            let _: i64 = conn.decr(self.active_count_key(), 1).await?;
        }
        let _: i64 = conn.srem(self.active_ids_key(), job_id.as_str()).await?;

        if delay_ms > 0 {
            conn.zadd::<_, _, _, ()>(self.delayed_key(), job_id.as_str(), available_at.timestamp_millis())
                .await?;
        } else {
            self.push_ready(&job).await?;
        }
        Ok(())
    }

    async fn dead_letter(&self, leased: &LeasedJob, failure_chain: Vec<FailureRecord>) -> Result<()> {
        let mut conn = self.redis.clone();
        let job_id = &leased.job.job_id;

        self.release_dedup(&leased.job.dedup_key, job_id).await?;

        let removed: i64 = conn.del(self.active_key(job_id)).await?;
        if removed > 0 {
            let _: i64 = conn.decr(self.active_count_key(), 1).await?;
        }
        let _: i64 = conn.srem(self.active_ids_key(), job_id.as_str()).await?;

        #[derive(serde::Serialize)]
        struct DeadLetterRecord<'a> {
            job: &'a QueueJob,
            failure_chain: &'a [FailureRecord],
            dead_lettered_at: DateTime<Utc>,
        }

        let record = DeadLetterRecord {
            job: &leased.job,
            failure_chain: &failure_chain,
            dead_lettered_at: Utc::now(),
        };
        let json = serde_json::to_string(&record)?;
        conn.set::<_, _, ()>(self.dlq_record_key(job_id), json).await?;
        conn.lpush::<_, _, ()>(self.dlq_key(), job_id.as_str()).await?;
        let _: i64 = conn.del(self.job_key(job_id)).await?;

        let now_ms = Utc::now().timestamp_millis();
        conn.zadd::<_, _, _, ()>(self.dlq_arrivals_key(), job_id.as_str(), now_ms).await?;

        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.redis.clone();
        let pending: u64 = conn.zcard(self.pending_key()).await?;
        let delayed: u64 = conn.zcard(self.delayed_key()).await?;
        let active: u64 = conn.get(self.active_count_key()).await.unwrap_or(0);
        let dead_lettered: u64 = conn.llen(self.dlq_key()).await?;

        Ok(QueueStats {
            pending,
            delayed,
            active,
            dead_lettered,
        })
    }
}

impl RedisJobQueue {
    /// Scans `{queue}:active_ids` for jobs whose lease has expired and moves
    /// each one back onto the pending set with `attempts` incremented,
    /// fulfilling §4.6's "a crashed/stalled worker's job is reprocessed by
    /// another worker via lease expiry" guarantee. Returns the number of
    /// jobs reclaimed. Intended to run on a periodic schedule via
    /// [`Self::spawn_reclaim_watch`], never from the hot dequeue path.
    pub async fn reclaim_expired(&self) -> Result<u64> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.smembers(self.active_ids_key()).await?;
        let now = Utc::now().timestamp_millis();
        let mut reclaimed = 0u64;

        for id in ids {
            let job_id = JobId(id);
            let active_key = self.active_key(&job_id);
            let lease_until: Option<String> = conn.hget(&active_key, "lease_until").await?;

            let Some(lease_until) = lease_until else {
                // Active hash already gone (acked/requeued/dead-lettered
                // through the normal path); just drop the stale index entry.
                let _: i64 = conn.srem(self.active_ids_key(), job_id.as_str()).await?;
                continue;
            };

            let lease_until_ms: i64 = lease_until.parse().unwrap_or(0);
            if lease_until_ms > now {
                continue;
            }

            if let Some(mut job) = self.load_job(&job_id).await? {
                job.attempts += 1;
                job.available_at = Utc::now();
                self.store_job(&job).await?;
                self.push_ready(&job).await?;
            }

            let _: i64 = conn.del(&active_key).await?;
            let _: i64 = conn.decr(self.active_count_key(), 1).await?;
            let _: i64 = conn.srem(self.active_ids_key(), job_id.as_str()).await?;

            tracing::warn!(job_id = %job_id, "reclaimed job with expired lease");
            reclaimed += 1;
        }

        Ok(reclaimed)
    }

    /// Runs [`Self::reclaim_expired`] on a fixed interval until the returned
    /// task is aborted by dropping its handle — the same periodic-task shape
    /// as [`crate::monitoring::alerting_service::AlertingService::spawn_dead_letter_watch`]
    /// and [`crate::telemetry::tracer::Tracer::spawn_periodic_flush`].
    pub fn spawn_reclaim_watch(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match self.reclaim_expired().await {
                    Ok(count) if count > 0 => tracing::info!(count, "reclaimed expired leases"),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "lease reclaim sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_under_the_queue_name() {
        let job_id = JobId("abc-123".to_string());

        assert_eq!(job_key("audit-events", &job_id), "audit-events:job:abc-123");
        assert_eq!(pending_key("audit-events"), "audit-events:pending");
        assert_eq!(delayed_key("audit-events"), "audit-events:delayed");
        assert_eq!(active_key("audit-events", &job_id), "audit-events:active:abc-123");
        assert_eq!(dlq_key("audit-events"), "audit-events:dlq");
        assert_eq!(active_ids_key("audit-events"), "audit-events:active_ids");
    }

    #[test]
    fn priority_score_orders_lower_priority_value_first() {
        // CRITICAL (0) always beats HIGH (10) regardless of sequence number.
        assert!(priority_score(Priority::CRITICAL, 5) < priority_score(Priority::HIGH, 1));

        // Ties within a tier break FIFO by ascending sequence number.
        assert!(priority_score(Priority::NORMAL, 1) < priority_score(Priority::NORMAL, 2));
    }
}
