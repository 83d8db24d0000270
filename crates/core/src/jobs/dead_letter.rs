//! Administrative access to dead-lettered jobs (§4.7): list, reprocess,
//! purge. Shares the Redis keyspace `RedisJobQueue` writes into but is a
//! separate collaborator — the reliable processor only ever pushes into the
//! DLQ; operators (or an automated job) are the ones reading it back out.

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::jobs::types::{FailureRecord, JobId, QueueJob};
use crate::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub job: QueueJob,
    pub failure_chain: Vec<FailureRecord>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Filters accepted by [`DeadLetterHandler::list`]. `None` means unfiltered.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub action_prefix: Option<String>,
    pub limit: Option<usize>,
}

fn dlq_key(queue_name: &str) -> String {
    format!("{}:dlq", queue_name)
}
fn record_key(queue_name: &str, job_id: &JobId) -> String {
    format!("{}:dlq:record:{}", queue_name, job_id.as_str())
}
fn arrivals_key(queue_name: &str) -> String {
    format!("{}:dlq:arrivals", queue_name)
}

/// True when `record` passes `filter`'s `action_prefix` constraint. Pulled
/// out of [`DeadLetterHandler::list`] so the filtering logic is testable
/// without a Redis connection.
fn matches_filter(record: &DeadLetterRecord, filter: &DeadLetterFilter) -> bool {
    match &filter.action_prefix {
        Some(prefix) => record.job.payload.action.starts_with(prefix.as_str()),
        None => true,
    }
}

pub struct DeadLetterHandler {
    redis: ConnectionManager,
    queue_name: String,
}

impl DeadLetterHandler {
    pub fn new(redis: ConnectionManager, queue_name: impl Into<String>) -> Self {
        Self {
            redis,
            queue_name: queue_name.into(),
        }
    }

    fn dlq_key(&self) -> String {
        dlq_key(&self.queue_name)
    }
    fn record_key(&self, job_id: &JobId) -> String {
        record_key(&self.queue_name, job_id)
    }
    fn pending_key(&self) -> String {
        format!("{}:pending", self.queue_name)
    }
    fn job_key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.queue_name, job_id.as_str())
    }
    fn seq_key(&self) -> String {
        format!("{}:seq", self.queue_name)
    }
    fn arrivals_key(&self) -> String {
        arrivals_key(&self.queue_name)
    }

    pub async fn list(&self, filter: DeadLetterFilter) -> Result<Vec<DeadLetterRecord>> {
        let mut conn = self.redis.clone();
        let limit = filter.limit.unwrap_or(100) as isize;
        let ids: Vec<String> = conn.lrange(self.dlq_key(), 0, limit.saturating_sub(1) as isize).await?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let job_id = JobId(id);
            if let Some(record) = self.load_record(&job_id).await? {
                if matches_filter(&record, &filter) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    async fn load_record(&self, job_id: &JobId) -> Result<Option<DeadLetterRecord>> {
        let mut conn = self.redis.clone();
        let json: Option<String> = conn.get(self.record_key(job_id)).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Moves a dead-lettered job back onto the pending queue with
    /// `attempts` reset to zero (§9: reprocessing is treated as a fresh
    /// delivery attempt, not a continuation of the failed one).
    pub async fn reprocess(&self, job_id: &JobId) -> Result<()> {
        let mut conn = self.redis.clone();
        let record = self
            .load_record(job_id)
            .await?
            .ok_or_else(|| Error::dead_letter(format!("no dead-lettered job {}", job_id)))?;

        let mut job = record.job;
        job.attempts = 0;
        job.available_at = Utc::now();

        let json = serde_json::to_string(&job)?;
        conn.set::<_, _, ()>(self.job_key(job_id), json).await?;

        let seq: i64 = conn.incr(self.seq_key(), 1).await?;
        let score = (job.priority.0 as f64) * 1e13 + seq as f64;
        conn.zadd::<_, _, _, ()>(self.pending_key(), job_id.as_str(), score).await?;

        let _: i64 = conn.lrem(self.dlq_key(), 1, job_id.as_str()).await?;
        let _: i64 = conn.del(self.record_key(job_id)).await?;

        tracing::info!(job_id = %job_id, "reprocessed dead-lettered job");
        Ok(())
    }

    /// Permanently removes dead-lettered records older than `older_than`.
    pub async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let records = self.list(DeadLetterFilter { action_prefix: None, limit: Some(10_000) }).await?;
        let mut purged = 0u64;
        let mut conn = self.redis.clone();

        for record in records {
            if record.dead_lettered_at < older_than {
                let job_id = &record.job.job_id;
                let _: i64 = conn.lrem(self.dlq_key(), 1, job_id.as_str()).await?;
                let _: i64 = conn.del(self.record_key(job_id)).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    pub async fn depth(&self) -> Result<u64> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(self.dlq_key()).await?)
    }

    /// Number of jobs dead-lettered in the trailing `window_secs`. Backs the
    /// alert hook that fires when arrivals exceed `alertThreshold` per
    /// interval (§4.7); `RedisJobQueue::dead_letter` is the sole writer into
    /// the arrivals sorted set this reads.
    pub async fn arrival_rate(&self, window_secs: i64) -> Result<u64> {
        let mut conn = self.redis.clone();
        let now = Utc::now().timestamp_millis();
        let since = now - window_secs * 1000;
        Ok(conn.zcount(self.arrivals_key(), since, now).await?)
    }

    /// Drops arrival timestamps older than `older_than`, to keep the
    /// sorted set bounded. Run alongside [`Self::purge`].
    pub async fn trim_arrivals(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.redis.clone();
        Ok(conn.zrembyscore(self.arrivals_key(), 0, older_than.timestamp_millis()).await?)
    }

    /// Checks the trailing-window arrival rate against `threshold` and
    /// returns `true` when it has been exceeded, the signal the Alerting
    /// Service's periodic poll escalates into a CRITICAL alert.
    pub async fn check_threshold(&self, threshold: u64, window_secs: i64) -> Result<bool> {
        Ok(self.arrival_rate(window_secs).await? > threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::EventStatus;
    use crate::audit::AuditEvent;
    use crate::jobs::types::Priority;

    fn record_for(action: &str) -> DeadLetterRecord {
        let event = AuditEvent::builder(action, EventStatus::Failure).build();
        let job = QueueJob::new(event, Priority::NORMAL, "dedup".to_string(), Utc::now());
        DeadLetterRecord {
            job,
            failure_chain: Vec::new(),
            dead_lettered_at: Utc::now(),
        }
    }

    #[test]
    fn keys_are_namespaced_under_the_queue_name() {
        let job_id = JobId("abc-123".to_string());
        assert_eq!(dlq_key("audit-events"), "audit-events:dlq");
        assert_eq!(record_key("audit-events", &job_id), "audit-events:dlq:record:abc-123");
        assert_eq!(arrivals_key("audit-events"), "audit-events:dlq:arrivals");
    }

    #[test]
    fn unfiltered_list_accepts_every_record() {
        let record = record_for("auth.login.failure");
        assert!(matches_filter(&record, &DeadLetterFilter::default()));
    }

    #[test]
    fn action_prefix_filter_excludes_non_matching_records() {
        let record = record_for("auth.login.failure");
        let matching = DeadLetterFilter {
            action_prefix: Some("auth.".to_string()),
            limit: None,
        };
        let non_matching = DeadLetterFilter {
            action_prefix: Some("data.".to_string()),
            limit: None,
        };

        assert!(matches_filter(&record, &matching));
        assert!(!matches_filter(&record, &non_matching));
    }
}
