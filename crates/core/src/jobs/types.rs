//! Envelope types for the reliable delivery pipeline (§3 QueueJob, §4.5-4.6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::AuditEvent;

/// Unique identifier for a queued job. A fresh [`JobId`] is minted at
/// enqueue time; it is distinct from the event's `hash`, which is used
/// separately as the default deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority; lower values are dequeued sooner (§4.5). Producers
/// pass an arbitrary `i32`; these constants cover the common tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(pub i32);

impl Priority {
    pub const CRITICAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(10);
    pub const NORMAL: Priority = Priority(50);
    pub const LOW: Priority = Priority(100);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

/// Where a job sits in its lifecycle (§4.16): `queued → active →
/// {completed | retrying → queued | dead_lettered}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Retrying,
    DeadLettered,
}

/// The envelope a [`crate::jobs::queue::JobQueue`] stores around a sealed
/// [`AuditEvent`] (§3 QueueJob). `dedup_key` defaults to the event's `hash`
/// but callers may supply a different one via `Log`'s `deduplicationKey`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub job_id: JobId,
    pub payload: AuditEvent,
    pub attempts: u32,
    pub priority: Priority,
    pub dedup_key: String,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl QueueJob {
    pub fn new(payload: AuditEvent, priority: Priority, dedup_key: String, available_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            payload,
            attempts: 0,
            priority,
            dedup_key,
            available_at,
            created_at: now,
        }
    }
}

/// A job handed to a worker for processing, carrying the lease deadline
/// under which the worker must ack, requeue, or dead-letter it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasedJob {
    pub job: QueueJob,
    pub lease_until: DateTime<Utc>,
}

/// One entry in a dead-lettered job's failure chain (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub attempt: u32,
    pub error_class: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Point-in-time counters surfaced by [`crate::jobs::queue::JobQueue::stats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub delayed: u64,
    pub active: u64,
    pub dead_lettered: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_has_critical_first() {
        let mut priorities = vec![Priority::LOW, Priority::NORMAL, Priority::CRITICAL, Priority::HIGH];
        priorities.sort();
        assert_eq!(priorities, vec![Priority::CRITICAL, Priority::HIGH, Priority::NORMAL, Priority::LOW]);
    }

    #[test]
    fn job_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }
}
