//! The ingestion entry point (§4.5 Queue Producer plus the preset/validate/
//! seal pipeline that sits in front of it): `log(event, options) -> jobId`.

use std::sync::Arc;

use crate::audit::event::{AuditEvent, SigningAlgorithm};
use crate::audit::preset::PresetResolver;
use crate::audit::seal::Sealer;
use crate::audit::validator::{ComplianceProfile, Validator};
use crate::error::Result;
use crate::jobs::queue::JobQueue;
use crate::jobs::types::{JobId, Priority};

/// Per-call knobs for [`AuditProducer::log`]. Defaults mirror the producer
/// contract in §4.5: hash generation on, signature generation on, HMAC
/// signing, normal priority, no delay, best-effort delivery.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub priority: Priority,
    pub delay_ms: u64,
    pub generate_hash: bool,
    pub generate_signature: bool,
    pub signing_algorithm: SigningAlgorithm,
    pub preset_name: Option<String>,
    pub compliance: Vec<ComplianceProfile>,
    pub deduplication_key: Option<String>,
    /// When true, a queueing failure is returned to the caller as an error
    /// instead of being swallowed; §4.5's "guaranteed delivery" mode.
    pub guaranteed_delivery: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            priority: Priority::NORMAL,
            delay_ms: 0,
            generate_hash: true,
            generate_signature: true,
            signing_algorithm: SigningAlgorithm::HmacSha256,
            preset_name: None,
            compliance: Vec::new(),
            deduplication_key: None,
            guaranteed_delivery: true,
        }
    }
}

/// Applies a preset (if named), validates, seals, and enqueues an
/// [`AuditEvent`] — the single path every caller of the ingestion API goes
/// through. Holds no state of its own beyond its collaborators, each of
/// which is independently testable.
pub struct AuditProducer {
    validator: Validator,
    presets: Option<Arc<PresetResolver>>,
    sealer: Arc<Sealer>,
    queue: Arc<dyn JobQueue>,
    always_on_profiles: Vec<ComplianceProfile>,
}

impl AuditProducer {
    pub fn new(validator: Validator, sealer: Arc<Sealer>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            validator,
            presets: None,
            sealer,
            queue,
            always_on_profiles: Vec::new(),
        }
    }

    pub fn with_presets(mut self, presets: Arc<PresetResolver>) -> Self {
        self.presets = Some(presets);
        self
    }

    /// Profiles enforced on every event regardless of what the caller passes
    /// in `LogOptions.compliance` (a deployment-wide HIPAA requirement, say).
    pub fn with_always_on_profiles(mut self, profiles: Vec<ComplianceProfile>) -> Self {
        self.always_on_profiles = profiles;
        self
    }

    /// Applies preset defaults, validates, seals, and enqueues `event`. On
    /// success returns the [`JobId`] assigned by the queue (or the existing
    /// job's id, if `options.deduplication_key` — or the computed hash by
    /// default — collided with a pending/active job).
    pub async fn log(&self, mut event: AuditEvent, options: LogOptions) -> Result<JobId> {
        if let (Some(resolver), Some(name)) = (&self.presets, options.preset_name.as_deref()) {
            if let Some(preset) = resolver.resolve(name, event.organization_id.as_deref()).await? {
                self.apply_preset(&mut event, &preset.template);
            }
        }

        let mut profiles = self.always_on_profiles.clone();
        for profile in &options.compliance {
            if !profiles.contains(profile) {
                profiles.push(*profile);
            }
        }
        self.validator.validate(&event, &profiles)?;

        self.sealer
            .seal(&mut event, options.generate_hash, options.generate_signature, options.signing_algorithm)
            .await?;

        let dedup_key = options
            .deduplication_key
            .clone()
            .or_else(|| event.hash.clone())
            .unwrap_or_else(|| event.canonical_bytes());

        match self.queue.enqueue(event, options.priority, options.delay_ms, Some(dedup_key)).await {
            Ok(job_id) => Ok(job_id),
            Err(err) if !options.guaranteed_delivery => {
                tracing::warn!(error = %err, "audit event dropped: queue unavailable and guaranteed_delivery is disabled");
                Ok(JobId::new())
            }
            Err(err) => Err(err),
        }
    }

    fn apply_preset(&self, event: &mut AuditEvent, template: &crate::audit::preset::PresetTemplate) {
        if event.data_classification.is_none() {
            event.data_classification = template.default_data_classification;
        }
        if event.retention_policy.is_none() {
            event.retention_policy = template.default_retention_policy.clone();
        }
        if event.action.is_empty() {
            if let Some(default_action) = &template.default_action {
                event.action = default_action.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{DataClassification, EventStatus};
    use crate::audit::preset::{Preset, PresetResolver, PresetStore, PresetTemplate};
    use crate::error::Error;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn sample_event() -> AuditEvent {
        AuditEvent::builder("auth.login.success", EventStatus::Success)
            .principal_id("user-1")
            .organization_id("org-1")
            .build()
    }

    /// Records every enqueued event and always returns a fresh job id;
    /// supports the dedup-drop path by reusing the id already stored under
    /// a given dedup key.
    #[derive(Default)]
    struct RecordingQueue {
        by_dedup_key: Mutex<std::collections::HashMap<String, JobId>>,
        enqueued: Mutex<Vec<AuditEvent>>,
    }

    #[async_trait]
    impl JobQueue for RecordingQueue {
        async fn enqueue(
            &self,
            payload: AuditEvent,
            _priority: Priority,
            _delay_ms: u64,
            dedup_key: Option<String>,
        ) -> Result<JobId> {
            if let Some(key) = &dedup_key {
                let mut by_key = self.by_dedup_key.lock().unwrap();
                if let Some(existing) = by_key.get(key) {
                    return Ok(existing.clone());
                }
                let job_id = JobId::new();
                by_key.insert(key.clone(), job_id.clone());
                self.enqueued.lock().unwrap().push(payload);
                return Ok(job_id);
            }
            self.enqueued.lock().unwrap().push(payload);
            Ok(JobId::new())
        }

        async fn dequeue(&self, _lease_ms: u64) -> Result<Option<crate::jobs::types::LeasedJob>> {
            unimplemented!("not exercised by producer tests")
        }
        async fn ack(&self, _job_id: &JobId) -> Result<()> {
            unimplemented!("not exercised by producer tests")
        }
        async fn requeue(&self, _job_id: &JobId, _delay_ms: u64) -> Result<()> {
            unimplemented!("not exercised by producer tests")
        }
        async fn dead_letter(
            &self,
            _leased: &crate::jobs::types::LeasedJob,
            _failure_chain: Vec<crate::jobs::types::FailureRecord>,
        ) -> Result<()> {
            unimplemented!("not exercised by producer tests")
        }
        async fn stats(&self) -> Result<crate::jobs::types::QueueStats> {
            unimplemented!("not exercised by producer tests")
        }
    }

    struct AlwaysFailQueue;

    #[async_trait]
    impl JobQueue for AlwaysFailQueue {
        async fn enqueue(
            &self,
            _payload: AuditEvent,
            _priority: Priority,
            _delay_ms: u64,
            _dedup_key: Option<String>,
        ) -> Result<JobId> {
            Err(Error::queue("queue store unreachable"))
        }
        async fn dequeue(&self, _lease_ms: u64) -> Result<Option<crate::jobs::types::LeasedJob>> {
            unimplemented!()
        }
        async fn ack(&self, _job_id: &JobId) -> Result<()> {
            unimplemented!()
        }
        async fn requeue(&self, _job_id: &JobId, _delay_ms: u64) -> Result<()> {
            unimplemented!()
        }
        async fn dead_letter(
            &self,
            _leased: &crate::jobs::types::LeasedJob,
            _failure_chain: Vec<crate::jobs::types::FailureRecord>,
        ) -> Result<()> {
            unimplemented!()
        }
        async fn stats(&self) -> Result<crate::jobs::types::QueueStats> {
            unimplemented!()
        }
    }

    fn producer(queue: Arc<dyn JobQueue>) -> AuditProducer {
        AuditProducer::new(Validator::new(10_000, 3), Arc::new(Sealer::new(b"test-secret".to_vec())), queue)
    }

    #[tokio::test]
    async fn log_seals_and_enqueues_a_valid_event() {
        let queue = Arc::new(RecordingQueue::default());
        let producer = producer(queue.clone());

        let job_id = producer.log(sample_event(), LogOptions::default()).await.unwrap();
        assert!(!job_id.as_str().is_empty());
        assert_eq!(queue.enqueued.lock().unwrap().len(), 1);
        assert!(queue.enqueued.lock().unwrap()[0].hash.is_some());
    }

    #[tokio::test]
    async fn log_rejects_an_event_that_fails_validation() {
        let queue = Arc::new(RecordingQueue::default());
        let producer = producer(queue.clone());

        let mut event = sample_event();
        event.action = "Not Valid Action".to_string();

        let err = producer.log(event, LogOptions::default()).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ValidationFailed);
        assert!(queue.enqueued.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_applies_a_named_preset_before_validation() {
        let queue = Arc::new(RecordingQueue::default());
        let store = Arc::new(crate::audit::preset::InMemoryPresetStore::new());
        store.insert(Preset {
            organization_id: None,
            name: "login".to_string(),
            template: PresetTemplate {
                default_action: None,
                default_data_classification: Some(DataClassification::Internal),
                default_retention_policy: Some("90d".to_string()),
                required_fields: Vec::new(),
                compliance_profiles: Vec::new(),
            },
        });
        let resolver = Arc::new(PresetResolver::new(store, 16));

        let producer = producer(queue.clone()).with_presets(resolver);
        let options = LogOptions {
            preset_name: Some("login".to_string()),
            ..LogOptions::default()
        };

        producer.log(sample_event(), options).await.unwrap();
        let enqueued = queue.enqueued.lock().unwrap();
        assert_eq!(enqueued[0].data_classification, Some(DataClassification::Internal));
        assert_eq!(enqueued[0].retention_policy.as_deref(), Some("90d"));
    }

    #[tokio::test]
    async fn guaranteed_delivery_surfaces_queue_errors() {
        let producer = producer(Arc::new(AlwaysFailQueue));
        let options = LogOptions {
            guaranteed_delivery: true,
            ..LogOptions::default()
        };
        let err = producer.log(sample_event(), options).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::QueueError);
    }

    #[tokio::test]
    async fn best_effort_delivery_swallows_queue_errors() {
        let producer = producer(Arc::new(AlwaysFailQueue));
        let options = LogOptions {
            guaranteed_delivery: false,
            ..LogOptions::default()
        };
        let job_id = producer.log(sample_event(), options).await.unwrap();
        assert!(!job_id.as_str().is_empty());
    }
}
