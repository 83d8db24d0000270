//! Alerting Service (§4.12): the dedup/cooldown/fan-out front door every
//! candidate alert (from pattern detectors, the dead-letter threshold hook,
//! or an integrity failure) passes through before it reaches a handler.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::config::AlertingConfig;
use crate::error::Result;
use crate::monitoring::alert::{Alert, AlertFilter, AlertHandler, AlertSeverity, AlertStats};
use crate::Error;

/// Fans a deduplicated alert out to every registered handler. CRITICAL
/// alerts additionally fan out to a `critical_handlers` subset meant to
/// carry a higher-urgency notifier (§9: "CRITICAL implies immediate
/// fan-out on a dedicated handler set").
pub struct AlertingService {
    redis: ConnectionManager,
    config: AlertingConfig,
    handlers: Vec<Arc<dyn AlertHandler>>,
    critical_handlers: Vec<Arc<dyn AlertHandler>>,
}

impl AlertingService {
    pub fn new(redis: ConnectionManager, config: AlertingConfig) -> Self {
        Self {
            redis,
            config,
            handlers: Vec::new(),
            critical_handlers: Vec::new(),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn AlertHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_critical_handler(mut self, handler: Arc<dyn AlertHandler>) -> Self {
        self.critical_handlers.push(handler);
        self
    }

    fn cooldown_key(dedupe_hash: &str) -> String {
        format!("alert:cooldown:{}", dedupe_hash)
    }

    /// Accepts a candidate alert: computes/validates its dedupe hash, checks
    /// the shared cooldown, and either drops it (incrementing the
    /// `alert.suppressed` counter) or fans it out to every handler.
    pub async fn accept(&self, alert: Alert) -> Result<AcceptOutcome> {
        let mut conn = self.redis.clone();
        let key = Self::cooldown_key(&alert.dedupe_hash);

        let options = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::EX(self.config.dedupe_window_secs as u64));

        let previous: Option<String> = conn
            .set_options(&key, alert.id.to_string(), options)
            .await
            .map_err(|e| Error::transient_storage(format!("alert cooldown check failed: {}", e)))?;

        if previous.is_some() {
            tracing::debug!(dedupe_hash = %alert.dedupe_hash, "alert suppressed, cooldown active");
            SUPPRESSED_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Ok(AcceptOutcome::Suppressed);
        }

        for handler in &self.handlers {
            if let Err(err) = handler.send(&alert).await {
                tracing::warn!(handler = handler.name(), error = %err, "alert handler failed");
            }
        }

        if alert.severity == AlertSeverity::Critical {
            for handler in &self.critical_handlers {
                if let Err(err) = handler.send(&alert).await {
                    tracing::error!(handler = handler.name(), error = %err, "critical alert handler failed");
                }
            }
        }

        Ok(AcceptOutcome::Dispatched(alert.id))
    }

    pub async fn list(&self, filter: AlertFilter) -> Result<Vec<Alert>> {
        self.persisting_handler()?.list(filter).await
    }

    pub async fn list_active(&self, organization_id: Option<&str>) -> Result<Vec<Alert>> {
        self.persisting_handler()?.list_active(organization_id).await
    }

    pub async fn count_active(&self, organization_id: Option<&str>) -> Result<i64> {
        self.persisting_handler()?.count_active(organization_id).await
    }

    pub async fn stats(&self, organization_id: Option<&str>) -> Result<AlertStats> {
        self.persisting_handler()?.stats(organization_id).await
    }

    pub async fn resolve(&self, id: Uuid, by: &str, data: Option<serde_json::Value>) -> Result<()> {
        self.persisting_handler()?.resolve(id, by, data).await
    }

    pub async fn acknowledge(&self, id: Uuid, by: &str) -> Result<()> {
        self.persisting_handler()?.acknowledge(id, by).await
    }

    pub async fn dismiss(&self, id: Uuid, by: &str) -> Result<()> {
        self.persisting_handler()?.dismiss(id, by).await
    }

    fn persisting_handler(&self) -> Result<&Arc<dyn AlertHandler>> {
        select_persisting_handler(&self.handlers).ok_or_else(|| Error::internal("no alert handlers registered"))
    }

    /// Polls the dead-letter arrival rate and raises a CRITICAL alert when
    /// it exceeds `alertThreshold` per interval. Intended to run on a
    /// periodic schedule alongside the partition manager's ensure-ahead
    /// tick, not from the hot request path.
    pub async fn check_dead_letter_threshold(
        &self,
        dead_letters: &crate::jobs::dead_letter::DeadLetterHandler,
        queue_name: &str,
    ) -> Result<()> {
        let exceeded = dead_letters
            .check_threshold(self.config.alert_threshold_per_interval, self.config.dlq_alert_interval_secs)
            .await?;

        if exceeded {
            let rate = dead_letters.arrival_rate(self.config.dlq_alert_interval_secs).await?;
            let alert = Alert::new(
                AlertSeverity::Critical,
                "Dead-letter arrival rate exceeded",
                format!(
                    "{} jobs dead-lettered on queue {} in the last {}s, above threshold {}",
                    rate, queue_name, self.config.dlq_alert_interval_secs, self.config.alert_threshold_per_interval
                ),
                "dead-letter-handler",
                None,
            );
            self.accept(alert).await?;
        }
        Ok(())
    }

    /// Runs [`Self::check_dead_letter_threshold`] on a fixed interval until
    /// the returned task is aborted by dropping its handle.
    pub fn spawn_dead_letter_watch(
        self: Arc<Self>,
        dead_letters: Arc<crate::jobs::dead_letter::DeadLetterHandler>,
        queue_name: String,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.check_dead_letter_threshold(&dead_letters, &queue_name).await {
                    tracing::warn!(error = %err, "dead-letter threshold check failed");
                }
            }
        })
    }
}

/// Picks the handler that serves `list`/`resolve`/`acknowledge`/etc: the
/// handler named `"database"` if registered, else the first handler.
fn select_persisting_handler(handlers: &[Arc<dyn AlertHandler>]) -> Option<&Arc<dyn AlertHandler>> {
    handlers.iter().find(|h| h.name() == "database").or_else(|| handlers.first())
}

static SUPPRESSED_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// Process-wide count of alerts dropped by the cooldown check, surfaced by
/// the Metrics Collector as `alert.suppressed`.
pub fn suppressed_count() -> u64 {
    SUPPRESSED_COUNTER.load(std::sync::atomic::Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    Dispatched(Uuid),
    Suppressed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;

    struct NamedHandler(&'static str);

    #[async_trait]
    impl AlertHandler for NamedHandler {
        fn name(&self) -> &str {
            self.0
        }
        async fn send(&self, _alert: &Alert) -> Result<()> {
            unimplemented!("not exercised by these tests")
        }
        async fn list(&self, _filter: AlertFilter) -> Result<Vec<Alert>> {
            unimplemented!()
        }
        async fn list_active(&self, _organization_id: Option<&str>) -> Result<Vec<Alert>> {
            unimplemented!()
        }
        async fn count_active(&self, _organization_id: Option<&str>) -> Result<i64> {
            unimplemented!()
        }
        async fn stats(&self, _organization_id: Option<&str>) -> Result<AlertStats> {
            unimplemented!()
        }
        async fn resolve(&self, _id: Uuid, _by: &str, _data: Option<Value>) -> Result<()> {
            unimplemented!()
        }
        async fn acknowledge(&self, _id: Uuid, _by: &str) -> Result<()> {
            unimplemented!()
        }
        async fn dismiss(&self, _id: Uuid, _by: &str) -> Result<()> {
            unimplemented!()
        }
    }

    #[test]
    fn cooldown_key_is_namespaced_under_the_dedupe_hash() {
        assert_eq!(AlertingService::cooldown_key("abc123"), "alert:cooldown:abc123");
    }

    #[test]
    fn persisting_handler_prefers_the_database_named_handler() {
        let handlers: Vec<Arc<dyn AlertHandler>> =
            vec![Arc::new(NamedHandler("console")), Arc::new(NamedHandler("database")), Arc::new(NamedHandler("webhook"))];
        let selected = select_persisting_handler(&handlers).unwrap();
        assert_eq!(selected.name(), "database");
    }

    #[test]
    fn persisting_handler_falls_back_to_the_first_handler_when_no_database_handler_exists() {
        let handlers: Vec<Arc<dyn AlertHandler>> = vec![Arc::new(NamedHandler("console")), Arc::new(NamedHandler("webhook"))];
        let selected = select_persisting_handler(&handlers).unwrap();
        assert_eq!(selected.name(), "console");
    }

    #[test]
    fn persisting_handler_is_none_when_no_handlers_are_registered() {
        let handlers: Vec<Arc<dyn AlertHandler>> = Vec::new();
        assert!(select_persisting_handler(&handlers).is_none());
    }
}
