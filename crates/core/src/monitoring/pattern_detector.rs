//! Pattern Detector (§4.11): sliding-window analysis over the live stream of
//! persisted events, fed through [`crate::storage::StorageWriter`]'s
//! pattern hook. State is in-process (accepted loss on restart, the same
//! tradeoff [`crate::jobs::breaker::CircuitBreaker`] documents for its own
//! state) so each detector pool is scoped to a single process.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;

use crate::audit::event::{AuditEvent, EventStatus};
use crate::config::PatternDetectorConfig;
use crate::monitoring::alert::{Alert, AlertSeverity};
use crate::monitoring::alerting_service::AlertingService;

/// Detector identifiers, used both as the sliding-window key prefix and as
/// the `source` tag on emitted alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectorId {
    FailedAuth,
    UnauthorizedAccess,
    BulkExport,
    OffHours,
}

impl DetectorId {
    fn as_str(&self) -> &'static str {
        match self {
            DetectorId::FailedAuth => "FAILED_AUTH",
            DetectorId::UnauthorizedAccess => "UNAUTHORIZED_ACCESS",
            DetectorId::BulkExport => "BULK_EXPORT",
            DetectorId::OffHours => "OFF_HOURS",
        }
    }
}

/// Consumes persisted events and raises candidate alerts to the
/// [`AlertingService`] when one of the four default detectors fires.
pub struct PatternDetector {
    config: PatternDetectorConfig,
    alerting: Arc<AlertingService>,
    failed_auth_windows: DashMap<String, VecDeque<DateTime<Utc>>>,
    unauthorized_access_windows: DashMap<String, VecDeque<DateTime<Utc>>>,
    bulk_export_windows: DashMap<String, VecDeque<(DateTime<Utc>, String)>>,
}

impl PatternDetector {
    pub fn new(config: PatternDetectorConfig, alerting: Arc<AlertingService>) -> Self {
        Self {
            config,
            alerting,
            failed_auth_windows: DashMap::new(),
            unauthorized_access_windows: DashMap::new(),
            bulk_export_windows: DashMap::new(),
        }
    }

    /// Synchronous hook suitable for [`crate::storage::StorageWriter::with_pattern_hook`].
    /// Window bookkeeping is cheap in-memory work; a fired detector's alert
    /// is handed to the alerting service on a spawned task since that path
    /// needs the async cache/DB round trip a storage-write callback can't
    /// block on.
    pub fn record_event(self: &Arc<Self>, event: &AuditEvent) {
        if event.is_from_audit_system() {
            return;
        }

        let mut fired = Vec::new();
        if let Some(alert) = self.check_failed_auth(event) {
            fired.push(alert);
        }
        if let Some(alert) = self.check_unauthorized_access(event) {
            fired.push(alert);
        }
        if let Some(alert) = self.check_bulk_export(event) {
            fired.push(alert);
        }
        if let Some(alert) = self.check_off_hours(event) {
            fired.push(alert);
        }

        if fired.is_empty() {
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            for alert in fired {
                if let Err(err) = this.alerting.accept(alert).await {
                    tracing::warn!(error = %err, "failed to submit candidate alert to alerting service");
                }
            }
        });
    }

    fn check_failed_auth(&self, event: &AuditEvent) -> Option<Alert> {
        if event.status != EventStatus::Failure || !event.action.starts_with("auth.") {
            return None;
        }
        let principal = event.principal_id.as_deref()?;
        let count = push_and_count(
            &self.failed_auth_windows,
            principal.to_string(),
            event.timestamp.with_timezone(&Utc),
            self.config.failed_auth_window_secs,
        );

        if count >= self.config.failed_auth_threshold as usize {
            Some(Alert::new(
                AlertSeverity::High,
                "Repeated authentication failures",
                format!(
                    "{} failed auth events for principal {} within {}s",
                    count, principal, self.config.failed_auth_window_secs
                ),
                DetectorId::FailedAuth.as_str(),
                event.organization_id.clone(),
            ))
        } else {
            None
        }
    }

    fn check_unauthorized_access(&self, event: &AuditEvent) -> Option<Alert> {
        if event.status != EventStatus::Failure || !event.is_phi() {
            return None;
        }
        let principal = event.principal_id.as_deref()?;
        let count = push_and_count(
            &self.unauthorized_access_windows,
            principal.to_string(),
            event.timestamp.with_timezone(&Utc),
            self.config.unauthorized_access_window_secs,
        );

        if count >= self.config.unauthorized_access_threshold as usize {
            Some(Alert::new(
                AlertSeverity::Critical,
                "Repeated unauthorized PHI access",
                format!(
                    "{} failed PHI access attempts for principal {} within {}s",
                    count, principal, self.config.unauthorized_access_window_secs
                ),
                DetectorId::UnauthorizedAccess.as_str(),
                event.organization_id.clone(),
            ))
        } else {
            None
        }
    }

    fn check_bulk_export(&self, event: &AuditEvent) -> Option<Alert> {
        if event.action != "data.export" {
            return None;
        }
        let principal = event.principal_id.as_deref().unwrap_or("unknown");
        let resource_id = event.target_resource_id.clone().unwrap_or_default();

        let window_secs = self.config.bulk_export_window_secs;
        let timestamp = event.timestamp.with_timezone(&Utc);
        let mut entry = self.bulk_export_windows.entry(principal.to_string()).or_default();
        let cutoff = timestamp - chrono::Duration::seconds(window_secs);
        entry.retain(|(ts, _)| *ts >= cutoff);
        entry.push_back((timestamp, resource_id));

        let distinct: std::collections::HashSet<&str> = entry.iter().map(|(_, id)| id.as_str()).collect();
        let cardinality = distinct.len();
        drop(entry);

        if cardinality >= self.config.bulk_export_threshold as usize {
            Some(Alert::new(
                AlertSeverity::High,
                "Bulk data export detected",
                format!(
                    "principal {} exported {} distinct resources within {}s",
                    principal, cardinality, window_secs
                ),
                DetectorId::BulkExport.as_str(),
                event.organization_id.clone(),
            ))
        } else {
            None
        }
    }

    fn check_off_hours(&self, event: &AuditEvent) -> Option<Alert> {
        if !event.is_phi() {
            return None;
        }
        let timestamp_utc = event.timestamp.with_timezone(&Utc);
        let hour = timestamp_utc.hour();
        if hour >= self.config.business_hours_start && hour < self.config.business_hours_end {
            return None;
        }

        Some(Alert::new(
            AlertSeverity::Medium,
            "Off-hours PHI access",
            format!(
                "PHI access at {} UTC, outside business hours {:02}:00-{:02}:00",
                timestamp_utc, self.config.business_hours_start, self.config.business_hours_end
            ),
            DetectorId::OffHours.as_str(),
            event.organization_id.clone(),
        ))
    }
}

fn push_and_count(
    windows: &DashMap<String, VecDeque<DateTime<Utc>>>,
    key: String,
    now: DateTime<Utc>,
    window_secs: i64,
) -> usize {
    let mut entry = windows.entry(key).or_default();
    let cutoff = now - chrono::Duration::seconds(window_secs);
    entry.retain(|ts| *ts >= cutoff);
    entry.push_back(now);
    entry.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sliding_window_drops_entries_outside_the_window() {
        let windows = DashMap::new();
        let base = Utc::now();
        for i in 0..3 {
            push_and_count(&windows, "p1".to_string(), base + chrono::Duration::seconds(i), 300);
        }
        let count = push_and_count(&windows, "p1".to_string(), base + chrono::Duration::seconds(400), 300);
        assert_eq!(count, 1);
    }
}
