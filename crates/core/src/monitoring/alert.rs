//! Alert entity and the handler contract (§3 Alert, §6 Alert Handler
//! Contract). Every handler variant shares one Postgres-backed store for the
//! query/lifecycle surface; they differ only in what `send` does with a
//! freshly produced alert (log it, persist it, POST it, email it).

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::Result;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "LOW",
            AlertSeverity::Medium => "MEDIUM",
            AlertSeverity::High => "HIGH",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Dismissed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Dismissed => "dismissed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "acknowledged" => AlertStatus::Acknowledged,
            "resolved" => AlertStatus::Resolved,
            "dismissed" => AlertStatus::Dismissed,
            _ => AlertStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    pub title: String,
    pub description: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub status: AlertStatus,
    pub organization_id: Option<String>,
    pub dedupe_hash: String,
    pub metadata: Value,
}

impl Alert {
    /// Builds a candidate alert with a freshly computed `dedupeHash`. Callers
    /// (pattern detectors, the dead-letter threshold hook) never set
    /// `dedupe_hash` themselves.
    pub fn new(
        severity: AlertSeverity,
        title: impl Into<String>,
        description: impl Into<String>,
        source: impl Into<String>,
        organization_id: Option<String>,
    ) -> Self {
        let title = title.into();
        let description = description.into();
        let source = source.into();
        let dedupe_hash = compute_dedupe_hash(&source, &title, severity, &description);

        Self {
            id: Uuid::new_v4(),
            severity,
            title,
            description,
            source,
            created_at: Utc::now(),
            status: AlertStatus::Active,
            organization_id,
            dedupe_hash,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// `base64(source:title:severity:description)`, per §3's Alert invariant.
pub fn compute_dedupe_hash(source: &str, title: &str, severity: AlertSeverity, description: &str) -> String {
    let raw = format!("{}:{}:{}:{}", source, title, severity.as_str(), description);
    STANDARD.encode(raw.as_bytes())
}

#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub organization_id: Option<String>,
    pub status: Option<AlertStatus>,
    pub severity: Option<AlertSeverity>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertStats {
    pub total: i64,
    pub active: i64,
    pub acknowledged: i64,
    pub resolved: i64,
    pub dismissed: i64,
    pub critical_active: i64,
}

/// The contract every alert handler implements (§6). `send` is the only
/// method whose behavior differs across variants; the rest are answered out
/// of the shared [`PostgresAlertStore`].
#[async_trait::async_trait]
pub trait AlertHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, alert: &Alert) -> Result<()>;
    async fn list(&self, filter: AlertFilter) -> Result<Vec<Alert>>;
    async fn list_active(&self, organization_id: Option<&str>) -> Result<Vec<Alert>>;
    async fn count_active(&self, organization_id: Option<&str>) -> Result<i64>;
    async fn stats(&self, organization_id: Option<&str>) -> Result<AlertStats>;
    async fn resolve(&self, id: Uuid, by: &str, data: Option<Value>) -> Result<()>;
    async fn acknowledge(&self, id: Uuid, by: &str) -> Result<()>;
    async fn dismiss(&self, id: Uuid, by: &str) -> Result<()>;
}

/// Owns the `alerts` table. Reopening an alert is forbidden by construction:
/// [`Self::resolve`]/[`Self::acknowledge`]/[`Self::dismiss`] only ever move
/// status forward, never back to `active` (§4.12 lifecycle).
pub struct PostgresAlertStore {
    pool: PgPool,
}

impl PostgresAlertStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotently creates the `alerts` table. Callers run this once at
    /// startup, the same convention [`crate::storage::PartitionManager`]
    /// uses for `audit_log`'s partitions.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS alerts (
                id UUID PRIMARY KEY,
                severity VARCHAR(20) NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                source VARCHAR(255) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                status VARCHAR(20) NOT NULL,
                organization_id VARCHAR(255),
                dedupe_hash VARCHAR(512) NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_org_status ON alerts (organization_id, status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_dedupe_hash ON alerts (dedupe_hash)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn insert(&self, alert: &Alert) -> Result<()> {
        sqlx::query(
            "INSERT INTO alerts (
                id, severity, title, description, source, created_at, status,
                organization_id, dedupe_hash, metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING",
        )
        .bind(alert.id)
        .bind(alert.severity.as_str())
        .bind(&alert.title)
        .bind(&alert.description)
        .bind(&alert.source)
        .bind(alert.created_at)
        .bind(alert.status.as_str())
        .bind(&alert.organization_id)
        .bind(&alert.dedupe_hash)
        .bind(&alert.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list(&self, filter: AlertFilter) -> Result<Vec<Alert>> {
        let rows = sqlx::query(
            "SELECT id, severity, title, description, source, created_at, status,
                    organization_id, dedupe_hash, metadata
             FROM alerts
             WHERE ($1::text IS NULL OR organization_id = $1)
               AND ($2::text IS NULL OR status = $2)
               AND ($3::text IS NULL OR severity = $3)
             ORDER BY created_at DESC
             LIMIT $4",
        )
        .bind(filter.organization_id)
        .bind(filter.status.map(|s| s.as_str().to_string()))
        .bind(filter.severity.map(|s| s.as_str().to_string()))
        .bind(filter.limit.unwrap_or(100))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_alert).collect()
    }

    pub async fn list_active(&self, organization_id: Option<&str>) -> Result<Vec<Alert>> {
        self.list(AlertFilter {
            organization_id: organization_id.map(String::from),
            status: Some(AlertStatus::Active),
            severity: None,
            limit: Some(1000),
        })
        .await
    }

    pub async fn count_active(&self, organization_id: Option<&str>) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM alerts WHERE status = 'active' AND ($1::text IS NULL OR organization_id = $1)",
        )
        .bind(organization_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("count")?)
    }

    pub async fn stats(&self, organization_id: Option<&str>) -> Result<AlertStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'active') AS active,
                COUNT(*) FILTER (WHERE status = 'acknowledged') AS acknowledged,
                COUNT(*) FILTER (WHERE status = 'resolved') AS resolved,
                COUNT(*) FILTER (WHERE status = 'dismissed') AS dismissed,
                COUNT(*) FILTER (WHERE status = 'active' AND severity = 'CRITICAL') AS critical_active
             FROM alerts
             WHERE ($1::text IS NULL OR organization_id = $1)",
        )
        .bind(organization_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(AlertStats {
            total: row.try_get("total")?,
            active: row.try_get("active")?,
            acknowledged: row.try_get("acknowledged")?,
            resolved: row.try_get("resolved")?,
            dismissed: row.try_get("dismissed")?,
            critical_active: row.try_get("critical_active")?,
        })
    }

    /// Enforces the forward-only lifecycle: a transition out of `active` is
    /// accepted, any other starting status is rejected rather than silently
    /// reapplied.
    async fn transition(&self, id: Uuid, target: AlertStatus, by: &str, data: Option<Value>) -> Result<()> {
        let current = sqlx::query("SELECT status FROM alerts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(format!("no alert {}", id)))?;

        let current_status = AlertStatus::from_str(current.try_get::<String, _>("status")?.as_str());
        if current_status != AlertStatus::Active {
            return Err(Error::conflict(format!(
                "alert {} is already {}; reopening is not supported",
                id,
                current_status.as_str()
            )));
        }

        let mut metadata_patch = data.unwrap_or_else(|| Value::Object(Default::default()));
        if let Value::Object(map) = &mut metadata_patch {
            map.insert("transitioned_by".to_string(), Value::String(by.to_string()));
            map.insert("transitioned_at".to_string(), Value::String(Utc::now().to_rfc3339()));
        }

        sqlx::query(
            "UPDATE alerts
             SET status = $1, metadata = metadata || $2
             WHERE id = $3 AND status = 'active'",
        )
        .bind(target.as_str())
        .bind(&metadata_patch)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn resolve(&self, id: Uuid, by: &str, data: Option<Value>) -> Result<()> {
        self.transition(id, AlertStatus::Resolved, by, data).await
    }

    pub async fn acknowledge(&self, id: Uuid, by: &str) -> Result<()> {
        self.transition(id, AlertStatus::Acknowledged, by, None).await
    }

    pub async fn dismiss(&self, id: Uuid, by: &str) -> Result<()> {
        self.transition(id, AlertStatus::Dismissed, by, None).await
    }
}

fn row_to_alert(row: sqlx::postgres::PgRow) -> Result<Alert> {
    Ok(Alert {
        id: row.try_get("id")?,
        severity: match row.try_get::<String, _>("severity")?.as_str() {
            "LOW" => AlertSeverity::Low,
            "MEDIUM" => AlertSeverity::Medium,
            "HIGH" => AlertSeverity::High,
            _ => AlertSeverity::Critical,
        },
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        source: row.try_get("source")?,
        created_at: row.try_get("created_at")?,
        status: AlertStatus::from_str(row.try_get::<String, _>("status")?.as_str()),
        organization_id: row.try_get("organization_id")?,
        dedupe_hash: row.try_get("dedupe_hash")?,
        metadata: row.try_get("metadata")?,
    })
}

/// Logs the alert to the process's trace output. Typically registered
/// alongside the database handler, not instead of it.
pub struct ConsoleAlertHandler {
    store: Arc<PostgresAlertStore>,
}

impl ConsoleAlertHandler {
    pub fn new(store: Arc<PostgresAlertStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl AlertHandler for ConsoleAlertHandler {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Critical | AlertSeverity::High => {
                tracing::error!(alert_id = %alert.id, severity = %alert.severity, title = %alert.title, "alert");
            }
            _ => {
                tracing::warn!(alert_id = %alert.id, severity = %alert.severity, title = %alert.title, "alert");
            }
        }
        Ok(())
    }

    async fn list(&self, filter: AlertFilter) -> Result<Vec<Alert>> {
        self.store.list(filter).await
    }
    async fn list_active(&self, organization_id: Option<&str>) -> Result<Vec<Alert>> {
        self.store.list_active(organization_id).await
    }
    async fn count_active(&self, organization_id: Option<&str>) -> Result<i64> {
        self.store.count_active(organization_id).await
    }
    async fn stats(&self, organization_id: Option<&str>) -> Result<AlertStats> {
        self.store.stats(organization_id).await
    }
    async fn resolve(&self, id: Uuid, by: &str, data: Option<Value>) -> Result<()> {
        self.store.resolve(id, by, data).await
    }
    async fn acknowledge(&self, id: Uuid, by: &str) -> Result<()> {
        self.store.acknowledge(id, by).await
    }
    async fn dismiss(&self, id: Uuid, by: &str) -> Result<()> {
        self.store.dismiss(id, by).await
    }
}

/// The handler that actually persists the alert record (§4.12 step 4).
pub struct DatabaseAlertHandler {
    store: Arc<PostgresAlertStore>,
}

impl DatabaseAlertHandler {
    pub fn new(store: Arc<PostgresAlertStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl AlertHandler for DatabaseAlertHandler {
    fn name(&self) -> &str {
        "database"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        self.store.insert(alert).await
    }
    async fn list(&self, filter: AlertFilter) -> Result<Vec<Alert>> {
        self.store.list(filter).await
    }
    async fn list_active(&self, organization_id: Option<&str>) -> Result<Vec<Alert>> {
        self.store.list_active(organization_id).await
    }
    async fn count_active(&self, organization_id: Option<&str>) -> Result<i64> {
        self.store.count_active(organization_id).await
    }
    async fn stats(&self, organization_id: Option<&str>) -> Result<AlertStats> {
        self.store.stats(organization_id).await
    }
    async fn resolve(&self, id: Uuid, by: &str, data: Option<Value>) -> Result<()> {
        self.store.resolve(id, by, data).await
    }
    async fn acknowledge(&self, id: Uuid, by: &str) -> Result<()> {
        self.store.acknowledge(id, by).await
    }
    async fn dismiss(&self, id: Uuid, by: &str) -> Result<()> {
        self.store.dismiss(id, by).await
    }
}

/// Posts the alert to an external webhook endpoint. Network/timeout
/// failures from `send` are not retried internally; the Alerting Service
/// treats handler failures as best-effort notification, not a pipeline error.
pub struct WebhookAlertHandler {
    store: Arc<PostgresAlertStore>,
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookAlertHandler {
    pub fn new(store: Arc<PostgresAlertStore>, endpoint: impl Into<String>) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait::async_trait]
impl AlertHandler for WebhookAlertHandler {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(alert)
            .send()
            .await
            .map_err(|e| Error::transient_storage(format!("webhook delivery failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::transient_storage(format!("webhook returned {}", response.status())));
        }
        Ok(())
    }

    async fn list(&self, filter: AlertFilter) -> Result<Vec<Alert>> {
        self.store.list(filter).await
    }
    async fn list_active(&self, organization_id: Option<&str>) -> Result<Vec<Alert>> {
        self.store.list_active(organization_id).await
    }
    async fn count_active(&self, organization_id: Option<&str>) -> Result<i64> {
        self.store.count_active(organization_id).await
    }
    async fn stats(&self, organization_id: Option<&str>) -> Result<AlertStats> {
        self.store.stats(organization_id).await
    }
    async fn resolve(&self, id: Uuid, by: &str, data: Option<Value>) -> Result<()> {
        self.store.resolve(id, by, data).await
    }
    async fn acknowledge(&self, id: Uuid, by: &str) -> Result<()> {
        self.store.acknowledge(id, by).await
    }
    async fn dismiss(&self, id: Uuid, by: &str) -> Result<()> {
        self.store.dismiss(id, by).await
    }
}

/// Forwards the alert to an HTTP email-gateway API (SendGrid/Mailgun-shaped).
/// There is no bundled SMTP client in this crate's dependency stack, the
/// same reasoning [`crate::security::kms::HttpKmsClient`] documents for KMS.
pub struct EmailAlertHandler {
    store: Arc<PostgresAlertStore>,
    client: reqwest::Client,
    gateway_endpoint: String,
    recipients: Vec<String>,
}

impl EmailAlertHandler {
    pub fn new(store: Arc<PostgresAlertStore>, gateway_endpoint: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            gateway_endpoint: gateway_endpoint.into(),
            recipients,
        }
    }
}

#[derive(Serialize)]
struct EmailPayload<'a> {
    to: &'a [String],
    subject: String,
    body: &'a str,
}

#[async_trait::async_trait]
impl AlertHandler for EmailAlertHandler {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let payload = EmailPayload {
            to: &self.recipients,
            subject: format!("[{}] {}", alert.severity, alert.title),
            body: &alert.description,
        };

        let response = self
            .client
            .post(&self.gateway_endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::transient_storage(format!("email gateway request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::transient_storage(format!("email gateway returned {}", response.status())));
        }
        Ok(())
    }

    async fn list(&self, filter: AlertFilter) -> Result<Vec<Alert>> {
        self.store.list(filter).await
    }
    async fn list_active(&self, organization_id: Option<&str>) -> Result<Vec<Alert>> {
        self.store.list_active(organization_id).await
    }
    async fn count_active(&self, organization_id: Option<&str>) -> Result<i64> {
        self.store.count_active(organization_id).await
    }
    async fn stats(&self, organization_id: Option<&str>) -> Result<AlertStats> {
        self.store.stats(organization_id).await
    }
    async fn resolve(&self, id: Uuid, by: &str, data: Option<Value>) -> Result<()> {
        self.store.resolve(id, by, data).await
    }
    async fn acknowledge(&self, id: Uuid, by: &str) -> Result<()> {
        self.store.acknowledge(id, by).await
    }
    async fn dismiss(&self, id: Uuid, by: &str) -> Result<()> {
        self.store.dismiss(id, by).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_hash_is_stable_for_identical_inputs() {
        let a = compute_dedupe_hash("pattern-detector", "Failed logins", AlertSeverity::High, "5 failures");
        let b = compute_dedupe_hash("pattern-detector", "Failed logins", AlertSeverity::High, "5 failures");
        assert_eq!(a, b);
    }

    #[test]
    fn dedupe_hash_changes_with_severity() {
        let a = compute_dedupe_hash("pattern-detector", "t", AlertSeverity::Low, "d");
        let b = compute_dedupe_hash("pattern-detector", "t", AlertSeverity::High, "d");
        assert_ne!(a, b);
    }

    #[test]
    fn new_alert_starts_active() {
        let alert = Alert::new(AlertSeverity::Medium, "t", "d", "source", None);
        assert_eq!(alert.status, AlertStatus::Active);
    }
}
