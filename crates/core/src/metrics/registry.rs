use crate::config::MetricsConfig;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Namespaced Prometheus registry every collector in this crate registers
/// into, rather than each owning its own `Registry`.
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    registry: Arc<Mutex<Registry>>,
    config: MetricsConfig,
}

impl MetricsRegistry {
    pub fn new(config: MetricsConfig) -> Self {
        let registry = Registry::new_custom(Some(config.namespace.clone()), None).unwrap_or_else(|_| {
            warn!("failed to create custom registry, falling back to default");
            Registry::new()
        });

        Self {
            registry: Arc::new(Mutex::new(registry)),
            config,
        }
    }

    pub fn register<T>(&self, collector: T) -> Result<(), prometheus::Error>
    where
        T: prometheus::core::Collector + 'static,
    {
        if let Ok(registry) = self.registry.lock() {
            registry.register(Box::new(collector))
        } else {
            Err(prometheus::Error::Msg("failed to acquire registry lock".to_string()))
        }
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        if let Ok(registry) = self.registry.lock() {
            registry.gather()
        } else {
            Vec::new()
        }
    }

    /// Renders the registry in Prometheus text exposition format. Serving
    /// this over HTTP is the Monitoring Dashboard collaborator's job, not
    /// this crate's — callers embed it behind whatever endpoint they expose.
    pub fn metrics_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!("failed to encode metrics: {}", e);
            return String::new();
        }

        String::from_utf8(buffer).unwrap_or_else(|e| {
            warn!("failed to convert metrics buffer to utf-8: {}", e);
            String::new()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{IntCounter, Opts};

    #[test]
    fn is_enabled_reflects_the_config_flag() {
        let enabled = MetricsRegistry::new(MetricsConfig {
            enabled: true,
            namespace: "audit_pipeline".to_string(),
        });
        assert!(enabled.is_enabled());

        let disabled = MetricsRegistry::new(MetricsConfig {
            enabled: false,
            namespace: "audit_pipeline".to_string(),
        });
        assert!(!disabled.is_enabled());
    }

    #[test]
    fn registered_collectors_are_gathered_and_rendered_as_prometheus_text() {
        let registry = MetricsRegistry::new(MetricsConfig::default());
        let counter = IntCounter::with_opts(Opts::new("events_total", "total events ingested")).unwrap();
        counter.inc_by(3);
        registry.register(counter).unwrap();

        let families = registry.gather();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_metric()[0].get_counter().get_value(), 3.0);

        let text = registry.metrics_text();
        assert!(text.contains("events_total"));
    }

    #[test]
    fn registering_the_same_metric_name_twice_is_rejected() {
        let registry = MetricsRegistry::new(MetricsConfig::default());
        let first = IntCounter::with_opts(Opts::new("dup_metric", "first")).unwrap();
        let second = IntCounter::with_opts(Opts::new("dup_metric", "second")).unwrap();

        assert!(registry.register(first).is_ok());
        assert!(registry.register(second).is_err());
    }
}
