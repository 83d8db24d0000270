//! Pipeline-wide metrics (§4.14): counters, gauges, and latency histograms
//! every other component reports into, registered once against a shared
//! [`MetricsRegistry`] rather than each owning a private registry.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts};
use serde::Serialize;

use crate::metrics::MetricsRegistry;

/// Point-in-time read of every metric, handed to the Monitoring Dashboard
/// collaborator without it needing to scrape the Prometheus text format.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub events_total: u64,
    pub events_failed: u64,
    pub alerts_total: u64,
    pub queue_depth: i64,
    pub active_workers: i64,
    pub pool_active_connections: i64,
    pub processing_latency_ms_count: u64,
    pub processing_latency_ms_sum: f64,
    pub db_query_ms_count: u64,
    pub db_query_ms_sum: f64,
}

/// Owns the counters, gauges, and histograms named in §4.14 and registers
/// them into a [`MetricsRegistry`] at construction. Collectors elsewhere in
/// the crate hold an `Arc<MetricsCollector>` and call the narrow `record_*`
/// methods rather than touching `prometheus` types directly.
pub struct MetricsCollector {
    events_total: IntCounter,
    events_failed: IntCounter,
    alerts_total: IntCounter,
    queue_depth: IntGauge,
    active_workers: IntGauge,
    pool_active_connections: IntGauge,
    processing_latency_ms: Histogram,
    db_query_ms: Histogram,
}

impl MetricsCollector {
    pub fn new(registry: &MetricsRegistry) -> Result<Self, prometheus::Error> {
        let events_total = IntCounter::with_opts(Opts::new("events_total", "Total audit events accepted by the producer"))?;
        let events_failed = IntCounter::with_opts(Opts::new("events_failed", "Audit events that failed validation or sealing"))?;
        let alerts_total = IntCounter::with_opts(Opts::new("alerts_total", "Alerts dispatched to handlers"))?;
        let queue_depth = IntGauge::with_opts(Opts::new("queue_depth", "Pending + delayed jobs in the durable queue"))?;
        let active_workers = IntGauge::with_opts(Opts::new("active_workers", "Workers currently holding a leased job"))?;
        let pool_active_connections = IntGauge::with_opts(Opts::new("pool_active_connections", "Database connections currently checked out"))?;
        let processing_latency_ms = Histogram::with_opts(
            HistogramOpts::new("processing_latency_ms", "Time from dequeue to ack or dead-letter")
                .buckets(vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 5_000.0, 30_000.0]),
        )?;
        let db_query_ms = Histogram::with_opts(
            HistogramOpts::new("db_query_ms", "Database query duration as observed by the enhanced client")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1_000.0]),
        )?;

        registry.register(events_total.clone())?;
        registry.register(events_failed.clone())?;
        registry.register(alerts_total.clone())?;
        registry.register(queue_depth.clone())?;
        registry.register(active_workers.clone())?;
        registry.register(pool_active_connections.clone())?;
        registry.register(processing_latency_ms.clone())?;
        registry.register(db_query_ms.clone())?;

        Ok(Self {
            events_total,
            events_failed,
            alerts_total,
            queue_depth,
            active_workers,
            pool_active_connections,
            processing_latency_ms,
            db_query_ms,
        })
    }

    pub fn record_event_accepted(&self) {
        self.events_total.inc();
    }

    pub fn record_event_failed(&self) {
        self.events_failed.inc();
    }

    pub fn record_alert_dispatched(&self) {
        self.alerts_total.inc();
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.set(depth as i64);
    }

    pub fn set_active_workers(&self, count: usize) {
        self.active_workers.set(count as i64);
    }

    pub fn set_pool_active_connections(&self, count: u32) {
        self.pool_active_connections.set(count as i64);
    }

    pub fn observe_processing_latency_ms(&self, millis: f64) {
        self.processing_latency_ms.observe(millis);
    }

    pub fn observe_db_query_ms(&self, millis: f64) {
        self.db_query_ms.observe(millis);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.processing_latency_ms.get_sample_count();
        let db = self.db_query_ms.get_sample_count();
        MetricsSnapshot {
            events_total: self.events_total.get(),
            events_failed: self.events_failed.get(),
            alerts_total: self.alerts_total.get(),
            queue_depth: self.queue_depth.get(),
            active_workers: self.active_workers.get(),
            pool_active_connections: self.pool_active_connections.get(),
            processing_latency_ms_count: latency,
            processing_latency_ms_sum: self.processing_latency_ms.get_sample_sum(),
            db_query_ms_count: db,
            db_query_ms_sum: self.db_query_ms.get_sample_sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;

    #[test]
    fn records_accumulate_into_the_snapshot() {
        let registry = MetricsRegistry::new(MetricsConfig::default());
        let collector = MetricsCollector::new(&registry).unwrap();

        collector.record_event_accepted();
        collector.record_event_accepted();
        collector.record_event_failed();
        collector.set_queue_depth(42);
        collector.observe_processing_latency_ms(12.5);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.events_total, 2);
        assert_eq!(snapshot.events_failed, 1);
        assert_eq!(snapshot.queue_depth, 42);
        assert_eq!(snapshot.processing_latency_ms_count, 1);
    }

    #[test]
    fn registering_twice_on_the_same_registry_fails_cleanly() {
        let registry = MetricsRegistry::new(MetricsConfig::default());
        let _first = MetricsCollector::new(&registry).unwrap();
        assert!(MetricsCollector::new(&registry).is_err());
    }
}
