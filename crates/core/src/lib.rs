pub mod audit;
pub mod canonical;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod monitoring;
pub mod security;
pub mod storage;
pub mod telemetry;

pub use audit::{AuditEvent, AuditEventBuilder, EventStatus};
pub use config::{Config, PipelineConfig};
pub use error::{Error, ErrorCode, ErrorContext, ErrorMetrics, Result};
pub use jobs::{CircuitBreaker, CircuitState, DeadLetterHandler, ErrorClass, QueueProducer, ReliableProcessor};
pub use metrics::{MetricsCollector, MetricsRegistry};
pub use monitoring::{Alert, AlertHandler, AlertSeverity, AlertingService, PatternDetector};
pub use storage::{DbClient, PartitionManager, StorageWriter};
pub use telemetry::{TraceSpan, Tracer};

// Re-export commonly used types from dependencies
pub use uuid::Uuid;
pub use chrono::{DateTime, Utc};
