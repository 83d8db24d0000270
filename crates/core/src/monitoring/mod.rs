pub mod alert;
pub mod alerting_service;
pub mod pattern_detector;

pub use alert::{
    Alert, AlertFilter, AlertHandler, AlertSeverity, AlertStats, AlertStatus, ConsoleAlertHandler, DatabaseAlertHandler,
    EmailAlertHandler, PostgresAlertStore, WebhookAlertHandler,
};
pub use alerting_service::{AcceptOutcome, AlertingService};
pub use pattern_detector::PatternDetector;
