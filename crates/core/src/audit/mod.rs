pub mod event;
pub mod preset;
pub mod producer;
pub mod seal;
pub mod validator;

pub use event::{AuditEvent, AuditEventBuilder, DataClassification, EventStatus, SessionContext, SigningAlgorithm};
pub use preset::{InMemoryPresetStore, Preset, PresetResolver, PresetStore, PresetTemplate};
pub use producer::{AuditProducer, LogOptions};
pub use seal::Sealer;
pub use validator::{ComplianceProfile, Validator};
