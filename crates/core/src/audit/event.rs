use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::canonical::{canonicalize, CanonicalField};

/// Lifecycle status of the action being recorded, not of the event's
/// delivery through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Attempt,
    Success,
    Failure,
}

/// Sensitivity tag driving retention and compliance-profile enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataClassification {
    Public,
    Internal,
    Confidential,
    #[serde(rename = "PHI")]
    Phi,
}

/// Signing scheme used for `signature`. HMAC is produced locally; the RSA
/// variants are produced by forwarding canonical bytes to a KMS collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    #[serde(rename = "HMAC-SHA256")]
    HmacSha256,
    #[serde(rename = "RSASSA_PSS_SHA_256")]
    RsassaPssSha256,
    #[serde(rename = "RSASSA_PSS_SHA_384")]
    RsassaPssSha384,
    #[serde(rename = "RSASSA_PSS_SHA_512")]
    RsassaPssSha512,
    #[serde(rename = "RSASSA_PKCS1_V1_5_SHA_256")]
    RsassaPkcs1V15Sha256,
    #[serde(rename = "RSASSA_PKCS1_V1_5_SHA_384")]
    RsassaPkcs1V15Sha384,
    #[serde(rename = "RSASSA_PKCS1_V1_5_SHA_512")]
    RsassaPkcs1V15Sha512,
}

impl SigningAlgorithm {
    /// Whether this variant is produced by the local HMAC secret (`true`) or
    /// must be forwarded to the KMS collaborator (`false`).
    pub fn is_local(&self) -> bool {
        matches!(self, SigningAlgorithm::HmacSha256)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SigningAlgorithm::HmacSha256 => "HMAC-SHA256",
            SigningAlgorithm::RsassaPssSha256 => "RSASSA_PSS_SHA_256",
            SigningAlgorithm::RsassaPssSha384 => "RSASSA_PSS_SHA_384",
            SigningAlgorithm::RsassaPssSha512 => "RSASSA_PSS_SHA_512",
            SigningAlgorithm::RsassaPkcs1V15Sha256 => "RSASSA_PKCS1_V1_5_SHA_256",
            SigningAlgorithm::RsassaPkcs1V15Sha384 => "RSASSA_PKCS1_V1_5_SHA_384",
            SigningAlgorithm::RsassaPkcs1V15Sha512 => "RSASSA_PKCS1_V1_5_SHA_512",
        }
    }
}

impl std::fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of the caller and request at the time the action happened.
/// Required for PHI events under the HIPAA compliance profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// The immutable audit record. Once [`crate::audit::seal::Sealer`] has
/// computed `hash` (and optionally `signature`), the critical fields below
/// must never be mutated — that's the tamper-evidence contract the rest of
/// the pipeline relies on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Preserved as received — `DateTime<FixedOffset>` rather than
    /// `DateTime<Utc>` so a non-UTC input offset survives construction and
    /// round-trips through canonicalization and hashing unchanged (§4.1).
    pub timestamp: DateTime<FixedOffset>,
    pub action: String,
    pub status: EventStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_context: Option<SessionContext>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_resource_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_classification: Option<DataClassification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome_description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_algorithm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<SigningAlgorithm>,
    pub event_version: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_latency: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub details: HashMap<String, Value>,
}

impl AuditEvent {
    pub fn builder(action: impl Into<String>, status: EventStatus) -> AuditEventBuilder {
        AuditEventBuilder::new(action, status)
    }

    /// Canonical bytes used as the input to both hashing and signing. Field
    /// order is lexicographic by field name, matching the canonicalizer's
    /// contract; absent optional fields are dropped rather than encoded
    /// empty.
    pub fn canonical_bytes(&self) -> String {
        canonicalize(&[
            ("action", CanonicalField::Str(&self.action)),
            ("organizationId", CanonicalField::OptStr(self.organization_id.as_deref())),
            ("outcomeDescription", CanonicalField::OptStr(self.outcome_description.as_deref())),
            ("principalId", CanonicalField::OptStr(self.principal_id.as_deref())),
            ("status", CanonicalField::Str(self.status.as_str())),
            ("targetResourceId", CanonicalField::OptStr(self.target_resource_id.as_deref())),
            ("targetResourceType", CanonicalField::OptStr(self.target_resource_type.as_deref())),
            ("timestamp", CanonicalField::Timestamp(self.timestamp)),
        ])
    }

    /// True when `data_classification` requires HIPAA's `sessionContext`
    /// presence invariant to be enforced by the validator.
    pub fn is_phi(&self) -> bool {
        matches!(self.data_classification, Some(DataClassification::Phi))
    }

    /// Internally generated events (e.g. the alerting service logging its
    /// own dispatch) are tagged this way so pattern detectors can exclude
    /// them and avoid feedback loops.
    pub fn is_from_audit_system(&self) -> bool {
        self.details
            .get("source")
            .and_then(|v| v.as_str())
            .map(|s| s == "audit-system")
            .unwrap_or(false)
    }
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Attempt => "attempt",
            EventStatus::Success => "success",
            EventStatus::Failure => "failure",
        }
    }
}

impl DataClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataClassification::Public => "PUBLIC",
            DataClassification::Internal => "INTERNAL",
            DataClassification::Confidential => "CONFIDENTIAL",
            DataClassification::Phi => "PHI",
        }
    }
}

impl std::fmt::Display for DataClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Builds an [`AuditEvent`] field by field. Mirrors the construction style
/// used elsewhere in this crate for multi-field domain records: required
/// fields are constructor arguments, everything else is a chained setter.
pub struct AuditEventBuilder {
    event: AuditEvent,
}

impl AuditEventBuilder {
    pub fn new(action: impl Into<String>, status: EventStatus) -> Self {
        Self {
            event: AuditEvent {
                timestamp: Utc::now().into(),
                action: action.into(),
                status,
                principal_id: None,
                organization_id: None,
                session_context: None,
                target_resource_type: None,
                target_resource_id: None,
                data_classification: None,
                retention_policy: None,
                correlation_id: None,
                outcome_description: None,
                hash: None,
                hash_algorithm: None,
                signature: None,
                algorithm: None,
                event_version: "1.0".to_string(),
                processing_latency: None,
                archived_at: None,
                details: HashMap::new(),
            },
        }
    }

    pub fn timestamp(mut self, timestamp: DateTime<FixedOffset>) -> Self {
        self.event.timestamp = timestamp;
        self
    }

    pub fn principal_id(mut self, principal_id: impl Into<String>) -> Self {
        self.event.principal_id = Some(principal_id.into());
        self
    }

    pub fn organization_id(mut self, organization_id: impl Into<String>) -> Self {
        self.event.organization_id = Some(organization_id.into());
        self
    }

    pub fn session_context(mut self, session_context: SessionContext) -> Self {
        self.event.session_context = Some(session_context);
        self
    }

    pub fn target(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.event.target_resource_type = Some(resource_type.into());
        self.event.target_resource_id = Some(resource_id.into());
        self
    }

    pub fn data_classification(mut self, classification: DataClassification) -> Self {
        self.event.data_classification = Some(classification);
        self
    }

    pub fn retention_policy(mut self, policy: impl Into<String>) -> Self {
        self.event.retention_policy = Some(policy.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.event.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn outcome_description(mut self, description: impl Into<String>) -> Self {
        self.event.outcome_description = Some(description.into());
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.event.details.insert(key.into(), value);
        self
    }

    pub fn build(self) -> AuditEvent {
        self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_bytes_omit_absent_fields_and_sort_lexicographically() {
        let event = AuditEvent::builder("auth.login.success", EventStatus::Success)
            .timestamp("2024-06-01T10:00:00.000Z".parse().unwrap())
            .principal_id("user-1")
            .organization_id("org-1")
            .build();

        assert_eq!(
            event.canonical_bytes(),
            "action=auth.login.success|organizationId=org-1|principalId=user-1|status=success|timestamp=2024-06-01T10:00:00.000+00:00"
        );
    }

    #[test]
    fn canonical_bytes_preserve_a_non_utc_offset() {
        let event = AuditEvent::builder("auth.login.success", EventStatus::Success)
            .timestamp("2026-01-15T10:30:00.000+05:30".parse().unwrap())
            .build();

        assert!(event.canonical_bytes().ends_with("timestamp=2026-01-15T10:30:00.000+05:30"));
    }

    #[test]
    fn canonical_bytes_are_order_independent_of_builder_call_order() {
        let a = AuditEvent::builder("x.y", EventStatus::Attempt)
            .principal_id("p")
            .organization_id("o")
            .build();
        let b = AuditEvent::builder("x.y", EventStatus::Attempt)
            .organization_id("o")
            .principal_id("p")
            .build();
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn phi_classification_is_detected() {
        let event = AuditEvent::builder("data.read", EventStatus::Success)
            .data_classification(DataClassification::Phi)
            .build();
        assert!(event.is_phi());
    }
}
