//! Schema, field-length, and compliance-profile validation applied before
//! an event reaches the sealer.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::audit::event::{AuditEvent, DataClassification};
use crate::error::{ErrorCode, Result};
use crate::Error;

static ACTION_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9._-]*$").unwrap());

/// Data-subject-rights actions that require `dataSubjectId` under the GDPR
/// profile (checked against `event.details["dataSubjectId"]`, since the
/// field isn't part of the stable schema).
const GDPR_SUBJECT_RIGHTS_ACTIONS: &[&str] =
    &["data.export", "data.delete", "data.pseudonymize", "data.access_request"];

/// A named set of additional validation rules layered on top of the base
/// schema checks. Enforced profiles are supplied per call by the producer
/// (`options.compliance`) plus any profile the deployment always enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplianceProfile {
    Hipaa,
    Gdpr,
}

impl ComplianceProfile {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "hipaa" => Some(ComplianceProfile::Hipaa),
            "gdpr" => Some(ComplianceProfile::Gdpr),
            _ => None,
        }
    }
}

pub struct Validator {
    pub max_string_length: usize,
    pub max_details_depth: u32,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            max_string_length: 10_000,
            max_details_depth: 3,
        }
    }
}

impl Validator {
    pub fn new(max_string_length: usize, max_details_depth: u32) -> Self {
        Self {
            max_string_length,
            max_details_depth,
        }
    }

    /// Validates `event` against base schema rules plus every profile in
    /// `profiles`. Returns the first violation found as a non-retryable
    /// `ValidationFailed` error; the pipeline never attempts to repair or
    /// partially accept an invalid event.
    pub fn validate(&self, event: &AuditEvent, profiles: &[ComplianceProfile]) -> Result<()> {
        self.validate_string_lengths(event)?;
        self.validate_action(&event.action)?;
        self.validate_details_shape(&event.details)?;

        for profile in profiles {
            match profile {
                ComplianceProfile::Hipaa => self.validate_hipaa(event)?,
                ComplianceProfile::Gdpr => self.validate_gdpr(event)?,
            }
        }

        Ok(())
    }

    /// Applies the length cap to every string field on `event` (§4.3: "the
    /// cap applies to every string field", not just the handful checked on
    /// the stable schema) plus every string leaf inside `details`.
    fn validate_string_lengths(&self, event: &AuditEvent) -> Result<()> {
        let fields: [(&str, Option<&str>); 9] = [
            ("action", Some(event.action.as_str())),
            ("principalId", event.principal_id.as_deref()),
            ("organizationId", event.organization_id.as_deref()),
            ("targetResourceType", event.target_resource_type.as_deref()),
            ("targetResourceId", event.target_resource_id.as_deref()),
            ("outcomeDescription", event.outcome_description.as_deref()),
            ("retentionPolicy", event.retention_policy.as_deref()),
            ("correlationId", event.correlation_id.as_deref()),
            ("eventVersion", Some(event.event_version.as_str())),
        ];

        for (name, value) in fields {
            if let Some(value) = value {
                if value.len() > self.max_string_length {
                    return Err(validation_error(format!(
                        "field '{}' exceeds maximum length of {} characters",
                        name, self.max_string_length
                    )));
                }
            }
        }

        for (key, value) in &event.details {
            check_detail_string_lengths(key, value, self.max_string_length)?;
        }

        Ok(())
    }

    fn validate_action(&self, action: &str) -> Result<()> {
        if !ACTION_PATTERN.is_match(action) {
            return Err(validation_error(format!(
                "action '{}' does not match required pattern ^[a-z][a-z0-9._-]*$",
                action
            )));
        }
        Ok(())
    }

    fn validate_details_shape(&self, details: &std::collections::HashMap<String, Value>) -> Result<()> {
        for (key, value) in details {
            if depth_of(value) > self.max_details_depth {
                return Err(validation_error(format!(
                    "details field '{}' exceeds maximum nesting depth of {}",
                    key, self.max_details_depth
                )));
            }
        }
        Ok(())
    }

    fn validate_hipaa(&self, event: &AuditEvent) -> Result<()> {
        if !matches!(event.data_classification, Some(DataClassification::Phi)) {
            return Ok(());
        }

        if event.principal_id.is_none() {
            return Err(validation_error("PHI events require principalId"));
        }
        if event.target_resource_type.is_none() {
            return Err(validation_error("PHI events require targetResourceType"));
        }
        if event.session_context.is_none() {
            return Err(validation_error("PHI events require sessionContext"));
        }

        Ok(())
    }

    fn validate_gdpr(&self, event: &AuditEvent) -> Result<()> {
        if !event.details.contains_key("legalBasis") {
            return Err(validation_error("GDPR profile requires legalBasis"));
        }

        if GDPR_SUBJECT_RIGHTS_ACTIONS.contains(&event.action.as_str())
            && !event.details.contains_key("dataSubjectId")
        {
            return Err(validation_error(format!(
                "action '{}' requires dataSubjectId under the GDPR profile",
                event.action
            )));
        }

        Ok(())
    }
}

fn validation_error(message: impl Into<String>) -> Error {
    Error::new(ErrorCode::ValidationFailed, message.into())
}

/// Depth of a JSON value tree; a scalar is depth 0, `{"a": 1}` is depth 1.
/// `serde_json::Value` is acyclic by construction (it's a tree, not a
/// graph), so this only needs to guard against pathologically deep nesting,
/// not true cycles.
fn depth_of(value: &Value) -> u32 {
    match value {
        Value::Object(map) => 1 + map.values().map(depth_of).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(depth_of).max().unwrap_or(0),
        _ => 0,
    }
}

/// Walks a `details` value tree checking every string leaf against the
/// length cap, mirroring `depth_of`'s traversal shape.
fn check_detail_string_lengths(key: &str, value: &Value, max_len: usize) -> Result<()> {
    match value {
        Value::String(s) => {
            if s.len() > max_len {
                return Err(validation_error(format!(
                    "details field '{}' exceeds maximum length of {} characters",
                    key, max_len
                )));
            }
            Ok(())
        }
        Value::Object(map) => {
            for (nested_key, nested_value) in map {
                check_detail_string_lengths(nested_key, nested_value, max_len)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                check_detail_string_lengths(key, item, max_len)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{EventStatus, SessionContext};
    use serde_json::json;

    fn base_event() -> AuditEvent {
        AuditEvent::builder("auth.login.success", EventStatus::Success).build()
    }

    #[test]
    fn rejects_action_not_matching_pattern() {
        let validator = Validator::default();
        let event = AuditEvent::builder("Auth.Login", EventStatus::Success).build();
        assert!(validator.validate(&event, &[]).is_err());
    }

    #[test]
    fn rejects_details_deeper_than_cap() {
        let validator = Validator::new(10_000, 2);
        let mut event = base_event();
        event
            .details
            .insert("nested".to_string(), json!({"a": {"b": {"c": 1}}}));
        assert!(validator.validate(&event, &[]).is_err());
    }

    #[test]
    fn hipaa_profile_requires_session_context_for_phi() {
        let validator = Validator::default();
        let mut event = AuditEvent::builder("data.read", EventStatus::Success)
            .principal_id("user-1")
            .target("patient_record", "rec-1")
            .data_classification(DataClassification::Phi)
            .build();

        assert!(validator.validate(&event, &[ComplianceProfile::Hipaa]).is_err());

        event.session_context = Some(SessionContext {
            session_id: "sess-1".to_string(),
            ip_address: None,
            user_agent: None,
        });
        assert!(validator.validate(&event, &[ComplianceProfile::Hipaa]).is_ok());
    }

    #[test]
    fn hipaa_profile_ignores_non_phi_events() {
        let validator = Validator::default();
        let event = base_event();
        assert!(validator.validate(&event, &[ComplianceProfile::Hipaa]).is_ok());
    }

    #[test]
    fn gdpr_profile_requires_data_subject_id_for_subject_rights_actions() {
        let validator = Validator::default();
        let mut event = AuditEvent::builder("data.export", EventStatus::Success).build();
        event.details.insert("legalBasis".to_string(), json!("consent"));
        assert!(validator.validate(&event, &[ComplianceProfile::Gdpr]).is_err());

        event.details.insert("dataSubjectId".to_string(), json!("subject-1"));
        assert!(validator.validate(&event, &[ComplianceProfile::Gdpr]).is_ok());
    }

    #[test]
    fn unknown_fields_in_details_pass_through_without_error() {
        let validator = Validator::default();
        let mut event = base_event();
        event.details.insert("customField".to_string(), json!("anything"));
        assert!(validator.validate(&event, &[]).is_ok());
    }

    #[test]
    fn rejects_an_oversized_retention_policy() {
        let validator = Validator::new(10, 3);
        let mut event = base_event();
        event.retention_policy = Some("well-beyond-ten-characters".to_string());
        assert!(validator.validate(&event, &[]).is_err());
    }

    #[test]
    fn rejects_an_oversized_correlation_id() {
        let validator = Validator::new(10, 3);
        let mut event = base_event();
        event.correlation_id = Some("well-beyond-ten-characters".to_string());
        assert!(validator.validate(&event, &[]).is_err());
    }

    #[test]
    fn rejects_an_oversized_string_leaf_nested_inside_details() {
        let validator = Validator::new(10, 3);
        let mut event = base_event();
        event
            .details
            .insert("nested".to_string(), json!({"note": "well-beyond-ten-characters"}));
        assert!(validator.validate(&event, &[]).is_err());
    }

    #[test]
    fn accepts_a_details_array_of_short_strings() {
        let validator = Validator::new(10, 3);
        let mut event = base_event();
        event.details.insert("tags".to_string(), json!(["a", "b", "c"]));
        assert!(validator.validate(&event, &[]).is_ok());
    }
}
