//! TraceSpan entity (§3) and OTLP/HTTP wire encoding (§6).

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanStatus {
    Ok,
    Error,
    Timeout,
    Cancelled,
}

impl SpanStatus {
    /// OTLP status codes: 0 = unset, 1 = ok, 2 = error. `Timeout` and
    /// `Cancelled` are this crate's finer-grained statuses and both map to
    /// OTLP's error code, since OTLP has no dedicated slot for them.
    fn otlp_code(&self) -> u8 {
        match self {
            SpanStatus::Ok => 1,
            SpanStatus::Error | SpanStatus::Timeout | SpanStatus::Cancelled => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanLog {
    pub timestamp_unix_ns: u64,
    pub fields: HashMap<String, Value>,
}

/// One operation span. `trace_id`/`span_id` are stored as lowercase hex (16
/// and 8 bytes respectively) internally; OTLP export base64-encodes the raw
/// bytes at the wire boundary rather than carrying hex through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSpan {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub operation_name: String,
    pub start_unix_ns: u64,
    pub end_unix_ns: Option<u64>,
    pub tags: HashMap<String, Value>,
    pub logs: Vec<SpanLog>,
    pub status: SpanStatus,
}

impl TraceSpan {
    /// Starts a new root span with a freshly generated trace id.
    pub fn start_root(operation_name: impl Into<String>) -> Self {
        Self::start(Self::generate_id(16), None, operation_name)
    }

    /// Starts a child span sharing `trace_id` with its parent.
    pub fn start_child(trace_id: impl Into<String>, parent_span_id: impl Into<String>, operation_name: impl Into<String>) -> Self {
        Self::start(trace_id.into(), Some(parent_span_id.into()), operation_name)
    }

    fn start(trace_id: String, parent_span_id: Option<String>, operation_name: impl Into<String>) -> Self {
        Self {
            trace_id,
            span_id: Self::generate_id(8),
            parent_span_id,
            operation_name: operation_name.into(),
            start_unix_ns: now_unix_ns(),
            end_unix_ns: None,
            tags: HashMap::new(),
            logs: Vec::new(),
            status: SpanStatus::Ok,
        }
    }

    fn generate_id(bytes: usize) -> String {
        let mut buf = vec![0u8; bytes];
        rand::thread_rng().fill_bytes(&mut buf);
        hex::encode(buf)
    }

    pub fn tag(&mut self, key: impl Into<String>, value: Value) {
        self.tags.insert(key.into(), value);
    }

    pub fn log(&mut self, fields: HashMap<String, Value>) {
        self.logs.push(SpanLog {
            timestamp_unix_ns: now_unix_ns(),
            fields,
        });
    }

    pub fn finish(&mut self, status: SpanStatus) {
        self.end_unix_ns = Some(now_unix_ns());
        self.status = status;
    }

    pub fn is_finished(&self) -> bool {
        self.end_unix_ns.is_some()
    }
}

fn now_unix_ns() -> u64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64
}

/// OTLP/HTTP JSON body shape (§6): `resourceSpans[].{resource, scopeSpans[].{scope, spans[]}}`.
#[derive(Debug, Serialize)]
pub struct OtlpExportRequest {
    #[serde(rename = "resourceSpans")]
    pub resource_spans: Vec<OtlpResourceSpans>,
}

#[derive(Debug, Serialize)]
pub struct OtlpResourceSpans {
    pub resource: OtlpResource,
    #[serde(rename = "scopeSpans")]
    pub scope_spans: Vec<OtlpScopeSpans>,
}

#[derive(Debug, Serialize)]
pub struct OtlpResource {
    pub attributes: Vec<OtlpAttribute>,
}

#[derive(Debug, Serialize)]
pub struct OtlpScopeSpans {
    pub scope: OtlpScope,
    pub spans: Vec<OtlpSpan>,
}

#[derive(Debug, Serialize)]
pub struct OtlpScope {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct OtlpAttribute {
    pub key: String,
    pub value: OtlpAttributeValue,
}

#[derive(Debug, Serialize)]
pub struct OtlpAttributeValue {
    #[serde(rename = "stringValue")]
    pub string_value: String,
}

#[derive(Debug, Serialize)]
pub struct OtlpSpan {
    #[serde(rename = "traceId")]
    pub trace_id: String,
    #[serde(rename = "spanId")]
    pub span_id: String,
    #[serde(rename = "parentSpanId", skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub name: String,
    pub kind: u8,
    #[serde(rename = "startTimeUnixNano")]
    pub start_time_unix_nano: String,
    #[serde(rename = "endTimeUnixNano")]
    pub end_time_unix_nano: String,
    pub attributes: Vec<OtlpAttribute>,
    pub status: OtlpStatus,
}

#[derive(Debug, Serialize)]
pub struct OtlpStatus {
    pub code: u8,
}

/// OTLP span kind; this crate only ever emits internal pipeline-stage
/// spans, so `kind` is always `INTERNAL` (1) rather than a full mapping
/// from caller-supplied span roles.
const OTLP_KIND_INTERNAL: u8 = 1;

/// Encodes `trace_id`/`span_id` hex into OTLP's base64 wire form and
/// converts nanosecond timestamps to the decimal-string encoding OTLP/HTTP
/// JSON requires.
pub fn to_otlp_span(span: &TraceSpan) -> OtlpSpan {
    let trace_id_bytes = hex::decode(&span.trace_id).unwrap_or_default();
    let span_id_bytes = hex::decode(&span.span_id).unwrap_or_default();

    OtlpSpan {
        trace_id: STANDARD.encode(trace_id_bytes),
        span_id: STANDARD.encode(span_id_bytes),
        parent_span_id: span.parent_span_id.as_ref().map(|p| STANDARD.encode(hex::decode(p).unwrap_or_default())),
        name: span.operation_name.clone(),
        kind: OTLP_KIND_INTERNAL,
        start_time_unix_nano: span.start_unix_ns.to_string(),
        end_time_unix_nano: span.end_unix_ns.unwrap_or(span.start_unix_ns).to_string(),
        attributes: span
            .tags
            .iter()
            .map(|(k, v)| OtlpAttribute {
                key: k.clone(),
                value: OtlpAttributeValue {
                    string_value: v.to_string(),
                },
            })
            .collect(),
        status: OtlpStatus { code: span.status.otlp_code() },
    }
}

pub fn build_otlp_request(spans: &[TraceSpan], service_name: &str) -> OtlpExportRequest {
    OtlpExportRequest {
        resource_spans: vec![OtlpResourceSpans {
            resource: OtlpResource {
                attributes: vec![OtlpAttribute {
                    key: "service.name".to_string(),
                    value: OtlpAttributeValue {
                        string_value: service_name.to_string(),
                    },
                }],
            },
            scope_spans: vec![OtlpScopeSpans {
                scope: OtlpScope {
                    name: "audit-pipeline".to_string(),
                },
                spans: spans.iter().map(to_otlp_span).collect(),
            }],
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_span_generates_sixteen_byte_trace_id() {
        let span = TraceSpan::start_root("ingest");
        assert_eq!(span.trace_id.len(), 32);
        assert_eq!(span.span_id.len(), 16);
        assert!(span.parent_span_id.is_none());
    }

    #[test]
    fn child_span_shares_trace_id_with_parent() {
        let root = TraceSpan::start_root("ingest");
        let child = TraceSpan::start_child(root.trace_id.clone(), root.span_id.clone(), "validate");
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
    }

    #[test]
    fn finish_sets_end_time_and_status() {
        let mut span = TraceSpan::start_root("seal");
        assert!(!span.is_finished());
        span.finish(SpanStatus::Ok);
        assert!(span.is_finished());
    }

    #[test]
    fn otlp_span_base64_encodes_ids() {
        let span = TraceSpan::start_root("persist");
        let otlp = to_otlp_span(&span);
        assert_eq!(otlp.kind, OTLP_KIND_INTERNAL);
        assert!(!otlp.trace_id.contains(':'));
    }
}
