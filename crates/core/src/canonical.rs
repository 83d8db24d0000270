//! Deterministic canonical encoding of an event's critical fields.
//!
//! The hash and signature produced by the sealer are only meaningful if two
//! independent processes reading the same logical event produce the exact
//! same bytes to hash. This module owns that contract: given the same set of
//! critical fields, [`canonicalize`] always returns the same `String`,
//! independent of map insertion order, `Option` representation, or floating
//! point formatting quirks.
//!
//! Rules, in order:
//! - Fields are joined in a fixed, caller-specified order (never sorted at
//!   runtime by key name — the caller's order *is* the canonical order).
//! - A field whose value is `None` is omitted entirely, not encoded as an
//!   empty string. An explicit empty string still participates.
//! - Strings are UTF-8, unescaped except for the field separator itself.
//! - Booleans render as `true`/`false`.
//! - Timestamps render as RFC 3339 with millisecond precision, offset
//!   preserved from the original value rather than normalized to UTC.
//! - Fields are joined with `|`; each field is `name=value`.

use chrono::{DateTime, FixedOffset, SecondsFormat};
use std::fmt::Write as _;

/// One field contributed to the canonical form.
pub enum CanonicalField<'a> {
    Str(&'a str),
    OptStr(Option<&'a str>),
    Timestamp(DateTime<FixedOffset>),
    OptTimestamp(Option<DateTime<FixedOffset>>),
    Bool(bool),
    U64(u64),
}

/// Builds the canonical string for a fixed, ordered list of named fields.
///
/// `name=value` pairs are joined with `|`. Fields whose value is absent
/// (`None`) are dropped from the output — they do not leave a placeholder —
/// so that an absent field and a field never set by an older event version
/// canonicalize identically.
pub fn canonicalize(fields: &[(&str, CanonicalField<'_>)]) -> String {
    let mut out = String::new();
    let mut first = true;

    for (name, value) in fields {
        let rendered = match value {
            CanonicalField::Str(s) => Some(escape(s)),
            CanonicalField::OptStr(opt) => opt.map(|s| escape(s)),
            CanonicalField::Timestamp(ts) => Some(render_timestamp(*ts)),
            CanonicalField::OptTimestamp(opt) => opt.map(|ts| render_timestamp(ts)),
            CanonicalField::Bool(b) => Some(b.to_string()),
            CanonicalField::U64(n) => Some(n.to_string()),
        };

        if let Some(rendered) = rendered {
            if !first {
                out.push('|');
            }
            first = false;
            let _ = write!(out, "{}={}", name, rendered);
        }
    }

    out
}

fn render_timestamp(ts: DateTime<FixedOffset>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, false)
}

/// Escapes the two characters that would otherwise be ambiguous in the
/// `name=value|name=value` encoding: the field separator and the key/value
/// separator, each written as literal backslash escapes.
fn escape(value: &str) -> String {
    if !value.contains('|') && !value.contains('\\') {
        return value.to_string();
    }
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '|' => escaped.push_str("\\|"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn ts() -> DateTime<FixedOffset> {
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 30, 0).unwrap().into()
    }

    #[test]
    fn omits_absent_optional_fields() {
        let with_field = canonicalize(&[
            ("action", CanonicalField::Str("LOGIN")),
            ("session", CanonicalField::OptStr(Some("sess-1"))),
        ]);
        let without_field = canonicalize(&[
            ("action", CanonicalField::Str("LOGIN")),
            ("session", CanonicalField::OptStr(None)),
        ]);

        assert_eq!(with_field, "action=LOGIN|session=sess-1");
        assert_eq!(without_field, "action=LOGIN");
        assert_ne!(with_field, without_field);
    }

    #[test]
    fn distinguishes_empty_string_from_absent() {
        let empty = canonicalize(&[("session", CanonicalField::OptStr(Some("")))]);
        let absent = canonicalize(&[("session", CanonicalField::OptStr(None))]);
        assert_eq!(empty, "session=");
        assert_eq!(absent, "");
        assert_ne!(empty, absent);
    }

    #[test]
    fn order_is_caller_specified_not_sorted() {
        let a = canonicalize(&[
            ("b", CanonicalField::Str("2")),
            ("a", CanonicalField::Str("1")),
        ]);
        assert_eq!(a, "b=2|a=1");
    }

    #[test]
    fn timestamp_is_millisecond_rfc3339() {
        let rendered = canonicalize(&[("ts", CanonicalField::Timestamp(ts()))]);
        assert_eq!(rendered, "ts=2026-01-15T10:30:00.000+00:00");
    }

    #[test]
    fn timestamp_preserves_a_non_utc_offset() {
        let offset = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
        let with_offset = offset.with_ymd_and_hms(2026, 1, 15, 16, 0, 0).unwrap();
        let rendered = canonicalize(&[("ts", CanonicalField::Timestamp(with_offset))]);
        assert_eq!(rendered, "ts=2026-01-15T16:00:00.000+05:30");
    }

    #[test]
    fn escapes_separator_characters_in_values() {
        let rendered = canonicalize(&[("action", CanonicalField::Str("A|B\\C"))]);
        assert_eq!(rendered, "action=A\\|B\\\\C");
    }

    #[test]
    fn bool_and_numeric_fields_render_plainly() {
        let rendered = canonicalize(&[
            ("archived", CanonicalField::Bool(false)),
            ("latency", CanonicalField::U64(42)),
        ]);
        assert_eq!(rendered, "archived=false|latency=42");
    }
}
