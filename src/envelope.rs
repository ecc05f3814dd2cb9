//! Event envelope: the fixed-shape wrapper carried by every stream.
//!
//! The envelope is immutable after append. Strictness (rejecting unknown
//! top-level fields) is what makes a `vN` schema frozen in practice, so
//! validation runs against the raw JSON value rather than relying on serde's
//! default (lossy) deserialization.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Top-level envelope fields the strict validator knows about.
const KNOWN_FIELDS: &[&str] = &[
    "event_id",
    "trace_id",
    "produced_at",
    "schema",
    "schema_version",
    "payload",
    "source_service",
];

const REQUIRED_FIELDS: &[&str] = &[
    "event_id",
    "trace_id",
    "produced_at",
    "schema",
    "schema_version",
    "payload",
];

/// The decoded, typed envelope. Every stream carries values of this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: String,
    pub trace_id: String,
    pub produced_at: DateTime<FixedOffset>,
    pub schema: String,
    pub schema_version: u32,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_service: Option<String>,
}

impl Envelope {
    pub fn new(
        event_id: impl Into<String>,
        trace_id: impl Into<String>,
        produced_at: DateTime<FixedOffset>,
        schema: impl Into<String>,
        payload: Value,
    ) -> Result<Self, ValidationKind> {
        let schema = schema.into();
        let descriptor = SchemaDescriptor::parse(&schema)?;
        Ok(Self {
            event_id: event_id.into(),
            trace_id: trace_id.into(),
            produced_at,
            schema,
            schema_version: descriptor.major,
            payload,
            source_service: None,
        })
    }

    pub fn with_source_service(mut self, source: impl Into<String>) -> Self {
        self.source_service = Some(source.into());
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Envelope always serializes")
    }

    /// Decode raw bytes into an envelope. Corrupt bytes never yield a
    /// partially-populated envelope; decode either fully succeeds or fails.
    pub fn decode(bytes: &[u8]) -> Result<Self, ValidationKind> {
        serde_json::from_slice(bytes)
            .map_err(|e| ValidationKind::PayloadInvalid {
                path: "$".to_string(),
                reason: format!("corrupt envelope bytes: {e}"),
            })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("Envelope always serializes")
    }
}

/// `<layer>.<entity>.<event>.v<major>` parsed out of `schema`.
///
/// A DLQ wrapper schema (`dlq.<orig_schema>`) is the one structural
/// exception: prefixing an already-complete 4-part schema with `dlq.`
/// yields 5 dot-separated parts. Its `major` is always `1` — the DLQ
/// envelope shape is versioned independently of whatever version the
/// wrapped event happens to carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescriptor {
    pub layer: String,
    pub entity: String,
    pub event: String,
    pub major: u32,
}

impl SchemaDescriptor {
    pub fn parse(schema: &str) -> Result<Self, ValidationKind> {
        let parts: Vec<&str> = schema.split('.').collect();

        if parts.first() == Some(&"dlq") {
            if parts.len() < 5 {
                return Err(ValidationKind::InvalidSchemaShape(schema.to_string()));
            }
            return Ok(Self {
                layer: "dlq".to_string(),
                entity: parts[1].to_string(),
                event: parts[2..parts.len() - 1].join("."),
                major: 1,
            });
        }

        if parts.len() != 4 {
            return Err(ValidationKind::InvalidSchemaShape(schema.to_string()));
        }
        let version_part = parts[3];
        let major = version_part
            .strip_prefix('v')
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| ValidationKind::InvalidSchemaShape(schema.to_string()))?;
        Ok(Self {
            layer: parts[0].to_string(),
            entity: parts[1].to_string(),
            event: parts[2].to_string(),
            major,
        })
    }

    /// The DLQ stream name (and DLQ schema string) for a stream/schema named
    /// `s`. Both use the same `dlq.<s>` construction since, by the stream
    /// registry's convention, a stream's name and its envelopes' `schema`
    /// are the same string.
    pub fn dlq_name(s: &str) -> String {
        format!("dlq.{s}")
    }

    pub fn is_dlq(stream: &str) -> bool {
        stream.starts_with("dlq.")
    }
}

/// Reasons `validate()` can reject an envelope or its payload.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationKind {
    #[error("unknown top-level field: {0}")]
    UnknownField(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("type mismatch on {field}: expected {expected}")]
    TypeMismatch { field: String, expected: &'static str },
    #[error("schema '{schema}' declares major {declared} but schema_version is {schema_version}")]
    SchemaVersionMismatch {
        schema: String,
        declared: u32,
        schema_version: u32,
    },
    #[error("malformed schema string: {0}")]
    InvalidSchemaShape(String),
    #[error("payload invalid at {path}: {reason}")]
    PayloadInvalid { path: String, reason: String },
}

impl ValidationKind {
    /// Stable tag used as a DLQ envelope's `error_kind`, one per variant.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ValidationKind::UnknownField(_) => "UnknownField",
            ValidationKind::MissingField(_) => "MissingField",
            ValidationKind::TypeMismatch { .. } => "TypeMismatch",
            ValidationKind::SchemaVersionMismatch { .. } => "SchemaVersionMismatch",
            ValidationKind::InvalidSchemaShape(_) => "InvalidSchemaShape",
            ValidationKind::PayloadInvalid { .. } => "PayloadInvalid",
        }
    }
}

/// Strict envelope-shape check, independent of any registered payload rules.
///
/// Runs entirely over the raw JSON value: unknown fields, missing required
/// fields, and wrong primitive types are caught here before a typed decode
/// (and before payload-rule validation, which is the registry's job) ever
/// runs.
pub fn validate_envelope_shape(value: &Value) -> Result<(), ValidationKind> {
    let obj = value.as_object().ok_or_else(|| ValidationKind::TypeMismatch {
        field: "$".to_string(),
        expected: "object",
    })?;

    for key in obj.keys() {
        if !KNOWN_FIELDS.contains(&key.as_str()) {
            return Err(ValidationKind::UnknownField(key.clone()));
        }
    }

    for field in REQUIRED_FIELDS {
        if !obj.contains_key(*field) {
            return Err(ValidationKind::MissingField(field));
        }
    }

    let event_id = obj["event_id"].as_str().ok_or_else(|| ValidationKind::TypeMismatch {
        field: "event_id".to_string(),
        expected: "non-empty string",
    })?;
    if event_id.is_empty() {
        return Err(ValidationKind::TypeMismatch {
            field: "event_id".to_string(),
            expected: "non-empty string",
        });
    }

    let trace_id = obj["trace_id"].as_str().ok_or_else(|| ValidationKind::TypeMismatch {
        field: "trace_id".to_string(),
        expected: "non-empty string",
    })?;
    if trace_id.is_empty() {
        return Err(ValidationKind::TypeMismatch {
            field: "trace_id".to_string(),
            expected: "non-empty string",
        });
    }

    let produced_at = obj["produced_at"].as_str().ok_or_else(|| ValidationKind::TypeMismatch {
        field: "produced_at".to_string(),
        expected: "RFC3339 timestamp with explicit offset",
    })?;
    DateTime::parse_from_rfc3339(produced_at).map_err(|_| ValidationKind::TypeMismatch {
        field: "produced_at".to_string(),
        expected: "RFC3339 timestamp with explicit offset",
    })?;

    let schema = obj["schema"].as_str().ok_or_else(|| ValidationKind::TypeMismatch {
        field: "schema".to_string(),
        expected: "string",
    })?;
    let descriptor = SchemaDescriptor::parse(schema)?;

    let schema_version = obj["schema_version"]
        .as_u64()
        .ok_or_else(|| ValidationKind::TypeMismatch {
            field: "schema_version".to_string(),
            expected: "unsigned integer",
        })? as u32;
    if schema_version != descriptor.major {
        return Err(ValidationKind::SchemaVersionMismatch {
            schema: schema.to_string(),
            declared: descriptor.major,
            schema_version,
        });
    }

    if !obj["payload"].is_object() {
        return Err(ValidationKind::TypeMismatch {
            field: "payload".to_string(),
            expected: "object",
        });
    }

    if let Some(source) = obj.get("source_service") {
        if !source.is_string() {
            return Err(ValidationKind::TypeMismatch {
                field: "source_service".to_string(),
                expected: "string",
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn valid_envelope_value() -> Value {
        json!({
            "event_id": "E1",
            "trace_id": "T1",
            "produced_at": "2026-07-27T10:00:00+00:00",
            "schema": "risk.order.approved.v1",
            "schema_version": 1,
            "payload": {"symbol": "600000.SH"}
        })
    }

    #[test]
    fn accepts_valid_envelope() {
        assert!(validate_envelope_shape(&valid_envelope_value()).is_ok());
    }

    #[test]
    fn rejects_unknown_field() {
        let mut v = valid_envelope_value();
        v.as_object_mut().unwrap().insert("extra".into(), json!(1));
        assert_eq!(
            validate_envelope_shape(&v),
            Err(ValidationKind::UnknownField("extra".to_string()))
        );
    }

    #[test]
    fn rejects_missing_trace_id() {
        let mut v = valid_envelope_value();
        v.as_object_mut().unwrap().remove("trace_id");
        assert_eq!(
            validate_envelope_shape(&v),
            Err(ValidationKind::MissingField("trace_id"))
        );
    }

    #[test]
    fn rejects_schema_version_disagreement() {
        let mut v = valid_envelope_value();
        v["schema_version"] = json!(2);
        assert!(matches!(
            validate_envelope_shape(&v),
            Err(ValidationKind::SchemaVersionMismatch { .. })
        ));
    }

    #[test]
    fn rejects_empty_event_id() {
        let mut v = valid_envelope_value();
        v["event_id"] = json!("");
        assert!(matches!(
            validate_envelope_shape(&v),
            Err(ValidationKind::TypeMismatch { .. })
        ));
    }

    #[test]
    fn rejects_timestamp_without_offset() {
        let mut v = valid_envelope_value();
        v["produced_at"] = json!("2026-07-27T10:00:00");
        assert!(matches!(
            validate_envelope_shape(&v),
            Err(ValidationKind::TypeMismatch { .. })
        ));
    }

    #[test]
    fn envelope_round_trip() {
        let now: DateTime<FixedOffset> = Utc::now().into();
        let e = Envelope::new("E1", "T1", now, "risk.order.approved.v1", json!({"a": 1})).unwrap();
        let bytes = e.encode();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(e, decoded);
    }

    #[test]
    fn decode_of_corrupt_bytes_is_validation_error_not_panic() {
        let result = Envelope::decode(b"{not json");
        assert!(result.is_err());
    }

    #[test]
    fn schema_descriptor_parses_layer_entity_event_version() {
        let d = SchemaDescriptor::parse("risk.order.approved.v1").unwrap();
        assert_eq!(d.layer, "risk");
        assert_eq!(d.entity, "order");
        assert_eq!(d.event, "approved");
        assert_eq!(d.major, 1);
    }

    #[test]
    fn kind_name_matches_missing_field_variant() {
        let mut v = valid_envelope_value();
        v.as_object_mut().unwrap().remove("trace_id");
        let err = validate_envelope_shape(&v).unwrap_err();
        assert_eq!(err.kind_name(), "MissingField");
    }

    #[test]
    fn dlq_name_is_prefixed() {
        assert_eq!(SchemaDescriptor::dlq_name("risk.order.approved.v1"), "dlq.risk.order.approved.v1");
        assert!(SchemaDescriptor::is_dlq("dlq.risk.order.approved.v1"));
    }

    #[test]
    fn dlq_schema_major_is_always_one_regardless_of_wrapped_version() {
        let d = SchemaDescriptor::parse("dlq.risk.order.approved.v1").unwrap();
        assert_eq!(d.layer, "dlq");
        assert_eq!(d.major, 1);

        let d2 = SchemaDescriptor::parse("dlq.risk.order.approved.v2").unwrap();
        assert_eq!(d2.major, 1, "DLQ wrapper major never derives from the wrapped event's version");
    }

    #[test]
    fn dlq_envelope_with_schema_version_one_validates() {
        let value = json!({
            "event_id": "E1", "trace_id": "T1",
            "produced_at": "2026-07-27T10:00:00+00:00",
            "schema": "dlq.risk.order.approved.v1", "schema_version": 1,
            "payload": {
                "original_stream": "risk.order.approved.v1",
                "original_offset": 3,
                "original_envelope": {},
                "error_kind": "MissingField",
                "error_detail": "trace_id",
                "attempts": 1
            }
        });
        assert!(validate_envelope_shape(&value).is_ok());
    }
}
