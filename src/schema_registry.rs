//! Payload rule declarations and the schema registry.
//!
//! The registry is constructed once at startup and passed by `Arc` into
//! producers, consumers, the replay harness, and the bridge — there is no
//! process-wide mutable default, per the "global singletons → explicit
//! injection" design note.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use serde_json::Value;
use thiserror::Error;

use crate::envelope::{validate_envelope_shape, ValidationKind};

/// A single field's type constraint within a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRule {
    String { max_len: usize },
    Integer,
    Float { min: Option<f64>, max: Option<f64> },
    Bool,
    Enum(Vec<String>),
    Object(PayloadRules),
}

impl FieldRule {
    fn type_name(&self) -> &'static str {
        match self {
            FieldRule::String { .. } => "string",
            FieldRule::Integer => "integer",
            FieldRule::Float { .. } => "float",
            FieldRule::Bool => "bool",
            FieldRule::Enum(_) => "enum",
            FieldRule::Object(_) => "object",
        }
    }
}

/// Payload shape for one registered schema: a required-field set plus a
/// per-field type rule. Nested objects recurse via `FieldRule::Object`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadRules {
    pub required: HashSet<String>,
    pub fields: HashMap<String, FieldRule>,
}

impl PayloadRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, field: impl Into<String>, rule: FieldRule) -> Self {
        let field = field.into();
        self.required.insert(field.clone());
        self.fields.insert(field, rule);
        self
    }

    pub fn optional(mut self, field: impl Into<String>, rule: FieldRule) -> Self {
        self.fields.insert(field.into(), rule);
        self
    }

    /// Deterministic digest used to detect conflicting re-registration.
    /// Built over a sorted (BTreeMap) view so hash-map iteration order never
    /// affects the result.
    pub fn digest(&self) -> String {
        fn describe(rules: &PayloadRules) -> String {
            let sorted: BTreeMap<&String, &FieldRule> = rules.fields.iter().collect();
            let mut required: Vec<&String> = rules.required.iter().collect();
            required.sort();
            let mut out = format!("required={required:?};fields=[");
            for (name, rule) in sorted {
                out.push_str(&format!("{name}:{};", describe_rule(rule)));
            }
            out.push(']');
            out
        }
        fn describe_rule(rule: &FieldRule) -> String {
            match rule {
                FieldRule::String { max_len } => format!("string(max_len={max_len})"),
                FieldRule::Integer => "integer".to_string(),
                FieldRule::Float { min, max } => format!("float(min={min:?},max={max:?})"),
                FieldRule::Bool => "bool".to_string(),
                FieldRule::Enum(values) => format!("enum({values:?})"),
                FieldRule::Object(nested) => format!("object({{{}}})", describe(nested)),
            }
        }
        describe(self)
    }
}

pub fn validate_payload(value: &Value, rules: &PayloadRules) -> Result<(), ValidationKind> {
    validate_payload_at(value, rules, "$.payload")
}

fn validate_payload_at(value: &Value, rules: &PayloadRules, path: &str) -> Result<(), ValidationKind> {
    let obj = value.as_object().ok_or_else(|| ValidationKind::PayloadInvalid {
        path: path.to_string(),
        reason: "expected an object".to_string(),
    })?;

    for field in &rules.required {
        if !obj.contains_key(field) {
            return Err(ValidationKind::PayloadInvalid {
                path: format!("{path}.{field}"),
                reason: "required field missing".to_string(),
            });
        }
    }

    for (field, rule) in &rules.fields {
        let Some(field_value) = obj.get(field) else {
            continue;
        };
        let field_path = format!("{path}.{field}");
        check_field(field_value, rule, &field_path)?;
    }

    Ok(())
}

fn check_field(value: &Value, rule: &FieldRule, path: &str) -> Result<(), ValidationKind> {
    match rule {
        FieldRule::String { max_len } => {
            let s = value.as_str().ok_or_else(|| ValidationKind::PayloadInvalid {
                path: path.to_string(),
                reason: format!("expected {}", rule.type_name()),
            })?;
            if s.len() > *max_len {
                return Err(ValidationKind::PayloadInvalid {
                    path: path.to_string(),
                    reason: format!("string exceeds max length {max_len}"),
                });
            }
            Ok(())
        }
        FieldRule::Integer => {
            if value.as_i64().is_none() && value.as_u64().is_none() {
                return Err(ValidationKind::PayloadInvalid {
                    path: path.to_string(),
                    reason: "expected integer".to_string(),
                });
            }
            Ok(())
        }
        FieldRule::Float { min, max } => {
            let n = value.as_f64().ok_or_else(|| ValidationKind::PayloadInvalid {
                path: path.to_string(),
                reason: "expected number".to_string(),
            })?;
            if n.is_nan() || n.is_infinite() {
                return Err(ValidationKind::PayloadInvalid {
                    path: path.to_string(),
                    reason: "NaN/Inf is never valid".to_string(),
                });
            }
            if let Some(min) = min {
                if n < *min {
                    return Err(ValidationKind::PayloadInvalid {
                        path: path.to_string(),
                        reason: format!("{n} below minimum {min}"),
                    });
                }
            }
            if let Some(max) = max {
                if n > *max {
                    return Err(ValidationKind::PayloadInvalid {
                        path: path.to_string(),
                        reason: format!("{n} above maximum {max}"),
                    });
                }
            }
            Ok(())
        }
        FieldRule::Bool => {
            if value.as_bool().is_none() {
                return Err(ValidationKind::PayloadInvalid {
                    path: path.to_string(),
                    reason: "expected bool".to_string(),
                });
            }
            Ok(())
        }
        FieldRule::Enum(allowed) => {
            let s = value.as_str().ok_or_else(|| ValidationKind::PayloadInvalid {
                path: path.to_string(),
                reason: "expected string enum value".to_string(),
            })?;
            if !allowed.iter().any(|a| a == s) {
                return Err(ValidationKind::PayloadInvalid {
                    path: path.to_string(),
                    reason: format!("'{s}' not in {allowed:?}"),
                });
            }
            Ok(())
        }
        FieldRule::Object(nested) => validate_payload_at(value, nested, path),
    }
}

#[derive(Debug, Error, Clone)]
pub enum RegistryError {
    #[error("schema '{schema}' already registered with different rules")]
    SchemaConflict { schema: String },
}

struct RegisteredSchema {
    rules: PayloadRules,
    digest: String,
}

/// Central, explicitly-constructed schema contract store. One instance is
/// shared (via `Arc`) by every producer, consumer, the replay harness, and
/// the bridge in a process.
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, RegisteredSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotent by `(schema, rules_digest)`. Re-registering the same
    /// schema with different rules is a `SchemaConflict` — v1 schemas are
    /// frozen once shipped.
    pub fn register(&self, schema: impl Into<String>, rules: PayloadRules) -> Result<(), RegistryError> {
        let schema = schema.into();
        let digest = rules.digest();
        let mut guard = self.schemas.write().unwrap();
        match guard.get(&schema) {
            Some(existing) if existing.digest == digest => Ok(()),
            Some(_) => Err(RegistryError::SchemaConflict { schema }),
            None => {
                guard.insert(schema, RegisteredSchema { rules, digest });
                Ok(())
            }
        }
    }

    pub fn is_registered(&self, schema: &str) -> bool {
        self.schemas.read().unwrap().contains_key(schema)
    }

    /// Strict envelope validation followed by payload-rule validation for
    /// whatever schema is registered. An unregistered schema only gets the
    /// envelope-shape check — producers are expected to register every
    /// schema they emit at startup.
    pub fn validate(&self, value: &Value) -> Result<(), ValidationKind> {
        validate_envelope_shape(value)?;
        let schema = value["schema"].as_str().expect("checked by validate_envelope_shape");
        let guard = self.schemas.read().unwrap();
        if let Some(registered) = guard.get(schema) {
            validate_payload(&value["payload"], &registered.rules)?;
        }
        Ok(())
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}
