//! Payload redaction for diagnostic capture.
//!
//! Produces a sanitized copy of a request message: every field the
//! descriptor marks as sensitive keeps its key but loses its value. The
//! original message is never touched; handlers keep receiving it as decoded.

use serde_json::{Map, Value};

use crate::schema::{Cardinality, FieldDescriptor, FieldKind, Message, MessageDescriptor, ScalarKind};

/// Returns a copy of `value` with all sensitive fields blanked.
///
/// Walks nested messages, repeated fields and map fields through their own
/// descriptors. Keys the descriptor does not know are copied unchanged.
/// Values whose JSON shape does not match the descriptor are left as they
/// are unless the field itself is sensitive.
#[must_use]
pub fn redact(value: &Value, descriptor: &MessageDescriptor) -> Value {
    match value {
        Value::Object(fields) if descriptor.has_sensitive_fields() => {
            Value::Object(redact_fields(fields, descriptor))
        }
        other => other.clone(),
    }
}

/// Redacts a decoded message using its own descriptor.
#[must_use]
pub fn redact_message(message: &dyn Message) -> Value {
    redact(&message.to_value(), message.descriptor())
}

fn redact_fields(fields: &Map<String, Value>, descriptor: &MessageDescriptor) -> Map<String, Value> {
    fields
        .iter()
        .map(|(name, value)| {
            let redacted = match descriptor.field(name) {
                Some(field) if field.sensitive => blank(field),
                Some(field) => redact_field(value, field),
                None => value.clone(),
            };
            (name.clone(), redacted)
        })
        .collect()
}

fn redact_field(value: &Value, field: &FieldDescriptor) -> Value {
    let FieldKind::Message(inner) = field.kind else {
        return value.clone();
    };
    match (field.cardinality, value) {
        (Cardinality::Singular, _) => redact(value, inner),
        (Cardinality::Repeated, Value::Array(items)) => {
            Value::Array(items.iter().map(|item| redact(item, inner)).collect())
        }
        (Cardinality::Map, Value::Object(entries)) => Value::Object(
            entries
                .iter()
                .map(|(key, item)| (key.clone(), redact(item, inner)))
                .collect(),
        ),
        (_, other) => other.clone(),
    }
}

/// Zero value standing in for a sensitive field.
fn blank(field: &FieldDescriptor) -> Value {
    match field.cardinality {
        Cardinality::Repeated => Value::Array(Vec::new()),
        Cardinality::Map => Value::Object(Map::new()),
        Cardinality::Singular => match field.kind {
            FieldKind::Message(_) => Value::Null,
            FieldKind::Scalar(ScalarKind::String | ScalarKind::Bytes) => Value::String(String::new()),
            FieldKind::Scalar(ScalarKind::Bool) => Value::Bool(false),
            FieldKind::Scalar(ScalarKind::Int | ScalarKind::Enum) => Value::from(0),
            FieldKind::Scalar(ScalarKind::Float) => Value::from(0.0),
        },
    }
}
