//! Static message descriptors.
//!
//! Each request message type exposes a [`MessageDescriptor`] naming its
//! fields, their shapes, and which of them are sensitive. Descriptors are
//! plain `static` data (hand-written or generated), so tree walkers such as
//! the payload redactor never inspect types at runtime.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use serde::Serialize;

/// Schema of one message type.
#[derive(Debug)]
pub struct MessageDescriptor {
    /// Fully-qualified message name, e.g. `"acme.users.v1.CreateUserRequest"`.
    pub name: &'static str,
    /// Field definitions, keyed by their JSON name.
    pub fields: &'static [FieldDescriptor],
}

impl MessageDescriptor {
    /// Looks up a field by its JSON name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Whether this message, or any message reachable from it, has a
    /// sensitive field.
    #[must_use]
    pub fn has_sensitive_fields(&self) -> bool {
        fn walk(desc: &MessageDescriptor, seen: &mut Vec<*const MessageDescriptor>) -> bool {
            let ptr: *const MessageDescriptor = desc;
            if seen.contains(&ptr) {
                return false;
            }
            seen.push(ptr);
            desc.fields.iter().any(|field| {
                field.sensitive
                    || match field.kind {
                        FieldKind::Message(inner) => walk(inner, seen),
                        FieldKind::Scalar(_) => false,
                    }
            })
        }
        walk(self, &mut Vec::new())
    }
}

/// Single field definition within a message schema.
#[derive(Debug, Clone, Copy)]
pub struct FieldDescriptor {
    /// JSON name of the field.
    pub name: &'static str,
    /// Shape of a single element.
    pub kind: FieldKind,
    /// Singular, list, or string-keyed map of `kind`.
    pub cardinality: Cardinality,
    /// Whether the value must be blanked before diagnostic use.
    pub sensitive: bool,
}

impl FieldDescriptor {
    #[must_use]
    pub const fn scalar(name: &'static str, kind: ScalarKind) -> Self {
        Self {
            name,
            kind: FieldKind::Scalar(kind),
            cardinality: Cardinality::Singular,
            sensitive: false,
        }
    }

    #[must_use]
    pub const fn string(name: &'static str) -> Self {
        Self::scalar(name, ScalarKind::String)
    }

    #[must_use]
    pub const fn bytes(name: &'static str) -> Self {
        Self::scalar(name, ScalarKind::Bytes)
    }

    #[must_use]
    pub const fn bool(name: &'static str) -> Self {
        Self::scalar(name, ScalarKind::Bool)
    }

    #[must_use]
    pub const fn int(name: &'static str) -> Self {
        Self::scalar(name, ScalarKind::Int)
    }

    #[must_use]
    pub const fn float(name: &'static str) -> Self {
        Self::scalar(name, ScalarKind::Float)
    }

    #[must_use]
    pub const fn enumeration(name: &'static str) -> Self {
        Self::scalar(name, ScalarKind::Enum)
    }

    #[must_use]
    pub const fn message(name: &'static str, descriptor: &'static MessageDescriptor) -> Self {
        Self {
            name,
            kind: FieldKind::Message(descriptor),
            cardinality: Cardinality::Singular,
            sensitive: false,
        }
    }

    /// Marks the field as a list of its kind.
    #[must_use]
    pub const fn repeated(mut self) -> Self {
        self.cardinality = Cardinality::Repeated;
        self
    }

    /// Marks the field as a string-keyed map of its kind.
    #[must_use]
    pub const fn map(mut self) -> Self {
        self.cardinality = Cardinality::Map;
        self
    }

    /// Marks the field as sensitive.
    #[must_use]
    pub const fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// Element shape of a field.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Scalar(ScalarKind),
    Message(&'static MessageDescriptor),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    String,
    /// Base64 text in JSON.
    Bytes,
    Bool,
    Int,
    Float,
    /// Enum values, carried as numbers or names.
    Enum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Singular,
    Repeated,
    Map,
}

/// Implemented by every request message type.
pub trait Schema {
    fn descriptor() -> &'static MessageDescriptor;
}

/// Type-erased decoded message flowing through the interceptor chain.
///
/// Implemented for every `Schema + Serialize` type; interceptors only see
/// the descriptor and a structured JSON view.
pub trait Message: Debug + Send + Sync + 'static {
    fn descriptor(&self) -> &'static MessageDescriptor;

    /// Structured view used for diagnostics. Falls back to `null` if the
    /// message cannot be represented as JSON.
    fn to_value(&self) -> serde_json::Value;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> Message for T
where
    T: Schema + Serialize + Debug + Send + Sync + 'static,
{
    fn descriptor(&self) -> &'static MessageDescriptor {
        T::descriptor()
    }

    fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static LEAF: MessageDescriptor = MessageDescriptor {
        name: "test.Leaf",
        fields: &[FieldDescriptor::string("token").sensitive()],
    };

    static TREE: MessageDescriptor = MessageDescriptor {
        name: "test.Tree",
        fields: &[
            FieldDescriptor::string("label"),
            FieldDescriptor::message("children", &TREE).repeated(),
        ],
    };

    static ROOT: MessageDescriptor = MessageDescriptor {
        name: "test.Root",
        fields: &[
            FieldDescriptor::string("name"),
            FieldDescriptor::message("leaves", &LEAF).map(),
        ],
    };

    #[test]
    fn builders_compose() {
        let field = FieldDescriptor::int("ids").repeated().sensitive();
        assert_eq!(field.cardinality, Cardinality::Repeated);
        assert!(field.sensitive);
        assert!(matches!(field.kind, FieldKind::Scalar(ScalarKind::Int)));
    }

    #[test]
    fn field_lookup_by_name() {
        assert!(ROOT.field("name").is_some());
        assert!(ROOT.field("missing").is_none());
    }

    #[test]
    fn sensitive_fields_found_through_nesting() {
        assert!(LEAF.has_sensitive_fields());
        assert!(ROOT.has_sensitive_fields());
        // Recursive descriptors terminate.
        assert!(!TREE.has_sensitive_fields());
    }
}
