//! Logical value model for the wire codec.

use std::collections::BTreeMap;

use crate::buffer::ByteCursor;
use crate::error::CodecError;

/// A decoded (or to-be-encoded) wire value.
///
/// This is the dynamic representation every payload passes through: the
/// encoder dispatches on the variant instead of runtime type introspection,
/// and the decoder produces these when no target shape is supplied.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Sequence(Vec<Value>),
    Mapping(Vec<(Value, Value)>),
    Message(GenericMessage),
}

impl Value {
    /// Returns the string payload, if this is a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the byte payload, if this is a byte-array value.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Byte(a), Value::Byte(b)) => a == b,
            (Value::Int16(a), Value::Int16(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float32(a), Value::Float32(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Sequence(a), Value::Sequence(b)) => a == b,
            // Mapping entry order is not defined on the wire, so equality is
            // set-equivalence on pairs.
            (Value::Mapping(a), Value::Mapping(b)) => {
                a.len() == b.len() && a.iter().all(|pair| b.contains(pair))
            }
            (Value::Message(a), Value::Message(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

/// A dynamic tagged message: field number to value.
///
/// Decoded MESSAGE bodies land here when no concrete message type is known.
/// Fields are number-addressed; insertion order is irrelevant on the wire,
/// a sorted map keeps encoding deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenericMessage {
    fields: BTreeMap<u32, Value>,
}

impl GenericMessage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn field(&self, number: u32) -> Option<&Value> {
        self.fields.get(&number)
    }

    pub fn set_field(&mut self, number: u32, value: Value) {
        self.fields.insert(number, value);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &Value)> {
        self.fields.iter()
    }
}

impl FromIterator<(u32, Value)> for GenericMessage {
    fn from_iter<T: IntoIterator<Item = (u32, Value)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// A concrete tagged message with a fixed field layout.
///
/// Implementations write and read the full MESSAGE framing (tag, length
/// prefix, field pairs); the codec's `encode_message`/`decode_message`
/// drive them. `unmarshal` is entered with the cursor at the tag byte.
pub trait MeshMessage: Sized {
    fn marshal(&self, cur: &mut ByteCursor) -> Result<(), CodecError>;
    fn unmarshal(cur: &mut ByteCursor) -> Result<Self, CodecError>;
}

/// Expected shape for type-directed decoding.
///
/// `Any` produces the canonical dynamic values; the other shapes fill typed
/// containers and let integer values widen across compatible wire tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetShape {
    Any,
    Bool,
    Byte,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Bytes,
    Sequence(Box<TargetShape>),
    Mapping(Box<TargetShape>, Box<TargetShape>),
    Message,
}
