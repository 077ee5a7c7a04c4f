//! TLV encoding and decoding engine.
//!
//! Every value is framed as a one-byte tag followed by a tag-specific
//! payload. The engine speaks two dialects that share the tag table:
//!
//! - [`Dialect::Legacy`]: the flat dialect. Booleans are a raw 0/1 byte
//!   (the tag is the payload) and there is no MESSAGE type.
//! - [`Dialect::Message`]: adds length-prefixed tagged struct encoding
//!   (tag 26). Booleans use the TRUE/FALSE tags with no payload, which is
//!   bit-identical to the legacy form.
//!
//! The dialect is fixed at codec construction; nothing negotiates it
//! in-band, and both dialects round-trip their own output exactly.

use crate::buffer::ByteCursor;
use crate::error::CodecError;
use crate::value::{GenericMessage, MeshMessage, TargetShape, Value};

// Wire tags. Bit-exact with existing producers and consumers.
pub const TAG_FALSE: u8 = 0;
pub const TAG_TRUE: u8 = 1;
pub const TAG_NULL: u8 = 2;
pub const TAG_BYTE: u8 = 3;
pub const TAG_STRING: u8 = 4;
pub const TAG_BYTE_ARRAY: u8 = 5;
pub const TAG_INT16: u8 = 6;
pub const TAG_INT32: u8 = 7;
pub const TAG_INT64: u8 = 8;
pub const TAG_FLOAT32: u8 = 9;
pub const TAG_FLOAT64: u8 = 10;

pub const TAG_SEQUENCE: u8 = 20;
pub const TAG_SEQUENCE_END: u8 = 21;
pub const TAG_MAPPING: u8 = 22;
pub const TAG_MAPPING_END: u8 = 23;

// Reserved for packed collections. No encoder emits them; the decoder
// rejects them rather than guess.
pub const TAG_PACKED_SEQUENCE: u8 = 24;
pub const TAG_PACKED_MAPPING: u8 = 25;

pub const TAG_MESSAGE: u8 = 26;

/// Which encoding the codec speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Flat dialect: raw 0/1 booleans, no MESSAGE support.
    Legacy,
    /// Tagged-struct dialect: adds the MESSAGE type.
    Message,
}

/// TLV codec for wire values.
#[derive(Debug, Clone, Copy)]
pub struct MeshCodec {
    dialect: Dialect,
}

impl MeshCodec {
    #[must_use]
    pub const fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    #[must_use]
    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Encodes exactly one top-level value.
    pub fn serialize(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let mut cur = ByteCursor::new();
        self.encode_value(value, &mut cur)?;
        Ok(cur.into_bytes())
    }

    /// Concatenates the encodings of `values` in order.
    pub fn serialize_multi(&self, values: &[Value]) -> Result<Vec<u8>, CodecError> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let mut cur = ByteCursor::new();
        for value in values {
            self.encode_value(value, &mut cur)?;
        }
        Ok(cur.into_bytes())
    }

    /// Consumes exactly one top-level value. Empty input decodes to null.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        self.deserialize_as(bytes, &TargetShape::Any)
    }

    /// Consumes one top-level value guided by the expected shape.
    pub fn deserialize_as(
        &self,
        bytes: &[u8],
        shape: &TargetShape,
    ) -> Result<Value, CodecError> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        let mut cur = ByteCursor::from_bytes(bytes);
        self.decode_value(&mut cur, shape)
    }

    /// Consumes `shapes.len()` values guided by each target shape, or, with
    /// no shapes given, reads dynamic values until the buffer is exhausted.
    pub fn deserialize_multi(
        &self,
        bytes: &[u8],
        shapes: Option<&[TargetShape]>,
    ) -> Result<Vec<Value>, CodecError> {
        let mut cur = ByteCursor::from_bytes(bytes);
        let mut out = Vec::new();
        match shapes {
            Some(shapes) => {
                for shape in shapes {
                    out.push(self.decode_value(&mut cur, shape)?);
                }
            }
            None => {
                while cur.remain() > 0 {
                    out.push(self.decode_value(&mut cur, &TargetShape::Any)?);
                }
            }
        }
        Ok(out)
    }

    /// Encodes a concrete tagged message. Message-dialect only.
    pub fn encode_message<T: MeshMessage>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        if self.dialect == Dialect::Legacy {
            return Err(CodecError::UnsupportedTag(TAG_MESSAGE));
        }
        let mut cur = ByteCursor::new();
        msg.marshal(&mut cur)?;
        Ok(cur.into_bytes())
    }

    /// Decodes a concrete tagged message via its field-number switch.
    /// Message-dialect only.
    pub fn decode_message<T: MeshMessage>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        if self.dialect == Dialect::Legacy {
            return Err(CodecError::UnsupportedTag(TAG_MESSAGE));
        }
        let mut cur = ByteCursor::from_bytes(bytes);
        T::unmarshal(&mut cur)
    }

    /// Appends the encoding of `value` to the cursor.
    pub fn encode_value(&self, value: &Value, cur: &mut ByteCursor) -> Result<(), CodecError> {
        match value {
            Value::Null => cur.write_byte(TAG_NULL),
            Value::Bool(b) => encode_bool(*b, cur),
            Value::Byte(b) => encode_byte(*b, cur),
            Value::Int16(i) => encode_int16(*i, cur),
            Value::Int32(i) => encode_int32(*i, cur),
            Value::Int64(i) => encode_int64(*i, cur),
            Value::Float32(f) => encode_float32(*f, cur),
            Value::Float64(f) => encode_float64(*f, cur),
            Value::String(s) => encode_string(s, cur),
            // Byte slices are BYTE_ARRAY, never a sequence of byte values.
            Value::Bytes(b) => encode_bytes(b, cur),
            Value::Sequence(items) => {
                cur.write_byte(TAG_SEQUENCE);
                for item in items {
                    self.encode_value(item, cur)?;
                }
                cur.write_byte(TAG_SEQUENCE_END);
            }
            Value::Mapping(pairs) => {
                cur.write_byte(TAG_MAPPING);
                for (key, val) in pairs {
                    self.encode_value(key, cur)?;
                    self.encode_value(val, cur)?;
                }
                cur.write_byte(TAG_MAPPING_END);
            }
            Value::Message(msg) => {
                if self.dialect == Dialect::Legacy {
                    return Err(CodecError::UnsupportedTag(TAG_MESSAGE));
                }
                self.encode_generic_message(msg, cur)?;
            }
        }
        Ok(())
    }

    fn encode_generic_message(
        &self,
        msg: &GenericMessage,
        cur: &mut ByteCursor,
    ) -> Result<(), CodecError> {
        cur.write_byte(TAG_MESSAGE);
        let pos = cur.wpos();
        // Reserve the length prefix, back-patch it once the body is written.
        cur.set_wpos(pos + 4);
        for (number, value) in msg.iter() {
            if value.is_null() {
                continue;
            }
            cur.write_zigzag32(*number as i32);
            self.encode_value(value, cur)?;
        }
        let end = cur.wpos();
        cur.set_wpos(pos);
        cur.write_u32_be((end - pos - 4) as u32);
        cur.set_wpos(end);
        Ok(())
    }

    /// Decodes one value from the cursor, tag included.
    pub fn decode_value(
        &self,
        cur: &mut ByteCursor,
        shape: &TargetShape,
    ) -> Result<Value, CodecError> {
        let tag = cur.read_byte()?;
        if tag == TAG_NULL {
            return Ok(Value::Null);
        }
        match shape {
            TargetShape::Any => self.decode_dynamic(tag, cur),
            TargetShape::Bool => match tag {
                TAG_FALSE => Ok(Value::Bool(false)),
                TAG_TRUE => Ok(Value::Bool(true)),
                _ => Err(mismatch("bool", tag)),
            },
            TargetShape::Byte => Ok(Value::Byte(decode_integer_tagged(tag, cur)? as u8)),
            TargetShape::Int16 => Ok(Value::Int16(decode_integer_tagged(tag, cur)? as i16)),
            TargetShape::Int32 => Ok(Value::Int32(decode_integer_tagged(tag, cur)? as i32)),
            TargetShape::Int64 => Ok(Value::Int64(decode_integer_tagged(tag, cur)?)),
            TargetShape::Float32 => {
                if tag != TAG_FLOAT32 {
                    return Err(mismatch("float32", tag));
                }
                Ok(Value::Float32(f32::from_bits(cur.read_u32_be()?)))
            }
            TargetShape::Float64 => {
                if tag != TAG_FLOAT64 {
                    return Err(mismatch("float64", tag));
                }
                Ok(Value::Float64(f64::from_bits(cur.read_u64_be()?)))
            }
            TargetShape::String => {
                if tag != TAG_STRING {
                    return Err(mismatch("string", tag));
                }
                Ok(Value::String(read_string_body(cur)?))
            }
            TargetShape::Bytes => {
                if tag != TAG_BYTE_ARRAY {
                    return Err(mismatch("byteArray", tag));
                }
                Ok(Value::Bytes(read_bytes_body(cur)?))
            }
            TargetShape::Sequence(elem) => {
                if tag != TAG_SEQUENCE {
                    return Err(mismatch("array", tag));
                }
                self.decode_sequence(cur, elem)
            }
            TargetShape::Mapping(key, val) => {
                if tag != TAG_MAPPING {
                    return Err(mismatch("map", tag));
                }
                self.decode_mapping(cur, key, val)
            }
            TargetShape::Message => {
                if tag != TAG_MESSAGE {
                    return Err(mismatch("message", tag));
                }
                if self.dialect == Dialect::Legacy {
                    return Err(CodecError::UnsupportedTag(TAG_MESSAGE));
                }
                Ok(Value::Message(self.decode_generic_message(cur)?))
            }
        }
    }

    fn decode_dynamic(&self, tag: u8, cur: &mut ByteCursor) -> Result<Value, CodecError> {
        match tag {
            TAG_FALSE => Ok(Value::Bool(false)),
            TAG_TRUE => Ok(Value::Bool(true)),
            TAG_BYTE => Ok(Value::Byte(cur.read_byte()?)),
            TAG_STRING => Ok(Value::String(read_string_body(cur)?)),
            TAG_BYTE_ARRAY => Ok(Value::Bytes(read_bytes_body(cur)?)),
            TAG_INT16 => Ok(Value::Int16(cur.read_u16_be()? as i16)),
            TAG_INT32 => Ok(Value::Int32(cur.read_zigzag32()?)),
            TAG_INT64 => Ok(Value::Int64(cur.read_zigzag64()?)),
            TAG_FLOAT32 => Ok(Value::Float32(f32::from_bits(cur.read_u32_be()?))),
            TAG_FLOAT64 => Ok(Value::Float64(f64::from_bits(cur.read_u64_be()?))),
            TAG_SEQUENCE => self.decode_sequence(cur, &TargetShape::Any),
            TAG_MAPPING => self.decode_mapping(cur, &TargetShape::Any, &TargetShape::Any),
            TAG_MESSAGE if self.dialect == Dialect::Message => {
                Ok(Value::Message(self.decode_generic_message(cur)?))
            }
            other => Err(CodecError::UnsupportedTag(other)),
        }
    }

    fn decode_sequence(
        &self,
        cur: &mut ByteCursor,
        elem: &TargetShape,
    ) -> Result<Value, CodecError> {
        let mut items = Vec::new();
        loop {
            let tag = cur.read_byte()?;
            if tag == TAG_SEQUENCE_END {
                break;
            }
            cur.set_rpos(cur.rpos() - 1);
            items.push(self.decode_value(cur, elem)?);
        }
        Ok(Value::Sequence(items))
    }

    fn decode_mapping(
        &self,
        cur: &mut ByteCursor,
        key_shape: &TargetShape,
        val_shape: &TargetShape,
    ) -> Result<Value, CodecError> {
        let mut pairs = Vec::new();
        loop {
            let tag = cur.read_byte()?;
            if tag == TAG_MAPPING_END {
                break;
            }
            cur.set_rpos(cur.rpos() - 1);
            let key = self.decode_value(cur, key_shape)?;
            let val = self.decode_value(cur, val_shape)?;
            pairs.push((key, val));
        }
        Ok(Value::Mapping(pairs))
    }

    fn decode_generic_message(&self, cur: &mut ByteCursor) -> Result<GenericMessage, CodecError> {
        let total = cur.read_u32_be()? as usize;
        let mut msg = GenericMessage::new();
        if total == 0 {
            return Ok(msg);
        }
        if total > cur.remain() {
            return Err(CodecError::Underflow);
        }
        let end = cur.rpos() + total;
        while cur.rpos() < end {
            let number = cur.read_zigzag32()?;
            let number = u32::try_from(number).map_err(|_| CodecError::InvalidLength(number))?;
            let value = self.decode_value(cur, &TargetShape::Any)?;
            msg.set_field(number, value);
        }
        if cur.rpos() != end {
            return Err(CodecError::SizeMismatch);
        }
        Ok(msg)
    }
}

fn mismatch(expected: &'static str, actual: u8) -> CodecError {
    CodecError::TagMismatch { expected, actual }
}

// -- primitive encoders ----------------------------------------------------
//
// Also the building blocks for typed `MeshMessage::marshal` implementations.

pub fn encode_bool(v: bool, cur: &mut ByteCursor) {
    // TRUE/FALSE tags carry no payload; the byte is identical to the legacy
    // raw 0/1 form.
    cur.write_byte(if v { TAG_TRUE } else { TAG_FALSE });
}

pub fn encode_byte(v: u8, cur: &mut ByteCursor) {
    cur.write_byte(TAG_BYTE);
    cur.write_byte(v);
}

pub fn encode_int16(v: i16, cur: &mut ByteCursor) {
    cur.write_byte(TAG_INT16);
    cur.write_u16_be(v as u16);
}

pub fn encode_int32(v: i32, cur: &mut ByteCursor) {
    cur.write_byte(TAG_INT32);
    cur.write_zigzag32(v);
}

pub fn encode_int64(v: i64, cur: &mut ByteCursor) {
    cur.write_byte(TAG_INT64);
    cur.write_zigzag64(v);
}

pub fn encode_float32(v: f32, cur: &mut ByteCursor) {
    cur.write_byte(TAG_FLOAT32);
    cur.write_u32_be(v.to_bits());
}

pub fn encode_float64(v: f64, cur: &mut ByteCursor) {
    cur.write_byte(TAG_FLOAT64);
    cur.write_u64_be(v.to_bits());
}

pub fn encode_string(s: &str, cur: &mut ByteCursor) {
    cur.write_byte(TAG_STRING);
    encode_string_no_tag(s, cur);
}

/// Writes a string body (zigzag32 length + UTF-8 bytes) without the tag.
pub fn encode_string_no_tag(s: &str, cur: &mut ByteCursor) {
    cur.write_zigzag32(s.len() as i32);
    cur.write_bytes(s.as_bytes());
}

pub fn encode_bytes(b: &[u8], cur: &mut ByteCursor) {
    cur.write_byte(TAG_BYTE_ARRAY);
    cur.write_zigzag32(b.len() as i32);
    cur.write_bytes(b);
}

// -- primitive decoders ----------------------------------------------------
//
// Each reads its own tag; integers accept any narrower integer tag and
// widen with sign extension. Used by typed `MeshMessage::unmarshal`
// implementations.

pub fn decode_bool(cur: &mut ByteCursor) -> Result<bool, CodecError> {
    match cur.read_byte()? {
        TAG_FALSE => Ok(false),
        TAG_TRUE => Ok(true),
        tag => Err(mismatch("bool", tag)),
    }
}

pub fn decode_byte(cur: &mut ByteCursor) -> Result<u8, CodecError> {
    Ok(decode_integer(cur)? as u8)
}

pub fn decode_int16(cur: &mut ByteCursor) -> Result<i16, CodecError> {
    Ok(decode_integer(cur)? as i16)
}

pub fn decode_int32(cur: &mut ByteCursor) -> Result<i32, CodecError> {
    Ok(decode_integer(cur)? as i32)
}

pub fn decode_int64(cur: &mut ByteCursor) -> Result<i64, CodecError> {
    decode_integer(cur)
}

pub fn decode_float32(cur: &mut ByteCursor) -> Result<f32, CodecError> {
    let tag = cur.read_byte()?;
    if tag != TAG_FLOAT32 {
        return Err(mismatch("float32", tag));
    }
    Ok(f32::from_bits(cur.read_u32_be()?))
}

pub fn decode_float64(cur: &mut ByteCursor) -> Result<f64, CodecError> {
    let tag = cur.read_byte()?;
    if tag != TAG_FLOAT64 {
        return Err(mismatch("float64", tag));
    }
    Ok(f64::from_bits(cur.read_u64_be()?))
}

pub fn decode_string(cur: &mut ByteCursor) -> Result<String, CodecError> {
    let tag = cur.read_byte()?;
    match tag {
        TAG_NULL => Ok(String::new()),
        TAG_STRING => read_string_body(cur),
        _ => Err(mismatch("string", tag)),
    }
}

pub fn decode_bytes(cur: &mut ByteCursor) -> Result<Vec<u8>, CodecError> {
    let tag = cur.read_byte()?;
    match tag {
        TAG_NULL => Ok(Vec::new()),
        TAG_BYTE_ARRAY => read_bytes_body(cur),
        _ => Err(mismatch("byteArray", tag)),
    }
}

fn decode_integer(cur: &mut ByteCursor) -> Result<i64, CodecError> {
    let tag = cur.read_byte()?;
    decode_integer_tagged(tag, cur)
}

fn decode_integer_tagged(tag: u8, cur: &mut ByteCursor) -> Result<i64, CodecError> {
    match tag {
        TAG_BYTE => Ok(i64::from(cur.read_byte()?)),
        TAG_INT16 => Ok(i64::from(cur.read_u16_be()? as i16)),
        TAG_INT32 => Ok(i64::from(cur.read_zigzag32()?)),
        TAG_INT64 => cur.read_zigzag64(),
        _ => Err(mismatch("byte|int16|int32|int64", tag)),
    }
}

fn read_string_body(cur: &mut ByteCursor) -> Result<String, CodecError> {
    let bytes = read_bytes_body(cur)?;
    String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
}

fn read_bytes_body(cur: &mut ByteCursor) -> Result<Vec<u8>, CodecError> {
    let len = cur.read_zigzag32()?;
    let len = usize::try_from(len).map_err(|_| CodecError::InvalidLength(len))?;
    Ok(cur.read_n(len)?.to_vec())
}
