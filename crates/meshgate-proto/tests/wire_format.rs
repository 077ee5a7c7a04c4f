//! End-to-end wire format scenarios, including a concrete tagged message
//! type exercising the typed marshal/unmarshal path.

use meshgate_proto::codec::{
    self, TAG_MESSAGE, TAG_SEQUENCE,
};
use meshgate_proto::{
    ByteCursor, CodecError, Dialect, GenericMessage, MeshCodec, MeshMessage, TargetShape, Value,
};

/// A typed message with the field layout a generated binding would have.
#[derive(Debug, Default, PartialEq)]
struct UpstreamInfo {
    name: String,
    enabled: bool,
    weight: i32,
    tags: Vec<String>,
    payload: Vec<u8>,
}

impl MeshMessage for UpstreamInfo {
    fn marshal(&self, cur: &mut ByteCursor) -> Result<(), CodecError> {
        cur.write_byte(TAG_MESSAGE);
        let pos = cur.wpos();
        cur.set_wpos(pos + 4);

        cur.write_zigzag32(1);
        codec::encode_string(&self.name, cur);
        cur.write_zigzag32(2);
        codec::encode_bool(self.enabled, cur);
        cur.write_zigzag32(3);
        codec::encode_int32(self.weight, cur);
        if !self.tags.is_empty() {
            cur.write_zigzag32(4);
            let seq = Value::Sequence(self.tags.iter().map(|t| Value::from(t.as_str())).collect());
            MeshCodec::new(Dialect::Message).encode_value(&seq, cur)?;
        }
        if !self.payload.is_empty() {
            cur.write_zigzag32(5);
            codec::encode_bytes(&self.payload, cur);
        }

        let end = cur.wpos();
        cur.set_wpos(pos);
        cur.write_u32_be((end - pos - 4) as u32);
        cur.set_wpos(end);
        Ok(())
    }

    fn unmarshal(cur: &mut ByteCursor) -> Result<Self, CodecError> {
        let tag = cur.read_byte()?;
        if tag != TAG_MESSAGE {
            return Err(CodecError::TagMismatch {
                expected: "message",
                actual: tag,
            });
        }
        let total = cur.read_u32_be()? as usize;
        let mut msg = Self::default();
        let end = cur.rpos() + total;
        let dynamic = MeshCodec::new(Dialect::Message);
        while cur.rpos() < end {
            match cur.read_zigzag32()? {
                1 => msg.name = codec::decode_string(cur)?,
                2 => msg.enabled = codec::decode_bool(cur)?,
                3 => msg.weight = codec::decode_int32(cur)?,
                4 => {
                    let shape = TargetShape::Sequence(Box::new(TargetShape::String));
                    if let Value::Sequence(items) = dynamic.decode_value(cur, &shape)? {
                        msg.tags = items
                            .into_iter()
                            .filter_map(|v| v.as_str().map(str::to_owned))
                            .collect();
                    }
                }
                5 => msg.payload = codec::decode_bytes(cur)?,
                // Unknown fields are skipped by decoding them dynamically.
                _ => {
                    dynamic.decode_value(cur, &TargetShape::Any)?;
                }
            }
        }
        if cur.rpos() != end {
            return Err(CodecError::SizeMismatch);
        }
        Ok(msg)
    }
}

#[test]
fn roundtrip_mixed_primitives() {
    // S1: heterogeneous sequence through the message dialect.
    let codec = MeshCodec::new(Dialect::Message);
    let values = vec![
        Value::Bool(true),
        Value::Bool(false),
        Value::Int32(-16),
        Value::Float64(3.14),
        Value::from("hello"),
        Value::Bytes(vec![1, 2, 3, 4]),
    ];
    let bytes = codec.serialize_multi(&values).unwrap();
    assert_eq!(bytes[0], 1);
    assert_eq!(bytes[1], 0);
    assert_eq!(codec.deserialize_multi(&bytes, None).unwrap(), values);
}

#[test]
fn generic_message_framing() {
    // S2: tag byte, 4-byte big-endian body length, field pairs.
    let codec = MeshCodec::new(Dialect::Message);
    let msg: GenericMessage = [
        (1, Value::from("x")),
        (2, Value::Bool(true)),
        (5, Value::Int32(256)),
    ]
    .into_iter()
    .collect();

    let bytes = codec.serialize(&Value::Message(msg.clone())).unwrap();
    assert_eq!(bytes[0], TAG_MESSAGE);
    let body_len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    assert_eq!(body_len, bytes.len() - 5);

    match codec.deserialize(&bytes).unwrap() {
        Value::Message(decoded) => {
            assert_eq!(decoded.len(), 3);
            assert_eq!(decoded, msg);
        }
        other => panic!("expected message, got {other:?}"),
    }
}

#[test]
fn typed_message_roundtrip() {
    let codec = MeshCodec::new(Dialect::Message);
    let info = UpstreamInfo {
        name: "origin-1".into(),
        enabled: true,
        weight: 256,
        tags: vec!["a".into(), "b".into()],
        payload: vec![1, 2, 3, 4],
    };

    let bytes = codec.encode_message(&info).unwrap();
    assert_eq!(bytes[0], TAG_MESSAGE);
    assert_eq!(codec.decode_message::<UpstreamInfo>(&bytes).unwrap(), info);
}

#[test]
fn typed_message_skips_unknown_fields() {
    // A producer with more fields than this reader knows about.
    let codec = MeshCodec::new(Dialect::Message);
    let msg: GenericMessage = [
        (1, Value::from("origin-2")),
        (2, Value::Bool(false)),
        (3, Value::Int32(1)),
        (99, Value::from("from-the-future")),
    ]
    .into_iter()
    .collect();

    let bytes = codec.serialize(&Value::Message(msg)).unwrap();
    let info = codec.decode_message::<UpstreamInfo>(&bytes).unwrap();
    assert_eq!(info.name, "origin-2");
    assert_eq!(info.weight, 1);
}

#[test]
fn typed_message_decodes_into_generic() {
    // The dynamic path is the forward-compatibility story: the same bytes
    // decode into a field-number map without the concrete type.
    let codec = MeshCodec::new(Dialect::Message);
    let info = UpstreamInfo {
        name: "origin-3".into(),
        enabled: true,
        weight: -7,
        tags: Vec::new(),
        payload: Vec::new(),
    };
    let bytes = codec.encode_message(&info).unwrap();

    match codec.deserialize(&bytes).unwrap() {
        Value::Message(generic) => {
            assert_eq!(generic.field(1), Some(&Value::from("origin-3")));
            assert_eq!(generic.field(2), Some(&Value::Bool(true)));
            assert_eq!(generic.field(3), Some(&Value::Int32(-7)));
        }
        other => panic!("expected message, got {other:?}"),
    }
}

#[test]
fn nested_message_fields() {
    let codec = MeshCodec::new(Dialect::Message);
    let inner: GenericMessage = [(1, Value::from("inner"))].into_iter().collect();
    let outer: GenericMessage = [
        (1, Value::from("outer")),
        (2, Value::Message(inner.clone())),
    ]
    .into_iter()
    .collect();

    let bytes = codec.serialize(&Value::Message(outer)).unwrap();
    match codec.deserialize(&bytes).unwrap() {
        Value::Message(decoded) => {
            assert_eq!(decoded.field(2), Some(&Value::Message(inner)));
        }
        other => panic!("expected message, got {other:?}"),
    }
}

#[test]
fn legacy_dialect_rejects_typed_messages() {
    let legacy = MeshCodec::new(Dialect::Legacy);
    let info = UpstreamInfo::default();
    assert!(matches!(
        legacy.encode_message(&info),
        Err(CodecError::UnsupportedTag(TAG_MESSAGE))
    ));
}

#[test]
fn multi_value_payload_with_shapes() {
    // The transparent-proxy argument layout: [header bytes, body bytes].
    let codec = MeshCodec::new(Dialect::Message);
    let header = Value::Bytes(b"GET /t HTTP/1.1\r\nHost: x\r\n\r\n".to_vec());
    let body = Value::Null;
    let bytes = codec.serialize_multi(&[header.clone(), body]).unwrap();

    let shapes = [TargetShape::Bytes, TargetShape::Bytes];
    let out = codec.deserialize_multi(&bytes, Some(&shapes)).unwrap();
    assert_eq!(out[0], header);
    assert_eq!(out[1], Value::Null);
}

#[test]
fn sequence_first_byte_is_sequence_tag() {
    let codec = MeshCodec::new(Dialect::Legacy);
    let bytes = codec
        .serialize(&Value::Sequence(vec![Value::from("a")]))
        .unwrap();
    assert_eq!(bytes[0], TAG_SEQUENCE);
}
