//! RPC request and response model.

use std::collections::HashMap;

use bytes::Bytes;
use meshgate_proto::{CodecError, MeshCodec, TargetShape, Value};

use crate::exception::Exception;

/// String-keyed metadata traveling alongside a request or response.
///
/// The store is case-sensitive; HTTP-header-like keys can additionally be
/// looked up case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct Attachments {
    entries: HashMap<String, String>,
}

impl Attachments {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Case-insensitive lookup, for header-like keys such as
    /// `X-Forwarded-For`. Original casing is preserved in the store.
    #[must_use]
    pub fn get_ignore_case(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Argument or result payload, possibly still in wire form.
///
/// Payloads arrive from the transport as raw codec bytes and are decoded
/// on demand; locally-built requests carry decoded values from the start.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Payload {
    #[default]
    Empty,
    Decoded(Vec<Value>),
    Encoded(Bytes),
}

impl Payload {
    /// Decoded values; empty until `process_deserializable` has run on an
    /// encoded payload.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        match self {
            Payload::Decoded(values) => values,
            _ => &[],
        }
    }

    /// Decodes an encoded payload in place, optionally guided by the
    /// expected target shapes. Without shapes, values are read until the
    /// buffer is exhausted and land in their canonical dynamic form.
    pub fn process_deserializable(
        &mut self,
        codec: &MeshCodec,
        shapes: Option<&[TargetShape]>,
    ) -> Result<(), CodecError> {
        let Payload::Encoded(bytes) = &*self else {
            return Ok(());
        };
        let values = codec.deserialize_multi(bytes, shapes)?;
        *self = Payload::Decoded(values);
        Ok(())
    }
}

/// Per-request transport context.
#[derive(Debug, Clone, Default)]
pub struct RpcContext {
    /// Caller address as seen by the transport.
    pub remote_address: String,
    /// Serialized body size in bytes.
    pub body_size: usize,
    /// Wall time spent on the request, in milliseconds.
    pub request_time_ms: i64,
}

/// An RPC request crossing the bridge.
#[derive(Debug, Clone, Default)]
pub struct RpcRequest {
    pub request_id: u64,
    pub service: String,
    pub method: String,
    pub method_desc: String,
    pub arguments: Payload,
    pub attachments: Attachments,
    pub context: RpcContext,
}

impl RpcRequest {
    #[must_use]
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            ..Self::default()
        }
    }

    /// Attachment value, empty when absent.
    #[must_use]
    pub fn attachment(&self, key: &str) -> &str {
        self.attachments.get(key).unwrap_or("")
    }

    pub fn set_attachment(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attachments.set(key, value);
    }

    pub fn process_deserializable(
        &mut self,
        codec: &MeshCodec,
        shapes: Option<&[TargetShape]>,
    ) -> Result<(), CodecError> {
        self.arguments.process_deserializable(codec, shapes)
    }
}

/// The response mirror of [`RpcRequest`].
#[derive(Debug, Clone, Default)]
pub struct RpcResponse {
    pub request_id: u64,
    pub value: Payload,
    pub attachments: Attachments,
    pub process_time_ms: i64,
    pub exception: Option<Exception>,
    pub context: RpcContext,
}

impl RpcResponse {
    /// An empty response carrying the request's id.
    #[must_use]
    pub fn for_request(request: &RpcRequest) -> Self {
        Self {
            request_id: request.request_id,
            ..Self::default()
        }
    }

    /// An exception response for the request, with elapsed time recorded.
    #[must_use]
    pub fn exception(request: &RpcRequest, exception: Exception, process_time_ms: i64) -> Self {
        Self {
            request_id: request.request_id,
            process_time_ms,
            exception: Some(exception),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn attachment(&self, key: &str) -> &str {
        self.attachments.get(key).unwrap_or("")
    }

    pub fn set_attachment(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attachments.set(key, value);
    }

    pub fn process_deserializable(
        &mut self,
        codec: &MeshCodec,
        shapes: Option<&[TargetShape]>,
    ) -> Result<(), CodecError> {
        self.value.process_deserializable(codec, shapes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_proto::Dialect;

    #[test]
    fn attachment_lookup_case_rules() {
        let mut att = Attachments::new();
        att.set("X-Forwarded-For", "A,B");

        assert_eq!(att.get("X-Forwarded-For"), Some("A,B"));
        assert_eq!(att.get("x-forwarded-for"), None);
        assert_eq!(att.get_ignore_case("x-forwarded-for"), Some("A,B"));
        assert_eq!(att.get_ignore_case("X-FORWARDED-FOR"), Some("A,B"));
    }

    #[test]
    fn encoded_payload_decodes_in_place() {
        let codec = MeshCodec::new(Dialect::Message);
        let values = vec![Value::Bytes(b"head".to_vec()), Value::Bytes(b"body".to_vec())];
        let bytes = codec.serialize_multi(&values).unwrap();

        let mut payload = Payload::Encoded(Bytes::from(bytes));
        assert!(payload.values().is_empty());
        payload.process_deserializable(&codec, None).unwrap();
        assert_eq!(payload.values(), values.as_slice());

        // Decoding twice is a no-op.
        payload.process_deserializable(&codec, None).unwrap();
        assert_eq!(payload.values(), values.as_slice());
    }

    #[test]
    fn exception_response_keeps_request_id() {
        let mut request = RpcRequest::new("svc", "/path");
        request.request_id = 42;
        let response = RpcResponse::exception(&request, Exception::unavailable("down"), 3);
        assert_eq!(response.request_id, 42);
        assert_eq!(response.exception.as_ref().unwrap().code, 503);
        assert_eq!(response.process_time_ms, 3);
    }
}
