//! Error types for the wire codec.

use thiserror::Error;

/// Errors raised while encoding or decoding codec values.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// A read ran past the written end of the buffer.
    #[error("unexpected end of buffer")]
    Underflow,

    /// A message body did not consume exactly its declared length.
    #[error("message body size mismatch")]
    SizeMismatch,

    /// A reserved or unknown tag was encountered.
    #[error("unsupported tag: {0}")]
    UnsupportedTag(u8),

    /// The caller demanded a specific type but the wire tag disagrees.
    #[error("{expected} tag expected, but actual tag is {actual}")]
    TagMismatch {
        expected: &'static str,
        actual: u8,
    },

    /// A length prefix decoded to a negative value.
    #[error("invalid length prefix: {0}")]
    InvalidLength(i32),

    /// A string payload was not valid UTF-8.
    #[error("invalid utf-8 in string payload")]
    InvalidUtf8,
}
