//! Wire-level serialization for meshgate RPC payloads.
//!
//! A tag-length-value format over a shared byte buffer. Every value starts
//! with a one-byte tag; variable-length payloads carry a zigzag varint
//! length, tagged messages a fixed 4-byte big-endian one:
//!
//! ```text
//! ┌─────┬───────────────────────────────────────────────┐
//! │ tag │ payload (fixed width, varint-prefixed, or     │
//! │ (1) │ delimited by an end tag)                      │
//! ├─────┼──────────────┬────────────────────────────────┤
//! │ 26  │ body len (4) │ (zigzag32 field, value) pairs  │
//! └─────┴──────────────┴────────────────────────────────┘
//! ```
//!
//! Two dialects share the tag table: the legacy flat dialect and the
//! message dialect that adds tagged struct encoding. See [`codec::Dialect`].
//!
//! # Example
//!
//! ```
//! use meshgate_proto::{Dialect, MeshCodec, Value};
//!
//! let codec = MeshCodec::new(Dialect::Message);
//! let bytes = codec.serialize(&Value::from("hello")).unwrap();
//! assert_eq!(codec.deserialize(&bytes).unwrap(), Value::from("hello"));
//! ```

pub mod buffer;
pub mod codec;
mod error;
mod value;

pub use buffer::{ByteCursor, DEFAULT_BUFFER_SIZE};
pub use codec::{Dialect, MeshCodec};
pub use error::CodecError;
pub use value::{GenericMessage, MeshMessage, TargetShape, Value};
