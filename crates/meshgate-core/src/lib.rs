//! Core RPC data model and bridging interfaces for meshgate.
//!
//! Everything the serialization engine and the HTTP bridge share lives
//! here: the request/response model with its attachment store, structured
//! exceptions, the URL-like option carrier, the access-log formatter, and
//! the trait seams to the external cluster/registry subsystems.

pub mod access_log;
pub mod attachment;
pub mod cluster;
mod exception;
mod request;
mod url;

pub use access_log::{LayoutFormatter, COMMON_LAYOUT};
pub use cluster::{ClusterError, ClusterFactory, HttpCluster, HttpClusterGetter, RpcCluster};
pub use exception::{Exception, ExceptionKind};
pub use request::{Attachments, Payload, RpcContext, RpcRequest, RpcResponse};
pub use url::ServiceUrl;
