//! Trait seams to the discovery and dispatch subsystems.
//!
//! Cluster construction, registry lookup and load balancing live outside
//! this codebase; the bridge only consumes these interfaces.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::request::{RpcRequest, RpcResponse};
use crate::url::ServiceUrl;

/// Failure to build a cluster from its configuration.
#[derive(Error, Debug)]
#[error("cluster setup failed: {0}")]
pub struct ClusterError(pub String);

/// A load-balanced RPC dispatch target for one upstream service.
#[async_trait]
pub trait RpcCluster: Send + Sync {
    async fn call(&self, request: RpcRequest) -> RpcResponse;

    /// Releases registry subscriptions and connections.
    async fn destroy(&self);
}

/// Builds clusters from a configured upstream URL.
pub trait ClusterFactory: Send + Sync {
    fn create(&self, url: &ServiceUrl) -> Result<Arc<dyn RpcCluster>, ClusterError>;
}

/// An RPC cluster fronting HTTP services for a single domain.
#[async_trait]
pub trait HttpCluster: Send + Sync {
    /// Returns the service name when this cluster can serve the path.
    fn can_serve(&self, path: &str) -> Option<String>;

    async fn call(&self, request: RpcRequest) -> RpcResponse;
}

/// Looks up the HTTP cluster registered for a domain.
pub trait HttpClusterGetter: Send + Sync {
    fn http_cluster(&self, host: &str) -> Option<Arc<dyn HttpCluster>>;
}
