//! Provider that bridges incoming RPC calls to an upstream cluster,
//! rewriting HTTP paths through the location matcher.

use std::sync::Arc;
use std::time::Instant;

use meshgate_core::{
    attachment, ClusterFactory, Exception, RpcCluster, RpcRequest, RpcResponse, ServiceUrl,
};
use tracing::error;

use crate::error::GatewayError;
use crate::location::{LocationMatcher, LocationRule};

pub const UPSTREAM_REGISTRY_KEY: &str = "upstreamRegistry";
pub const UPSTREAM_PROTOCOL_KEY: &str = "upstreamProtocol";

const DEFAULT_UPSTREAM_PROTOCOL: &str = "motan2";

/// Maps incoming RPC methods to upstream paths and dispatches to the
/// child cluster obtained from the configured registry.
pub struct ReverseProxyProvider {
    url: ServiceUrl,
    cluster: Arc<dyn RpcCluster>,
    location_matcher: Option<LocationMatcher>,
}

impl ReverseProxyProvider {
    /// Builds the provider and its child cluster.
    ///
    /// When the upstream protocol is HTTP, `locations` configures the
    /// method-to-path rewrites; other protocols pass methods through.
    pub fn new(
        url: ServiceUrl,
        locations: &[LocationRule],
        factory: &dyn ClusterFactory,
    ) -> Result<Self, GatewayError> {
        let mut cluster_url = url.clone();
        cluster_url.host.clear();
        cluster_url.port = 0;
        cluster_url.protocol =
            cluster_url.get_param(UPSTREAM_PROTOCOL_KEY, DEFAULT_UPSTREAM_PROTOCOL);

        let location_matcher = if cluster_url.protocol == "http" {
            Some(LocationMatcher::new(locations)?)
        } else {
            None
        };

        let upstream_registry = cluster_url.get_param(UPSTREAM_REGISTRY_KEY, "");
        if upstream_registry.is_empty() {
            error!(
                "a reverse proxy provider requires [{}] to specify how to get nodes",
                UPSTREAM_REGISTRY_KEY
            );
            return Err(GatewayError::Config(format!(
                "missing {UPSTREAM_REGISTRY_KEY} parameter"
            )));
        }
        cluster_url.remove_param(UPSTREAM_REGISTRY_KEY);
        cluster_url.put_param("registry", &upstream_registry);

        let cluster = factory
            .create(&cluster_url)
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        Ok(Self {
            url,
            cluster,
            location_matcher,
        })
    }

    #[must_use]
    pub fn url(&self) -> &ServiceUrl {
        &self.url
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        true
    }

    /// Dispatches a call, rewriting the method into an upstream path first
    /// when the upstream speaks HTTP.
    pub async fn call(&self, mut request: RpcRequest) -> RpcResponse {
        let start = Instant::now();
        if let Some(matcher) = &self.location_matcher {
            match matcher.pick(&request.method) {
                Some(rewrite) => {
                    let rewrite = rewrite.to_owned();
                    request.set_attachment(attachment::HTTP_PATH, rewrite);
                }
                None => {
                    return RpcResponse::exception(
                        &request,
                        Exception::service_not_found("service not found"),
                        start.elapsed().as_millis() as i64,
                    );
                }
            }
        }
        self.cluster.call(request).await
    }

    /// Tears down the child cluster.
    pub async fn destroy(&self) {
        self.cluster.destroy().await;
    }
}
