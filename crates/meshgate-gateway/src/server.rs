//! Inbound HTTP(S) proxy server.
//!
//! Serves three behaviours per connection: CONNECT tunnelling to the
//! origin, host-routed translation of HTTP requests into internal RPC
//! calls, and raw transparent forwarding through a pooled client. A
//! panicking handler aborts only its own request.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::FutureExt;
use http::header::{HeaderValue, CONNECTION, HOST, SERVER};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use meshgate_core::{
    attachment, HttpCluster, HttpClusterGetter, LayoutFormatter, Payload, RpcRequest, RpcResponse,
    ServiceUrl,
};
use meshgate_proto::{Dialect, MeshCodec, TargetShape, Value};

use crate::error::GatewayError;
use crate::resolver::DnsResolver;

pub const PROXY_SERVER_NAME: &str = "meshgate";

// Option keys recognised on the server URL.
pub const KEEPALIVE_KEY: &str = "httpProxyKeepalive";
pub const RESOLVE_CONF_KEY: &str = "httpProxyResolveConf";
pub const DEFAULT_DOMAIN_KEY: &str = "httpProxyDefaultDomain";
pub const PROXY_TIMEOUT_KEY: &str = "httpProxyTimeout";

const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(5);

/// The inbound proxy listener.
pub struct HttpProxyServer {
    url: ServiceUrl,
    cluster_getter: Arc<dyn HttpClusterGetter>,
}

impl HttpProxyServer {
    #[must_use]
    pub fn new(url: ServiceUrl, cluster_getter: Arc<dyn HttpClusterGetter>) -> Self {
        Self {
            url,
            cluster_getter,
        }
    }

    #[must_use]
    pub fn url(&self) -> &ServiceUrl {
        &self.url
    }

    /// Binds the configured address and serves until cancelled.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<(), GatewayError> {
        let host = if self.url.host.is_empty() {
            "0.0.0.0"
        } else {
            self.url.host.as_str()
        };
        let listener = TcpListener::bind((host, self.url.port)).await?;
        self.serve_with_listener(listener, cancel).await
    }

    /// Serves connections accepted from `listener` until cancelled.
    pub async fn serve_with_listener(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), GatewayError> {
        // The outbound client must not route through an ambient proxy,
        // which could be this very server.
        std::env::remove_var("http_proxy");
        std::env::remove_var("https_proxy");

        let port = listener.local_addr()?.port();

        let resolve_conf = self.url.get_param(RESOLVE_CONF_KEY, "");
        let resolver = if resolve_conf.is_empty() {
            None
        } else {
            Some(DnsResolver::new(Some(Path::new(&resolve_conf)))?)
        };

        let timeout = self
            .url
            .get_duration_ms(PROXY_TIMEOUT_KEY, DEFAULT_PROXY_TIMEOUT);
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        let client = Client::builder(TokioExecutor::new())
            .http1_preserve_header_case(true)
            .build(connector);

        // Requests addressed straight at one of our own listening
        // addresses are rejected to prevent proxy loops.
        let mut deny = vec![format!("127.0.0.1:{port}"), format!("localhost:{port}")];
        if let Some(ip) = local_ip() {
            deny.push(format!("{ip}:{port}"));
        }

        let state = Arc::new(ProxyState {
            cluster_getter: self.cluster_getter.clone(),
            client,
            resolver,
            deny,
            keepalive: self.url.get_bool(KEEPALIVE_KEY, true),
            default_domain: self.url.get_param(DEFAULT_DOMAIN_KEY, ""),
            timeout,
            codec: MeshCodec::new(Dialect::Message),
            access_log: LayoutFormatter::with_role("server-agent"),
        });

        info!(port, "http proxy server listening");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("http proxy server shutdown");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let state = state.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let outer = state.clone();
                        let service = service_fn(move |req| {
                            let state = outer.clone();
                            async move { Ok::<_, Infallible>(state.handle(req, peer).await) }
                        });
                        if let Err(e) = http1::Builder::new()
                            .preserve_header_case(true)
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            debug!(error = %e, "connection closed with error");
                        }
                    });
                }
            }
        }
    }
}

struct ProxyState {
    cluster_getter: Arc<dyn HttpClusterGetter>,
    client: Client<HttpConnector, Full<Bytes>>,
    resolver: Option<DnsResolver>,
    deny: Vec<String>,
    keepalive: bool,
    default_domain: String,
    timeout: Duration,
    codec: MeshCodec,
    access_log: LayoutFormatter,
}

impl ProxyState {
    /// Routes one request, containing any handler panic to that request.
    async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let descriptor = format!("{} {}", req.method(), req.uri());
        match std::panic::AssertUnwindSafe(self.route(req, peer))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(_) => {
                error!(request = %descriptor, "proxy handler panicked");
                status_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    async fn route(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<Full<Bytes>> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req).await;
        }

        let origin_form = req.uri().authority().is_none();
        let mut host_and_port = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .or_else(|| req.uri().authority().map(ToString::to_string))
            .unwrap_or_default();
        if split_host_port(&host_and_port).map(|(_, p)| p).is_err() {
            host_and_port = format!("{host_and_port}:80");
        }
        let host = match split_host_port(&host_and_port) {
            Ok((host, _)) => host,
            Err(_) => return status_response(StatusCode::BAD_REQUEST),
        };

        let mut cluster = self.cluster_getter.http_cluster(&host);
        let mut effective_host = host_and_port.clone();
        if cluster.is_none() && !self.default_domain.is_empty() {
            cluster = self.cluster_getter.http_cluster(&self.default_domain);
            if cluster.is_some() {
                effective_host = self.default_domain.clone();
            }
        }
        if let Some(cluster) = cluster {
            if let Some(service) = cluster.can_serve(req.uri().path()) {
                return self.rpc_proxy(req, cluster, service, peer).await;
            }
        }

        if origin_form && self.deny.iter().any(|d| d == &host_and_port) {
            return status_response(StatusCode::BAD_REQUEST);
        }

        self.forward(req, effective_host).await
    }

    /// CONNECT tunnelling: dial the origin, answer 200, then shuttle raw
    /// bytes both ways until either side closes.
    async fn handle_connect(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let target = req
            .uri()
            .authority()
            .map(ToString::to_string)
            .or_else(|| {
                req.headers()
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
            })
            .unwrap_or_default();

        let origin = match self.dial(&target).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(origin = %target, error = %e, "connect dial failed");
                return status_response(StatusCode::BAD_GATEWAY);
            }
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => tunnel(upgraded, origin).await,
                Err(e) => debug!(error = %e, "connect upgrade failed"),
            }
        });

        status_response(StatusCode::OK)
    }

    /// Translates the HTTP request into an internal RPC call carrying the
    /// raw header and body bytes, and maps the reply back.
    async fn rpc_proxy(
        &self,
        req: Request<Incoming>,
        cluster: Arc<dyn HttpCluster>,
        service: String,
        peer: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let start = Instant::now();
        let path = req.uri().path().to_owned();
        let target = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| path.clone());
        let method = req.method().clone();
        let headers = req.headers().clone();

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "reading request body failed");
                return status_response(StatusCode::BAD_REQUEST);
            }
        };

        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(format!("{method} {target} HTTP/1.1\r\n").as_bytes());
        for (name, value) in headers.iter() {
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");

        let mut rpc_request = RpcRequest::new(service, path);
        rpc_request.set_attachment(attachment::HTTP_PROXY, "true");
        rpc_request.context.remote_address = peer.to_string();
        rpc_request.context.body_size = body.len();
        rpc_request.arguments =
            Payload::Decoded(vec![Value::Bytes(head), Value::Bytes(body.to_vec())]);

        let mut rpc_response = cluster.call(rpc_request.clone()).await;
        let http_response = self.rpc_reply_to_response(&mut rpc_response);

        rpc_request.context.request_time_ms = start.elapsed().as_millis() as i64;
        let line = self.access_log.format(&rpc_request, &rpc_response);
        info!(target: "access", "{line}");

        http_response
    }

    fn rpc_reply_to_response(&self, response: &mut RpcResponse) -> Response<Full<Bytes>> {
        if let Some(ex) = &response.exception {
            error!(error = %ex.message, "http rpc proxy call failed");
            return error_response(
                StatusCode::BAD_GATEWAY,
                &format!("err_msg: {}", ex.message),
            );
        }
        // The reply is expected as raw [header bytes, body bytes].
        let shapes = [TargetShape::Bytes, TargetShape::Bytes];
        if let Err(e) = response.process_deserializable(&self.codec, Some(&shapes)) {
            error!(error = %e, "deserialize rpc response failed");
            return error_response(StatusCode::BAD_GATEWAY, &format!("err_msg: {e}"));
        }

        let values = response.value.values();
        let head = values.first().and_then(Value::as_bytes).unwrap_or(&[]);
        let body = values.get(1).and_then(Value::as_bytes).unwrap_or(&[]);

        let mut header_storage = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Response::new(&mut header_storage);
        let mut builder = Response::builder();
        if !head.is_empty()
            && matches!(parsed.parse(head), Ok(httparse::Status::Complete(_)))
        {
            builder = builder.status(parsed.code.unwrap_or(200));
            for header in parsed.headers.iter() {
                builder = builder.header(header.name, header.value);
            }
        }
        builder
            .body(Full::new(Bytes::copy_from_slice(body)))
            .unwrap_or_else(|_| status_response(StatusCode::BAD_GATEWAY))
    }

    /// Transparent HTTP forwarding through the pooled client.
    async fn forward(&self, req: Request<Incoming>, effective_host: String) -> Response<Full<Bytes>> {
        let start = Instant::now();
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "reading request body failed");
                return status_response(StatusCode::BAD_REQUEST);
            }
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());
        // A rewritten default domain arrives without a port.
        let effective_host = match split_host_port(&effective_host) {
            Ok(_) => effective_host,
            Err(_) => format!("{effective_host}:80"),
        };
        let Ok((host, port)) = split_host_port(&effective_host) else {
            return status_response(StatusCode::BAD_REQUEST);
        };

        let connect_host = if let Some(resolver) = &self.resolver {
            match resolver.lookup_host(&host).await {
                Ok(addrs) if !addrs.is_empty() => addrs[0].clone(),
                Ok(_) | Err(_) => {
                    warn!(host = %host, "host resolution failed");
                    return status_response(StatusCode::BAD_GATEWAY);
                }
            }
        } else {
            host.clone()
        };

        let target = format!(
            "http://{}{path_and_query}",
            format_authority(&connect_host, port)
        );
        let Ok(uri) = target.parse::<Uri>() else {
            return status_response(StatusCode::BAD_REQUEST);
        };

        let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
        for (name, value) in parts.headers.iter() {
            if self.keepalive && name == CONNECTION {
                continue;
            }
            builder = builder.header(name, value);
        }
        let Ok(mut outbound) = builder.body(Full::new(body)) else {
            return status_response(StatusCode::BAD_REQUEST);
        };
        // The connection goes to the (possibly resolved) address; the Host
        // header keeps the logical target.
        if let Ok(value) = HeaderValue::from_str(&effective_host) {
            outbound.headers_mut().insert(HOST, value);
        }

        match tokio::time::timeout(self.timeout, self.client.request(outbound)).await {
            Ok(Ok(response)) => {
                let (mut rparts, rbody) = response.into_parts();
                let rbody = match tokio::time::timeout(self.timeout, rbody.collect()).await {
                    Ok(Ok(collected)) => collected.to_bytes(),
                    _ => {
                        error!(uri = %path_and_query, "reading upstream body failed");
                        return bad_gateway_response();
                    }
                };
                if self.keepalive {
                    rparts.headers.remove(CONNECTION);
                }
                info!(
                    target: "access",
                    host = %effective_host,
                    uri = %path_and_query,
                    status = rparts.status.as_u16(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "http-proxy"
                );
                Response::from_parts(rparts, Full::new(rbody))
            }
            _ => {
                error!(uri = %path_and_query, "proxy request by http failed");
                bad_gateway_response()
            }
        }
    }

    /// Dials `host:port`, resolving the host first when a resolver is
    /// configured.
    async fn dial(&self, host_and_port: &str) -> Result<TcpStream, GatewayError> {
        let (host, port) = split_host_port(host_and_port)?;
        let target = if let Some(resolver) = &self.resolver {
            let addrs = resolver.lookup_host(&host).await?;
            let ip = addrs
                .first()
                .ok_or_else(|| GatewayError::NoSuchHost(host.clone()))?;
            format_authority(ip, port)
        } else {
            format_authority(&host, port)
        };
        tokio::time::timeout(self.timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| GatewayError::Timeout)?
            .map_err(|e| GatewayError::ConnectionFailed(e.to_string()))
    }
}

/// Shuttles bytes between the upgraded client connection and the origin:
/// two transfer tasks, joined; an EOF on either side shuts the other down.
async fn tunnel(upgraded: Upgraded, origin: TcpStream) {
    let (mut client_read, mut client_write) = tokio::io::split(TokioIo::new(upgraded));
    let (mut origin_read, mut origin_write) = origin.into_split();

    let upstream = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut client_read, &mut origin_write).await;
        let _ = origin_write.shutdown().await;
    });
    let downstream = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut origin_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
    });
    let _ = tokio::join!(upstream, downstream);
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn bad_gateway_response() -> Response<Full<Bytes>> {
    let mut response = status_response(StatusCode::BAD_GATEWAY);
    response
        .headers_mut()
        .insert(SERVER, HeaderValue::from_static(PROXY_SERVER_NAME));
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::copy_from_slice(message.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(SERVER, HeaderValue::from_static(PROXY_SERVER_NAME));
    response
}

/// Splits `host:port`, handling bracketed IPv6. A missing port is an error.
fn split_host_port(host_and_port: &str) -> Result<(String, u16), GatewayError> {
    if let Some(rest) = host_and_port.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(GatewayError::RequestBuild(format!(
                "bad host {host_and_port:?}"
            )));
        };
        let port = tail
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| GatewayError::RequestBuild(format!("bad host {host_and_port:?}")))?;
        return Ok((host.to_owned(), port));
    }
    match host_and_port.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse()
                .map_err(|_| GatewayError::RequestBuild(format!("bad host {host_and_port:?}")))?;
            Ok((host.to_owned(), port))
        }
        _ => Err(GatewayError::RequestBuild(format!(
            "bad host {host_and_port:?}"
        ))),
    }
}

fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// The primary outbound IP, discovered without sending any packets.
fn local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_splitting() {
        assert_eq!(
            split_host_port("example.com:80").unwrap(),
            ("example.com".to_owned(), 80)
        );
        assert_eq!(
            split_host_port("[::1]:8080").unwrap(),
            ("::1".to_owned(), 8080)
        );
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port("[::1]").is_err());
        assert!(split_host_port("a:b:c").is_err());
    }

    #[test]
    fn authority_formatting() {
        assert_eq!(format_authority("10.0.0.1", 80), "10.0.0.1:80");
        assert_eq!(format_authority("::1", 80), "[::1]:80");
    }
}
