//! Outbound HTTP client endpoint.
//!
//! Calls an upstream HTTP origin on behalf of RPC requests, either by
//! shuttling raw header/body bytes through unchanged (transparent mode)
//! or by translating the RPC request into an HTTP one and back. Keeps a
//! keep-alive connection pool per host and an optional active health
//! check driving the endpoint's availability word.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONNECTION, HOST};
use http::{Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use meshgate_core::{attachment, Exception, RpcRequest, RpcResponse, ServiceUrl};
use meshgate_proto::{Dialect, MeshCodec, Value};

pub const ENDPOINT_NAME: &str = "httpEndpoint";

// Option keys recognised on the endpoint URL.
pub const TIMEOUT_KEY: &str = "timeout";
pub const KEEPALIVE_TIMEOUT_KEY: &str = "keepaliveTimeout";
pub const MAX_CONNECTIONS_KEY: &str = "maxConnections";
pub const HTTP_REQUEST_METHOD_KEY: &str = "HTTP_REQUEST_METHOD";
pub const DOMAIN_KEY: &str = "domain";
pub const NODE_TYPE_KEY: &str = "nodeType";
pub const HEALTH_CHECK_URI_KEY: &str = "checkURI";
pub const HEALTH_CHECK_INTERVAL_KEY: &str = "checkInterval";
pub const HEALTH_CHECK_TIMEOUT_KEY: &str = "checkTimeout";
pub const HEALTH_CHECK_ALIVE_STATUS_KEY: &str = "checkAliveStatus";
pub const HEALTH_CHECK_RETRY_KEY: &str = "checkRetry";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);
const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_millis(5000);
const DEFAULT_MAX_CONNECTIONS: u64 = 50;
const DEFAULT_HTTP_METHOD: &str = "GET";
const HEALTH_CHECK_DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);
const HEALTH_CHECK_DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);
const HEALTH_CHECK_DEFAULT_ALIVE_STATUS: u64 = 200;
const HEALTH_CHECK_DEFAULT_RETRY: u64 = 3;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// An outbound HTTP endpoint with pooled keep-alive connections.
pub struct HttpEndpoint {
    url: ServiceUrl,
    client: Client<HttpConnector, Full<Bytes>>,
    request_timeout: Duration,
    default_method: String,
    domain: String,
    reverse_proxy: bool,
    available: AtomicBool,
    cancel: CancellationToken,
    codec: MeshCodec,
}

impl HttpEndpoint {
    /// Builds the endpoint from its URL options and, when a check URI is
    /// configured, starts the health-check loop in the Unavailable state.
    pub fn new(url: ServiceUrl) -> Arc<Self> {
        let request_timeout = url.get_duration_ms(TIMEOUT_KEY, DEFAULT_REQUEST_TIMEOUT);
        let keepalive_timeout =
            url.get_duration_ms(KEEPALIVE_TIMEOUT_KEY, DEFAULT_KEEPALIVE_TIMEOUT);
        let max_connections = url.get_positive_int(MAX_CONNECTIONS_KEY, DEFAULT_MAX_CONNECTIONS);
        let default_method = url.get_param(HTTP_REQUEST_METHOD_KEY, DEFAULT_HTTP_METHOD);
        let domain = url.get_param(DOMAIN_KEY, "");
        let reverse_proxy = url.get_param(NODE_TYPE_KEY, "") == "service";

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(request_timeout));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(keepalive_timeout)
            .pool_max_idle_per_host(max_connections as usize)
            .http1_preserve_header_case(true)
            .build(connector);

        let check_uri = url.get_param(HEALTH_CHECK_URI_KEY, "");

        let endpoint = Arc::new(Self {
            client,
            request_timeout,
            default_method,
            domain,
            reverse_proxy,
            available: AtomicBool::new(check_uri.is_empty()),
            cancel: CancellationToken::new(),
            codec: MeshCodec::new(Dialect::Message),
            url,
        });

        if !check_uri.is_empty() {
            let check_uri = if check_uri.starts_with('/') {
                check_uri
            } else {
                format!("/{check_uri}")
            };
            let check = HealthCheck {
                url: format!("http://{}{}", endpoint.url.host_port(), check_uri),
                interval: endpoint
                    .url
                    .get_duration_ms(HEALTH_CHECK_INTERVAL_KEY, HEALTH_CHECK_DEFAULT_INTERVAL),
                timeout: endpoint
                    .url
                    .get_duration_ms(HEALTH_CHECK_TIMEOUT_KEY, HEALTH_CHECK_DEFAULT_TIMEOUT),
                alive_status: endpoint.url.get_positive_int(
                    HEALTH_CHECK_ALIVE_STATUS_KEY,
                    HEALTH_CHECK_DEFAULT_ALIVE_STATUS,
                ) as u16,
                retry: endpoint
                    .url
                    .get_positive_int(HEALTH_CHECK_RETRY_KEY, HEALTH_CHECK_DEFAULT_RETRY),
            };
            tokio::spawn(check_loop(endpoint.clone(), check));
        }

        endpoint
    }

    #[must_use]
    pub fn url(&self) -> &ServiceUrl {
        &self.url
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        ENDPOINT_NAME
    }

    /// Current health status; lock-free read.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Stops the health-check loop.
    pub fn destroy(&self) {
        self.cancel.cancel();
    }

    /// Executes the request against the upstream origin.
    ///
    /// The `HTTP_PROXY=true` attachment selects transparent mode, in which
    /// the arguments carry raw HTTP header and body bytes; otherwise the
    /// RPC request is translated into an HTTP one.
    pub async fn call(&self, mut request: RpcRequest) -> RpcResponse {
        let start = Instant::now();

        let path = {
            let p = request.attachment(attachment::HTTP_PATH);
            let p = if p.is_empty() {
                request.method.as_str()
            } else {
                p
            };
            if p.starts_with('/') {
                p.to_owned()
            } else {
                format!("/{p}")
            }
        };

        if let Err(e) = request.process_deserializable(&self.codec, None) {
            return RpcResponse::exception(
                &request,
                Exception::codec(e.to_string()),
                elapsed_ms(start),
            );
        }

        let transparent = request.attachment(attachment::HTTP_PROXY) == "true";
        let forwarded_for = self.forwarded_for_value(&request);

        let mut response = if transparent {
            self.call_transparent(&request, &path, forwarded_for.as_deref(), start)
                .await
        } else {
            self.call_translated(&request, &path, forwarded_for.as_deref(), start)
                .await
        };
        response.process_time_ms = elapsed_ms(start);
        response
    }

    /// The X-Forwarded-For value to apply when acting as a reverse proxy:
    /// the caller's IP appended to any existing chain.
    fn forwarded_for_value(&self, request: &RpcRequest) -> Option<String> {
        if !self.reverse_proxy {
            return None;
        }
        let ip = request
            .attachments
            .get(attachment::REMOTE_IP)
            .or_else(|| request.attachments.get(attachment::HOST))
            .unwrap_or("");
        let existing = request
            .attachments
            .get_ignore_case(attachment::X_FORWARDED_FOR)
            .unwrap_or("");
        if existing.is_empty() {
            Some(ip.to_owned())
        } else {
            Some(format!("{existing},{ip}"))
        }
    }

    async fn call_transparent(
        &self,
        request: &RpcRequest,
        path: &str,
        forwarded_for: Option<&str>,
        start: Instant,
    ) -> RpcResponse {
        let args = request.arguments.values();
        let header_bytes = args.first().and_then(Value::as_bytes).unwrap_or(&[]);
        let body_bytes = args.get(1).and_then(Value::as_bytes).unwrap_or(&[]);

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut headers);
        if !matches!(parsed.parse(header_bytes), Ok(httparse::Status::Complete(_))) {
            return RpcResponse::exception(
                request,
                Exception::bad_request("unparseable request header bytes"),
                elapsed_ms(start),
            );
        }

        // Path comes from the attachment/method; the query survives from
        // the original request target.
        let query = parsed
            .path
            .and_then(|p| p.find('?').map(|i| &p[i..]))
            .unwrap_or("");
        let uri: Uri = match format!("http://{}{}{}", self.url.host_port(), path, query).parse() {
            Ok(uri) => uri,
            Err(e) => {
                return RpcResponse::exception(
                    request,
                    Exception::bad_request(format!("bad request path: {e}")),
                    elapsed_ms(start),
                );
            }
        };
        let method = match Method::from_bytes(parsed.method.unwrap_or("GET").as_bytes()) {
            Ok(m) => m,
            Err(e) => {
                return RpcResponse::exception(
                    request,
                    Exception::bad_request(format!("bad method: {e}")),
                    elapsed_ms(start),
                );
            }
        };

        let mut builder = Request::builder().method(method).uri(uri);
        for header in parsed.headers.iter() {
            // Hop-by-hop header, the pool manages its own connections.
            if header.name.eq_ignore_ascii_case("connection") {
                continue;
            }
            builder = builder.header(header.name, header.value);
        }
        let mut http_request = match builder.body(Full::new(Bytes::copy_from_slice(body_bytes))) {
            Ok(r) => r,
            Err(e) => {
                return RpcResponse::exception(
                    request,
                    Exception::bad_request(e.to_string()),
                    elapsed_ms(start),
                );
            }
        };
        apply_forwarded_for(&mut http_request, forwarded_for);

        let (parts, body) = match self.execute(http_request).await {
            Ok(r) => r,
            Err(e) => return RpcResponse::exception(request, e, elapsed_ms(start)),
        };

        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(
            format!(
                "HTTP/1.1 {} {}\r\n",
                parts.status.as_u16(),
                parts.status.canonical_reason().unwrap_or("")
            )
            .as_bytes(),
        );
        for (name, value) in parts.headers.iter() {
            if name == CONNECTION {
                continue;
            }
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");

        let mut response = RpcResponse::for_request(request);
        response.context.body_size = body.len();
        // The pooled response buffer is recycled, the body handed out is
        // an owned copy.
        response.value = meshgate_core::Payload::Decoded(vec![
            Value::Bytes(head),
            Value::Bytes(body.to_vec()),
        ]);
        response
    }

    async fn call_translated(
        &self,
        request: &RpcRequest,
        path: &str,
        forwarded_for: Option<&str>,
        start: Instant,
    ) -> RpcResponse {
        let method_name = {
            let m = request.attachment(attachment::HTTP_METHOD);
            if m.is_empty() {
                self.default_method.clone()
            } else {
                m.to_owned()
            }
        };
        let method = match Method::from_bytes(method_name.as_bytes()) {
            Ok(m) => m,
            Err(e) => {
                return RpcResponse::exception(
                    request,
                    Exception::bad_request(format!("bad method {method_name:?}: {e}")),
                    elapsed_ms(start),
                );
            }
        };

        let query = request.attachment(attachment::HTTP_QUERY_STRING);
        let target = if query.is_empty() {
            format!("http://{}{}", self.url.host_port(), path)
        } else {
            format!("http://{}{}?{}", self.url.host_port(), path, query)
        };
        let uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(e) => {
                return RpcResponse::exception(
                    request,
                    Exception::bad_request(format!("bad request target: {e}")),
                    elapsed_ms(start),
                );
            }
        };

        let mut builder = Request::builder().method(method).uri(uri);
        for (key, value) in request.attachments.iter() {
            if !is_forwardable_attachment(key) {
                continue;
            }
            if let (Ok(name), Ok(val)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                builder = builder.header(name, val);
            }
        }

        let body = request
            .arguments
            .values()
            .first()
            .and_then(Value::as_bytes)
            .unwrap_or(&[]);
        let mut http_request = match builder.body(Full::new(Bytes::copy_from_slice(body))) {
            Ok(r) => r,
            Err(e) => {
                return RpcResponse::exception(
                    request,
                    Exception::bad_request(e.to_string()),
                    elapsed_ms(start),
                );
            }
        };

        let host = request.attachment(attachment::HTTP_HOST);
        if !host.is_empty() {
            if let Ok(v) = HeaderValue::from_str(host) {
                http_request.headers_mut().insert(HOST, v);
            }
        }
        // Fill Host from the configured domain when the request carries none.
        if !http_request.headers().contains_key(HOST) && !self.domain.is_empty() {
            if let Ok(v) = HeaderValue::from_str(&self.domain) {
                http_request.headers_mut().insert(HOST, v);
            }
        }
        apply_forwarded_for(&mut http_request, forwarded_for);

        let (parts, body) = match self.execute(http_request).await {
            Ok(r) => r,
            Err(e) => return RpcResponse::exception(request, e, elapsed_ms(start)),
        };

        let mut response = RpcResponse::for_request(request);
        response.set_attachment(attachment::HTTP_STATUS, parts.status.as_u16().to_string());
        for (name, value) in parts.headers.iter() {
            if let Ok(value) = value.to_str() {
                response.set_attachment(name.as_str(), value);
            }
        }
        response.context.body_size = body.len();
        response.value = meshgate_core::Payload::Decoded(vec![Value::Bytes(body.to_vec())]);
        response
    }

    /// Sends the request through the pooled client with the per-request
    /// timeout, collecting the body into owned bytes.
    async fn execute(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<(http::response::Parts, Bytes), Exception> {
        let response = match tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(Exception::unavailable(e.to_string())),
            Err(_) => return Err(Exception::unavailable("request timeout")),
        };
        let (parts, body) = response.into_parts();
        let body = match tokio::time::timeout(self.request_timeout, body.collect()).await {
            Ok(Ok(collected)) => collected.to_bytes(),
            Ok(Err(e)) => return Err(Exception::unavailable(e.to_string())),
            Err(_) => return Err(Exception::unavailable("request timeout")),
        };
        Ok((parts, body))
    }
}

struct HealthCheck {
    url: String,
    interval: Duration,
    timeout: Duration,
    alive_status: u16,
    retry: u64,
}

/// Probes the check URL every interval until the endpoint is destroyed.
/// Within one tick only erroring attempts are retried; any reachable
/// answer settles the tick.
async fn check_loop(endpoint: Arc<HttpEndpoint>, check: HealthCheck) {
    let client: Client<HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let check_uri: Uri = match check.url.parse() {
        Ok(uri) => uri,
        Err(e) => {
            warn!(url = %check.url, error = %e, "invalid health check url, check disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            () = endpoint.cancel.cancelled() => return,
            () = tokio::time::sleep(check.interval) => {}
        }

        let mut alive = false;
        for _ in 0..check.retry {
            let Ok(request) = Request::builder()
                .method(Method::GET)
                .uri(check_uri.clone())
                .body(Full::new(Bytes::new()))
            else {
                break;
            };
            match tokio::time::timeout(check.timeout, client.request(request)).await {
                Ok(Ok(response)) => {
                    alive = response.status().as_u16() == check.alive_status;
                    let _ = response.into_body().collect().await;
                    break;
                }
                _ => continue,
            }
        }

        let was_available = endpoint.is_available();
        if was_available && !alive {
            info!(endpoint = %endpoint.url.identity(), "detect alive false, disable endpoint");
        } else if !was_available && alive {
            info!(endpoint = %endpoint.url.identity(), "detect alive true, enable endpoint");
        }
        endpoint.set_available(alive);
    }
}

fn apply_forwarded_for(request: &mut Request<Full<Bytes>>, forwarded_for: Option<&str>) {
    if let Some(chain) = forwarded_for {
        if let Ok(value) = HeaderValue::from_str(chain) {
            request.headers_mut().insert(X_FORWARDED_FOR, value);
        }
    }
}

/// Attachments that translate into outbound headers: everything except
/// the bridge's own control keys and internal `M_`-prefixed metadata.
fn is_forwardable_attachment(key: &str) -> bool {
    if key.starts_with("M_") {
        return false;
    }
    !matches!(
        key,
        attachment::HTTP_PATH
            | attachment::HTTP_QUERY_STRING
            | attachment::HTTP_METHOD
            | attachment::HTTP_PROXY
            | attachment::HTTP_HOST
            | attachment::HTTP_STATUS
    )
}

fn elapsed_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwardable_attachment_filter() {
        assert!(is_forwardable_attachment("X-Custom"));
        assert!(is_forwardable_attachment("Accept"));
        assert!(!is_forwardable_attachment("M_s"));
        assert!(!is_forwardable_attachment(attachment::HTTP_PROXY));
        assert!(!is_forwardable_attachment(attachment::HTTP_PATH));
    }

    #[test]
    fn endpoint_without_check_starts_available() {
        let url = ServiceUrl::new("http", "localhost", 18080);
        let endpoint = HttpEndpoint::new(url);
        assert!(endpoint.is_available());
    }

    #[test]
    fn forwarded_for_chains_caller_ip() {
        let mut url = ServiceUrl::new("http", "localhost", 18080);
        url.put_param(NODE_TYPE_KEY, "service");
        let endpoint = HttpEndpoint::new(url);

        let mut request = RpcRequest::new("svc", "/p");
        request.set_attachment(attachment::REMOTE_IP, "10.0.0.3");
        request.set_attachment("x-forwarded-for", "10.0.0.1,10.0.0.2");
        assert_eq!(
            endpoint.forwarded_for_value(&request).as_deref(),
            Some("10.0.0.1,10.0.0.2,10.0.0.3")
        );

        let mut bare = RpcRequest::new("svc", "/p");
        bare.set_attachment(attachment::REMOTE_IP, "10.0.0.3");
        assert_eq!(
            endpoint.forwarded_for_value(&bare).as_deref(),
            Some("10.0.0.3")
        );
    }
}
