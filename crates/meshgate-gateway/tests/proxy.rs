//! Integration tests for the inbound proxy server: loop prevention,
//! CONNECT tunnelling, RPC-translated forwarding and raw forwarding.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use meshgate_core::{
    attachment, Exception, HttpCluster, HttpClusterGetter, Payload, RpcRequest, RpcResponse,
    ServiceUrl,
};
use meshgate_gateway::HttpProxyServer;
use meshgate_proto::{Dialect, MeshCodec, Value};

/// Cluster fixture serving `/svc` paths for one domain.
struct FakeCluster {
    fail: bool,
    seen: Mutex<Vec<RpcRequest>>,
}

#[async_trait]
impl HttpCluster for FakeCluster {
    fn can_serve(&self, path: &str) -> Option<String> {
        path.starts_with("/svc").then(|| "svc.service".to_owned())
    }

    async fn call(&self, request: RpcRequest) -> RpcResponse {
        self.seen.lock().unwrap().push(request.clone());
        if self.fail {
            return RpcResponse::exception(&request, Exception::unavailable("cluster down"), 1);
        }
        // Reply as wire bytes, the way a real cluster transport would.
        let codec = MeshCodec::new(Dialect::Message);
        let head = b"HTTP/1.1 200 OK\r\nX-Via: rpc\r\nContent-Length: 8\r\n\r\n".to_vec();
        let body = b"rpc-body".to_vec();
        let encoded = codec
            .serialize_multi(&[Value::Bytes(head), Value::Bytes(body)])
            .unwrap();
        let mut response = RpcResponse::for_request(&request);
        response.value = Payload::Encoded(encoded.into());
        response
    }
}

struct StaticGetter {
    domain: String,
    cluster: Arc<FakeCluster>,
}

impl HttpClusterGetter for StaticGetter {
    fn http_cluster(&self, host: &str) -> Option<Arc<dyn HttpCluster>> {
        (host == self.domain).then(|| self.cluster.clone() as Arc<dyn HttpCluster>)
    }
}

struct NoClusters;

impl HttpClusterGetter for NoClusters {
    fn http_cluster(&self, _host: &str) -> Option<Arc<dyn HttpCluster>> {
        None
    }
}

async fn spawn_proxy(getter: Arc<dyn HttpClusterGetter>) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        let url = ServiceUrl::new("http", "127.0.0.1", addr.port());
        let server = HttpProxyServer::new(url, getter);
        server
            .serve_with_listener(listener, server_cancel)
            .await
            .unwrap();
    });
    (addr, cancel)
}

/// Echo origin that answers any request with its path in the body.
async fn spawn_origin() -> SocketAddr {
    async fn echo(uri: axum::http::Uri) -> String {
        uri.to_string()
    }
    let app = Router::new().fallback(echo);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Sends raw request bytes and reads the full response.
async fn raw_request(addr: SocketAddr, raw: String) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn self_addressed_request_is_rejected() {
    let (proxy, cancel) = spawn_proxy(Arc::new(NoClusters)).await;

    let response = raw_request(
        proxy,
        format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n", proxy.port()),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");

    let response = raw_request(
        proxy,
        format!("GET / HTTP/1.1\r\nHost: localhost:{}\r\nConnection: close\r\n\r\n", proxy.port()),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");

    cancel.cancel();
}

#[tokio::test]
async fn transparent_forwarding_reaches_origin() {
    let origin = spawn_origin().await;
    let (proxy, cancel) = spawn_proxy(Arc::new(NoClusters)).await;

    let response = raw_request(
        proxy,
        format!(
            "GET /echoed?x=1 HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
            origin.port()
        ),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("/echoed?x=1"), "{response}");

    cancel.cancel();
}

#[tokio::test]
async fn unreachable_origin_maps_to_bad_gateway() {
    // Bind then drop a listener so the origin port refuses connections.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();
    drop(listener);

    let (proxy, cancel) = spawn_proxy(Arc::new(NoClusters)).await;
    let response = raw_request(
        proxy,
        format!(
            "GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
            origin.port()
        ),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 502"), "{response}");

    cancel.cancel();
}

#[tokio::test]
async fn rpc_translated_forwarding_round_trips() {
    let cluster = Arc::new(FakeCluster {
        fail: false,
        seen: Mutex::new(Vec::new()),
    });
    let getter = Arc::new(StaticGetter {
        domain: "svc.test".to_owned(),
        cluster: cluster.clone(),
    });
    let (proxy, cancel) = spawn_proxy(getter).await;

    let response = raw_request(
        proxy,
        "GET /svc/hello?q=1 HTTP/1.1\r\nHost: svc.test\r\nX-Token: t1\r\nConnection: close\r\n\r\n"
            .to_owned(),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("X-Via: rpc") || response.contains("x-via: rpc"), "{response}");
    assert!(response.ends_with("rpc-body"), "{response}");

    // The cluster saw a transparent-mode request carrying the raw head.
    let seen = cluster.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let rpc_request = &seen[0];
    assert_eq!(rpc_request.service, "svc.service");
    assert_eq!(rpc_request.method, "/svc/hello");
    assert_eq!(rpc_request.attachment(attachment::HTTP_PROXY), "true");
    let head = rpc_request.arguments.values()[0].as_bytes().unwrap();
    let head_text = String::from_utf8_lossy(head);
    assert!(head_text.starts_with("GET /svc/hello?q=1 HTTP/1.1\r\n"), "{head_text}");
    assert!(head_text.to_lowercase().contains("x-token: t1"), "{head_text}");

    cancel.cancel();
}

#[tokio::test]
async fn rpc_exception_maps_to_bad_gateway() {
    let cluster = Arc::new(FakeCluster {
        fail: true,
        seen: Mutex::new(Vec::new()),
    });
    let getter = Arc::new(StaticGetter {
        domain: "svc.test".to_owned(),
        cluster,
    });
    let (proxy, cancel) = spawn_proxy(getter).await;

    let response = raw_request(
        proxy,
        "GET /svc/hello HTTP/1.1\r\nHost: svc.test\r\nConnection: close\r\n\r\n".to_owned(),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 502"), "{response}");
    assert!(response.contains("err_msg: cluster down"), "{response}");

    cancel.cancel();
}

#[tokio::test]
async fn connect_tunnel_shuttles_bytes_both_ways() {
    // Plain TCP echo origin.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    let (proxy, cancel) = spawn_proxy(Arc::new(NoClusters)).await;
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(
            format!(
                "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
                port = origin.port()
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    // Read the response head.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head).into_owned();
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    // Bytes written into the tunnel come back from the echo origin.
    stream.write_all(b"ping through tunnel").await.unwrap();
    let mut echoed = [0u8; 19];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping through tunnel");

    // Closing our side tears the whole tunnel down.
    stream.shutdown().await.unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn connect_to_unreachable_origin_is_bad_gateway() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();
    drop(listener);

    let (proxy, cancel) = spawn_proxy(Arc::new(NoClusters)).await;
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(
            format!(
                "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
                port = origin.port()
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let mut buf = vec![0u8; 64];
    let n = stream.read(&mut buf).await.unwrap();
    let head = String::from_utf8_lossy(&buf[..n]).into_owned();
    assert!(head.starts_with("HTTP/1.1 502"), "{head}");

    cancel.cancel();
}
