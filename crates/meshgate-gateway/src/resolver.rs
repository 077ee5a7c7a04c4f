//! A-record resolver backed by the system resolv.conf.
//!
//! The nameserver list is re-read when the file's modification time
//! changes, at most once per check window, and the refresh is gated by a
//! single-slot semaphore: whoever fails the non-blocking acquire simply
//! uses the current configuration. Readers never wait on a refresh.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;

use crate::error::GatewayError;

/// Default resolver configuration file on Unix-like systems.
pub const DEFAULT_RESOLVE_CONF: &str = "/etc/resolv.conf";

const REFRESH_CHECK_WINDOW: Duration = Duration::from_secs(5);
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct RefreshState {
    last_checked: Instant,
    modify_time: Option<SystemTime>,
}

/// Resolver with an atomically-refreshed nameserver list.
#[derive(Debug)]
pub struct DnsResolver {
    path: PathBuf,
    nameservers: RwLock<Vec<String>>,
    refresh: Mutex<RefreshState>,
    refresh_gate: Semaphore,
}

impl DnsResolver {
    /// Opens the resolver over `path`, defaulting to `/etc/resolv.conf`.
    pub fn new(path: Option<&Path>) -> Result<Self, GatewayError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RESOLVE_CONF));
        let modify_time = fs::metadata(&path)?.modified().ok();
        let nameservers = load_nameservers(&path)?;
        Ok(Self {
            path,
            nameservers: RwLock::new(nameservers),
            refresh: Mutex::new(RefreshState {
                last_checked: Instant::now(),
                modify_time,
            }),
            refresh_gate: Semaphore::new(1),
        })
    }

    /// Resolves `host` to IP addresses.
    pub async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, GatewayError> {
        let addrs = self.lookup_host(host).await?;
        Ok(addrs.iter().filter_map(|a| a.parse().ok()).collect())
    }

    /// Resolves `host` to dotted-quad address strings. IP literals pass
    /// through unchanged.
    pub async fn lookup_host(&self, host: &str) -> Result<Vec<String>, GatewayError> {
        if host.is_empty() {
            return Err(GatewayError::NoSuchHost(host.to_owned()));
        }
        if host.parse::<IpAddr>().is_ok() {
            return Ok(vec![host.to_owned()]);
        }
        // Validate as a DNS name, querying with the trailing root dot.
        let name = Name::from_utf8(format!("{host}."))
            .map_err(|_| GatewayError::NoSuchHost(host.to_owned()))?;

        self.try_update_config();

        let server = {
            let servers = self.nameservers.read().expect("nameserver lock poisoned");
            if servers.is_empty() {
                return Err(GatewayError::Dns("no nameservers configured".into()));
            }
            let pick = rand::thread_rng().gen_range(0..servers.len());
            ensure_port_53(&servers[pick])
        };

        query_a(&server, name).await
    }

    /// Refreshes the nameserver list when the resolver file changed.
    /// Non-blocking: if another refresh is in flight, the current
    /// configuration is used as-is.
    fn try_update_config(&self) {
        let Ok(_permit) = self.refresh_gate.try_acquire() else {
            return;
        };
        let mut state = self.refresh.lock().expect("refresh lock poisoned");
        if state.last_checked.elapsed() < REFRESH_CHECK_WINDOW {
            return;
        }
        state.last_checked = Instant::now();

        let mtime = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        if mtime == state.modify_time {
            return;
        }
        if let Ok(servers) = load_nameservers(&self.path) {
            *self.nameservers.write().expect("nameserver lock poisoned") = servers;
            state.modify_time = mtime;
        }
    }
}

fn load_nameservers(path: &Path) -> Result<Vec<String>, GatewayError> {
    let data = fs::read(path)?;
    let config = resolv_conf::Config::parse(&data)
        .map_err(|e| GatewayError::Config(format!("parse {}: {e}", path.display())))?;
    Ok(config.nameservers.iter().map(ToString::to_string).collect())
}

/// Appends UDP port 53 when the server has no port. Bracketed and bare
/// IPv6 addresses are handled.
fn ensure_port_53(server: &str) -> String {
    if !server.contains(':') {
        return format!("{server}:53");
    }
    if server.starts_with('[') && server.ends_with(']') {
        return format!("{server}:53");
    }
    if server.parse::<SocketAddr>().is_ok() {
        return server.to_owned();
    }
    if server.parse::<std::net::Ipv6Addr>().is_ok() {
        return format!("[{server}]:53");
    }
    server.to_owned()
}

/// Issues a Type-A query against `server` and collects every A answer.
async fn query_a(server: &str, name: Name) -> Result<Vec<String>, GatewayError> {
    let addr: SocketAddr = server
        .parse()
        .map_err(|_| GatewayError::Dns(format!("bad nameserver address {server}")))?;

    let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;

    let mut query = Message::new();
    query
        .set_id(rand::thread_rng().gen())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::A));
    let bytes = query
        .to_vec()
        .map_err(|e| GatewayError::Dns(e.to_string()))?;

    tokio::time::timeout(QUERY_TIMEOUT, socket.send(&bytes))
        .await
        .map_err(|_| GatewayError::Timeout)??;

    let mut buf = [0u8; 4096];
    let len = tokio::time::timeout(QUERY_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| GatewayError::Timeout)??;

    let response =
        Message::from_vec(&buf[..len]).map_err(|e| GatewayError::Dns(e.to_string()))?;

    let mut addrs = Vec::new();
    for answer in response.answers() {
        if let Some(RData::A(a)) = answer.data() {
            addrs.push(a.to_string());
        }
    }
    Ok(addrs)
}
