#![allow(dead_code)]

use burrow::api::handlers;
use burrow::api::request::{RemoteAddr, RequestInfo};
use burrow::cluster::gateway::EngineLogLevel;
use burrow::cluster::Gateway;
use burrow::config::DaemonConfig;
use burrow::daemon::Daemon;
use burrow::db::{ClusterDb, NodeDb};
use burrow::os::Os;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;

/// Daemon wired with a router and local store, setup gate still closed.
/// Enough for driving the admission pipeline without any real sockets.
pub fn bare_daemon(dir: &TempDir) -> Arc<Daemon> {
    let daemon = Daemon::new(DaemonConfig::default(), Os::new(dir.path(), true));
    let node_db = Arc::new(
        NodeDb::open(&dir.path().join("database"), |_| Ok(())).expect("local store opens"),
    );
    daemon.db.set_node(node_db);
    daemon.set_router(Arc::new(handlers::router()));
    daemon
}

/// Adds a gateway and an open cluster store to a bare daemon.
pub fn clustered_daemon(dir: &TempDir, member: &str, address: Option<&str>) -> Arc<Daemon> {
    let daemon = bare_daemon(dir);
    let node_db = daemon.db.node().expect("node store");
    let gateway = Arc::new(Gateway::new(
        daemon.shutdown.clone(),
        node_db,
        1.0,
        EngineLogLevel::Error,
    ));
    gateway.set_local_address(address.map(str::to_string));
    let cluster = Arc::new(
        ClusterDb::open(
            &dir.path().join("database"),
            member,
            address,
            gateway.kill_handle(),
        )
        .expect("cluster store opens"),
    );
    daemon.db.set_cluster(Some(cluster.clone()));
    gateway.set_cluster(Some(cluster));
    daemon.set_gateway(gateway);
    daemon
}

fn tcp_addr() -> SocketAddr {
    "203.0.113.9:45104".parse().unwrap()
}

pub struct RequestBuilder {
    request: RequestInfo,
}

impl RequestBuilder {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            request: RequestInfo {
                method: method.to_string(),
                path: path.to_string(),
                query: None,
                headers: Vec::new(),
                body: Vec::new(),
                remote: RemoteAddr::Tcp(tcp_addr()),
                peer_certs: Vec::new(),
                tls: true,
                ca_verified: false,
            },
        }
    }

    pub fn over_unix(mut self) -> Self {
        self.request.remote = RemoteAddr::Unix {
            uid: 0,
            gid: 0,
            pid: 1,
        };
        self.request.tls = false;
        self
    }

    pub fn over_guest(mut self) -> Self {
        self.request.remote = RemoteAddr::Guest;
        self.request.tls = false;
        self
    }

    pub fn cleartext(mut self) -> Self {
        self.request.tls = false;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.request.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn peer_cert(mut self, der: Vec<u8>) -> Self {
        self.request.peer_certs.push(der);
        self
    }

    /// Marks the chain as having verified against the installed CA bundle
    /// during the handshake.
    pub fn ca_verified(mut self) -> Self {
        self.request.ca_verified = true;
        self
    }

    pub fn json_body(mut self, value: &serde_json::Value) -> Self {
        self.request.body = serde_json::to_vec(value).unwrap();
        self.request
            .headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
        self
    }

    pub fn build(self) -> RequestInfo {
        self.request
    }
}

/// A rendered response, parsed back for assertions.
pub struct TestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
    pub raw: String,
}

pub fn dispatch(daemon: &Arc<Daemon>, request: &RequestInfo) -> TestResponse {
    let mut buffer = Vec::new();
    daemon.dispatch(request, &mut buffer);
    parse_response(&buffer)
}

pub fn parse_response(raw: &[u8]) -> TestResponse {
    let raw = String::from_utf8_lossy(raw).to_string();
    let status = raw
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code present");
    let header_end = raw.find("\r\n\r\n").expect("header terminator");
    let headers = raw[..header_end]
        .lines()
        .skip(1)
        .filter_map(|line| {
            line.split_once(": ")
                .map(|(name, value)| (name.to_string(), value.to_string()))
        })
        .collect();
    let body_raw = &raw[header_end + 4..];
    let body = serde_json::from_str(body_raw).unwrap_or(serde_json::Value::Null);
    TestResponse {
        status,
        headers,
        body,
        raw,
    }
}

impl TestResponse {
    pub fn error_message(&self) -> String {
        self.body["error"].as_str().unwrap_or_default().to_string()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}
