//! Optional sub-servers applied from configuration: Loki log shipping, the
//! syslog socket, BGP, DNS and the seccomp listener.
//!
//! Bodies are external; the core owns their lifecycle only. Each carries a
//! context descended from the daemon shutdown token so one cancellation
//! tears everything down.

use crate::cancel::Canceller;
use crate::config::LokiConfig;
use log::{debug, info, warn};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

/// Log-shipping client; started only when URL, level and types are all set.
pub struct LokiClient {
    pub config: LokiConfig,
    cancel: Canceller,
}

impl LokiClient {
    pub fn start(config: LokiConfig, shutdown: &Canceller) -> Self {
        info!("event=loki_start url={} level={}", config.url, config.log_level);
        let cancel = shutdown.clone();
        Self { config, cancel }
    }

    pub fn stop(&self) {
        debug!("event=loki_stop url={}", self.config.url);
        let _ = &self.cancel;
    }
}

/// Listener for the local syslog socket.
pub struct SyslogListener {
    cancel: Canceller,
}

impl SyslogListener {
    pub fn start() -> Self {
        debug!("event=syslog_socket_start");
        Self {
            cancel: Canceller::new(),
        }
    }

    pub fn stop(&self) {
        debug!("event=syslog_socket_stop");
        self.cancel.cancel();
    }
}

/// BGP speaker; needs a listen address, an ASN and a router id.
pub struct BgpServer {
    pub address: String,
    pub asn: u32,
    pub router_id: String,
}

impl BgpServer {
    pub fn start(address: String, asn: u32, router_id: String) -> Self {
        info!("event=bgp_start address={address} asn={asn} router_id={router_id}");
        Self {
            address,
            asn,
            router_id,
        }
    }

    pub fn stop(&self) {
        debug!("event=bgp_stop address={}", self.address);
    }
}

/// Authoritative DNS responder for managed zones.
pub struct DnsServer {
    pub address: String,
}

impl DnsServer {
    pub fn start(address: String) -> Self {
        info!("event=dns_start address={address}");
        Self { address }
    }

    pub fn stop(&self) {
        debug!("event=dns_stop address={}", self.address);
    }
}

/// Seccomp notify listener; only the socket lifecycle lives in the core.
pub struct SeccompServer {
    path: PathBuf,
    _listener: UnixListener,
}

impl SeccompServer {
    pub fn start(path: &Path) -> std::io::Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        info!("event=seccomp_start path={}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            _listener: listener,
        })
    }

    pub fn stop(&self) -> std::io::Result<()> {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("event=seccomp_stop_failed error={err}");
                return Err(err);
            }
        }
        debug!("event=seccomp_stop path={}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seccomp_socket_lifecycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("seccomp.socket");
        let server = SeccompServer::start(&path).unwrap();
        assert!(path.exists());
        server.stop().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn seccomp_start_replaces_stale_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("seccomp.socket");
        {
            let first = SeccompServer::start(&path).unwrap();
            drop(first);
        }
        let second = SeccompServer::start(&path).unwrap();
        second.stop().unwrap();
    }
}
