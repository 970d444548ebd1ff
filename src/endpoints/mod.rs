//! Listening sockets: local unix, guest-api unix, HTTPS REST, debug,
//! metrics, storage-buckets and vsock.
//!
//! All TLS listeners share one hot-swappable server config so a certificate
//! renewal takes effect without rebinding. The unix socket doubles as the
//! single-daemon guard: if something already answers on it, startup refuses
//! to continue.

pub mod client;
pub mod listener;
pub mod tls;

use crate::api::request::{read_request, HttpError, RemoteAddr};
use crate::daemon::Daemon;
use crate::security::certs::CertInfo;
use crate::timeouts::{LISTENER_SHUTDOWN_GRACE, REQUEST_STREAM_TIMEOUT};
use listener::ListenerHandle;
use log::{info, warn};
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use parking_lot::RwLock;
use rustls::{ServerConfig, ServerConnection, Stream};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("another daemon is already running on {0}")]
    AlreadyRunning(String),
    #[error("invalid listen address {0}")]
    InvalidAddress(String),
    #[error("no client identity available for cluster dialing")]
    MissingClientIdentity,
    #[error("failed to parse HTTP response")]
    ResponseParse,
    #[error("invalid CA bundle at {0}")]
    InvalidCaBundle(String),
    #[error("service lock poisoned ({context})")]
    Poisoned { context: &'static str },
    #[error("{context} listener shutdown timed out")]
    ShutdownTimeout { context: &'static str },
    #[error("unknown group {0}")]
    UnknownGroup(String),
}

/// Static wiring for the listener set.
#[derive(Debug, Clone, Default)]
pub struct EndpointsConfig {
    pub unix_socket: PathBuf,
    pub unix_group: Option<String>,
    pub guest_socket: PathBuf,
    pub network_address: Option<String>,
    pub debug_address: Option<String>,
    /// Operator-installed CA roots backing the trust-CA switch.
    pub ca_bundle: Option<Arc<tls::TrustedCaBundle>>,
    pub vsock_support: bool,
}

pub struct Endpoints {
    handles: Vec<ListenerHandle>,
    tls_holder: Arc<RwLock<Arc<ServerConfig>>>,
    network_cert: RwLock<Arc<CertInfo>>,
    ca_bundle: Option<Arc<tls::TrustedCaBundle>>,
    unix_socket: PathBuf,
    guest_socket: PathBuf,
    socket_activated: bool,
}

/// Refuses to start when an existing daemon answers on the unix socket;
/// removes a stale socket file otherwise.
pub fn check_already_running(path: &PathBuf) -> Result<(), NetError> {
    if path.exists() {
        if UnixStream::connect(path).is_ok() {
            return Err(NetError::AlreadyRunning(path.display().to_string()));
        }
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

fn chown_to_group(path: &PathBuf, group: &str) -> Result<(), NetError> {
    let resolved = nix::unistd::Group::from_name(group)
        .map_err(|_| NetError::UnknownGroup(group.to_string()))?
        .ok_or_else(|| NetError::UnknownGroup(group.to_string()))?;
    nix::unistd::chown(path, None, Some(resolved.gid))
        .map_err(|err| NetError::Io(std::io::Error::other(err)))?;
    Ok(())
}

fn handle_tls_connection(
    daemon: &Arc<Daemon>,
    tls_holder: &Arc<RwLock<Arc<ServerConfig>>>,
    ca_bundle: Option<&Arc<tls::TrustedCaBundle>>,
    mut stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), NetError> {
    stream.set_read_timeout(Some(REQUEST_STREAM_TIMEOUT))?;
    stream.set_write_timeout(Some(REQUEST_STREAM_TIMEOUT))?;
    let config = tls_holder.read().clone();
    let mut conn = ServerConnection::new(config)?;
    while conn.is_handshaking() {
        conn.complete_io(&mut stream)?;
    }
    let peer_certs: Vec<Vec<u8>> = conn
        .peer_certificates()
        .map(|chain| chain.iter().map(|cert| cert.0.clone()).collect())
        .unwrap_or_default();
    // Stamp the request when the chain verifies against the installed CA
    // roots; admission only honours this under the trust-CA switch.
    let ca_verified = !peer_certs.is_empty()
        && ca_bundle
            .map(|bundle| bundle.verifies(&peer_certs))
            .unwrap_or(false);
    let mut tls_stream = Stream::new(&mut conn, &mut stream);
    let request = read_request(
        &mut tls_stream,
        RemoteAddr::Tcp(addr),
        peer_certs,
        true,
        ca_verified,
    )?;
    daemon.dispatch(&request, &mut tls_stream);
    Ok(())
}

fn handle_unix_connection(
    daemon: &Arc<Daemon>,
    mut stream: UnixStream,
    guest: bool,
) -> Result<(), NetError> {
    stream.set_read_timeout(Some(REQUEST_STREAM_TIMEOUT))?;
    stream.set_write_timeout(Some(REQUEST_STREAM_TIMEOUT))?;
    let remote = if guest {
        RemoteAddr::Guest
    } else {
        let creds = getsockopt(&stream, PeerCredentials)
            .map_err(|err| NetError::Io(std::io::Error::other(err)))?;
        RemoteAddr::Unix {
            uid: creds.uid(),
            gid: creds.gid(),
            pid: creds.pid(),
        }
    };
    let request = read_request(&mut &stream, remote, Vec::new(), false, false)?;
    daemon.dispatch(&request, &mut stream);
    Ok(())
}

fn bind_address(address: &str) -> Result<TcpListener, NetError> {
    TcpListener::bind(address).map_err(|_| NetError::InvalidAddress(address.to_string()))
}

impl Endpoints {
    /// Binds the primary listener set: local unix socket, guest-api socket,
    /// the HTTPS REST listener when a network address is configured, and the
    /// cleartext debug listener.
    pub fn up(
        daemon: &Arc<Daemon>,
        config: EndpointsConfig,
        network_cert: Arc<CertInfo>,
    ) -> Result<Self, NetError> {
        let tls_holder = Arc::new(RwLock::new(tls::server_config(&network_cert)?));
        let mut handles = Vec::new();
        let socket_activated = std::env::var("LISTEN_PID").is_ok();

        // Local unix socket.
        check_already_running(&config.unix_socket)?;
        let unix_listener = UnixListener::bind(&config.unix_socket)?;
        if let Some(group) = &config.unix_group {
            chown_to_group(&config.unix_socket, group)?;
        }
        let unix_daemon = daemon.clone();
        handles.push(listener::spawn_unix("unix", unix_listener, move |stream| {
            handle_unix_connection(&unix_daemon, stream, false)
        })?);
        info!(
            "event=listener_up kind=unix path={}",
            config.unix_socket.display()
        );

        // Guest API socket.
        if let Some(parent) = config.guest_socket.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(&config.guest_socket);
        let guest_listener = UnixListener::bind(&config.guest_socket)?;
        let guest_daemon = daemon.clone();
        handles.push(listener::spawn_unix(
            "guestapi",
            guest_listener,
            move |stream| handle_unix_connection(&guest_daemon, stream, true),
        )?);

        // HTTPS REST listener.
        if let Some(address) = &config.network_address {
            let listener = bind_address(address)?;
            let rest_daemon = daemon.clone();
            let rest_tls = tls_holder.clone();
            let rest_ca = config.ca_bundle.clone();
            handles.push(listener::spawn_tcp("https", listener, move |stream, addr| {
                handle_tls_connection(&rest_daemon, &rest_tls, rest_ca.as_ref(), stream, addr)
            })?);
            info!("event=listener_up kind=https address={address}");
        }

        // Debug listener: cleartext, local status only.
        if let Some(address) = &config.debug_address {
            let listener = bind_address(address)?;
            let debug_daemon = daemon.clone();
            handles.push(listener::spawn_tcp("debug", listener, move |mut stream, _| {
                let status = debug_daemon.debug_status();
                let response = crate::api::response::Response::sync(status);
                let _ = response.render(&mut stream, &[]);
                Ok(())
            })?);
            info!("event=listener_up kind=debug address={address}");
        }

        Ok(Self {
            handles,
            tls_holder,
            network_cert: RwLock::new(network_cert),
            ca_bundle: config.ca_bundle,
            unix_socket: config.unix_socket,
            guest_socket: config.guest_socket,
            socket_activated,
        })
    }

    fn up_tls_listener(
        &mut self,
        daemon: &Arc<Daemon>,
        name: &'static str,
        address: &str,
    ) -> Result<(), NetError> {
        let listener = bind_address(address)?;
        let tls = self.tls_holder.clone();
        let ca = self.ca_bundle.clone();
        let daemon = daemon.clone();
        self.handles
            .push(listener::spawn_tcp(name, listener, move |stream, addr| {
                handle_tls_connection(&daemon, &tls, ca.as_ref(), stream, addr)
            })?);
        info!("event=listener_up kind={name} address={address}");
        Ok(())
    }

    /// Tertiary listeners; may bind managed-network addresses, so they come
    /// up after networks do.
    pub fn up_metrics(&mut self, daemon: &Arc<Daemon>, address: &str) -> Result<(), NetError> {
        self.up_tls_listener(daemon, "metrics", address)
    }

    pub fn up_storage_buckets(
        &mut self,
        daemon: &Arc<Daemon>,
        address: &str,
    ) -> Result<(), NetError> {
        self.up_tls_listener(daemon, "storage_buckets", address)
    }

    pub fn up_vsock(&mut self, daemon: &Arc<Daemon>, address: &str) -> Result<(), NetError> {
        self.up_tls_listener(daemon, "vsock", address)
    }

    pub fn network_cert(&self) -> Arc<CertInfo> {
        self.network_cert.read().clone()
    }

    /// Swaps the serving certificate; existing connections finish on the old
    /// one, new handshakes pick up the new one.
    pub fn network_update_cert(&self, cert: Arc<CertInfo>) -> Result<(), NetError> {
        let config = tls::server_config(&cert)?;
        *self.tls_holder.write() = config;
        *self.network_cert.write() = cert;
        Ok(())
    }

    /// Tears every listener down, unlinking socket files unless they were
    /// inherited through socket activation.
    pub fn down(&mut self) -> Result<(), NetError> {
        let mut first_error = None;
        for handle in self.handles.iter_mut() {
            if let Err(err) = handle.try_shutdown(LISTENER_SHUTDOWN_GRACE) {
                warn!("event=listener_down_failed name={} error={err}", handle.name());
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        self.handles.clear();
        if !self.socket_activated {
            let _ = std::fs::remove_file(&self.unix_socket);
        }
        let _ = std::fs::remove_file(&self.guest_socket);
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
