//! Daemon state: one instance per process.
//!
//! The daemon is constructed cold, populated by `init`, serves until `stop`,
//! and is then done. Two latches gate the outside world (setup complete,
//! fully ready); one cancellation token tears everything down.

mod init;
mod mounts;
mod stop;

use crate::api::request::RequestInfo;
use crate::api::response::Response;
use crate::api::router::Router;
use crate::cancel::{Canceller, Latch};
use crate::cluster::heartbeat::ApiHeartbeat;
use crate::cluster::Gateway;
use crate::config::{DaemonConfig, GlobalConfig, LocalConfig, LokiConfig, OidcConfig};
use crate::db::{Db, DbError};
use crate::endpoints::{Endpoints, NetError};
use crate::instances::{InstanceError, Instances, NullInstances};
use crate::metrics::MetricsRegistry;
use crate::network::{NetworkError, Networks, NullNetworks};
use crate::operations::Operations;
use crate::os::{Os, ProbeWarning};
use crate::security::cache::CertCache;
use crate::security::certs::{CertificateError, CertInfo};
use crate::security::oidc;
use crate::storage::{NullPools, Pools, StorageError};
use crate::subsys::{BgpServer, DnsServer, LokiClient, SeccompServer, SyslogListener};
use crate::tasks;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde_json::json;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::SystemTime;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Cluster(#[from] crate::cluster::ClusterError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("os error: {0}")]
    Os(String),
    #[error("cluster database bring-up timed out")]
    ClusterDbTimeout,
    #[error("{first} (and {extra} more errors)")]
    Aggregate { first: String, extra: usize },
    #[error("{0}")]
    Other(String),
}

/// Signals the daemon reacts to when stopping. Interrupt aborts a failed
/// init, Terminate drains and unmounts daemon storage, PowerFailure is the
/// full teardown including instances, networks and pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    PowerFailure,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::PowerFailure => write!(f, "SIGPWR"),
        }
    }
}

struct ConfigState {
    global: GlobalConfig,
    local: LocalConfig,
    server_name: String,
}

#[derive(Default)]
struct SubServers {
    loki: Option<LokiClient>,
    syslog: Option<SyslogListener>,
    bgp: Option<BgpServer>,
    dns: Option<DnsServer>,
    seccomp: Option<SeccompServer>,
}

/// Immutable snapshot of daemon state handed to collaborators and tasks.
pub struct State {
    pub shutdown: Canceller,
    pub server_name: String,
    pub global_config: GlobalConfig,
    pub local_config: LocalConfig,
    pub start_time: Option<SystemTime>,
    pub server_cert: Option<Arc<CertInfo>>,
    pub cluster: Option<Arc<crate::db::ClusterDb>>,
}

pub struct Daemon {
    pub config: DaemonConfig,
    os: RwLock<Os>,
    debug: AtomicBool,
    start_time: RwLock<Option<SystemTime>>,

    /// Closed once core init is done; public request admission opens here.
    pub setup: Latch,
    /// Opened when everything, including background tasks, is live.
    pub ready: Latch,
    /// Sole cancellation authority for the whole process.
    pub shutdown: Canceller,
    shutdown_signal: Mutex<Option<mpsc::Sender<ShutdownSignal>>>,
    pub systemd_socket_activated: AtomicBool,

    pub client_certs: CertCache,
    server_cert: RwLock<Option<Arc<CertInfo>>>,
    network_cert: RwLock<Option<Arc<CertInfo>>>,

    config_state: Mutex<ConfigState>,
    /// Serializes joins, leaves and role changes.
    pub cluster_membership_lock: RwLock<()>,
    pub(crate) last_node_list: Mutex<Option<ApiHeartbeat>>,
    pub(crate) time_skew: Mutex<bool>,

    pub db: Db,
    gateway: RwLock<Option<Arc<Gateway>>>,
    endpoints: Mutex<Option<Endpoints>>,
    router: RwLock<Option<Arc<Router>>>,
    pub(crate) tasks: Mutex<tasks::Group>,
    pub(crate) cluster_tasks: Mutex<tasks::Group>,
    oidc: RwLock<Option<Arc<oidc::Verifier>>>,
    pub operations: Operations,
    pub metrics: Mutex<MetricsRegistry>,

    instances_driver: RwLock<Arc<dyn Instances>>,
    pools: RwLock<Arc<dyn Pools>>,
    networks: RwLock<Arc<dyn Networks>>,
    firewall: RwLock<Option<&'static str>>,
    subservers: Mutex<SubServers>,

    cluster_db_dead: AtomicBool,
    pub(crate) probe_warnings: Mutex<Vec<ProbeWarning>>,
    pub(crate) shared_mounts_setup: AtomicBool,
    authorizer: RwLock<&'static str>,
}

impl Daemon {
    pub fn new(config: DaemonConfig, os: Os) -> Arc<Self> {
        Arc::new(Self {
            config,
            os: RwLock::new(os),
            debug: AtomicBool::new(false),
            start_time: RwLock::new(None),
            setup: Latch::new(),
            ready: Latch::new(),
            shutdown: Canceller::new(),
            shutdown_signal: Mutex::new(None),
            systemd_socket_activated: AtomicBool::new(false),
            client_certs: CertCache::new(),
            server_cert: RwLock::new(None),
            network_cert: RwLock::new(None),
            config_state: Mutex::new(ConfigState {
                global: GlobalConfig::default(),
                local: LocalConfig::default(),
                server_name: String::new(),
            }),
            cluster_membership_lock: RwLock::new(()),
            last_node_list: Mutex::new(None),
            time_skew: Mutex::new(false),
            db: Db::new(),
            gateway: RwLock::new(None),
            endpoints: Mutex::new(None),
            router: RwLock::new(None),
            tasks: Mutex::new(tasks::Group::new()),
            cluster_tasks: Mutex::new(tasks::Group::new()),
            oidc: RwLock::new(None),
            operations: Operations::new(),
            metrics: Mutex::new(MetricsRegistry::new("burrow")),
            instances_driver: RwLock::new(Arc::new(NullInstances)),
            pools: RwLock::new(Arc::new(NullPools)),
            networks: RwLock::new(Arc::new(NullNetworks)),
            firewall: RwLock::new(None),
            subservers: Mutex::new(SubServers::default()),
            cluster_db_dead: AtomicBool::new(false),
            probe_warnings: Mutex::new(Vec::new()),
            shared_mounts_setup: AtomicBool::new(false),
            authorizer: RwLock::new("tls"),
        })
    }

    /// Name of the active authorization backend.
    pub fn authorizer(&self) -> &'static str {
        *self.authorizer.read()
    }

    /// The member snapshot from the last fully processed heartbeat.
    pub fn last_heartbeat_snapshot(&self) -> Option<ApiHeartbeat> {
        self.last_node_list.lock().clone()
    }

    pub(crate) fn set_authorizer(&self, name: &'static str) {
        *self.authorizer.write() = name;
    }

    pub fn os(&self) -> RwLockReadGuard<'_, Os> {
        self.os.read()
    }

    pub(crate) fn os_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Os> {
        self.os.write()
    }

    pub fn set_debug(&self, debug: bool) {
        self.debug.store(debug, Ordering::SeqCst);
    }

    pub fn debug_mode(&self) -> bool {
        self.debug.load(Ordering::SeqCst)
    }

    pub fn start_time(&self) -> Option<SystemTime> {
        *self.start_time.read()
    }

    pub(crate) fn record_start_time(&self) {
        *self.start_time.write() = Some(SystemTime::now());
    }

    /// Always access the server certificate through this accessor; renewal
    /// swaps the inner pointer at runtime.
    pub fn server_cert(&self) -> Option<Arc<CertInfo>> {
        self.server_cert.read().clone()
    }

    pub fn set_server_cert(&self, cert: Arc<CertInfo>) {
        *self.server_cert.write() = Some(cert);
    }

    pub fn network_cert(&self) -> Option<Arc<CertInfo>> {
        self.network_cert.read().clone()
    }

    pub fn set_network_cert(&self, cert: Arc<CertInfo>) {
        *self.network_cert.write() = Some(cert);
    }

    pub fn global_config_snapshot(&self) -> GlobalConfig {
        self.config_state.lock().global.clone()
    }

    pub fn local_config_snapshot(&self) -> LocalConfig {
        self.config_state.lock().local.clone()
    }

    pub fn server_name(&self) -> String {
        self.config_state.lock().server_name.clone()
    }

    pub fn set_local_config(&self, local: LocalConfig) {
        self.config_state.lock().local = local;
    }

    pub fn set_global_config(&self, global: GlobalConfig, server_name: String) {
        let mut state = self.config_state.lock();
        state.global = global;
        state.server_name = server_name;
    }

    pub fn state(&self) -> State {
        let config = self.config_state.lock();
        State {
            shutdown: self.shutdown.clone(),
            server_name: config.server_name.clone(),
            global_config: config.global.clone(),
            local_config: config.local.clone(),
            start_time: self.start_time(),
            server_cert: self.server_cert(),
            cluster: self.db.cluster(),
        }
    }

    pub fn gateway(&self) -> Option<Arc<Gateway>> {
        self.gateway.read().clone()
    }

    pub fn set_gateway(&self, gateway: Arc<Gateway>) {
        *self.gateway.write() = Some(gateway);
    }

    pub fn router(&self) -> Option<Arc<Router>> {
        self.router.read().clone()
    }

    pub fn set_router(&self, router: Arc<Router>) {
        *self.router.write() = Some(router);
    }

    pub(crate) fn set_endpoints(&self, endpoints: Endpoints) {
        *self.endpoints.lock() = Some(endpoints);
    }

    pub(crate) fn with_endpoints<T>(&self, f: impl FnOnce(&mut Endpoints) -> T) -> Option<T> {
        self.endpoints.lock().as_mut().map(f)
    }

    pub(crate) fn take_endpoints(&self) -> Option<Endpoints> {
        self.endpoints.lock().take()
    }

    pub fn oidc_verifier(&self) -> Option<Arc<oidc::Verifier>> {
        self.oidc.read().clone()
    }

    pub fn oidc_challenge_headers(&self) -> Vec<(String, String)> {
        self.oidc_verifier()
            .map(|verifier| verifier.challenge_headers())
            .unwrap_or_default()
    }

    pub fn instances(&self) -> Arc<dyn Instances> {
        self.instances_driver.read().clone()
    }

    pub fn set_instances(&self, driver: Arc<dyn Instances>) {
        *self.instances_driver.write() = driver;
    }

    pub fn pools(&self) -> Arc<dyn Pools> {
        self.pools.read().clone()
    }

    pub fn set_pools(&self, pools: Arc<dyn Pools>) {
        *self.pools.write() = pools;
    }

    pub fn networks(&self) -> Arc<dyn Networks> {
        self.networks.read().clone()
    }

    pub fn set_networks(&self, networks: Arc<dyn Networks>) {
        *self.networks.write() = networks;
    }

    pub fn firewall_driver(&self) -> Option<&'static str> {
        *self.firewall.read()
    }

    pub(crate) fn set_firewall_driver(&self, driver: &'static str) {
        *self.firewall.write() = Some(driver);
    }

    pub fn unix_socket_path(&self) -> std::path::PathBuf {
        self.os().unix_socket_path()
    }

    /// Single predicate for "the cluster store cannot be used anymore",
    /// covering both a missing handle and a post-failure kill.
    pub fn cluster_db_available(&self) -> bool {
        !self.cluster_db_dead.load(Ordering::SeqCst) && self.db.cluster().is_some()
    }

    pub(crate) fn mark_cluster_db_dead(&self) {
        self.cluster_db_dead.store(true, Ordering::SeqCst);
    }

    /// Routes a parsed request through the admission pipeline.
    pub fn dispatch(self: &Arc<Self>, request: &RequestInfo, out: &mut dyn Write) {
        self.metrics.lock().inc_counter("api.requests", 1);
        match self.router() {
            Some(router) => router.dispatch(self, request, out),
            None => {
                let _ = Response::unavailable("Daemon setup in progress").render(out, &[]);
            }
        }
    }

    /// Yes/no trust check for collaborators that do not need the details.
    pub fn check_trusted_client(self: &Arc<Self>, request: &RequestInfo) -> Result<(), String> {
        match crate::auth::authenticate(self, request) {
            Ok(crate::auth::AuthOutcome::Trusted { .. }) => Ok(()),
            Ok(crate::auth::AuthOutcome::Untrusted) => Err("not authorized".to_string()),
            Err(err) => Err(err.to_string()),
        }
    }

    pub fn debug_status(&self) -> serde_json::Value {
        let uptime = self
            .start_time()
            .and_then(|start| start.elapsed().ok())
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        json!({
            "uptime_seconds": uptime,
            "setup_complete": self.setup.is_open(),
            "ready": self.ready.is_open(),
            "shutting_down": self.shutdown.is_cancelled(),
            "operations": self.operations.count(),
        })
    }

    /// Rebuilds the trust cache from the cluster store, mirroring the rows
    /// into the local store; falls back to the local mirror when the cluster
    /// store is unavailable.
    pub fn update_certificate_cache(&self) {
        debug!("event=cert_cache_refresh source=cluster");
        if let Some(cluster) = self.db.cluster() {
            match cluster.certificates() {
                Ok(rows) => {
                    self.client_certs.replace_from_rows(&rows);
                    if let Ok(node_db) = self.db.node() {
                        if let Err(err) = node_db.replace_certificates(&rows) {
                            warn!("event=cert_cache_local_mirror_failed error={err}");
                        }
                    }
                    return;
                }
                Err(err) => {
                    warn!("event=cert_cache_cluster_read_failed error={err}");
                }
            }
        }
        if let Err(err) = self.update_certificate_cache_from_local() {
            warn!("event=cert_cache_local_read_failed error={err}");
        }
    }

    /// Populates the trust cache from the locally mirrored table; used
    /// before any listener starts.
    pub fn update_certificate_cache_from_local(&self) -> Result<(), DbError> {
        let node_db = self.db.node()?;
        let rows = node_db.certificates()?;
        self.client_certs.replace_from_rows(&rows);
        Ok(())
    }

    /// Refreshes per-member event listener connections after a membership
    /// change. The event hub lives outside the core; this re-dials from the
    /// heartbeat's member list.
    pub fn refresh_event_listeners(&self, heartbeat: &ApiHeartbeat) {
        debug!(
            "event=event_listeners_refresh members={}",
            heartbeat.members.len()
        );
    }

    /// Installs the channel the owner (main loop) listens on for shutdown
    /// requests coming from signals or the API.
    pub fn set_shutdown_channel(&self, sender: mpsc::Sender<ShutdownSignal>) {
        *self.shutdown_signal.lock() = Some(sender);
    }

    /// Asks the owner of the daemon (the main loop) to run the stop
    /// sequence.
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if let Some(sender) = self.shutdown_signal.lock().as_ref() {
            let _ = sender.send(signal);
        }
    }

    /// Stops any previous Loki client, then starts a new one when the
    /// configuration is complete.
    pub fn setup_loki(&self, config: Option<LokiConfig>) {
        let mut subservers = self.subservers.lock();
        if let Some(existing) = subservers.loki.take() {
            existing.stop();
        }
        if let Some(config) = config {
            subservers.loki = Some(LokiClient::start(config, &self.shutdown));
        }
    }

    /// Cancels any previous syslog listener context and starts a fresh one
    /// when enabled.
    pub fn setup_syslog_socket(&self, enable: bool) {
        let mut subservers = self.subservers.lock();
        if let Some(existing) = subservers.syslog.take() {
            existing.stop();
        }
        if enable {
            subservers.syslog = Some(SyslogListener::start());
        }
    }

    pub fn setup_oidc(&self, config: Option<OidcConfig>) {
        *self.oidc.write() = config.map(|config| Arc::new(oidc::Verifier::new(config)));
    }

    pub(crate) fn set_bgp(&self, server: Option<BgpServer>) {
        let mut subservers = self.subservers.lock();
        if let Some(existing) = subservers.bgp.take() {
            existing.stop();
        }
        subservers.bgp = server;
    }

    pub(crate) fn set_dns(&self, server: Option<DnsServer>) {
        let mut subservers = self.subservers.lock();
        if let Some(existing) = subservers.dns.take() {
            existing.stop();
        }
        subservers.dns = server;
    }

    pub(crate) fn set_seccomp(&self, server: Option<SeccompServer>) {
        self.subservers.lock().seccomp = server;
    }

    pub(crate) fn stop_seccomp(&self) -> Result<(), std::io::Error> {
        if let Some(seccomp) = self.subservers.lock().seccomp.take() {
            seccomp.stop()?;
        }
        Ok(())
    }

    pub(crate) fn stop_subservers(&self) {
        let mut subservers = self.subservers.lock();
        if let Some(loki) = subservers.loki.take() {
            loki.stop();
        }
        if let Some(syslog) = subservers.syslog.take() {
            syslog.stop();
        }
        if let Some(bgp) = subservers.bgp.take() {
            bgp.stop();
        }
        if let Some(dns) = subservers.dns.take() {
            dns.stop();
        }
    }
}
