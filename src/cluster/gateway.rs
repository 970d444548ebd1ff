//! Cluster gateway: the daemon-side handle on the replicated store.
//!
//! Owns the embedded database engine's lifecycle, the locally persisted
//! node store used for dial discovery, the upgrade-notification latch the
//! startup detour blocks on, and the bookkeeping for in-flight heartbeat
//! rounds. Leadership is derived from the node store: the lowest-id voter
//! leads.

use super::heartbeat::ApiHeartbeat;
use super::ClusterError;
use crate::cancel::Canceller;
use crate::db::{ClusterDb, NodeDb, RaftNode, RaftRole};
use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::time::Duration;

/// Verbosity of the embedded engine's own logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineLogLevel {
    Error,
    Trace,
}

pub type HeartbeatHook = Arc<dyn Fn(&ApiHeartbeat, bool, Option<Vec<String>>) + Send + Sync>;

struct RoundState {
    cancel: Canceller,
}

pub struct Gateway {
    shutdown: Canceller,
    killed: Arc<AtomicBool>,
    node_db: Arc<NodeDb>,
    raft_latency: f64,
    log_level: EngineLogLevel,
    local_address: RwLock<Option<String>>,
    cluster: RwLock<Option<Arc<ClusterDb>>>,
    heartbeat_hook: RwLock<Option<HeartbeatHook>>,
    offline_threshold: Mutex<Duration>,
    upgrade_seq: StdMutex<u64>,
    upgrade_condvar: Condvar,
    round: Mutex<Option<RoundState>>,
}

impl Gateway {
    pub fn new(
        shutdown: Canceller,
        node_db: Arc<NodeDb>,
        raft_latency: f64,
        log_level: EngineLogLevel,
    ) -> Self {
        if log_level == EngineLogLevel::Trace {
            trace!("event=gateway_new raft_latency={raft_latency}");
        }
        Self {
            shutdown,
            killed: Arc::new(AtomicBool::new(false)),
            node_db,
            raft_latency,
            log_level,
            local_address: RwLock::new(None),
            cluster: RwLock::new(None),
            heartbeat_hook: RwLock::new(None),
            offline_threshold: Mutex::new(Duration::from_secs(20)),
            upgrade_seq: StdMutex::new(0),
            upgrade_condvar: Condvar::new(),
            round: Mutex::new(None),
        }
    }

    /// Flag shared with the cluster store so a kill makes every in-flight
    /// transaction fail fast.
    pub fn kill_handle(&self) -> Arc<AtomicBool> {
        self.killed.clone()
    }

    pub fn set_heartbeat_hook(&self, hook: HeartbeatHook) {
        *self.heartbeat_hook.write() = Some(hook);
    }

    pub fn heartbeat_hook(&self) -> Option<HeartbeatHook> {
        self.heartbeat_hook.read().clone()
    }

    pub fn set_local_address(&self, address: Option<String>) {
        *self.local_address.write() = address;
    }

    pub fn local_address(&self) -> Option<String> {
        self.local_address.read().clone()
    }

    pub fn set_cluster(&self, cluster: Option<Arc<ClusterDb>>) {
        *self.cluster.write() = cluster;
    }

    pub fn cluster(&self) -> Option<Arc<ClusterDb>> {
        self.cluster.read().clone()
    }

    pub fn offline_threshold(&self) -> Duration {
        *self.offline_threshold.lock()
    }

    pub fn set_offline_threshold(&self, threshold: Duration) {
        *self.offline_threshold.lock() = threshold;
    }

    /// Interval between leader heartbeat rounds, scaled by the latency knob.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(4.0 * self.raft_latency.max(0.5))
    }

    /// The node store: dial directory for every known raft member.
    pub fn node_store(&self) -> Result<Vec<RaftNode>, ClusterError> {
        Ok(self.node_db.raft_nodes()?)
    }

    /// Persists a new raft node set, e.g. after a role rebalance.
    pub fn replace_node_store(&self, nodes: &[RaftNode]) -> Result<(), ClusterError> {
        Ok(self.node_db.replace_raft_nodes(nodes)?)
    }

    /// Address of the current leader, i.e. the lowest-id voter.
    pub fn leader_address(&self) -> Result<Option<String>, ClusterError> {
        let nodes = self.node_store()?;
        Ok(nodes
            .iter()
            .filter(|node| node.role == RaftRole::Voter)
            .min_by_key(|node| node.id)
            .map(|node| node.address.clone()))
    }

    pub fn is_leader(&self) -> Result<bool, ClusterError> {
        let Some(local) = self.local_address() else {
            return Ok(false);
        };
        Ok(self.leader_address()?.as_deref() == Some(local.as_str()))
    }

    /// Blocks until another member notifies that the cluster-wide upgrade
    /// finished, or the timeout/shutdown fires. Returns true when notified.
    pub fn wait_upgrade_notification(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut seq = match self.upgrade_seq.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let observed = *seq;
        while *seq == observed {
            if self.shutdown.is_cancelled() {
                return false;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = (deadline - now).min(Duration::from_millis(200));
            let (next, _status) = match self.upgrade_condvar.wait_timeout(seq, wait) {
                Ok(result) => result,
                Err(_) => return false,
            };
            seq = next;
        }
        true
    }

    /// Called when a peer posts the upgrade-completed notification.
    pub fn notify_upgrade(&self) {
        let mut seq = match self.upgrade_seq.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *seq += 1;
        self.upgrade_condvar.notify_all();
        info!("event=gateway_upgrade_notified");
    }

    /// Marks the start of a heartbeat round; returns its cancellation token.
    pub fn begin_heartbeat_round(&self) -> Canceller {
        let cancel = Canceller::new();
        *self.round.lock() = Some(RoundState {
            cancel: cancel.clone(),
        });
        cancel
    }

    pub fn end_heartbeat_round(&self) {
        self.round.lock().take();
    }

    /// Requests any in-flight heartbeat round to cancel itself so a fresh
    /// round can broadcast up-to-date member state. Returns false when no
    /// round was running.
    pub fn heartbeat_restart(&self) -> bool {
        let guard = self.round.lock();
        match guard.as_ref() {
            Some(round) => {
                debug!("event=gateway_heartbeat_restart");
                round.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Kills the embedded engine: every subsequent cluster-store operation
    /// observes an error immediately. Used when leadership must move
    /// elsewhere or the store became untrustworthy.
    pub fn kill(&self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            warn!("event=gateway_kill");
        }
        if let Some(round) = self.round.lock().take() {
            round.cancel.cancel();
        }
    }

    /// Orderly engine teardown at the end of shutdown.
    pub fn shutdown_engine(&self) -> Result<(), ClusterError> {
        if self.log_level == EngineLogLevel::Trace {
            trace!("event=gateway_shutdown_engine");
        }
        self.set_cluster(None);
        Ok(())
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gateway(dir: &TempDir) -> Gateway {
        let node = Arc::new(NodeDb::open(dir.path(), |_| Ok(())).unwrap());
        Gateway::new(Canceller::new(), node, 1.0, EngineLogLevel::Error)
    }

    fn seed(gw: &Gateway, roles: &[(u64, &str, RaftRole)]) {
        let nodes: Vec<RaftNode> = roles
            .iter()
            .map(|(id, address, role)| RaftNode {
                id: *id,
                address: address.to_string(),
                role: *role,
                name: format!("m{id}"),
            })
            .collect();
        gw.node_db.replace_raft_nodes(&nodes).unwrap();
    }

    #[test]
    fn leader_is_lowest_id_voter() {
        let dir = TempDir::new().unwrap();
        let gw = gateway(&dir);
        seed(
            &gw,
            &[
                (3, "10.0.0.3:8443", RaftRole::Voter),
                (1, "10.0.0.1:8443", RaftRole::Spare),
                (2, "10.0.0.2:8443", RaftRole::Voter),
            ],
        );
        assert_eq!(
            gw.leader_address().unwrap().as_deref(),
            Some("10.0.0.2:8443")
        );
        gw.set_local_address(Some("10.0.0.2:8443".into()));
        assert!(gw.is_leader().unwrap());
        gw.set_local_address(Some("10.0.0.3:8443".into()));
        assert!(!gw.is_leader().unwrap());
    }

    #[test]
    fn heartbeat_restart_cancels_active_round() {
        let dir = TempDir::new().unwrap();
        let gw = gateway(&dir);
        assert!(!gw.heartbeat_restart());
        let cancel = gw.begin_heartbeat_round();
        assert!(gw.heartbeat_restart());
        assert!(cancel.is_cancelled());
        gw.end_heartbeat_round();
        assert!(!gw.heartbeat_restart());
    }

    #[test]
    fn upgrade_notification_wakes_waiter() {
        let dir = TempDir::new().unwrap();
        let gw = Arc::new(gateway(&dir));
        let waiter = gw.clone();
        let handle =
            std::thread::spawn(move || waiter.wait_upgrade_notification(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(30));
        gw.notify_upgrade();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn kill_is_idempotent_and_visible() {
        let dir = TempDir::new().unwrap();
        let gw = gateway(&dir);
        let handle = gw.kill_handle();
        gw.kill();
        gw.kill();
        assert!(gw.is_killed());
        assert!(handle.load(Ordering::SeqCst));
    }
}
