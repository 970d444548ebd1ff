//! Heartbeats: wire type, receive-side handler and the leader's send round.
//!
//! Two modes exist. Full-state heartbeats carry the complete member list and
//! cluster version and are sent only by the leader. Partial heartbeats carry
//! the raft node set only and are exchanged between non-leaders.

use super::membership;
use crate::api::request::RequestInfo;
use crate::api::response::Response;
use crate::cancel::Canceller;
use crate::daemon::Daemon;
use crate::db::warnings::WarningType;
use crate::db::{ClusterDb, RaftNode, RaftRole, API_EXTENSIONS, CLUSTER_SCHEMA_VERSION};
use crate::endpoints::client::{self, ClusterRequest};
use crate::timeouts::HEARTBEAT_SKEW_WINDOW;
use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatVersion {
    pub schema: i64,
    pub api_extensions: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMember {
    pub address: String,
    pub online: bool,
    #[serde(rename = "raftID")]
    pub raft_id: u64,
    #[serde(rename = "raftRole")]
    pub raft_role: RaftRole,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiHeartbeat {
    /// Sender wall clock, unix seconds UTC.
    pub time: i64,
    pub version: HeartbeatVersion,
    pub members: BTreeMap<u64, HeartbeatMember>,
    #[serde(rename = "fullStateList")]
    pub full_state_list: bool,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl ApiHeartbeat {
    /// Assembles a full-state heartbeat from the cluster store and the raft
    /// node set.
    pub fn full_state(
        cluster: &ClusterDb,
        raft_nodes: &[RaftNode],
        offline_threshold: Duration,
        local_address: Option<&str>,
    ) -> Result<Self, crate::db::DbError> {
        let now = now_unix();
        let mut members = BTreeMap::new();
        for member in cluster.members()? {
            let raft = raft_nodes
                .iter()
                .find(|node| node.address == member.address);
            let is_local = Some(member.address.as_str()) == local_address;
            let online =
                is_local || now - member.heartbeat_unix <= offline_threshold.as_secs() as i64;
            members.insert(
                member.id,
                HeartbeatMember {
                    address: member.address.clone(),
                    online,
                    raft_id: raft.map(|node| node.id).unwrap_or(0),
                    raft_role: raft.map(|node| node.role).unwrap_or(RaftRole::None),
                    name: member.name.clone(),
                },
            );
        }
        Ok(Self {
            time: now,
            version: HeartbeatVersion {
                schema: CLUSTER_SCHEMA_VERSION,
                api_extensions: API_EXTENSIONS,
            },
            members,
            full_state_list: true,
        })
    }

    /// The raft node set carried by this heartbeat.
    pub fn raft_nodes(&self) -> Vec<RaftNode> {
        self.members
            .values()
            .filter(|member| member.raft_id > 0)
            .map(|member| RaftNode {
                id: member.raft_id,
                address: member.address.clone(),
                role: member.raft_role,
                name: member.name.clone(),
            })
            .collect()
    }
}

/// True when member count, any address or any online bit changed.
pub fn has_member_state_changed(last: Option<&ApiHeartbeat>, current: &ApiHeartbeat) -> bool {
    let Some(last) = last else {
        return true;
    };
    if last.members.len() != current.members.len() {
        return true;
    }
    for (id, previous) in &last.members {
        match current.members.get(id) {
            Some(member) => {
                if member.address != previous.address || member.online != previous.online {
                    return true;
                }
            }
            None => return true,
        }
    }
    false
}

/// Receive side: consumes a heartbeat POST from another member.
pub fn handle(daemon: &Arc<Daemon>, request: &RequestInfo) -> Response {
    let heartbeat: ApiHeartbeat = match serde_json::from_slice(&request.body) {
        Ok(heartbeat) => heartbeat,
        Err(err) => return Response::bad_request(format!("Invalid heartbeat payload: {err}")),
    };
    let Some(gateway) = daemon.gateway() else {
        return Response::unavailable("Cluster gateway not ready");
    };
    let is_leader = gateway.is_leader().unwrap_or(false);

    check_time_skew(daemon, heartbeat.time);

    // Refuse to wipe the local raft node set on a bad message.
    let raft_nodes = heartbeat.raft_nodes();
    if raft_nodes.is_empty() {
        error!("event=heartbeat_empty_raft_set");
        return Response::bad_request("Empty raft member set received");
    }

    debug!("event=heartbeat_replace_raft_nodes count={}", raft_nodes.len());
    let node_db = match daemon.db.node() {
        Ok(node_db) => node_db,
        Err(err) => return Response::internal_error(err.to_string()),
    };
    if let Err(err) = node_db.replace_raft_nodes(&raft_nodes) {
        error!("event=heartbeat_raft_update_failed error={err}");
        return Response::internal_error("failed to update raft nodes");
    }

    if heartbeat.full_state_list {
        // A stale in-flight round on the leader must be restarted before its
        // member state goes out; otherwise refresh asynchronously so the
        // response reaches the sender right away.
        if !is_leader || !gateway.heartbeat_restart() {
            let daemon = daemon.clone();
            std::thread::spawn(move || {
                node_refresh_task(&daemon, &heartbeat, is_leader, None);
            });
        }
    } else {
        if is_leader {
            error!("event=heartbeat_partial_to_leader");
            return Response::bad_request("Partial heartbeat should not be sent to leader");
        }
        info!(
            "event=heartbeat_partial local={}",
            daemon
                .local_config_snapshot()
                .cluster_address()
                .unwrap_or_default()
        );
    }

    Response::EmptySync
}

/// Flags a skew beyond the window, persisting the warning once; clears the
/// flag and resolves the warning when a heartbeat lands back inside it.
fn check_time_skew(daemon: &Arc<Daemon>, heartbeat_time: i64) {
    let now = now_unix();
    let skewed = (now - heartbeat_time).unsigned_abs() > HEARTBEAT_SKEW_WINDOW.as_secs();
    let mut flag = daemon.time_skew.lock();
    if skewed {
        if !*flag {
            warn!(
                "event=heartbeat_time_skew leader_time={heartbeat_time} local_time={now}"
            );
            if let Some(cluster) = daemon.db.cluster() {
                let message = format!("leaderTime: {heartbeat_time}, localTime: {now}");
                if let Err(err) = cluster.upsert_warning_local(WarningType::ClusterTimeSkew, &message)
                {
                    warn!("event=heartbeat_skew_warning_failed error={err}");
                }
            }
        }
        *flag = true;
    } else if *flag {
        warn!("event=heartbeat_time_skew_resolved");
        if let Some(cluster) = daemon.db.cluster() {
            if let Err(err) = cluster.resolve_warnings_by_type(WarningType::ClusterTimeSkew) {
                warn!("event=heartbeat_skew_resolve_failed error={err}");
            }
        }
        *flag = false;
    }
}

/// Refresh task run when a full-state heartbeat is sent (leader) or received
/// (other members). Detects member state changes, refreshes the certificate
/// cache and event listeners, and on the leader's send side triggers role
/// rebalancing for degraded clusters.
pub fn node_refresh_task(
    daemon: &Arc<Daemon>,
    heartbeat: &ApiHeartbeat,
    is_leader: bool,
    unavailable: Option<Vec<String>>,
) {
    let Some(cluster) = daemon.db.cluster() else {
        return;
    };
    if cluster.node_id() == 0 {
        return;
    }
    let local_address = daemon.local_config_snapshot().cluster_address();

    if !heartbeat.full_state_list || heartbeat.members.is_empty() {
        error!(
            "event=heartbeat_refresh_partial_state local={}",
            local_address.clone().unwrap_or_default()
        );
        return;
    }

    let version_changed = {
        let last = daemon.last_node_list.lock();
        match last.as_ref() {
            None => true,
            Some(previous) => previous.version != heartbeat.version,
        }
    };
    if version_changed {
        if let Err(err) = membership::maybe_update(daemon) {
            error!("event=heartbeat_version_check_failed error={err}");
            return;
        }
    }

    // Tracks whether any state-change subtask failed; on failure the old
    // snapshot is kept so the next heartbeat retries.
    let mut state_change_failure = false;

    if let Err(err) = daemon
        .networks()
        .update_ovn_chassis(heartbeat, local_address.as_deref().unwrap_or(""))
    {
        state_change_failure = true;
        error!("event=heartbeat_ovn_refresh_failed error={err}");
    }

    let member_state_changed = {
        let last = daemon.last_node_list.lock();
        has_member_state_changed(last.as_ref(), heartbeat)
    };
    if member_state_changed {
        info!(
            "event=heartbeat_member_state_changed local={}",
            local_address.clone().unwrap_or_default()
        );
        daemon.update_certificate_cache();
    }

    // Event listener refresh dials remote members; run it aside so it never
    // delays the rest of the refresh.
    let listener_daemon = daemon.clone();
    let listener_heartbeat = heartbeat.clone();
    let listeners = std::thread::spawn(move || {
        listener_daemon.refresh_event_listeners(&listener_heartbeat);
    });

    if !state_change_failure {
        *daemon.last_node_list.lock() = Some(heartbeat.clone());
    }

    if is_leader && unavailable.is_some() && heartbeat.members.len() > 1 {
        let mut degraded = false;
        let mut members_without_raft_role = false;
        let mut online_voters = 0u64;
        let mut online_standbys = 0u64;

        for member in heartbeat.members.values() {
            if member.online {
                match member.raft_role {
                    RaftRole::Voter => online_voters += 1,
                    RaftRole::StandBy => online_standbys += 1,
                    _ => {}
                }
                if member.raft_id == 0 {
                    members_without_raft_role = true;
                }
            } else if member.raft_role != RaftRole::Spare {
                // Offline member still holding a voter or stand-by role.
                degraded = true;
            }
        }

        let global = daemon.global_config_snapshot();
        let max_voters = global.max_voters();
        let max_standby = global.max_standby();
        let unavailable = unavailable.unwrap_or_default();

        if degraded || online_voters < max_voters || online_standbys < max_standby {
            let _membership = daemon.cluster_membership_lock.write();
            debug!(
                "event=heartbeat_rebalance local={}",
                local_address.clone().unwrap_or_default()
            );
            if let Err(err) = membership::rebalance_member_roles(daemon, &unavailable) {
                if !err.is_not_leader() {
                    warn!("event=heartbeat_rebalance_failed error={err}");
                }
            }
        }

        if members_without_raft_role {
            let _membership = daemon.cluster_membership_lock.write();
            debug!(
                "event=heartbeat_upgrade_roles local={}",
                local_address.unwrap_or_default()
            );
            if let Err(err) = membership::upgrade_members_without_raft_role(daemon) {
                if !err.is_not_leader() {
                    warn!("event=heartbeat_upgrade_roles_failed error={err}");
                }
            }
        }
    }

    let _ = listeners.join();
}

/// One leader heartbeat round: broadcast full state to every other member,
/// then run the refresh task with the set of unreachable members. Restarts
/// itself once when preempted by `heartbeat_restart`.
pub fn heartbeat_round(daemon: &Arc<Daemon>, _shutdown: &Canceller) {
    let Some(gateway) = daemon.gateway() else {
        return;
    };
    loop {
        if gateway.is_killed() || daemon.shutdown.is_cancelled() {
            return;
        }
        if !gateway.is_leader().unwrap_or(false) {
            return;
        }
        let cancel = gateway.begin_heartbeat_round();
        let restarted = run_round(daemon, &cancel);
        gateway.end_heartbeat_round();
        if restarted && cancel.is_cancelled() && !daemon.shutdown.is_cancelled() {
            continue;
        }
        return;
    }
}

fn run_round(daemon: &Arc<Daemon>, cancel: &Canceller) -> bool {
    let Some(gateway) = daemon.gateway() else {
        return false;
    };
    let Some(cluster) = gateway.cluster() else {
        return false;
    };
    let local_address = gateway.local_address();
    let raft_nodes = match gateway.node_store() {
        Ok(nodes) => nodes,
        Err(err) => {
            warn!("event=heartbeat_round_node_store_failed error={err}");
            return false;
        }
    };
    let heartbeat = match ApiHeartbeat::full_state(
        &cluster,
        &raft_nodes,
        gateway.offline_threshold(),
        local_address.as_deref(),
    ) {
        Ok(heartbeat) => heartbeat,
        Err(err) => {
            warn!("event=heartbeat_round_assemble_failed error={err}");
            return false;
        }
    };

    let payload = match serde_json::to_value(&heartbeat) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("event=heartbeat_round_encode_failed error={err}");
            return false;
        }
    };

    let mut unavailable = Vec::new();
    let mut rng = rand::thread_rng();
    for member in heartbeat.members.values() {
        if cancel.is_cancelled() {
            return true;
        }
        if Some(member.address.as_str()) == local_address.as_deref() {
            continue;
        }
        // Spread sends so members do not all see the leader at once.
        std::thread::sleep(Duration::from_millis(rng.gen_range(0..50)));
        let request = ClusterRequest {
            address: &member.address,
            method: "POST",
            path: "/internal/heartbeat",
            body: Some(payload.clone()),
            client_cert: daemon.server_cert(),
            expected_fingerprint: daemon
                .network_cert()
                .map(|cert| cert.fingerprint().to_string()),
        };
        match client::send(&request) {
            Ok(status) if status < 400 => {
                if let Err(err) = cluster.member_heartbeat(&member.name) {
                    warn!(
                        "event=heartbeat_round_record_failed member={} error={err}",
                        member.name
                    );
                }
            }
            Ok(status) => {
                warn!(
                    "event=heartbeat_round_member_error member={} status={status}",
                    member.name
                );
                unavailable.push(member.name.clone());
            }
            Err(err) => {
                debug!(
                    "event=heartbeat_round_member_unreachable member={} error={err}",
                    member.name
                );
                unavailable.push(member.name.clone());
            }
        }
    }

    if cancel.is_cancelled() {
        return true;
    }
    if let Some(hook) = gateway.heartbeat_hook() {
        hook(&heartbeat, true, Some(unavailable));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(address: &str, online: bool, raft_id: u64, role: RaftRole) -> HeartbeatMember {
        HeartbeatMember {
            address: address.to_string(),
            online,
            raft_id,
            raft_role: role,
            name: address.split(':').next().unwrap_or("m").to_string(),
        }
    }

    fn heartbeat(members: Vec<(u64, HeartbeatMember)>) -> ApiHeartbeat {
        ApiHeartbeat {
            time: 1_700_000_000,
            version: HeartbeatVersion {
                schema: CLUSTER_SCHEMA_VERSION,
                api_extensions: API_EXTENSIONS,
            },
            members: members.into_iter().collect(),
            full_state_list: true,
        }
    }

    #[test]
    fn wire_round_trip_preserves_roles() {
        let hb = heartbeat(vec![
            (1, member("10.0.0.1:8443", true, 1, RaftRole::Voter)),
            (2, member("10.0.0.2:8443", false, 2, RaftRole::StandBy)),
        ]);
        let encoded = serde_json::to_string(&hb).unwrap();
        assert!(encoded.contains("\"raftRole\":\"voter\""));
        assert!(encoded.contains("\"standby\""));
        assert!(encoded.contains("\"fullStateList\":true"));
        let decoded: ApiHeartbeat = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, hb);
    }

    #[test]
    fn raft_nodes_skip_members_without_raft_id() {
        let hb = heartbeat(vec![
            (1, member("10.0.0.1:8443", true, 1, RaftRole::Voter)),
            (2, member("10.0.0.2:8443", true, 0, RaftRole::None)),
        ]);
        let nodes = hb.raft_nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, 1);
    }

    #[test]
    fn member_state_diff_detects_changes() {
        let base = heartbeat(vec![(1, member("10.0.0.1:8443", true, 1, RaftRole::Voter))]);
        assert!(has_member_state_changed(None, &base));
        assert!(!has_member_state_changed(Some(&base), &base.clone()));

        let offline = heartbeat(vec![(1, member("10.0.0.1:8443", false, 1, RaftRole::Voter))]);
        assert!(has_member_state_changed(Some(&base), &offline));

        let moved = heartbeat(vec![(1, member("10.0.9.9:8443", true, 1, RaftRole::Voter))]);
        assert!(has_member_state_changed(Some(&base), &moved));

        let grown = heartbeat(vec![
            (1, member("10.0.0.1:8443", true, 1, RaftRole::Voter)),
            (2, member("10.0.0.2:8443", true, 2, RaftRole::Spare)),
        ]);
        assert!(has_member_state_changed(Some(&base), &grown));

        // Role-only changes do not count as member state changes.
        let role_only = heartbeat(vec![(1, member("10.0.0.1:8443", true, 1, RaftRole::Spare))]);
        assert!(!has_member_state_changed(Some(&base), &role_only));
    }
}
