//! Membership role management: rebalancing, promotion of role-less members,
//! leader handover and upgrade notifications.
//!
//! Every mutating entry point here must run under the daemon's cluster
//! membership lock; callers hold it so concurrent joins, leaves and role
//! changes serialize.

use super::ClusterError;
use crate::daemon::Daemon;
use crate::db::{MemberInfo, RaftNode, RaftRole, API_EXTENSIONS, CLUSTER_SCHEMA_VERSION};
use crate::db::warnings::WarningType;
use crate::endpoints::client::{self, ClusterRequest};
use log::{info, warn};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

fn online_members(
    members: &[MemberInfo],
    offline_threshold: std::time::Duration,
    local_address: Option<&str>,
    unavailable: &[String],
) -> Vec<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    members
        .iter()
        .filter(|member| {
            if unavailable.contains(&member.name) {
                return false;
            }
            Some(member.address.as_str()) == local_address
                || now - member.heartbeat_unix <= offline_threshold.as_secs() as i64
        })
        .map(|member| member.address.clone())
        .collect()
}

/// Reassigns voter/stand-by/spare roles so the cluster carries its target
/// number of voters and standbys, preferring members that already hold the
/// role. Leader only; members listed in `unavailable` are skipped.
pub fn rebalance_member_roles(
    daemon: &Arc<Daemon>,
    unavailable: &[String],
) -> Result<(), ClusterError> {
    let gateway = daemon.gateway().ok_or(ClusterError::ClusterDbUnavailable)?;
    if !gateway.is_leader()? {
        return Err(ClusterError::NotLeader);
    }
    let cluster = gateway.cluster().ok_or(ClusterError::ClusterDbUnavailable)?;

    let members = cluster.members()?;
    let mut nodes = gateway.node_store()?;
    let local_address = gateway.local_address();
    let online = online_members(
        &members,
        gateway.offline_threshold(),
        local_address.as_deref(),
        unavailable,
    );

    let global = daemon.global_config_snapshot();
    let max_voters = global.max_voters() as usize;
    let max_standby = global.max_standby() as usize;

    // Stable preference: keep current voters first, then standbys, then by
    // id, considering online members only.
    let role_rank = |role: RaftRole| match role {
        RaftRole::Voter => 0,
        RaftRole::StandBy => 1,
        _ => 2,
    };
    let mut candidates: Vec<usize> = (0..nodes.len())
        .filter(|&idx| online.contains(&nodes[idx].address))
        .collect();
    candidates.sort_by_key(|&idx| (role_rank(nodes[idx].role), nodes[idx].id));

    let mut assignments: Vec<(usize, RaftRole)> = Vec::new();
    for (position, &idx) in candidates.iter().enumerate() {
        let target = if position < max_voters {
            RaftRole::Voter
        } else if position < max_voters + max_standby {
            RaftRole::StandBy
        } else {
            RaftRole::Spare
        };
        assignments.push((idx, target));
    }
    // Everything offline keeps no quorum duties.
    for idx in 0..nodes.len() {
        if !online.contains(&nodes[idx].address) {
            assignments.push((idx, RaftRole::Spare));
        }
    }

    let mut changed = false;
    for (idx, target) in assignments {
        if nodes[idx].role != target {
            info!(
                "event=member_role_change member={} address={} old={:?} new={:?}",
                nodes[idx].name, nodes[idx].address, nodes[idx].role, target
            );
            nodes[idx].role = target;
            changed = true;
        }
    }
    if changed {
        gateway.replace_node_store(&nodes)?;
    }
    Ok(())
}

/// Grants a spare raft role to cluster members that have none, so they take
/// part in dial discovery and future rebalancing. Leader only.
pub fn upgrade_members_without_raft_role(daemon: &Arc<Daemon>) -> Result<(), ClusterError> {
    let gateway = daemon.gateway().ok_or(ClusterError::ClusterDbUnavailable)?;
    if !gateway.is_leader()? {
        return Err(ClusterError::NotLeader);
    }
    let cluster = gateway.cluster().ok_or(ClusterError::ClusterDbUnavailable)?;

    let members = cluster.members()?;
    let mut nodes = gateway.node_store()?;
    let mut next_id = nodes.iter().map(|node| node.id).max().unwrap_or(0) + 1;
    let mut changed = false;
    for member in members {
        if nodes.iter().any(|node| node.address == member.address) {
            continue;
        }
        info!(
            "event=member_role_grant member={} address={} role=spare raft_id={next_id}",
            member.name, member.address
        );
        nodes.push(RaftNode {
            id: next_id,
            address: member.address.clone(),
            role: RaftRole::Spare,
            name: member.name.clone(),
        });
        next_id += 1;
        changed = true;
    }
    if changed {
        gateway.replace_node_store(&nodes)?;
    }
    Ok(())
}

/// Hands the leader role (and this member's quorum duties) to another
/// member ahead of shutdown. A no-op on non-leaders and standalone members.
pub fn handover_member_role(daemon: &Arc<Daemon>) -> Result<(), ClusterError> {
    let gateway = daemon.gateway().ok_or(ClusterError::ClusterDbUnavailable)?;
    let Some(local_address) = gateway.local_address() else {
        return Ok(());
    };
    if !gateway.is_leader()? {
        return Ok(());
    }
    let mut nodes = gateway.node_store()?;
    if nodes.len() <= 1 {
        return Ok(());
    }

    // Promote the best successor before demoting ourselves so the store
    // never loses its last voter.
    let successor = nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| node.address != local_address)
        .min_by_key(|(_, node)| {
            let rank = match node.role {
                RaftRole::Voter => 0,
                RaftRole::StandBy => 1,
                _ => 2,
            };
            (rank, node.id)
        })
        .map(|(idx, _)| idx);
    let Some(successor) = successor else {
        return Ok(());
    };
    info!(
        "event=member_role_handover from={} to={}",
        local_address, nodes[successor].address
    );
    nodes[successor].role = RaftRole::Voter;
    for node in nodes.iter_mut() {
        if node.address == local_address {
            node.role = RaftRole::Spare;
        }
    }
    gateway.replace_node_store(&nodes)?;
    Ok(())
}

/// Tells every other member that this member finished its database upgrade.
/// Failures are aggregated into one transport error; callers treat it as
/// best-effort.
pub fn notify_upgrade_completed(daemon: &Arc<Daemon>) -> Result<(), ClusterError> {
    let gateway = daemon.gateway().ok_or(ClusterError::ClusterDbUnavailable)?;
    let Some(cluster) = gateway.cluster() else {
        return Ok(());
    };
    let local_address = gateway.local_address();
    let mut failures = Vec::new();
    for member in cluster.members()? {
        if Some(member.address.as_str()) == local_address.as_deref() {
            continue;
        }
        let request = ClusterRequest {
            address: &member.address,
            method: "POST",
            path: "/internal/cluster/upgraded",
            body: None,
            client_cert: daemon.server_cert(),
            expected_fingerprint: daemon
                .network_cert()
                .map(|cert| cert.fingerprint().to_string()),
        };
        match client::send(&request) {
            Ok(status) if status < 400 => {}
            Ok(status) => failures.push(format!("{}: HTTP {status}", member.name)),
            Err(err) => failures.push(format!("{}: {err}", member.name)),
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(ClusterError::Transport(failures.join("; ")))
    }
}

/// Checks whether the cluster moved ahead of this build; the actual binary
/// upgrade is the package manager's job, so a lagging member only records a
/// warning and keeps serving.
pub fn maybe_update(daemon: &Arc<Daemon>) -> Result<(), ClusterError> {
    let Some(cluster) = daemon.db.cluster() else {
        return Ok(());
    };
    let members = cluster.members()?;
    let max_schema = members.iter().map(|m| m.schema).max().unwrap_or(0);
    let max_api = members.iter().map(|m| m.api_extensions).max().unwrap_or(0);
    if CLUSTER_SCHEMA_VERSION < max_schema || API_EXTENSIONS < max_api {
        warn!(
            "event=member_behind_cluster local_schema={CLUSTER_SCHEMA_VERSION} cluster_schema={max_schema} local_api={API_EXTENSIONS} cluster_api={max_api}"
        );
        cluster.upsert_warning_local(
            WarningType::MemberVersionBehind,
            "this member runs an older build than the rest of the cluster",
        )?;
    }
    Ok(())
}
