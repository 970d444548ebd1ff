//! Role rebalancing, promotion of role-less members and leader handover.

mod common;

use burrow::cluster::membership;
use burrow::db::{RaftNode, RaftRole};
use burrow::Daemon;
use common::clustered_daemon;
use rusqlite::params;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::TempDir;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn add_member(daemon: &Arc<Daemon>, name: &str, address: &str) {
    let cluster = daemon.db.cluster().unwrap();
    cluster
        .transaction(|tx| {
            tx.execute(
                "INSERT INTO members (name, address, schema, api_extensions, heartbeat)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    name,
                    address,
                    burrow::db::CLUSTER_SCHEMA_VERSION,
                    burrow::db::API_EXTENSIONS,
                    now_unix()
                ],
            )?;
            Ok(())
        })
        .unwrap();
}

fn raft_node(id: u64, address: &str, name: &str, role: RaftRole) -> RaftNode {
    RaftNode {
        id,
        address: address.to_string(),
        role,
        name: name.to_string(),
    }
}

#[test]
fn rebalance_requires_leadership() {
    let dir = TempDir::new().unwrap();
    let daemon = clustered_daemon(&dir, "beta", Some("10.0.0.2:8443"));
    daemon
        .db
        .node()
        .unwrap()
        .replace_raft_nodes(&[
            raft_node(1, "10.0.0.1:8443", "alpha", RaftRole::Voter),
            raft_node(2, "10.0.0.2:8443", "beta", RaftRole::Spare),
        ])
        .unwrap();

    let err = membership::rebalance_member_roles(&daemon, &[]).unwrap_err();
    assert!(err.is_not_leader());
}

#[test]
fn rebalance_promotes_spares_to_fill_quorum_targets() {
    let dir = TempDir::new().unwrap();
    let daemon = clustered_daemon(&dir, "alpha", Some("10.0.0.1:8443"));
    for (name, address) in [
        ("beta", "10.0.0.2:8443"),
        ("gamma", "10.0.0.3:8443"),
        ("delta", "10.0.0.4:8443"),
    ] {
        add_member(&daemon, name, address);
    }
    daemon
        .db
        .node()
        .unwrap()
        .replace_raft_nodes(&[
            raft_node(1, "10.0.0.1:8443", "alpha", RaftRole::Voter),
            raft_node(2, "10.0.0.2:8443", "beta", RaftRole::Spare),
            raft_node(3, "10.0.0.3:8443", "gamma", RaftRole::Spare),
            raft_node(4, "10.0.0.4:8443", "delta", RaftRole::Spare),
        ])
        .unwrap();

    let _membership = daemon.cluster_membership_lock.write();
    membership::rebalance_member_roles(&daemon, &[]).unwrap();
    drop(_membership);

    let nodes = daemon.db.node().unwrap().raft_nodes().unwrap();
    let voters = nodes
        .iter()
        .filter(|node| node.role == RaftRole::Voter)
        .count();
    let standbys = nodes
        .iter()
        .filter(|node| node.role == RaftRole::StandBy)
        .count();
    assert_eq!(voters, 3, "default max_voters worth of voters");
    assert_eq!(standbys, 1, "remaining online member becomes stand-by");
}

#[test]
fn rebalance_skips_unavailable_members() {
    let dir = TempDir::new().unwrap();
    let daemon = clustered_daemon(&dir, "alpha", Some("10.0.0.1:8443"));
    add_member(&daemon, "beta", "10.0.0.2:8443");
    add_member(&daemon, "gamma", "10.0.0.3:8443");
    daemon
        .db
        .node()
        .unwrap()
        .replace_raft_nodes(&[
            raft_node(1, "10.0.0.1:8443", "alpha", RaftRole::Voter),
            raft_node(2, "10.0.0.2:8443", "beta", RaftRole::Spare),
            raft_node(3, "10.0.0.3:8443", "gamma", RaftRole::Spare),
        ])
        .unwrap();

    membership::rebalance_member_roles(&daemon, &["beta".to_string()]).unwrap();

    let nodes = daemon.db.node().unwrap().raft_nodes().unwrap();
    let beta = nodes.iter().find(|node| node.name == "beta").unwrap();
    assert_eq!(beta.role, RaftRole::Spare, "unavailable member stays spare");
    let gamma = nodes.iter().find(|node| node.name == "gamma").unwrap();
    assert_eq!(gamma.role, RaftRole::Voter);
}

#[test]
fn members_without_raft_role_get_granted_spare() {
    let dir = TempDir::new().unwrap();
    let daemon = clustered_daemon(&dir, "alpha", Some("10.0.0.1:8443"));
    add_member(&daemon, "beta", "10.0.0.2:8443");
    daemon
        .db
        .node()
        .unwrap()
        .replace_raft_nodes(&[raft_node(1, "10.0.0.1:8443", "alpha", RaftRole::Voter)])
        .unwrap();

    membership::upgrade_members_without_raft_role(&daemon).unwrap();

    let nodes = daemon.db.node().unwrap().raft_nodes().unwrap();
    assert_eq!(nodes.len(), 2);
    let beta = nodes.iter().find(|node| node.name == "beta").unwrap();
    assert_eq!(beta.role, RaftRole::Spare);
    assert_eq!(beta.id, 2);
}

#[test]
fn handover_demotes_local_and_promotes_successor() {
    let dir = TempDir::new().unwrap();
    let daemon = clustered_daemon(&dir, "alpha", Some("10.0.0.1:8443"));
    daemon
        .db
        .node()
        .unwrap()
        .replace_raft_nodes(&[
            raft_node(1, "10.0.0.1:8443", "alpha", RaftRole::Voter),
            raft_node(2, "10.0.0.2:8443", "beta", RaftRole::StandBy),
        ])
        .unwrap();

    membership::handover_member_role(&daemon).unwrap();

    let nodes = daemon.db.node().unwrap().raft_nodes().unwrap();
    let alpha = nodes.iter().find(|node| node.name == "alpha").unwrap();
    let beta = nodes.iter().find(|node| node.name == "beta").unwrap();
    assert_eq!(alpha.role, RaftRole::Spare);
    assert_eq!(beta.role, RaftRole::Voter);
}

#[test]
fn handover_is_a_no_op_for_non_leaders_and_standalone() {
    let dir = TempDir::new().unwrap();
    let daemon = clustered_daemon(&dir, "beta", Some("10.0.0.2:8443"));
    let nodes = vec![
        raft_node(1, "10.0.0.1:8443", "alpha", RaftRole::Voter),
        raft_node(2, "10.0.0.2:8443", "beta", RaftRole::StandBy),
    ];
    daemon.db.node().unwrap().replace_raft_nodes(&nodes).unwrap();

    membership::handover_member_role(&daemon).unwrap();
    assert_eq!(daemon.db.node().unwrap().raft_nodes().unwrap(), nodes);
}
