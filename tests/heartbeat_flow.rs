//! Heartbeat receive-side behaviour: raft-set protection, partial-mode
//! refusals, time-skew warnings and the refresh task's retry semantics.

mod common;

use burrow::cluster::heartbeat::{
    self, ApiHeartbeat, HeartbeatMember, HeartbeatVersion,
};
use burrow::db::warnings::{WarningStatus, WarningType};
use burrow::db::{RaftNode, RaftRole, API_EXTENSIONS, CLUSTER_SCHEMA_VERSION};
use burrow::network::{NetworkError, Networks};
use common::{clustered_daemon, parse_response, RequestBuilder};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::TempDir;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn member(address: &str, name: &str, raft_id: u64, role: RaftRole) -> HeartbeatMember {
    HeartbeatMember {
        address: address.to_string(),
        online: true,
        raft_id,
        raft_role: role,
        name: name.to_string(),
    }
}

fn heartbeat(time: i64, members: Vec<(u64, HeartbeatMember)>, full: bool) -> ApiHeartbeat {
    ApiHeartbeat {
        time,
        version: HeartbeatVersion {
            schema: CLUSTER_SCHEMA_VERSION,
            api_extensions: API_EXTENSIONS,
        },
        members: members.into_iter().collect::<BTreeMap<_, _>>(),
        full_state_list: full,
    }
}

fn seed_raft_nodes(daemon: &Arc<burrow::Daemon>, nodes: &[RaftNode]) {
    daemon.db.node().unwrap().replace_raft_nodes(nodes).unwrap();
}

fn two_member_raft_set() -> Vec<RaftNode> {
    vec![
        RaftNode {
            id: 1,
            address: "10.0.0.1:8443".into(),
            role: RaftRole::Voter,
            name: "alpha".into(),
        },
        RaftNode {
            id: 2,
            address: "10.0.0.2:8443".into(),
            role: RaftRole::Spare,
            name: "beta".into(),
        },
    ]
}

fn handle(daemon: &Arc<burrow::Daemon>, hb: &ApiHeartbeat) -> common::TestResponse {
    let request = RequestBuilder::new("POST", "/internal/heartbeat")
        .json_body(&serde_json::to_value(hb).unwrap())
        .build();
    let response = heartbeat::handle(daemon, &request);
    let mut buffer = Vec::new();
    response.render(&mut buffer, &[]).unwrap();
    parse_response(&buffer)
}

#[test]
fn empty_raft_set_is_refused_without_mutation() {
    let dir = TempDir::new().unwrap();
    // Non-leader: local address is the spare member.
    let daemon = clustered_daemon(&dir, "beta", Some("10.0.0.2:8443"));
    let before = two_member_raft_set();
    seed_raft_nodes(&daemon, &before);

    let hb = heartbeat(now_unix(), Vec::new(), true);
    let response = handle(&daemon, &hb);
    assert_eq!(response.status, 400);
    assert!(response.error_message().contains("Empty raft member set"));
    assert_eq!(daemon.db.node().unwrap().raft_nodes().unwrap(), before);
}

#[test]
fn partial_heartbeat_to_leader_is_refused() {
    let dir = TempDir::new().unwrap();
    // Local address matches the lowest-id voter: we lead.
    let daemon = clustered_daemon(&dir, "alpha", Some("10.0.0.1:8443"));
    seed_raft_nodes(&daemon, &two_member_raft_set());

    let hb = heartbeat(
        now_unix(),
        vec![
            (1, member("10.0.0.1:8443", "alpha", 1, RaftRole::Voter)),
            (2, member("10.0.0.2:8443", "beta", 2, RaftRole::Spare)),
        ],
        false,
    );
    let response = handle(&daemon, &hb);
    assert_eq!(response.status, 400);
    assert!(response.error_message().contains("Partial heartbeat"));
}

#[test]
fn partial_heartbeat_replaces_raft_nodes_on_non_leader() {
    let dir = TempDir::new().unwrap();
    let daemon = clustered_daemon(&dir, "beta", Some("10.0.0.2:8443"));
    seed_raft_nodes(&daemon, &two_member_raft_set());

    // Leader demoted beta to spare, promoted a third member.
    let hb = heartbeat(
        now_unix(),
        vec![
            (1, member("10.0.0.1:8443", "alpha", 1, RaftRole::Voter)),
            (3, member("10.0.0.3:8443", "gamma", 3, RaftRole::StandBy)),
        ],
        false,
    );
    let response = handle(&daemon, &hb);
    assert_eq!(response.status, 200);
    let nodes = daemon.db.node().unwrap().raft_nodes().unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[1].name, "gamma");
    assert_eq!(nodes[1].role, RaftRole::StandBy);
}

#[test]
fn time_skew_warning_created_once_and_resolved() {
    let dir = TempDir::new().unwrap();
    let daemon = clustered_daemon(&dir, "beta", Some("10.0.0.2:8443"));
    seed_raft_nodes(&daemon, &two_member_raft_set());
    let cluster = daemon.db.cluster().unwrap();

    let skewed = heartbeat(
        now_unix() + 10,
        vec![(1, member("10.0.0.1:8443", "alpha", 1, RaftRole::Voter))],
        false,
    );
    assert_eq!(handle(&daemon, &skewed).status, 200);
    // A second skewed heartbeat must not create another warning row.
    assert_eq!(handle(&daemon, &skewed).status, 200);

    let warnings: Vec<_> = cluster
        .warnings()
        .unwrap()
        .into_iter()
        .filter(|warning| warning.warning_type == WarningType::ClusterTimeSkew)
        .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].status, WarningStatus::New);

    let in_sync = heartbeat(
        now_unix(),
        vec![(1, member("10.0.0.1:8443", "alpha", 1, RaftRole::Voter))],
        false,
    );
    assert_eq!(handle(&daemon, &in_sync).status, 200);
    let warnings: Vec<_> = cluster
        .warnings()
        .unwrap()
        .into_iter()
        .filter(|warning| warning.warning_type == WarningType::ClusterTimeSkew)
        .collect();
    assert_eq!(warnings[0].status, WarningStatus::Resolved);
    assert_eq!(warnings.len(), 1);
}

struct FailingNetworks;

impl Networks for FailingNetworks {
    fn startup(&self) -> Result<(), NetworkError> {
        Ok(())
    }

    fn shutdown(&self) {}

    fn update_ovn_chassis(
        &self,
        _heartbeat: &ApiHeartbeat,
        _local_address: &str,
    ) -> Result<(), NetworkError> {
        Err(NetworkError::OvnChassis("chassis unreachable".into()))
    }
}

#[test]
fn refresh_keeps_old_snapshot_when_a_subtask_fails() {
    let dir = TempDir::new().unwrap();
    let daemon = clustered_daemon(&dir, "beta", Some("10.0.0.2:8443"));
    seed_raft_nodes(&daemon, &two_member_raft_set());

    let hb = heartbeat(
        now_unix(),
        vec![
            (1, member("10.0.0.1:8443", "alpha", 1, RaftRole::Voter)),
            (2, member("10.0.0.2:8443", "beta", 2, RaftRole::Spare)),
        ],
        true,
    );

    daemon.set_networks(Arc::new(FailingNetworks));
    heartbeat::node_refresh_task(&daemon, &hb, false, None);
    assert!(daemon.last_heartbeat_snapshot().is_none());

    daemon.set_networks(Arc::new(burrow::network::NullNetworks));
    heartbeat::node_refresh_task(&daemon, &hb, false, None);
    assert_eq!(daemon.last_heartbeat_snapshot(), Some(hb));
}
