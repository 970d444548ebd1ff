//! Thin layer over the node-local and replicated SQL stores.
//!
//! Both stores are SQLite files under `<var>/database/`. The node store is
//! always plain local SQLite; the cluster store is the replicated database
//! surfaced by the gateway's embedded engine. Accessors hand out `Arc`
//! handles so callers never observe a half-closed connection.

pub mod cluster;
pub mod node;
pub mod warnings;

pub use cluster::{ClusterDb, DbCertificate, MemberInfo};
pub use node::{NodeDb, RaftNode, RaftRole};

use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// Schema version of the cluster database this build understands.
pub const CLUSTER_SCHEMA_VERSION: i64 = 21;
/// Number of API extensions this build ships.
pub const API_EXTENSIONS: i64 = 12;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database is closed")]
    Closed,
    #[error("cluster database is not available")]
    Unavailable,
    #[error("some cluster members have not been upgraded yet")]
    SomeMembersBehind,
    #[error("local member not found in cluster database")]
    LocalMemberMissing,
}

impl DbError {
    /// True when the error is the schema-behind condition that triggers the
    /// bounded wait-for-upgrade detour during startup.
    pub fn is_members_behind(&self) -> bool {
        matches!(self, DbError::SomeMembersBehind)
    }
}

/// Shared handle bundling the two stores.
#[derive(Default)]
pub struct Db {
    node: RwLock<Option<Arc<NodeDb>>>,
    cluster: RwLock<Option<Arc<ClusterDb>>>,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_node(&self, node: Arc<NodeDb>) {
        *self.node.write() = Some(node);
    }

    pub fn node(&self) -> Result<Arc<NodeDb>, DbError> {
        self.node.read().clone().ok_or(DbError::Closed)
    }

    pub fn set_cluster(&self, cluster: Option<Arc<ClusterDb>>) {
        *self.cluster.write() = cluster;
    }

    /// The cluster store, if it has been opened and not torn down.
    pub fn cluster(&self) -> Option<Arc<ClusterDb>> {
        self.cluster.read().clone()
    }

    pub fn close(&self) {
        if let Some(cluster) = self.cluster.write().take() {
            cluster.close();
        }
        if let Some(node) = self.node.write().take() {
            node.close();
        }
    }
}
