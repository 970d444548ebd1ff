//! Clustering: the replicated-store gateway, heartbeats and membership
//! operations.

pub mod gateway;
pub mod heartbeat;
pub mod membership;

pub use gateway::Gateway;
pub use heartbeat::{ApiHeartbeat, HeartbeatMember, HeartbeatVersion};

use crate::db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("this member is not the leader")]
    NotLeader,
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("cluster database is not open")]
    ClusterDbUnavailable,
    #[error("no cluster address configured")]
    NoClusterAddress,
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClusterError {
    /// Losing leadership mid-operation is routine and callers treat it as
    /// benign.
    pub fn is_not_leader(&self) -> bool {
        matches!(self, ClusterError::NotLeader)
    }
}
