//! Warning types persisted in the cluster store.

use serde::{Deserialize, Serialize};

/// Status of a persisted warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningStatus {
    New,
    Resolved,
}

impl WarningStatus {
    pub fn code(self) -> i64 {
        match self {
            WarningStatus::New => 1,
            WarningStatus::Resolved => 2,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            2 => WarningStatus::Resolved,
            _ => WarningStatus::New,
        }
    }
}

/// Kinds of warnings the core records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningType {
    ClusterTimeSkew,
    DeviceNodesUnavailable,
    MissingKernelFeature,
    UnableToConnectToMember,
    StoragePoolUnavailable,
    MemberVersionBehind,
}

impl WarningType {
    pub fn code(self) -> i64 {
        match self {
            WarningType::ClusterTimeSkew => 1,
            WarningType::DeviceNodesUnavailable => 2,
            WarningType::MissingKernelFeature => 3,
            WarningType::UnableToConnectToMember => 4,
            WarningType::StoragePoolUnavailable => 5,
            WarningType::MemberVersionBehind => 6,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(WarningType::ClusterTimeSkew),
            2 => Some(WarningType::DeviceNodesUnavailable),
            3 => Some(WarningType::MissingKernelFeature),
            4 => Some(WarningType::UnableToConnectToMember),
            5 => Some(WarningType::StoragePoolUnavailable),
            6 => Some(WarningType::MemberVersionBehind),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WarningType::ClusterTimeSkew => "cluster time skew",
            WarningType::DeviceNodesUnavailable => "device nodes unavailable",
            WarningType::MissingKernelFeature => "missing kernel feature",
            WarningType::UnableToConnectToMember => "unable to connect to member",
            WarningType::StoragePoolUnavailable => "storage pool unavailable",
            WarningType::MemberVersionBehind => "member version behind cluster",
        }
    }
}

/// A warning row as read back from the store.
#[derive(Debug, Clone)]
pub struct Warning {
    pub id: i64,
    pub warning_type: WarningType,
    pub status: WarningStatus,
    pub node: String,
    pub message: String,
    pub count: i64,
    pub last_seen_unix: i64,
}
