//! Centralized timeout and shutdown policies.
//!
//! Keeping these in one place makes it clear which parts of the daemon share
//! behaviour and gives a single knob to tighten or relax limits.

use std::time::Duration;

/// Grace period granted to a task group when asked to stop.
pub const TASK_STOP_GRACE: Duration = Duration::from_secs(3);
/// Hard ceiling on unmounting daemon storage volumes during shutdown.
pub const STORAGE_UNMOUNT_CEILING: Duration = Duration::from_secs(60);
/// Per-attempt timeout when opening the cluster database on a clustered member.
pub const CLUSTER_DB_TIMEOUT_CLUSTERED: Duration = Duration::from_secs(30);
/// Per-attempt timeout when opening the cluster database standalone. Higher
/// because no networking is involved and slow disks dominate.
pub const CLUSTER_DB_TIMEOUT_STANDALONE: Duration = Duration::from_secs(60);
/// Window within which a heartbeat timestamp is considered in sync.
pub const HEARTBEAT_SKEW_WINDOW: Duration = Duration::from_secs(5);
/// Read/write timeout applied to every HTTP listener stream.
pub const REQUEST_STREAM_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period granted to blocking listeners when asked to shut down.
pub const LISTENER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Dial timeout for intra-cluster HTTPS requests (heartbeats, notifications).
pub const CLUSTER_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
