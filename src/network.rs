//! Network and firewall collaborator interfaces.

use crate::cluster::heartbeat::ApiHeartbeat;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network {0} failed to start")]
    StartFailed(String),
    #[error("OVN chassis reconciliation failed: {0}")]
    OvnChassis(String),
}

pub trait Networks: Send + Sync {
    /// Brings managed networks up after the cluster config is loaded.
    fn startup(&self) -> Result<(), NetworkError>;

    /// Best-effort teardown during full shutdown.
    fn shutdown(&self);

    /// Reconciles OVN chassis assignments after a membership change.
    fn update_ovn_chassis(
        &self,
        heartbeat: &ApiHeartbeat,
        local_address: &str,
    ) -> Result<(), NetworkError>;
}

pub struct NullNetworks;

impl Networks for NullNetworks {
    fn startup(&self) -> Result<(), NetworkError> {
        Ok(())
    }

    fn shutdown(&self) {}

    fn update_ovn_chassis(
        &self,
        _heartbeat: &ApiHeartbeat,
        _local_address: &str,
    ) -> Result<(), NetworkError> {
        Ok(())
    }
}

/// Picks the firewall driver for this host. Driver bodies live outside the
/// core; the daemon only records which one is active.
pub fn load_firewall_driver() -> &'static str {
    if std::path::Path::new("/proc/net/nf_tables").exists() {
        "nftables"
    } else {
        "xtables"
    }
}
