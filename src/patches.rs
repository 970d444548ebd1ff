//! One-shot migration patches.
//!
//! Patches run at fixed points during init, are recorded in the node-local
//! store once applied, and never run twice. Fresh installs mark every known
//! patch as applied up front so legacy migrations are skipped entirely.

use crate::daemon::{Daemon, DaemonError};
use log::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStage {
    /// Before daemon storage volumes are mounted.
    PreDaemonStorage,
    /// After daemon storage volumes are mounted.
    PostDaemonStorage,
    /// After managed networks are up.
    PostNetworks,
}

pub struct Patch {
    pub name: &'static str,
    pub stage: PatchStage,
    pub run: fn(&Daemon) -> Result<(), DaemonError>,
}

fn patch_storage_create_backups_dir(daemon: &Daemon) -> Result<(), DaemonError> {
    let dir = daemon.os().var_path("backups");
    std::fs::create_dir_all(dir).map_err(DaemonError::Io)
}

fn patch_storage_create_images_dir(daemon: &Daemon) -> Result<(), DaemonError> {
    let dir = daemon.os().var_path("images");
    std::fs::create_dir_all(dir).map_err(DaemonError::Io)
}

fn patch_network_clear_stale_leases(daemon: &Daemon) -> Result<(), DaemonError> {
    let leases = daemon.os().var_path("networks");
    if leases.exists() {
        for entry in std::fs::read_dir(&leases).map_err(DaemonError::Io)? {
            let entry = entry.map_err(DaemonError::Io)?;
            let stale = entry.path().join("dnsmasq.leases.stale");
            let _ = std::fs::remove_file(stale);
        }
    }
    Ok(())
}

const PATCHES: &[Patch] = &[
    Patch {
        name: "storage_create_backups_dir",
        stage: PatchStage::PreDaemonStorage,
        run: patch_storage_create_backups_dir,
    },
    Patch {
        name: "storage_create_images_dir",
        stage: PatchStage::PostDaemonStorage,
        run: patch_storage_create_images_dir,
    },
    Patch {
        name: "network_clear_stale_leases",
        stage: PatchStage::PostNetworks,
        run: patch_network_clear_stale_leases,
    },
];

/// Names of every known patch; the fresh-install hook marks all of them
/// applied.
pub fn patch_names() -> Vec<&'static str> {
    PATCHES.iter().map(|patch| patch.name).collect()
}

/// Applies every pending patch of the given stage, in declaration order.
pub fn apply_stage(daemon: &Daemon, stage: PatchStage) -> Result<(), DaemonError> {
    let node_db = daemon.db.node()?;
    for patch in PATCHES.iter().filter(|patch| patch.stage == stage) {
        if node_db.patch_applied(patch.name)? {
            continue;
        }
        info!("event=patch_apply name={}", patch.name);
        (patch.run)(daemon)?;
        node_db.mark_patch_applied(patch.name)?;
    }
    Ok(())
}
