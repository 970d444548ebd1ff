//! Instance (container/VM) collaborator interface.
//!
//! Runtime drivers live outside the core. The lifecycle needs to load the
//! local instance set, restore or shut instances down in bulk, count what is
//! running, and fall back to on-disk enumeration when the cluster store is
//! unavailable.

use crate::db::ClusterDb;
use crate::os::Os;
use log::{info, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error(transparent)]
    Db(#[from] crate::db::DbError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("instance {0} failed to start")]
    StartFailed(String),
    #[error("instance {0} failed to stop")]
    StopFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub name: String,
    pub project: String,
    pub kind: String,
}

pub trait Instances: Send + Sync {
    fn start(&self, handle: &InstanceHandle) -> Result<(), InstanceError>;
    fn shutdown(&self, handle: &InstanceHandle) -> Result<(), InstanceError>;
    fn is_running(&self, handle: &InstanceHandle) -> bool;
    /// Registers instance devices for event delivery after a daemon restart.
    fn register_devices(&self, handles: &[InstanceHandle]);
}

/// Driver used when no runtime is wired in: nothing runs, every operation
/// succeeds.
pub struct NullInstances;

impl Instances for NullInstances {
    fn start(&self, _handle: &InstanceHandle) -> Result<(), InstanceError> {
        Ok(())
    }

    fn shutdown(&self, _handle: &InstanceHandle) -> Result<(), InstanceError> {
        Ok(())
    }

    fn is_running(&self, _handle: &InstanceHandle) -> bool {
        false
    }

    fn register_devices(&self, _handles: &[InstanceHandle]) {}
}

/// Loads the local member's instances from the cluster store.
pub fn load_local(cluster: &ClusterDb) -> Result<Vec<InstanceHandle>, InstanceError> {
    Ok(cluster
        .local_instances()?
        .into_iter()
        .map(|row| InstanceHandle {
            name: row.name,
            project: row.project,
            kind: row.kind,
        })
        .collect())
}

/// Fallback enumeration from `<var>/containers` when the store is gone.
pub fn on_disk(os: &Os) -> Result<Vec<InstanceHandle>, InstanceError> {
    let dir = os.var_path("containers");
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut handles = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            handles.push(InstanceHandle {
                name: entry.file_name().to_string_lossy().to_string(),
                project: "default".to_string(),
                kind: "container".to_string(),
            });
        }
    }
    Ok(handles)
}

pub fn start_all(driver: &dyn Instances, handles: &[InstanceHandle]) {
    for handle in handles {
        if driver.is_running(handle) {
            continue;
        }
        if let Err(err) = driver.start(handle) {
            warn!(
                "event=instance_start_failed instance={} project={} error={err}",
                handle.name, handle.project
            );
        }
    }
    if !handles.is_empty() {
        info!("event=instances_started count={}", handles.len());
    }
}

pub fn shutdown_all(driver: &dyn Instances, handles: &[InstanceHandle]) {
    for handle in handles {
        if !driver.is_running(handle) {
            continue;
        }
        if let Err(err) = driver.shutdown(handle) {
            warn!(
                "event=instance_stop_failed instance={} project={} error={err}",
                handle.name, handle.project
            );
        }
    }
}

pub fn count_running(driver: &dyn Instances, handles: &[InstanceHandle]) -> usize {
    handles
        .iter()
        .filter(|handle| driver.is_running(handle))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn on_disk_enumerates_directories_only() {
        let dir = TempDir::new().unwrap();
        let os = Os::new(dir.path(), true);
        std::fs::create_dir_all(os.var_path("containers").join("web1")).unwrap();
        std::fs::create_dir_all(os.var_path("containers").join("db1")).unwrap();
        std::fs::write(os.var_path("containers").join("stray.log"), b"x").unwrap();
        let mut found = on_disk(&os).unwrap();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "db1");
        assert_eq!(found[1].kind, "container");
    }

    #[test]
    fn null_driver_reports_nothing_running() {
        let driver = NullInstances;
        let handle = InstanceHandle {
            name: "c1".into(),
            project: "default".into(),
            kind: "container".into(),
        };
        assert!(!driver.is_running(&handle));
        assert_eq!(count_running(&driver, &[handle]), 0);
    }
}
