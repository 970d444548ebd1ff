//! Storage-pool collaborator interface.
//!
//! Pool drivers live outside the core; the daemon only needs the lifecycle
//! surface below. The null driver keeps a standalone daemon fully
//! functional with no pools configured.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage pool {0} failed to start")]
    PoolStartFailed(String),
    #[error("storage pool {0} failed to unmount")]
    PoolUnmountFailed(String),
    #[error("daemon storage volume error: {0}")]
    DaemonVolume(String),
}

/// What the lifecycle needs from the pool subsystem.
pub trait Pools: Send + Sync {
    /// Brings every configured pool up. Run early in init.
    fn startup(&self) -> Result<(), StorageError>;

    /// Mounts daemon-owned volumes (image and backup storage).
    fn daemon_storage_mount(&self) -> Result<(), StorageError>;

    /// Unmounts daemon-owned volumes; bounded by the shutdown ceiling.
    fn daemon_storage_unmount(&self) -> Result<(), StorageError>;

    fn pool_names(&self) -> Result<Vec<String>, StorageError>;

    fn unmount_pool(&self, name: &str) -> Result<(), StorageError>;

    /// Stops any object-storage sidecar processes serving buckets.
    fn stop_bucket_services(&self);
}

/// No pools configured.
pub struct NullPools;

impl Pools for NullPools {
    fn startup(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn daemon_storage_mount(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn daemon_storage_unmount(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn pool_names(&self) -> Result<Vec<String>, StorageError> {
        Ok(Vec::new())
    }

    fn unmount_pool(&self, _name: &str) -> Result<(), StorageError> {
        Ok(())
    }

    fn stop_bucket_services(&self) {}
}
