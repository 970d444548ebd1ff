//! Tmpfs mounts the daemon maintains under its var directory.

use super::Daemon;
use log::{info, warn};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::path::Path;
use std::sync::atomic::Ordering;

fn is_mount_point(path: &Path) -> bool {
    let Ok(target) = std::fs::metadata(path) else {
        return false;
    };
    let Some(parent) = path.parent() else {
        return false;
    };
    let Ok(parent_meta) = std::fs::metadata(parent) else {
        return false;
    };
    use std::os::unix::fs::MetadataExt;
    target.dev() != parent_meta.dev()
}

fn mount_tmpfs(path: &Path, options: &str) -> Result<(), nix::errno::Errno> {
    mount(
        Some("tmpfs"),
        path,
        Some("tmpfs"),
        MsFlags::empty(),
        Some(options),
    )
}

impl Daemon {
    /// Mounts the shared-propagation tmpfs at `<var>/shmounts`. Guarded by a
    /// process-local flag plus the mount-point check, so it happens at most
    /// once per process and repeated calls are no-ops.
    pub(crate) fn setup_shared_mounts(&self) -> Result<(), nix::errno::Errno> {
        if self.shared_mounts_setup.load(Ordering::SeqCst) {
            return Ok(());
        }
        let path = self.os().var_path("shmounts");
        if is_mount_point(&path) {
            self.shared_mounts_setup.store(true, Ordering::SeqCst);
            return Ok(());
        }
        mount_tmpfs(&path, "size=100k,mode=0711")?;
        mount(
            Some(path.as_path()),
            path.as_path(),
            None::<&str>,
            MsFlags::MS_SHARED | MsFlags::MS_REC,
            None::<&str>,
        )?;
        self.shared_mounts_setup.store(true, Ordering::SeqCst);
        info!("event=shmounts_mounted path={}", path.display());
        Ok(())
    }

    /// Mounts the guest-api tmpfs; failures degrade guest features only.
    pub(crate) fn setup_guestapi_mount(&self) {
        let path = self.os().var_path("guestapi");
        if is_mount_point(&path) {
            return;
        }
        if let Err(err) = mount_tmpfs(&path, "size=100k,mode=0755") {
            warn!("event=guestapi_mount_failed error={err}");
        }
    }

    /// Lazily detaches both tmpfs mounts. Only called when no instances are
    /// left running.
    pub(crate) fn unmount_shared_mounts(&self) {
        for name in ["guestapi", "shmounts"] {
            let path = self.os().var_path(name);
            if let Err(err) = umount2(&path, MntFlags::MNT_DETACH) {
                if err != nix::errno::Errno::EINVAL && err != nix::errno::Errno::ENOENT {
                    warn!(
                        "event=shmounts_unmount_failed path={} error={err}",
                        path.display()
                    );
                }
            }
        }
        self.shared_mounts_setup.store(false, Ordering::SeqCst);
    }
}
