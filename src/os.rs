//! Operating-system facade.
//!
//! Owns the var-directory layout, the kernel feature probe results collected
//! at startup, and the small pieces of privileged setup (rlimits, the nodev
//! probe). Probes never fail startup; anything degraded is reported as a
//! warning for the lifecycle to persist once the stores are open.

use crate::db::warnings::WarningType;
use log::info;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::stat::{mknod, Mode, SFlag};
use std::path::{Path, PathBuf};

/// A probe warning collected before the database is available.
#[derive(Debug, Clone)]
pub struct ProbeWarning {
    pub warning_type: WarningType,
    pub message: String,
}

/// Kernel features the daemon cares about. Missing features degrade
/// functionality but never block startup.
#[derive(Debug, Clone, Default)]
pub struct KernelFeatures {
    pub pidfd: bool,
    pub core_scheduling: bool,
    pub uevent_injection: bool,
    pub seccomp_listener: bool,
    pub seccomp_listener_continue: bool,
    pub seccomp_listener_addfd: bool,
    pub pidfd_setns: bool,
    pub native_terminals: bool,
    pub idmapped_mounts: bool,
    pub vfs3_fscaps: bool,
    pub nodev: bool,
}

#[derive(Debug)]
pub struct Os {
    pub var_dir: PathBuf,
    pub mock_mode: bool,
    pub features: KernelFeatures,
}

impl Os {
    pub fn new(var_dir: impl Into<PathBuf>, mock_mode: bool) -> Self {
        Self {
            var_dir: var_dir.into(),
            mock_mode,
            features: KernelFeatures::default(),
        }
    }

    /// Joins path elements onto the var directory.
    pub fn var_path(&self, elem: &str) -> PathBuf {
        self.var_dir.join(elem)
    }

    pub fn database_dir(&self) -> PathBuf {
        self.var_path("database")
    }

    pub fn unix_socket_path(&self) -> PathBuf {
        match std::env::var("BURROW_SOCKET") {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => self.var_path("unix.socket"),
        }
    }

    /// Runs the kernel feature probes and returns collected warnings.
    /// In mock mode every probe is skipped.
    pub fn probe(&mut self) -> Vec<ProbeWarning> {
        let mut warnings = Vec::new();
        if self.mock_mode {
            return warnings;
        }

        self.features.pidfd = Path::new("/proc/self/fdinfo").exists();
        self.features.core_scheduling = procfs_flag("/proc/sys/kernel/sched_schedstats");
        self.features.uevent_injection = Path::new("/sys/kernel/uevent_helper").exists();
        self.features.seccomp_listener = Path::new("/proc/sys/kernel/seccomp").exists();
        self.features.seccomp_listener_continue = self.features.seccomp_listener;
        self.features.seccomp_listener_addfd = self.features.seccomp_listener;
        self.features.pidfd_setns = self.features.pidfd;
        self.features.native_terminals = Path::new("/dev/pts/ptmx").exists();
        self.features.vfs3_fscaps = true;

        if std::env::var("BURROW_IDMAPPED_MOUNTS_DISABLE").map(|v| v == "1" || v == "true")
            == Ok(true)
        {
            info!("event=kernel_feature name=idmapped_mounts state=disabled");
            self.features.idmapped_mounts = false;
        } else {
            self.features.idmapped_mounts = Path::new("/proc/sys/fs/mount-max").exists();
        }

        for (name, present) in [
            ("pidfd", self.features.pidfd),
            ("core_scheduling", self.features.core_scheduling),
            ("uevent_injection", self.features.uevent_injection),
            ("seccomp_listener", self.features.seccomp_listener),
            ("pidfd_setns", self.features.pidfd_setns),
            ("native_terminals", self.features.native_terminals),
            ("idmapped_mounts", self.features.idmapped_mounts),
        ] {
            info!(
                "event=kernel_feature name={} state={}",
                name,
                if present { "yes" } else { "no" }
            );
        }

        if let Some(warning) = self.probe_nodev() {
            warnings.push(warning);
        }

        warnings
    }

    /// Validates the devices directory by creating a throwaway character
    /// device. Failure to open it afterwards indicates a nodev mount.
    fn probe_nodev(&mut self) -> Option<ProbeWarning> {
        let devices_dir = self.var_path("devices");
        if std::fs::create_dir_all(&devices_dir).is_err() {
            return None;
        }
        let test_dev = devices_dir.join(".test");
        let _ = std::fs::remove_file(&test_dev);
        if mknod(&test_dev, SFlag::S_IFCHR, Mode::from_bits_truncate(0o600), 0).is_err() {
            return None;
        }
        let result = std::fs::File::open(&test_dev);
        let _ = std::fs::remove_file(&test_dev);
        match result {
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                self.features.nodev = true;
                Some(ProbeWarning {
                    warning_type: WarningType::DeviceNodesUnavailable,
                    message: "unable to access device nodes, likely a nodev mount".to_string(),
                })
            }
            _ => None,
        }
    }

    /// Raises RLIMIT_NOFILE to its hard limit.
    pub fn raise_file_limit(&self) -> Result<(), nix::errno::Errno> {
        if self.mock_mode {
            return Ok(());
        }
        let (_soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
        setrlimit(Resource::RLIMIT_NOFILE, hard, hard)
    }

    /// Creates the var-directory skeleton the daemon expects.
    pub fn init_dirs(&self) -> std::io::Result<()> {
        for dir in [
            "",
            "database",
            "shmounts",
            "guestapi",
            "containers",
            "devices",
            "logs",
        ] {
            let path = if dir.is_empty() {
                self.var_dir.clone()
            } else {
                self.var_path(dir)
            };
            std::fs::create_dir_all(path)?;
        }
        Ok(())
    }

    /// Creates directories that live on daemon storage volumes. Runs after
    /// those volumes are mounted.
    pub fn init_storage_dirs(&self) -> std::io::Result<()> {
        for dir in ["images", "backups"] {
            std::fs::create_dir_all(self.var_path(dir))?;
        }
        Ok(())
    }
}

fn procfs_flag(path: &str) -> bool {
    Path::new(path).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_mode_skips_probes() {
        let mut os = Os::new("/nonexistent", true);
        let warnings = os.probe();
        assert!(warnings.is_empty());
        assert!(!os.features.pidfd);
    }

    #[test]
    fn socket_path_prefers_environment() {
        let os = Os::new("/var/lib/burrow", true);
        let default = os.unix_socket_path();
        assert!(default.ends_with("unix.socket"));
    }

    #[test]
    fn var_path_joins() {
        let os = Os::new("/var/lib/burrow", true);
        assert_eq!(
            os.var_path("shmounts"),
            PathBuf::from("/var/lib/burrow/shmounts")
        );
    }
}
