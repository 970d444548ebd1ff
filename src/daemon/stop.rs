//! Orderly shutdown with role handover, operation draining, storage
//! unmount and best-effort cleanup under bounded time budgets.
//!
//! No single failure aborts the remaining cleanup; errors are collected and
//! aggregated into one result.

use super::{Daemon, DaemonError, ShutdownSignal};
use crate::cancel::{Canceller, Latch};
use crate::cluster::membership;
use crate::instances;
use crate::timeouts::{STORAGE_UNMOUNT_CEILING, TASK_STOP_GRACE};
use log::{error, info, warn};
use std::sync::Arc;

impl Daemon {
    /// Stops the daemon. Safe to call twice: cancelling a cancelled token,
    /// closing a closed store and downing missing endpoints are all no-ops.
    pub fn stop(self: &Arc<Self>, signal: ShutdownSignal) -> Result<(), DaemonError> {
        info!("event=daemon_shutdown_begin signal={signal}");

        // Everyone watches this one token.
        self.shutdown.cancel();

        if let Some(gateway) = self.gateway() {
            self.stop_cluster_tasks();
            if let Err(err) = membership::handover_member_role(self) {
                // Killing the gateway forces a re-election elsewhere.
                warn!("event=role_handover_failed error={err}");
                gateway.kill();
            }
        }

        // Object-storage sidecars must stop before pools unmount.
        self.pools().stop_bucket_services();

        let mut instance_list = Vec::new();
        let mut instances_loaded = false;
        if let Some(cluster) = self.db.cluster() {
            match instances::load_local(&cluster) {
                Ok(list) => {
                    instance_list = list;
                    instances_loaded = true;
                }
                Err(err) => {
                    warn!("event=instance_load_fallback_disk error={err}");
                    instance_list = instances::on_disk(&self.os()).unwrap_or_else(|disk_err| {
                        warn!("event=instance_disk_enumeration_failed error={disk_err}");
                        Vec::new()
                    });
                    // The store is untrustworthy; make every later read fail
                    // fast and record it behind the single predicate.
                    if let Some(gateway) = self.gateway() {
                        gateway.kill();
                    }
                    cluster.close();
                    self.mark_cluster_db_dead();
                }
            }
        }

        if matches!(
            signal,
            ShutdownSignal::Terminate | ShutdownSignal::PowerFailure
        ) {
            if self.cluster_db_available() {
                let timeout = self.global_config_snapshot().shutdown_timeout();
                info!(
                    "event=operations_drain timeout_secs={} active={}",
                    timeout.as_secs(),
                    self.operations.count()
                );
                if !self.operations.drain(timeout, &Canceller::new()) {
                    warn!(
                        "event=operations_drain_timeout remaining={}",
                        self.operations.count()
                    );
                }
            }

            // Unmount daemon volumes with a hard ceiling in case the backing
            // store is unreachable.
            info!("event=daemon_storage_unmount");
            let done = Latch::new();
            let unmount_done = done.clone();
            let pools = self.pools();
            std::thread::spawn(move || {
                if let Err(err) = pools.daemon_storage_unmount() {
                    error!("event=daemon_storage_unmount_failed error={err}");
                }
                unmount_done.open();
            });
            if !done.wait_timeout(STORAGE_UNMOUNT_CEILING) {
                error!("event=daemon_storage_unmount_timeout");
            }

            if signal == ShutdownSignal::PowerFailure {
                let driver = self.instances();
                instances::shutdown_all(&*driver, &instance_list);

                info!("event=networks_shutdown");
                self.networks().shutdown();

                // Unmount every pool; one failure never skips the rest.
                info!("event=storage_pools_shutdown");
                let pools = self.pools();
                match pools.pool_names() {
                    Ok(names) => {
                        for name in names {
                            if let Err(err) = pools.unmount_pool(&name) {
                                error!(
                                    "event=pool_unmount_failed pool={name} error={err}"
                                );
                                continue;
                            }
                        }
                    }
                    Err(err) => error!("event=pool_list_failed error={err}"),
                }
            }
        }

        if let Some(gateway) = self.gateway() {
            gateway.kill();
        }

        let mut errors: Vec<String> = Vec::new();
        let mut track = |result: Result<(), String>, what: &str| {
            if let Err(err) = result {
                errors.push(format!("{what}: {err}"));
            }
        };

        track(
            self.tasks
                .lock()
                .stop(TASK_STOP_GRACE)
                .map_err(|err| err.to_string()),
            "stop tasks",
        );
        track(
            self.cluster_tasks
                .lock()
                .stop(TASK_STOP_GRACE)
                .map_err(|err| err.to_string()),
            "stop cluster tasks",
        );

        let running = instances::count_running(&*self.instances(), &instance_list);
        let should_unmount = instances_loaded && running == 0;

        if let Some(cluster) = self.db.cluster() {
            info!("event=global_db_close");
            cluster.close();
        }
        self.db.close();

        if let Some(gateway) = self.gateway() {
            track(
                gateway.shutdown_engine().map_err(|err| err.to_string()),
                "shutdown replication engine",
            );
        }

        if let Some(mut endpoints) = self.take_endpoints() {
            track(
                endpoints.down().map_err(|err| err.to_string()),
                "shutdown endpoints",
            );
        }

        if should_unmount && !self.os().mock_mode {
            info!("event=tmpfs_unmount");
            self.unmount_shared_mounts();
        } else {
            info!("event=tmpfs_unmount_skipped running_instances={running}");
        }

        track(
            self.stop_seccomp().map_err(|err| err.to_string()),
            "stop seccomp",
        );
        self.stop_subservers();

        let result = match errors.len() {
            0 => Ok(()),
            1 => Err(DaemonError::Other(errors.remove(0))),
            n => Err(DaemonError::Aggregate {
                first: errors.remove(0),
                extra: n - 1,
            }),
        };
        if let Err(err) = &result {
            error!("event=daemon_shutdown_unclean error={err}");
        } else {
            info!("event=daemon_shutdown_done");
        }
        result
    }
}
