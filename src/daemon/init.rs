//! Daemon startup: an ordered, mostly non-restartable sequence. Each phase
//! is a barrier for the next; any error aborts init, triggers a best-effort
//! stop and surfaces to the caller.

use super::{Daemon, DaemonError, ShutdownSignal};
use crate::api::handlers;
use crate::cluster::gateway::EngineLogLevel;
use crate::cluster::{heartbeat, membership, Gateway};
use crate::config::LocalConfig;
use crate::db::{ClusterDb, NodeDb};
use crate::endpoints::{check_already_running, tls as endpoints_tls, Endpoints, EndpointsConfig};
use crate::instances;
use crate::network;
use crate::patches::{self, PatchStage};
use crate::security::certs::CertInfo;
use crate::subsys::{BgpServer, DnsServer, SeccompServer};
use crate::tasks;
use crate::timeouts::{
    CLUSTER_DB_TIMEOUT_CLUSTERED, CLUSTER_DB_TIMEOUT_STANDALONE, TASK_STOP_GRACE,
};
use log::{debug, error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "burrow-node".to_string())
}

impl Daemon {
    /// Starts the daemon. On failure everything brought up so far is torn
    /// down best-effort before the error is returned.
    pub fn start(self: &Arc<Self>) -> Result<(), DaemonError> {
        let result = self.init();
        if let Err(err) = &result {
            error!("event=daemon_start_failed error={err}");
            let _ = self.stop(ShutdownSignal::Interrupt);
        }
        result
    }

    fn init(self: &Arc<Self>) -> Result<(), DaemonError> {
        // Phase 1: baseline process state.
        self.record_start_time();
        self.set_authorizer("tls");
        std::env::set_var("LVM_SUPPRESS_FD_WARNINGS", "1");
        let mock = self.os().mock_mode;
        info!(
            "event=daemon_starting mode={} path={}",
            if mock { "mock" } else { "normal" },
            self.os().var_dir.display()
        );
        self.os().init_dirs()?;

        // Phase 2: refuse to start next to a live daemon.
        check_already_running(&self.unix_socket_path())?;

        // Phase 3: kernel feature probes; warnings only.
        {
            let mut os = self.os_mut();
            let warnings = os.probe();
            self.probe_warnings.lock().extend(warnings);
        }

        // Phase 4: file-descriptor headroom.
        self.os()
            .raise_file_limit()
            .map_err(|err| DaemonError::Os(format!("raising RLIMIT_NOFILE: {err}")))?;

        // Phase 5: node-local store; fresh installs skip legacy patches.
        info!("event=local_db_init");
        let node_db = Arc::new(NodeDb::open(&self.os().database_dir(), |db| {
            for name in patches::patch_names() {
                db.mark_patch_applied(name)?;
            }
            Ok(())
        })?);
        self.db.set_node(node_db.clone());

        // Phase 6: identities and the local trust table, before any listener.
        let var_dir = self.os().var_dir.clone();
        let network_cert = Arc::new(CertInfo::load_or_generate(
            &var_dir,
            "cluster",
            &local_hostname(),
        )?);
        let server_cert = Arc::new(CertInfo::load_or_generate(
            &var_dir,
            "server",
            &local_hostname(),
        )?);
        self.set_network_cert(network_cert.clone());
        let ca_bundle = endpoints_tls::TrustedCaBundle::load(&var_dir.join("ca.crt"))?.map(Arc::new);
        if ca_bundle.is_some() {
            info!("event=ca_bundle_loaded path={}", var_dir.join("ca.crt").display());
        }
        self.update_certificate_cache_from_local()?;

        // Phase 7: effective client certificate for intra-cluster calls.
        let local_config = LocalConfig::from_values(node_db.config_load()?);
        let cluster_address = local_config.cluster_address();
        let clustered = node_db.is_clustered(cluster_address.as_deref())?;
        let trust = self.client_certs.snapshot();
        let has_server_trust = trust
            .kind(crate::security::cache::CertKind::Server)
            .map(|entries| !entries.is_empty())
            .unwrap_or(false);
        if clustered && !has_server_trust {
            warn!(
                "event=client_cert_fallback fingerprint={}",
                network_cert.fingerprint()
            );
            self.set_server_cert(network_cert.clone());
        } else {
            info!(
                "event=client_cert_selected fingerprint={}",
                server_cert.fingerprint()
            );
            self.set_server_cert(server_cert.clone());
        }

        // Phase 8: cluster gateway with the heartbeat hook installed.
        let engine_log_level = if self.config.traces("raft") {
            EngineLogLevel::Trace
        } else {
            EngineLogLevel::Error
        };
        let gateway = Arc::new(Gateway::new(
            self.shutdown.clone(),
            node_db.clone(),
            self.config.raft_latency,
            engine_log_level,
        ));
        gateway.set_local_address(cluster_address.clone());
        let hook_daemon = Arc::downgrade(self);
        gateway.set_heartbeat_hook(Arc::new(move |hb, is_leader, unavailable| {
            if let Some(daemon) = hook_daemon.upgrade() {
                heartbeat::node_refresh_task(&daemon, hb, is_leader, unavailable);
            }
        }));
        self.set_gateway(gateway.clone());

        // Phase 9: nice-to-have tmpfs mounts.
        if !mock {
            if let Err(err) = self.setup_shared_mounts() {
                warn!("event=shmounts_setup_failed error={err}");
            }
            self.setup_guestapi_mount();
        }

        // Phase 10: node-local configuration.
        info!("event=local_config_loaded");
        self.set_local_config(local_config.clone());
        if std::env::var("LISTEN_PID").is_ok() {
            self.systemd_socket_activated.store(true, Ordering::SeqCst);
        }

        // Phase 11: listeners, gated on the setup latch by the router.
        self.set_router(Arc::new(handlers::router()));
        let endpoints_config = EndpointsConfig {
            unix_socket: self.unix_socket_path(),
            unix_group: self.config.group.clone(),
            guest_socket: self.os().var_path("guestapi").join("sock"),
            network_address: local_config.https_address(),
            debug_address: local_config.debug_address(),
            ca_bundle,
            vsock_support: false,
        };
        let endpoints = Endpoints::up(self, endpoints_config, network_cert.clone())?;
        self.set_endpoints(endpoints);

        // Phase 12: cluster store, waiting out schema-behind members.
        self.open_cluster_db(&gateway, clustered, cluster_address.as_deref())?;

        // Phase 13: firewall driver, then upgrade notification (best effort).
        let firewall = network::load_firewall_driver();
        self.set_firewall_driver(firewall);
        info!("event=firewall_loaded driver={firewall}");
        if clustered {
            if let Err(err) = membership::notify_upgrade_completed(self) {
                warn!("event=upgrade_notify_failed error={err}");
            }
        }

        // Phase 14: legacy directory layout migration.
        self.migrate_legacy_instances_dir()?;

        // Phase 15: cluster-wide configuration and the local member name.
        self.reload_cluster_config()?;

        // Phase 16: storage pools, daemon storage and the patches around it.
        info!("event=storage_init");
        self.pools().startup()?;
        patches::apply_stage(self, PatchStage::PreDaemonStorage)?;
        self.pools().daemon_storage_mount()?;
        self.os().init_storage_dirs()?;
        patches::apply_stage(self, PatchStage::PostDaemonStorage)?;
        self.reload_cluster_config()?;

        // Phase 17: optional sub-servers from configuration.
        self.apply_config_subservers(&gateway)?;

        // Phase 18: networks, their patches, image pruning.
        info!("event=network_init");
        self.networks().startup()?;
        patches::apply_stage(self, PatchStage::PostNetworks)?;
        debug!("event=prune_leftover_images");

        // Phase 19: runtime wiring that only matters outside mock mode.
        let mut local_instances = Vec::new();
        if !mock {
            debug!("event=device_scheduler_start");
            let monitor_dir = std::env::var("BURROW_DEVMONITOR_DIR")
                .ok()
                .filter(|dir| !dir.is_empty())
                .unwrap_or_else(|| "/dev".to_string());
            info!("event=device_monitor_start dir={monitor_dir}");

            if let Some(cluster) = self.db.cluster() {
                local_instances = instances::load_local(&cluster)?;
            }
            self.instances().register_devices(&local_instances);

            if self.os().features.seccomp_listener {
                let socket = self.os().var_path("seccomp.socket");
                self.set_seccomp(Some(SeccompServer::start(&socket)?));
            }
            self.update_certificate_cache();
        }

        // Phase 20: instance readiness is unknown after a restart.
        if let Some(cluster) = self.db.cluster() {
            cluster.clear_local_instance_ready_state()?;
        }

        // Phase 21: request admission opens here.
        self.setup.open();

        // Phase 22: persist probe warnings, resolve stale ones.
        self.flush_probe_warnings();

        // Phase 23: cluster-only background tasks.
        if clustered {
            self.start_cluster_tasks();
        }

        // Phase 24: general background tasks.
        if !mock {
            self.register_general_tasks();
        }
        self.tasks.lock().start(&self.shutdown);

        // Phase 25: restore instances unless this member is evacuated.
        let evacuated = match self.db.cluster() {
            Some(cluster) => cluster.local_member_evacuated()?,
            None => false,
        };
        if !evacuated {
            instances::start_all(&*self.instances(), &local_instances);
        }

        // Phase 26: device rebalance after possible config drift.
        debug!("event=device_task_balance");

        // Phase 27: fully live.
        self.ready.open();
        info!("event=daemon_started");
        Ok(())
    }

    /// Opens the cluster store, looping through the wait-for-upgrade detour
    /// while other members still run an older schema. This is the one place
    /// where a task (the temporary heartbeat) legitimately starts before the
    /// setup latch opens; it is torn down in the same iteration.
    fn open_cluster_db(
        self: &Arc<Self>,
        gateway: &Arc<Gateway>,
        clustered: bool,
        cluster_address: Option<&str>,
    ) -> Result<(), DaemonError> {
        let member_name = local_hostname();
        let deadline = Instant::now() + self.config.cluster_db_setup_timeout;
        let attempt_timeout = if clustered {
            CLUSTER_DB_TIMEOUT_CLUSTERED
        } else {
            CLUSTER_DB_TIMEOUT_STANDALONE
        };
        loop {
            info!("event=global_db_init");
            match ClusterDb::open(
                &self.os().database_dir(),
                &member_name,
                cluster_address,
                gateway.kill_handle(),
            ) {
                Ok(cluster) => {
                    let cluster = Arc::new(cluster);
                    self.db.set_cluster(Some(cluster.clone()));
                    gateway.set_cluster(Some(cluster));
                    info!("event=global_db_ready");
                    return Ok(());
                }
                Err(err) if err.is_members_behind() => {
                    warn!("event=global_db_waiting_for_upgrades");
                    // Keep beating while we wait, in case we lead the raft
                    // set; stop the temporary group before retrying.
                    let mut heartbeat_group = tasks::Group::new();
                    let hb_daemon = self.clone();
                    heartbeat_group.add(
                        "cluster_heartbeat",
                        gateway.heartbeat_interval(),
                        move |cancel| heartbeat::heartbeat_round(&hb_daemon, cancel),
                    );
                    heartbeat_group.start(&self.shutdown);
                    let _ = gateway.wait_upgrade_notification(attempt_timeout);
                    let _ = heartbeat_group.stop(Duration::from_secs(1));

                    if self.shutdown.is_cancelled() {
                        return Err(DaemonError::Other(
                            "shutdown requested during cluster database bring-up".to_string(),
                        ));
                    }
                    if Instant::now() >= deadline {
                        return Err(DaemonError::ClusterDbTimeout);
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Early releases kept instances under `<var>/burrows`; rename to the
    /// current layout and restart anything affected, synchronously.
    fn migrate_legacy_instances_dir(self: &Arc<Self>) -> Result<(), DaemonError> {
        let legacy = self.os().var_path("burrows");
        if !legacy.exists() {
            return Ok(());
        }
        let target = self.os().var_path("containers");
        let _ = std::fs::remove_dir(&target);
        std::fs::rename(&legacy, &target)?;
        debug!("event=legacy_dir_renamed from=burrows to=containers");

        let Some(cluster) = self.db.cluster() else {
            return Ok(());
        };
        let handles = instances::load_local(&cluster)?;
        let driver = self.instances();
        instances::shutdown_all(&*driver, &handles);
        instances::start_all(&*driver, &handles);
        Ok(())
    }

    /// Loads cluster config and the local member name under the config lock.
    /// Called again after patches in case they changed either.
    fn reload_cluster_config(&self) -> Result<(), DaemonError> {
        let Some(cluster) = self.db.cluster() else {
            return Ok(());
        };
        let values = cluster.config_load()?;
        let global = crate::config::GlobalConfig::from_values(values);
        self.set_global_config(global, cluster.member_name().to_string());
        Ok(())
    }

    /// Applies the optional sub-servers configuration drives: Loki, syslog,
    /// OIDC, BGP, DNS and the tertiary listeners.
    fn apply_config_subservers(self: &Arc<Self>, gateway: &Arc<Gateway>) -> Result<(), DaemonError> {
        let global = self.global_config_snapshot();
        let local = self.local_config_snapshot();

        gateway.set_offline_threshold(global.offline_threshold());

        self.setup_loki(global.loki());
        self.setup_syslog_socket(local.syslog_socket());
        self.setup_oidc(global.oidc());

        let bgp_asn = global.bgp_asn();
        if let (Some(address), Some(router_id)) = (local.bgp_address(), local.bgp_router_id()) {
            if bgp_asn != 0 {
                self.set_bgp(Some(BgpServer::start(address, bgp_asn, router_id)));
            }
        }
        if let Some(address) = local.dns_address() {
            self.set_dns(Some(DnsServer::start(address)));
        }

        if let Some(address) = local.metrics_address() {
            let daemon = self.clone();
            self.with_endpoints(|endpoints| endpoints.up_metrics(&daemon, &address))
                .transpose()?;
        }
        if let Some(address) = local.storage_buckets_address() {
            let daemon = self.clone();
            self.with_endpoints(|endpoints| endpoints.up_storage_buckets(&daemon, &address))
                .transpose()?;
        }

        if let Some(scriptlet) = global.instances_placement_scriptlet() {
            debug!("event=placement_scriptlet_loaded bytes={}", scriptlet.len());
        }
        Ok(())
    }

    /// Persists warnings collected before the store was open and resolves
    /// any local warnings predating this start.
    fn flush_probe_warnings(&self) {
        let Some(cluster) = self.db.cluster() else {
            return;
        };
        for warning in self.probe_warnings.lock().drain(..) {
            if let Err(err) = cluster.upsert_warning_local(warning.warning_type, &warning.message)
            {
                warn!("event=warning_persist_failed error={err}");
            }
        }
        if let Some(start) = self.start_time() {
            if let Err(err) = cluster.resolve_warnings_older_than(start) {
                warn!("event=warning_resolve_failed error={err}");
            }
        }
    }

    pub(crate) fn start_cluster_tasks(self: &Arc<Self>) {
        let mut group = self.cluster_tasks.lock();

        let hb_daemon = self.clone();
        let interval = self
            .gateway()
            .map(|gateway| gateway.heartbeat_interval())
            .unwrap_or(Duration::from_secs(10));
        group.add("cluster_heartbeat", interval, move |cancel| {
            heartbeat::heartbeat_round(&hb_daemon, cancel);
        });

        group.add("images_sync", Duration::from_secs(3600), |_| {
            debug!("event=task_run name=images_sync");
        });

        let orphan_daemon = self.clone();
        group.add(
            "operations_cleanup",
            Duration::from_secs(3600),
            move |_| {
                debug!(
                    "event=task_run name=operations_cleanup active={}",
                    orphan_daemon.operations.count()
                );
            },
        );

        group.add("cluster_heal", Duration::from_secs(60), |_| {
            debug!("event=task_run name=cluster_heal");
        });

        group.start(&self.shutdown);
    }

    pub(crate) fn stop_cluster_tasks(&self) {
        let mut group = self.cluster_tasks.lock();
        let _ = group.stop(TASK_STOP_GRACE);
        // The group is replaced wholesale so it can be restarted fresh.
        *group = tasks::Group::new();
    }

    fn register_general_tasks(self: &Arc<Self>) {
        let mut group = self.tasks.lock();
        let day = Duration::from_secs(24 * 3600);
        let hour = Duration::from_secs(3600);

        group.add("logs_expire", day, |_| {
            debug!("event=task_run name=logs_expire");
        });
        group.add("images_prune", day, |_| {
            debug!("event=task_run name=images_prune");
        });
        group.add("backups_prune", hour, |_| {
            debug!("event=task_run name=backups_prune");
        });
        group.add("instance_snapshots", Duration::from_secs(60), |_| {
            debug!("event=task_run name=instance_snapshots");
        });
        group.add("volume_snapshots", Duration::from_secs(60), |_| {
            debug!("event=task_run name=volume_snapshots");
        });

        let warnings_daemon = self.clone();
        group.add("warnings_prune", day, move |_| {
            debug!("event=task_run name=warnings_prune");
            let _ = warnings_daemon.db.cluster();
        });

        let renew_daemon = Arc::downgrade(self);
        group.add("certificate_renewal", day, move |_| {
            if let Some(daemon) = renew_daemon.upgrade() {
                daemon.maybe_renew_server_cert();
            }
        });

        group.add("tokens_expire", hour, |_| {
            debug!("event=task_run name=tokens_expire");
        });
    }

    /// Regenerates the per-server certificate when it nears expiry and swaps
    /// it in atomically through the accessor.
    pub(crate) fn maybe_renew_server_cert(&self) {
        const RENEW_WINDOW_SECS: i64 = 30 * 24 * 3600;
        let Some(current) = self.server_cert() else {
            return;
        };
        match current.seconds_until_expiry() {
            Some(remaining) if remaining < RENEW_WINDOW_SECS => {
                let var_dir = self.os().var_dir.clone();
                let _ = std::fs::remove_file(var_dir.join("server.crt"));
                let _ = std::fs::remove_file(var_dir.join("server.key"));
                match CertInfo::load_or_generate(&var_dir, "server", &local_hostname()) {
                    Ok(renewed) => {
                        info!(
                            "event=server_cert_renewed fingerprint={}",
                            renewed.fingerprint()
                        );
                        self.set_server_cert(Arc::new(renewed));
                    }
                    Err(err) => warn!("event=server_cert_renewal_failed error={err}"),
                }
            }
            _ => {}
        }
    }
}
