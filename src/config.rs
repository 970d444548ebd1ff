//! Daemon, cluster-wide and node-local configuration records.
//!
//! The cluster-wide and node-local records are key/value maps persisted in
//! the stores. Readers always work against a snapshot taken under the
//! daemon's config lock; nothing here is shared mutable state.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Process-level knobs handed to `Daemon::new`.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Group name the local unix socket is chown'ed to.
    pub group: Option<String>,
    /// Sub-systems to trace (e.g. "raft", "database").
    pub trace: Vec<String>,
    /// Coarse measure of expected cluster latency, in multiples of the base.
    pub raft_latency: f64,
    /// How long to keep retrying the cluster database bring-up.
    pub cluster_db_setup_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            group: None,
            trace: Vec::new(),
            raft_latency: 3.0,
            // Generous to absorb package-manager refresh lag on peers.
            cluster_db_setup_timeout: Duration::from_secs(36 * 60 * 60),
        }
    }
}

impl DaemonConfig {
    pub fn traces(&self, subsystem: &str) -> bool {
        self.trace.iter().any(|entry| entry == subsystem)
    }
}

/// Cluster-wide configuration snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalConfig {
    values: HashMap<String, String>,
}

impl GlobalConfig {
    pub fn from_values(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }

    fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some("true") | Some("1") | Some("yes"))
    }

    /// Seconds without a heartbeat after which a member counts as offline.
    pub fn offline_threshold(&self) -> Duration {
        Duration::from_secs(self.get_u64("cluster.offline_threshold", 20))
    }

    pub fn max_voters(&self) -> u64 {
        self.get_u64("cluster.max_voters", 3)
    }

    pub fn max_standby(&self) -> u64 {
        self.get_u64("cluster.max_standby", 2)
    }

    /// Bound on draining in-flight operations during shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.get_u64("core.shutdown_timeout", 5) * 60)
    }

    pub fn trust_ca_certificates(&self) -> bool {
        self.get_bool("core.trust_ca_certificates")
    }

    pub fn oidc(&self) -> Option<OidcConfig> {
        let issuer = self.get("oidc.issuer")?.to_string();
        let client_id = self.get("oidc.client_id")?.to_string();
        if issuer.is_empty() || client_id.is_empty() {
            return None;
        }
        Some(OidcConfig {
            issuer,
            client_id,
            audience: self.get("oidc.audience").map(str::to_string),
        })
    }

    pub fn loki(&self) -> Option<LokiConfig> {
        let url = self.get("loki.api.url")?.to_string();
        url::Url::parse(&url).ok()?;
        let log_level = self.get("loki.loglevel").unwrap_or("info").to_string();
        let types: Vec<String> = self
            .get("loki.types")
            .unwrap_or("lifecycle,logging")
            .split(',')
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect();
        if url.is_empty() || log_level.is_empty() || types.is_empty() {
            return None;
        }
        Some(LokiConfig {
            url,
            log_level,
            types,
            labels: self
                .get("loki.labels")
                .map(|raw| raw.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }

    pub fn bgp_asn(&self) -> u32 {
        self.get_u64("core.bgp_asn", 0) as u32
    }

    pub fn instances_placement_scriptlet(&self) -> Option<&str> {
        self.get("instances.placement.scriptlet")
            .filter(|value| !value.is_empty())
    }

    pub fn dump(&self) -> HashMap<String, String> {
        self.values.clone()
    }
}

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub issuer: String,
    pub client_id: String,
    pub audience: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LokiConfig {
    pub url: String,
    pub log_level: String,
    pub types: Vec<String>,
    pub labels: Vec<String>,
}

/// Node-local configuration snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LocalConfig {
    values: HashMap<String, String>,
}

impl LocalConfig {
    pub fn from_values(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    fn address(&self, key: &str) -> Option<String> {
        self.values
            .get(key)
            .filter(|value| !value.is_empty())
            .cloned()
    }

    pub fn https_address(&self) -> Option<String> {
        self.address("core.https_address")
    }

    pub fn cluster_address(&self) -> Option<String> {
        self.address("cluster.https_address")
    }

    pub fn debug_address(&self) -> Option<String> {
        self.address("core.debug_address")
    }

    pub fn metrics_address(&self) -> Option<String> {
        self.address("core.metrics_address")
    }

    pub fn storage_buckets_address(&self) -> Option<String> {
        self.address("core.storage_buckets_address")
    }

    pub fn bgp_address(&self) -> Option<String> {
        self.address("core.bgp_address")
    }

    pub fn bgp_router_id(&self) -> Option<String> {
        self.address("core.bgp_router_id")
    }

    pub fn dns_address(&self) -> Option<String> {
        self.address("core.dns_address")
    }

    pub fn syslog_socket(&self) -> bool {
        matches!(
            self.values.get("core.syslog_socket").map(String::as_str),
            Some("true") | Some("1")
        )
    }

    pub fn dump(&self) -> HashMap<String, String> {
        self.values.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global(pairs: &[(&str, &str)]) -> GlobalConfig {
        GlobalConfig::from_values(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn defaults_apply_when_keys_missing() {
        let config = global(&[]);
        assert_eq!(config.max_voters(), 3);
        assert_eq!(config.max_standby(), 2);
        assert_eq!(config.offline_threshold(), Duration::from_secs(20));
        assert!(config.oidc().is_none());
        assert!(config.loki().is_none());
    }

    #[test]
    fn loki_requires_a_parseable_url() {
        let config = global(&[("loki.api.url", "not a url")]);
        assert!(config.loki().is_none());
        let config = global(&[("loki.api.url", "https://loki.example:3100")]);
        let loki = config.loki().unwrap();
        assert_eq!(loki.log_level, "info");
        assert_eq!(loki.types.len(), 2);
    }

    #[test]
    fn oidc_requires_issuer_and_client() {
        let config = global(&[("oidc.issuer", "https://issuer.example")]);
        assert!(config.oidc().is_none());
        let config = global(&[
            ("oidc.issuer", "https://issuer.example"),
            ("oidc.client_id", "burrow"),
        ]);
        let oidc = config.oidc().unwrap();
        assert_eq!(oidc.client_id, "burrow");
    }

    #[test]
    fn shutdown_timeout_is_minutes() {
        let config = global(&[("core.shutdown_timeout", "2")]);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn local_addresses_ignore_empty() {
        let local = LocalConfig::from_values(
            [("core.https_address".to_string(), String::new())]
                .into_iter()
                .collect(),
        );
        assert!(local.https_address().is_none());
    }
}
