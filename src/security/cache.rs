//! In-memory trust store.
//!
//! Certificates are keyed by kind and fingerprint, with an extra map of
//! per-fingerprint project restrictions. The whole cache is rebuilt
//! atomically from the store; readers hold an immutable snapshot for the
//! duration of a request so a concurrent refresh never tears their view.

use crate::db::DbCertificate;
use crate::security::certs::{cert_der_from_pem, fingerprint_der};
use log::warn;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Trust classes a certificate can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertKind {
    Client,
    Server,
    Metrics,
}

impl CertKind {
    pub fn from_db(kind: &str) -> Option<Self> {
        match kind {
            "client" => Some(CertKind::Client),
            "server" => Some(CertKind::Server),
            "metrics" => Some(CertKind::Metrics),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CertKind::Client => "client",
            CertKind::Server => "server",
            CertKind::Metrics => "metrics",
        }
    }
}

/// One trusted certificate.
#[derive(Debug, Clone)]
pub struct TrustEntry {
    pub der: Vec<u8>,
    pub name: String,
}

/// Immutable view of the trust store at one point in time.
#[derive(Debug, Default)]
pub struct TrustSnapshot {
    certs: HashMap<CertKind, HashMap<String, TrustEntry>>,
    projects: HashMap<String, Vec<String>>,
}

impl TrustSnapshot {
    pub fn kind(&self, kind: CertKind) -> Option<&HashMap<String, TrustEntry>> {
        self.certs.get(&kind)
    }

    /// Project restrictions for a fingerprint, None when unrestricted.
    pub fn projects(&self, fingerprint: &str) -> Option<&Vec<String>> {
        self.projects.get(fingerprint)
    }

    pub fn contains(&self, kind: CertKind, fingerprint: &str) -> bool {
        self.certs
            .get(&kind)
            .map(|entries| entries.contains_key(fingerprint))
            .unwrap_or(false)
    }
}

#[derive(Default)]
pub struct CertCache {
    snapshot: RwLock<Arc<TrustSnapshot>>,
}

impl CertCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot. Cheap: clones an Arc.
    pub fn snapshot(&self) -> Arc<TrustSnapshot> {
        self.snapshot.read().clone()
    }

    /// Atomically replaces the cache content from certificate rows.
    /// Unparsable rows are skipped with a warning rather than failing the
    /// whole refresh.
    pub fn replace_from_rows(&self, rows: &[DbCertificate]) {
        let mut certs: HashMap<CertKind, HashMap<String, TrustEntry>> = HashMap::new();
        let mut projects: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            let Some(kind) = CertKind::from_db(&row.kind) else {
                warn!(
                    "event=cert_cache_skip fingerprint={} reason=unknown_kind kind={}",
                    row.fingerprint, row.kind
                );
                continue;
            };
            let der = match cert_der_from_pem(&row.pem) {
                Ok(der) => der,
                Err(err) => {
                    warn!(
                        "event=cert_cache_skip fingerprint={} reason=unparsable error={err}",
                        row.fingerprint
                    );
                    continue;
                }
            };
            let fingerprint = fingerprint_der(&der);
            if row.restricted {
                projects.insert(fingerprint.clone(), row.projects.clone());
            }
            certs.entry(kind).or_default().insert(
                fingerprint,
                TrustEntry {
                    der,
                    name: row.name.clone(),
                },
            );
        }
        *self.snapshot.write() = Arc::new(TrustSnapshot { certs, projects });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::certs::CertInfo;
    use tempfile::TempDir;

    fn row(
        dir: &TempDir,
        basename: &str,
        cert: &CertInfo,
        kind: &str,
        restricted: bool,
        projects: Vec<String>,
    ) -> DbCertificate {
        let pem = std::fs::read_to_string(dir.path().join(format!("{basename}.crt"))).unwrap();
        DbCertificate {
            fingerprint: cert.fingerprint().to_string(),
            kind: kind.to_string(),
            name: "entry".to_string(),
            pem,
            restricted,
            projects,
        }
    }

    #[test]
    fn replace_builds_kind_and_project_maps() {
        let dir = TempDir::new().unwrap();
        let client = CertInfo::load_or_generate(dir.path(), "client", "client").unwrap();
        let server = CertInfo::load_or_generate(dir.path(), "server", "server").unwrap();
        let cache = CertCache::new();
        cache.replace_from_rows(&[
            row(&dir, "client", &client, "client", true, vec!["web".into(), "db".into()]),
            row(&dir, "server", &server, "server", false, Vec::new()),
        ]);
        let snapshot = cache.snapshot();
        assert!(snapshot.contains(CertKind::Client, client.fingerprint()));
        assert!(snapshot.contains(CertKind::Server, server.fingerprint()));
        assert!(!snapshot.contains(CertKind::Metrics, client.fingerprint()));
        assert_eq!(
            snapshot.projects(client.fingerprint()).unwrap(),
            &vec!["web".to_string(), "db".to_string()]
        );
        assert!(snapshot.projects(server.fingerprint()).is_none());
    }

    #[test]
    fn readers_keep_old_snapshot_across_replace() {
        let dir = TempDir::new().unwrap();
        let client = CertInfo::load_or_generate(dir.path(), "client", "client").unwrap();
        let cache = CertCache::new();
        cache.replace_from_rows(&[row(&dir, "client", &client, "client", false, Vec::new())]);
        let before = cache.snapshot();
        cache.replace_from_rows(&[]);
        assert!(before.contains(CertKind::Client, client.fingerprint()));
        assert!(!cache.snapshot().contains(CertKind::Client, client.fingerprint()));
    }

    #[test]
    fn unknown_kinds_are_skipped() {
        let dir = TempDir::new().unwrap();
        let client = CertInfo::load_or_generate(dir.path(), "client", "client").unwrap();
        let cache = CertCache::new();
        cache.replace_from_rows(&[row(&dir, "client", &client, "bogus", false, Vec::new())]);
        assert!(!cache.snapshot().contains(CertKind::Client, client.fingerprint()));
    }
}
