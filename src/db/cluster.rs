//! Cluster store: the replicated SQL database surfaced by the gateway's
//! embedded engine.
//!
//! The consensus layer itself is a library concern; this module owns the
//! schema-version handshake (the "members behind" startup detour), the
//! tables the core reads and writes, and the fail-fast behaviour once the
//! gateway has been killed.

use super::warnings::{Warning, WarningStatus, WarningType};
use super::{DbError, API_EXTENSIONS, CLUSTER_SCHEMA_VERSION};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const CLUSTER_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS members (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    address TEXT NOT NULL,
    schema INTEGER NOT NULL,
    api_extensions INTEGER NOT NULL,
    heartbeat INTEGER NOT NULL DEFAULT 0,
    evacuated INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS certificates (
    fingerprint TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    pem TEXT NOT NULL,
    restricted INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS certificate_projects (
    fingerprint TEXT NOT NULL,
    project TEXT NOT NULL,
    UNIQUE (fingerprint, project)
);
CREATE TABLE IF NOT EXISTS warnings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type INTEGER NOT NULL,
    status INTEGER NOT NULL,
    node TEXT NOT NULL,
    message TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 1,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    project TEXT NOT NULL DEFAULT 'default',
    node TEXT NOT NULL,
    type TEXT NOT NULL DEFAULT 'container',
    ready INTEGER NOT NULL DEFAULT 0,
    UNIQUE (project, name)
);
";

/// A cluster member row.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub id: u64,
    pub name: String,
    pub address: String,
    pub schema: i64,
    pub api_extensions: i64,
    pub heartbeat_unix: i64,
    pub evacuated: bool,
}

/// A trusted certificate row plus its project restrictions.
#[derive(Debug, Clone)]
pub struct DbCertificate {
    pub fingerprint: String,
    pub kind: String,
    pub name: String,
    pub pem: String,
    pub restricted: bool,
    pub projects: Vec<String>,
}

/// A minimal instance row, enough for the lifecycle to restore and count.
#[derive(Debug, Clone)]
pub struct InstanceRow {
    pub name: String,
    pub project: String,
    pub kind: String,
}

#[derive(Debug)]
pub struct ClusterDb {
    conn: Mutex<Option<Connection>>,
    killed: Arc<AtomicBool>,
    node_id: u64,
    member_name: String,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl ClusterDb {
    /// Opens the cluster database under `dir`, registering the local member
    /// on first open and refusing with `SomeMembersBehind` while any other
    /// member still runs an older schema or fewer API extensions.
    pub fn open(
        dir: &Path,
        member_name: &str,
        local_address: Option<&str>,
        killed: Arc<AtomicBool>,
    ) -> Result<Self, DbError> {
        let global = dir.join("global");
        std::fs::create_dir_all(&global)?;
        let conn = Connection::open(global.join("db.bin"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(CLUSTER_SCHEMA)?;

        let address = local_address.unwrap_or("0.0.0.0");
        let existing: Option<u64> = conn
            .query_row(
                "SELECT id FROM members WHERE name = ?1",
                params![member_name],
                |row| row.get::<_, i64>(0).map(|id| id as u64),
            )
            .optional()?;
        let node_id = match existing {
            Some(id) => {
                // Record the version this build runs before comparing peers.
                conn.execute(
                    "UPDATE members SET schema = ?1, api_extensions = ?2, address = ?3 WHERE id = ?4",
                    params![CLUSTER_SCHEMA_VERSION, API_EXTENSIONS, address, id as i64],
                )?;
                id
            }
            None => {
                conn.execute(
                    "INSERT INTO members (name, address, schema, api_extensions, heartbeat)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        member_name,
                        address,
                        CLUSTER_SCHEMA_VERSION,
                        API_EXTENSIONS,
                        now_unix()
                    ],
                )?;
                conn.last_insert_rowid() as u64
            }
        };

        let behind: Option<i64> = conn
            .query_row(
                "SELECT id FROM members WHERE schema < ?1 OR api_extensions < ?2 LIMIT 1",
                params![CLUSTER_SCHEMA_VERSION, API_EXTENSIONS],
                |row| row.get(0),
            )
            .optional()?;
        if behind.is_some() {
            return Err(DbError::SomeMembersBehind);
        }

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            killed,
            node_id,
            member_name: member_name.to_string(),
        })
    }

    /// Local member id. Zero means the store is not initialized.
    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn member_name(&self) -> &str {
        &self.member_name
    }

    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable);
        }
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(DbError::Closed)?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn config_load(&self) -> Result<HashMap<String, String>, DbError> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare("SELECT key, value FROM config")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut values = HashMap::new();
            for row in rows {
                let (key, value): (String, String) = row?;
                values.insert(key, value);
            }
            Ok(values)
        })
    }

    pub fn config_set(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.transaction(|tx| {
            tx.execute(
                "INSERT INTO config (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    pub fn members(&self) -> Result<Vec<MemberInfo>, DbError> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, name, address, schema, api_extensions, heartbeat, evacuated
                 FROM members ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(MemberInfo {
                    id: row.get::<_, i64>(0)? as u64,
                    name: row.get(1)?,
                    address: row.get(2)?,
                    schema: row.get(3)?,
                    api_extensions: row.get(4)?,
                    heartbeat_unix: row.get(5)?,
                    evacuated: row.get::<_, i64>(6)? != 0,
                })
            })?;
            let mut members = Vec::new();
            for row in rows {
                members.push(row?);
            }
            Ok(members)
        })
    }

    pub fn member_heartbeat(&self, name: &str) -> Result<(), DbError> {
        self.transaction(|tx| {
            tx.execute(
                "UPDATE members SET heartbeat = ?1 WHERE name = ?2",
                params![now_unix(), name],
            )?;
            Ok(())
        })
    }

    pub fn local_member_evacuated(&self) -> Result<bool, DbError> {
        self.transaction(|tx| {
            let evacuated: Option<i64> = tx
                .query_row(
                    "SELECT evacuated FROM members WHERE name = ?1",
                    params![self.member_name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(evacuated.unwrap_or(0) != 0)
        })
    }

    pub fn certificates(&self) -> Result<Vec<DbCertificate>, DbError> {
        self.transaction(|tx| {
            let mut projects: HashMap<String, Vec<String>> = HashMap::new();
            {
                let mut stmt =
                    tx.prepare("SELECT fingerprint, project FROM certificate_projects")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                for row in rows {
                    let (fingerprint, project) = row?;
                    projects.entry(fingerprint).or_default().push(project);
                }
            }
            let mut stmt =
                tx.prepare("SELECT fingerprint, kind, name, pem, restricted FROM certificates")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)? != 0,
                ))
            })?;
            let mut certs = Vec::new();
            for row in rows {
                let (fingerprint, kind, name, pem, restricted) = row?;
                let projects = projects.remove(&fingerprint).unwrap_or_default();
                certs.push(DbCertificate {
                    fingerprint,
                    kind,
                    name,
                    pem,
                    restricted,
                    projects,
                });
            }
            Ok(certs)
        })
    }

    pub fn add_certificate(&self, cert: &DbCertificate) -> Result<(), DbError> {
        self.transaction(|tx| {
            tx.execute(
                "INSERT INTO certificates (fingerprint, kind, name, pem, restricted)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    kind = excluded.kind, name = excluded.name,
                    pem = excluded.pem, restricted = excluded.restricted",
                params![
                    cert.fingerprint,
                    cert.kind,
                    cert.name,
                    cert.pem,
                    cert.restricted as i64
                ],
            )?;
            tx.execute(
                "DELETE FROM certificate_projects WHERE fingerprint = ?1",
                params![cert.fingerprint],
            )?;
            for project in &cert.projects {
                tx.execute(
                    "INSERT OR IGNORE INTO certificate_projects (fingerprint, project)
                     VALUES (?1, ?2)",
                    params![cert.fingerprint, project],
                )?;
            }
            Ok(())
        })
    }

    /// Inserts or refreshes a warning for the local member. An existing
    /// unresolved warning of the same type only has its count and timestamp
    /// bumped.
    pub fn upsert_warning_local(
        &self,
        warning_type: WarningType,
        message: &str,
    ) -> Result<(), DbError> {
        let node = self.member_name.clone();
        self.transaction(|tx| {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM warnings WHERE node = ?1 AND type = ?2 AND status = ?3",
                    params![node, warning_type.code(), WarningStatus::New.code()],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                Some(id) => {
                    tx.execute(
                        "UPDATE warnings SET count = count + 1, last_seen = ?1, message = ?2
                         WHERE id = ?3",
                        params![now_unix(), message, id],
                    )?;
                }
                None => {
                    tx.execute(
                        "INSERT INTO warnings (type, status, node, message, count, first_seen, last_seen)
                         VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
                        params![
                            warning_type.code(),
                            WarningStatus::New.code(),
                            node,
                            message,
                            now_unix()
                        ],
                    )?;
                }
            }
            Ok(())
        })
    }

    pub fn resolve_warnings_by_type(&self, warning_type: WarningType) -> Result<(), DbError> {
        let node = self.member_name.clone();
        self.transaction(|tx| {
            tx.execute(
                "UPDATE warnings SET status = ?1 WHERE node = ?2 AND type = ?3 AND status = ?4",
                params![
                    WarningStatus::Resolved.code(),
                    node,
                    warning_type.code(),
                    WarningStatus::New.code()
                ],
            )?;
            Ok(())
        })
    }

    /// Resolves local warnings last seen before `cutoff`; used at startup so
    /// stale warnings from previous runs do not linger.
    pub fn resolve_warnings_older_than(&self, cutoff: SystemTime) -> Result<(), DbError> {
        let cutoff_unix = cutoff
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let node = self.member_name.clone();
        self.transaction(|tx| {
            tx.execute(
                "UPDATE warnings SET status = ?1
                 WHERE node = ?2 AND status = ?3 AND last_seen < ?4",
                params![
                    WarningStatus::Resolved.code(),
                    node,
                    WarningStatus::New.code(),
                    cutoff_unix
                ],
            )?;
            Ok(())
        })
    }

    pub fn warnings(&self) -> Result<Vec<Warning>, DbError> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, type, status, node, message, count, last_seen FROM warnings",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?;
            let mut warnings = Vec::new();
            for row in rows {
                let (id, type_code, status, node, message, count, last_seen) = row?;
                let Some(warning_type) = WarningType::from_code(type_code) else {
                    continue;
                };
                warnings.push(Warning {
                    id,
                    warning_type,
                    status: WarningStatus::from_code(status),
                    node,
                    message,
                    count,
                    last_seen_unix: last_seen,
                });
            }
            Ok(warnings)
        })
    }

    pub fn local_instances(&self) -> Result<Vec<InstanceRow>, DbError> {
        let node = self.member_name.clone();
        self.transaction(|tx| {
            let mut stmt =
                tx.prepare("SELECT name, project, type FROM instances WHERE node = ?1")?;
            let rows = stmt.query_map(params![node], |row| {
                Ok(InstanceRow {
                    name: row.get(0)?,
                    project: row.get(1)?,
                    kind: row.get(2)?,
                })
            })?;
            let mut instances = Vec::new();
            for row in rows {
                instances.push(row?);
            }
            Ok(instances)
        })
    }

    /// Clears the ready marker on every local instance; instance readiness is
    /// unknown after a daemon restart.
    pub fn clear_local_instance_ready_state(&self) -> Result<(), DbError> {
        let node = self.member_name.clone();
        self.transaction(|tx| {
            tx.execute(
                "UPDATE instances SET ready = 0 WHERE node = ?1",
                params![node],
            )?;
            Ok(())
        })
    }

    /// Closing an already-closed store is a no-op.
    pub fn close(&self) {
        self.conn.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> ClusterDb {
        ClusterDb::open(
            dir.path(),
            "alpha",
            Some("10.0.0.1:8443"),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    #[test]
    fn open_registers_local_member() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        assert_eq!(db.node_id(), 1);
        let members = db.members().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "alpha");
        assert_eq!(members[0].schema, CLUSTER_SCHEMA_VERSION);
    }

    #[test]
    fn members_behind_blocks_open() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(&dir);
            db.transaction(|tx| {
                tx.execute(
                    "INSERT INTO members (name, address, schema, api_extensions)
                     VALUES ('beta', '10.0.0.2:8443', ?1, ?2)",
                    params![CLUSTER_SCHEMA_VERSION - 1, API_EXTENSIONS],
                )?;
                Ok(())
            })
            .unwrap();
            db.close();
        }
        let err = ClusterDb::open(
            dir.path(),
            "alpha",
            Some("10.0.0.1:8443"),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap_err();
        assert!(err.is_members_behind());
    }

    #[test]
    fn killed_store_fails_fast() {
        let dir = TempDir::new().unwrap();
        let killed = Arc::new(AtomicBool::new(false));
        let db = ClusterDb::open(dir.path(), "alpha", None, killed.clone()).unwrap();
        assert!(db.members().is_ok());
        killed.store(true, Ordering::SeqCst);
        assert!(matches!(db.members(), Err(DbError::Unavailable)));
    }

    #[test]
    fn warning_upsert_bumps_count_and_resolves() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.upsert_warning_local(WarningType::ClusterTimeSkew, "skew 10s")
            .unwrap();
        db.upsert_warning_local(WarningType::ClusterTimeSkew, "skew 11s")
            .unwrap();
        let warnings = db.warnings().unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].count, 2);
        assert_eq!(warnings[0].status, WarningStatus::New);

        db.resolve_warnings_by_type(WarningType::ClusterTimeSkew)
            .unwrap();
        let warnings = db.warnings().unwrap();
        assert_eq!(warnings[0].status, WarningStatus::Resolved);
    }

    #[test]
    fn ready_state_cleared_for_local_instances_only() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.transaction(|tx| {
            tx.execute(
                "INSERT INTO instances (name, node, ready) VALUES ('c1', 'alpha', 1)",
                [],
            )?;
            tx.execute(
                "INSERT INTO instances (name, node, ready) VALUES ('c2', 'beta', 1)",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        db.clear_local_instance_ready_state().unwrap();
        let ready: i64 = db
            .transaction(|tx| {
                Ok(tx.query_row(
                    "SELECT SUM(ready) FROM instances",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(ready, 1);
    }
}
