//! Node-local store: single-node SQLite database holding the raft node set,
//! node-local configuration and the applied-patch ledger.

use super::DbError;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Raft role of a cluster member, as persisted locally and carried by
/// heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Voter,
    StandBy,
    Spare,
    None,
}

impl RaftRole {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => RaftRole::Voter,
            1 => RaftRole::StandBy,
            2 => RaftRole::Spare,
            _ => RaftRole::None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            RaftRole::Voter => 0,
            RaftRole::StandBy => 1,
            RaftRole::Spare => 2,
            RaftRole::None => -1,
        }
    }
}

/// One entry of the locally persisted raft node set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftNode {
    pub id: u64,
    pub address: String,
    pub role: RaftRole,
    pub name: String,
}

const NODE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS schema (
    version INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS patches (
    name TEXT PRIMARY KEY,
    applied_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS raft_nodes (
    id INTEGER PRIMARY KEY,
    address TEXT NOT NULL,
    role INTEGER NOT NULL DEFAULT 0,
    name TEXT NOT NULL DEFAULT ''
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
";

/// Handle to the node-local store. All access is serialized on an internal
/// mutex; multi-statement work runs in explicit transactions.
pub struct NodeDb {
    conn: Mutex<Option<Connection>>,
}

impl NodeDb {
    /// Opens (creating if needed) the local store under `dir`. When the
    /// database is created from scratch, `fresh_hook` runs before the handle
    /// is returned, e.g. to mark every known patch as already applied.
    pub fn open<F>(dir: &Path, fresh_hook: F) -> Result<Self, DbError>
    where
        F: FnOnce(&NodeDb) -> Result<(), DbError>,
    {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("local.db");
        let fresh = !path.exists();
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(NODE_SCHEMA)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM schema", [], |row| row.get(0))?;
        if count == 0 {
            conn.execute("INSERT INTO schema (version) VALUES (1)", [])?;
        }
        let db = Self {
            conn: Mutex::new(Some(conn)),
        };
        if fresh {
            fresh_hook(&db)?;
        }
        Ok(db)
    }

    /// Runs `f` inside a transaction. The transaction commits when `f`
    /// returns Ok and rolls back otherwise.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
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

    pub fn config_replace(&self, values: &HashMap<String, String>) -> Result<(), DbError> {
        self.transaction(|tx| {
            tx.execute("DELETE FROM config", [])?;
            for (key, value) in values {
                tx.execute(
                    "INSERT INTO config (key, value) VALUES (?1, ?2)",
                    params![key, value],
                )?;
            }
            Ok(())
        })
    }

    /// Replaces the whole raft node set in a single transaction.
    pub fn replace_raft_nodes(&self, nodes: &[RaftNode]) -> Result<(), DbError> {
        self.transaction(|tx| {
            tx.execute("DELETE FROM raft_nodes", [])?;
            for node in nodes {
                tx.execute(
                    "INSERT INTO raft_nodes (id, address, role, name) VALUES (?1, ?2, ?3, ?4)",
                    params![node.id as i64, node.address, node.role.code(), node.name],
                )?;
            }
            Ok(())
        })
    }

    pub fn raft_nodes(&self) -> Result<Vec<RaftNode>, DbError> {
        self.transaction(|tx| {
            let mut stmt =
                tx.prepare("SELECT id, address, role, name FROM raft_nodes ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok(RaftNode {
                    id: row.get::<_, i64>(0)? as u64,
                    address: row.get(1)?,
                    role: RaftRole::from_code(row.get(2)?),
                    name: row.get(3)?,
                })
            })?;
            let mut nodes = Vec::new();
            for row in rows {
                nodes.push(row?);
            }
            Ok(nodes)
        })
    }

    pub fn mark_patch_applied(&self, name: &str) -> Result<(), DbError> {
        self.transaction(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO patches (name, applied_at) VALUES (?1, datetime('now'))",
                params![name],
            )?;
            Ok(())
        })
    }

    pub fn patch_applied(&self, name: &str) -> Result<bool, DbError> {
        self.transaction(|tx| {
            let found: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM patches WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Replaces the locally cached trust table. Mirrors the cluster store so
    /// listeners can come up before the cluster database does.
    pub fn replace_certificates(
        &self,
        rows: &[crate::db::DbCertificate],
    ) -> Result<(), DbError> {
        self.transaction(|tx| {
            tx.execute("DELETE FROM certificates", [])?;
            tx.execute("DELETE FROM certificate_projects", [])?;
            for row in rows {
                tx.execute(
                    "INSERT INTO certificates (fingerprint, kind, name, pem, restricted)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![row.fingerprint, row.kind, row.name, row.pem, row.restricted as i64],
                )?;
                for project in &row.projects {
                    tx.execute(
                        "INSERT OR IGNORE INTO certificate_projects (fingerprint, project)
                         VALUES (?1, ?2)",
                        params![row.fingerprint, project],
                    )?;
                }
            }
            Ok(())
        })
    }

    pub fn certificates(&self) -> Result<Vec<crate::db::DbCertificate>, DbError> {
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
                certs.push(crate::db::DbCertificate {
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

    /// Whether this member is part of a cluster: the raft node set is
    /// populated and a cluster address is configured (or more than one raft
    /// node is known).
    pub fn is_clustered(&self, local_address: Option<&str>) -> Result<bool, DbError> {
        let nodes = self.raft_nodes()?;
        Ok(nodes.len() > 1 || (nodes.len() == 1 && local_address.is_some()))
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

    fn open(dir: &TempDir) -> NodeDb {
        NodeDb::open(dir.path(), |_| Ok(())).unwrap()
    }

    #[test]
    fn fresh_hook_runs_only_on_creation() {
        let dir = TempDir::new().unwrap();
        let mut ran = false;
        {
            let _db = NodeDb::open(dir.path(), |_| {
                ran = true;
                Ok(())
            })
            .unwrap();
        }
        assert!(ran);
        let mut ran_again = false;
        let _db = NodeDb::open(dir.path(), |_| {
            ran_again = true;
            Ok(())
        })
        .unwrap();
        assert!(!ran_again);
    }

    #[test]
    fn raft_nodes_round_trip_in_one_transaction() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let nodes = vec![
            RaftNode {
                id: 1,
                address: "10.0.0.1:8443".into(),
                role: RaftRole::Voter,
                name: "alpha".into(),
            },
            RaftNode {
                id: 2,
                address: "10.0.0.2:8443".into(),
                role: RaftRole::Spare,
                name: "beta".into(),
            },
        ];
        db.replace_raft_nodes(&nodes).unwrap();
        assert_eq!(db.raft_nodes().unwrap(), nodes);
        db.replace_raft_nodes(&nodes[..1]).unwrap();
        assert_eq!(db.raft_nodes().unwrap().len(), 1);
    }

    #[test]
    fn patches_are_recorded_once() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        assert!(!db.patch_applied("storage_rename").unwrap());
        db.mark_patch_applied("storage_rename").unwrap();
        db.mark_patch_applied("storage_rename").unwrap();
        assert!(db.patch_applied("storage_rename").unwrap());
    }

    #[test]
    fn close_is_tolerated_twice() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.close();
        db.close();
        assert!(matches!(db.raft_nodes(), Err(DbError::Closed)));
    }
}
