//! SQLite-backed record store.

use crate::backend::{BatchOp, RecordKind, StorageBackend, WriteBatch};
use crate::error::StorageResult;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS plugin_records (
    namespace TEXT NOT NULL,
    kind      TEXT NOT NULL,
    key       TEXT NOT NULL,
    value     BLOB NOT NULL,
    PRIMARY KEY (namespace, kind, key)
);
";

/// Persistent backend storing every namespace in one SQLite database.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Opens (or creates) a database file.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "Opened plugin storage database");
        Self::with_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageBackend for SqliteBackend {
    fn read(&self, namespace: &str, kind: RecordKind, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM plugin_records WHERE namespace = ?1 AND kind = ?2 AND key = ?3",
                params![namespace, kind.as_str(), key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn list(&self, namespace: &str, kind: RecordKind) -> StorageResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT key FROM plugin_records WHERE namespace = ?1 AND kind = ?2 ORDER BY key",
        )?;
        let keys = stmt
            .query_map(params![namespace, kind.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn namespaces(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT DISTINCT namespace FROM plugin_records ORDER BY namespace")?;
        let namespaces = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(namespaces)
    }

    fn commit(&self, namespace: &str, batch: WriteBatch) -> StorageResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if batch.clear_first {
            tx.execute(
                "DELETE FROM plugin_records WHERE namespace = ?1",
                params![namespace],
            )?;
        }
        for op in &batch.ops {
            match op {
                BatchOp::Put { kind, key, value } => {
                    tx.execute(
                        "INSERT INTO plugin_records (namespace, kind, key, value)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT (namespace, kind, key) DO UPDATE SET value = excluded.value",
                        params![namespace, kind.as_str(), key, value],
                    )?;
                }
                BatchOp::Delete { kind, key } => {
                    tx.execute(
                        "DELETE FROM plugin_records WHERE namespace = ?1 AND kind = ?2 AND key = ?3",
                        params![namespace, kind.as_str(), key],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}
