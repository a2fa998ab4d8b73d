use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use swarmflow_core::error::{Result, SwarmError};
use swarmflow_core::traits::CheckpointBackend;

/// Durable backend on a single SQLite file.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| SwarmError::Database(format!("Failed to open checkpoint store: {}", e)))?;
        debug!(path = %path.display(), "Opened checkpoint database");
        Self::init(conn)
    }

    /// Database that lives only as long as this value.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;

             CREATE TABLE IF NOT EXISTS checkpoint_blobs (
                 key TEXT PRIMARY KEY,
                 blob BLOB NOT NULL,
                 written_at TEXT NOT NULL
             );",
        )
        .map_err(|e| SwarmError::Database(format!("Failed to initialize checkpoint schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SwarmError::LockPoisoned(e.to_string()))
    }
}

fn db_err(e: rusqlite::Error) -> SwarmError {
    SwarmError::Database(e.to_string())
}

impl CheckpointBackend for SqliteBackend {
    fn put(&self, key: &str, blob: &[u8]) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO checkpoint_blobs (key, blob, written_at) VALUES (?1, ?2, ?3)",
            params![key, blob, Utc::now().to_rfc3339()],
        )
        .map_err(|e| SwarmError::Database(format!("Failed to write {}: {}", key, e)))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT blob FROM checkpoint_blobs WHERE key = ?1",
            params![key],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()
        .map_err(db_err)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT key FROM checkpoint_blobs
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key ASC",
            )
            .map_err(db_err)?;
        let keys = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(keys)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_list() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.put("run/r/2", b"two").unwrap();
        backend.put("run/r/1", b"one").unwrap();
        backend.put("run/s/1", b"other").unwrap();

        assert_eq!(backend.get("run/r/1").unwrap(), Some(b"one".to_vec()));
        assert_eq!(backend.get("run/r/9").unwrap(), None);
        assert_eq!(backend.list("run/r/").unwrap(), vec!["run/r/1", "run/r/2"]);
    }

    #[test]
    fn keys_are_write_once() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.put("k", b"a").unwrap();
        assert!(matches!(backend.put("k", b"b"), Err(SwarmError::Database(_))));
        assert_eq!(backend.get("k").unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cp.db");
        SqliteBackend::open(&path).unwrap().put("k", b"v").unwrap();
        let reopened = SqliteBackend::open(&path).unwrap();
        assert_eq!(reopened.get("k").unwrap(), Some(b"v".to_vec()));
    }
}
