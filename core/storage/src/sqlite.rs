//! SQLite-backed key-value store.
//!
//! Persists the profile's key space in a single database file so every
//! process opened on the same file shares it.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::info;

use tenantsync_common::{Error, Result};

use crate::provider::KeyValueStore;

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

/// Key-value store using SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or schema initialization failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path).map_err(storage_err)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(storage_err)?;

        info!("SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }
}

impl KeyValueStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
            row.get::<_, String>(0)
        })
        .optional()
        .map_err(storage_err)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            r#"
            INSERT OR REPLACE INTO kv (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            "#,
            params![key, value, chrono::Utc::now().timestamp_millis()],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute("DELETE FROM kv WHERE key = ?1", [key])
            .map_err(storage_err)?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn
            .prepare("SELECT key FROM kv ORDER BY key")
            .map_err(storage_err)?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err)?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_in_memory_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        store.set("tenant:t1:staff", "[{\"id\":1}]").unwrap();

        assert_eq!(
            store.get("tenant:t1:staff").unwrap().as_deref(),
            Some("[{\"id\":1}]")
        );
        assert_eq!(store.get("tenant:t1:services").unwrap(), None);
    }

    #[test]
    fn test_overwrite_and_remove() {
        let store = SqliteStore::in_memory().unwrap();
        store.set("k", "1").unwrap();
        store.set("k", "2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("2"));
        assert_eq!(store.keys().unwrap(), vec!["k"]);

        store.remove("k").unwrap();
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn test_two_handles_share_file() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("profile.db");

        let tab_a = SqliteStore::open(&db).unwrap();
        let tab_b = SqliteStore::open(&db).unwrap();

        tab_a.set("activeThemeId", "\"ocean\"").unwrap();
        assert_eq!(tab_b.get("activeThemeId").unwrap().as_deref(), Some("\"ocean\""));
    }
}
