//! SQLite-backed durable key-value store
//!
//! Uses a single `kv` table with embedded migrations managed via
//! PRAGMA user_version. Several processes may open the same file; the claim
//! runs inside an IMMEDIATE transaction so it takes the write lock before
//! reading.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::KeyValueStore;
use crate::error::{Error, Result};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: key-value table
    r#"
    CREATE TABLE IF NOT EXISTS kv (
        key          TEXT PRIMARY KEY,
        value        TEXT NOT NULL,
        updated_at   INTEGER NOT NULL
    );
    "#,
];

/// Durable store in a SQLite file
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL lets readers in other processes proceed while a claim holds the write lock
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// All stored keys, sorted
    pub fn keys(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    /// Schema version recorded in the file
    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.lock()?;
        get_schema_version(&conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Store("sqlite connection lock poisoned".to_string()))
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(Error::from)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO kv (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value, unix_millis()],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }

    fn remove_if(&self, key: &str, accept: &dyn Fn(&str) -> bool) -> Result<Option<String>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let value: Option<String> = tx
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;

        if let Some(value) = &value {
            if accept(value) {
                tx.execute("DELETE FROM kv WHERE key = ?1", [key])?;
            }
        }

        tx.commit()?;
        Ok(value)
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running store migration");
            conn.execute_batch(migration)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
        }
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_migrations_set_version() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        // Re-running is a no-op
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_store_reports_schema_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);

        let memory = SqliteStore::open_in_memory().unwrap();
        assert_eq!(memory.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_get_set_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get("k").unwrap().is_none());

        store.set("k", "one").unwrap();
        store.set("k", "two").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("two"));
        assert_eq!(store.keys().unwrap(), vec!["k".to_string()]);

        store.delete("k").unwrap();
        store.delete("k").unwrap();
        assert!(store.get("k").unwrap().is_none());
    }

    #[test]
    fn test_remove_if_claims_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set("k", "[\"a\"]").unwrap();

        let first = store.remove_if("k", &|_| true).unwrap();
        let second = store.remove_if("k", &|_| true).unwrap();

        assert_eq!(first.as_deref(), Some("[\"a\"]"));
        assert!(second.is_none());
    }

    #[test]
    fn test_remove_if_rejected_keeps_value() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set("k", "42").unwrap();

        let seen = store.remove_if("k", &|v| v.starts_with('[')).unwrap();
        assert_eq!(seen.as_deref(), Some("42"));
        assert_eq!(store.get("k").unwrap().as_deref(), Some("42"));
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.set("pending", "[1,2,3]").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("pending").unwrap().as_deref(), Some("[1,2,3]"));
    }

    #[test]
    fn test_two_handles_share_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");

        let a = SqliteStore::open(&path).unwrap();
        let b = SqliteStore::open(&path).unwrap();
        a.set("pending", "[1]").unwrap();

        assert_eq!(b.remove_if("pending", &|_| true).unwrap().as_deref(), Some("[1]"));
        assert!(a.remove_if("pending", &|_| true).unwrap().is_none());
    }
}
