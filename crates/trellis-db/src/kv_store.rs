use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};
use trellis_common::{Error, Result};

use crate::sql_store::BUSY_TIMEOUT;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv_entries (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);";

/// Key-value cache with optional per-key expiry.
pub struct KvStore {
    conn: Mutex<Connection>,
}

impl KvStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening kv store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open kv database: {e}")))?;

        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.connection()?
            .execute_batch(SCHEMA)
            .map_err(|e| Error::Database(format!("kv schema setup failed: {e}")))
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("kv database lock poisoned".into()))
    }

    pub fn ping(&self) -> Result<()> {
        self.connection()?
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| Error::Database(format!("kv store unreachable: {e}")))?;
        Ok(())
    }

    /// Store `value` under `key`. A `ttl` of `None` never expires.
    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| expiry_for(key, ttl)).transpose()?;

        self.connection()?
            .execute(
                "INSERT INTO kv_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expires_at],
            )
            .map_err(|e| Error::Database(format!("failed to set key {key}: {e}")))?;
        Ok(())
    }

    /// Value for `key`, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connection()?;
        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM kv_entries WHERE key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to get key {key}: {e}")))?;

        match row {
            Some((_, Some(expires_at))) if expires_at <= Utc::now().timestamp_millis() => {
                debug!("kv key {key} expired");
                conn.execute("DELETE FROM kv_entries WHERE key = ?1", [key])
                    .map_err(|e| Error::Database(format!("failed to evict key {key}: {e}")))?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    /// Remove `key`. Returns whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let removed = self
            .connection()?
            .execute("DELETE FROM kv_entries WHERE key = ?1", [key])
            .map_err(|e| Error::Database(format!("failed to delete key {key}: {e}")))?;
        Ok(removed > 0)
    }
}

/// Unix millis at which a key set now with `ttl` expires.
fn expiry_for(key: &str, ttl: Duration) -> Result<i64> {
    i64::try_from(ttl.as_millis())
        .ok()
        .and_then(|ttl_ms| Utc::now().timestamp_millis().checked_add(ttl_ms))
        .ok_or_else(|| Error::Validation(format!("ttl for key {key} is out of range")))
}
