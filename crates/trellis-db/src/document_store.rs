use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, ToSql, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;
use trellis_common::{Error, Result};
use uuid::Uuid;

use crate::sql_store::BUSY_TIMEOUT;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    collection TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);";

/// Schemaless JSON documents grouped into named collections.
pub struct DocumentStore {
    conn: Mutex<Connection>,
}

impl DocumentStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening document store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open document database: {e}")))?;

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
            .map_err(|e| Error::Database(format!("document schema setup failed: {e}")))
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("document database lock poisoned".into()))
    }

    pub fn ping(&self) -> Result<()> {
        self.connection()?
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| Error::Database(format!("document store unreachable: {e}")))?;
        Ok(())
    }

    /// Insert a document and return its generated id.
    pub fn insert_one<T: Serialize>(&self, collection: &str, document: &T) -> Result<String> {
        let body = serde_json::to_string(document)?;
        if !body.starts_with('{') {
            return Err(Error::Validation(
                "documents must serialize to a JSON object".into(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        self.connection()?
            .execute(
                "INSERT INTO documents (id, collection, body) VALUES (?1, ?2, ?3)",
                params![id, collection, body],
            )
            .map_err(|e| Error::Database(format!("failed to insert document: {e}")))?;

        Ok(id)
    }

    /// First document in `collection` (insertion order) whose top-level
    /// `field` equals `value`.
    pub fn find_one<T: DeserializeOwned>(
        &self,
        collection: &str,
        field: &str,
        value: impl ToSql,
    ) -> Result<Option<T>> {
        validate_field(field)?;
        let path = format!("$.{field}");

        let body: Option<String> = self
            .connection()?
            .query_row(
                "SELECT body FROM documents
                 WHERE collection = ?1 AND json_extract(body, ?2) = ?3
                 ORDER BY rowid LIMIT 1",
                params![collection, path, value],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to query documents: {e}")))?;

        body.map(|b| serde_json::from_str(&b).map_err(Error::from))
            .transpose()
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        let count: i64 = self
            .connection()?
            .query_row(
                "SELECT count(*) FROM documents WHERE collection = ?1",
                [collection],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to count documents: {e}")))?;
        Ok(count as usize)
    }
}

fn validate_field(field: &str) -> Result<()> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid document field: {field}")))
    }
}
