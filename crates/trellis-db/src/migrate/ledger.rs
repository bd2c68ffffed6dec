use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;

use super::error::MigrationError;
use super::registry::Version;

pub const LEDGER_TABLE: &str = "_migrations";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Applied,
    Failed,
}

impl LedgerStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }

    fn from_db(value: &str) -> Result<Self, MigrationError> {
        match value {
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            other => Err(MigrationError::Ledger(format!(
                "unknown ledger status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub version: Version,
    pub name: String,
    pub applied_at: DateTime<Utc>,
    pub status: LedgerStatus,
    pub error: Option<String>,
}

/// Durable record of migration outcomes, stored next to the data it tracks.
pub struct Ledger<'c> {
    conn: &'c Connection,
}

impl<'c> Ledger<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn ensure_table(&self) -> Result<(), MigrationError> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {LEDGER_TABLE} (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('applied', 'failed')),
                error TEXT
            );"
        ))?;
        Ok(())
    }

    /// Versions whose status is `applied`. Failed versions are not included
    /// so the next run retries them.
    pub fn applied_versions(&self) -> Result<BTreeSet<Version>, MigrationError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT version FROM {LEDGER_TABLE} WHERE status = 'applied'"
        ))?;
        let versions = stmt
            .query_map([], |row| row.get::<_, Version>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(versions)
    }

    pub fn entries(&self) -> Result<Vec<LedgerEntry>, MigrationError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT version, name, applied_at, status, error FROM {LEDGER_TABLE} ORDER BY version"
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, Version>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(version, name, applied_at, status, error)| {
                Ok(LedgerEntry {
                    version,
                    name,
                    applied_at: parse_timestamp(&applied_at)?,
                    status: LedgerStatus::from_db(&status)?,
                    error,
                })
            })
            .collect()
    }

    pub fn record_applied(&self, version: Version, name: &str) -> Result<(), MigrationError> {
        self.upsert(version, name, LedgerStatus::Applied, None)
    }

    pub fn record_failed(
        &self,
        version: Version,
        name: &str,
        error: &str,
    ) -> Result<(), MigrationError> {
        self.upsert(version, name, LedgerStatus::Failed, Some(error))
    }

    /// Operator override: flip a `failed` entry to `applied` so later runs
    /// skip it. Returns false when the version has no failed entry.
    pub fn resolve_failed(&self, version: Version) -> Result<bool, MigrationError> {
        let updated = self.conn.execute(
            &format!(
                "UPDATE {LEDGER_TABLE}
                 SET status = 'applied', applied_at = ?2, error = NULL
                 WHERE version = ?1 AND status = 'failed'"
            ),
            params![version, Utc::now().to_rfc3339()],
        )?;
        Ok(updated == 1)
    }

    fn upsert(
        &self,
        version: Version,
        name: &str,
        status: LedgerStatus,
        error: Option<&str>,
    ) -> Result<(), MigrationError> {
        self.conn.execute(
            &format!(
                "INSERT INTO {LEDGER_TABLE} (version, name, applied_at, status, error)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(version) DO UPDATE SET
                    name = excluded.name,
                    applied_at = excluded.applied_at,
                    status = excluded.status,
                    error = excluded.error"
            ),
            params![
                version,
                name,
                Utc::now().to_rfc3339(),
                status.as_str(),
                error
            ],
        )?;
        Ok(())
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, MigrationError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MigrationError::Ledger(format!("invalid applied_at {value}: {e}")))
}
