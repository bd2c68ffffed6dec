use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::MigrationError;

pub const LOCK_TABLE: &str = "_migration_lock";
/// Fixed key every runner contends on.
pub const LOCK_NAME: &str = "schema_migrations";

#[derive(Debug, Clone)]
pub struct LockOptions {
    /// `None` waits until the lock is free.
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
    /// How long a claim stays valid without renewal. An expired claim is
    /// treated as abandoned and may be taken over.
    pub lease: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            poll_interval: Duration::from_millis(250),
            lease: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LockHolder {
    pub owner: String,
    pub acquired_at: String,
    pub expires_at: String,
}

/// Lock row claimed through the primary key of `_migration_lock`. Released on
/// drop, so every exit path of a run gives it back. A holder that dies without
/// dropping it leaves a row that expires after the lease.
pub struct MigrationLock<'c> {
    conn: &'c Connection,
    owner: String,
    lease: Duration,
}

impl<'c> MigrationLock<'c> {
    pub fn acquire(conn: &'c Connection, options: &LockOptions) -> Result<Self, MigrationError> {
        let owner = format!("{}:{}", std::process::id(), Uuid::new_v4());
        let started = Instant::now();
        let mut waiting_logged = false;

        loop {
            if try_claim(conn, &owner, options.lease)? {
                debug!("migration lock acquired by {owner}");
                return Ok(Self {
                    conn,
                    owner,
                    lease: options.lease,
                });
            }

            if let Some(timeout) = options.timeout
                && started.elapsed() >= timeout
            {
                return Err(MigrationError::LockTimeout(timeout));
            }

            if !waiting_logged {
                info!("migration lock is held by another process, waiting");
                waiting_logged = true;
            }
            std::thread::sleep(options.poll_interval);
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Push the expiry one lease into the future. Fails when the claim was
    /// taken over after expiring.
    pub fn renew(&self) -> Result<(), MigrationError> {
        let renewed = self.conn.execute(
            &format!("UPDATE {LOCK_TABLE} SET expires_at = ?1 WHERE name = ?2 AND owner = ?3"),
            params![expiry_from_now(self.lease), LOCK_NAME, self.owner],
        )?;
        if renewed == 0 {
            return Err(MigrationError::LockLost(self.owner.clone()));
        }
        Ok(())
    }

    /// Current holder, if any.
    pub fn holder(conn: &Connection) -> Result<Option<LockHolder>, MigrationError> {
        ensure_table(conn)?;
        let holder = conn
            .query_row(
                &format!("SELECT owner, acquired_at, expires_at FROM {LOCK_TABLE} WHERE name = ?1"),
                [LOCK_NAME],
                |row| {
                    let expires_at: i64 = row.get(2)?;
                    Ok(LockHolder {
                        owner: row.get(0)?,
                        acquired_at: row.get(1)?,
                        expires_at: DateTime::<Utc>::from_timestamp_millis(expires_at)
                            .map(|at| at.to_rfc3339())
                            .unwrap_or_else(|| expires_at.to_string()),
                    })
                },
            )
            .optional()?;
        Ok(holder)
    }

    /// Drop a lock left behind by a crashed process. Returns whether a row
    /// was removed.
    pub fn force_release(conn: &Connection) -> Result<bool, MigrationError> {
        ensure_table(conn)?;
        let removed = conn.execute(
            &format!("DELETE FROM {LOCK_TABLE} WHERE name = ?1"),
            [LOCK_NAME],
        )?;
        Ok(removed > 0)
    }
}

impl Drop for MigrationLock<'_> {
    fn drop(&mut self) {
        let released = self.conn.execute(
            &format!("DELETE FROM {LOCK_TABLE} WHERE name = ?1 AND owner = ?2"),
            params![LOCK_NAME, self.owner],
        );
        match released {
            Ok(_) => debug!("migration lock released by {}", self.owner),
            Err(e) => warn!("failed to release migration lock {}: {e}", self.owner),
        }
    }
}

fn create_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {LOCK_TABLE} (
            name TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );"
    )
}

fn ensure_table(conn: &Connection) -> Result<(), MigrationError> {
    conn.execute_batch(&create_table_sql())?;
    Ok(())
}

/// Unix millis one `lease` from now, saturating on absurd leases.
fn expiry_from_now(lease: Duration) -> i64 {
    let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
    Utc::now().timestamp_millis().saturating_add(lease_ms)
}

/// One claim attempt. An expired claim is removed first. A busy database
/// counts as "held by someone else".
fn try_claim(conn: &Connection, owner: &str, lease: Duration) -> Result<bool, MigrationError> {
    let acquired_at: DateTime<Utc> = Utc::now();
    let attempt = conn.execute_batch(&create_table_sql()).and_then(|()| {
        let expired = conn.execute(
            &format!("DELETE FROM {LOCK_TABLE} WHERE name = ?1 AND expires_at <= ?2"),
            params![LOCK_NAME, acquired_at.timestamp_millis()],
        )?;
        if expired > 0 {
            warn!("took over expired migration lock");
        }
        conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {LOCK_TABLE} (name, owner, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)"
            ),
            params![LOCK_NAME, owner, acquired_at.to_rfc3339(), expiry_from_now(lease)],
        )
    });

    match attempt {
        Ok(inserted) => Ok(inserted == 1),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}
