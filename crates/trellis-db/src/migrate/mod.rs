//! Versioned, forward-only migrations.
//!
//! A [`MigrationRegistry`] maps versions to [`Migration`]s. The
//! [`MigrationRunner`] applies every registered version missing from the
//! `_migrations` ledger in ascending order, one SQLite transaction per
//! version, while holding a cross-process lock row in `_migration_lock`.

mod error;
mod ledger;
mod lock;
mod registry;
mod runner;

pub use error::MigrationError;
pub use ledger::{LEDGER_TABLE, Ledger, LedgerEntry, LedgerStatus};
pub use lock::{LOCK_NAME, LOCK_TABLE, LockHolder, LockOptions, MigrationLock};
pub use registry::{Datasource, Migration, MigrationRegistry, Version};
pub use runner::{MigrationReport, MigrationRunner, VersionState, VersionStatus};
