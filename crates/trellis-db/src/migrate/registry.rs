use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;

use rusqlite::Connection;
use trellis_common::Result;

use super::error::MigrationError;
use crate::document_store::DocumentStore;
use crate::file_store::FileStore;
use crate::kv_store::KvStore;

/// Migration version, by convention a `YYYYMMDDHHMMSS` timestamp.
pub type Version = i64;

type UpFn = Box<dyn Fn(&Datasource<'_>) -> Result<()> + Send + Sync>;

/// Handle passed to a migration's `up` action.
///
/// `sql` is the open transaction the ledger row is written in, so relational
/// changes commit or roll back together with the bookkeeping. The other
/// stores are written directly.
pub struct Datasource<'a> {
    pub sql: &'a Connection,
    pub documents: &'a DocumentStore,
    pub kv: &'a KvStore,
    pub files: &'a FileStore,
}

/// A named, forward-only change.
pub struct Migration {
    name: &'static str,
    up: UpFn,
}

impl Migration {
    pub fn new(
        name: &'static str,
        up: impl Fn(&Datasource<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            up: Box::new(up),
        }
    }

    /// Migration that runs a SQL batch against the relational store.
    pub fn sql(name: &'static str, sql: &'static str) -> Self {
        Self::new(name, move |ds| {
            ds.sql.execute_batch(sql).map_err(|e| {
                trellis_common::Error::Database(format!("{name}: {e}"))
            })
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn up(&self, ds: &Datasource<'_>) -> Result<()> {
        (self.up)(ds)
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Immutable, version-ordered set of migrations.
#[derive(Debug, Default)]
pub struct MigrationRegistry {
    migrations: BTreeMap<Version, Migration>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a migration. Registering the same version twice is a configuration
    /// error.
    pub fn register(
        mut self,
        version: Version,
        migration: Migration,
    ) -> std::result::Result<Self, MigrationError> {
        if version <= 0 {
            return Err(MigrationError::InvalidVersion(version));
        }
        match self.migrations.entry(version) {
            Entry::Occupied(_) => Err(MigrationError::DuplicateVersion(version)),
            Entry::Vacant(slot) => {
                slot.insert(migration);
                Ok(self)
            }
        }
    }

    pub fn from_entries(
        entries: impl IntoIterator<Item = (Version, Migration)>,
    ) -> std::result::Result<Self, MigrationError> {
        entries
            .into_iter()
            .try_fold(Self::new(), |registry, (version, migration)| {
                registry.register(version, migration)
            })
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn get(&self, version: Version) -> Option<&Migration> {
        self.migrations.get(&version)
    }

    /// Versions in ascending order.
    pub fn versions(&self) -> impl Iterator<Item = Version> + '_ {
        self.migrations.keys().copied()
    }

    /// Migrations in ascending version order.
    pub fn iter(&self) -> impl Iterator<Item = (Version, &Migration)> {
        self.migrations.iter().map(|(v, m)| (*v, m))
    }
}
