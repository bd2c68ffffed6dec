use std::time::Duration;

use thiserror::Error;

use super::registry::Version;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("duplicate migration version {0}")]
    DuplicateVersion(Version),

    #[error("invalid migration version {0}: versions must be positive")]
    InvalidVersion(Version),

    #[error("migration version {0} is not registered")]
    UnknownVersion(Version),

    #[error("datastore unreachable: {0}")]
    Connectivity(String),

    #[error("timed out after {0:?} waiting for the migration lock")]
    LockTimeout(Duration),

    #[error("migration lock held by {0} expired and was taken over")]
    LockLost(String),

    #[error("migration ledger error: {0}")]
    Ledger(String),

    #[error("migration {version} failed: {source}")]
    Failed {
        version: Version,
        #[source]
        source: trellis_common::Error,
    },
}

impl MigrationError {
    /// The version that failed, for execution errors.
    pub fn version(&self) -> Option<Version> {
        match self {
            Self::Failed { version, .. } => Some(*version),
            Self::DuplicateVersion(v) | Self::InvalidVersion(v) | Self::UnknownVersion(v) => {
                Some(*v)
            }
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for MigrationError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Ledger(e.to_string())
    }
}

impl From<MigrationError> for trellis_common::Error {
    fn from(e: MigrationError) -> Self {
        trellis_common::Error::Migration(e.to_string())
    }
}
