pub mod datasources;
pub mod document_store;
pub mod file_store;
pub mod kv_store;
pub mod migrate;
pub mod migrations;
pub mod sql_store;
pub mod user_store;

pub use datasources::Datasources;
pub use document_store::DocumentStore;
pub use file_store::{FileEntry, FileStore};
pub use kv_store::KvStore;
pub use migrate::{
    Datasource, LedgerEntry, LedgerStatus, LockHolder, LockOptions, Migration, MigrationError,
    MigrationRegistry, MigrationReport, MigrationRunner, Version, VersionState, VersionStatus,
};
pub use sql_store::SqlStore;
pub use user_store::{Page, User};
