use std::path::PathBuf;

use tracing::info;
use trellis_common::Result;
use trellis_config::DatasourceConfig;

use crate::document_store::DocumentStore;
use crate::file_store::FileStore;
use crate::kv_store::KvStore;
use crate::sql_store::SqlStore;

/// Every backing store the application talks to.
pub struct Datasources {
    pub sql: SqlStore,
    pub documents: DocumentStore,
    pub kv: KvStore,
    pub files: FileStore,
}

impl Datasources {
    pub fn open(config: &DatasourceConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        info!("opening datasources under {}", config.data_dir.display());

        Ok(Self {
            sql: SqlStore::open(&config.sql_path())?,
            documents: DocumentStore::open(&config.document_path())?,
            kv: KvStore::open(&config.kv_path())?,
            files: FileStore::open(&config.file_root)?,
        })
    }

    /// In-memory databases with the file store rooted at `file_root`.
    pub fn in_memory(file_root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            sql: SqlStore::in_memory()?,
            documents: DocumentStore::in_memory()?,
            kv: KvStore::in_memory()?,
            files: FileStore::new(file_root),
        })
    }

    /// Check the three databases respond.
    pub fn ping(&self) -> Result<()> {
        self.sql.ping()?;
        self.documents.ping()?;
        self.kv.ping()
    }
}

#[cfg(test)]
mod tests {
    use super::Datasources;
    use tempfile::TempDir;
    use trellis_config::DatasourceConfig;

    #[test]
    fn open_creates_every_store_under_data_dir() {
        let dir = TempDir::new().unwrap();
        let config = DatasourceConfig {
            data_dir: dir.path().join("data"),
            file_root: dir.path().join("files"),
            ..DatasourceConfig::default()
        };

        let ds = Datasources::open(&config).expect("datasources should open");
        ds.ping().expect("all stores should answer");

        assert!(config.sql_path().exists());
        assert!(config.document_path().exists());
        assert!(config.kv_path().exists());
        assert!(config.file_root.is_dir());
    }
}
