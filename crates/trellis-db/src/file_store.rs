use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use trellis_common::{Error, Result};

/// One entry of a directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub is_dir: bool,
}

/// Object storage rooted at a local directory. Keys are relative paths.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root directory if missing.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(root);
        std::fs::create_dir_all(&store.root)?;
        Ok(store)
    }

    pub fn working_dir(&self) -> &Path {
        &self.root
    }

    pub fn ping(&self) -> Result<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(Error::NotFound(format!(
                "file store root {} is not a directory",
                self.root.display()
            )))
        }
    }

    /// List `prefix`, sorted by name.
    pub fn read_dir(&self, prefix: &str) -> Result<Vec<FileEntry>> {
        let dir = self.resolve(prefix)?;
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("directory {prefix}")));
        }

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                modified: meta.modified().map(DateTime::<Utc>::from)?,
                is_dir: meta.is_dir(),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::Validation(format!(
                "path escapes the file store: {key}"
            )));
        }
        Ok(self.root.join(relative))
    }
}
