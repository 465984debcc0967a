use core::fmt;
use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use butterfly_primitives::SyncError;

/// The bound local folder: where assembled files land and deletes take
/// effect. The platform side (watchers, pickers, real directories) lives
/// outside the engine; this is the seam it plugs into.
#[async_trait]
pub trait FolderSink: Send + Sync + fmt::Debug + 'static {
    async fn write_file(&self, path: &str, bytes: &[u8], mtime: u64) -> Result<(), SyncError>;

    async fn remove_file(&self, path: &str) -> Result<(), SyncError>;
}

/// Map-backed folder for tests and headless runs.
#[derive(Debug, Default)]
pub struct InMemoryFolder {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryFolder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(path)
            .cloned()
    }

    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.files
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FolderSink for InMemoryFolder {
    async fn write_file(&self, path: &str, bytes: &[u8], _mtime: u64) -> Result<(), SyncError> {
        let _prev = self
            .files
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.to_owned(), bytes.to_vec());
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), SyncError> {
        let _prev = self
            .files
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(path);
        Ok(())
    }
}
