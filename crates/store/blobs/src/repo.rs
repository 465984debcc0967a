use core::fmt;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::RwLock;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use tokio::fs;

use crate::BlobError;

/// Keyed byte storage backing the chunk store. Keys are 64-character hex
/// strings; no atomicity across keys is required.
#[async_trait]
pub trait BlobRepo: Send + Sync + fmt::Debug + 'static {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError>;

    async fn delete(&self, key: &str) -> Result<(), BlobError>;

    async fn list(&self) -> Result<Vec<String>, BlobError>;
}

/// One file per chunk under a flat directory.
#[derive(Debug)]
pub struct FsBlobRepo {
    root: Utf8PathBuf,
}

impl FsBlobRepo {
    /// Creates the root directory if needed.
    pub async fn open(root: Utf8PathBuf) -> Result<Self, BlobError> {
        fs::create_dir_all(&root).await.map_err(map_io)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Utf8PathBuf {
        self.root.join(key)
    }
}

fn map_io(err: std::io::Error) -> BlobError {
    if err.kind() == ErrorKind::StorageFull {
        BlobError::Full
    } else {
        BlobError::Io(err)
    }
}

#[async_trait]
impl BlobRepo for FsBlobRepo {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobError> {
        // Write-then-rename keeps partially written chunks invisible.
        let tmp = self.root.join(format!("{key}.tmp"));
        fs::write(&tmp, bytes).await.map_err(map_io)?;
        fs::rename(&tmp, self.path_for(key)).await.map_err(map_io)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(map_io(err)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(map_io(err)),
        }
    }

    async fn list(&self) -> Result<Vec<String>, BlobError> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.root).await.map_err(map_io)?;
        while let Some(entry) = entries.next_entry().await.map_err(map_io)? {
            if let Some(name) = entry.file_name().to_str() {
                if name.len() == 64 && name.chars().all(|c| c.is_ascii_hexdigit()) {
                    keys.push(name.to_owned());
                }
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }
}

/// Map-backed repo for tests and ephemeral instances.
#[derive(Debug, Default)]
pub struct InMemoryBlobRepo {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBlobRepo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.blobs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.blobs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobRepo for InMemoryBlobRepo {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let _prev = self.write().insert(key.to_owned(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        Ok(self.read().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let _prev = self.write().remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, BlobError> {
        Ok(self.read().keys().cloned().collect())
    }
}
