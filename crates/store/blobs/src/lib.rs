//! Chunk storage.
//!
//! Bytes live in a [`BlobRepo`] collaborator keyed by the chunk's hex
//! hash; metadata (compression, sizes, reference counts) lives in the
//! key/value store's `CasIndex` column. The [`ChunkStore`] ties the two
//! together and owns deduplication, hash verification, quarantine and
//! garbage collection.

pub mod repo;

use std::io::{Read, Write};
use std::sync::Arc;

use borsh::{BorshDeserialize, BorshSerialize};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::{debug, warn};

use butterfly_primitives::{now_ms, Hash, SyncError};
use butterfly_store::key::CasChunkKey;
use butterfly_store::{Column, Store, StoreError};

pub use crate::repo::{BlobRepo, FsBlobRepo, InMemoryBlobRepo};

/// Stored form is kept compressed only when it saves at least this share
/// of the original length.
const COMPRESSION_KEEP_RATIO: f64 = 0.9;

/// Zero-reference chunks younger than this survive [`ChunkStore::gc`], so
/// a rewrite racing a decref cannot lose its bytes.
pub const GC_GRACE_MS: u64 = 10 * 60 * 1000;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BlobError {
    #[error("blob i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob storage full")]
    Full,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CasError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("chunk not found: {0}")]
    NotFound(Hash),

    #[error("chunk hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: Hash, actual: Hash },
}

impl From<CasError> for SyncError {
    fn from(err: CasError) -> Self {
        match err {
            CasError::Store(StoreError::Full) | CasError::Blob(BlobError::Full) => {
                Self::StorageFull
            }
            CasError::HashMismatch { expected, actual } => Self::HashMismatch { expected, actual },
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Metadata row for one stored chunk.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ChunkRecord {
    pub hash: Hash,
    pub stored_compressed: bool,
    pub original_size: u64,
    pub stored_size: u64,
    /// Number of file-entry chunk references; eligible for GC at zero.
    pub ref_count: u64,
    pub created_at: u64,
    pub last_referenced_at: u64,
}

/// The content-addressable chunk store.
#[derive(Clone, Debug)]
pub struct ChunkStore {
    store: Store,
    repo: Arc<dyn BlobRepo>,
}

impl ChunkStore {
    #[must_use]
    pub fn new(store: Store, repo: Arc<dyn BlobRepo>) -> Self {
        Self { store, repo }
    }

    /// Stores `bytes` under their SHA-256, deduplicating against existing
    /// content. When `try_compress` is set the stored form is deflate,
    /// kept only if it beats [`COMPRESSION_KEEP_RATIO`].
    ///
    /// Reference counts are untouched; the file index owns them.
    pub async fn put(&self, bytes: &[u8], try_compress: bool) -> Result<Hash, CasError> {
        let hash = Hash::digest(bytes);

        if let Some(mut record) = self.record(&hash)? {
            // Same content, nothing to rewrite.
            record.last_referenced_at = now_ms();
            self.store.put(&CasChunkKey(hash), &record)?;
            return Ok(hash);
        }

        let compressed = if try_compress {
            deflate(bytes)
                .filter(|smaller| {
                    (smaller.len() as f64) <= (bytes.len() as f64) * COMPRESSION_KEEP_RATIO
                })
                // The stored form must reproduce the addressed bytes
                // exactly, or the chunk goes in raw.
                .filter(|smaller| inflate(smaller).is_some_and(|back| back == bytes))
        } else {
            None
        };

        let (stored, stored_compressed) = match &compressed {
            Some(smaller) => (smaller.as_slice(), true),
            None => (bytes, false),
        };

        self.repo.put(&hash.to_hex(), stored).await?;

        let record = ChunkRecord {
            hash,
            stored_compressed,
            original_size: bytes.len() as u64,
            stored_size: stored.len() as u64,
            ref_count: 0,
            created_at: now_ms(),
            last_referenced_at: now_ms(),
        };
        self.store.put(&CasChunkKey(hash), &record)?;

        Ok(hash)
    }

    /// The chunk's original bytes, transparently decompressed and
    /// verified. A verification failure quarantines the chunk (bytes and
    /// row deleted) so the next transfer re-requests it.
    pub async fn get(&self, hash: &Hash) -> Result<Vec<u8>, CasError> {
        let record = self.record(hash)?.ok_or(CasError::NotFound(*hash))?;

        let stored = self
            .repo
            .get(&hash.to_hex())
            .await?
            .ok_or(CasError::NotFound(*hash))?;

        let bytes = if record.stored_compressed {
            inflate(&stored).ok_or_else(|| {
                // Treated like a bad hash below: the stored form is garbage.
                CasError::HashMismatch {
                    expected: *hash,
                    actual: Hash::ZERO,
                }
            })
        } else {
            Ok(stored)
        };

        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(err) => {
                self.quarantine(hash).await;
                return Err(err);
            }
        };

        let actual = Hash::digest(&bytes);
        if actual != *hash {
            self.quarantine(hash).await;
            return Err(CasError::HashMismatch {
                expected: *hash,
                actual,
            });
        }

        Ok(bytes)
    }

    pub fn has(&self, hash: &Hash) -> Result<bool, CasError> {
        Ok(self.record(hash)?.is_some())
    }

    pub fn record(&self, hash: &Hash) -> Result<Option<ChunkRecord>, CasError> {
        Ok(self.store.get(&CasChunkKey(*hash))?)
    }

    pub fn inc_ref(&self, hash: &Hash) -> Result<(), CasError> {
        let mut record = self.record(hash)?.ok_or(CasError::NotFound(*hash))?;
        record.ref_count += 1;
        record.last_referenced_at = now_ms();
        self.store.put(&CasChunkKey(*hash), &record)?;
        Ok(())
    }

    pub fn dec_ref(&self, hash: &Hash) -> Result<(), CasError> {
        let Some(mut record) = self.record(hash)? else {
            // Already quarantined or collected; nothing to release.
            return Ok(());
        };
        record.ref_count = record.ref_count.saturating_sub(1);
        record.last_referenced_at = now_ms();
        self.store.put(&CasChunkKey(*hash), &record)?;
        Ok(())
    }

    /// Deletes every zero-reference chunk older than `grace_ms`. Returns
    /// the number of chunks collected.
    pub async fn gc(&self, grace_ms: u64) -> Result<usize, CasError> {
        let rows: Vec<(Box<[u8]>, ChunkRecord)> = self.store.scan_prefix(Column::CasIndex, &[])?;
        let now = now_ms();
        let mut collected = 0;

        for (_, record) in rows {
            if record.ref_count != 0 {
                continue;
            }
            if now.saturating_sub(record.last_referenced_at) < grace_ms {
                continue;
            }

            self.repo.delete(&record.hash.to_hex()).await?;
            self.store.delete(&CasChunkKey(record.hash))?;
            collected += 1;
        }

        if collected > 0 {
            debug!(collected, "chunk gc pass finished");
        }

        Ok(collected)
    }

    async fn quarantine(&self, hash: &Hash) {
        warn!(%hash, "quarantining corrupt chunk");
        if let Err(err) = self.repo.delete(&hash.to_hex()).await {
            warn!(%hash, ?err, "failed to delete quarantined chunk bytes");
        }
        if let Err(err) = self.store.delete(&CasChunkKey(*hash)) {
            warn!(%hash, ?err, "failed to delete quarantined chunk row");
        }
    }
}

/// Deflate helper; `None` when compression fails (never expected, but a
/// failed encoder must not poison a put).
fn deflate(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).ok()?;
    encoder.finish().ok()
}

fn inflate(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

#[cfg(test)]
#[path = "tests/chunk_store.rs"]
mod tests;
