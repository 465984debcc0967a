//! The per-pair file index and everything derived from it.
//!
//! [`FileIndex`] owns the CRDT rows (vector clocks, tombstones) and keeps
//! chunk reference counts honest; [`MerkleIndex`] maintains the hash tree
//! over the live file set and answers diff walks; [`plan`] turns two
//! entry sets into upload/download/conflict/skip buckets.

pub mod chunker;
pub mod diff;
pub mod index;
pub mod merkle;
pub mod plan;

use thiserror::Error;

use butterfly_blobstore::CasError;
use butterfly_primitives::SyncError;
use butterfly_store::StoreError;

pub use crate::chunker::{chunk_hashes, chunks_of, CHUNK_SIZE};
pub use crate::diff::{diff_walk, DiffBatch, Divergence, RemoteNodes};
pub use crate::index::{ApplyOutcome, FileIndex};
pub use crate::merkle::MerkleIndex;
pub use crate::plan::{plan, Conflict, PlanSummary, SyncPlan};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cas(#[from] CasError),

    #[error("invalid entry: {0}")]
    InvalidEntry(#[from] butterfly_primitives::entry::InvalidFileEntry),

    #[error("invalid path {0:?}: {1}")]
    InvalidPath(String, &'static str),
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Store(StoreError::Full) => Self::StorageFull,
            StorageError::Store(other) => Self::Storage(other.to_string()),
            StorageError::Cas(cas) => cas.into(),
            StorageError::InvalidEntry(invalid) => Self::IndexCorrupt(invalid.to_string()),
            StorageError::InvalidPath(path, why) => {
                Self::IndexCorrupt(format!("path {path:?}: {why}"))
            }
        }
    }
}

/// Rejects paths the index never stores: absolute, empty, or escaping.
pub(crate) fn validate_path(path: &str) -> Result<(), StorageError> {
    if path.is_empty() {
        return Err(StorageError::InvalidPath(path.into(), "empty"));
    }
    if path.starts_with('/') || path.ends_with('/') {
        return Err(StorageError::InvalidPath(path.into(), "not relative"));
    }
    for segment in path.split('/') {
        match segment {
            "" => return Err(StorageError::InvalidPath(path.into(), "empty segment")),
            "." | ".." => {
                return Err(StorageError::InvalidPath(path.into(), "traversal segment"))
            }
            _ => {}
        }
    }
    Ok(())
}
