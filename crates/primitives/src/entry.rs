use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::VectorClock;
use crate::device::DeviceId;
use crate::hash::Hash;

/// File extensions that are already entropy-coded; compressing their
/// chunks again wastes cycles for no savings.
const PRECOMPRESSED_EXTENSIONS: &[&str] = &[
    "7z", "aac", "avi", "bz2", "docx", "flac", "gif", "gz", "heic", "jpeg", "jpg", "m4a", "mkv",
    "mov", "mp3", "mp4", "ogg", "png", "pptx", "rar", "webm", "webp", "xlsx", "xz", "zip", "zst",
];

/// Whether chunk compression is worth attempting for `path`, judged by
/// its extension.
#[must_use]
pub fn compression_worthwhile(path: &str) -> bool {
    let Some((_, extension)) = path.rsplit_once('.') else {
        return true;
    };
    !PRECOMPRESSED_EXTENSIONS
        .iter()
        .any(|known| extension.eq_ignore_ascii_case(known))
}

/// One indexed file within a pair, keyed by its relative path.
///
/// Paths are '/'-separated, UTF-8 NFC relative paths. The entry is always
/// rewritten whole by its authoring device; other devices only replace it
/// when the incoming vector clock strictly dominates theirs.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub path: String,
    /// SHA-256 of the whole file content; `Hash::ZERO` for tombstones.
    pub hash: Hash,
    pub size: u64,
    /// File modification time, unix ms. LWW conflict resolution compares
    /// this first.
    pub mtime: u64,
    /// Hashes of the file's fixed-size chunks, in file order.
    pub chunk_hashes: Vec<Hash>,
    pub chunk_size: u32,
    pub vector_clock: VectorClock,
    /// Device that authored this revision.
    pub device_id: DeviceId,
    /// That device's sequence number at authoring time.
    pub seq: u64,
    pub tombstone: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<u64>,
}

#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum InvalidFileEntry {
    #[error("tombstone for {path} still carries content")]
    TombstoneWithContent { path: String },
    #[error("{path}: expected {expected} chunks for {size} bytes, found {found}")]
    ChunkCount {
        path: String,
        expected: usize,
        found: usize,
        size: u64,
    },
    #[error("{path}: vector clock component for the authoring device is {clock_seq}, entry seq is {seq}")]
    AuthorClockMismatch {
        path: String,
        clock_seq: u64,
        seq: u64,
    },
    #[error("{path}: chunk size must be non-zero")]
    ZeroChunkSize { path: String },
}

impl FileEntry {
    /// Builds a content revision authored by `device_id` at `seq`,
    /// carrying the previous clock for this path (if any) with the
    /// authoring component bumped to `seq`.
    #[expect(clippy::too_many_arguments, reason = "plain constructor over the record fields")]
    #[must_use]
    pub fn authored(
        path: String,
        hash: Hash,
        size: u64,
        mtime: u64,
        chunk_hashes: Vec<Hash>,
        chunk_size: u32,
        device_id: DeviceId,
        seq: u64,
        previous_clock: Option<&VectorClock>,
    ) -> Self {
        let mut vector_clock = previous_clock.cloned().unwrap_or_default();
        vector_clock.set(device_id, seq);

        Self {
            path,
            hash,
            size,
            mtime,
            chunk_hashes,
            chunk_size,
            vector_clock,
            device_id,
            seq,
            tombstone: false,
            deleted_at: None,
        }
    }

    /// The tombstone revision replacing `self`, authored by `device_id` at
    /// `seq`. Content fields are cleared; the clock keeps its history.
    #[must_use]
    pub fn into_tombstone(self, device_id: DeviceId, seq: u64, deleted_at: u64) -> Self {
        let mut vector_clock = self.vector_clock;
        vector_clock.set(device_id, seq);

        Self {
            path: self.path,
            hash: Hash::ZERO,
            size: 0,
            mtime: deleted_at,
            chunk_hashes: Vec::new(),
            chunk_size: self.chunk_size,
            vector_clock,
            device_id,
            seq,
            tombstone: true,
            deleted_at: Some(deleted_at),
        }
    }

    /// Number of chunks a file of `size` bytes occupies.
    #[must_use]
    pub fn expected_chunks(size: u64, chunk_size: u32) -> usize {
        if size == 0 {
            0
        } else {
            size.div_ceil(u64::from(chunk_size)) as usize
        }
    }

    /// Checks the structural invariants every stored entry satisfies.
    pub fn validate(&self) -> Result<(), InvalidFileEntry> {
        if self.chunk_size == 0 {
            return Err(InvalidFileEntry::ZeroChunkSize {
                path: self.path.clone(),
            });
        }

        if self.tombstone {
            if !self.chunk_hashes.is_empty() || self.size != 0 {
                return Err(InvalidFileEntry::TombstoneWithContent {
                    path: self.path.clone(),
                });
            }
        } else {
            let expected = Self::expected_chunks(self.size, self.chunk_size);
            if self.chunk_hashes.len() != expected {
                return Err(InvalidFileEntry::ChunkCount {
                    path: self.path.clone(),
                    expected,
                    found: self.chunk_hashes.len(),
                    size: self.size,
                });
            }
        }

        let clock_seq = self.vector_clock.get(&self.device_id);
        if clock_seq != self.seq {
            return Err(InvalidFileEntry::AuthorClockMismatch {
                path: self.path.clone(),
                clock_seq,
                seq: self.seq,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/entry.rs"]
mod tests;
