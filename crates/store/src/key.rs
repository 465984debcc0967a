//! Key encodings for every collection.
//!
//! Composite keys concatenate the fixed-width pair id with the variable
//! tail (path, node path, timestamp), so prefix scans over a pair id
//! enumerate exactly that pair's rows.

use butterfly_primitives::{Hash, PairId};

use crate::db::Column;

/// A typed key into one column.
pub trait StoreKey {
    const COLUMN: Column;

    fn key_bytes(&self) -> Vec<u8>;
}

/// Singleton key for the local device record.
#[derive(Clone, Copy, Debug)]
pub struct LocalDevice;

impl StoreKey for LocalDevice {
    const COLUMN: Column = Column::Devices;

    fn key_bytes(&self) -> Vec<u8> {
        b"local".to_vec()
    }
}

/// Singleton key for the local private-key handle.
#[derive(Clone, Copy, Debug)]
pub struct LocalDeviceKey;

impl StoreKey for LocalDeviceKey {
    const COLUMN: Column = Column::DeviceKeys;

    fn key_bytes(&self) -> Vec<u8> {
        b"local".to_vec()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PairKey(pub PairId);

impl StoreKey for PairKey {
    const COLUMN: Column = Column::Pairs;

    fn key_bytes(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }
}

#[derive(Clone, Debug)]
pub struct FileEntryKey {
    pub pair_id: PairId,
    pub path: String,
}

impl FileEntryKey {
    /// The scan prefix covering every file entry of `pair_id`.
    #[must_use]
    pub fn pair_prefix(pair_id: &PairId) -> Vec<u8> {
        pair_id.as_bytes().to_vec()
    }

    /// Recovers the path from a scanned key.
    #[must_use]
    pub fn path_from_key(key: &[u8]) -> Option<&str> {
        let tail = key.get(32..)?;
        core::str::from_utf8(tail).ok()
    }
}

impl StoreKey for FileEntryKey {
    const COLUMN: Column = Column::FileIndex;

    fn key_bytes(&self) -> Vec<u8> {
        let mut key = Self::pair_prefix(&self.pair_id);
        key.extend_from_slice(self.path.as_bytes());
        key
    }
}

#[derive(Clone, Debug)]
pub struct MerkleNodeKey {
    pub pair_id: PairId,
    pub node_path: String,
}

impl MerkleNodeKey {
    #[must_use]
    pub fn pair_prefix(pair_id: &PairId) -> Vec<u8> {
        pair_id.as_bytes().to_vec()
    }
}

impl StoreKey for MerkleNodeKey {
    const COLUMN: Column = Column::MerkleNodes;

    fn key_bytes(&self) -> Vec<u8> {
        let mut key = Self::pair_prefix(&self.pair_id);
        key.extend_from_slice(self.node_path.as_bytes());
        key
    }
}

#[derive(Clone, Copy, Debug)]
pub struct IndexRootKey(pub PairId);

impl StoreKey for IndexRootKey {
    const COLUMN: Column = Column::IndexRoots;

    fn key_bytes(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CasChunkKey(pub Hash);

impl StoreKey for CasChunkKey {
    const COLUMN: Column = Column::CasIndex;

    fn key_bytes(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RelayStateKey(pub PairId);

impl StoreKey for RelayStateKey {
    const COLUMN: Column = Column::RelayState;

    fn key_bytes(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }
}

/// Keys sync-history records by pair and completion time; big-endian
/// timestamp keeps scans chronological.
#[derive(Clone, Copy, Debug)]
pub struct SyncHistoryKey {
    pub pair_id: PairId,
    pub finished_at: u64,
}

impl SyncHistoryKey {
    #[must_use]
    pub fn pair_prefix(pair_id: &PairId) -> Vec<u8> {
        pair_id.as_bytes().to_vec()
    }
}

impl StoreKey for SyncHistoryKey {
    const COLUMN: Column = Column::SyncHistory;

    fn key_bytes(&self) -> Vec<u8> {
        let mut key = Self::pair_prefix(&self.pair_id);
        key.extend_from_slice(&self.finished_at.to_be_bytes());
        key
    }
}

#[derive(Clone, Debug)]
pub struct ConflictKey {
    pub pair_id: PairId,
    pub path: String,
}

impl ConflictKey {
    #[must_use]
    pub fn pair_prefix(pair_id: &PairId) -> Vec<u8> {
        pair_id.as_bytes().to_vec()
    }
}

impl StoreKey for ConflictKey {
    const COLUMN: Column = Column::Conflicts;

    fn key_bytes(&self) -> Vec<u8> {
        let mut key = Self::pair_prefix(&self.pair_id);
        key.extend_from_slice(self.path.as_bytes());
        key
    }
}
