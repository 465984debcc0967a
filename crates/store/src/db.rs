use core::fmt;
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::StoreError;

/// The typed collections the engine persists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(usize)]
pub enum Column {
    /// The local device record (singleton).
    Devices,
    /// The local private-key handle (singleton).
    DeviceKeys,
    /// Pair descriptors, keyed by pair id.
    Pairs,
    /// File entries, keyed by `(pair id, path)`.
    FileIndex,
    /// Merkle nodes, keyed by `(pair id, node path)`.
    MerkleNodes,
    /// Index roots, keyed by pair id.
    IndexRoots,
    /// Chunk metadata, keyed by chunk hash.
    CasIndex,
    /// Relay bookkeeping, keyed by pair id.
    RelayState,
    /// Finished-session records, keyed by `(pair id, finished at)`.
    SyncHistory,
    /// Conflicts awaiting manual resolution, keyed by `(pair id, path)`.
    Conflicts,
}

impl Column {
    pub const ALL: [Self; 10] = [
        Self::Devices,
        Self::DeviceKeys,
        Self::Pairs,
        Self::FileIndex,
        Self::MerkleNodes,
        Self::IndexRoots,
        Self::CasIndex,
        Self::RelayState,
        Self::SyncHistory,
        Self::Conflicts,
    ];
}

/// The raw storage engine. Writes within one [`Transaction`] are applied
/// atomically; there is no atomicity requirement across separate calls.
pub trait Database: Send + Sync + fmt::Debug + 'static {
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Box<[u8]>>, StoreError>;

    fn has(&self, column: Column, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(column, key)?.is_some())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;

    /// `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError>;

    fn apply(&self, transaction: Transaction) -> Result<(), StoreError>;
}

#[derive(Debug)]
enum Op {
    Put {
        column: Column,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        column: Column,
        key: Vec<u8>,
    },
}

/// A write batch spanning any set of columns.
#[derive(Debug, Default)]
pub struct Transaction {
    ops: Vec<Op>,
}

impl Transaction {
    pub fn put_raw(&mut self, column: Column, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(Op::Put { column, key, value });
    }

    pub fn delete_raw(&mut self, column: Column, key: Vec<u8>) {
        self.ops.push(Op::Delete { column, key });
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

type ColumnMap = BTreeMap<Box<[u8]>, Box<[u8]>>;

/// The bundled storage engine: one ordered map per column behind a
/// readers-writer lock.
#[derive(Debug, Default)]
pub struct InMemoryDB {
    columns: RwLock<[ColumnMap; Column::ALL.len()]>,
}

impl InMemoryDB {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, [ColumnMap; Column::ALL.len()]> {
        self.columns.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, [ColumnMap; Column::ALL.len()]> {
        self.columns.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Database for InMemoryDB {
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let _prev = self.write()[column as usize].insert(key.into(), value.into());
        Ok(())
    }

    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Box<[u8]>>, StoreError> {
        Ok(self.read()[column as usize].get(key).cloned())
    }

    fn has(&self, column: Column, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.read()[column as usize].contains_key(key))
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let _prev = self.write()[column as usize].remove(key);
        Ok(())
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let columns = self.read();
        let entries = columns[column as usize]
            .range(prefix.to_vec().into_boxed_slice()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(entries)
    }

    fn apply(&self, transaction: Transaction) -> Result<(), StoreError> {
        let mut columns = self.write();
        for op in transaction.ops {
            match op {
                Op::Put { column, key, value } => {
                    let _prev =
                        columns[column as usize].insert(key.into_boxed_slice(), value.into());
                }
                Op::Delete { column, key } => {
                    let _prev = columns[column as usize].remove(key.as_slice());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/db.rs"]
mod tests;
