//! Typed key/value storage for the sync engine.
//!
//! The engine persists everything except chunk bytes here: device records,
//! pair descriptors, the file index, Merkle nodes, chunk metadata, relay
//! state, sync history and parked conflicts. The [`Database`] trait is the
//! collaborator boundary; [`InMemoryDB`] is the bundled engine and anything
//! disk-backed plugs in behind the same trait.

pub mod db;
pub mod key;

use std::sync::Arc;

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

pub use crate::db::{Column, Database, InMemoryDB, Transaction};
use crate::key::StoreKey;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage backend failure: {0}")]
    Backend(String),

    #[error("storage full")]
    Full,
}

/// Cloneable handle over the database, encoding keys and borsh values.
#[derive(Clone, Debug)]
pub struct Store {
    db: Arc<dyn Database>,
}

impl Store {
    #[must_use]
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// A store over a fresh in-memory database, the default for tests and
    /// ephemeral instances.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryDB::new()))
    }

    pub fn get<K: StoreKey, T: BorshDeserialize>(&self, key: &K) -> Result<Option<T>, StoreError> {
        let Some(bytes) = self.db.get(K::COLUMN, &key.key_bytes())? else {
            return Ok(None);
        };
        let value =
            T::try_from_slice(&bytes).map_err(|err| StoreError::Serialization(err.to_string()))?;
        Ok(Some(value))
    }

    pub fn put<K: StoreKey, T: BorshSerialize>(&self, key: &K, value: &T) -> Result<(), StoreError> {
        let bytes =
            borsh::to_vec(value).map_err(|err| StoreError::Serialization(err.to_string()))?;
        self.db.put(K::COLUMN, &key.key_bytes(), &bytes)
    }

    pub fn has<K: StoreKey>(&self, key: &K) -> Result<bool, StoreError> {
        self.db.has(K::COLUMN, &key.key_bytes())
    }

    pub fn delete<K: StoreKey>(&self, key: &K) -> Result<(), StoreError> {
        self.db.delete(K::COLUMN, &key.key_bytes())
    }

    /// All `(key, value)` pairs in `column` whose key starts with
    /// `prefix`, in key order.
    pub fn scan_prefix<T: BorshDeserialize>(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Box<[u8]>, T)>, StoreError> {
        let raw = self.db.scan_prefix(column, prefix)?;
        raw.into_iter()
            .map(|(key, bytes)| {
                let value = T::try_from_slice(&bytes)
                    .map_err(|err| StoreError::Serialization(err.to_string()))?;
                Ok((key, value))
            })
            .collect()
    }

    /// Starts a batch; all writes land atomically on [`Self::commit`].
    #[must_use]
    pub fn transaction(&self) -> Transaction {
        Transaction::default()
    }

    pub fn commit(&self, transaction: Transaction) -> Result<(), StoreError> {
        self.db.apply(transaction)
    }
}

/// Convenience for typed puts inside a transaction.
impl Transaction {
    pub fn put<K: StoreKey, T: BorshSerialize>(
        &mut self,
        key: &K,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes =
            borsh::to_vec(value).map_err(|err| StoreError::Serialization(err.to_string()))?;
        self.put_raw(K::COLUMN, key.key_bytes(), bytes);
        Ok(())
    }

    pub fn delete_typed<K: StoreKey>(&mut self, key: &K) {
        self.delete_raw(K::COLUMN, key.key_bytes());
    }
}
