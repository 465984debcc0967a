use std::collections::BTreeSet;

use rand::thread_rng;
use tracing::{debug, warn};

use butterfly_blobstore::ChunkStore;
use butterfly_primitives::{
    compression_worthwhile, now_ms, ClockOrdering, DeviceId, FileEntry, Hash, IndexId, IndexRoot,
    PairId, VectorClock,
};
use butterfly_store::key::{FileEntryKey, IndexRootKey};
use butterfly_store::{Column, Store};

use crate::chunker::{chunks_of, CHUNK_SIZE};
use crate::merkle::MerkleIndex;
use crate::{validate_path, StorageError};

/// What [`FileIndex::apply_remote`] did with an incoming entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The remote revision strictly dominated and replaced ours.
    Applied,
    /// Clocks were identical; nothing to do.
    Identical,
    /// Our revision dominates; the remote entry was dropped.
    IgnoredOlder,
    /// Incomparable clocks. Neither version is stored as the winner; the
    /// caller resolves and rewrites.
    Conflict {
        local: FileEntry,
    },
}

/// The CRDT file index for one pair.
///
/// Rows are only ever rewritten whole: locally with a fresh seq and
/// bumped clock, remotely when the incoming clock strictly dominates.
/// Every write refreshes the affected Merkle subtree and the index root
/// in the same transaction.
#[derive(Clone, Debug)]
pub struct FileIndex {
    store: Store,
    cas: ChunkStore,
    merkle: MerkleIndex,
    pair_id: PairId,
}

impl FileIndex {
    #[must_use]
    pub fn new(store: Store, cas: ChunkStore, pair_id: PairId) -> Self {
        let merkle = MerkleIndex::new(store.clone(), pair_id);
        Self {
            store,
            cas,
            merkle,
            pair_id,
        }
    }

    #[must_use]
    pub fn merkle(&self) -> &MerkleIndex {
        &self.merkle
    }

    #[must_use]
    pub fn pair_id(&self) -> PairId {
        self.pair_id
    }

    /// The current index fingerprint, creating it on first use with a
    /// fresh `index_id`.
    pub fn index_root(&self) -> Result<IndexRoot, StorageError> {
        if let Some(root) = self.store.get(&IndexRootKey(self.pair_id))? {
            return Ok(root);
        }

        let root = IndexRoot {
            root_hash: Hash::ZERO,
            entry_count: 0,
            max_seq: 0,
            index_id: IndexId::random(&mut thread_rng()),
        };
        self.store.put(&IndexRootKey(self.pair_id), &root)?;
        Ok(root)
    }

    pub fn get(&self, path: &str) -> Result<Option<FileEntry>, StorageError> {
        Ok(self.store.get(&self.entry_key(path))?)
    }

    /// Every row, tombstones included, in path order.
    pub fn entries(&self) -> Result<Vec<FileEntry>, StorageError> {
        let rows: Vec<(Box<[u8]>, FileEntry)> = self
            .store
            .scan_prefix(Column::FileIndex, &FileEntryKey::pair_prefix(&self.pair_id))?;
        Ok(rows.into_iter().map(|(_, entry)| entry).collect())
    }

    /// Entries authored by `author` with seq greater than `since_seq`,
    /// the payload of a delta exchange.
    pub fn entries_since(
        &self,
        author: DeviceId,
        since_seq: u64,
    ) -> Result<Vec<FileEntry>, StorageError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| entry.device_id == author && entry.seq > since_seq)
            .collect())
    }

    /// Indexes new or changed local content. The caller supplies the
    /// authoring identity and a freshly claimed seq; chunking, hashing,
    /// CAS refs, the Merkle subtree and the root all update here.
    pub async fn upsert_local(
        &self,
        path: &str,
        bytes: &[u8],
        mtime: u64,
        author: DeviceId,
        seq: u64,
    ) -> Result<FileEntry, StorageError> {
        validate_path(path)?;

        let previous = self.get(path)?;
        let try_compress = compression_worthwhile(path);

        let mut chunk_hashes = Vec::with_capacity(bytes.len() / CHUNK_SIZE as usize + 1);
        for chunk in chunks_of(bytes) {
            chunk_hashes.push(self.cas.put(chunk, try_compress).await?);
        }

        let entry = FileEntry::authored(
            path.to_owned(),
            Hash::digest(bytes),
            bytes.len() as u64,
            mtime,
            chunk_hashes,
            CHUNK_SIZE,
            author,
            seq,
            previous.as_ref().map(|prev| &prev.vector_clock),
        );
        entry.validate()?;

        self.commit_entry(previous.as_ref(), &entry, Some(seq))?;
        debug!(path, seq, "indexed local revision");

        Ok(entry)
    }

    /// Replaces the entry with a tombstone. Returns `None` when there is
    /// nothing live to delete (the claimed seq is then unused, which is
    /// harmless: seqs only need to be monotonic, not dense).
    pub fn mark_deleted(
        &self,
        path: &str,
        author: DeviceId,
        seq: u64,
    ) -> Result<Option<FileEntry>, StorageError> {
        validate_path(path)?;

        let Some(previous) = self.get(path)? else {
            return Ok(None);
        };
        if previous.tombstone {
            return Ok(None);
        }

        let entry = previous.clone().into_tombstone(author, seq, now_ms());
        entry.validate()?;

        self.commit_entry(Some(&previous), &entry, Some(seq))?;
        debug!(path, seq, "indexed tombstone");

        Ok(Some(entry))
    }

    /// Merges a remote revision by vector-clock comparison.
    pub fn apply_remote(&self, remote: FileEntry) -> Result<ApplyOutcome, StorageError> {
        validate_path(&remote.path)?;
        remote.validate()?;

        let local = self.get(&remote.path)?;

        if let Some(local) = &local {
            match local.vector_clock.compare(&remote.vector_clock) {
                ClockOrdering::Equal => return Ok(ApplyOutcome::Identical),
                ClockOrdering::Dominates => return Ok(ApplyOutcome::IgnoredOlder),
                ClockOrdering::Concurrent => {
                    return Ok(ApplyOutcome::Conflict {
                        local: local.clone(),
                    })
                }
                ClockOrdering::DominatedBy => {}
            }
        }

        self.commit_entry(local.as_ref(), &remote, None)?;
        debug!(path = %remote.path, "applied remote revision");

        Ok(ApplyOutcome::Applied)
    }

    /// Chunks of `entry` not present in the local chunk store. Non-empty
    /// for entries learned through the relay before any direct transfer.
    pub fn missing_content(&self, entry: &FileEntry) -> Result<Vec<Hash>, StorageError> {
        let mut missing = Vec::new();
        for hash in distinct(&entry.chunk_hashes) {
            if !self.cas.has(&hash)? {
                missing.push(hash);
            }
        }
        Ok(missing)
    }

    /// Writes a conflict resolution: a locally authored entry whose
    /// merged clock dominates both divergent revisions, so every peer
    /// accepts it as a plain remote update.
    pub fn record_resolution(&self, entry: FileEntry, seq: u64) -> Result<(), StorageError> {
        validate_path(&entry.path)?;
        entry.validate()?;

        let previous = self.get(&entry.path)?;
        self.commit_entry(previous.as_ref(), &entry, Some(seq))?;
        debug!(path = %entry.path, seq, "recorded conflict resolution");
        Ok(())
    }

    /// Claims references for chunks that were still missing when their
    /// entry was applied (the relay-then-transfer order). The caller
    /// passes exactly the hashes it previously saw in
    /// [`Self::missing_content`], once, after the bytes arrive.
    pub fn register_content(&self, hashes: &[Hash]) -> Result<(), StorageError> {
        for hash in hashes {
            if self.cas.has(hash)? {
                self.cas.inc_ref(hash)?;
            }
        }
        Ok(())
    }

    /// Removes tombstones every supplied peer clock covers. With no peer
    /// clocks there is no proof, so nothing is purged.
    pub fn purge_tombstones(&self, acked: &[VectorClock]) -> Result<usize, StorageError> {
        if acked.is_empty() {
            return Ok(0);
        }

        let mut tx = self.store.transaction();
        let mut purged = 0;

        for entry in self.entries()? {
            if !entry.tombstone {
                continue;
            }
            if acked
                .iter()
                .all(|peer_clock| entry.vector_clock.covered_by(peer_clock))
            {
                tx.delete_typed(&self.entry_key(&entry.path));
                purged += 1;
            }
        }

        if purged > 0 {
            self.store.commit(tx)?;
            debug!(purged, "purged acknowledged tombstones");
        }

        Ok(purged)
    }

    /// Rebuilds the Merkle tree and root from the raw rows, stamping a
    /// fresh `index_id` so peers fall back to a full exchange.
    pub fn rebuild(&self) -> Result<IndexRoot, StorageError> {
        let live: Vec<(String, Hash)> = self
            .entries()?
            .into_iter()
            .filter(|entry| !entry.tombstone)
            .map(|entry| (entry.path.clone(), entry.hash))
            .collect();

        let mut tx = self.store.transaction();
        let root_hash = self.merkle.rebuild(&mut tx, &live)?;

        let previous = self.index_root()?;
        let root = IndexRoot {
            root_hash,
            entry_count: live.len() as u64,
            max_seq: previous.max_seq,
            index_id: IndexId::random(&mut thread_rng()),
        };
        tx.put(&IndexRootKey(self.pair_id), &root)?;
        self.store.commit(tx)?;

        warn!(pair_id = ?self.pair_id, "rebuilt index from scratch");
        Ok(root)
    }

    fn commit_entry(
        &self,
        previous: Option<&FileEntry>,
        entry: &FileEntry,
        local_seq: Option<u64>,
    ) -> Result<(), StorageError> {
        // Reference counts first: distinct hashes per revision, and only
        // chunks the store actually holds (relay deltas arrive before
        // their bytes do).
        if let Some(previous) = previous.filter(|prev| !prev.tombstone) {
            for hash in distinct(&previous.chunk_hashes) {
                self.cas.dec_ref(&hash)?;
            }
        }
        if !entry.tombstone {
            for hash in distinct(&entry.chunk_hashes) {
                if self.cas.has(&hash)? {
                    self.cas.inc_ref(&hash)?;
                }
            }
        }

        let mut tx = self.store.transaction();
        tx.put(&self.entry_key(&entry.path), entry)?;

        let leaf = (!entry.tombstone).then_some(entry.hash);
        let root_hash = self.merkle.apply_leaf_change(&mut tx, &entry.path, leaf)?;

        let mut root = self.index_root()?;
        root.root_hash = root_hash;
        let was_live = previous.is_some_and(|prev| !prev.tombstone);
        let is_live = !entry.tombstone;
        match (was_live, is_live) {
            (false, true) => root.entry_count += 1,
            (true, false) => root.entry_count = root.entry_count.saturating_sub(1),
            _ => {}
        }
        if let Some(seq) = local_seq {
            root.max_seq = root.max_seq.max(seq);
        }
        tx.put(&IndexRootKey(self.pair_id), &root)?;

        self.store.commit(tx)?;
        Ok(())
    }

    fn entry_key(&self, path: &str) -> FileEntryKey {
        FileEntryKey {
            pair_id: self.pair_id,
            path: path.to_owned(),
        }
    }
}

/// Distinct hashes in first-seen order: a chunk repeated within one file
/// still counts as a single reference from that entry.
fn distinct(hashes: &[Hash]) -> Vec<Hash> {
    let mut seen = BTreeSet::new();
    hashes
        .iter()
        .copied()
        .filter(|hash| seen.insert(*hash))
        .collect()
}

#[cfg(test)]
#[path = "tests/index.rs"]
mod tests;
