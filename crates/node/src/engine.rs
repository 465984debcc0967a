use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use butterfly_blobstore::ChunkStore;
use butterfly_identity::DeviceService;
use butterfly_primitives::{FileEntry, PairId, SyncError};
use butterfly_relay::RelayClient;
use butterfly_storage::{Conflict, FileIndex};
use butterfly_store::key::ConflictKey;
use butterfly_store::{Column, Store};

use crate::folder::FolderSink;
use crate::locks::PairLocks;
use crate::pairs::PairRegistry;
use crate::session::{self, SessionDeps};
use crate::status::EngineStatus;
use crate::SessionConfig;

pub use crate::session::SessionReport;

/// How to settle one parked conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictResolution {
    KeepLocal,
    KeepRemote,
}

/// The process-wide sync engine: one per store, any number of sessions
/// over its lifetime (one at a time per peer channel).
#[derive(Clone, Debug)]
pub struct Engine {
    deps: SessionDeps,
    status_rx: watch::Receiver<EngineStatus>,
}

impl Engine {
    #[must_use]
    pub fn new(
        store: Store,
        cas: ChunkStore,
        device: DeviceService,
        config: SessionConfig,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(EngineStatus::default());

        Self {
            deps: SessionDeps {
                registry: PairRegistry::new(store.clone()),
                store,
                cas,
                device,
                locks: PairLocks::new(),
                relay: None,
                folder: None,
                config,
                status: status_tx,
            },
            status_rx,
        }
    }

    #[must_use]
    pub fn with_relay(mut self, relay: RelayClient) -> Self {
        self.deps.relay = Some(relay);
        self
    }

    #[must_use]
    pub fn with_folder(mut self, folder: Arc<dyn FolderSink>) -> Self {
        self.deps.folder = Some(folder);
        self
    }

    /// Read-only live status; the UI renders this verbatim.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<EngineStatus> {
        self.status_rx.clone()
    }

    #[must_use]
    pub fn registry(&self) -> &PairRegistry {
        &self.deps.registry
    }

    #[must_use]
    pub fn index(&self, pair_id: PairId) -> FileIndex {
        FileIndex::new(self.deps.store.clone(), self.deps.cas.clone(), pair_id)
    }

    /// Runs one sync session over an established channel until both
    /// sides converge, a fatal error lands, or `cancel` fires.
    pub async fn run_session<T>(
        &self,
        channel: butterfly_wire::Channel<T>,
        cancel: CancellationToken,
    ) -> Result<SessionReport, SyncError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        session::run(self.deps.clone(), channel, cancel).await
    }

    /// Indexes new or changed local content, claiming a fresh seq.
    pub async fn scan_local(
        &self,
        pair_id: PairId,
        path: &str,
        bytes: &[u8],
        mtime: u64,
    ) -> Result<FileEntry, SyncError> {
        let lock = self.deps.locks.for_pair(&pair_id);
        let _guard = lock.write().await;

        let device_id = self.deps.device.device_id().map_err(SyncError::from)?;
        let seq = self
            .deps
            .device
            .increment_local_seq()
            .map_err(SyncError::from)?;

        let entry = self
            .index(pair_id)
            .upsert_local(path, bytes, mtime, device_id, seq)
            .await
            .map_err(SyncError::from)?;

        self.note_pending_push(&pair_id);
        Ok(entry)
    }

    /// Tombstones a locally deleted path.
    pub async fn delete_local(
        &self,
        pair_id: PairId,
        path: &str,
    ) -> Result<Option<FileEntry>, SyncError> {
        let lock = self.deps.locks.for_pair(&pair_id);
        let _guard = lock.write().await;

        let index = self.index(pair_id);
        let Some(existing) = index.get(path).map_err(SyncError::from)? else {
            return Ok(None);
        };
        if existing.tombstone {
            return Ok(None);
        }

        let device_id = self.deps.device.device_id().map_err(SyncError::from)?;
        let seq = self
            .deps
            .device
            .increment_local_seq()
            .map_err(SyncError::from)?;

        let tombstone = index
            .mark_deleted(path, device_id, seq)
            .map_err(SyncError::from)?;

        if tombstone.is_some() {
            self.note_pending_push(&pair_id);
        }
        Ok(tombstone)
    }

    /// Conflicts parked for manual resolution, in path order.
    pub fn pending_conflicts(&self, pair_id: &PairId) -> Result<Vec<Conflict>, SyncError> {
        let rows: Vec<(Box<[u8]>, Conflict)> = self
            .deps
            .store
            .scan_prefix(Column::Conflicts, &ConflictKey::pair_prefix(pair_id))
            .map_err(|err| SyncError::Storage(err.to_string()))?;
        Ok(rows.into_iter().map(|(_, conflict)| conflict).collect())
    }

    /// Settles one parked conflict by authoring a revision whose merged
    /// clock dominates both sides, so it propagates as a plain update.
    pub async fn resolve_conflict(
        &self,
        pair_id: PairId,
        path: &str,
        resolution: ConflictResolution,
    ) -> Result<FileEntry, SyncError> {
        let lock = self.deps.locks.for_pair(&pair_id);
        let _guard = lock.write().await;

        let key = ConflictKey {
            pair_id,
            path: path.to_owned(),
        };
        let conflict: Conflict = self
            .deps
            .store
            .get(&key)
            .map_err(|err| SyncError::Storage(err.to_string()))?
            .ok_or_else(|| SyncError::IndexCorrupt(format!("no parked conflict at {path:?}")))?;

        let device_id = self.deps.device.device_id().map_err(SyncError::from)?;
        let seq = self
            .deps
            .device
            .increment_local_seq()
            .map_err(SyncError::from)?;

        let winner = match resolution {
            ConflictResolution::KeepLocal => conflict.local.clone(),
            ConflictResolution::KeepRemote => conflict.remote.clone(),
        };

        let mut vector_clock = conflict
            .local
            .vector_clock
            .merged_with(&conflict.remote.vector_clock);
        vector_clock.set(device_id, seq);

        let resolved = FileEntry {
            vector_clock,
            device_id,
            seq,
            ..winner
        };

        self.index(pair_id)
            .record_resolution(resolved.clone(), seq)
            .map_err(SyncError::from)?;
        self.deps
            .store
            .delete(&key)
            .map_err(|err| SyncError::Storage(err.to_string()))?;
        self.note_pending_push(&pair_id);

        info!(%pair_id, path, ?resolution, "conflict resolved");
        Ok(resolved)
    }

    /// Pulls and applies relay envelopes, parking any conflicts they
    /// surface.
    pub async fn pull_relay(&self, pair_id: PairId) -> Result<usize, SyncError> {
        let Some(relay) = &self.deps.relay else {
            return Ok(0);
        };

        let lock = self.deps.locks.for_pair(&pair_id);
        let _guard = lock.write().await;

        let outcome = relay
            .pull_deltas(&pair_id, &self.index(pair_id))
            .await
            .map_err(SyncError::from)?;

        for conflict in &outcome.conflicts {
            self.deps
                .store
                .put(
                    &ConflictKey {
                        pair_id,
                        path: conflict.path.clone(),
                    },
                    conflict,
                )
                .map_err(|err| SyncError::Storage(err.to_string()))?;
        }

        Ok(outcome.entries_applied)
    }

    /// Sweeps unreferenced chunks past the grace period.
    pub async fn collect_garbage(&self) -> Result<usize, SyncError> {
        self.deps
            .cas
            .gc(butterfly_blobstore::GC_GRACE_MS)
            .await
            .map_err(SyncError::from)
    }

    fn note_pending_push(&self, pair_id: &PairId) {
        if let Some(relay) = &self.deps.relay {
            if let Err(err) = relay.note_pending_push(pair_id) {
                tracing::warn!(%pair_id, %err, "failed to flag pending relay push");
            }
        }
    }
}
