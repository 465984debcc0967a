use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use butterfly_primitives::{DeviceId, PairId};
use butterfly_storage::PlanSummary;
use butterfly_store::key::SyncHistoryKey;
use butterfly_store::{Store, StoreError};

/// One finished session with one peer, appended to the history
/// collection at finalization.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub pair_id: PairId,
    pub peer_device: DeviceId,
    pub started_at: u64,
    pub finished_at: u64,
    pub summary: PlanSummary,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Bytes the have/need exchange kept off the wire.
    pub bytes_saved_dedup: u64,
    /// `original - compressed` over every chunk shipped deflated.
    pub bytes_saved_compression: u64,
}

impl SyncRecord {
    pub fn append(&self, store: &Store) -> Result<(), StoreError> {
        let key = SyncHistoryKey {
            pair_id: self.pair_id,
            finished_at: self.finished_at,
        };
        store.put(&key, self)
    }

    /// Records for `pair_id`, oldest first.
    pub fn list(store: &Store, pair_id: &PairId) -> Result<Vec<Self>, StoreError> {
        let rows: Vec<(Box<[u8]>, Self)> = store.scan_prefix(
            butterfly_store::Column::SyncHistory,
            &SyncHistoryKey::pair_prefix(pair_id),
        )?;
        Ok(rows.into_iter().map(|(_, record)| record).collect())
    }
}
