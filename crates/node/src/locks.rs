use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;

use butterfly_primitives::PairId;

/// Per-pair readers-writer locks.
///
/// The index, Merkle tree and chunk references for one pair mutate only
/// under this lock's write half; status reads take the read half. Within
/// one process this also covers the "two instances" case: a second engine
/// over the same store shares the same lock table.
#[derive(Clone, Debug, Default)]
pub struct PairLocks {
    locks: Arc<Mutex<HashMap<PairId, Arc<RwLock<()>>>>>,
}

impl PairLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn for_pair(&self, pair_id: &PairId) -> Arc<RwLock<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(*pair_id).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_pair_shares_a_lock() {
        let locks = PairLocks::new();
        let pair = PairId::from([1; 32]);

        let first = locks.for_pair(&pair);
        let second = locks.for_pair(&pair);

        let guard = first.write().await;
        assert!(
            second.try_write().is_err(),
            "the same pair must contend on one lock"
        );
        drop(guard);
        assert!(second.try_write().is_ok());
    }

    #[tokio::test]
    async fn test_different_pairs_do_not_contend() {
        let locks = PairLocks::new();

        let a = locks.for_pair(&PairId::from([1; 32]));
        let b = locks.for_pair(&PairId::from([2; 32]));

        let _guard = a.write().await;
        assert!(b.try_write().is_ok());
    }
}
