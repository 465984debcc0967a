use butterfly_primitives::{Pair, PairId};
use butterfly_store::key::PairKey;
use butterfly_store::{Column, Store, StoreError};

/// Pair descriptor persistence.
#[derive(Clone, Debug)]
pub struct PairRegistry {
    store: Store,
}

impl PairRegistry {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn get(&self, pair_id: &PairId) -> Result<Option<Pair>, StoreError> {
        self.store.get(&PairKey(*pair_id))
    }

    pub fn save(&self, pair: &Pair) -> Result<(), StoreError> {
        self.store.put(&PairKey(pair.pair_id), pair)
    }

    pub fn remove(&self, pair_id: &PairId) -> Result<(), StoreError> {
        self.store.delete(&PairKey(*pair_id))
    }

    pub fn list(&self) -> Result<Vec<Pair>, StoreError> {
        let rows: Vec<(Box<[u8]>, Pair)> = self.store.scan_prefix(Column::Pairs, &[])?;
        Ok(rows.into_iter().map(|(_, pair)| pair).collect())
    }
}
