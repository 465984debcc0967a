use std::collections::btree_map::{BTreeMap, Iter};

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::device::DeviceId;

/// Outcome of comparing two vector clocks under the component-wise partial
/// order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Every component equal.
    Equal,
    /// `self` strictly dominates the other clock.
    Dominates,
    /// The other clock strictly dominates `self`.
    DominatedBy,
    /// Neither dominates: the writes were concurrent.
    Concurrent,
}

/// Mapping from device id to that device's sequence number.
///
/// Two clocks are comparable iff one is component-wise `>=` the other over
/// the union of their keys; missing components count as zero.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<DeviceId, u64>);

impl VectorClock {
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// The component for `device`, zero when absent.
    #[must_use]
    pub fn get(&self, device: &DeviceId) -> u64 {
        self.0.get(device).copied().unwrap_or(0)
    }

    /// Sets the component for `device`. Components never decrease on the
    /// authoring device; callers pass monotonically increasing values.
    pub fn set(&mut self, device: DeviceId, seq: u64) {
        let _prev = self.0.insert(device, seq);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, DeviceId, u64> {
        self.0.iter()
    }

    /// Component-wise maximum of both clocks, used when a conflict
    /// resolution folds two divergent histories into one.
    #[must_use]
    pub fn merged_with(&self, other: &Self) -> Self {
        let mut merged = self.0.clone();
        for (device, &seq) in &other.0 {
            let slot = merged.entry(*device).or_insert(0);
            *slot = (*slot).max(seq);
        }
        Self(merged)
    }

    #[must_use]
    pub fn compare(&self, other: &Self) -> ClockOrdering {
        let mut ours_ahead = false;
        let mut theirs_ahead = false;

        for device in self.0.keys().chain(other.0.keys()) {
            let ours = self.get(device);
            let theirs = other.get(device);

            if ours > theirs {
                ours_ahead = true;
            } else if theirs > ours {
                theirs_ahead = true;
            }

            if ours_ahead && theirs_ahead {
                return ClockOrdering::Concurrent;
            }
        }

        match (ours_ahead, theirs_ahead) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Dominates,
            (false, true) => ClockOrdering::DominatedBy,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True when `other` has seen every component of `self`.
    ///
    /// Tombstones may be purged once every known peer acknowledges a clock
    /// that covers the tombstone's clock.
    #[must_use]
    pub fn covered_by(&self, other: &Self) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::Equal | ClockOrdering::DominatedBy
        )
    }
}

impl From<BTreeMap<DeviceId, u64>> for VectorClock {
    fn from(components: BTreeMap<DeviceId, u64>) -> Self {
        Self(components)
    }
}

impl FromIterator<(DeviceId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (DeviceId, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
#[path = "tests/clock.rs"]
mod tests;
