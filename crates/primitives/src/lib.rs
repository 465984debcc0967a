//! Shared data model for the Butterfly Delta Protocol.
//!
//! Everything here is a plain value type: identifiers, hashes, vector
//! clocks, index entries, Merkle nodes and relay records. Cross-component
//! references are always by hash or id, never by pointer, so these types
//! serialize cleanly into the key/value store (borsh) and onto the wire
//! (serde_json).

pub mod clock;
pub mod device;
pub mod entry;
pub mod error;
pub mod hash;
pub mod identity;
pub mod merkle;
pub mod pair;
pub mod relay;

use std::time::{SystemTime, UNIX_EPOCH};

pub use crate::clock::{ClockOrdering, VectorClock};
pub use crate::device::{Device, DeviceId};
pub use crate::entry::{compression_worthwhile, FileEntry};
pub use crate::error::SyncError;
pub use crate::hash::Hash;
pub use crate::identity::{PrivateKey, PublicKey};
pub use crate::merkle::{IndexId, IndexRoot, MerkleNode};
pub use crate::pair::{ConflictStrategy, Pair, PairId, PeerDescriptor, SyncDirection};
pub use crate::relay::{RelayEnvelope, RelayPayload, RelayState};

/// Milliseconds since the unix epoch. All persisted and wire timestamps
/// use this representation.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
