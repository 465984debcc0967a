use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use borsh::{BorshDeserialize, BorshSerialize};
use rand::{CryptoRng, Rng};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::device::DeviceId;
use crate::hash::Hash;
use crate::identity::PublicKey;
use crate::merkle::IndexId;

/// The 32-byte shared pair secret.
///
/// Knowing it authorizes membership: it routes relay traffic and seeds the
/// group-key derivation. Rendered as url-safe base64 without padding
/// (43 characters) where it appears as a routing key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct PairId([u8; 32]);

impl PairId {
    #[must_use]
    pub fn random(rng: &mut (impl Rng + CryptoRng)) -> Self {
        let mut bytes = [0; 32];
        rng.fill(&mut bytes);
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

#[derive(Copy, Clone, Debug, Error)]
#[error("invalid pair id")]
pub struct InvalidPairId;

impl From<[u8; 32]> for PairId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The pair id is a capability; keep logs to a prefix.
        let encoded = URL_SAFE_NO_PAD.encode(self.0);
        write!(f, "PairId({}..)", &encoded[..8])
    }
}

impl FromStr for PairId {
    type Err = InvalidPairId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = URL_SAFE_NO_PAD.decode(s).map_err(|_| InvalidPairId)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| InvalidPairId)?;
        Ok(Self(bytes))
    }
}

impl Serialize for PairId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PairId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl Visitor<'_> for IdVisitor {
            type Value = PairId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a url-safe base64 pair id")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(IdVisitor)
    }
}

/// What we know about one peer device in a pair.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    pub device_id: DeviceId,
    pub name: String,
    pub public_key: PublicKey,
}

/// Which way file content is allowed to flow for a pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    #[default]
    Bidirectional,
    UploadOnly,
    DownloadOnly,
}

/// How concurrent edits of the same path are resolved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Greater `mtime` wins, ties broken by greater device id.
    #[default]
    LastWriteWins,
    /// Park the conflict until the user picks a side.
    Manual,
    LocalWins,
    RemoteWins,
}

/// One sync relationship, owned independently by each member device.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pair {
    pub pair_id: PairId,
    pub label: String,
    /// Peer devices seen so far. A device we have only heard of through a
    /// greeting is appended here the first time it says hello.
    pub peers: Vec<PeerDescriptor>,
    /// Local folder binding (a key into the platform folder collaborator).
    pub folder: String,
    pub direction: SyncDirection,
    pub strategy: ConflictStrategy,
    /// Include globs; empty means "everything".
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<u64>,
    /// Last Merkle root each peer reported.
    pub remote_roots: BTreeMap<DeviceId, Hash>,
    /// The peer's index id when we last synced. A changed id means its
    /// index was rebuilt and our delta history with it is void.
    pub remote_index_ids: BTreeMap<DeviceId, IndexId>,
    /// Highest authored seq we have folded in per peer; the basis of an
    /// entries-since delta.
    pub peer_max_seqs: BTreeMap<DeviceId, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<u64>,
}

impl Pair {
    /// A fresh bidirectional pair with default strategy and no filters.
    #[must_use]
    pub fn new(pair_id: PairId, label: String, folder: String) -> Self {
        Self {
            pair_id,
            label,
            peers: Vec::new(),
            folder,
            direction: SyncDirection::default(),
            strategy: ConflictStrategy::default(),
            include: Vec::new(),
            exclude: Vec::new(),
            max_file_size: None,
            remote_roots: BTreeMap::new(),
            remote_index_ids: BTreeMap::new(),
            peer_max_seqs: BTreeMap::new(),
            last_synced_at: None,
        }
    }

    /// Records or refreshes a peer learned from its greeting. First
    /// contact is exactly this: the peer's device id arrives in the hello
    /// frame, never inferred from anything else.
    pub fn learn_peer(&mut self, peer: PeerDescriptor) {
        if let Some(known) = self
            .peers
            .iter_mut()
            .find(|known| known.device_id == peer.device_id)
        {
            *known = peer;
        } else {
            self.peers.push(peer);
        }
    }

    #[must_use]
    pub fn peer(&self, device_id: &DeviceId) -> Option<&PeerDescriptor> {
        self.peers.iter().find(|peer| peer.device_id == *device_id)
    }
}
