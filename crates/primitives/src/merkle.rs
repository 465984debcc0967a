use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use rand::{CryptoRng, Rng};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::hash::Hash;

/// One node of the Merkle tree mirroring the folder hierarchy.
///
/// `node_path` is the '/'-separated directory path, `""` for the root.
/// Leaves are files (their hash is the file entry's content hash);
/// internal nodes hash the canonical encoding of their children.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleNode {
    pub node_path: String,
    pub hash: Hash,
    /// Child name (single path component) to child hash, kept sorted so
    /// the canonical encoding is deterministic.
    pub children: BTreeMap<String, Hash>,
    pub child_count: u32,
    pub updated_at: u64,
}

impl MerkleNode {
    /// Canonical encoding of an internal node: for each child in Unicode
    /// code-point order, `name ':' hex(childHash) '\n'`.
    #[must_use]
    pub fn canonical_encoding(children: &BTreeMap<String, Hash>) -> Vec<u8> {
        let mut encoding = Vec::with_capacity(children.len() * 80);
        for (name, hash) in children {
            encoding.extend_from_slice(name.as_bytes());
            encoding.push(b':');
            encoding.extend_from_slice(hash.to_hex().as_bytes());
            encoding.push(b'\n');
        }
        encoding
    }

    /// SHA-256 over the canonical encoding.
    #[must_use]
    pub fn hash_children(children: &BTreeMap<String, Hash>) -> Hash {
        Hash::digest(&Self::canonical_encoding(children))
    }
}

/// Opaque identifier regenerated whenever the index is rebuilt from
/// scratch. Unequal ids tell the peer the two sides share no delta
/// history and must exchange the full index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct IndexId([u8; 16]);

impl IndexId {
    #[must_use]
    pub fn random(rng: &mut (impl Rng + CryptoRng)) -> Self {
        let mut bytes = [0; 16];
        rng.fill(&mut bytes);
        Self(bytes)
    }
}

#[derive(Copy, Clone, Debug, Error)]
#[error("invalid index id")]
pub struct InvalidIndexId;

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexId({self})")
    }
}

impl FromStr for IndexId {
    type Err = InvalidIndexId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(InvalidIndexId);
        }
        let mut bytes = [0; 16];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| InvalidIndexId)?;
        Ok(Self(bytes))
    }
}

impl Serialize for IndexId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IndexId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl Visitor<'_> for IdVisitor {
            type Value = IndexId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 32-character hex index id")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(IdVisitor)
    }
}

/// Fingerprint of the whole index for a pair.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRoot {
    pub root_hash: Hash,
    pub entry_count: u64,
    /// Highest locally-authored sequence folded into the index.
    pub max_seq: u64,
    pub index_id: IndexId,
}

#[cfg(test)]
#[path = "tests/merkle.rs"]
mod tests;
