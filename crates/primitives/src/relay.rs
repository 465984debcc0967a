use std::collections::VecDeque;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::entry::FileEntry;
use crate::hash::Hash;

/// Upper bound on remembered envelope ids per pair.
pub const MAX_APPLIED_ENVELOPES: usize = 200;

/// The decrypted body of a relay envelope: one batch of index changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayPayload {
    #[serde(rename = "type")]
    pub payload_type: RelayPayloadType,
    pub from_device_id: DeviceId,
    pub delta_entries: Vec<FileEntry>,
    pub affected_paths: Vec<String>,
    pub new_root: Hash,
    /// Author-local sequence range `[from_seq, to_seq]` this delta covers.
    pub from_seq: u64,
    pub to_seq: u64,
    pub pushed_at: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayPayloadType {
    #[serde(rename = "INDEX_DELTA")]
    IndexDelta,
}

/// One encrypted envelope as the relay server stores and returns it.
/// Binary fields are base64 strings on this surface, and the routing
/// identifiers stay opaque strings: the server never interprets them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    /// Server-assigned id.
    pub id: String,
    pub pair_id: String,
    pub from_device_id: String,
    /// 12 raw bytes, so exactly 16 base64 characters.
    pub nonce: String,
    pub ciphertext: String,
    /// 16 raw bytes, so exactly 24 base64 characters.
    pub auth_tag: String,
    pub created_at: u64,
    pub expires_at: u64,
}

/// Body of `POST /bdp/relay/push`. Binary fields are base64.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayPushRequest {
    pub pair_id: String,
    pub from_device_id: String,
    pub nonce: String,
    pub ciphertext: String,
    pub auth_tag: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayPushResponse {
    pub id: String,
    pub expires_at: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayPullResponse {
    pub envelopes: Vec<RelayEnvelope>,
    pub server_time: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayClearResponse {
    pub deleted: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayErrorResponse {
    pub error: String,
}

/// Per-pair relay bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RelayState {
    /// Highest locally-authored seq already pushed.
    pub last_push_seq: u64,
    /// Server time of the last successful pull.
    pub last_fetched_at: u64,
    /// Set when local changes exist that have not been pushed yet.
    pub pending_push: bool,
    /// Recently applied envelope ids, newest last, bounded to
    /// [`MAX_APPLIED_ENVELOPES`].
    applied_envelope_ids: VecDeque<String>,
}

impl RelayState {
    #[must_use]
    pub fn was_applied(&self, envelope_id: &str) -> bool {
        self.applied_envelope_ids
            .iter()
            .any(|id| id == envelope_id)
    }

    /// Remembers an applied envelope, evicting the oldest id beyond the
    /// bound.
    pub fn record_applied(&mut self, envelope_id: String) {
        if self.was_applied(&envelope_id) {
            return;
        }
        self.applied_envelope_ids.push_back(envelope_id);
        while self.applied_envelope_ids.len() > MAX_APPLIED_ENVELOPES {
            let _evicted = self.applied_envelope_ids.pop_front();
        }
    }

    #[must_use]
    pub fn applied_count(&self) -> usize {
        self.applied_envelope_ids.len()
    }
}

#[cfg(test)]
#[path = "tests/relay.rs"]
mod tests;
