use serde::{Deserialize, Serialize};

use butterfly_primitives::{DeviceId, FileEntry, Hash, IndexId, PairId, PublicKey};
use butterfly_storage::RemoteNodes;

pub const PROTOCOL_VERSION: u16 = 1;

/// One wire frame. The `cp`/`v` fields ride along for compatibility with
/// older peers; the `type` tag is the real discriminator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub cp: bool,
    pub v: u16,
    pub msg_id: u64,
    pub from_device_id: DeviceId,
    /// Sender clock, unix ms.
    pub ts: u64,
    #[serde(flatten)]
    pub message: Message,
}

impl Frame {
    #[must_use]
    pub fn new(msg_id: u64, from_device_id: DeviceId, ts: u64, message: Message) -> Self {
        Self {
            cp: true,
            v: PROTOCOL_VERSION,
            msg_id,
            from_device_id,
            ts,
            message,
        }
    }
}

/// Everything a peer can say, one variant per frame type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    /// Session opener: who we are plus one fingerprint per local pair.
    #[serde(rename = "BDP_HELLO")]
    Hello {
        #[serde(rename = "deviceName")]
        device_name: String,
        #[serde(rename = "publicKey")]
        public_key: PublicKey,
        pairs: Vec<PairHello>,
    },

    /// One breadth-first diff round: "give me these nodes' children".
    #[serde(rename = "BDP_MERKLE_QUERY")]
    MerkleQuery {
        #[serde(rename = "pairId")]
        pair_id: PairId,
        #[serde(rename = "nodePaths")]
        node_paths: Vec<String>,
    },

    /// Answer to a query round.
    #[serde(rename = "BDP_MERKLE_NODES")]
    MerkleNodes {
        #[serde(rename = "pairId")]
        pair_id: PairId,
        nodes: RemoteNodes,
    },

    /// Index exchange: either the entries at the given paths (full walk)
    /// or everything the peer authored after `since_seq` (delta).
    #[serde(rename = "BDP_ENTRIES_REQUEST")]
    EntriesRequest {
        #[serde(rename = "pairId")]
        pair_id: PairId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        paths: Option<Vec<String>>,
        #[serde(rename = "sinceSeq", default, skip_serializing_if = "Option::is_none")]
        since_seq: Option<u64>,
    },

    #[serde(rename = "BDP_ENTRIES")]
    Entries {
        #[serde(rename = "pairId")]
        pair_id: PairId,
        entries: Vec<FileEntry>,
    },

    /// Receiver-driven transfer opener: what it already holds and what it
    /// needs, after consulting its chunk store.
    #[serde(rename = "BDP_CHUNK_REQUEST")]
    ChunkRequest {
        #[serde(rename = "transferId")]
        transfer_id: u64,
        #[serde(rename = "pairId")]
        pair_id: PairId,
        path: String,
        have: Vec<Hash>,
        need: Vec<Hash>,
        #[serde(rename = "totalChunks")]
        total_chunks: u32,
    },

    /// Header of one binary chunk frame; the bytes follow the header in
    /// the same message.
    #[serde(rename = "BDP_CHUNK")]
    Chunk {
        #[serde(rename = "transferId")]
        transfer_id: u64,
        #[serde(rename = "chunkHash")]
        chunk_hash: Hash,
        index: u32,
        #[serde(rename = "isLast")]
        is_last: bool,
        compressed: bool,
        #[serde(rename = "originalSize")]
        original_size: u32,
    },

    /// Transfer outcome, sent by the receiver after assembly.
    #[serde(rename = "BDP_ACK")]
    Ack {
        #[serde(rename = "transferId")]
        transfer_id: u64,
        status: AckStatus,
        #[serde(
            rename = "receivedHash",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        received_hash: Option<Hash>,
    },

    /// End of one side's plan execution, carrying its new root for the
    /// peer to cross-check.
    #[serde(rename = "BDP_SYNC_COMPLETE")]
    SyncComplete {
        #[serde(rename = "pairId")]
        pair_id: PairId,
        #[serde(rename = "rootHash")]
        root_hash: Hash,
    },

    #[serde(rename = "BDP_PING")]
    Ping,

    #[serde(rename = "BDP_PONG")]
    Pong,

    /// Clean session end (no shared pair, or caller-initiated shutdown).
    #[serde(rename = "BDP_BYE")]
    Bye {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Per-pair fingerprint inside a hello.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairHello {
    pub pair_id: PairId,
    pub merkle_root: Hash,
    pub max_seq: u64,
    pub index_id: IndexId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    HashMismatch,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceId {
        DeviceId::from([1; 21])
    }

    #[test]
    fn test_frame_json_shape() {
        let frame = Frame::new(
            7,
            device(),
            1_000,
            Message::MerkleQuery {
                pair_id: PairId::from([2; 32]),
                node_paths: vec![String::new(), "docs".into()],
            },
        );

        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(json["cp"], true);
        assert_eq!(json["v"], 1);
        assert_eq!(json["type"], "BDP_MERKLE_QUERY");
        assert_eq!(json["payload"]["nodePaths"][1], "docs");
        assert_eq!(json["msgId"], 7);

        let back: Frame = serde_json::from_value(json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_payloadless_frames_round_trip() {
        for message in [Message::Ping, Message::Pong, Message::Bye { reason: None }] {
            let frame = Frame::new(1, device(), 2, message.clone());
            let json = serde_json::to_string(&frame).unwrap();
            let back: Frame = serde_json::from_str(&json).unwrap();
            assert_eq!(back.message, message);
        }
    }

    #[test]
    fn test_ack_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&AckStatus::HashMismatch).unwrap(),
            "\"hash_mismatch\""
        );
    }
}
