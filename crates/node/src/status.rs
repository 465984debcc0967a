use serde::{Deserialize, Serialize};

use butterfly_primitives::Hash;
use butterfly_storage::PlanSummary;

use crate::history::SyncRecord;

/// Where the state machine currently is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Greeting,
    Diffing,
    DeltaSync,
    FullSync,
    Transferring,
    ResolvingConflict,
    Finalizing,
    Retrying,
    Error,
}

/// Live progress of one in-flight file transfer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub transfer_id: u64,
    pub path: String,
    pub total_chunks: u32,
    pub received_chunks: u32,
    pub bytes_received: u64,
}

/// Read-only snapshot the UI renders verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanSummary>,
    pub transfers: Vec<TransferProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_root: Option<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<SyncRecord>,
}
