use thiserror::Error;

use crate::hash::Hash;
use crate::pair::PairId;

/// The error vocabulary shared across the sync stack.
///
/// Components recover locally where they can (a chunk hash mismatch is
/// re-requested inside the transfer, a rate limit schedules a delayed
/// retry); everything else surfaces here and the session engine either
/// retries with backoff or fails the session.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SyncError {
    #[error("pair not found: {0}")]
    PairNotFound(PairId),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("index corrupt: {0}")]
    IndexCorrupt(String),

    #[error("storage full")]
    StorageFull,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("{0} conflicts awaiting resolution")]
    ConflictUnresolved(usize),

    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u16, theirs: u16 },

    #[error("rate limited, retry in {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: Hash, actual: Hash },

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl SyncError {
    /// Whether the session engine should give up instead of scheduling a
    /// retry. Timeouts, failed transfers, rate limits and transient
    /// storage errors are worth retrying; everything structural is not.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::PairNotFound(_)
            | Self::Crypto(_)
            | Self::IndexCorrupt(_)
            | Self::StorageFull
            | Self::PermissionDenied(_)
            | Self::VersionMismatch { .. } => true,
            Self::TransferFailed(_)
            | Self::ConflictUnresolved(_)
            | Self::RateLimited { .. }
            | Self::Timeout(_)
            | Self::HashMismatch { .. }
            | Self::ChannelClosed(_)
            | Self::Storage(_) => false,
        }
    }
}
