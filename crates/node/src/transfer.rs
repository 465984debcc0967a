//! Chunk transfers: the receiver-driven have/need exchange.
//!
//! The receiver owns a transfer: it inspects its chunk store, requests
//! what is missing, verifies every frame and re-requests bad chunks. The
//! sender is a stateless responder, so any number of transfers interleave
//! on one channel without coordination beyond the transfer id.

use std::collections::BTreeSet;

use bytes::Bytes;
use tokio::time::timeout;
use tracing::{debug, warn};

use butterfly_blobstore::ChunkStore;
use butterfly_primitives::{compression_worthwhile, FileEntry, Hash, PairId, SyncError};
use butterfly_wire::{compress, AckStatus, Message};

use crate::io::{IncomingChunk, SessionIo};
use crate::SessionConfig;

/// Receiver-side outcome accounting.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DownloadStats {
    pub bytes_received: u64,
    /// Bytes the `have` set kept off the wire.
    pub bytes_saved_dedup: u64,
}

/// Sender-side outcome accounting.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ServeStats {
    pub bytes_sent: u64,
    /// `original - shipped` over chunks that passed the compression gate.
    pub bytes_saved_compression: u64,
}

fn chunk_len(entry: &FileEntry, index: usize) -> u64 {
    let full = u64::from(entry.chunk_size);
    let last = entry.chunk_hashes.len().saturating_sub(1);
    if index == last {
        entry.size - full * last as u64
    } else {
        full
    }
}

/// Fetches every chunk of `entry` that is not already in the store.
/// Bytes land in the CAS only; the entry itself is applied later, at
/// finalization.
pub(crate) async fn download_file(
    io: &SessionIo,
    cas: &ChunkStore,
    pair_id: PairId,
    transfer_id: u64,
    entry: &FileEntry,
    config: &SessionConfig,
) -> Result<DownloadStats, SyncError> {
    let mut have = Vec::new();
    let mut need = Vec::new();
    let mut seen = BTreeSet::new();
    let mut stats = DownloadStats::default();

    for (index, hash) in entry.chunk_hashes.iter().enumerate() {
        if !seen.insert(*hash) {
            // A repeated block within the file travels once.
            stats.bytes_saved_dedup += chunk_len(entry, index);
            continue;
        }
        if cas.has(hash).map_err(SyncError::from)? {
            stats.bytes_saved_dedup += chunk_len(entry, index);
            have.push(*hash);
        } else {
            need.push(*hash);
        }
    }

    if need.is_empty() {
        return Ok(stats);
    }

    let mut chunk_rx = io.register_transfer(transfer_id);
    let try_compress = compression_worthwhile(&entry.path);

    let request = Message::ChunkRequest {
        transfer_id,
        pair_id,
        path: entry.path.clone(),
        have,
        need: need.clone(),
        total_chunks: entry.chunk_hashes.len() as u32,
    };
    io.send(request).await?;

    let mut missing: BTreeSet<Hash> = need.into_iter().collect();
    let mut retries = 0;

    let result = loop {
        let incoming = match timeout(config.chunk_timeout, chunk_rx.recv()).await {
            Ok(Some(incoming)) => incoming,
            Ok(None) => {
                break Err(SyncError::ChannelClosed(format!(
                    "transfer {transfer_id} routing closed"
                )))
            }
            Err(_elapsed) => {
                break Err(SyncError::Timeout(format!(
                    "chunk for {} overdue",
                    entry.path
                )))
            }
        };

        let IncomingChunk {
            chunk_hash,
            compressed,
            data,
            ..
        } = incoming;

        let bytes = if compressed {
            match compress::inflate(&data) {
                Some(bytes) => bytes,
                None => {
                    // Undecodable counts as a mismatch; ask again.
                    if !resend(
                        io,
                        transfer_id,
                        pair_id,
                        entry,
                        chunk_hash,
                        Hash::ZERO,
                        &mut retries,
                        config.max_retries,
                    )
                    .await?
                    {
                        break Err(SyncError::TransferFailed(format!(
                            "chunk {chunk_hash} for {} failed to decompress repeatedly",
                            entry.path
                        )));
                    }
                    continue;
                }
            }
        } else {
            data.to_vec()
        };

        let actual = Hash::digest(&bytes);
        if actual != chunk_hash {
            if !resend(
                io,
                transfer_id,
                pair_id,
                entry,
                chunk_hash,
                actual,
                &mut retries,
                config.max_retries,
            )
            .await?
            {
                break Err(SyncError::TransferFailed(format!(
                    "chunk {chunk_hash} for {} kept failing verification",
                    entry.path
                )));
            }
            continue;
        }

        let _hash = cas.put(&bytes, try_compress).await.map_err(SyncError::from)?;
        stats.bytes_received += bytes.len() as u64;

        if missing.remove(&chunk_hash) && missing.is_empty() {
            break Ok(stats);
        }
    };

    io.unregister_transfer(transfer_id);

    match result {
        Ok(stats) => {
            io.send(Message::Ack {
                transfer_id,
                status: AckStatus::Ok,
                received_hash: None,
            })
            .await?;
            debug!(path = %entry.path, transfer_id, "transfer complete");
            Ok(stats)
        }
        Err(err) => {
            let _best_effort = io
                .send(Message::Ack {
                    transfer_id,
                    status: AckStatus::Failed,
                    received_hash: None,
                })
                .await;
            Err(err)
        }
    }
}

/// Reports a bad chunk and re-requests it. Returns false once the
/// configured retry budget is spent.
#[expect(clippy::too_many_arguments, reason = "one resend site, fully spelled out")]
async fn resend(
    io: &SessionIo,
    transfer_id: u64,
    pair_id: PairId,
    entry: &FileEntry,
    expected: Hash,
    received: Hash,
    retries: &mut u32,
    max_retries: u32,
) -> Result<bool, SyncError> {
    *retries += 1;
    warn!(
        path = %entry.path,
        %expected,
        %received,
        retry = *retries,
        "chunk failed verification"
    );
    if *retries > max_retries {
        return Ok(false);
    }

    io.send(Message::Ack {
        transfer_id,
        status: AckStatus::HashMismatch,
        received_hash: Some(received),
    })
    .await?;
    io.send(Message::ChunkRequest {
        transfer_id,
        pair_id,
        path: entry.path.clone(),
        have: Vec::new(),
        need: vec![expected],
        total_chunks: entry.chunk_hashes.len() as u32,
    })
    .await?;

    Ok(true)
}

/// Sender side: streams the requested chunks, compressing each through
/// the codec gate.
pub(crate) async fn serve_chunks(
    io: &SessionIo,
    cas: &ChunkStore,
    transfer_id: u64,
    path: &str,
    need: &[Hash],
) -> Result<ServeStats, SyncError> {
    let mut stats = ServeStats::default();

    for (position, hash) in need.iter().enumerate() {
        let bytes = cas.get(hash).await.map_err(SyncError::from)?;
        let original_size = bytes.len() as u32;

        let (payload, compressed) = match compress::gate(path, &bytes) {
            Some(smaller) => (smaller, true),
            None => (bytes, false),
        };

        if compressed {
            stats.bytes_saved_compression += u64::from(original_size) - payload.len() as u64;
        }
        stats.bytes_sent += payload.len() as u64;

        io.send_chunk(
            Message::Chunk {
                transfer_id,
                chunk_hash: *hash,
                index: position as u32,
                is_last: position + 1 == need.len(),
                compressed,
                original_size,
            },
            Bytes::from(payload),
        )
        .await?;
    }

    Ok(stats)
}

/// Rebuilds the file from its chunks and verifies the whole-file hash.
pub(crate) async fn assemble(cas: &ChunkStore, entry: &FileEntry) -> Result<Vec<u8>, SyncError> {
    let mut bytes = Vec::with_capacity(entry.size as usize);
    for hash in &entry.chunk_hashes {
        bytes.extend_from_slice(&cas.get(hash).await.map_err(SyncError::from)?);
    }

    let actual = Hash::digest(&bytes);
    if actual != entry.hash {
        return Err(SyncError::HashMismatch {
            expected: entry.hash,
            actual,
        });
    }

    Ok(bytes)
}
