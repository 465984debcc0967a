//! Channel plumbing for one session.
//!
//! A session shares one ordered channel between its driver (our plan),
//! its responder (the peer's requests) and any number of in-flight
//! transfers. The reader task demultiplexes inbound frames into queues;
//! the writer task drains a bounded outbound queue into the sink, which
//! doubles as the send-side backpressure: when the peer stops reading,
//! the queue fills and chunk producers wait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use butterfly_primitives::{now_ms, DeviceId, FileEntry, Hash, PairId, PublicKey, SyncError};
use butterfly_storage::RemoteNodes;
use butterfly_wire::{AckStatus, Channel, Frame, Message, PairHello, WireMessage};

/// Outbound queue depth; filling up is the high-water mark.
const SEND_QUEUE_DEPTH: usize = 64;

/// The peer's greeting, with the frame's protocol version attached.
#[derive(Debug)]
pub(crate) struct PeerHello {
    pub device_id: DeviceId,
    pub device_name: String,
    pub public_key: PublicKey,
    pub pairs: Vec<PairHello>,
    pub version: u16,
}

/// One decoded chunk frame, routed to its transfer.
#[derive(Debug)]
pub(crate) struct IncomingChunk {
    pub chunk_hash: Hash,
    pub index: u32,
    pub is_last: bool,
    pub compressed: bool,
    pub original_size: u32,
    pub data: Bytes,
}

/// A request from the peer the responder half answers.
#[derive(Debug)]
pub(crate) enum PeerRequest {
    Merkle {
        pair_id: PairId,
        node_paths: Vec<String>,
    },
    Entries {
        pair_id: PairId,
        paths: Option<Vec<String>>,
        since_seq: Option<u64>,
    },
    Chunks {
        transfer_id: u64,
        pair_id: PairId,
        path: String,
        have: Vec<Hash>,
        need: Vec<Hash>,
        total_chunks: u32,
    },
    Ack {
        transfer_id: u64,
        status: AckStatus,
        received_hash: Option<Hash>,
    },
}

/// Inbound queues the session driver consumes.
#[derive(Debug)]
pub(crate) struct InboundQueues {
    pub hello: mpsc::Receiver<PeerHello>,
    pub merkle_nodes: mpsc::Receiver<(PairId, RemoteNodes)>,
    pub entries: mpsc::Receiver<(PairId, Vec<FileEntry>)>,
    pub sync_complete: mpsc::Receiver<(PairId, Hash)>,
    pub requests: mpsc::Receiver<PeerRequest>,
}

type TransferRoutes = Arc<Mutex<HashMap<u64, mpsc::Sender<IncomingChunk>>>>;

/// Shared send half plus transfer routing.
#[derive(Clone, Debug)]
pub(crate) struct SessionIo {
    outbound: mpsc::Sender<WireMessage>,
    device_id: DeviceId,
    msg_counter: Arc<AtomicU64>,
    transfers: TransferRoutes,
    last_rx: Arc<Mutex<Instant>>,
}

impl SessionIo {
    /// Splits the channel into reader/writer tasks and the demultiplexed
    /// queues. The tasks stop on cancel, channel close or peer bye.
    pub fn start<T>(
        channel: Channel<T>,
        device_id: DeviceId,
        cancel: CancellationToken,
    ) -> (Self, InboundQueues, JoinHandle<()>, JoinHandle<()>)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = channel.split();

        let (outbound, mut outbound_rx) = mpsc::channel::<WireMessage>(SEND_QUEUE_DEPTH);
        let (hello_tx, hello) = mpsc::channel(4);
        let (merkle_tx, merkle_nodes) = mpsc::channel(16);
        let (entries_tx, entries) = mpsc::channel(16);
        let (complete_tx, sync_complete) = mpsc::channel(16);
        let (requests_tx, requests) = mpsc::channel(64);

        let transfers: TransferRoutes = Arc::default();
        let last_rx = Arc::new(Mutex::new(Instant::now()));

        let writer = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        queued = outbound_rx.recv() => {
                            let Some(message) = queued else { break };
                            if let Err(err) = sink.send(message).await {
                                warn!(?err, "channel send failed");
                                cancel.cancel();
                                break;
                            }
                        }
                        () = cancel.cancelled() => {
                            // Flush whatever was queued before the stop:
                            // the peer may be waiting on our completion.
                            while let Ok(message) = outbound_rx.try_recv() {
                                if sink.send(message).await.is_err() {
                                    break;
                                }
                            }
                            let _flushed = sink.flush().await;
                            break;
                        }
                    }
                }
            })
        };

        let io = Self {
            outbound,
            device_id,
            msg_counter: Arc::new(AtomicU64::new(0)),
            transfers,
            last_rx,
        };

        let reader = {
            let io = io.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let incoming = tokio::select! {
                        () = cancel.cancelled() => break,
                        incoming = stream.next() => incoming,
                    };

                    let message = match incoming {
                        Some(Ok(message)) => message,
                        Some(Err(err)) => {
                            warn!(?err, "channel decode failed");
                            cancel.cancel();
                            break;
                        }
                        None => {
                            debug!("channel closed by peer");
                            cancel.cancel();
                            break;
                        }
                    };

                    io.note_received();

                    if io
                        .dispatch(
                            message,
                            &hello_tx,
                            &merkle_tx,
                            &entries_tx,
                            &complete_tx,
                            &requests_tx,
                        )
                        .await
                        .is_err()
                    {
                        cancel.cancel();
                        break;
                    }
                }
            })
        };

        let queues = InboundQueues {
            hello,
            merkle_nodes,
            entries,
            sync_complete,
            requests,
        };

        (io, queues, reader, writer)
    }

    async fn dispatch(
        &self,
        incoming: WireMessage,
        hello_tx: &mpsc::Sender<PeerHello>,
        merkle_tx: &mpsc::Sender<(PairId, RemoteNodes)>,
        entries_tx: &mpsc::Sender<(PairId, Vec<FileEntry>)>,
        complete_tx: &mpsc::Sender<(PairId, Hash)>,
        requests_tx: &mpsc::Sender<PeerRequest>,
    ) -> Result<(), ()> {
        let from = incoming.frame.from_device_id;
        let version = incoming.frame.v;
        let data = incoming.data;

        match incoming.frame.message {
            Message::Hello {
                device_name,
                public_key,
                pairs,
            } => hello_tx
                .send(PeerHello {
                    device_id: from,
                    device_name,
                    public_key,
                    pairs,
                    version,
                })
                .await
                .map_err(drop),

            Message::MerkleNodes { pair_id, nodes } => {
                merkle_tx.send((pair_id, nodes)).await.map_err(drop)
            }

            Message::Entries { pair_id, entries } => {
                entries_tx.send((pair_id, entries)).await.map_err(drop)
            }

            Message::SyncComplete { pair_id, root_hash } => {
                complete_tx.send((pair_id, root_hash)).await.map_err(drop)
            }

            Message::MerkleQuery {
                pair_id,
                node_paths,
            } => requests_tx
                .send(PeerRequest::Merkle {
                    pair_id,
                    node_paths,
                })
                .await
                .map_err(drop),

            Message::EntriesRequest {
                pair_id,
                paths,
                since_seq,
            } => requests_tx
                .send(PeerRequest::Entries {
                    pair_id,
                    paths,
                    since_seq,
                })
                .await
                .map_err(drop),

            Message::ChunkRequest {
                transfer_id,
                pair_id,
                path,
                have,
                need,
                total_chunks,
            } => requests_tx
                .send(PeerRequest::Chunks {
                    transfer_id,
                    pair_id,
                    path,
                    have,
                    need,
                    total_chunks,
                })
                .await
                .map_err(drop),

            Message::Ack {
                transfer_id,
                status,
                received_hash,
            } => requests_tx
                .send(PeerRequest::Ack {
                    transfer_id,
                    status,
                    received_hash,
                })
                .await
                .map_err(drop),

            Message::Chunk {
                transfer_id,
                chunk_hash,
                index,
                is_last,
                compressed,
                original_size,
            } => {
                let route = {
                    let transfers = self.lock_transfers();
                    transfers.get(&transfer_id).cloned()
                };
                let Some(route) = route else {
                    trace!(transfer_id, "chunk for unknown transfer dropped");
                    return Ok(());
                };
                // A dead route means that transfer gave up; the stray
                // chunk is harmless, the session is not.
                if route
                    .send(IncomingChunk {
                        chunk_hash,
                        index,
                        is_last,
                        compressed,
                        original_size,
                        data: data.unwrap_or_default(),
                    })
                    .await
                    .is_err()
                {
                    trace!(transfer_id, "chunk for finished transfer dropped");
                }
                Ok(())
            }

            Message::Ping => self.send(Message::Pong).await.map_err(drop),

            Message::Pong => Ok(()),

            Message::Bye { reason } => {
                debug!(?reason, "peer said bye");
                Err(())
            }
        }
    }

    /// Queues a text frame.
    pub async fn send(&self, message: Message) -> Result<(), SyncError> {
        self.queue(WireMessage::text(self.frame(message))).await
    }

    /// Queues a chunk frame with its payload.
    pub async fn send_chunk(&self, message: Message, data: Bytes) -> Result<(), SyncError> {
        self.queue(WireMessage::chunk(self.frame(message), data))
            .await
    }

    async fn queue(&self, message: WireMessage) -> Result<(), SyncError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| SyncError::ChannelClosed("send queue closed".to_owned()))
    }

    fn frame(&self, message: Message) -> Frame {
        Frame::new(
            self.msg_counter.fetch_add(1, Ordering::Relaxed),
            self.device_id,
            now_ms(),
            message,
        )
    }

    /// Routes future chunk frames for `transfer_id` to the returned
    /// receiver.
    pub fn register_transfer(&self, transfer_id: u64) -> mpsc::Receiver<IncomingChunk> {
        let (tx, rx) = mpsc::channel(32);
        let _prev = self.lock_transfers().insert(transfer_id, tx);
        rx
    }

    pub fn unregister_transfer(&self, transfer_id: u64) {
        let _prev = self.lock_transfers().remove(&transfer_id);
    }

    /// Time since the last inbound frame, for the keepalive watchdog.
    pub fn idle_for(&self) -> core::time::Duration {
        self.last_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    fn note_received(&self) {
        *self
            .last_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    fn lock_transfers(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::Sender<IncomingChunk>>> {
        self.transfers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
