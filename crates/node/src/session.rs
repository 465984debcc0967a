//! The per-session state machine.
//!
//! Both peers run the same driver: greet, then for every shared pair
//! diff, exchange entries, fetch chunks and finalize. A responder task
//! answers the peer's queries the whole time, so the two directions of a
//! sync interleave freely on the one channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use butterfly_blobstore::ChunkStore;
use butterfly_identity::DeviceService;
use butterfly_primitives::{
    now_ms, DeviceId, FileEntry, Hash, Pair, PairId, PeerDescriptor, SyncError,
};
use butterfly_relay::RelayClient;
use butterfly_storage::{diff_walk, plan, ApplyOutcome, FileIndex, SyncPlan};
use butterfly_store::key::ConflictKey;
use butterfly_store::Store;
use butterfly_wire::{Message, PairHello, PROTOCOL_VERSION};

use crate::folder::FolderSink;
use crate::history::SyncRecord;
use crate::io::{InboundQueues, PeerHello, PeerRequest, SessionIo};
use crate::locks::PairLocks;
use crate::pairs::PairRegistry;
use crate::status::{EngineStatus, Phase};
use crate::transfer::{assemble, download_file, serve_chunks, ServeStats};
use crate::SessionConfig;

/// Everything a session borrows from its engine.
#[derive(Clone, Debug)]
pub(crate) struct SessionDeps {
    pub store: Store,
    pub cas: ChunkStore,
    pub device: DeviceService,
    pub registry: PairRegistry,
    pub locks: PairLocks,
    pub relay: Option<RelayClient>,
    pub folder: Option<Arc<dyn FolderSink>>,
    pub config: SessionConfig,
    pub status: watch::Sender<EngineStatus>,
}

impl SessionDeps {
    fn index(&self, pair_id: PairId) -> FileIndex {
        FileIndex::new(self.store.clone(), self.cas.clone(), pair_id)
    }

    fn set_phase(&self, phase: Phase) {
        self.status.send_modify(|status| status.phase = phase);
    }
}

/// What one session accomplished.
#[derive(Clone, Debug, Default)]
pub struct SessionReport {
    pub pairs_synced: usize,
    pub pairs_unchanged: usize,
    pub conflicts: usize,
    pub records: Vec<SyncRecord>,
}

/// Why the driver gave up, kept apart from the error itself: the
/// terminal phase is `error` for a fatal failure OR an exhausted retry
/// budget, and by the time the error surfaces the loop that knew which
/// is long gone.
struct DriveError {
    error: SyncError,
    /// A recoverable error outlived the retry budget.
    retries_exhausted: bool,
}

impl From<SyncError> for DriveError {
    fn from(error: SyncError) -> Self {
        Self {
            error,
            retries_exhausted: false,
        }
    }
}

/// Shared receivers the sequential driver awaits on.
struct DriverQueues {
    merkle_nodes: Arc<Mutex<mpsc::Receiver<(PairId, butterfly_storage::RemoteNodes)>>>,
    entries: Arc<Mutex<mpsc::Receiver<(PairId, Vec<FileEntry>)>>>,
    sync_complete: Arc<Mutex<mpsc::Receiver<(PairId, Hash)>>>,
}

pub(crate) async fn run<T>(
    deps: SessionDeps,
    channel: butterfly_wire::Channel<T>,
    cancel: CancellationToken,
) -> Result<SessionReport, SyncError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let device = deps.device.get_or_create_device().map_err(SyncError::from)?;

    deps.set_phase(Phase::Greeting);
    let (io, queues, reader, writer) = SessionIo::start(channel, device.id, cancel.clone());

    let keepalive_dead = Arc::new(AtomicBool::new(false));
    let result = drive(
        &deps,
        &io,
        queues,
        &device.id,
        &device.label,
        &cancel,
        &keepalive_dead,
    )
    .await;

    cancel.cancel();
    let _shutdown = timeout(core::time::Duration::from_secs(5), async {
        let _reader = reader.await;
        let _writer = writer.await;
    })
    .await;

    match &result {
        Ok(report) => {
            deps.set_phase(if report.conflicts > 0 {
                Phase::ResolvingConflict
            } else {
                Phase::Idle
            });
        }
        Err(failure) => {
            let phase = if failure.error.is_fatal() || failure.retries_exhausted {
                Phase::Error
            } else {
                Phase::Idle
            };
            deps.status.send_modify(|status| {
                status.phase = phase;
                status.last_error = Some(failure.error.to_string());
            });
        }
    }

    result.map_err(|failure| failure.error)
}

#[expect(clippy::too_many_arguments, reason = "session plumbing is wired once, here")]
async fn drive(
    deps: &SessionDeps,
    io: &SessionIo,
    queues: InboundQueues,
    our_device: &DeviceId,
    our_label: &str,
    cancel: &CancellationToken,
    keepalive_dead: &Arc<AtomicBool>,
) -> Result<SessionReport, DriveError> {
    let InboundQueues {
        mut hello,
        merkle_nodes,
        entries,
        sync_complete,
        requests,
    } = queues;

    // Greet with one fingerprint per locally known pair.
    let our_pairs = deps.registry.list().map_err(|err| SyncError::Storage(err.to_string()))?;
    let mut pair_hellos = Vec::with_capacity(our_pairs.len());
    for pair in &our_pairs {
        let root = deps
            .index(pair.pair_id)
            .index_root()
            .map_err(SyncError::from)?;
        pair_hellos.push(PairHello {
            pair_id: pair.pair_id,
            merkle_root: root.root_hash,
            max_seq: root.max_seq,
            index_id: root.index_id,
        });
    }

    io.send(Message::Hello {
        device_name: our_label.to_owned(),
        public_key: deps.device.public_key().map_err(SyncError::from)?,
        pairs: pair_hellos,
    })
    .await?;

    let peer = wait_cancellable(cancel, keepalive_dead, deps.config.chunk_timeout, hello.recv())
        .await?
        .ok_or_else(|| SyncError::ChannelClosed("channel closed before hello".to_owned()))?;

    if peer.version != PROTOCOL_VERSION {
        return Err(SyncError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs: peer.version,
        }
        .into());
    }

    deps.status.send_modify(|status| {
        status.peer_name = Some(peer.device_name.clone());
    });

    // Intersect pair sets; a session with nothing in common ends cleanly.
    let common: Vec<(Pair, PairHello)> = our_pairs
        .into_iter()
        .filter_map(|pair| {
            peer.pairs
                .iter()
                .find(|theirs| theirs.pair_id == pair.pair_id)
                .map(|theirs| (pair, theirs.clone()))
        })
        .collect();

    if common.is_empty() {
        debug!("no shared pair; ending session");
        io.send(Message::Bye {
            reason: Some("no shared pair".to_owned()),
        })
        .await?;
        return Ok(SessionReport::default());
    }

    // First contact: the peer's identity comes from its hello, nowhere
    // else.
    let descriptor = PeerDescriptor {
        device_id: peer.device_id,
        name: peer.device_name.clone(),
        public_key: peer.public_key,
    };
    for (pair, _) in &common {
        let mut pair = pair.clone();
        pair.learn_peer(descriptor.clone());
        deps.registry
            .save(&pair)
            .map_err(|err| SyncError::Storage(err.to_string()))?;
    }

    // The responder half: answers the peer's queries for the whole
    // session.
    let serve_totals: Arc<Mutex<ServeStats>> = Arc::default();
    let responder = tokio::spawn(respond(
        deps.clone(),
        io.clone(),
        requests,
        *our_device,
        Arc::clone(&serve_totals),
    ));

    // Keepalive: ping on idle, kill after two silent cycles. The flag
    // goes up first so the death surfaces as a timeout, not a plain
    // closed channel.
    let watchdog = {
        let io = io.clone();
        let cancel = cancel.clone();
        let keepalive_dead = Arc::clone(keepalive_dead);
        let ping_interval = deps.config.ping_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = sleep(ping_interval) => {}
                }
                if io.idle_for() > ping_interval * 2 {
                    warn!("peer silent for two ping cycles; killing session");
                    keepalive_dead.store(true, Ordering::Relaxed);
                    cancel.cancel();
                    break;
                }
                if io.idle_for() >= ping_interval {
                    let _best_effort = io.send(Message::Ping).await;
                }
            }
        })
    };

    let driver_queues = DriverQueues {
        merkle_nodes: Arc::new(Mutex::new(merkle_nodes)),
        entries: Arc::new(Mutex::new(entries)),
        sync_complete: Arc::new(Mutex::new(sync_complete)),
    };

    let transfer_ids = AtomicU64::new(1);
    let mut report = SessionReport::default();
    let result = async {
        for (pair, peer_hello) in common {
            let mut attempt = 0;
            loop {
                if cancel.is_cancelled() {
                    return Err(DriveError::from(cancellation_error(keepalive_dead)));
                }

                match sync_pair(
                    deps,
                    io,
                    &driver_queues,
                    &pair,
                    &peer_hello,
                    peer.device_id,
                    &transfer_ids,
                    &serve_totals,
                )
                .await
                {
                    Ok(PairOutcome::Unchanged) => {
                        report.pairs_unchanged += 1;
                        break;
                    }
                    Ok(PairOutcome::Synced { record, conflicts }) => {
                        report.pairs_synced += 1;
                        report.conflicts += conflicts;
                        report.records.push(record);
                        break;
                    }
                    Err(err) if err.is_fatal() => return Err(err.into()),
                    Err(err) => {
                        attempt += 1;
                        if attempt > deps.config.max_retries {
                            return Err(DriveError {
                                error: err,
                                retries_exhausted: true,
                            });
                        }
                        let delay = deps.config.base_delay * 2u32.saturating_pow(attempt - 1);
                        warn!(%err, attempt, ?delay, "pair sync failed; backing off");
                        deps.status.send_modify(|status| {
                            status.phase = Phase::Retrying;
                            status.retry_count = attempt;
                            status.last_error = Some(err.to_string());
                        });
                        wait_cancellable(cancel, keepalive_dead, delay * 2, sleep(delay)).await?;
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    watchdog.abort();
    responder.abort();

    result.map(|()| report)
}

enum PairOutcome {
    Unchanged,
    Synced {
        record: SyncRecord,
        conflicts: usize,
    },
}

#[expect(clippy::too_many_arguments, reason = "session plumbing is wired once, here")]
async fn sync_pair(
    deps: &SessionDeps,
    io: &SessionIo,
    queues: &DriverQueues,
    pair: &Pair,
    peer_hello: &PairHello,
    peer_device: DeviceId,
    transfer_ids: &AtomicU64,
    serve_totals: &Arc<Mutex<ServeStats>>,
) -> Result<PairOutcome, SyncError> {
    let pair_id = pair.pair_id;
    let lock = deps.locks.for_pair(&pair_id);
    let _guard = lock.write().await;

    let index = deps.index(pair_id);
    let started_at = now_ms();

    deps.set_phase(Phase::Diffing);
    let our_root = index.merkle().root_hash().map_err(SyncError::from)?;
    if our_root == peer_hello.merkle_root {
        debug!(%pair_id, "roots match; nothing to sync");
        record_peer_state(deps, pair, peer_device, peer_hello, our_root)?;
        return Ok(PairOutcome::Unchanged);
    }

    let sent_before = *serve_totals.lock().await;

    // Delta history is valid only while the peer's index id is the one
    // we recorded last time.
    let mut delta_eligible = pair.remote_index_ids.get(&peer_device) == Some(&peer_hello.index_id)
        && pair.peer_max_seqs.contains_key(&peer_device);

    let (executed, applied_root) = loop {
        let mut affected_paths: Vec<String> = Vec::new();
        let remote_entries = if delta_eligible {
            deps.set_phase(Phase::DeltaSync);
            let since_seq = pair.peer_max_seqs.get(&peer_device).copied().unwrap_or(0);
            request_entries(deps, io, queues, pair_id, None, Some(since_seq)).await?
        } else {
            deps.set_phase(Phase::FullSync);
            let divergences = walk_remote(deps, io, queues, &index, peer_hello).await?;
            affected_paths = divergences
                .iter()
                .map(|divergence| divergence.path.clone())
                .collect();
            if affected_paths.is_empty() {
                Vec::new()
            } else {
                request_entries(deps, io, queues, pair_id, Some(affected_paths.clone()), None)
                    .await?
            }
        };

        // The local side of the union: rows at every path either the walk
        // or the peer's delta touched. Local-only paths matter too; they
        // are this side's uploads.
        affected_paths.extend(remote_entries.iter().map(|entry| entry.path.clone()));
        affected_paths.sort_unstable();
        affected_paths.dedup();

        let mut local_entries = Vec::new();
        for path in &affected_paths {
            if let Some(entry) = index.get(path).map_err(SyncError::from)? {
                local_entries.push(entry);
            }
        }

        let sync_plan = plan(pair, &local_entries, &remote_entries);
        debug!(%pair_id, summary = ?sync_plan.summary(), "planned");
        deps.status
            .send_modify(|status| status.plan = Some(sync_plan.summary()));

        // Entries already applied (through the relay, typically) whose
        // bytes never travelled: identical clocks, missing content.
        let mut backfill = Vec::new();
        if pair.direction != butterfly_primitives::SyncDirection::UploadOnly {
            for remote in &remote_entries {
                if remote.tombstone {
                    continue;
                }
                let Some(local) = index.get(&remote.path).map_err(SyncError::from)? else {
                    continue;
                };
                if local.vector_clock.compare(&remote.vector_clock)
                    == butterfly_primitives::ClockOrdering::Equal
                    && !index.missing_content(remote).map_err(SyncError::from)?.is_empty()
                {
                    backfill.push(remote.clone());
                }
            }
        }

        let (stats, applied_root) =
            execute_plan(deps, io, &index, pair, &sync_plan, &backfill, transfer_ids).await?;

        io.send(Message::SyncComplete {
            pair_id,
            root_hash: applied_root,
        })
        .await?;

        let peer_root = wait_for_complete(deps, queues, pair_id).await?;

        if delta_eligible && peer_root != applied_root {
            // The delta missed history (a third author, usually); walk
            // the whole tree once before giving up on convergence.
            debug!(%pair_id, "delta left roots apart; falling back to full walk");
            delta_eligible = false;
            continue;
        }

        finalize_pair(
            deps,
            pair,
            peer_device,
            peer_hello,
            peer_root,
            &remote_entries,
        )?;

        break (ParkAndStats { sync_plan, stats }, applied_root);
    };

    let ParkAndStats { sync_plan, stats } = executed;

    // Park whatever the strategy could not settle.
    let conflicts = sync_plan.conflicts.len();
    for conflict in &sync_plan.conflicts {
        deps.store
            .put(
                &ConflictKey {
                    pair_id,
                    path: conflict.path.clone(),
                },
                conflict,
            )
            .map_err(|err| SyncError::Storage(err.to_string()))?;
    }
    if conflicts > 0 {
        info!(%pair_id, conflicts, "conflicts parked for manual resolution");
    }

    let sent_after = *serve_totals.lock().await;

    deps.set_phase(Phase::Finalizing);
    let record = SyncRecord {
        pair_id,
        peer_device,
        started_at,
        finished_at: now_ms(),
        summary: sync_plan.summary(),
        bytes_sent: sent_after.bytes_sent - sent_before.bytes_sent,
        bytes_received: stats.bytes_received,
        bytes_saved_dedup: stats.bytes_saved_dedup,
        bytes_saved_compression: sent_after.bytes_saved_compression
            - sent_before.bytes_saved_compression,
    };
    record
        .append(&deps.store)
        .map_err(|err| SyncError::Storage(err.to_string()))?;

    push_relay_delta(deps, pair_id, &index).await;
    if let Some(relay) = &deps.relay {
        // Envelopes from before this session are obsolete for both of
        // us now; clearing them is best-effort housekeeping.
        let _deleted = relay.clear_old(&pair_id, started_at).await;
    }

    deps.status.send_modify(|status| {
        status.last_root = Some(applied_root);
        status.last_sync = Some(record.clone());
        status.transfers.clear();
    });

    Ok(PairOutcome::Synced { record, conflicts })
}

struct ParkAndStats {
    sync_plan: SyncPlan,
    stats: crate::transfer::DownloadStats,
}

/// Fetches missing chunks for every planned download, then applies the
/// entries and materializes them into the bound folder. The index is
/// untouched until this point, so a cancellation mid-transfer loses
/// nothing but reusable chunks.
async fn execute_plan(
    deps: &SessionDeps,
    io: &SessionIo,
    index: &FileIndex,
    pair: &Pair,
    sync_plan: &SyncPlan,
    backfill: &[FileEntry],
    transfer_ids: &AtomicU64,
) -> Result<(crate::transfer::DownloadStats, Hash), SyncError> {
    deps.set_phase(Phase::Transferring);

    let mut needs_fetch: Vec<(u64, &FileEntry)> = Vec::new();
    let mut backfill_refs: Vec<(&FileEntry, Vec<Hash>)> = Vec::new();
    for entry in &sync_plan.downloads {
        if !entry.tombstone
            && !index.missing_content(entry).map_err(SyncError::from)?.is_empty()
        {
            needs_fetch.push((transfer_ids.fetch_add(1, Ordering::Relaxed), entry));
        }
    }
    for entry in backfill {
        let missing = index.missing_content(entry).map_err(SyncError::from)?;
        if !missing.is_empty() {
            needs_fetch.push((transfer_ids.fetch_add(1, Ordering::Relaxed), entry));
            backfill_refs.push((entry, missing));
        }
    }

    deps.status.send_modify(|status| {
        status.transfers = needs_fetch
            .iter()
            .map(|(transfer_id, entry)| crate::status::TransferProgress {
                transfer_id: *transfer_id,
                path: entry.path.clone(),
                total_chunks: entry.chunk_hashes.len() as u32,
                received_chunks: 0,
                bytes_received: 0,
            })
            .collect();
    });

    let mut totals = crate::transfer::DownloadStats::default();
    {
        let mut outcomes = stream::iter(needs_fetch.into_iter().map(|(transfer_id, entry)| {
            async move {
                let stats =
                    download_file(io, &deps.cas, pair.pair_id, transfer_id, entry, &deps.config)
                        .await?;
                deps.status.send_modify(|status| {
                    if let Some(progress) = status
                        .transfers
                        .iter_mut()
                        .find(|progress| progress.transfer_id == transfer_id)
                    {
                        progress.received_chunks = progress.total_chunks;
                        progress.bytes_received = stats.bytes_received;
                    }
                });
                Ok::<_, SyncError>(stats)
            }
        }))
        .buffer_unordered(deps.config.max_concurrent_transfers);

        while let Some(outcome) = outcomes.next().await {
            let stats = outcome?;
            totals.bytes_received += stats.bytes_received;
            totals.bytes_saved_dedup += stats.bytes_saved_dedup;
        }
    }

    deps.set_phase(Phase::Finalizing);
    for entry in &sync_plan.downloads {
        match index.apply_remote(entry.clone()).map_err(SyncError::from)? {
            ApplyOutcome::Applied => {
                // A dominating revision settles any conflict parked at
                // this path (the peer resolved it for everyone).
                deps.store
                    .delete(&ConflictKey {
                        pair_id: pair.pair_id,
                        path: entry.path.clone(),
                    })
                    .map_err(|err| SyncError::Storage(err.to_string()))?;
                materialize(deps, entry).await?;
            }
            ApplyOutcome::Identical | ApplyOutcome::IgnoredOlder => {}
            ApplyOutcome::Conflict { .. } => {
                // The index moved underneath the plan; the next session
                // will see it as a fresh conflict.
                warn!(path = %entry.path, "entry conflicted during finalization");
            }
        }
    }

    // Backfilled entries were applied long ago; only their references and
    // folder bytes were outstanding.
    for (entry, missing) in backfill_refs {
        index.register_content(&missing).map_err(SyncError::from)?;
        materialize(deps, entry).await?;
    }

    let root = index.merkle().root_hash().map_err(SyncError::from)?;
    Ok((totals, root))
}

/// Assembles and writes (or removes) one applied entry in the bound
/// folder, when a folder is bound.
async fn materialize(deps: &SessionDeps, entry: &FileEntry) -> Result<(), SyncError> {
    let Some(folder) = &deps.folder else {
        return Ok(());
    };

    if entry.tombstone {
        folder.remove_file(&entry.path).await
    } else {
        let bytes = assemble(&deps.cas, entry).await?;
        folder.write_file(&entry.path, &bytes, entry.mtime).await
    }
}

async fn walk_remote(
    deps: &SessionDeps,
    io: &SessionIo,
    queues: &DriverQueues,
    index: &FileIndex,
    peer_hello: &PairHello,
) -> Result<Vec<butterfly_storage::Divergence>, SyncError> {
    let pair_id = peer_hello.pair_id;
    let merkle_nodes = Arc::clone(&queues.merkle_nodes);
    let chunk_timeout = deps.config.chunk_timeout;

    diff_walk(index.merkle(), peer_hello.merkle_root, move |batch| {
        let io = io.clone();
        let merkle_nodes = Arc::clone(&merkle_nodes);
        async move {
            io.send(Message::MerkleQuery {
                pair_id,
                node_paths: batch,
            })
            .await?;

            loop {
                let answer = timeout(chunk_timeout, async {
                    merkle_nodes.lock().await.recv().await
                })
                .await
                .map_err(|_| SyncError::Timeout("merkle answer overdue".to_owned()))?
                .ok_or_else(|| SyncError::ChannelClosed("merkle queue closed".to_owned()))?;

                if answer.0 == pair_id {
                    return Ok(answer.1);
                }
                debug!("discarding stale merkle answer for another pair");
            }
        }
    })
    .await
}

async fn request_entries(
    deps: &SessionDeps,
    io: &SessionIo,
    queues: &DriverQueues,
    pair_id: PairId,
    paths: Option<Vec<String>>,
    since_seq: Option<u64>,
) -> Result<Vec<FileEntry>, SyncError> {
    io.send(Message::EntriesRequest {
        pair_id,
        paths,
        since_seq,
    })
    .await?;

    loop {
        let (answered_pair, entries) = timeout(deps.config.chunk_timeout, async {
            queues.entries.lock().await.recv().await
        })
        .await
        .map_err(|_| SyncError::Timeout("entry exchange overdue".to_owned()))?
        .ok_or_else(|| SyncError::ChannelClosed("entries queue closed".to_owned()))?;

        if answered_pair == pair_id {
            return Ok(entries);
        }
        debug!("discarding stale entries for another pair");
    }
}

async fn wait_for_complete(
    deps: &SessionDeps,
    queues: &DriverQueues,
    pair_id: PairId,
) -> Result<Hash, SyncError> {
    loop {
        let (answered_pair, root) = timeout(deps.config.chunk_timeout * 10, async {
            queues.sync_complete.lock().await.recv().await
        })
        .await
        .map_err(|_| SyncError::Timeout("peer never finished its plan".to_owned()))?
        .ok_or_else(|| SyncError::ChannelClosed("completion queue closed".to_owned()))?;

        if answered_pair == pair_id {
            return Ok(root);
        }
        debug!("discarding stale completion for another pair");
    }
}

fn record_peer_state(
    deps: &SessionDeps,
    pair: &Pair,
    peer_device: DeviceId,
    peer_hello: &PairHello,
    peer_root: Hash,
) -> Result<(), SyncError> {
    let mut pair = deps
        .registry
        .get(&pair.pair_id)
        .map_err(|err| SyncError::Storage(err.to_string()))?
        .unwrap_or_else(|| pair.clone());

    let _prev = pair.remote_roots.insert(peer_device, peer_root);
    let _prev = pair
        .remote_index_ids
        .insert(peer_device, peer_hello.index_id);
    let _prev = pair.peer_max_seqs.insert(peer_device, peer_hello.max_seq);
    pair.last_synced_at = Some(now_ms());

    deps.registry
        .save(&pair)
        .map_err(|err| SyncError::Storage(err.to_string()))
}

fn finalize_pair(
    deps: &SessionDeps,
    pair: &Pair,
    peer_device: DeviceId,
    peer_hello: &PairHello,
    peer_root: Hash,
    remote_entries: &[FileEntry],
) -> Result<(), SyncError> {
    // The hello's max_seq may predate entries we just applied.
    let applied_max = remote_entries
        .iter()
        .filter(|entry| entry.device_id == peer_device)
        .map(|entry| entry.seq)
        .max()
        .unwrap_or(0);

    let mut peer_hello = peer_hello.clone();
    peer_hello.max_seq = peer_hello.max_seq.max(applied_max);

    record_peer_state(deps, pair, peer_device, &peer_hello, peer_root)
}

/// Publishes pending local changes as a relay envelope. Failures are
/// logged and retried on the next finalization; a rate limit just leaves
/// `pending_push` set.
async fn push_relay_delta(deps: &SessionDeps, pair_id: PairId, index: &FileIndex) {
    let Some(relay) = &deps.relay else { return };

    let pending = match relay.state(&pair_id) {
        Ok(state) => state,
        Err(err) => {
            warn!(%pair_id, %err, "relay state unreadable");
            return;
        }
    };
    if !pending.pending_push {
        return;
    }

    let Ok(device_id) = deps.device.device_id() else {
        return;
    };
    let (entries, root, max_seq) = match (
        index.entries_since(device_id, pending.last_push_seq),
        index.index_root(),
    ) {
        (Ok(entries), Ok(root)) => {
            let max_seq = root.max_seq;
            (entries, root.root_hash, max_seq)
        }
        (Err(err), _) | (_, Err(err)) => {
            warn!(%pair_id, %err, "relay delta unavailable");
            return;
        }
    };
    if entries.is_empty() {
        return;
    }

    match relay
        .push_delta(
            &pair_id,
            &entries,
            root,
            pending.last_push_seq + 1,
            max_seq,
        )
        .await
    {
        Ok(id) => debug!(%pair_id, %id, "published relay delta"),
        Err(err) => warn!(%pair_id, %err, "relay push failed; will retry"),
    }
}

/// The responder half: serves Merkle nodes, index entries and chunks for
/// as long as the session lives.
async fn respond(
    deps: SessionDeps,
    io: SessionIo,
    mut requests: mpsc::Receiver<PeerRequest>,
    our_device: DeviceId,
    totals: Arc<Mutex<ServeStats>>,
) {
    while let Some(request) = requests.recv().await {
        let outcome = match request {
            PeerRequest::Merkle {
                pair_id,
                node_paths,
            } => {
                let index = deps.index(pair_id);
                match index.merkle().nodes_for_diff(&node_paths) {
                    Ok(nodes) => io.send(Message::MerkleNodes { pair_id, nodes }).await,
                    Err(err) => Err(SyncError::from(err)),
                }
            }

            PeerRequest::Entries {
                pair_id,
                paths,
                since_seq,
            } => {
                let index = deps.index(pair_id);
                let entries = match (paths, since_seq) {
                    (Some(paths), _) => paths
                        .iter()
                        .filter_map(|path| index.get(path).transpose())
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(SyncError::from),
                    (None, Some(since_seq)) => index
                        .entries_since(our_device, since_seq)
                        .map_err(SyncError::from),
                    (None, None) => index.entries().map_err(SyncError::from),
                };
                match entries {
                    Ok(entries) => io.send(Message::Entries { pair_id, entries }).await,
                    Err(err) => Err(err),
                }
            }

            PeerRequest::Chunks {
                transfer_id,
                path,
                need,
                ..
            } => match serve_chunks(&io, &deps.cas, transfer_id, &path, &need).await {
                Ok(stats) => {
                    let mut totals = totals.lock().await;
                    totals.bytes_sent += stats.bytes_sent;
                    totals.bytes_saved_compression += stats.bytes_saved_compression;
                    Ok(())
                }
                Err(err) => Err(err),
            },

            PeerRequest::Ack {
                transfer_id,
                status,
                received_hash,
            } => {
                debug!(transfer_id, ?status, ?received_hash, "transfer acked");
                Ok(())
            }
        };

        if let Err(err) = outcome {
            warn!(%err, "responder failed; peer will time out and retry");
        }
    }
}

async fn wait_cancellable<F: core::future::Future>(
    cancel: &CancellationToken,
    keepalive_dead: &AtomicBool,
    limit: core::time::Duration,
    future: F,
) -> Result<F::Output, SyncError> {
    tokio::select! {
        () = cancel.cancelled() => Err(cancellation_error(keepalive_dead)),
        outcome = timeout(limit, future) => {
            outcome.map_err(|_| SyncError::Timeout("session step overdue".to_owned()))
        }
    }
}

/// What a cancellation means depends on who pulled the trigger: the
/// keepalive watchdog surfaces as a timeout, everything else as a closed
/// channel.
fn cancellation_error(keepalive_dead: &AtomicBool) -> SyncError {
    if keepalive_dead.load(Ordering::Relaxed) {
        SyncError::Timeout("peer missed two keepalive cycles".to_owned())
    } else {
        SyncError::ChannelClosed("session cancelled".to_owned())
    }
}
