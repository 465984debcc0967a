//! Two engines, one in-process channel: end-to-end session tests.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use butterfly_blobstore::{ChunkStore, InMemoryBlobRepo};
use butterfly_identity::DeviceService;
use butterfly_node::{ConflictResolution, Engine, InMemoryFolder, Phase, SessionReport};
use butterfly_primitives::{ConflictStrategy, Hash, Pair, PairId, SyncError};
use butterfly_storage::CHUNK_SIZE;
use butterfly_store::Store;
use butterfly_wire::duplex_pair;

struct TestNode {
    engine: Engine,
    cas: ChunkStore,
    folder: Arc<InMemoryFolder>,
    service: DeviceService,
}

fn node_with(pair: &Pair) -> TestNode {
    let store = Store::in_memory();
    let cas = ChunkStore::new(store.clone(), Arc::new(InMemoryBlobRepo::new()));
    let service = DeviceService::new(store.clone());
    let folder = Arc::new(InMemoryFolder::new());

    let engine = Engine::new(
        store,
        cas.clone(),
        service.clone(),
        butterfly_node::SessionConfig::default(),
    )
    .with_folder(Arc::clone(&folder) as Arc<dyn butterfly_node::FolderSink>);

    engine.registry().save(pair).expect("register pair");

    TestNode {
        engine,
        cas,
        folder,
        service,
    }
}

fn test_pair(tag: u8) -> Pair {
    Pair::new(PairId::from([tag; 32]), "docs".into(), "folder".into())
}

async fn sync(a: &TestNode, b: &TestNode) -> (SessionReport, SessionReport) {
    let (channel_a, channel_b) = duplex_pair();

    let (report_a, report_b) = tokio::join!(
        a.engine.run_session(channel_a, CancellationToken::new()),
        b.engine.run_session(channel_b, CancellationToken::new()),
    );

    (report_a.expect("side a"), report_b.expect("side b"))
}

async fn assert_converged(a: &TestNode, b: &TestNode, pair_id: PairId) {
    let ours = a.engine.index(pair_id).entries().expect("entries a");
    let theirs = b.engine.index(pair_id).entries().expect("entries b");
    assert_eq!(ours, theirs, "both indexes must be identical after sync");

    assert_eq!(
        a.engine.index(pair_id).merkle().root_hash().expect("root a"),
        b.engine.index(pair_id).merkle().root_hash().expect("root b"),
        "roots must agree after sync"
    );
}

// ============================================================
// Scenario: new file on one side
// ============================================================

#[tokio::test(flavor = "multi_thread")]
async fn new_file_flows_to_the_empty_side() {
    let pair = test_pair(1);
    let alice = node_with(&pair);
    let bob = node_with(&pair);

    let entry = bob
        .engine
        .scan_local(pair.pair_id, "notes.txt", b"hello\n", 1_000)
        .await
        .expect("scan");

    let (report_a, report_b) = sync(&alice, &bob).await;

    assert_eq!(report_a.pairs_synced, 1);
    assert_eq!(report_b.pairs_synced, 1);
    assert_eq!(report_a.conflicts + report_b.conflicts, 0);

    // Alice holds an identical entry, the chunk bytes, and the file.
    assert_converged(&alice, &bob, pair.pair_id).await;
    let mirrored = alice
        .engine
        .index(pair.pair_id)
        .get("notes.txt")
        .expect("get")
        .expect("entry present");
    assert_eq!(mirrored, entry);
    assert_eq!(
        alice.cas.get(&Hash::digest(b"hello\n")).await.expect("chunk"),
        b"hello\n"
    );
    assert_eq!(alice.folder.read("notes.txt"), Some(b"hello\n".to_vec()));

    // Nothing left to do on a second session.
    let (again_a, again_b) = sync(&alice, &bob).await;
    assert_eq!(again_a.pairs_unchanged, 1);
    assert_eq!(again_b.pairs_unchanged, 1);
}

// ============================================================
// Scenario: deletion propagation
// ============================================================

#[tokio::test(flavor = "multi_thread")]
async fn deletions_propagate_with_their_clock() {
    let pair = test_pair(2);
    let alice = node_with(&pair);
    let bob = node_with(&pair);

    let _entry = alice
        .engine
        .scan_local(pair.pair_id, "draft.md", b"draft body", 1_000)
        .await
        .expect("scan");
    let _reports = sync(&alice, &bob).await;

    let chunk_hash = Hash::digest(b"draft body");
    assert_eq!(
        bob.cas.record(&chunk_hash).expect("record").expect("row").ref_count,
        1
    );

    let tombstone = alice
        .engine
        .delete_local(pair.pair_id, "draft.md")
        .await
        .expect("delete")
        .expect("was live");
    let _reports = sync(&alice, &bob).await;

    assert_converged(&alice, &bob, pair.pair_id).await;
    let mirrored = bob
        .engine
        .index(pair.pair_id)
        .get("draft.md")
        .expect("get")
        .expect("tombstone row");
    assert!(mirrored.tombstone);
    assert_eq!(mirrored.vector_clock, tombstone.vector_clock);

    // The old bytes lost their reference and are GC-eligible.
    assert_eq!(
        bob.cas.record(&chunk_hash).expect("record").expect("row").ref_count,
        0
    );
    assert_eq!(bob.cas.gc(0).await.expect("gc"), 1);
    assert_eq!(bob.folder.read("draft.md"), None);
}

// ============================================================
// Scenario: concurrent edit, manual strategy
// ============================================================

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_edits_park_a_conflict_on_both_sides() {
    let mut pair = test_pair(3);
    pair.strategy = ConflictStrategy::Manual;
    let alice = node_with(&pair);
    let bob = node_with(&pair);

    // Shared baseline authored by Alice.
    let _entry = alice
        .engine
        .scan_local(pair.pair_id, "plan.md", b"base", 1_000)
        .await
        .expect("scan");
    let _reports = sync(&alice, &bob).await;

    // Divergent edits while disconnected.
    let ours = alice
        .engine
        .scan_local(pair.pair_id, "plan.md", b"v-A", 2_000)
        .await
        .expect("scan");
    let theirs = bob
        .engine
        .scan_local(pair.pair_id, "plan.md", b"v-B", 2_001)
        .await
        .expect("scan");

    let (report_a, report_b) = sync(&alice, &bob).await;
    assert_eq!(report_a.conflicts, 1);
    assert_eq!(report_b.conflicts, 1);

    assert_eq!(
        alice.engine.status().borrow().phase,
        Phase::ResolvingConflict
    );

    // Each side kept its own revision and parked both clocks.
    let parked_a = alice
        .engine
        .pending_conflicts(&pair.pair_id)
        .expect("conflicts");
    assert_eq!(parked_a.len(), 1);
    assert_eq!(parked_a[0].path, "plan.md");
    assert_eq!(parked_a[0].local.vector_clock, ours.vector_clock);
    assert_eq!(parked_a[0].remote.vector_clock, theirs.vector_clock);

    let parked_b = bob
        .engine
        .pending_conflicts(&pair.pair_id)
        .expect("conflicts");
    assert_eq!(parked_b.len(), 1);
    assert_eq!(parked_b[0].local.vector_clock, theirs.vector_clock);
    assert_eq!(parked_b[0].remote.vector_clock, ours.vector_clock);

    // Alice resolves; the merged clock dominates both, so the next sync
    // converges everyone without a second conflict.
    let resolved = alice
        .engine
        .resolve_conflict(pair.pair_id, "plan.md", ConflictResolution::KeepLocal)
        .await
        .expect("resolve");
    assert!(resolved.vector_clock.compare(&ours.vector_clock)
        == butterfly_primitives::ClockOrdering::Dominates);
    assert!(resolved.vector_clock.compare(&theirs.vector_clock)
        == butterfly_primitives::ClockOrdering::Dominates);

    let (report_a, report_b) = sync(&alice, &bob).await;
    assert_eq!(report_a.conflicts + report_b.conflicts, 0);
    assert_converged(&alice, &bob, pair.pair_id).await;
    assert_eq!(
        bob.engine
            .index(pair.pair_id)
            .get("plan.md")
            .expect("get")
            .expect("entry")
            .hash,
        Hash::digest(b"v-A")
    );
}

// ============================================================
// Scenario: chunk-level dedup across files
// ============================================================

#[tokio::test(flavor = "multi_thread")]
async fn shared_chunks_are_not_retransmitted() {
    let pair = test_pair(4);
    let alice = node_with(&pair);
    let bob = node_with(&pair);

    let chunk = CHUNK_SIZE as usize;
    let mut first = vec![42u8; chunk];
    first.extend_from_slice(b"first tail");

    let _entry = alice
        .engine
        .scan_local(pair.pair_id, "first.bin", &first, 1_000)
        .await
        .expect("scan");
    let _reports = sync(&alice, &bob).await;

    // The second file shares its first 256 KiB block with the first.
    let mut second = vec![42u8; chunk];
    second.extend_from_slice(b"second tail");
    let _entry = alice
        .engine
        .scan_local(pair.pair_id, "second.bin", &second, 2_000)
        .await
        .expect("scan");

    let (_report_a, report_b) = sync(&alice, &bob).await;

    assert_converged(&alice, &bob, pair.pair_id).await;
    assert_eq!(bob.folder.read("second.bin"), Some(second));

    let record = report_b.records.first().expect("sync record");
    assert!(
        record.bytes_saved_dedup >= chunk as u64,
        "the shared block must be served from the local store (saved {})",
        record.bytes_saved_dedup
    );
    assert!(
        record.bytes_received < chunk as u64,
        "only the unique tail may travel (received {})",
        record.bytes_received
    );
}

// ============================================================
// Session mechanics
// ============================================================

#[tokio::test(flavor = "multi_thread")]
async fn disjoint_pairs_end_cleanly() {
    let alice = node_with(&test_pair(5));
    let bob = node_with(&test_pair(6));

    let (report_a, report_b) = sync(&alice, &bob).await;

    assert_eq!(report_a.pairs_synced + report_a.pairs_unchanged, 0);
    assert_eq!(report_b.pairs_synced + report_b.pairs_unchanged, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_leaves_the_index_untouched() {
    let pair = test_pair(7);
    let alice = node_with(&pair);
    let bob = node_with(&pair);

    let _entry = bob
        .engine
        .scan_local(pair.pair_id, "pending.txt", b"not yet", 1_000)
        .await
        .expect("scan");

    let cancelled = CancellationToken::new();
    cancelled.cancel();

    let (channel_a, channel_b) = duplex_pair();
    let (outcome_a, outcome_b) = tokio::join!(
        alice.engine.run_session(channel_a, cancelled),
        bob.engine.run_session(channel_b, CancellationToken::new()),
    );

    assert!(matches!(
        outcome_a.expect_err("cancelled session must not report success"),
        SyncError::ChannelClosed(_)
    ));
    let _outcome_b = outcome_b; // Bob sees the channel die either way.

    assert!(
        alice
            .engine
            .index(pair.pair_id)
            .entries()
            .expect("entries")
            .is_empty(),
        "a cancelled session must not half-apply a plan"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn second_session_uses_delta_history() {
    let pair = test_pair(8);
    let alice = node_with(&pair);
    let bob = node_with(&pair);

    let _entry = alice
        .engine
        .scan_local(pair.pair_id, "one.txt", b"one", 1_000)
        .await
        .expect("scan");
    let _reports = sync(&alice, &bob).await;

    // The peers now know each other's index ids and seqs.
    let stored = alice
        .engine
        .registry()
        .get(&pair.pair_id)
        .expect("get pair")
        .expect("pair");
    let bob_device = bob.service.device_id().expect("device id");
    assert!(stored.remote_index_ids.contains_key(&bob_device));
    assert!(stored.peer_max_seqs.contains_key(&bob_device));
    assert_eq!(stored.peers.len(), 1, "peer learned from its hello");

    let _entry = alice
        .engine
        .scan_local(pair.pair_id, "two.txt", b"two", 2_000)
        .await
        .expect("scan");
    let (_report_a, report_b) = sync(&alice, &bob).await;

    assert_eq!(report_b.pairs_synced, 1);
    assert_converged(&alice, &bob, pair.pair_id).await;
    assert_eq!(bob.folder.read("two.txt"), Some(b"two".to_vec()));
}
