//! End-to-end relay tests against a real server instance.

use std::sync::Arc;

use tokio::net::TcpListener;
use url::Url;

use butterfly_blobstore::{ChunkStore, InMemoryBlobRepo};
use butterfly_identity::DeviceService;
use butterfly_primitives::{Hash, PairId};
use butterfly_relay::{RelayClient, RelayError};
use butterfly_relayer::{router, RelayerState};
use butterfly_storage::FileIndex;
use butterfly_store::Store;

struct TestDevice {
    service: DeviceService,
    index: FileIndex,
    client: RelayClient,
}

impl TestDevice {
    fn new(base_url: &Url, pair_id: PairId) -> Self {
        let store = Store::in_memory();
        let cas = ChunkStore::new(store.clone(), Arc::new(InMemoryBlobRepo::new()));
        let index = FileIndex::new(store.clone(), cas, pair_id);
        let service = DeviceService::new(store.clone());
        let client = RelayClient::new(base_url.clone(), store, service.clone());
        Self {
            service,
            index,
            client,
        }
    }
}

async fn spawn_relayer() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let _server = tokio::spawn(async move {
        axum::serve(listener, router(RelayerState::new()))
            .await
            .expect("serve");
    });

    format!("http://{addr}/").parse().expect("url")
}

#[tokio::test]
async fn relay_round_trip_applies_once() {
    let base_url = spawn_relayer().await;
    let pair_id = PairId::from([11; 32]);

    let alice = TestDevice::new(&base_url, pair_id);
    let bob = TestDevice::new(&base_url, pair_id);

    // Three local changes on Alice while Bob is unreachable.
    let author = alice.service.device_id().expect("device id");
    let mut changed = Vec::new();
    for (path, body) in [
        ("notes/a.txt", &b"alpha"[..]),
        ("notes/b.txt", &b"beta"[..]),
        ("c.txt", &b"gamma"[..]),
    ] {
        let seq = alice.service.increment_local_seq().expect("seq");
        let entry = alice
            .index
            .upsert_local(path, body, seq, author, seq)
            .await
            .expect("upsert");
        changed.push(entry);
    }

    let new_root = alice.index.merkle().root_hash().expect("root");
    let _id = alice
        .client
        .push_delta(&pair_id, &changed, new_root, 1, 3)
        .await
        .expect("push");

    assert_eq!(alice.client.state(&pair_id).expect("state").last_push_seq, 3);

    // Bob pulls two days later (the envelope is far from its TTL).
    let outcome = bob
        .client
        .pull_deltas(&pair_id, &bob.index)
        .await
        .expect("pull");

    assert_eq!(outcome.envelopes_applied, 1);
    assert_eq!(outcome.entries_applied, 3);
    assert!(outcome.conflicts.is_empty());

    // Bob's index now mirrors Alice's, tombstones and clocks included.
    assert_eq!(
        bob.index.merkle().root_hash().expect("root"),
        new_root,
        "applying the delta must reproduce the sender's root"
    );
    for entry in &changed {
        assert_eq!(
            bob.index.get(&entry.path).expect("get").as_ref(),
            Some(entry)
        );
    }

    // Replaying the pull applies nothing new.
    let replay = bob
        .client
        .pull_deltas(&pair_id, &bob.index)
        .await
        .expect("pull again");
    assert_eq!(replay.envelopes_applied, 0);
    assert_eq!(replay.entries_applied, 0);

    // Clearing everything both sides applied is best-effort and counted.
    let now = butterfly_primitives::now_ms();
    let deleted = bob.client.clear_old(&pair_id, now).await;
    assert_eq!(deleted, 1);
}

#[tokio::test]
async fn own_envelopes_are_skipped_on_pull() {
    let base_url = spawn_relayer().await;
    let pair_id = PairId::from([12; 32]);

    let alice = TestDevice::new(&base_url, pair_id);
    let author = alice.service.device_id().expect("device id");

    let entry = alice
        .index
        .upsert_local("self.txt", b"mine", 1, author, 1)
        .await
        .expect("upsert");
    let root = alice.index.merkle().root_hash().expect("root");

    let _id = alice
        .client
        .push_delta(&pair_id, &[entry], root, 1, 1)
        .await
        .expect("push");

    let outcome = alice
        .client
        .pull_deltas(&pair_id, &alice.index)
        .await
        .expect("pull");

    assert_eq!(
        outcome.envelopes_applied, 0,
        "a device must not reapply its own envelopes"
    );
}

#[tokio::test]
async fn oversize_push_is_rejected_and_state_unchanged() {
    let base_url = spawn_relayer().await;
    let pair_id = PairId::from([13; 32]);

    let alice = TestDevice::new(&base_url, pair_id);
    let author = alice.service.device_id().expect("device id");

    // Enough entries with long incompressible-looking paths to blow past
    // the 64 KiB decoded cap.
    let mut changed = Vec::new();
    for n in 0..400 {
        let path = format!("bulk/{n}/{}.txt", "x".repeat(160));
        let entry = alice
            .index
            .upsert_local(&path, b"payload body", n + 1, author, n + 1)
            .await
            .expect("upsert");
        changed.push(entry);
    }

    let root = alice.index.merkle().root_hash().expect("root");
    let err = alice
        .client
        .push_delta(&pair_id, &changed, root, 1, 400)
        .await
        .expect_err("oversize push must fail");

    match err {
        RelayError::Rejected { status, .. } => assert_eq!(status, 413),
        other => panic!("expected a 413 rejection, got {other:?}"),
    }

    assert_eq!(
        alice.client.state(&pair_id).expect("state").last_push_seq,
        0,
        "a rejected push must not advance relay state"
    );
}
