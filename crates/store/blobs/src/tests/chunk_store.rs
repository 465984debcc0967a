use std::sync::Arc;

use butterfly_store::Store;

use super::*;

fn chunk_store() -> ChunkStore {
    ChunkStore::new(Store::in_memory(), Arc::new(InMemoryBlobRepo::new()))
}

#[tokio::test]
async fn test_put_get_round_trip_uncompressed() {
    let cas = chunk_store();

    let bytes = b"hello\n";
    let hash = cas.put(bytes, false).await.expect("put should succeed");

    assert_eq!(hash, Hash::digest(bytes));
    assert!(cas.has(&hash).expect("has should succeed"));
    assert_eq!(cas.get(&hash).await.expect("get should succeed"), bytes);

    let record = cas.record(&hash).expect("record").expect("row exists");
    assert!(!record.stored_compressed);
    assert_eq!(record.ref_count, 0);
}

#[tokio::test]
async fn test_compressible_content_is_stored_compressed() {
    let cas = chunk_store();

    let bytes = vec![b'a'; 64 * 1024];
    let hash = cas.put(&bytes, true).await.expect("put should succeed");

    let record = cas.record(&hash).expect("record").expect("row exists");
    assert!(record.stored_compressed, "64k of 'a' must deflate well");
    assert!(record.stored_size < record.original_size / 10);

    // Reads transparently decompress and verify.
    assert_eq!(cas.get(&hash).await.expect("get should succeed"), bytes);
}

#[tokio::test]
async fn test_incompressible_content_stays_raw() {
    let cas = chunk_store();

    // Already-deflated data barely shrinks, so the gate keeps it raw.
    let noise = deflate(&vec![b'x'; 4096]).expect("deflate");
    let hash = cas.put(&noise, true).await.expect("put should succeed");

    let record = cas.record(&hash).expect("record").expect("row exists");
    assert!(!record.stored_compressed);
    assert_eq!(record.stored_size, record.original_size);
}

#[tokio::test]
async fn test_put_is_idempotent_per_hash() {
    let cas = chunk_store();

    let first = cas.put(b"dup", false).await.expect("put");
    let second = cas.put(b"dup", false).await.expect("put");

    assert_eq!(first, second);
    let record = cas.record(&first).expect("record").expect("row exists");
    assert_eq!(record.ref_count, 0, "put never touches reference counts");
}

#[tokio::test]
async fn test_ref_counting_and_gc() {
    let cas = chunk_store();

    let hash = cas.put(b"counted", false).await.expect("put");
    cas.inc_ref(&hash).expect("inc");
    cas.inc_ref(&hash).expect("inc");

    assert_eq!(
        cas.record(&hash).expect("record").expect("row").ref_count,
        2
    );

    // Referenced chunks survive gc.
    assert_eq!(cas.gc(0).await.expect("gc"), 0);

    cas.dec_ref(&hash).expect("dec");
    cas.dec_ref(&hash).expect("dec");
    assert_eq!(
        cas.record(&hash).expect("record").expect("row").ref_count,
        0
    );

    // Zero refs inside the grace window also survive.
    assert_eq!(cas.gc(GC_GRACE_MS).await.expect("gc"), 0);
    assert!(cas.has(&hash).expect("has"));

    // Outside the grace window the bytes and the row go.
    assert_eq!(cas.gc(0).await.expect("gc"), 1);
    assert!(!cas.has(&hash).expect("has"));
}

#[tokio::test]
async fn test_dec_ref_floors_at_zero() {
    let cas = chunk_store();

    let hash = cas.put(b"floor", false).await.expect("put");
    cas.dec_ref(&hash).expect("dec on zero is a no-op");

    assert_eq!(
        cas.record(&hash).expect("record").expect("row").ref_count,
        0
    );
}

#[tokio::test]
async fn test_corrupt_chunk_is_quarantined() {
    let store = Store::in_memory();
    let repo = Arc::new(InMemoryBlobRepo::new());
    let cas = ChunkStore::new(store, Arc::clone(&repo) as Arc<dyn BlobRepo>);

    let hash = cas.put(b"pristine", false).await.expect("put");

    // Corrupt the bytes underneath the store.
    repo.put(&hash.to_hex(), b"tampered")
        .await
        .expect("repo put");

    let err = cas.get(&hash).await.expect_err("corruption must surface");
    assert!(matches!(err, CasError::HashMismatch { .. }));

    // The chunk is gone, ready to be re-requested.
    assert!(!cas.has(&hash).expect("has"));
    assert_eq!(repo.get(&hash.to_hex()).await.expect("repo get"), None);
}

#[tokio::test]
async fn test_stored_bytes_hash_to_their_key() {
    let cas = chunk_store();

    for payload in [&b"one"[..], &b"two"[..], &[0; 1024][..]] {
        let hash = cas.put(payload, true).await.expect("put");
        let bytes = cas.get(&hash).await.expect("get");
        assert_eq!(
            Hash::digest(&bytes),
            hash,
            "every stored chunk must hash to its key"
        );
    }
}

#[tokio::test]
async fn test_fs_repo_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");

    let repo = FsBlobRepo::open(root).await.expect("open");
    let key = Hash::digest(b"fs").to_hex();

    repo.put(&key, b"fs bytes").await.expect("put");
    assert_eq!(
        repo.get(&key).await.expect("get"),
        Some(b"fs bytes".to_vec())
    );
    assert_eq!(repo.list().await.expect("list"), vec![key.clone()]);

    repo.delete(&key).await.expect("delete");
    assert_eq!(repo.get(&key).await.expect("get"), None);
    assert!(repo.list().await.expect("list").is_empty());
}
