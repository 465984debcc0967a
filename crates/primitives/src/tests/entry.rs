use super::*;

fn device(tag: u8) -> DeviceId {
    DeviceId::from([tag; 21])
}

fn sample_entry() -> FileEntry {
    let bytes = b"hello\n";
    FileEntry::authored(
        "notes.txt".into(),
        Hash::digest(bytes),
        bytes.len() as u64,
        1_000,
        vec![Hash::digest(bytes)],
        256 * 1024,
        device(1),
        1,
        None,
    )
}

#[test]
fn test_authored_entry_is_valid() {
    let entry = sample_entry();

    entry.validate().expect("freshly authored entry must validate");
    assert_eq!(entry.vector_clock.get(&device(1)), 1);
    assert!(!entry.tombstone);
}

#[test]
fn test_authored_keeps_previous_clock() {
    let previous: VectorClock = [(device(2), 7)].into_iter().collect();

    let entry = FileEntry::authored(
        "a.txt".into(),
        Hash::digest(b"x"),
        1,
        5,
        vec![Hash::digest(b"x")],
        256 * 1024,
        device(1),
        3,
        Some(&previous),
    );

    assert_eq!(entry.vector_clock.get(&device(1)), 3);
    assert_eq!(entry.vector_clock.get(&device(2)), 7);
}

#[test]
fn test_tombstone_clears_content() {
    let entry = sample_entry().into_tombstone(device(1), 2, 2_000);

    entry.validate().expect("tombstone must validate");
    assert!(entry.tombstone);
    assert_eq!(entry.size, 0);
    assert!(entry.chunk_hashes.is_empty());
    assert_eq!(entry.hash, Hash::ZERO);
    assert_eq!(entry.deleted_at, Some(2_000));
    assert_eq!(entry.vector_clock.get(&device(1)), 2);
}

#[test]
fn test_validate_rejects_wrong_chunk_count() {
    let mut entry = sample_entry();
    entry.chunk_hashes.push(Hash::digest(b"extra"));

    assert!(matches!(
        entry.validate(),
        Err(InvalidFileEntry::ChunkCount { .. })
    ));
}

#[test]
fn test_validate_rejects_author_clock_drift() {
    let mut entry = sample_entry();
    entry.seq = 9;

    assert!(matches!(
        entry.validate(),
        Err(InvalidFileEntry::AuthorClockMismatch { .. })
    ));
}

#[test]
fn test_expected_chunks() {
    let chunk = 256 * 1024;

    assert_eq!(FileEntry::expected_chunks(0, chunk), 0);
    assert_eq!(FileEntry::expected_chunks(1, chunk), 1);
    assert_eq!(FileEntry::expected_chunks(u64::from(chunk), chunk), 1);
    assert_eq!(FileEntry::expected_chunks(u64::from(chunk) + 1, chunk), 2);
}
