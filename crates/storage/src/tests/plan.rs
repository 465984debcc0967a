use butterfly_primitives::{DeviceId, Hash, PairId, VectorClock};

use crate::chunker::{chunk_hashes, CHUNK_SIZE};

use super::*;

fn device(tag: u8) -> DeviceId {
    DeviceId::from([tag; 21])
}

fn test_pair() -> Pair {
    Pair::new(PairId::from([4; 32]), "docs".into(), "folder".into())
}

fn entry(path: &str, body: &[u8], mtime: u64, author: DeviceId, seq: u64) -> FileEntry {
    FileEntry::authored(
        path.into(),
        Hash::digest(body),
        body.len() as u64,
        mtime,
        chunk_hashes(body),
        CHUNK_SIZE,
        author,
        seq,
        None,
    )
}

fn entry_with_clock(path: &str, body: &[u8], mtime: u64, clock: VectorClock, author: DeviceId, seq: u64) -> FileEntry {
    let mut built = entry(path, body, mtime, author, seq);
    let mut clock = clock;
    clock.set(author, seq);
    built.vector_clock = clock;
    built
}

// ============================================================
// One-sided entries
// ============================================================

#[test]
fn new_remote_file_plans_a_download() {
    let pair = test_pair();
    let remote = entry("notes.txt", b"hello\n", 1_000, device(2), 1);

    let plan = plan(&pair, &[], &[remote.clone()]);

    assert_eq!(plan.downloads, vec![remote]);
    assert!(plan.uploads.is_empty());
    assert!(plan.conflicts.is_empty());
    assert_eq!(plan.unchanged, 0);
}

#[test]
fn local_only_file_plans_an_upload() {
    let pair = test_pair();
    let local = entry("mine.txt", b"local", 5, device(1), 1);

    let plan = plan(&pair, &[local.clone()], &[]);

    assert_eq!(plan.uploads, vec![local]);
}

#[test]
fn remote_tombstone_plans_the_delete_as_a_download() {
    let pair = test_pair();

    let local = entry("draft.md", b"draft", 10, device(1), 3);
    let remote_tombstone = local.clone().into_tombstone(device(1), 4, 20);

    let plan = plan(&pair, &[local], &[remote_tombstone.clone()]);

    assert_eq!(plan.downloads, vec![remote_tombstone]);
}

// ============================================================
// Clock comparison
// ============================================================

#[test]
fn identical_clocks_count_as_unchanged() {
    let pair = test_pair();
    let shared = entry("same.txt", b"same", 1, device(1), 1);

    let plan = plan(&pair, &[shared.clone()], &[shared]);

    assert_eq!(plan.unchanged, 1);
    assert!(plan.is_settled());
}

#[test]
fn dominating_side_wins_each_direction() {
    let pair = test_pair();

    let base = entry("doc.txt", b"v1", 1, device(1), 1);
    let newer = entry_with_clock(
        "doc.txt",
        b"v2",
        2,
        base.vector_clock.clone(),
        device(1),
        2,
    );

    let plan_up = plan(&pair, &[newer.clone()], &[base.clone()]);
    assert_eq!(plan_up.uploads, vec![newer.clone()]);

    let plan_down = plan(&pair, &[base], &[newer.clone()]);
    assert_eq!(plan_down.downloads, vec![newer]);
}

#[test]
fn concurrent_edits_conflict_under_manual_strategy() {
    let mut pair = test_pair();
    pair.strategy = ConflictStrategy::Manual;

    // Both sides started from {A:1}; A wrote {A:2}, B wrote {A:1,B:1}.
    let ancestor: VectorClock = [(device(1), 1)].into_iter().collect();
    let ours = entry_with_clock("plan.md", b"v-A", 100, ancestor.clone(), device(1), 2);
    let theirs = entry_with_clock("plan.md", b"v-B", 101, ancestor, device(2), 1);

    let plan = plan(&pair, &[ours.clone()], &[theirs.clone()]);

    assert_eq!(plan.conflicts.len(), 1);
    let conflict = &plan.conflicts[0];
    assert_eq!(conflict.path, "plan.md");
    assert_eq!(conflict.local, ours);
    assert_eq!(conflict.remote, theirs);
    assert!(plan.uploads.is_empty() && plan.downloads.is_empty());
}

#[test]
fn conflicts_are_flagged_iff_clocks_are_incomparable() {
    let mut pair = test_pair();
    pair.strategy = ConflictStrategy::Manual;

    let comparable_pairs = [
        // (local clock, remote clock, conflict expected)
        (vec![(1u8, 2u64)], vec![(1, 1)], false),
        (vec![(1, 1)], vec![(1, 1)], false),
        (vec![(1, 2)], vec![(1, 1), (2, 1)], true),
        (vec![(1, 1), (2, 2)], vec![(1, 2), (2, 1)], true),
        (vec![(1, 1), (2, 1)], vec![(1, 1)], false),
    ];

    for (ours_parts, theirs_parts, expect_conflict) in comparable_pairs {
        let to_clock = |parts: &[(u8, u64)]| -> VectorClock {
            parts.iter().map(|&(d, s)| (device(d), s)).collect()
        };

        let mut ours = entry("p.txt", b"a", 1, device(1), 1);
        ours.vector_clock = to_clock(&ours_parts);
        ours.seq = ours.vector_clock.get(&device(1));
        let mut theirs = entry("p.txt", b"b", 2, device(2), 1);
        theirs.vector_clock = to_clock(&theirs_parts);
        theirs.device_id = device(2);
        theirs.seq = theirs.vector_clock.get(&device(2));

        let plan = plan(&pair, &[ours], &[theirs]);
        assert_eq!(
            !plan.conflicts.is_empty(),
            expect_conflict,
            "clocks {ours_parts:?} vs {theirs_parts:?}"
        );
    }
}

// ============================================================
// Automatic strategies
// ============================================================

#[test]
fn last_write_wins_picks_greater_mtime_then_device_id() {
    let pair = test_pair(); // LWW is the default strategy.

    let ancestor: VectorClock = [(device(1), 1)].into_iter().collect();
    let older = entry_with_clock("f.txt", b"old", 100, ancestor.clone(), device(1), 2);
    let newer = entry_with_clock("f.txt", b"new", 200, ancestor.clone(), device(2), 1);

    let plan_newer_remote = plan(&pair, &[older.clone()], &[newer.clone()]);
    assert_eq!(plan_newer_remote.downloads, vec![newer.clone()]);

    let plan_newer_local = plan(&pair, &[newer.clone()], &[older]);
    assert_eq!(plan_newer_local.uploads, vec![newer]);

    // Equal mtimes: the greater device id takes it.
    let tied_low = entry_with_clock("t.txt", b"low", 300, ancestor.clone(), device(1), 2);
    let tied_high = entry_with_clock("t.txt", b"high", 300, ancestor, device(9), 1);

    let plan_tie = plan(&pair, &[tied_low], &[tied_high.clone()]);
    assert_eq!(plan_tie.downloads, vec![tied_high]);
}

#[test]
fn local_and_remote_wins_strategies() {
    let ancestor: VectorClock = [(device(1), 1)].into_iter().collect();
    let ours = entry_with_clock("s.txt", b"ours", 1, ancestor.clone(), device(1), 2);
    let theirs = entry_with_clock("s.txt", b"theirs", 2, ancestor, device(2), 1);

    let mut pair = test_pair();
    pair.strategy = ConflictStrategy::LocalWins;
    let plan_local = plan(&pair, &[ours.clone()], &[theirs.clone()]);
    assert_eq!(plan_local.uploads, vec![ours.clone()]);
    assert!(plan_local.downloads.is_empty());

    pair.strategy = ConflictStrategy::RemoteWins;
    let plan_remote = plan(&pair, &[ours], &[theirs.clone()]);
    assert_eq!(plan_remote.downloads, vec![theirs]);
    assert!(plan_remote.uploads.is_empty());
}

// ============================================================
// Direction and filters
// ============================================================

#[test]
fn upload_only_discards_downloads_with_a_skip() {
    let mut pair = test_pair();
    pair.direction = SyncDirection::UploadOnly;

    let remote = entry("theirs.txt", b"x", 1, device(2), 1);
    let local = entry("ours.txt", b"y", 1, device(1), 1);

    let plan = plan(&pair, &[local.clone()], &[remote]);

    assert_eq!(plan.uploads, vec![local]);
    assert!(plan.downloads.is_empty());
    assert_eq!(plan.skipped, 1);
}

#[test]
fn filters_and_size_limit_demote_to_skips() {
    let mut pair = test_pair();
    pair.include = vec!["*.md".into(), "docs/**".into()];
    pair.exclude = vec!["docs/private/**".into()];
    pair.max_file_size = Some(4);

    let admitted = entry("readme.md", b"ok", 1, device(2), 1);
    let wrong_ext = entry("binary.exe", b"no", 1, device(2), 2);
    let excluded = entry("docs/private/secret.md", b"no", 1, device(2), 3);
    let oversize = entry("notes.md", b"way past the limit", 1, device(2), 4);

    let plan = plan(
        &pair,
        &[],
        &[admitted.clone(), wrong_ext, excluded, oversize],
    );

    assert_eq!(plan.downloads, vec![admitted]);
    assert_eq!(plan.skipped, 3);
}
