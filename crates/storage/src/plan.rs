use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use tracing::warn;

use butterfly_primitives::{
    ClockOrdering, ConflictStrategy, FileEntry, Pair, SyncDirection,
};

/// An unresolved concurrent edit, carrying both revisions.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub path: String,
    pub local: FileEntry,
    pub remote: FileEntry,
}

/// The four buckets a diff resolves into.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Local revisions the peer needs.
    pub uploads: Vec<FileEntry>,
    /// Remote revisions we need (tombstones included).
    pub downloads: Vec<FileEntry>,
    /// Concurrent edits the configured strategy could not settle.
    pub conflicts: Vec<Conflict>,
    pub unchanged: usize,
    /// Entries dropped by direction, filters or size limits.
    pub skipped: usize,
}

impl SyncPlan {
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.uploads.is_empty() && self.downloads.is_empty() && self.conflicts.is_empty()
    }

    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            uploads: self.uploads.len(),
            downloads: self.downloads.len(),
            conflicts: self.conflicts.len(),
            unchanged: self.unchanged,
            skipped: self.skipped,
        }
    }
}

/// Counts-only view for status reporting and history records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub uploads: usize,
    pub downloads: usize,
    pub conflicts: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

/// Compares the two entry sets and buckets every path in the union.
///
/// Entries present on one side only transfer toward the other (a
/// tombstone "transfers" as a delete). Entries on both sides compare by
/// vector clock; concurrent clocks go through the pair's conflict
/// strategy, and whatever it cannot settle lands in `conflicts`. The
/// pair's direction and filters demote transfers to skips.
#[must_use]
pub fn plan(pair: &Pair, local: &[FileEntry], remote: &[FileEntry]) -> SyncPlan {
    let filters = Filters::from_pair(pair);

    let mut by_path: BTreeMap<&str, (Option<&FileEntry>, Option<&FileEntry>)> = BTreeMap::new();
    for entry in local {
        by_path.entry(&entry.path).or_default().0 = Some(entry);
    }
    for entry in remote {
        by_path.entry(&entry.path).or_default().1 = Some(entry);
    }

    let mut plan = SyncPlan::default();

    for (path, sides) in by_path {
        if !filters.admits(path, &sides) {
            plan.skipped += 1;
            continue;
        }

        match sides {
            (Some(local), None) => plan.push_upload(pair, local.clone()),
            (None, Some(remote)) => plan.push_download(pair, remote.clone()),
            (Some(local), Some(remote)) => {
                match local.vector_clock.compare(&remote.vector_clock) {
                    ClockOrdering::Equal => plan.unchanged += 1,
                    ClockOrdering::Dominates => plan.push_upload(pair, local.clone()),
                    ClockOrdering::DominatedBy => plan.push_download(pair, remote.clone()),
                    ClockOrdering::Concurrent => {
                        plan.resolve_conflict(pair, local.clone(), remote.clone());
                    }
                }
            }
            (None, None) => unreachable!("every path came from one of the two sides"),
        }
    }

    plan
}

impl SyncPlan {
    fn push_upload(&mut self, pair: &Pair, entry: FileEntry) {
        if pair.direction == SyncDirection::DownloadOnly {
            warn!(path = %entry.path, "upload suppressed by download-only direction");
            self.skipped += 1;
        } else {
            self.uploads.push(entry);
        }
    }

    fn push_download(&mut self, pair: &Pair, entry: FileEntry) {
        if pair.direction == SyncDirection::UploadOnly {
            warn!(path = %entry.path, "download suppressed by upload-only direction");
            self.skipped += 1;
        } else {
            self.downloads.push(entry);
        }
    }

    fn resolve_conflict(&mut self, pair: &Pair, local: FileEntry, remote: FileEntry) {
        match pair.strategy {
            ConflictStrategy::Manual => self.conflicts.push(Conflict {
                path: local.path.clone(),
                local,
                remote,
            }),
            ConflictStrategy::LocalWins => self.push_upload(pair, local),
            ConflictStrategy::RemoteWins => self.push_download(pair, remote),
            ConflictStrategy::LastWriteWins => {
                // Greater mtime wins; ties break toward the greater
                // device id so both sides settle identically.
                let local_wins = (local.mtime, local.device_id) > (remote.mtime, remote.device_id);
                if local_wins {
                    self.push_upload(pair, local);
                } else {
                    self.push_download(pair, remote);
                }
            }
        }
    }
}

struct Filters {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
    max_file_size: Option<u64>,
}

impl Filters {
    fn from_pair(pair: &Pair) -> Self {
        let compile = |globs: &[String]| {
            globs
                .iter()
                .filter_map(|glob| match Pattern::new(glob) {
                    Ok(pattern) => Some(pattern),
                    Err(err) => {
                        warn!(%glob, %err, "ignoring unparsable glob");
                        None
                    }
                })
                .collect()
        };

        Self {
            include: compile(&pair.include),
            exclude: compile(&pair.exclude),
            max_file_size: pair.max_file_size,
        }
    }

    fn admits(&self, path: &str, sides: &(Option<&FileEntry>, Option<&FileEntry>)) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|p| p.matches(path)) {
            return false;
        }
        if self.exclude.iter().any(|p| p.matches(path)) {
            return false;
        }
        if let Some(limit) = self.max_file_size {
            let too_big = [sides.0, sides.1]
                .into_iter()
                .flatten()
                .any(|entry| !entry.tombstone && entry.size > limit);
            if too_big {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
#[path = "tests/plan.rs"]
mod tests;
