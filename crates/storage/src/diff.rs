use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use tracing::trace;

use butterfly_primitives::{Hash, SyncError};

use crate::merkle::MerkleIndex;

/// One round of the breadth-first walk: the node paths whose children we
/// want from the peer.
pub type DiffBatch = Vec<String>;

/// The peer's answer: for each queried path, its child map, or `None`
/// where the peer has no internal node (a leaf or nothing at all).
pub type RemoteNodes = BTreeMap<String, Option<BTreeMap<String, Hash>>>;

/// A leaf-level difference between the two trees. Absent sides are
/// `None`; the index exchange fills in the actual entries afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Divergence {
    pub path: String,
    pub local: Option<Hash>,
    pub remote: Option<Hash>,
}

/// Walks the local tree against the peer's, batching node queries per
/// round so a deep tree costs rounds proportional to its depth, not its
/// size.
///
/// `fetch` sends one batch of node paths over the channel and resolves to
/// the peer's child maps. When both sides expose a node at the same path
/// with different child sets, missing children compare as `Hash::ZERO`.
pub async fn diff_walk<F, Fut>(
    local: &MerkleIndex,
    remote_root: Hash,
    mut fetch: F,
) -> Result<Vec<Divergence>, SyncError>
where
    F: FnMut(DiffBatch) -> Fut,
    Fut: Future<Output = Result<RemoteNodes, SyncError>>,
{
    let local_root = local.root_hash().map_err(SyncError::from)?;
    if local_root == remote_root {
        return Ok(Vec::new());
    }

    let mut divergences = Vec::new();
    let mut frontier: Vec<(String, Hash, Hash)> =
        vec![(String::new(), local_root, remote_root)];

    while !frontier.is_empty() {
        let batch: DiffBatch = frontier.iter().map(|(path, _, _)| path.clone()).collect();
        trace!(round_size = batch.len(), "diff walk round");
        let remote_nodes = fetch(batch).await?;

        let mut next = Vec::new();

        for (path, local_hash, remote_hash) in frontier {
            let local_children = local
                .node_at(&path)
                .map_err(SyncError::from)?
                .map(|node| node.children);
            let remote_children = remote_nodes.get(&path).cloned().flatten();

            match (local_children, remote_children) {
                (None, None) => {
                    // A leaf on whichever side has it.
                    divergences.push(Divergence {
                        path,
                        local: nonzero(local_hash),
                        remote: nonzero(remote_hash),
                    });
                }
                (local_map, remote_map) => {
                    // A file here on one side while the other has a whole
                    // directory: surface the file alongside the subtree.
                    if local_map.is_none() && !local_hash.is_zero() {
                        divergences.push(Divergence {
                            path: path.clone(),
                            local: Some(local_hash),
                            remote: None,
                        });
                    }
                    if remote_map.is_none() && !remote_hash.is_zero() {
                        divergences.push(Divergence {
                            path: path.clone(),
                            local: None,
                            remote: Some(remote_hash),
                        });
                    }

                    let local_map = local_map.unwrap_or_default();
                    let remote_map = remote_map.unwrap_or_default();

                    let names: BTreeSet<&String> =
                        local_map.keys().chain(remote_map.keys()).collect();
                    for name in names {
                        let ours = local_map.get(name).copied().unwrap_or(Hash::ZERO);
                        let theirs = remote_map.get(name).copied().unwrap_or(Hash::ZERO);
                        if ours == theirs {
                            continue;
                        }
                        let child_path = if path.is_empty() {
                            (*name).clone()
                        } else {
                            format!("{path}/{name}")
                        };
                        next.push((child_path, ours, theirs));
                    }
                }
            }
        }

        frontier = next;
    }

    Ok(divergences)
}

fn nonzero(hash: Hash) -> Option<Hash> {
    (!hash.is_zero()).then_some(hash)
}

#[cfg(test)]
#[path = "tests/diff.rs"]
mod tests;
