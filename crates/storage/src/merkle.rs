use std::collections::BTreeMap;

use butterfly_primitives::{now_ms, Hash, MerkleNode, PairId};
use butterfly_store::key::MerkleNodeKey;
use butterfly_store::{Column, Store, Transaction};

use crate::StorageError;

/// The Merkle tree derived from a pair's live file set.
///
/// Nodes mirror the folder hierarchy: internal nodes are directories,
/// leaves are files carrying the entry's content hash. Tombstoned entries
/// are not in the tree; a delete removes the leaf and re-hashes the
/// ancestor chain.
#[derive(Clone, Debug)]
pub struct MerkleIndex {
    store: Store,
    pair_id: PairId,
}

impl MerkleIndex {
    #[must_use]
    pub fn new(store: Store, pair_id: PairId) -> Self {
        Self { store, pair_id }
    }

    /// The root fingerprint; `Hash::ZERO` for an empty tree.
    pub fn root_hash(&self) -> Result<Hash, StorageError> {
        Ok(self.node_at("")?.map_or(Hash::ZERO, |node| node.hash))
    }

    pub fn node_at(&self, node_path: &str) -> Result<Option<MerkleNode>, StorageError> {
        Ok(self.store.get(&self.key(node_path))?)
    }

    /// Children of the queried nodes, for answering a peer's diff round.
    /// `None` marks a path with no internal node (a leaf or nothing).
    pub fn nodes_for_diff(
        &self,
        node_paths: &[String],
    ) -> Result<BTreeMap<String, Option<BTreeMap<String, Hash>>>, StorageError> {
        let mut answer = BTreeMap::new();
        for path in node_paths {
            let children = self.node_at(path)?.map(|node| node.children);
            let _prev = answer.insert(path.clone(), children);
        }
        Ok(answer)
    }

    /// Replaces (or removes, with `leaf = None`) one file leaf and
    /// recomputes the ancestor chain bottom-up into `tx`. Returns the new
    /// root hash. Cost is O(depth · fan-out).
    pub fn apply_leaf_change(
        &self,
        tx: &mut Transaction,
        file_path: &str,
        leaf: Option<Hash>,
    ) -> Result<Hash, StorageError> {
        let mut components: Vec<&str> = file_path.split('/').collect();
        let mut child_name = components
            .pop()
            .expect("validated paths have at least one component")
            .to_owned();
        let mut child_hash = leaf;

        // Walk from the deepest directory up to the root "".
        loop {
            let node_path = components.join("/");
            let mut children = self
                .node_at(&node_path)?
                .map(|node| node.children)
                .unwrap_or_default();

            match child_hash {
                Some(hash) => {
                    let _prev = children.insert(child_name.clone(), hash);
                }
                None => {
                    let _prev = children.remove(&child_name);
                }
            }

            if children.is_empty() {
                tx.delete_typed(&self.key(&node_path));
                child_hash = None;
            } else {
                let node = MerkleNode {
                    node_path: node_path.clone(),
                    hash: MerkleNode::hash_children(&children),
                    child_count: children.len() as u32,
                    children,
                    updated_at: now_ms(),
                };
                child_hash = Some(node.hash);
                tx.put(&self.key(&node_path), &node)?;
            }

            match components.pop() {
                Some(name) => child_name = name.to_owned(),
                None => break,
            }
        }

        Ok(child_hash.unwrap_or(Hash::ZERO))
    }

    /// Rebuilds every node from scratch out of the live `(path, hash)`
    /// set, replacing whatever the tree held before. Returns the new root
    /// hash.
    pub fn rebuild(
        &self,
        tx: &mut Transaction,
        live_files: &[(String, Hash)],
    ) -> Result<Hash, StorageError> {
        // Drop the old tree.
        let stale: Vec<(Box<[u8]>, MerkleNode)> = self
            .store
            .scan_prefix(Column::MerkleNodes, &MerkleNodeKey::pair_prefix(&self.pair_id))?;
        for (_, node) in stale {
            tx.delete_typed(&self.key(&node.node_path));
        }

        if live_files.is_empty() {
            return Ok(Hash::ZERO);
        }

        // Group leaves under their directories, materializing the chain
        // of ancestors for every file.
        fn ensure_dir_chain(dirs: &mut BTreeMap<String, BTreeMap<String, Hash>>, dir_path: &str) {
            let mut path = dir_path.to_owned();
            loop {
                let _slot = dirs.entry(path.clone()).or_default();
                match path.rfind('/') {
                    Some(cut) => path.truncate(cut),
                    None if path.is_empty() => break,
                    None => path.clear(),
                }
            }
        }

        let mut dirs: BTreeMap<String, BTreeMap<String, Hash>> = BTreeMap::new();
        for (file_path, hash) in live_files {
            let (dir, name) = match file_path.rsplit_once('/') {
                Some((dir, name)) => (dir.to_owned(), name.to_owned()),
                None => (String::new(), file_path.clone()),
            };
            ensure_dir_chain(&mut dirs, &dir);
            let _prev = dirs.entry(dir).or_default().insert(name, *hash);
        }

        // Deepest directories first, so child hashes exist before their
        // parents hash them.
        let mut order: Vec<String> = dirs.keys().cloned().collect();
        order.sort_by_key(|path| core::cmp::Reverse(path.matches('/').count() + usize::from(!path.is_empty())));

        let mut root_hash = Hash::ZERO;
        let mut computed: BTreeMap<String, Hash> = BTreeMap::new();

        for dir_path in order {
            let mut children = dirs.remove(&dir_path).unwrap_or_default();

            // Fold in subdirectory hashes.
            let sub_prefix = if dir_path.is_empty() {
                String::new()
            } else {
                format!("{dir_path}/")
            };
            for (sub_path, sub_hash) in computed.range(sub_prefix.clone()..) {
                if !sub_path.starts_with(&sub_prefix) {
                    break;
                }
                let relative = &sub_path[sub_prefix.len()..];
                if relative.contains('/') {
                    continue;
                }
                let _prev = children.insert(relative.to_owned(), *sub_hash);
            }

            if children.is_empty() {
                continue;
            }

            let node = MerkleNode {
                node_path: dir_path.clone(),
                hash: MerkleNode::hash_children(&children),
                child_count: children.len() as u32,
                children,
                updated_at: now_ms(),
            };
            if dir_path.is_empty() {
                root_hash = node.hash;
            }
            let _prev = computed.insert(dir_path.clone(), node.hash);
            tx.put(&self.key(&dir_path), &node)?;
        }

        Ok(root_hash)
    }

    fn key(&self, node_path: &str) -> MerkleNodeKey {
        MerkleNodeKey {
            pair_id: self.pair_id,
            node_path: node_path.to_owned(),
        }
    }
}

#[cfg(test)]
#[path = "tests/merkle.rs"]
mod tests;
