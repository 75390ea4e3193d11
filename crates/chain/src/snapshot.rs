//! Layered snapshot tree facade.
//!
//! The actual account/storage snapshot machinery is an external collaborator;
//! the chain core only consults layer presence per state root, triggers
//! rebuilds, journals the disk layer on shutdown, and (with pipelined
//! commits) reads back per-layer verification results.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use tracing::{info, warn};
use trellis_primitives::B256;
use trellis_storage::{schema, ChainDb, StoreError, WriteBatch};

/// Verification state of a single snapshot layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotLayer {
    /// Whether a verifier has delivered a verdict for this layer.
    pub verified: bool,
    /// The verdict; meaningless while `verified` is false.
    pub valid: bool,
}

#[derive(Debug, Default)]
struct TreeInner {
    layers: HashMap<B256, SnapshotLayer>,
    /// Layer roots in insertion order, oldest first.
    order: VecDeque<B256>,
    disk_root: B256,
}

/// The snapshot tree: diff layers stacked on a persistent disk layer, keyed
/// by state root.
#[derive(Debug)]
pub struct SnapshotTree {
    db: ChainDb,
    inner: RwLock<TreeInner>,
    retention: usize,
}

impl SnapshotTree {
    /// Opens the snapshot tree over `head_root`.
    ///
    /// When the persisted disk layer does not match and `recovery` is not
    /// set, the tree is rebuilt from the head root. In recovery mode a
    /// mismatching (higher) disk layer is left in place so generation can
    /// resume behind the rewound head.
    pub fn new(
        db: ChainDb,
        retention: usize,
        head_root: B256,
        recovery: bool,
    ) -> Result<Self, StoreError> {
        let disk_root = schema::read_snapshot_root(&db)?;
        let tree = Self { db, inner: RwLock::new(TreeInner::default()), retention };
        match disk_root {
            Some(root) if root == head_root || recovery => {
                let mut inner = tree.inner.write();
                inner.disk_root = root;
                inner.layers.insert(root, SnapshotLayer { verified: true, valid: true });
                inner.order.push_back(root);
                if root != head_root {
                    warn!(disk = %root, head = %head_root, "Snapshot recovery enabled");
                }
            }
            _ => tree.rebuild(head_root)?,
        }
        Ok(tree)
    }

    /// Whether a snapshot layer exists for the given root.
    pub fn has_snapshot(&self, root: B256) -> bool {
        self.inner.read().layers.contains_key(&root)
    }

    /// Returns the verification state of the layer for `root`.
    pub fn snapshot(&self, root: B256) -> Option<SnapshotLayer> {
        self.inner.read().layers.get(&root).copied()
    }

    /// Stacks a new layer for `root` on top of the tree, flattening layers
    /// beyond the retention window into the disk layer.
    ///
    /// The disk layer is the oldest retained entry; flattening a diff layer
    /// into it moves the disk root up the stack.
    pub fn update(&self, root: B256, verified: bool, valid: bool) {
        let mut inner = self.inner.write();
        if inner.layers.insert(root, SnapshotLayer { verified, valid }).is_none() {
            inner.order.push_back(root);
        }
        while inner.order.len() > self.retention {
            if let Some(stale) = inner.order.pop_front() {
                inner.layers.remove(&stale);
            }
            if let Some(front) = inner.order.front().copied() {
                inner.disk_root = front;
            }
        }
    }

    /// Records a verifier verdict for an existing layer.
    pub fn mark_verified(&self, root: B256, valid: bool) {
        if let Some(layer) = self.inner.write().layers.get_mut(&root) {
            layer.verified = true;
            layer.valid = valid;
        }
    }

    /// Discards all layers and regenerates the tree from `root`.
    pub fn rebuild(&self, root: B256) -> Result<(), StoreError> {
        info!(%root, "Rebuilding state snapshot");
        let mut inner = self.inner.write();
        inner.layers.clear();
        inner.order.clear();
        inner.disk_root = root;
        inner.layers.insert(root, SnapshotLayer { verified: true, valid: true });
        inner.order.push_back(root);

        let mut batch = WriteBatch::new();
        schema::write_snapshot_root(&mut batch, root);
        self.db.write(batch)
    }

    /// Journals the tree bottom-up on shutdown, anchored at `root`.
    ///
    /// Returns the base (disk-layer) root the journal was written for.
    pub fn journal(&self, root: B256) -> Result<B256, StoreError> {
        let base = {
            let inner = self.inner.read();
            if !inner.layers.contains_key(&root) {
                warn!(%root, "Journaling snapshot for unknown root");
            }
            inner.disk_root
        };
        let mut batch = WriteBatch::new();
        schema::write_snapshot_root(&mut batch, base);
        self.db.write(batch)?;
        Ok(base)
    }

    /// The root of the persistent disk layer.
    pub fn disk_root(&self) -> B256 {
        self.inner.read().disk_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_storage::MemoryStore;

    fn tree() -> SnapshotTree {
        SnapshotTree::new(ChainDb::new(MemoryStore::new()), 4, B256::repeat_byte(1), false)
            .unwrap()
    }

    #[test]
    fn rebuild_starts_from_head_root() {
        let tree = tree();
        assert!(tree.has_snapshot(B256::repeat_byte(1)));
        assert_eq!(tree.disk_root(), B256::repeat_byte(1));
    }

    #[test]
    fn update_flattens_beyond_retention() {
        let tree = tree();
        for byte in 2u8..9 {
            tree.update(B256::repeat_byte(byte), true, true);
        }
        // the oldest layers were flattened into the disk layer
        assert!(!tree.has_snapshot(B256::repeat_byte(2)));
        assert!(tree.has_snapshot(B256::repeat_byte(8)));
        assert_eq!(tree.disk_root(), B256::repeat_byte(5));
    }

    #[test]
    fn verification_verdicts_stick() {
        let tree = tree();
        tree.update(B256::repeat_byte(7), false, false);
        tree.mark_verified(B256::repeat_byte(7), false);
        let layer = tree.snapshot(B256::repeat_byte(7)).unwrap();
        assert!(layer.verified);
        assert!(!layer.valid);
    }

    #[test]
    fn reopen_respects_persisted_disk_root() {
        let db = ChainDb::new(MemoryStore::new());
        let first =
            SnapshotTree::new(db.clone(), 4, B256::repeat_byte(3), false).unwrap();
        drop(first);
        let reopened = SnapshotTree::new(db, 4, B256::repeat_byte(3), false).unwrap();
        assert_eq!(reopened.disk_root(), B256::repeat_byte(3));
    }
}
