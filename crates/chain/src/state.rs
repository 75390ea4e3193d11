//! World-state database facade.
//!
//! The trie itself is an external collaborator; the chain core only needs to
//! know which state roots are resolvable, to keep recent roots in memory with
//! reference counts, and to flush them to disk on the garbage collector's
//! schedule. Roots are tracked as opaque blobs keyed by the root hash.

use crate::cache::LruMap;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{HashMap, VecDeque},
    fs,
    path::Path,
};
use tracing::{debug, warn};
use trellis_primitives::{Bytes, B256};
use trellis_storage::{schema, ChainDb, StoreError, WriteBatch};

#[derive(Debug)]
struct DirtyRoot {
    refs: u64,
    blob: Bytes,
}

#[derive(alloy_rlp::RlpEncodable, alloy_rlp::RlpDecodable)]
struct JournalEntry {
    root: B256,
    blob: Bytes,
}

#[derive(Debug, Default)]
struct DirtyState {
    roots: HashMap<B256, DirtyRoot>,
    /// Insertion order, oldest first; used when capping memory.
    order: VecDeque<B256>,
    size: usize,
}

/// Tracks resolvable state roots: recent ones in a reference-counted dirty
/// set, flushed ones on disk, plus a bounded clean cache for disk reads.
#[derive(Debug)]
pub struct StateCache {
    db: ChainDb,
    no_tries: bool,
    dirty: Mutex<DirtyState>,
    clean: RwLock<LruMap<B256, Bytes>>,
}

impl StateCache {
    /// Creates a state facade over the chain database.
    ///
    /// `clean_limit_mb` sizes the clean cache; `no_tries` short-circuits all
    /// state presence checks (insecure, mirrors running without state).
    pub fn new(db: ChainDb, clean_limit_mb: usize, no_tries: bool) -> Self {
        // blobs are tiny; approximate the MB allowance with an entry count
        let entries = (clean_limit_mb * 1024).max(1024) as u32;
        Self {
            db,
            no_tries,
            dirty: Mutex::new(DirtyState::default()),
            clean: RwLock::new(LruMap::new(entries)),
        }
    }

    /// Whether the state with the given root can be opened.
    pub fn has_state(&self, root: B256) -> bool {
        if self.no_tries {
            return true;
        }
        if self.dirty.lock().roots.contains_key(&root) {
            return true;
        }
        if self.clean.read().peek(&root).is_some() {
            return true;
        }
        match schema::read_state_blob(&self.db, root) {
            Ok(Some(blob)) => {
                self.clean.write().insert(root, blob);
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(%root, %err, "State lookup failed");
                false
            }
        }
    }

    /// Registers a freshly produced state root in the dirty set.
    ///
    /// The root starts unreferenced; the garbage collector holds it alive via
    /// [`StateCache::reference`] until its block falls out of the retention
    /// window.
    pub fn insert_dirty(&self, root: B256, blob: Bytes) {
        let mut dirty = self.dirty.lock();
        if dirty.roots.contains_key(&root) {
            return;
        }
        dirty.size += blob.len() + 32;
        dirty.order.push_back(root);
        dirty.roots.insert(root, DirtyRoot { refs: 0, blob });
    }

    /// Adds a reference to a dirty root.
    pub fn reference(&self, root: B256) {
        if let Some(entry) = self.dirty.lock().roots.get_mut(&root) {
            entry.refs += 1;
        }
    }

    /// Drops a reference to a dirty root; the root is discarded once
    /// unreferenced.
    pub fn dereference(&self, root: B256) {
        let mut dirty = self.dirty.lock();
        let remove = match dirty.roots.get_mut(&root) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = dirty.roots.remove(&root) {
                dirty.size = dirty.size.saturating_sub(entry.blob.len() + 32);
            }
            dirty.order.retain(|candidate| *candidate != root);
        }
    }

    /// Flushes the given root to disk, removing it from the dirty set.
    ///
    /// Committing a root that is not dirty is a no-op; it is already durable.
    pub fn commit(&self, root: B256) -> Result<(), StoreError> {
        let blob = {
            let mut dirty = self.dirty.lock();
            match dirty.roots.remove(&root) {
                Some(entry) => {
                    dirty.size = dirty.size.saturating_sub(entry.blob.len() + 32);
                    dirty.order.retain(|candidate| *candidate != root);
                    entry.blob
                }
                None => return Ok(()),
            }
        };
        let mut batch = WriteBatch::new();
        schema::write_state_blob(&mut batch, root, &blob);
        self.db.write(batch)?;
        self.clean.write().insert(root, blob);
        Ok(())
    }

    /// Writes a state root produced outside the execution pipeline (genesis,
    /// snap-sync pivot) straight to disk.
    pub fn commit_external(&self, root: B256, blob: Bytes) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        schema::write_state_blob(&mut batch, root, &blob);
        self.db.write(batch)
    }

    /// Flushes the oldest dirty roots until memory use is at most `limit`.
    pub fn cap(&self, limit: usize) -> Result<(), StoreError> {
        loop {
            let root = {
                let dirty = self.dirty.lock();
                if dirty.size <= limit {
                    return Ok(());
                }
                match dirty.order.front() {
                    Some(root) => *root,
                    None => return Ok(()),
                }
            };
            self.commit(root)?;
        }
    }

    /// Current dirty memory use in bytes.
    pub fn dirty_size(&self) -> usize {
        self.dirty.lock().size
    }

    /// Number of dirty roots still in memory.
    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().roots.len()
    }

    /// Persists the clean cache to a journal file for warm restarts.
    ///
    /// Failures are logged, not propagated: the journal is an optimization.
    pub fn save_cache(&self, path: &Path) {
        let entries: Vec<JournalEntry> = self
            .clean
            .read()
            .iter()
            .map(|(root, blob)| JournalEntry { root: *root, blob: blob.clone() })
            .collect();
        let count = entries.len();
        match fs::write(path, alloy_rlp::encode(&entries)) {
            Ok(()) => debug!(path = %path.display(), entries = count, "Persisted clean cache"),
            Err(err) => warn!(path = %path.display(), %err, "Failed to persist clean cache"),
        }
    }

    /// Restores the clean cache from a journal file, ignoring a missing or
    /// corrupt journal.
    pub fn load_cache(&self, path: &Path) {
        let Ok(raw) = fs::read(path) else { return };
        let Ok(entries) =
            <Vec<JournalEntry> as alloy_rlp::Decodable>::decode(&mut raw.as_slice())
        else {
            warn!(path = %path.display(), "Discarding corrupt clean-cache journal");
            return;
        };
        let mut clean = self.clean.write();
        for entry in entries {
            clean.insert(entry.root, entry.blob);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_storage::MemoryStore;

    fn state() -> StateCache {
        StateCache::new(ChainDb::new(MemoryStore::new()), 16, false)
    }

    #[test]
    fn dirty_roots_are_resolvable() {
        let state = state();
        let root = B256::repeat_byte(1);
        assert!(!state.has_state(root));
        state.insert_dirty(root, Bytes::from_static(b"blob"));
        assert!(state.has_state(root));
    }

    #[test]
    fn dereference_discards_unreferenced_roots() {
        let state = state();
        let root = B256::repeat_byte(2);
        state.insert_dirty(root, Bytes::from_static(b"blob"));
        state.reference(root);
        state.dereference(root);
        assert!(!state.has_state(root));
        assert_eq!(state.dirty_size(), 0);
    }

    #[test]
    fn commit_survives_dirty_eviction() {
        let state = state();
        let root = B256::repeat_byte(3);
        state.insert_dirty(root, Bytes::from_static(b"blob"));
        state.commit(root).unwrap();
        assert_eq!(state.dirty_count(), 0);
        assert!(state.has_state(root));
    }

    #[test]
    fn cap_flushes_oldest_first() {
        let state = state();
        let old = B256::repeat_byte(4);
        let new = B256::repeat_byte(5);
        state.insert_dirty(old, Bytes::from(vec![0u8; 64]));
        state.insert_dirty(new, Bytes::from(vec![0u8; 64]));
        state.cap(100).unwrap();
        assert_eq!(state.dirty_count(), 1);
        // the old root went to disk, the new one is still dirty
        assert!(state.has_state(old));
        assert!(state.has_state(new));
    }

    #[test]
    fn no_tries_short_circuits() {
        let state = StateCache::new(ChainDb::new(MemoryStore::new()), 16, true);
        assert!(state.has_state(B256::repeat_byte(9)));
    }
}
