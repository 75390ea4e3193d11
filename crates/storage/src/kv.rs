//! Key-value store abstraction and the in-memory reference implementation.

use crate::StoreError;
use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    fmt,
    ops::Bound,
    sync::Arc,
};

/// A single operation inside a [`WriteBatch`].
#[derive(Debug, Clone)]
enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered set of writes applied atomically by [`KeyValueStore::write`].
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    value_size: usize,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a key-value insertion.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        let (key, value) = (key.into(), value.into());
        self.value_size += key.len() + value.len();
        self.ops.push(BatchOp::Put { key, value });
    }

    /// Queues a key deletion.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        let key = key.into();
        self.value_size += key.len();
        self.ops.push(BatchOp::Delete { key });
    }

    /// Accumulated size of queued keys and values.
    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /// Whether the batch holds no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Drops all queued operations, keeping the allocation.
    pub fn reset(&mut self) {
        self.ops.clear();
        self.value_size = 0;
    }
}

/// A key-value database with atomic batch writes and ordered scans.
///
/// All chain data except the frozen prefix lives behind this trait; the chain
/// core never assumes anything about the backend beyond these operations.
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    /// Returns the value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Applies all operations in `batch` atomically.
    fn write(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Returns all entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Returns all entries with `from <= key < to`, in key order.
    fn scan_range(&self, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Flushes any buffered writes to durable storage.
    fn sync(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Convenience single-operation helpers.
impl dyn KeyValueStore {
    /// Stores a single key-value pair.
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch)
    }

    /// Deletes a single key.
    pub fn delete(&self, key: impl Into<Vec<u8>>) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch)
    }

    /// Whether a key is present.
    pub fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }
}

/// An in-memory [`KeyValueStore`] backed by an ordered map.
///
/// Scans come for free from the `BTreeMap` ordering; batches are applied
/// under a single write lock, which gives the same atomicity readers observe
/// from a real backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut map = self.map.write();
        for op in batch.ops {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let map = self.map.read();
        Ok(map
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn scan_range(&self, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let map = self.map.read();
        Ok(map
            .range::<[u8], _>((Bound::Included(from), Bound::Excluded(to)))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_is_atomic_and_ordered() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"a".to_vec(), b"2".to_vec());
        batch.delete(b"missing".to_vec());
        store.write(batch).unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn prefix_scan_is_bounded() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(b"h1".to_vec(), b"x".to_vec());
        batch.put(b"h2".to_vec(), b"y".to_vec());
        batch.put(b"i1".to_vec(), b"z".to_vec());
        store.write(batch).unwrap();

        let hits = store.scan_prefix(b"h").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, b"h1".to_vec());
    }

    #[test]
    fn range_scan_excludes_upper_bound() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        for key in [b"k1", b"k2", b"k3"] {
            batch.put(key.to_vec(), b"v".to_vec());
        }
        store.write(batch).unwrap();
        let hits = store.scan_range(b"k1", b"k3").unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn value_size_tracks_all_ops() {
        let mut batch = WriteBatch::new();
        batch.put(b"ab".to_vec(), b"cd".to_vec());
        batch.delete(b"ef".to_vec());
        assert_eq!(batch.value_size(), 6);
        batch.reset();
        assert!(batch.is_empty());
        assert_eq!(batch.value_size(), 0);
    }
}
