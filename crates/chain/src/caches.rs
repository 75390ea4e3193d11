//! Bounded LRU caches shared between the writer and readers.
//!
//! Values are cloned in and out; readers never hold references across the
//! writer's critical sections.

use crate::config::{
    BAD_BLOCK_CACHE_EXPIRE, BLOCK_CACHE_LIMIT, BODY_CACHE_LIMIT, DIFF_LAYER_CACHE_LIMIT,
    DIFF_LAYER_ENCODED_CACHE_LIMIT, MAX_BAD_BLOCK_LIMIT, MAX_FUTURE_BLOCKS, RECEIPTS_CACHE_LIMIT,
    TX_LOOKUP_CACHE_LIMIT,
};
use crate::cache::LruMap;
use parking_lot::Mutex;
use std::{sync::Arc, time::Instant};
use trellis_primitives::{
    BlockHash, BlockNumber, Body, Bytes, DiffLayer, Receipt, SealedBlock, TxHash,
};

type Cache<K, V> = Mutex<LruMap<K, V>>;

fn cache<K: std::hash::Hash + PartialEq, V>(limit: u32) -> Cache<K, V> {
    Mutex::new(LruMap::new(limit))
}

/// All bounded caches of the chain manager.
#[derive(Debug)]
pub(crate) struct ChainCaches {
    bodies: Cache<BlockHash, Body>,
    bodies_encoded: Cache<BlockHash, Bytes>,
    receipts: Cache<BlockHash, Vec<Receipt>>,
    blocks: Cache<BlockHash, Arc<SealedBlock>>,
    tx_lookups: Cache<TxHash, BlockNumber>,
    future_blocks: Cache<BlockHash, SealedBlock>,
    bad_blocks: Cache<BlockHash, Instant>,
    diff_layers: Cache<BlockHash, DiffLayer>,
    diff_layers_encoded: Cache<BlockHash, Bytes>,
}

impl ChainCaches {
    pub(crate) fn new() -> Self {
        Self {
            bodies: cache(BODY_CACHE_LIMIT),
            bodies_encoded: cache(BODY_CACHE_LIMIT),
            receipts: cache(RECEIPTS_CACHE_LIMIT),
            blocks: cache(BLOCK_CACHE_LIMIT),
            tx_lookups: cache(TX_LOOKUP_CACHE_LIMIT),
            future_blocks: cache(MAX_FUTURE_BLOCKS),
            bad_blocks: cache(MAX_BAD_BLOCK_LIMIT),
            diff_layers: cache(DIFF_LAYER_CACHE_LIMIT),
            diff_layers_encoded: cache(DIFF_LAYER_ENCODED_CACHE_LIMIT),
        }
    }

    pub(crate) fn body(&self, hash: BlockHash) -> Option<Body> {
        self.bodies.lock().get(&hash).cloned()
    }

    pub(crate) fn insert_body(&self, hash: BlockHash, body: Body) {
        self.bodies.lock().insert(hash, body);
    }

    pub(crate) fn body_encoded(&self, hash: BlockHash) -> Option<Bytes> {
        self.bodies_encoded.lock().get(&hash).cloned()
    }

    pub(crate) fn insert_body_encoded(&self, hash: BlockHash, body: Bytes) {
        self.bodies_encoded.lock().insert(hash, body);
    }

    pub(crate) fn receipts(&self, hash: BlockHash) -> Option<Vec<Receipt>> {
        self.receipts.lock().get(&hash).cloned()
    }

    pub(crate) fn insert_receipts(&self, hash: BlockHash, receipts: Vec<Receipt>) {
        self.receipts.lock().insert(hash, receipts);
    }

    pub(crate) fn block(&self, hash: BlockHash) -> Option<Arc<SealedBlock>> {
        self.blocks.lock().get(&hash).cloned()
    }

    pub(crate) fn insert_block(&self, block: Arc<SealedBlock>) {
        self.blocks.lock().insert(block.hash(), block);
    }

    pub(crate) fn tx_lookup(&self, hash: TxHash) -> Option<BlockNumber> {
        self.tx_lookups.lock().get(&hash).copied()
    }

    pub(crate) fn insert_tx_lookup(&self, hash: TxHash, number: BlockNumber) {
        self.tx_lookups.lock().insert(hash, number);
    }

    // -------- future blocks --------

    pub(crate) fn insert_future_block(&self, block: SealedBlock) {
        self.future_blocks.lock().insert(block.hash(), block);
    }

    pub(crate) fn remove_future_block(&self, hash: BlockHash) {
        self.future_blocks.lock().remove(&hash);
    }

    pub(crate) fn has_future_block(&self, hash: BlockHash) -> bool {
        self.future_blocks.lock().peek(&hash).is_some()
    }

    /// Pending future blocks, sorted by ascending number.
    pub(crate) fn future_blocks_by_number(&self) -> Vec<SealedBlock> {
        let cache = self.future_blocks.lock();
        let mut blocks: Vec<SealedBlock> = cache.iter().map(|(_, block)| block.clone()).collect();
        blocks.sort_by_key(SealedBlock::number);
        blocks
    }

    // -------- bad blocks --------

    pub(crate) fn insert_bad_block(&self, hash: BlockHash) {
        self.bad_blocks.lock().insert(hash, Instant::now());
    }

    /// Whether the hash is a known-bad block whose TTL has not expired.
    /// Expired entries are evicted on probe.
    pub(crate) fn is_bad_block(&self, hash: BlockHash) -> bool {
        let mut cache = self.bad_blocks.lock();
        let expired = cache.peek(&hash).map(|inserted| inserted.elapsed() >= BAD_BLOCK_CACHE_EXPIRE);
        match expired {
            Some(true) => {
                cache.remove(&hash);
                false
            }
            Some(false) => true,
            None => false,
        }
    }

    // -------- diff layers --------

    pub(crate) fn diff_layer(&self, hash: BlockHash) -> Option<DiffLayer> {
        self.diff_layers.lock().get(&hash).cloned()
    }

    pub(crate) fn insert_diff_layer(&self, hash: BlockHash, diff: DiffLayer) {
        self.diff_layers.lock().insert(hash, diff);
    }

    pub(crate) fn remove_diff_layer(&self, hash: BlockHash) {
        self.diff_layers.lock().remove(&hash);
        self.diff_layers_encoded.lock().remove(&hash);
    }

    pub(crate) fn diff_layer_encoded(&self, hash: BlockHash) -> Option<Bytes> {
        self.diff_layers_encoded.lock().get(&hash).cloned()
    }

    pub(crate) fn insert_diff_layer_encoded(&self, hash: BlockHash, encoded: Bytes) {
        self.diff_layers_encoded.lock().insert(hash, encoded);
    }

    /// Drops everything derived from chain data. Bad blocks survive, their
    /// badness is not a function of the current head.
    pub(crate) fn purge(&self) {
        self.bodies.lock().clear();
        self.bodies_encoded.lock().clear();
        self.receipts.lock().clear();
        self.blocks.lock().clear();
        self.tx_lookups.lock().clear();
        self.future_blocks.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_blocks_sort_by_number() {
        let caches = ChainCaches::new();
        for number in [5u64, 1, 3] {
            let block = trellis_primitives::Block {
                header: trellis_primitives::Header { number, ..Default::default() },
                body: Default::default(),
            }
            .seal_slow();
            caches.insert_future_block(block);
        }
        let numbers: Vec<_> =
            caches.future_blocks_by_number().iter().map(SealedBlock::number).collect();
        assert_eq!(numbers, vec![1, 3, 5]);
    }

    #[test]
    fn purge_keeps_bad_blocks() {
        let caches = ChainCaches::new();
        let hash = BlockHash::repeat_byte(1);
        caches.insert_bad_block(hash);
        caches.purge();
        assert!(caches.is_bad_block(hash));
    }
}
