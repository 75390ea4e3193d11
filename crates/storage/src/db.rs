//! The chain database facade.

use crate::{AncientBlock, AncientStore, KeyValueStore, StoreError, WriteBatch};
use std::sync::Arc;
use trellis_primitives::BlockNumber;

/// Bundle of the stores the chain core writes to: the live key-value store,
/// the optional ancient segment, and the optional diff-layer store.
#[derive(Debug, Clone)]
pub struct ChainDb {
    live: Arc<dyn KeyValueStore>,
    ancient: Option<Arc<AncientStore>>,
    diff: Option<Arc<dyn KeyValueStore>>,
}

impl ChainDb {
    /// Creates a facade over a live store only.
    pub fn new(live: Arc<dyn KeyValueStore>) -> Self {
        Self { live, ancient: None, diff: None }
    }

    /// Attaches an ancient segment.
    pub fn with_ancient(mut self, ancient: Arc<AncientStore>) -> Self {
        self.ancient = Some(ancient);
        self
    }

    /// Attaches a diff-layer store.
    pub fn with_diff_store(mut self, diff: Arc<dyn KeyValueStore>) -> Self {
        self.diff = Some(diff);
        self
    }

    /// The live key-value store.
    pub fn live(&self) -> &Arc<dyn KeyValueStore> {
        &self.live
    }

    /// The ancient segment, if configured.
    pub fn ancient(&self) -> Option<&Arc<AncientStore>> {
        self.ancient.as_ref()
    }

    /// The diff-layer store, if configured.
    pub fn diff_store(&self) -> Option<&Arc<dyn KeyValueStore>> {
        self.diff.as_ref()
    }

    /// Number of frozen blocks; zero when no ancient segment is attached.
    pub fn ancients(&self) -> u64 {
        self.ancient.as_ref().map(|ancient| ancient.count()).unwrap_or_default()
    }

    /// Truncates the ancient segment to `count` blocks. No-op without one.
    pub fn truncate_ancients(&self, count: u64) {
        if let Some(ancient) = &self.ancient {
            ancient.truncate_to(count);
        }
    }

    /// Appends frozen blocks to the ancient segment.
    pub fn write_ancient_blocks(&self, blocks: Vec<AncientBlock>) -> Result<usize, StoreError> {
        match &self.ancient {
            Some(ancient) => ancient.append(blocks),
            None => Err(StoreError::Backend("no ancient store attached".to_owned())),
        }
    }

    /// Applies a batch to the live store.
    pub fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.live.write(batch)
    }

    /// Flushes the live store.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.live.sync()
    }

    /// Looks up a frozen block number for a hash by scanning the segment tail.
    ///
    /// Only used on the recovery path after a hash-to-number mapping was lost;
    /// regular lookups go through the schema index.
    pub fn ancient_number(&self, hash: trellis_primitives::BlockHash) -> Option<BlockNumber> {
        let ancient = self.ancient.as_ref()?;
        let mut number = ancient.count();
        while number > 0 {
            number -= 1;
            if ancient.hash(number) == Some(hash) {
                return Some(number);
            }
        }
        None
    }
}
