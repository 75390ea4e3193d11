//! Append-only cold storage for the frozen chain prefix.

use crate::StoreError;
use parking_lot::RwLock;
use trellis_primitives::{BlockHash, BlockNumber, Body, Header, Receipt, U256};

/// One frozen block with everything that belongs to it.
#[derive(Debug, Clone)]
pub struct AncientBlock {
    /// Hash of the frozen block.
    pub hash: BlockHash,
    /// The block header.
    pub header: Header,
    /// The block body.
    pub body: Body,
    /// The block receipts.
    pub receipts: Vec<Receipt>,
    /// Total difficulty up to and including this block.
    pub td: U256,
}

/// The ancient segment: an append-only store holding blocks `0..count`.
///
/// Everything in here is canonical and finalized history; the only mutation
/// besides appending is truncating the newest end after a deep rewind.
#[derive(Debug, Default)]
pub struct AncientStore {
    items: RwLock<Vec<AncientBlock>>,
}

impl AncientStore {
    /// Creates an empty segment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frozen blocks. Block numbers `0..count` are present.
    pub fn count(&self) -> u64 {
        self.items.read().len() as u64
    }

    /// Appends a run of blocks. The first block must continue the segment.
    ///
    /// Returns the number of bytes written (approximated by the payload
    /// lengths), so callers can meter their write throughput.
    pub fn append(&self, blocks: Vec<AncientBlock>) -> Result<usize, StoreError> {
        let mut items = self.items.write();
        let mut size = 0usize;
        for block in blocks {
            let have = items.len() as u64;
            if block.header.number != have {
                return Err(StoreError::AncientGap { have, got: block.header.number });
            }
            size += alloy_rlp::encode(&block.header).len()
                + alloy_rlp::encode(&block.body).len()
                + alloy_rlp::encode(&block.receipts).len();
            items.push(block);
        }
        Ok(size)
    }

    /// Truncates the segment so that only blocks `0..count` remain.
    pub fn truncate_to(&self, count: u64) {
        let mut items = self.items.write();
        if (items.len() as u64) > count {
            items.truncate(count as usize);
        }
    }

    /// Returns the frozen block at `number`, if frozen.
    pub fn block(&self, number: BlockNumber) -> Option<AncientBlock> {
        self.items.read().get(number as usize).cloned()
    }

    /// Returns the hash of the frozen block at `number`.
    pub fn hash(&self, number: BlockNumber) -> Option<BlockHash> {
        self.items.read().get(number as usize).map(|block| block.hash)
    }

    /// Returns the header of the frozen block at `number`.
    pub fn header(&self, number: BlockNumber) -> Option<Header> {
        self.items.read().get(number as usize).map(|block| block.header.clone())
    }

    /// Returns the body of the frozen block at `number`.
    pub fn body(&self, number: BlockNumber) -> Option<Body> {
        self.items.read().get(number as usize).map(|block| block.body.clone())
    }

    /// Returns the receipts of the frozen block at `number`.
    pub fn receipts(&self, number: BlockNumber) -> Option<Vec<Receipt>> {
        self.items.read().get(number as usize).map(|block| block.receipts.clone())
    }

    /// Returns the total difficulty of the frozen block at `number`.
    pub fn td(&self, number: BlockNumber) -> Option<U256> {
        self.items.read().get(number as usize).map(|block| block.td)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn frozen(number: BlockNumber) -> AncientBlock {
        let header = Header { number, ..Default::default() };
        let hash = header.clone().seal_slow().hash();
        AncientBlock {
            hash,
            header,
            body: Body::default(),
            receipts: Vec::new(),
            td: U256::from(number + 1),
        }
    }

    #[test]
    fn append_requires_contiguity() {
        let store = AncientStore::new();
        store.append(vec![frozen(0), frozen(1)]).unwrap();
        assert_eq!(store.count(), 2);
        assert_matches!(
            store.append(vec![frozen(5)]),
            Err(StoreError::AncientGap { have: 2, got: 5 })
        );
    }

    #[test]
    fn truncate_drops_newest_end() {
        let store = AncientStore::new();
        store.append(vec![frozen(0), frozen(1), frozen(2)]).unwrap();
        store.truncate_to(1);
        assert_eq!(store.count(), 1);
        assert!(store.block(1).is_none());
        assert!(store.block(0).is_some());
        // truncating above the head is a no-op
        store.truncate_to(10);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn lookups_by_number() {
        let store = AncientStore::new();
        store.append(vec![frozen(0)]).unwrap();
        assert_eq!(store.td(0), Some(U256::from(1u64)));
        assert_eq!(store.hash(0), Some(store.block(0).unwrap().hash));
        assert!(store.header(3).is_none());
    }
}
