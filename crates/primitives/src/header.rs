//! Block header types.

use alloy_primitives::{b256, keccak256, BlockHash, BlockNumber, Bytes, B256, U256};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use std::ops::Deref;

/// Root of the empty transaction trie.
pub const EMPTY_TX_ROOT: B256 =
    b256!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421");

/// A block header.
///
/// Headers are immutable once inserted; the identity of a header is the
/// keccak256 of its RLP encoding, see [`Header::seal_slow`].
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable, serde::Serialize, serde::Deserialize)]
pub struct Header {
    /// The hash of the parent header.
    pub parent_hash: B256,
    /// The block number.
    pub number: BlockNumber,
    /// Commitment to the world state after executing this block.
    pub root: B256,
    /// Commitment to the transactions contained in the block body.
    pub tx_root: B256,
    /// The block difficulty. Zero for proof-of-stake blocks.
    pub difficulty: U256,
    /// Timestamp in seconds since the unix epoch.
    pub time: u64,
    /// Arbitrary consensus-engine payload (vanity + proposer tag).
    pub extra: Bytes,
}

impl Header {
    /// Computes the header hash and seals the header with it.
    pub fn seal_slow(self) -> SealedHeader {
        let hash = keccak256(alloy_rlp::encode(&self));
        SealedHeader { header: self, hash }
    }

    /// Seals the header with a known hash.
    ///
    /// WARNING: the hash is not verified against the header contents.
    pub const fn seal(self, hash: B256) -> SealedHeader {
        SealedHeader { header: self, hash }
    }
}

/// A [`Header`] together with its memoized hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SealedHeader {
    header: Header,
    hash: BlockHash,
}

impl SealedHeader {
    /// Returns the header hash.
    #[inline]
    pub const fn hash(&self) -> BlockHash {
        self.hash
    }

    /// Returns a reference to the inner header.
    #[inline]
    pub const fn header(&self) -> &Header {
        &self.header
    }

    /// Returns the block number and hash as a pair.
    #[inline]
    pub const fn num_hash(&self) -> BlockNumHash {
        BlockNumHash { number: self.header.number, hash: self.hash }
    }

    /// Consumes the seal, returning the raw header.
    pub fn unseal(self) -> Header {
        self.header
    }
}

impl Deref for SealedHeader {
    type Target = Header;

    fn deref(&self) -> &Self::Target {
        &self.header
    }
}

/// A block number and hash pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BlockNumHash {
    /// The block number.
    pub number: BlockNumber,
    /// The block hash.
    pub hash: BlockHash,
}

impl From<(BlockNumber, BlockHash)> for BlockNumHash {
    fn from((number, hash): (BlockNumber, BlockHash)) -> Self {
        Self { number, hash }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_rlp::Decodable;

    #[test]
    fn sealing_is_stable() {
        let header = Header { number: 7, time: 1700000000, ..Default::default() };
        let sealed = header.clone().seal_slow();
        assert_eq!(sealed.hash(), header.seal_slow().hash());
    }

    #[test]
    fn hash_covers_all_fields() {
        let base = Header::default();
        let mut changed = base.clone();
        changed.extra = Bytes::from_static(b"x");
        assert_ne!(base.seal_slow().hash(), changed.seal_slow().hash());
    }

    #[test]
    fn header_rlp_roundtrip() {
        let header = Header {
            parent_hash: B256::repeat_byte(1),
            number: 42,
            root: B256::repeat_byte(2),
            tx_root: EMPTY_TX_ROOT,
            difficulty: U256::from(1000u64),
            time: 123,
            extra: Bytes::from_static(b"seal"),
        };
        let encoded = alloy_rlp::encode(&header);
        let decoded = Header::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(header, decoded);
    }
}
