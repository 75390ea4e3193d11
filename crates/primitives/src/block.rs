//! Block and transaction types.

use crate::{BlockNumHash, Header, SealedHeader, EMPTY_TX_ROOT};
use alloy_primitives::{keccak256, Address, BlockHash, BlockNumber, Bytes, TxHash, B256, U256};
use alloy_rlp::{Encodable, RlpDecodable, RlpEncodable};
use std::ops::Deref;

/// A transaction carried in a block body.
///
/// Signature recovery and execution are out of scope for the chain core, so
/// the type carries no signature material; its identity is the keccak256 of
/// the RLP encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    /// Sender-assigned sequence number.
    pub nonce: u64,
    /// Destination address.
    pub to: Address,
    /// Transferred value.
    pub value: U256,
    /// Call data.
    pub input: Bytes,
}

impl Transaction {
    /// Returns the transaction hash.
    pub fn hash(&self) -> TxHash {
        keccak256(alloy_rlp::encode(self))
    }
}

/// A block body: the transactions and uncle headers of a block.
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable, serde::Serialize, serde::Deserialize)]
pub struct Body {
    /// The block transactions.
    pub transactions: Vec<Transaction>,
    /// Uncle headers.
    pub uncles: Vec<Header>,
}

impl Body {
    /// Computes the commitment over the body transactions that the header's
    /// `tx_root` must match.
    pub fn compute_tx_root(&self) -> B256 {
        if self.transactions.is_empty() {
            return EMPTY_TX_ROOT;
        }
        let hashes: Vec<TxHash> = self.transactions.iter().map(Transaction::hash).collect();
        keccak256(alloy_rlp::encode(&hashes))
    }
}

/// A block: header plus body.
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable, serde::Serialize, serde::Deserialize)]
pub struct Block {
    /// The block header.
    pub header: Header,
    /// The block body.
    pub body: Body,
}

impl Block {
    /// Seals the block by computing the header hash.
    pub fn seal_slow(self) -> SealedBlock {
        SealedBlock { header: self.header.seal_slow(), body: self.body }
    }
}

/// A block with a sealed header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SealedBlock {
    /// The sealed header.
    pub header: SealedHeader,
    /// The block body.
    pub body: Body,
}

impl SealedBlock {
    /// Returns the block hash.
    #[inline]
    pub const fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    /// Returns the block number.
    #[inline]
    pub fn number(&self) -> BlockNumber {
        self.header.number
    }

    /// Returns the hash of the parent block.
    #[inline]
    pub fn parent_hash(&self) -> BlockHash {
        self.header.parent_hash
    }

    /// Returns the block number and hash as a pair.
    #[inline]
    pub const fn num_hash(&self) -> BlockNumHash {
        self.header.num_hash()
    }

    /// Approximate in-memory size, used to bound batched re-imports.
    pub fn size(&self) -> usize {
        self.header.header().length() + self.body.length()
    }

    /// Splits the seal off, returning the raw block.
    pub fn unseal(self) -> Block {
        Block { header: self.header.unseal(), body: self.body }
    }
}

impl Deref for SealedBlock {
    type Target = SealedHeader;

    fn deref(&self) -> &Self::Target {
        &self.header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_tx_root_is_empty_root() {
        assert_eq!(Body::default().compute_tx_root(), EMPTY_TX_ROOT);
    }

    #[test]
    fn tx_root_depends_on_transactions() {
        let one = Body {
            transactions: vec![Transaction { nonce: 0, ..Default::default() }],
            uncles: vec![],
        };
        let two = Body {
            transactions: vec![Transaction { nonce: 1, ..Default::default() }],
            uncles: vec![],
        };
        assert_ne!(one.compute_tx_root(), two.compute_tx_root());
    }

    #[test]
    fn sealed_block_exposes_header_fields() {
        let block = Block {
            header: Header { number: 3, ..Default::default() },
            body: Body::default(),
        };
        let sealed = block.seal_slow();
        assert_eq!(sealed.number(), 3);
        assert_eq!(sealed.num_hash().hash, sealed.hash());
    }
}
