//! Snapshot diff layers and diff verification results.

use crate::Receipt;
use alloy_primitives::{keccak256, BlockHash, BlockNumber, Bytes, B256};
use alloy_rlp::{RlpDecodable, RlpEncodable};

/// A modified account inside a [`DiffLayer`].
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct DiffAccount {
    /// Hash of the account address.
    pub account: B256,
    /// Slim-encoded account data.
    pub blob: Bytes,
}

/// Modified storage slots of one account inside a [`DiffLayer`].
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct DiffStorage {
    /// Hash of the account address.
    pub account: B256,
    /// Storage slot keys.
    pub keys: Vec<B256>,
    /// Storage slot values, index-aligned with `keys`.
    pub vals: Vec<Bytes>,
}

impl DiffStorage {
    /// Sorts keys and values in tandem by key.
    fn sort(&mut self) {
        let mut entries: Vec<(B256, Bytes)> =
            self.keys.drain(..).zip(self.vals.drain(..)).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        (self.keys, self.vals) = entries.into_iter().unzip();
    }
}

/// A newly deployed contract code inside a [`DiffLayer`].
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct DiffCode {
    /// Hash of the code.
    pub hash: B256,
    /// The code itself.
    pub code: Bytes,
}

/// The state delta produced by executing one block: destructed accounts,
/// modified accounts and storages, and new codes.
///
/// Diff layers are exchanged between peers for fast state transfer, so the
/// encoding must be reproducible: [`DiffLayer::sort`] establishes the
/// canonical ordering before [`DiffLayer::diff_hash`] is taken. Receipts ride
/// along for local use but are excluded from the hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffLayer {
    /// Hash of the block this diff belongs to.
    pub block_hash: BlockHash,
    /// Number of the block this diff belongs to.
    pub number: BlockNumber,
    /// Accounts destructed in this block.
    pub destructs: Vec<B256>,
    /// Accounts modified in this block.
    pub accounts: Vec<DiffAccount>,
    /// Storage slots modified in this block.
    pub storages: Vec<DiffStorage>,
    /// Codes deployed in this block.
    pub codes: Vec<DiffCode>,
    /// Receipts of the block. Not part of the diff hash.
    pub receipts: Vec<Receipt>,
}

/// The hashed portion of a [`DiffLayer`].
#[derive(RlpEncodable)]
struct HashedDiff<'a> {
    block_hash: &'a BlockHash,
    number: BlockNumber,
    destructs: &'a Vec<B256>,
    accounts: &'a Vec<DiffAccount>,
    storages: &'a Vec<DiffStorage>,
    codes: &'a Vec<DiffCode>,
}

/// Wire representation of a [`DiffLayer`].
#[derive(RlpEncodable, RlpDecodable)]
struct WireDiff {
    block_hash: BlockHash,
    number: BlockNumber,
    destructs: Vec<B256>,
    accounts: Vec<DiffAccount>,
    storages: Vec<DiffStorage>,
    codes: Vec<DiffCode>,
}

impl DiffLayer {
    /// Establishes the canonical ordering: codes by hash, destructs by hash,
    /// accounts by account hash, storages by account and then by slot key.
    ///
    /// Maps are unordered at the source, so without this step two nodes would
    /// compute different hashes for the same delta.
    pub fn sort(&mut self) {
        self.codes.sort_by(|a, b| a.hash.cmp(&b.hash));
        self.destructs.sort();
        self.accounts.sort_by(|a, b| a.account.cmp(&b.account));
        self.storages.sort_by(|a, b| a.account.cmp(&b.account));
        for storage in &mut self.storages {
            storage.sort();
        }
    }

    /// Computes the reproducible identity of this diff.
    pub fn diff_hash(&self) -> B256 {
        let hashed = HashedDiff {
            block_hash: &self.block_hash,
            number: self.number,
            destructs: &self.destructs,
            accounts: &self.accounts,
            storages: &self.storages,
            codes: &self.codes,
        };
        keccak256(alloy_rlp::encode(&hashed))
    }

    /// Encodes the diff for transfer or the diff store.
    pub fn encode(&self) -> Bytes {
        let wire = WireDiff {
            block_hash: self.block_hash,
            number: self.number,
            destructs: self.destructs.clone(),
            accounts: self.accounts.clone(),
            storages: self.storages.clone(),
            codes: self.codes.clone(),
        };
        alloy_rlp::encode(&wire).into()
    }

    /// Decodes a diff previously produced by [`DiffLayer::encode`].
    pub fn decode(mut buf: &[u8]) -> alloy_rlp::Result<Self> {
        let wire = <WireDiff as alloy_rlp::Decodable>::decode(&mut buf)?;
        Ok(Self {
            block_hash: wire.block_hash,
            number: wire.number,
            destructs: wire.destructs,
            accounts: wire.accounts,
            storages: wire.storages,
            codes: wire.codes,
            receipts: Vec::new(),
        })
    }
}

/// Outcome classification of a diff verification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    /// Block too new to verify.
    BlockTooNew,
    /// Block newer than the current head, wait for it.
    BlockNewer,
    /// Block may be on a fork still within reorg distance.
    PossibleFork,
    /// Block is not on a fork that can still become canonical.
    ImpossibleFork,
    /// The submitted diff hash does not match the local diff.
    DiffHashMismatch,
    /// Verified against the locally produced diff layer.
    FullVerified,
    /// Header is known but no local diff exists to compare against.
    PartiallyVerified,
    /// Verification failed for an internal reason.
    UnexpectedError,
}

/// The reply to a diff verification request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    /// Verification outcome.
    pub status: VerifyStatus,
    /// Number of the block the request was about.
    pub block_number: BlockNumber,
    /// Hash of the block the request was about.
    pub block_hash: BlockHash,
    /// State root of the block, when verification got far enough to know it.
    pub root: B256,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shuffled() -> DiffLayer {
        DiffLayer {
            block_hash: BlockHash::repeat_byte(1),
            number: 9,
            destructs: vec![B256::repeat_byte(5), B256::repeat_byte(2)],
            accounts: vec![
                DiffAccount { account: B256::repeat_byte(7), blob: Bytes::from_static(b"b") },
                DiffAccount { account: B256::repeat_byte(3), blob: Bytes::from_static(b"a") },
            ],
            storages: vec![DiffStorage {
                account: B256::repeat_byte(4),
                keys: vec![B256::repeat_byte(9), B256::repeat_byte(1)],
                vals: vec![Bytes::from_static(b"nine"), Bytes::from_static(b"one")],
            }],
            codes: vec![
                DiffCode { hash: B256::repeat_byte(8), code: Bytes::from_static(b"y") },
                DiffCode { hash: B256::repeat_byte(6), code: Bytes::from_static(b"x") },
            ],
            receipts: Vec::new(),
        }
    }

    #[test]
    fn sort_is_deterministic() {
        let mut a = shuffled();
        let mut b = shuffled();
        b.destructs.reverse();
        b.accounts.reverse();
        b.codes.reverse();
        a.sort();
        b.sort();
        assert_eq!(a, b);
        assert_eq!(a.diff_hash(), b.diff_hash());
    }

    #[test]
    fn storage_values_follow_keys() {
        let mut diff = shuffled();
        diff.sort();
        let storage = &diff.storages[0];
        assert_eq!(storage.keys[0], B256::repeat_byte(1));
        assert_eq!(storage.vals[0], Bytes::from_static(b"one"));
    }

    #[test]
    fn receipts_do_not_affect_diff_hash() {
        let mut with = shuffled();
        with.sort();
        let without = with.clone();
        with.receipts.push(Receipt::default());
        assert_eq!(with.diff_hash(), without.diff_hash());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut diff = shuffled();
        diff.sort();
        let decoded = DiffLayer::decode(&diff.encode()).unwrap();
        assert_eq!(decoded.diff_hash(), diff.diff_hash());
    }
}
