//! Receipt and log types.

use alloy_primitives::{Address, BlockHash, BlockNumber, Bloom, Bytes, TxHash, B256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};

/// A log emitted during block execution.
///
/// Only the address, topics and data are part of the stored encoding; the
/// block metadata is derived from the containing block when receipts are read
/// back, and `removed` is flipped when a reorg drops the containing block.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Log {
    /// The address that emitted the log.
    pub address: Address,
    /// Indexed topics.
    pub topics: Vec<B256>,
    /// Unindexed payload.
    pub data: Bytes,
    /// Number of the block this log was emitted in. Derived.
    pub block_number: BlockNumber,
    /// Hash of the block this log was emitted in. Derived.
    pub block_hash: BlockHash,
    /// Hash of the transaction that emitted the log. Derived.
    pub tx_hash: TxHash,
    /// Set when the containing block was dropped in a reorg.
    pub removed: bool,
}

/// The result of executing a single transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Receipt {
    /// Whether the transaction succeeded.
    pub success: bool,
    /// Gas used by the block up to and including this transaction.
    pub cumulative_gas_used: u64,
    /// Bloom filter over the receipt logs.
    pub bloom: Bloom,
    /// Logs emitted by the transaction.
    pub logs: Vec<Log>,
}

/// Stored (block-metadata-free) representation of a [`Log`].
#[derive(RlpEncodable, RlpDecodable)]
struct StoredLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
}

/// Stored representation of a [`Receipt`].
#[derive(RlpEncodable, RlpDecodable)]
struct StoredReceipt {
    success: bool,
    cumulative_gas_used: u64,
    bloom: Bloom,
    logs: Vec<StoredLog>,
}

impl From<&Receipt> for StoredReceipt {
    fn from(receipt: &Receipt) -> Self {
        Self {
            success: receipt.success,
            cumulative_gas_used: receipt.cumulative_gas_used,
            bloom: receipt.bloom,
            logs: receipt
                .logs
                .iter()
                .map(|log| StoredLog {
                    address: log.address,
                    topics: log.topics.clone(),
                    data: log.data.clone(),
                })
                .collect(),
        }
    }
}

impl From<StoredReceipt> for Receipt {
    fn from(stored: StoredReceipt) -> Self {
        Self {
            success: stored.success,
            cumulative_gas_used: stored.cumulative_gas_used,
            bloom: stored.bloom,
            logs: stored
                .logs
                .into_iter()
                .map(|log| Log {
                    address: log.address,
                    topics: log.topics,
                    data: log.data,
                    ..Default::default()
                })
                .collect(),
        }
    }
}

impl Encodable for Receipt {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        StoredReceipt::from(self).encode(out)
    }

    fn length(&self) -> usize {
        StoredReceipt::from(self).length()
    }
}

impl Decodable for Receipt {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        Ok(StoredReceipt::decode(buf)?.into())
    }
}

impl Receipt {
    /// Fills in the block metadata on every contained log.
    pub fn derive_fields(&mut self, number: BlockNumber, hash: BlockHash, tx_hash: TxHash) {
        for log in &mut self.logs {
            log.block_number = number;
            log.block_hash = hash;
            log.tx_hash = tx_hash;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Receipt {
        Receipt {
            success: true,
            cumulative_gas_used: 21000,
            bloom: Bloom::repeat_byte(3),
            logs: vec![Log {
                address: Address::repeat_byte(9),
                topics: vec![B256::repeat_byte(1)],
                data: Bytes::from_static(b"payload"),
                ..Default::default()
            }],
        }
    }

    #[test]
    fn rlp_roundtrip_drops_derived_fields() {
        let mut receipt = sample();
        receipt.derive_fields(5, BlockHash::repeat_byte(7), TxHash::repeat_byte(8));

        let encoded = alloy_rlp::encode(&receipt);
        let decoded = Receipt::decode(&mut encoded.as_slice()).unwrap();

        assert_eq!(decoded.logs[0].block_number, 0);
        assert_eq!(decoded.logs[0].address, receipt.logs[0].address);
        assert_eq!(decoded.cumulative_gas_used, receipt.cumulative_gas_used);
    }

    #[test]
    fn derive_fields_touches_every_log() {
        let mut receipt = sample();
        receipt.logs.push(receipt.logs[0].clone());
        receipt.derive_fields(9, BlockHash::repeat_byte(1), TxHash::repeat_byte(2));
        assert!(receipt.logs.iter().all(|log| log.block_number == 9));
    }
}
