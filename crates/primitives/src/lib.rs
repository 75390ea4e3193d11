//! Commonly used types for the trellis canonical-chain core.
//!
//! This crate contains the chain data model: headers, blocks, transactions,
//! receipts and logs, plus the snapshot diff-layer types exchanged between
//! nodes. All persisted types carry a stable RLP encoding.

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

pub mod block;
pub use block::{Block, Body, SealedBlock, Transaction};

pub mod diff;
pub use diff::{DiffAccount, DiffCode, DiffLayer, DiffStorage, VerifyResult, VerifyStatus};

pub mod header;
pub use header::{BlockNumHash, Header, SealedHeader, EMPTY_TX_ROOT};

pub mod receipt;
pub use receipt::{Log, Receipt};

pub use alloy_primitives::{
    keccak256, Address, BlockHash, BlockNumber, Bloom, Bytes, TxHash, B256, U256,
};
