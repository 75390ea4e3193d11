//! Store error types.

use trellis_primitives::BlockNumber;

/// Errors surfaced by the persistent store facade.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend rejected or failed an operation.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored value failed to decode.
    #[error("corrupt value under {context}: {reason}")]
    Corrupt {
        /// What was being decoded.
        context: &'static str,
        /// Decoder error message.
        reason: String,
    },

    /// An append to the ancient segment was not contiguous.
    #[error("non-contiguous ancient append: have {have} items, got block #{got}")]
    AncientGap {
        /// Items currently frozen.
        have: u64,
        /// Number of the offered block.
        got: BlockNumber,
    },

    /// The database was written by an incompatible version of the code.
    #[error("incompatible database version: found {found}, expected {expected}; resync required")]
    IncompatibleVersion {
        /// Version found on disk.
        found: u64,
        /// Version this build writes.
        expected: u64,
    },
}

impl From<alloy_rlp::Error> for StoreError {
    fn from(err: alloy_rlp::Error) -> Self {
        Self::Corrupt { context: "rlp", reason: err.to_string() }
    }
}
