//! Error types surfaced at the chain boundary.

use trellis_primitives::{BlockHash, BlockNumber, B256};
use trellis_storage::StoreError;

/// Result alias for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;

/// Per-block classification produced by header verification and body/state
/// validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    /// Block and its state are already present. Non-fatal.
    #[error("block already known")]
    KnownBlock,

    /// The parent header is not known locally.
    #[error("unknown ancestor")]
    UnknownAncestor,

    /// The parent is known but its state has been pruned.
    #[error("pruned ancestor")]
    PrunedAncestor,

    /// The block timestamp is ahead of the verifier's clock allowance.
    #[error("block in the future")]
    FutureBlock,

    /// The block number does not continue the parent.
    #[error("invalid block number {got}, parent is {parent}")]
    InvalidNumber {
        /// Number carried by the header.
        got: BlockNumber,
        /// Number of the parent header.
        parent: BlockNumber,
    },

    /// The header is on the local ban list.
    #[error("banned hash {0}")]
    BannedHash(BlockHash),

    /// The body does not match the header's transaction commitment.
    #[error("mismatched transaction root: got {got}, expected {expected}")]
    TxRootMismatch {
        /// Root computed over the body.
        got: B256,
        /// Root carried by the header.
        expected: B256,
    },

    /// Execution produced a different state root than the header claims.
    #[error("mismatched state root: got {got}, expected {expected}")]
    StateRootMismatch {
        /// Root produced by execution.
        got: B256,
        /// Root carried by the header.
        expected: B256,
    },

    /// Execution gas differs from the receipts' cumulative gas.
    #[error("invalid gas used: got {got}, expected {expected}")]
    GasUsedMismatch {
        /// Gas reported by execution.
        got: u64,
        /// Gas accumulated in the receipts.
        expected: u64,
    },

    /// A side-chain block claims a state root already owned by a canonical
    /// block at the same height.
    #[error("sidechain ghost-state attack")]
    GhostState,

    /// A future block beyond the queueing horizon.
    #[error("future block timestamp {time} > allowed {max}")]
    TooFarInFuture {
        /// Timestamp carried by the header.
        time: u64,
        /// Maximum accepted timestamp.
        max: u64,
    },
}

/// Errors surfaced by chain-level operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// The chain is shutting down; the writer lock is closed.
    #[error("blockchain is stopped")]
    ChainStopped,

    /// An insertion was interrupted cooperatively.
    #[error("insertion is interrupted")]
    InsertionInterrupted,

    /// The committed state root failed verification.
    #[error("state root verification failed")]
    StateRootVerificationFailed,

    /// The database carries no genesis block.
    #[error("genesis not found in chain")]
    NoGenesis,

    /// Receipts were offered for blocks the header chain reorged away from.
    #[error("receipts do not match the canonical chain")]
    SideChainReceipts,

    /// No diff layer is known for the requested block.
    #[error("diff layer not found")]
    DiffLayerNotFound,

    /// The input batch is not a contiguous chain segment.
    #[error(
        "non contiguous insert: item {prev_index} is #{prev_number} [{prev_hash}], \
         item {index} is #{number} [{hash}] (parent [{parent}])"
    )]
    NonContiguousInsert {
        /// Index of the preceding item.
        prev_index: usize,
        /// Number of the preceding item.
        prev_number: BlockNumber,
        /// Hash of the preceding item.
        prev_hash: BlockHash,
        /// Index of the offending item.
        index: usize,
        /// Number of the offending item.
        number: BlockNumber,
        /// Hash of the offending item.
        hash: BlockHash,
        /// Parent hash the offending item claims.
        parent: BlockHash,
    },

    /// A block referenced by hash is not in the store.
    #[error("unknown block {0}")]
    UnknownBlock(BlockHash),

    /// The old branch of a reorg could not be walked back.
    #[error("invalid old chain")]
    InvalidOldChain,

    /// The new branch of a reorg could not be walked back.
    #[error("invalid new chain")]
    InvalidNewChain,

    /// No ancestor with available state was found.
    #[error("missing parent")]
    MissingParent,

    /// An export range was inverted.
    #[error("export failed: first ({first}) is greater than last ({last})")]
    InvalidExportRange {
        /// Requested start of the range.
        first: BlockNumber,
        /// Requested end of the range.
        last: BlockNumber,
    },

    /// The chain reorganized while it was being exported.
    #[error("chain reorg during export")]
    ReorgDuringExport,

    /// An export writer failed.
    #[error("export io error: {0}")]
    ExportIo(String),

    /// Per-block validation or verification failure.
    #[error(transparent)]
    Block(#[from] BlockError),

    /// Store-level failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An insertion failure, carrying the index of the first failing block.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("block {index}: {error}")]
pub struct InsertionError {
    /// Index of the first failing block in the input batch.
    pub index: usize,
    /// The failure itself.
    pub error: ChainError,
}

impl InsertionError {
    /// Creates an insertion error at `index`.
    pub fn new(index: usize, error: impl Into<ChainError>) -> Self {
        Self { index, error: error.into() }
    }
}
