//! Block processor and validator interfaces.

use crate::{error::BlockError, state::StateCache};
use std::{fmt::Debug, sync::Arc};
use trellis_primitives::{DiffLayer, Log, Receipt, SealedBlock, B256};
use trellis_storage::{schema, ChainDb};

/// Everything produced by executing one block on top of its parent state.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    /// The state root after execution.
    pub root: B256,
    /// Receipts, one per transaction.
    pub receipts: Vec<Receipt>,
    /// All logs emitted during execution, in order.
    pub logs: Vec<Log>,
    /// Total gas used by the block.
    pub gas_used: u64,
    /// The state delta, when the executor tracks one.
    pub diff: Option<DiffLayer>,
    /// Preimages of the trie keys touched during execution.
    pub preimages: Vec<(B256, trellis_primitives::Bytes)>,
}

/// Executes blocks against a parent state.
#[auto_impl::auto_impl(&, Arc)]
pub trait Processor: Debug + Send + Sync {
    /// Executes `block` on the state identified by `parent_root`.
    fn process(&self, block: &SealedBlock, parent_root: B256) -> Result<ProcessOutcome, BlockError>;
}

/// Validates blocks before and after execution.
#[auto_impl::auto_impl(&, Arc)]
pub trait Validator: Debug + Send + Sync {
    /// Validates everything checkable without execution, classifying the
    /// block's relation to locally available state:
    ///
    /// * [`BlockError::KnownBlock`] — block and state are already present,
    /// * [`BlockError::UnknownAncestor`] — the parent header is missing,
    /// * [`BlockError::PrunedAncestor`] — the parent is present without state.
    fn validate_body(&self, block: &SealedBlock) -> Result<(), BlockError>;

    /// Validates the execution outcome against the header commitments.
    fn validate_state(&self, block: &SealedBlock, outcome: &ProcessOutcome)
        -> Result<(), BlockError>;
}

/// The default validator over the chain database and state facade.
#[derive(Debug)]
pub struct ChainValidator {
    db: ChainDb,
    state: Arc<StateCache>,
}

impl ChainValidator {
    /// Creates a validator reading through the given stores.
    pub fn new(db: ChainDb, state: Arc<StateCache>) -> Self {
        Self { db, state }
    }

    fn has_block(&self, block: &SealedBlock) -> bool {
        matches!(schema::read_body(&self.db, block.hash(), block.number()), Ok(Some(_)))
    }
}

impl Validator for ChainValidator {
    fn validate_body(&self, block: &SealedBlock) -> Result<(), BlockError> {
        if self.has_block(block) && self.state.has_state(block.root) {
            return Err(BlockError::KnownBlock);
        }
        let got = block.body.compute_tx_root();
        if got != block.tx_root {
            return Err(BlockError::TxRootMismatch { got, expected: block.tx_root });
        }
        let Some(parent_number) = block.number().checked_sub(1) else {
            // a re-offered genesis block is known by definition
            return Err(BlockError::KnownBlock);
        };
        let parent =
            schema::read_header(&self.db, block.parent_hash(), parent_number).ok().flatten();
        match parent {
            None => Err(BlockError::UnknownAncestor),
            Some(parent) if !self.state.has_state(parent.root) => {
                Err(BlockError::PrunedAncestor)
            }
            Some(_) => Ok(()),
        }
    }

    fn validate_state(
        &self,
        block: &SealedBlock,
        outcome: &ProcessOutcome,
    ) -> Result<(), BlockError> {
        let receipt_gas =
            outcome.receipts.last().map(|receipt| receipt.cumulative_gas_used).unwrap_or_default();
        if receipt_gas != outcome.gas_used {
            return Err(BlockError::GasUsedMismatch { got: outcome.gas_used, expected: receipt_gas });
        }
        if outcome.root != block.root {
            return Err(BlockError::StateRootMismatch { got: outcome.root, expected: block.root });
        }
        Ok(())
    }
}
