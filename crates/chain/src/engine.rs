//! Consensus engine interfaces.

use crate::error::BlockError;
use std::fmt::Debug;
use trellis_primitives::{BlockHash, BlockNumber, SealedHeader, U256};

/// Read access to the header chain, as needed by consensus engines and
/// fork-choice.
#[auto_impl::auto_impl(&, Arc)]
pub trait HeaderReader: Send + Sync {
    /// The current header of the canonical chain.
    fn current_header(&self) -> Option<SealedHeader>;

    /// The header with the given hash and number.
    fn header(&self, hash: BlockHash, number: BlockNumber) -> Option<SealedHeader>;

    /// The header with the given hash.
    fn header_by_hash(&self, hash: BlockHash) -> Option<SealedHeader>;

    /// The canonical header at the given height.
    fn header_by_number(&self, number: BlockNumber) -> Option<SealedHeader>;

    /// The total difficulty of the block with the given hash and number.
    fn td(&self, hash: BlockHash, number: BlockNumber) -> Option<U256>;
}

/// A consensus engine verifies headers and optionally provides fast-finality
/// information.
#[auto_impl::auto_impl(&, Arc)]
pub trait ConsensusEngine: Debug + Send + Sync {
    /// Verifies a header against its parent.
    ///
    /// `parent` is resolved by the caller and may come from the same batch as
    /// `header`; `None` means the ancestor is unknown locally and the engine
    /// is expected to classify the header accordingly.
    fn verify_header(
        &self,
        chain: &dyn HeaderReader,
        header: &SealedHeader,
        parent: Option<&SealedHeader>,
    ) -> Result<(), BlockError>;

    /// Returns the fast-finality capability of this engine, if it has one.
    ///
    /// Engines without the capability fall back to pure total-difficulty
    /// fork-choice.
    fn posa(&self) -> Option<&dyn PosaEngine> {
        None
    }
}

/// Fast-finality capability of a proof-of-staked-authority engine.
pub trait PosaEngine: Debug + Send + Sync {
    /// The highest justified block on the branch including `header`.
    ///
    /// `None` puts the branch at a disadvantage during reorg decisions.
    fn justified_number_and_hash(
        &self,
        chain: &dyn HeaderReader,
        header: &SealedHeader,
    ) -> Option<(BlockNumber, BlockHash)>;

    /// The highest finalized header on the branch including `header`.
    fn finalized_header(
        &self,
        chain: &dyn HeaderReader,
        header: &SealedHeader,
    ) -> Option<SealedHeader>;

    /// Whether `header` is far enough past finality that flushing state
    /// below it cannot be invalidated by a reorg.
    fn enough_distance(&self, chain: &dyn HeaderReader, header: &SealedHeader) -> bool;
}
