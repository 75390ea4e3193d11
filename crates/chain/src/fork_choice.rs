//! Fork-choice: decides whether a candidate header should replace the
//! current canonical head.

use crate::{
    engine::{ConsensusEngine, HeaderReader},
    error::{BlockError, ChainResult},
};
use rand::Rng;
use std::sync::Arc;
use tracing::debug;
use trellis_primitives::SealedHeader;

/// Predicate deciding whether a locally relevant block (e.g. self-mined)
/// should be preferred on a total-difficulty tie.
pub type PreservePredicate = dyn Fn(&SealedHeader) -> bool + Send + Sync;

/// The fork-choice rule.
///
/// With a fast-finality engine the branch carrying the higher justified
/// block wins outright; otherwise the decision falls back to total
/// difficulty, breaking exact ties by block height and then by the local
/// preserve bias with a coin flip.
pub struct ForkChoice {
    engine: Arc<dyn ConsensusEngine>,
    should_preserve: Option<Box<PreservePredicate>>,
}

impl std::fmt::Debug for ForkChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkChoice")
            .field("engine", &self.engine)
            .field("should_preserve", &self.should_preserve.is_some())
            .finish()
    }
}

impl ForkChoice {
    /// Creates a fork-choice rule for the given engine.
    pub fn new(
        engine: Arc<dyn ConsensusEngine>,
        should_preserve: Option<Box<PreservePredicate>>,
    ) -> Self {
        Self { engine, should_preserve }
    }

    /// Whether adopting `candidate` requires reorganizing away from
    /// `current`, by total difficulty alone.
    pub fn reorg_needed(
        &self,
        chain: &dyn HeaderReader,
        current: &SealedHeader,
        candidate: &SealedHeader,
    ) -> ChainResult<bool> {
        let local_td =
            chain.td(current.hash(), current.number).ok_or(BlockError::UnknownAncestor)?;
        // the candidate's difficulty is written before fork-choice runs, but
        // tolerate a missing entry by deriving it from the parent
        let extern_td = match chain.td(candidate.hash(), candidate.number) {
            Some(td) => td,
            None => {
                chain
                    .td(candidate.parent_hash, candidate.number.saturating_sub(1))
                    .ok_or(BlockError::UnknownAncestor)?
                    + candidate.difficulty
            }
        };

        if extern_td != local_td {
            return Ok(extern_td > local_td);
        }
        // equal difficulty: prefer the lower block, then the preserve bias
        if candidate.number != current.number {
            return Ok(candidate.number < current.number);
        }
        let current_preserved = self.preserve(current);
        let candidate_preserved = self.preserve(candidate);
        let reorg =
            !current_preserved && (candidate_preserved || rand::thread_rng().gen::<bool>());
        debug!(
            current = %current.hash(),
            candidate = %candidate.hash(),
            reorg,
            "Fork-choice tie break"
        );
        Ok(reorg)
    }

    /// Like [`ForkChoice::reorg_needed`], but consults the engine's
    /// fast-finality capability first: the branch containing the higher
    /// justified block wins regardless of difficulty.
    pub fn reorg_needed_with_fast_finality(
        &self,
        chain: &dyn HeaderReader,
        current: &SealedHeader,
        candidate: &SealedHeader,
    ) -> ChainResult<bool> {
        let Some(posa) = self.engine.posa() else {
            return self.reorg_needed(chain, current, candidate);
        };
        let justified = |header: &SealedHeader| {
            posa.justified_number_and_hash(chain, header).map(|(number, _)| number).unwrap_or(0)
        };
        let current_justified = justified(current);
        let candidate_justified = justified(candidate);
        if current_justified != candidate_justified {
            return Ok(candidate_justified > current_justified);
        }
        self.reorg_needed(chain, current, candidate)
    }

    fn preserve(&self, header: &SealedHeader) -> bool {
        self.should_preserve.as_ref().is_some_and(|preserve| preserve(header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BlockError;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use trellis_primitives::{BlockHash, BlockNumber, Header, U256};

    #[derive(Debug, Default)]
    struct TdMap {
        tds: RwLock<HashMap<BlockHash, U256>>,
    }

    impl TdMap {
        fn set(&self, hash: BlockHash, td: u64) {
            self.tds.write().insert(hash, U256::from(td));
        }
    }

    impl HeaderReader for TdMap {
        fn current_header(&self) -> Option<SealedHeader> {
            None
        }
        fn header(&self, _hash: BlockHash, _number: BlockNumber) -> Option<SealedHeader> {
            None
        }
        fn header_by_hash(&self, _hash: BlockHash) -> Option<SealedHeader> {
            None
        }
        fn header_by_number(&self, _number: BlockNumber) -> Option<SealedHeader> {
            None
        }
        fn td(&self, hash: BlockHash, _number: BlockNumber) -> Option<U256> {
            self.tds.read().get(&hash).copied()
        }
    }

    #[derive(Debug)]
    struct NoopEngine;

    impl ConsensusEngine for NoopEngine {
        fn verify_header(
            &self,
            _chain: &dyn HeaderReader,
            _header: &SealedHeader,
            _parent: Option<&SealedHeader>,
        ) -> Result<(), BlockError> {
            Ok(())
        }
    }

    fn header(number: BlockNumber, tag: u8) -> SealedHeader {
        Header {
            number,
            extra: trellis_primitives::Bytes::copy_from_slice(&[tag]),
            ..Default::default()
        }
        .seal_slow()
    }

    #[test]
    fn higher_td_wins() {
        let chain = TdMap::default();
        let current = header(5, 1);
        let candidate = header(4, 2);
        chain.set(current.hash(), 10);
        chain.set(candidate.hash(), 11);

        let fc = ForkChoice::new(Arc::new(NoopEngine), None);
        assert!(fc.reorg_needed(&chain, &current, &candidate).unwrap());
        chain.set(candidate.hash(), 9);
        assert!(!fc.reorg_needed(&chain, &current, &candidate).unwrap());
    }

    #[test]
    fn equal_td_prefers_lower_block() {
        let chain = TdMap::default();
        let current = header(6, 1);
        let candidate = header(5, 2);
        chain.set(current.hash(), 10);
        chain.set(candidate.hash(), 10);

        let fc = ForkChoice::new(Arc::new(NoopEngine), None);
        assert!(fc.reorg_needed(&chain, &current, &candidate).unwrap());
    }

    #[test]
    fn preserve_bias_keeps_local_block() {
        let chain = TdMap::default();
        let current = header(5, 1);
        let candidate = header(5, 2);
        chain.set(current.hash(), 10);
        chain.set(candidate.hash(), 10);

        let local = current.hash();
        let fc = ForkChoice::new(
            Arc::new(NoopEngine),
            Some(Box::new(move |header| header.hash() == local)),
        );
        // the preserved current head never loses a tie
        for _ in 0..16 {
            assert!(!fc.reorg_needed(&chain, &current, &candidate).unwrap());
        }
    }

    #[test]
    fn missing_td_is_an_error() {
        let chain = TdMap::default();
        let current = header(5, 1);
        let candidate = header(5, 2);
        let fc = ForkChoice::new(Arc::new(NoopEngine), None);
        assert!(fc.reorg_needed(&chain, &current, &candidate).is_err());
    }
}
