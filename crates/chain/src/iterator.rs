//! The insert iterator: pairs each block of an insertion batch with its
//! header-verification result and body validation.

use crate::{error::BlockError, traits::Validator};
use crossbeam_channel::Receiver;
use trellis_primitives::{SealedBlock, SealedHeader};

/// Walks an insertion batch, merging the verifier's ordered result stream
/// with per-block body validation.
pub(crate) struct InsertIterator<'a> {
    chain: &'a [SealedBlock],
    results: Receiver<Result<(), BlockError>>,
    validator: &'a dyn Validator,
    /// Index of the block most recently returned by `next`; starts one
    /// before the batch.
    index: Option<usize>,
}

impl<'a> InsertIterator<'a> {
    pub(crate) fn new(
        chain: &'a [SealedBlock],
        results: Receiver<Result<(), BlockError>>,
        validator: &'a dyn Validator,
    ) -> Self {
        Self { chain, results, validator, index: None }
    }

    /// Advances to the next block, pulling its verification result.
    ///
    /// A closed result stream means the verifier was torn down mid-batch;
    /// the block is reported as unverified rather than silently accepted.
    pub(crate) fn next(&mut self) -> Option<(&'a SealedBlock, Result<(), BlockError>)> {
        let index = self.index.map(|index| index + 1).unwrap_or(0);
        if index >= self.chain.len() {
            return None;
        }
        self.index = Some(index);
        let block = &self.chain[index];
        let verdict = match self.results.recv() {
            Ok(Ok(())) => self.validator.validate_body(block),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(BlockError::UnknownAncestor),
        };
        Some((block, verdict))
    }

    /// Index of the block most recently returned, zero before the first.
    pub(crate) fn index(&self) -> usize {
        self.index.unwrap_or(0)
    }

    /// The header of the block preceding the current one within the batch.
    pub(crate) fn previous(&self) -> Option<&'a SealedHeader> {
        let index = self.index?;
        index.checked_sub(1).map(|prev| &self.chain[prev].header)
    }

    /// The first block of the batch.
    pub(crate) fn first(&self) -> &'a SealedBlock {
        &self.chain[0]
    }

    /// Blocks consumed so far.
    pub(crate) fn processed(&self) -> usize {
        self.index.map(|index| index + 1).unwrap_or(0)
    }

    /// Blocks not yet consumed.
    pub(crate) fn remaining(&self) -> usize {
        self.chain.len() - self.processed()
    }
}
