//! The header chain: headers, total difficulty, hash/number indices and the
//! current-header marker.

use crate::{
    engine::{ConsensusEngine, HeaderReader},
    error::{BlockError, ChainError, ChainResult, InsertionError},
    fork_choice::ForkChoice,
};
use crate::cache::LruMap;
use arc_swap::ArcSwap;
use metrics::gauge;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, warn};
use trellis_primitives::{BlockHash, BlockNumber, SealedHeader, U256};
use trellis_storage::{schema, ChainDb, StoreError, WriteBatch};

const HEADER_CACHE_LIMIT: u32 = 512;
const TD_CACHE_LIMIT: u32 = 1024;
const NUMBER_CACHE_LIMIT: u32 = 2048;

/// Maintains headers, total difficulty and the hash/number mapping, along
/// with the current-header marker.
///
/// The header chain can run ahead of the block chain: during header-first
/// sync the current header may be above the current block.
#[derive(Debug)]
pub struct HeaderChain {
    db: ChainDb,
    genesis: ArcSwap<SealedHeader>,
    current: ArcSwap<SealedHeader>,
    interrupt: Arc<AtomicBool>,
    header_cache: Mutex<LruMap<BlockHash, SealedHeader>>,
    td_cache: Mutex<LruMap<BlockHash, U256>>,
    number_cache: Mutex<LruMap<BlockHash, BlockNumber>>,
}

impl HeaderChain {
    /// Opens the header chain, restoring the current-header marker or
    /// falling back to genesis.
    pub fn new(
        db: ChainDb,
        genesis: SealedHeader,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Self, StoreError> {
        let hc = Self {
            db,
            current: ArcSwap::from_pointee(genesis.clone()),
            genesis: ArcSwap::from_pointee(genesis),
            interrupt,
            header_cache: Mutex::new(LruMap::new(HEADER_CACHE_LIMIT)),
            td_cache: Mutex::new(LruMap::new(TD_CACHE_LIMIT)),
            number_cache: Mutex::new(LruMap::new(NUMBER_CACHE_LIMIT)),
        };
        if let Some(hash) = schema::read_head_header_hash(&hc.db)? {
            if let Some(header) = hc.header_by_hash(hash) {
                hc.set_current(header);
            }
        }
        Ok(hc)
    }

    /// The genesis header.
    pub fn genesis(&self) -> SealedHeader {
        self.genesis.load().as_ref().clone()
    }

    /// Replaces the in-memory current-header marker.
    pub fn set_current(&self, header: SealedHeader) {
        gauge!("chain.head.header").set(header.number as f64);
        self.current.store(Arc::new(header));
    }

    /// Replaces the genesis header after a chain reset.
    pub fn set_genesis(&self, genesis: SealedHeader) {
        self.genesis.store(Arc::new(genesis));
    }

    /// Whether a header is present.
    pub fn has_header(&self, hash: BlockHash, number: BlockNumber) -> bool {
        self.header(hash, number).is_some()
    }

    /// The canonical hash at a height.
    pub fn canonical_hash(&self, number: BlockNumber) -> Option<BlockHash> {
        schema::read_canonical_hash(&self.db, number).ok().flatten()
    }

    /// Appends pre-validated headers, updating the canonical header chain if
    /// fork-choice prefers the new branch. Returns whether the branch became
    /// canonical.
    pub fn insert(
        &self,
        headers: &[SealedHeader],
        fork_choice: &ForkChoice,
    ) -> ChainResult<bool> {
        let Some(last) = headers.last() else { return Ok(false) };

        let mut batch = WriteBatch::new();
        let mut parent_td = None;
        for header in headers {
            if self.interrupt.load(Ordering::Relaxed) {
                return Err(ChainError::InsertionInterrupted);
            }
            if self.has_header(header.hash(), header.number) {
                parent_td = Some(
                    self.td(header.hash(), header.number).ok_or(BlockError::UnknownAncestor)?,
                );
                continue;
            }
            let ptd = match parent_td {
                Some(td) => td,
                None => self
                    .td(header.parent_hash, header.number.saturating_sub(1))
                    .ok_or(BlockError::UnknownAncestor)?,
            };
            let td = ptd + header.difficulty;
            schema::write_header(&mut batch, header);
            schema::write_td(&mut batch, header.number, header.hash(), td);
            self.td_cache.lock().insert(header.hash(), td);
            parent_td = Some(td);
        }
        self.db.write(batch).map_err(ChainError::Store)?;

        let current = self.current_header().unwrap_or_else(|| self.genesis());
        let reorg = fork_choice.reorg_needed_with_fast_finality(self, &current, last)?;
        if !reorg {
            return Ok(false);
        }

        // rewrite the canonical mapping from the new tip back to the fork point
        let mut batch = WriteBatch::new();
        let mut cursor = last.clone();
        loop {
            if self.canonical_hash(cursor.number) == Some(cursor.hash()) {
                break;
            }
            schema::write_canonical_hash(&mut batch, cursor.number, cursor.hash());
            if cursor.number == 0 {
                break;
            }
            cursor = self
                .header(cursor.parent_hash, cursor.number - 1)
                .ok_or(ChainError::InvalidNewChain)?;
        }
        // drop stale assignments above the new head
        let mut stale = last.number + 1;
        while self.canonical_hash(stale).is_some() {
            schema::delete_canonical_hash(&mut batch, stale);
            stale += 1;
        }
        schema::write_head_header_hash(&mut batch, last.hash());
        self.db.write(batch).map_err(ChainError::Store)?;
        self.set_current(last.clone());
        Ok(true)
    }

    /// Validates contiguity and engine rules for a batch of headers.
    ///
    /// `check_freq` is advisory: engines that support sparse seal checks can
    /// use it to skip expensive verification on all but every n-th header.
    pub fn validate_chain(
        &self,
        engine: &dyn ConsensusEngine,
        headers: &[SealedHeader],
        _check_freq: usize,
    ) -> Result<(), InsertionError> {
        for (index, window) in headers.windows(2).enumerate() {
            let (prev, next) = (&window[0], &window[1]);
            if next.number != prev.number + 1 || next.parent_hash != prev.hash() {
                return Err(InsertionError::new(
                    index + 1,
                    ChainError::NonContiguousInsert {
                        prev_index: index,
                        prev_number: prev.number,
                        prev_hash: prev.hash(),
                        index: index + 1,
                        number: next.number,
                        hash: next.hash(),
                        parent: next.parent_hash,
                    },
                ));
            }
        }
        for (index, header) in headers.iter().enumerate() {
            let parent = if index == 0 {
                self.header(header.parent_hash, header.number.saturating_sub(1))
            } else {
                Some(headers[index - 1].clone())
            };
            engine
                .verify_header(self, header, parent.as_ref())
                .map_err(|err| InsertionError::new(index, err))?;
        }
        Ok(())
    }

    /// Rewinds the header chain to `target`, invoking `update_fn` once per
    /// removed height with the new head header (its return value may lower
    /// the target further) and `del_fn` for every removed header so the
    /// caller can drop block data and truncate ancients in the same pass.
    pub fn set_head(
        &self,
        mut target: BlockNumber,
        mut update_fn: impl FnMut(&mut WriteBatch, &SealedHeader) -> (BlockNumber, bool),
        mut del_fn: impl FnMut(&mut WriteBatch, BlockHash, BlockNumber),
    ) -> Result<(), StoreError> {
        loop {
            let current = self.current_header().unwrap_or_else(|| self.genesis());
            if current.number <= target {
                break;
            }
            let number = current.number;
            let parent = self
                .header(current.parent_hash, number - 1)
                .unwrap_or_else(|| self.genesis());

            // move the markers down first so a crash mid-rewind keeps them
            // below any deleted data
            let mut batch = WriteBatch::new();
            schema::write_head_header_hash(&mut batch, parent.hash());
            let (new_target, force) = update_fn(&mut batch, &parent);
            if force && new_target < target {
                target = new_target;
            }
            self.db.write(batch)?;
            self.set_current(parent);

            // now remove everything stored at the removed height
            let mut batch = WriteBatch::new();
            for (num, hash) in schema::read_all_hashes_in_range(&self.db, number, number)? {
                del_fn(&mut batch, hash, num);
                schema::delete_header(&mut batch, num, hash);
                schema::delete_td(&mut batch, num, hash);
                self.header_cache.lock().remove(&hash);
                self.td_cache.lock().remove(&hash);
                self.number_cache.lock().remove(&hash);
            }
            schema::delete_canonical_hash(&mut batch, number);
            self.db.write(batch)?;

            if self.interrupt.load(Ordering::Relaxed) {
                warn!(number, target, "Header rewind interrupted");
                break;
            }
        }
        debug!(target, "Header chain rewound");
        Ok(())
    }
}

impl HeaderReader for HeaderChain {
    fn current_header(&self) -> Option<SealedHeader> {
        Some(self.current.load().as_ref().clone())
    }

    fn header(&self, hash: BlockHash, number: BlockNumber) -> Option<SealedHeader> {
        if let Some(header) = self.header_cache.lock().get(&hash) {
            return Some(header.clone());
        }
        let header = schema::read_header(&self.db, hash, number).ok().flatten()?;
        let sealed = header.seal(hash);
        self.header_cache.lock().insert(hash, sealed.clone());
        Some(sealed)
    }

    fn header_by_hash(&self, hash: BlockHash) -> Option<SealedHeader> {
        let number = self.block_number(hash)?;
        self.header(hash, number)
    }

    fn header_by_number(&self, number: BlockNumber) -> Option<SealedHeader> {
        let hash = self.canonical_hash(number)?;
        self.header(hash, number)
    }

    fn td(&self, hash: BlockHash, number: BlockNumber) -> Option<U256> {
        if let Some(td) = self.td_cache.lock().get(&hash) {
            return Some(*td);
        }
        let td = schema::read_td(&self.db, hash, number).ok().flatten()?;
        self.td_cache.lock().insert(hash, td);
        Some(td)
    }
}

impl HeaderChain {
    /// The block number a hash belongs to.
    pub fn block_number(&self, hash: BlockHash) -> Option<BlockNumber> {
        if let Some(number) = self.number_cache.lock().get(&hash) {
            return Some(*number);
        }
        let number = schema::read_header_number(&self.db, hash).ok().flatten()?;
        self.number_cache.lock().insert(hash, number);
        Some(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{genesis_block, make_chain, setup_genesis, BlockParams, TestEngine};
    use trellis_storage::MemoryStore;

    fn header_chain() -> (HeaderChain, Vec<SealedHeader>, ForkChoice) {
        let db = ChainDb::new(MemoryStore::new());
        let genesis = genesis_block();
        setup_genesis(&db, &genesis);
        let headers = make_chain(&genesis, 5, BlockParams::default())
            .into_iter()
            .map(|block| block.header.clone())
            .collect();
        let hc = HeaderChain::new(db, genesis.header.clone(), Arc::new(AtomicBool::new(false)))
            .unwrap();
        let fork_choice = ForkChoice::new(Arc::new(TestEngine::new()), None);
        (hc, headers, fork_choice)
    }

    #[test]
    fn insert_promotes_heavier_branch() {
        let (hc, headers, fork_choice) = header_chain();
        assert!(hc.insert(&headers, &fork_choice).unwrap());
        assert_eq!(hc.current_header().unwrap().hash(), headers[4].hash());
        assert_eq!(hc.canonical_hash(3), Some(headers[2].hash()));
        // total difficulty accumulates from genesis
        assert_eq!(hc.td(headers[4].hash(), 5), Some(U256::from(11u64)));
    }

    #[test]
    fn insert_without_parent_fails() {
        let (hc, headers, fork_choice) = header_chain();
        let orphans = vec![headers[3].clone()];
        assert!(hc.insert(&orphans, &fork_choice).is_err());
    }

    #[test]
    fn set_head_deletes_above_target() {
        let (hc, headers, fork_choice) = header_chain();
        hc.insert(&headers, &fork_choice).unwrap();

        hc.set_head(2, |_, _| (2, false), |_, _, _| {}).unwrap();
        assert_eq!(hc.current_header().unwrap().number, 2);
        assert_eq!(hc.canonical_hash(3), None);
        assert!(!hc.has_header(headers[4].hash(), 5));
        assert!(hc.has_header(headers[1].hash(), 2));
    }

    #[test]
    fn set_head_invokes_delete_callback() {
        let (hc, headers, fork_choice) = header_chain();
        hc.insert(&headers, &fork_choice).unwrap();

        let mut deleted = Vec::new();
        hc.set_head(3, |_, _| (3, false), |_, hash, num| deleted.push((num, hash))).unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(deleted.contains(&(5, headers[4].hash())));
    }

    #[test]
    fn validate_chain_flags_gaps() {
        let (hc, headers, _) = header_chain();
        let engine = TestEngine::new();
        let gapped = vec![headers[0].clone(), headers[2].clone()];
        let err = hc.validate_chain(&engine, &gapped, 1).unwrap_err();
        assert_eq!(err.index, 1);
    }
}
