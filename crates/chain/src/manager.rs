//! The chain manager: owns the canonical chain given a database with a
//! genesis block, and manages imports, rewinds and reorganisations.
//!
//! Importing blocks happens according to the two-stage [`Validator`]: bodies
//! are validated up front, execution runs through the [`Processor`], and the
//! resulting state is validated before anything is persisted. Failing either
//! stage aborts the import.
//!
//! The manager also returns blocks from *any* chain present in the database:
//! [`ChainManager::block_by_hash`] can return side-chain blocks, whereas
//! [`ChainManager::block_by_number`] always reads the canonical chain.

use crate::{
    caches::ChainCaches,
    config::{
        ChainConfig, DIFF_FREEZER_RECHECK_INTERVAL, DIFF_PRUNE_RECHECK_INTERVAL,
        FUTURE_BLOCK_INTERVAL, LARGE_REORG_DEPTH, MAX_BEYOND_BLOCKS, MAX_DIFF_FORK_DIST,
        MAX_TIME_FUTURE_BLOCKS, REWIND_BAD_BLOCK_INTERVAL, SIDE_CHAIN_BATCH_BLOCKS,
        SIDE_CHAIN_BATCH_MEMORY, STATS_REPORT_LIMIT,
    },
    diff_layer::{TrustedDiffQueue, UntrustedDiffs},
    engine::{ConsensusEngine, HeaderReader},
    error::{BlockError, ChainError, ChainResult, InsertionError},
    events::{
        BlockProcEvent, ChainBlockEvent, ChainEvent, ChainHeadEvent, ChainSideEvent, EventFeeds,
        FinalizedHeaderEvent, LogsEvent, RemovedLogsEvent,
    },
    fork_choice::{ForkChoice, PreservePredicate},
    header_chain::HeaderChain,
    indexer,
    iterator::InsertIterator,
    monitor::DoubleSignMonitor,
    snapshot::SnapshotTree,
    state::StateCache,
    sync::{ClosableLock, WaitGroup},
    traits::{ChainValidator, ProcessOutcome, Processor, Validator},
};
use alloy_rlp::{Decodable, Encodable};
use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashSet},
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error, info, warn};
use trellis_primitives::{
    Block, BlockHash, BlockNumber, Body, Bytes, DiffLayer, Log, Receipt, SealedBlock,
    SealedHeader, TxHash, VerifyResult, VerifyStatus, B256, EMPTY_TX_ROOT, U256,
};
use trellis_storage::{schema, AncientBlock, ChainDb, WriteBatch, IDEAL_BATCH_SIZE};

/// Result of one insertion call: the number of blocks consumed, or the index
/// of the first failing block along with the failure.
pub type InsertResult = Result<usize, InsertionError>;

/// Copies the iterator cursor out so the cursor can be reassigned while the
/// copy is in use. The block reference points into the input batch, not into
/// the cursor.
fn peek<'a>(
    cursor: &Option<(&'a SealedBlock, Result<(), BlockError>)>,
) -> Option<(&'a SealedBlock, Result<(), BlockError>)> {
    cursor.as_ref().map(|(block, verdict)| (*block, verdict.clone()))
}

/// Canonical status assigned to a written block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteStatus {
    Canon,
    Side,
}

/// Trie garbage-collection state, guarded by the commit lock.
#[derive(Debug, Default)]
struct TrieGc {
    /// Roots pending dereference, lowest block number first.
    queue: BinaryHeap<Reverse<(BlockNumber, B256)>>,
    /// Accumulated canonical processing time since the last forced flush.
    gc_proc: Duration,
    /// Height of the last forced flush.
    last_write: BlockNumber,
}

/// Running counters for one insertion batch.
#[derive(Debug, Default)]
struct InsertStats {
    processed: usize,
    ignored: usize,
    queued: usize,
    gas_used: u64,
}

/// The canonical-chain manager.
///
/// All chain mutations serialize on the closable writer lock; readers go
/// straight to the database and the atomically swapped head markers.
pub struct ChainManager {
    config: ChainConfig,
    db: ChainDb,
    state: Arc<StateCache>,
    snaps: OnceLock<Arc<SnapshotTree>>,
    hc: Arc<HeaderChain>,
    engine: Arc<dyn ConsensusEngine>,
    validator: Arc<dyn Validator>,
    processor: Arc<dyn Processor>,
    fork_choice: ForkChoice,
    genesis: ArcSwap<SealedBlock>,
    feeds: EventFeeds,
    caches: ChainCaches,

    /// The single writer lock over chain mutations.
    chainmu: ClosableLock,
    /// Serializes state commits against background flushes.
    trie_gc: Mutex<TrieGc>,

    current_block: ArcSwap<SealedBlock>,
    current_fast_block: ArcSwap<SealedBlock>,
    highest_verified: ArcSwapOption<SealedHeader>,

    trusted_diffs: TrustedDiffQueue,
    diff_tx: Sender<DiffLayer>,
    untrusted_diffs: UntrustedDiffs,

    monitor: Option<Arc<DoubleSignMonitor>>,
    indexer_head_tx: Mutex<Option<Sender<BlockNumber>>>,
    monitor_head_tx: Mutex<Option<Sender<SealedHeader>>>,

    quit: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    ops: WaitGroup,
    stopped: AtomicBool,
    interrupt: Arc<AtomicBool>,
}

impl std::fmt::Debug for ChainManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainManager")
            .field("head", &self.current_block().num_hash())
            .field("genesis", &self.genesis_block().hash())
            .finish_non_exhaustive()
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|delta| delta.as_secs()).unwrap_or_default()
}

// ---------------------------------------------------------------- lifecycle

impl ChainManager {
    /// Opens the chain over a database that already contains a genesis
    /// block, restores the head markers, repairs any inconsistency between
    /// the live and ancient stores, and starts the background workers.
    pub fn new(
        db: ChainDb,
        config: ChainConfig,
        engine: Arc<dyn ConsensusEngine>,
        processor: Arc<dyn Processor>,
        should_preserve: Option<Box<PreservePredicate>>,
    ) -> ChainResult<Arc<Self>> {
        schema::ensure_database_version(&db)?;
        if config.cache.tries_in_memory != 128 {
            warn!(
                tries_in_memory = config.cache.tries_in_memory,
                "Non-default retention window; prune runs must use the same value"
            );
        }

        let genesis_hash =
            schema::read_canonical_hash(&db, 0)?.ok_or(ChainError::NoGenesis)?;
        let genesis = read_block(&db, genesis_hash, 0)?.ok_or(ChainError::NoGenesis)?;

        let interrupt = Arc::new(AtomicBool::new(false));
        let hc =
            Arc::new(HeaderChain::new(db.clone(), genesis.header.clone(), Arc::clone(&interrupt))?);
        let state = Arc::new(StateCache::new(
            db.clone(),
            config.cache.trie_clean_limit,
            config.cache.no_tries,
        ));
        if let Some(journal) = &config.cache.trie_clean_journal {
            state.load_cache(journal);
        }
        let validator: Arc<dyn Validator> =
            Arc::new(ChainValidator::new(db.clone(), Arc::clone(&state)));
        let fork_choice = ForkChoice::new(Arc::clone(&engine), should_preserve);

        let (diff_tx, diff_rx) = unbounded();
        let (quit_tx, quit_rx) = bounded::<()>(1);
        let genesis = Arc::new(genesis);

        let manager = Arc::new(Self {
            monitor: config.double_sign_monitor.then(|| Arc::new(DoubleSignMonitor::new())),
            config,
            db,
            state,
            snaps: OnceLock::new(),
            hc,
            engine,
            validator,
            processor,
            fork_choice,
            genesis: ArcSwap::new(Arc::clone(&genesis)),
            feeds: EventFeeds::new(),
            caches: ChainCaches::new(),
            chainmu: ClosableLock::new(),
            trie_gc: Mutex::new(TrieGc::default()),
            current_block: ArcSwap::new(Arc::clone(&genesis)),
            current_fast_block: ArcSwap::new(genesis),
            highest_verified: ArcSwapOption::empty(),
            trusted_diffs: TrustedDiffQueue::default(),
            diff_tx,
            untrusted_diffs: UntrustedDiffs::default(),
            indexer_head_tx: Mutex::new(None),
            monitor_head_tx: Mutex::new(None),
            quit: Mutex::new(Some(quit_tx)),
            workers: Mutex::new(Vec::new()),
            ops: WaitGroup::new(),
            stopped: AtomicBool::new(false),
            interrupt,
        });

        // plug a pre-populated ancient segment into a fresh node
        let mut tx_index_block = 0;
        if manager.is_empty_chain()? {
            schema::init_from_ancient(&manager.db)?;
            let frozen = manager.db.ancients();
            if frozen > 0 {
                tx_index_block = frozen;
            }
        }
        manager.load_last_state()?;

        // make sure the head state is actually resolvable
        let head = manager.current_block();
        if !manager.state.has_state(head.root) {
            let disk_root = if manager.config.cache.snapshot_limit > 0 {
                schema::read_snapshot_root(&manager.db)?
            } else {
                None
            };
            match disk_root {
                Some(root) => {
                    warn!(number = head.number(), hash = %head.hash(), snap_root = %root,
                        "Head state missing, repairing");
                    let snap_disk =
                        manager.set_head_beyond_root(head.number(), Some(root), true)?;
                    if snap_disk != 0 {
                        schema::write_snapshot_recovery_number(&manager.db, snap_disk)?;
                    }
                }
                None => {
                    warn!(number = head.number(), hash = %head.hash(), "Head state missing, repairing");
                    manager.set_head_beyond_root(head.number(), None, true)?;
                }
            }
        }

        // a previous crash in set_head may have left extra ancients behind
        let frozen = manager.db.ancients();
        if frozen > 0 {
            let mut need_rewind = false;
            let mut low = 0;
            let full = manager.current_block();
            if full.hash() != manager.genesis_block().hash() && full.number() < frozen - 1 {
                need_rewind = true;
                low = full.number();
            }
            let fast = manager.current_fast_block();
            if fast.number() < frozen - 1 && (fast.number() < low || low == 0) {
                need_rewind = true;
                low = fast.number();
            }
            if need_rewind {
                error!(
                    from = manager.current_header_inner().number,
                    to = low,
                    "Truncating ancient chain"
                );
                manager.set_head(low)?;
            }
        }

        // never keep a banned hash canonical
        for hash in manager.config.bad_hashes.clone() {
            let Some(header) = manager.hc.header_by_hash(hash) else { continue };
            let canonical = manager.hc.canonical_hash(header.number);
            if canonical == Some(header.hash()) {
                error!(number = header.number, hash = %header.parent_hash,
                    "Found bad hash, rewinding chain");
                manager.set_head(header.number.saturating_sub(1))?;
                error!("Chain rewind was successful, resuming normal operation");
            }
        }

        if manager.config.cache.snapshot_limit > 0 && !manager.config.cache.no_tries {
            let head = manager.current_block();
            let recovery = schema::read_snapshot_recovery_number(&manager.db)?
                .is_some_and(|layer| layer > head.number());
            if recovery {
                warn!(head = head.number(), "Enabling snapshot recovery");
            }
            let snaps = SnapshotTree::new(
                manager.db.clone(),
                manager.config.cache.tries_in_memory as usize,
                head.root,
                recovery,
            )?;
            let _ = manager.snaps.set(Arc::new(snaps));
        }

        schema::write_safe_point_number(&manager.db, manager.current_block().number())?;

        Self::spawn_workers(&manager, quit_rx, diff_rx, tx_index_block);
        Ok(manager)
    }

    fn spawn_workers(
        manager: &Arc<Self>,
        quit: Receiver<()>,
        diff_rx: Receiver<DiffLayer>,
        tx_index_block: u64,
    ) {
        let mut workers = manager.workers.lock();

        // future-block promoter
        workers.push(spawn_worker("chain-future", {
            let chain = Arc::clone(manager);
            let quit = quit.clone();
            move || {
                let ticker = tick(FUTURE_BLOCK_INTERVAL);
                loop {
                    select! {
                        recv(ticker) -> _ => chain.proc_future_blocks(),
                        recv(quit) -> _ => return,
                    }
                }
            }
        }));

        // trusted diff-layer persister
        if manager.db.diff_store().is_some() {
            workers.push(spawn_worker("chain-diff-persist", {
                let chain = Arc::clone(manager);
                let quit = quit.clone();
                move || {
                    let ticker = tick(DIFF_FREEZER_RECHECK_INTERVAL);
                    loop {
                        select! {
                            recv(diff_rx) -> diff => {
                                if let Ok(diff) = diff {
                                    chain.trusted_diffs.push(diff);
                                }
                            }
                            recv(ticker) -> _ => chain.persist_trusted_diffs(),
                            recv(quit) -> _ => {
                                // redundant storage beats losing the cached
                                // layers on shutdown
                                chain.flush_trusted_diffs();
                                return;
                            }
                        }
                    }
                }
            }));
        }

        // untrusted diff-layer pruner
        workers.push(spawn_worker("chain-diff-prune", {
            let chain = Arc::clone(manager);
            let quit = quit.clone();
            move || {
                let ticker = tick(DIFF_PRUNE_RECHECK_INTERVAL);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            chain.untrusted_diffs.prune(chain.current_block().number());
                        }
                        recv(quit) -> _ => return,
                    }
                }
            }
        }));

        // transaction-index maintainer
        if let Some(limit) = manager.config.tx_lookup_limit {
            let (head_tx, head_rx) = bounded(1);
            *manager.indexer_head_tx.lock() = Some(head_tx);
            workers.push(spawn_worker("chain-tx-index", {
                let db = manager.db.clone();
                let interrupt = Arc::clone(&manager.interrupt);
                let quit = quit.clone();
                move || indexer::maintain_tx_index(db, limit, tx_index_block, interrupt, head_rx, quit)
            }));
        }

        // clean-cache rejournaling
        if let (Some(journal), Some(period)) =
            (manager.config.cache.trie_clean_journal.clone(), manager.config.cache.sanitized_rejournal())
        {
            if Some(period) != manager.config.cache.trie_clean_rejournal {
                warn!(?period, "Sanitizing invalid trie cache journal time");
            }
            workers.push(spawn_worker("chain-rejournal", {
                let state = Arc::clone(&manager.state);
                let quit = quit.clone();
                move || {
                    let ticker = tick(period);
                    loop {
                        select! {
                            recv(ticker) -> _ => state.save_cache(&journal),
                            recv(quit) -> _ => return,
                        }
                    }
                }
            }));
        }

        // pipelined-commit safety net: rewind heads that failed verification
        if manager.config.pipe_commit {
            workers.push(spawn_worker("chain-bad-rewind", {
                let chain = Arc::clone(manager);
                let quit = quit.clone();
                move || {
                    let ticker = tick(REWIND_BAD_BLOCK_INTERVAL);
                    loop {
                        select! {
                            recv(ticker) -> _ => chain.try_rewind_bad_blocks(),
                            recv(quit) -> _ => return,
                        }
                    }
                }
            }));
        }

        // double-sign monitor
        if let Some(monitor) = manager.monitor.clone() {
            let (head_tx, head_rx) = bounded::<SealedHeader>(64);
            *manager.monitor_head_tx.lock() = Some(head_tx);
            workers.push(spawn_worker("chain-monitor", move || loop {
                select! {
                    recv(head_rx) -> header => {
                        let Ok(header) = header else { return };
                        monitor.verify(&header);
                    }
                    recv(quit) -> _ => return,
                }
            }));
        }
    }

    /// Stops the chain manager: rejects new writers, drains in-flight ones,
    /// joins all background workers and journals recent state to disk.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // signal shutdown, then drain writers
        *self.quit.lock() = None;
        *self.indexer_head_tx.lock() = None;
        *self.monitor_head_tx.lock() = None;
        self.stop_insert();
        self.chainmu.close();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
        self.ops.wait();

        // journal the snapshot tree
        let mut snap_base = None;
        if let Some(snaps) = self.snaps() {
            match snaps.journal(self.current_block().root) {
                Ok(base) => snap_base = Some(base),
                Err(err) => error!(%err, "Failed to journal state snapshot"),
            }
        }

        // persist the states different restart scenarios will need:
        // HEAD so nothing is reprocessed, HEAD-1 in case the head becomes an
        // uncle, and the edge of the retention window as a hard bound on
        // re-execution
        if !self.config.cache.trie_dirty_disabled {
            let tries_in_memory = self.config.cache.tries_in_memory;
            for offset in [0, 1, tries_in_memory.saturating_sub(1)] {
                let number = self.current_block().number();
                if number > offset {
                    let Some(recent) = self.block_by_number(number - offset) else { continue };
                    info!(block = recent.number(), hash = %recent.hash(), root = %recent.root,
                        "Writing cached state to disk");
                    match self.state.commit(recent.root) {
                        Ok(()) => {
                            if let Err(err) =
                                schema::write_safe_point_number(&self.db, recent.number())
                            {
                                error!(%err, "Failed to update safe point");
                            }
                        }
                        Err(err) => error!(%err, "Failed to commit recent state"),
                    }
                }
            }
            if let Some(base) = snap_base {
                info!(root = %base, "Writing snapshot state to disk");
                if let Err(err) = self.state.commit(base) {
                    error!(%err, "Failed to commit snapshot base state");
                }
            }
            let mut gc = self.trie_gc.lock();
            while let Some(Reverse((_, root))) = gc.queue.pop() {
                self.state.dereference(root);
            }
            drop(gc);
            if self.state.dirty_size() != 0 {
                error!("Dangling trie nodes after full cleanup");
            }
        }
        if let Some(journal) = &self.config.cache.trie_clean_journal {
            self.state.save_cache(journal);
        }
        info!("Blockchain stopped");
    }

    /// Permanently interrupts all insertion methods; they return as soon as
    /// possible.
    pub fn stop_insert(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Whether insertion has been interrupted.
    pub fn insert_stopped(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    fn is_empty_chain(&self) -> ChainResult<bool> {
        let genesis = self.genesis_block().hash();
        Ok([
            schema::read_head_block_hash(&self.db)?,
            schema::read_head_header_hash(&self.db)?,
            schema::read_head_fast_block_hash(&self.db)?,
        ]
        .iter()
        .all(|marker| *marker == Some(genesis)))
    }

    /// Restores the last known chain state from the database.
    fn load_last_state(&self) -> ChainResult<()> {
        let Some(head) = schema::read_head_block_hash(&self.db)? else {
            warn!("Empty database, resetting chain");
            return self.reset();
        };
        let Some(current) = self.block_by_hash(head) else {
            warn!(hash = %head, "Head block missing, resetting chain");
            return self.reset();
        };
        self.current_block.store(Arc::clone(&current));
        self.update_head_gauges(&current);

        let mut current_header = current.header.clone();
        if let Some(head) = schema::read_head_header_hash(&self.db)? {
            if let Some(header) = self.hc.header_by_hash(head) {
                current_header = header;
            }
        }
        self.hc.set_current(current_header.clone());

        self.current_fast_block.store(Arc::clone(&current));
        if let Some(head) = schema::read_head_fast_block_hash(&self.db)? {
            if let Some(block) = self.block_by_hash(head) {
                self.current_fast_block.store(Arc::clone(&block));
                gauge!("chain.head.receipt").set(block.number() as f64);
            }
        }

        let header_td = self.hc.td(current_header.hash(), current_header.number);
        let block_td = self.hc.td(current.hash(), current.number());
        info!(number = current_header.number, hash = %current_header.hash(),
            td = ?header_td, "Loaded most recent local header");
        info!(number = current.number(), hash = %current.hash(), td = ?block_td,
            "Loaded most recent local full block");
        if let Some(pivot) = schema::read_last_pivot_number(&self.db)? {
            info!(number = pivot, "Loaded last fast-sync pivot marker");
        }
        Ok(())
    }
}

// ------------------------------------------------------------------ readers

impl ChainManager {
    /// The current canonical head block.
    pub fn current_block(&self) -> Arc<SealedBlock> {
        self.current_block.load_full()
    }

    /// The head of the receipt (fast-sync) chain; may be above the block
    /// chain head.
    pub fn current_fast_block(&self) -> Arc<SealedBlock> {
        self.current_fast_block.load_full()
    }

    fn current_header_inner(&self) -> SealedHeader {
        self.hc.current_header().unwrap_or_else(|| self.genesis_block().header.clone())
    }

    /// The current header of the header chain; may be above the block head.
    pub fn current_header(&self) -> SealedHeader {
        self.current_header_inner()
    }

    /// The genesis block.
    pub fn genesis_block(&self) -> Arc<SealedBlock> {
        self.genesis.load_full()
    }

    /// The header chain.
    pub fn header_chain(&self) -> &Arc<HeaderChain> {
        &self.hc
    }

    /// The snapshot tree, when snapshots are enabled.
    pub fn snaps(&self) -> Option<&Arc<SnapshotTree>> {
        self.snaps.get()
    }

    /// The state facade.
    pub fn state(&self) -> &Arc<StateCache> {
        &self.state
    }

    /// The header with the highest total difficulty seen by the verifier.
    pub fn highest_verified_header(&self) -> Option<SealedHeader> {
        self.highest_verified.load_full().map(|header| header.as_ref().clone())
    }

    /// The configured retention window for unflushed state roots.
    pub fn tries_in_memory(&self) -> u64 {
        self.config.cache.tries_in_memory
    }

    /// The block with the given hash and number, from any chain.
    pub fn block(&self, hash: BlockHash, number: BlockNumber) -> Option<Arc<SealedBlock>> {
        if let Some(block) = self.caches.block(hash) {
            return Some(block);
        }
        let block = read_block(&self.db, hash, number).ok().flatten()?;
        let block = Arc::new(block);
        self.caches.insert_block(Arc::clone(&block));
        Some(block)
    }

    /// The block with the given hash, from any chain.
    pub fn block_by_hash(&self, hash: BlockHash) -> Option<Arc<SealedBlock>> {
        let number = self.hc.block_number(hash)?;
        self.block(hash, number)
    }

    /// The canonical block at the given height.
    pub fn block_by_number(&self, number: BlockNumber) -> Option<Arc<SealedBlock>> {
        let hash = self.hc.canonical_hash(number)?;
        self.block(hash, number)
    }

    /// The canonical hash at the given height.
    pub fn canonical_hash(&self, number: BlockNumber) -> Option<BlockHash> {
        self.hc.canonical_hash(number)
    }

    /// Whether the block body is present.
    pub fn has_block(&self, hash: BlockHash, number: BlockNumber) -> bool {
        if self.caches.block(hash).is_some() {
            return true;
        }
        matches!(schema::read_body(&self.db, hash, number), Ok(Some(_)))
    }

    /// Whether the state for the given root is resolvable.
    pub fn has_state(&self, root: B256) -> bool {
        self.state.has_state(root)
    }

    /// Whether both the block and its post-state are present.
    pub fn has_block_and_state(&self, hash: BlockHash, number: BlockNumber) -> bool {
        match self.block(hash, number) {
            Some(block) => self.has_state(block.root),
            None => false,
        }
    }

    /// The body of the block with the given hash.
    pub fn body(&self, hash: BlockHash) -> Option<Body> {
        if let Some(body) = self.caches.body(hash) {
            return Some(body);
        }
        let number = self.hc.block_number(hash)?;
        let body = schema::read_body(&self.db, hash, number).ok().flatten()?;
        self.caches.insert_body(hash, body.clone());
        Some(body)
    }

    /// The RLP-encoded body of the block with the given hash.
    pub fn body_encoded(&self, hash: BlockHash) -> Option<Bytes> {
        if let Some(encoded) = self.caches.body_encoded(hash) {
            return Some(encoded);
        }
        let body = self.body(hash)?;
        let encoded: Bytes = alloy_rlp::encode(&body).into();
        self.caches.insert_body_encoded(hash, encoded.clone());
        Some(encoded)
    }

    /// The receipts of the block with the given hash, with derived fields.
    pub fn receipts_by_hash(&self, hash: BlockHash) -> Option<Vec<Receipt>> {
        if let Some(receipts) = self.caches.receipts(hash) {
            return Some(receipts);
        }
        let number = self.hc.block_number(hash)?;
        let receipts = schema::read_receipts(&self.db, hash, number).ok().flatten()?;
        self.caches.insert_receipts(hash, receipts.clone());
        Some(receipts)
    }

    /// The inclusion block number of a transaction, if indexed.
    pub fn tx_lookup(&self, hash: TxHash) -> Option<BlockNumber> {
        if let Some(number) = self.caches.tx_lookup(hash) {
            return Some(number);
        }
        let number = schema::read_tx_lookup(&self.db, hash).ok().flatten()?;
        self.caches.insert_tx_lookup(hash, number);
        Some(number)
    }

    /// The total difficulty of the block with the given hash and number.
    pub fn td(&self, hash: BlockHash, number: BlockNumber) -> Option<U256> {
        self.hc.td(hash, number)
    }

    fn justified_number(&self, header: &SealedHeader) -> BlockNumber {
        self.engine
            .posa()
            .and_then(|posa| posa.justified_number_and_hash(&*self.hc, header))
            .map(|(number, _)| number)
            .unwrap_or(0)
    }

    fn finalized_number(&self, header: &SealedHeader) -> BlockNumber {
        self.engine
            .posa()
            .and_then(|posa| posa.finalized_header(&*self.hc, header))
            .map(|header| header.number)
            .unwrap_or(0)
    }

    fn update_head_gauges(&self, block: &SealedBlock) {
        gauge!("chain.head.block").set(block.number() as f64);
        gauge!("chain.head.justified").set(self.justified_number(&block.header) as f64);
        gauge!("chain.head.finalized").set(self.finalized_number(&block.header) as f64);
    }
}

// ------------------------------------------------------------ subscriptions

impl ChainManager {
    /// Subscribes to canonical block events.
    pub fn subscribe_chain(&self) -> tokio::sync::broadcast::Receiver<ChainEvent> {
        self.feeds.subscribe_chain()
    }

    /// Subscribes to head events.
    pub fn subscribe_chain_head(&self) -> tokio::sync::broadcast::Receiver<ChainHeadEvent> {
        self.feeds.subscribe_chain_head()
    }

    /// Subscribes to per-block processing events.
    pub fn subscribe_chain_block(&self) -> tokio::sync::broadcast::Receiver<ChainBlockEvent> {
        self.feeds.subscribe_chain_block()
    }

    /// Subscribes to side-chain events.
    pub fn subscribe_chain_side(&self) -> tokio::sync::broadcast::Receiver<ChainSideEvent> {
        self.feeds.subscribe_chain_side()
    }

    /// Subscribes to removed-log events.
    pub fn subscribe_removed_logs(&self) -> tokio::sync::broadcast::Receiver<RemovedLogsEvent> {
        self.feeds.subscribe_removed_logs()
    }

    /// Subscribes to live log events.
    pub fn subscribe_logs(&self) -> tokio::sync::broadcast::Receiver<LogsEvent> {
        self.feeds.subscribe_logs()
    }

    /// Subscribes to block-processing activity events.
    pub fn subscribe_block_proc(&self) -> tokio::sync::broadcast::Receiver<BlockProcEvent> {
        self.feeds.subscribe_block_proc()
    }

    /// Subscribes to finalized-header events.
    pub fn subscribe_finalized_header(
        &self,
    ) -> tokio::sync::broadcast::Receiver<FinalizedHeaderEvent> {
        self.feeds.subscribe_finalized_header()
    }

    /// Publishes the accumulated head event plus the finality follow-ups.
    fn emit_chain_head(&self, block: &Arc<SealedBlock>) {
        self.feeds.send_chain_head(ChainHeadEvent { block: Arc::clone(block) });
        if let Some(tx) = &*self.indexer_head_tx.lock() {
            let _ = tx.try_send(block.number());
        }
        if let Some(tx) = &*self.monitor_head_tx.lock() {
            let _ = tx.try_send(block.header.clone());
        }
        if let Some(posa) = self.engine.posa() {
            if let Some(header) = posa.finalized_header(&*self.hc, &block.header) {
                self.feeds.send_finalized_header(FinalizedHeaderEvent { header });
            }
        }
    }
}

// -------------------------------------------------------------- head writes

impl ChainManager {
    /// Writes a block as the new head of the canonical chain, resetting the
    /// head header and fast block to it. Assumes the writer lock is held and
    /// the block is a true head.
    fn write_head_block(&self, block: &Arc<SealedBlock>) {
        let mut batch = WriteBatch::new();
        schema::write_head_header_hash(&mut batch, block.hash());
        schema::write_head_fast_block_hash(&mut batch, block.hash());
        schema::write_canonical_hash(&mut batch, block.number(), block.hash());
        schema::write_tx_lookups(&mut batch, block);
        schema::write_head_block_hash(&mut batch, block.hash());
        self.write_fatal(batch);

        // swap the in-memory markers only after the batch is durable
        self.hc.set_current(block.header.clone());
        self.current_fast_block.store(Arc::clone(block));
        gauge!("chain.head.receipt").set(block.number() as f64);
        self.current_block.store(Arc::clone(block));
        self.update_head_gauges(block);
    }

    /// Applies a batch, terminating the process on failure: a partial chain
    /// write cannot be recovered from.
    fn write_fatal(&self, batch: WriteBatch) {
        if let Err(err) = self.db.write(batch) {
            error!(%err, "Failed to write chain data");
            panic!("chain database corrupted: {err}");
        }
    }

    /// Promotes a block that is already fully stored, reorganizing if it
    /// does not extend the current head.
    fn write_known_block(&self, block: &Arc<SealedBlock>) -> ChainResult<()> {
        let current = self.current_block();
        if block.parent_hash() != current.hash() {
            self.reorg(current, Arc::clone(block))?;
        }
        self.write_head_block(block);
        Ok(())
    }

    /// Writes block data and metadata without any state, used to grow side
    /// forks until they outweigh the canonical chain.
    fn write_block_without_state(&self, block: &SealedBlock, td: U256) -> ChainResult<()> {
        if self.insert_stopped() {
            return Err(ChainError::InsertionInterrupted);
        }
        let mut batch = WriteBatch::new();
        schema::write_td(&mut batch, block.number(), block.hash(), td);
        schema::write_block(&mut batch, block);
        self.write_fatal(batch);
        Ok(())
    }

    /// Writes the block, its receipts and its state, then runs trie garbage
    /// collection under the commit lock.
    fn write_block_with_state(
        &self,
        block: &Arc<SealedBlock>,
        outcome: &mut ProcessOutcome,
    ) -> ChainResult<()> {
        let ptd = self
            .td(block.parent_hash(), block.number().saturating_sub(1))
            .ok_or(BlockError::UnknownAncestor)?;
        let extern_td = ptd + block.difficulty;

        // every component of the block is written in one atomic batch
        let mut batch = WriteBatch::new();
        schema::write_td(&mut batch, block.number(), block.hash(), extern_td);
        schema::write_block(&mut batch, block);
        schema::write_receipts(&mut batch, block.number(), block.hash(), &outcome.receipts);
        if self.config.cache.preimages {
            schema::write_preimages(&mut batch, &outcome.preimages);
        }
        self.write_fatal(batch);

        let state_blob: Bytes = outcome
            .diff
            .as_ref()
            .map(|diff| diff.encode())
            .unwrap_or_else(|| Bytes::copy_from_slice(block.root.as_slice()));
        self.state.insert_dirty(block.root, state_blob);
        self.commit_trie(block)?;

        if let Some(snaps) = self.snaps() {
            snaps.update(block.root, !self.config.pipe_commit, true);
        }

        // hand the state delta to the diff machinery
        if block.tx_root != EMPTY_TX_ROOT {
            if let Some(mut diff) = outcome.diff.take() {
                diff.block_hash = block.hash();
                diff.number = block.number();
                diff.receipts = outcome.receipts.clone();
                self.cache_diff_layer(diff);
            }
        }
        Ok(())
    }

    /// Reference-counts the fresh root and flushes or garbage-collects
    /// matured ones. Serialized by the commit lock so background flushes do
    /// not interleave with head writes.
    fn commit_trie(&self, block: &Arc<SealedBlock>) -> ChainResult<()> {
        let mut gc = self.trie_gc.lock();

        if self.config.cache.trie_dirty_disabled {
            // archive mode: flush every root
            self.state.commit(block.root)?;
            return Ok(());
        }
        self.state.reference(block.root);
        gc.queue.push(Reverse((block.number(), block.root)));

        let tries_in_memory = self.config.cache.tries_in_memory;
        let current = block.number();
        if current <= tries_in_memory {
            return Ok(());
        }
        // cap dirty memory to the configured allowance
        let limit = self.config.cache.trie_dirty_limit * 1024 * 1024;
        if self.state.dirty_size() > limit {
            self.state.cap(limit.saturating_sub(IDEAL_BATCH_SIZE))?;
        }
        let chosen = current - tries_in_memory;

        if gc.gc_proc > self.config.cache.trie_time_limit {
            let can_write = match self.engine.posa() {
                Some(posa) => posa.enough_distance(&*self.hc, &block.header),
                None => true,
            };
            if can_write {
                match self.hc.header_by_number(chosen) {
                    // a low-difficulty side chain is being reorged in;
                    // postpone committing until it lands
                    None => warn!(number = chosen, "Reorg in progress, trie commit postponed"),
                    Some(header) => {
                        if chosen < gc.last_write + tries_in_memory
                            && gc.gc_proc >= self.config.cache.trie_time_limit * 2
                        {
                            info!(
                                time = ?gc.gc_proc,
                                allowance = ?self.config.cache.trie_time_limit,
                                "State in memory for too long, committing"
                            );
                        }
                        self.state.commit(header.root)?;
                        schema::write_safe_point_number(&self.db, chosen)?;
                        gc.last_write = chosen;
                        gc.gc_proc = Duration::ZERO;
                    }
                }
            }
        }
        // drop everything below the retention window
        while let Some(Reverse((number, root))) = gc.queue.peek().copied() {
            if number > chosen {
                break;
            }
            gc.queue.pop();
            self.state.dereference(root);
        }
        Ok(())
    }

    /// Writes the block and sets it as the chain head, reorganizing first
    /// when it does not extend the current head.
    pub fn write_block_and_set_head(
        &self,
        block: SealedBlock,
        mut outcome: ProcessOutcome,
        emit_head_event: bool,
    ) -> ChainResult<()> {
        let _ops = self.ops.enter();
        let Some(_guard) = self.chainmu.lock() else { return Err(ChainError::ChainStopped) };
        let block = Arc::new(block);
        self.write_block_and_set_head_inner(&block, &mut outcome, emit_head_event)?;
        Ok(())
    }

    fn write_block_and_set_head_inner(
        &self,
        block: &Arc<SealedBlock>,
        outcome: &mut ProcessOutcome,
        emit_head_event: bool,
    ) -> ChainResult<WriteStatus> {
        let logs = outcome.logs.clone();
        self.write_block_with_state(block, outcome)?;

        let current = self.current_block();
        let reorg = self.fork_choice.reorg_needed_with_fast_finality(
            &*self.hc,
            &current.header,
            &block.header,
        )?;
        let status = if reorg {
            if block.parent_hash() != current.hash() {
                self.reorg(current, Arc::clone(block))?;
            }
            WriteStatus::Canon
        } else {
            WriteStatus::Side
        };

        if status == WriteStatus::Canon {
            self.write_head_block(block);
        }
        self.caches.remove_future_block(block.hash());

        match status {
            WriteStatus::Canon => {
                self.feeds.send_chain(ChainEvent {
                    block: Arc::clone(block),
                    hash: block.hash(),
                    logs: logs.clone(),
                });
                if !logs.is_empty() {
                    self.feeds.send_logs(LogsEvent { logs });
                }
                // a batch import fires one accumulated head event at the
                // end instead of one per block
                if emit_head_event {
                    self.emit_chain_head(block);
                }
            }
            WriteStatus::Side => {
                self.feeds.send_chain_side(ChainSideEvent { block: Arc::clone(block) })
            }
        }
        Ok(status)
    }
}

// ---------------------------------------------------------------- insertion

impl ChainManager {
    /// Inserts a contiguous batch of blocks into the canonical chain, or
    /// creates a fork. Returns the number of blocks processed, or the index
    /// of the first failing block and the error.
    pub fn insert_chain(&self, blocks: Vec<SealedBlock>) -> InsertResult {
        if blocks.is_empty() {
            return Ok(0);
        }
        self.feeds.send_block_proc(BlockProcEvent { active: true });
        let result = self.insert_chain_guarded(&blocks);
        self.feeds.send_block_proc(BlockProcEvent { active: false });
        result
    }

    fn insert_chain_guarded(&self, blocks: &[SealedBlock]) -> InsertResult {
        for index in 1..blocks.len() {
            let (block, prev) = (&blocks[index], &blocks[index - 1]);
            if block.number() != prev.number() + 1 || block.parent_hash() != prev.hash() {
                error!(
                    number = block.number(),
                    hash = %block.hash(),
                    parent = %block.parent_hash(),
                    prev_number = prev.number(),
                    prev_hash = %prev.hash(),
                    "Non contiguous block insert"
                );
                return Err(InsertionError::new(
                    0,
                    ChainError::NonContiguousInsert {
                        prev_index: index - 1,
                        prev_number: prev.number(),
                        prev_hash: prev.hash(),
                        index,
                        number: block.number(),
                        hash: block.hash(),
                        parent: block.parent_hash(),
                    },
                ));
            }
        }
        let _ops = self.ops.enter();
        let Some(_guard) = self.chainmu.lock() else {
            return Err(InsertionError::new(0, ChainError::ChainStopped));
        };
        self.insert_chain_inner(blocks, true)
    }

    /// Inner insertion: assumes contiguity has been checked and the writer
    /// lock is held. Re-imports of historical blocks (side-chain recovery)
    /// re-enter through here without releasing the lock so the recovered
    /// state cannot be pruned mid-operation.
    fn insert_chain_inner(&self, blocks: &[SealedBlock], set_head: bool) -> InsertResult {
        if self.insert_stopped() {
            return Ok(0);
        }
        let mut last_canon: Option<Arc<SealedBlock>> = None;
        let result = self.insert_chain_core(blocks, set_head, &mut last_canon);
        // one accumulated head event per batch
        if let Some(block) = last_canon {
            if self.current_block().hash() == block.hash() {
                self.emit_chain_head(&block);
            }
        }
        result
    }

    fn insert_chain_core(
        &self,
        blocks: &[SealedBlock],
        set_head: bool,
        last_canon: &mut Option<Arc<SealedBlock>>,
    ) -> InsertResult {
        let mut stats = InsertStats::default();
        let start = Instant::now();
        let mut last_report = Instant::now();

        let results = self.start_header_verifier(blocks);
        let validator = Arc::clone(&self.validator);
        let mut it = InsertIterator::new(blocks, results, &*validator);
        let mut cursor = it.next();

        // Left-trim known blocks that do not need their snapshot rebuilt.
        // The first block (and state) being known means either a rollback
        // happened and this is a re-import, or a side chain is lying about a
        // canonical state root it never verified.
        let first_skippable = peek(&cursor)
            .is_some_and(|(block, verdict)| self.skip_block(&verdict, block, it.previous()));
        if first_skippable {
            let current = self.current_block();
            while let Some((block, verdict)) = peek(&cursor) {
                if !self.skip_block(&verdict, block, it.previous()) {
                    break;
                }
                let reorg = self
                    .fork_choice
                    .reorg_needed_with_fast_finality(&*self.hc, &current.header, &block.header)
                    .map_err(|err| InsertionError::new(it.index(), err))?;
                if reorg {
                    // the forker wants this branch, stop trimming unless the
                    // block is already canonical behind the head
                    if block.number() > current.number()
                        || self.hc.canonical_hash(block.number()) != Some(block.hash())
                    {
                        break;
                    }
                }
                debug!(number = block.number(), hash = %block.hash(),
                    "Ignoring already known block");
                stats.ignored += 1;
                cursor = it.next();
            }
            // Any remaining known blocks come from a fast-sync rollback: the
            // node reset the head below a previously imported batch, and
            // some of those blocks now beat the new head on TD.
            while let Some((block, verdict)) = peek(&cursor) {
                if !self.skip_block(&verdict, block, it.previous()) {
                    break;
                }
                debug!(number = block.number(), hash = %block.hash(),
                    "Writing previously known block");
                let block = Arc::new(block.clone());
                self.write_known_block(&block)
                    .map_err(|err| InsertionError::new(it.index(), err))?;
                *last_canon = Some(block);
                cursor = it.next();
            }
            // falls through to the regular import below
        }

        // direct the import by the first block's verdict
        match peek(&cursor) {
            Some((block, Err(BlockError::PrunedAncestor))) => {
                return if set_head {
                    // insert as a side chain, reorg only if TD grows enough
                    debug!(number = block.number(), hash = %block.hash(),
                        "Pruned ancestor, inserting as sidechain");
                    self.insert_side_chain(&mut it, cursor, &mut stats)
                } else {
                    // the parent is pruned post-merge, recover its state
                    debug!(number = block.number(), hash = %block.hash(), "Pruned ancestor");
                    self.recover_ancestors(block)
                        .map(|()| it.index())
                        .map_err(|err| InsertionError::new(it.index(), err))
                };
            }
            Some((_, Err(ref err @ (BlockError::FutureBlock | BlockError::UnknownAncestor))))
                if matches!(err, BlockError::FutureBlock)
                    || self.caches.has_future_block(it.first().parent_hash()) =>
            {
                while let Some((block, verdict)) = peek(&cursor) {
                    if !(it.index() == 0
                        || matches!(verdict, Err(BlockError::UnknownAncestor)))
                    {
                        break;
                    }
                    debug!(number = block.number(), hash = %block.hash(),
                        "Future block, postponing import");
                    self.add_future_block(block)
                        .map_err(|err| InsertionError::new(it.index(), err))?;
                    cursor = it.next();
                }
                stats.queued += it.processed();
                stats.ignored += it.remaining();
                return match peek(&cursor) {
                    Some((_, Err(err))) => Err(InsertionError::new(it.index(), err)),
                    _ => Ok(it.index()),
                };
            }
            Some((block, Err(err))) if !matches!(err, BlockError::KnownBlock) => {
                self.caches.remove_future_block(block.hash());
                stats.ignored += blocks.len();
                self.report_block(block, &ChainError::Block(err.clone()));
                return Err(InsertionError::new(it.index(), err));
            }
            _ => {}
        }

        while let Some((block, verdict)) = peek(&cursor) {
            match &verdict {
                Ok(()) | Err(BlockError::KnownBlock) => {}
                // leave the cursor in place for the future-block sweep below
                Err(_) => break,
            }
            if self.insert_stopped() {
                debug!("Abort during block processing");
                break;
            }
            if self.config.bad_hashes.contains(&block.hash())
                || self.caches.is_bad_block(block.hash())
            {
                let err = BlockError::BannedHash(block.hash());
                self.report_block(block, &ChainError::Block(err.clone()));
                return Err(InsertionError::new(it.index(), err));
            }
            // A known block in the middle of the chain: engines that share
            // state between blocks can complete a later block's state by
            // importing an earlier one, so only skip when that cannot close
            // a snapshot gap.
            if self.skip_block(&verdict, block, it.previous()) {
                debug!(number = block.number(), hash = %block.hash(),
                    txs = block.body.transactions.len(), "Inserted known block");
                // Side-chain insertion persisted td, header and body but no
                // receipts (nothing executed). Skipping execution here would
                // lose the empty receipt entry for empty blocks.
                if block.body.transactions.is_empty() {
                    let mut batch = WriteBatch::new();
                    schema::write_receipts(&mut batch, block.number(), block.hash(), &[]);
                    self.write_fatal(batch);
                } else {
                    error!(number = block.number(), hash = %block.hash(),
                        "Known block with transactions skipped without receipts; please file an issue");
                }
                let promoted = Arc::new(block.clone());
                self.write_known_block(&promoted)
                    .map_err(|err| InsertionError::new(it.index(), err))?;
                stats.processed += 1;
                *last_canon = Some(promoted);
                cursor = it.next();
                continue;
            }

            let block_start = Instant::now();
            let parent = match it.previous() {
                Some(parent) => parent.clone(),
                None => self
                    .hc
                    .header(block.parent_hash(), block.number().saturating_sub(1))
                    .ok_or_else(|| {
                        InsertionError::new(it.index(), BlockError::UnknownAncestor)
                    })?,
            };
            self.update_highest_verified_header(&block.header);

            let mut outcome = match self.processor.process(block, parent.root) {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.report_block(block, &ChainError::Block(err.clone()));
                    return Err(InsertionError::new(it.index(), err));
                }
            };
            if let Err(err) = self.validator.validate_state(block, &outcome) {
                error!(%err, "Validate state failed");
                self.report_block(block, &ChainError::Block(err.clone()));
                return Err(InsertionError::new(it.index(), err));
            }

            self.cache_receipts(block.hash(), &outcome.receipts);
            let shared = Arc::new(block.clone());
            self.caches.insert_block(Arc::clone(&shared));
            let proc_time = block_start.elapsed();

            let status = if set_head {
                self.write_block_and_set_head_inner(&shared, &mut outcome, false)
            } else {
                self.write_block_with_state(&shared, &mut outcome).map(|()| WriteStatus::Side)
            }
            .map_err(|err| InsertionError::new(it.index(), err))?;

            if !set_head {
                info!(number = block.number(), hash = %block.hash(),
                    txs = block.body.transactions.len(), elapsed = ?block_start.elapsed(),
                    "Inserted block");
                return Ok(it.index());
            }

            match status {
                WriteStatus::Canon => {
                    debug!(number = block.number(), hash = %block.hash(),
                        txs = block.body.transactions.len(),
                        gas = outcome.gas_used, root = %block.root,
                        elapsed = ?block_start.elapsed(), "Inserted new block");
                    *last_canon = Some(Arc::clone(&shared));
                    // only canonical blocks count against the GC allowance
                    self.trie_gc.lock().gc_proc += proc_time;
                }
                WriteStatus::Side => {
                    debug!(number = block.number(), hash = %block.hash(),
                        difficulty = %block.difficulty, txs = block.body.transactions.len(),
                        root = %block.root, "Inserted forked block");
                }
            }
            stats.processed += 1;
            stats.gas_used += outcome.gas_used;
            self.feeds.send_chain_block(ChainBlockEvent { block: shared });
            if last_report.elapsed() >= STATS_REPORT_LIMIT {
                info!(blocks = stats.processed, gas = stats.gas_used,
                    number = block.number(), elapsed = ?start.elapsed(),
                    "Importing chain segment");
                last_report = Instant::now();
            }
            cursor = it.next();
        }

        // whatever remains can only interest us if it is future blocks
        if let Some((block, Err(BlockError::FutureBlock))) = peek(&cursor) {
            self.add_future_block(block)
                .map_err(|err| InsertionError::new(it.index(), err))?;
            cursor = it.next();
            while let Some((block, Err(BlockError::UnknownAncestor))) = peek(&cursor) {
                self.add_future_block(block)
                    .map_err(|err| InsertionError::new(it.index(), err))?;
                stats.queued += 1;
                cursor = it.next();
            }
        }
        stats.ignored += it.remaining();

        if stats.processed > 0 {
            info!(blocks = stats.processed, gas = stats.gas_used,
                ignored = stats.ignored, queued = stats.queued,
                elapsed = ?start.elapsed(), dirty = self.state.dirty_size(),
                "Imported new chain segment");
        }
        match cursor {
            Some((_, Err(err))) => Err(InsertionError::new(it.index(), err)),
            _ => Ok(it.index()),
        }
    }

    /// Runs header verification on a dedicated thread, streaming ordered
    /// results for the insert iterator to consume.
    fn start_header_verifier(
        &self,
        blocks: &[SealedBlock],
    ) -> Receiver<Result<(), BlockError>> {
        let headers: Vec<SealedHeader> =
            blocks.iter().map(|block| block.header.clone()).collect();
        let (tx, rx) = bounded(headers.len());
        let hc = Arc::clone(&self.hc);
        let engine = Arc::clone(&self.engine);
        thread::spawn(move || {
            for index in 0..headers.len() {
                let parent = if index == 0 {
                    hc.header(
                        headers[0].parent_hash,
                        headers[0].number.saturating_sub(1),
                    )
                } else {
                    Some(headers[index - 1].clone())
                };
                let result = engine.verify_header(&*hc, &headers[index], parent.as_ref());
                if tx.send(result).is_err() {
                    // the importer aborted, nobody cares about the rest
                    return;
                }
            }
        });
        rx
    }

    /// Whether an already-known block can be skipped entirely: only when its
    /// state exists and re-executing it would not close a snapshot gap.
    fn skip_block(
        &self,
        verdict: &Result<(), BlockError>,
        block: &SealedBlock,
        previous: Option<&SealedHeader>,
    ) -> bool {
        if !matches!(verdict, Err(BlockError::KnownBlock)) {
            return false;
        }
        let Some(snaps) = self.snaps() else { return true };
        if snaps.has_snapshot(block.root) {
            return true;
        }
        // trie state exists but the snapshot is missing: re-execute unless
        // the parent snapshot is missing too (re-execution cannot help then)
        let parent_root = previous.map(|header| header.root).or_else(|| {
            self.hc.header_by_hash(block.parent_hash()).map(|header| header.root)
        });
        match parent_root {
            Some(root) => !snaps.has_snapshot(root),
            None => false,
        }
    }

    /// Queues a block whose parent is unknown but whose timestamp is near
    /// the wall clock. Blocks too far ahead are rejected; proof-of-stake
    /// blocks are never queued.
    fn add_future_block(&self, block: &SealedBlock) -> ChainResult<()> {
        let max = unix_now() + MAX_TIME_FUTURE_BLOCKS;
        if block.time > max {
            return Err(BlockError::TooFarInFuture { time: block.time, max }.into());
        }
        if block.difficulty.is_zero() {
            return Ok(());
        }
        self.caches.insert_future_block(block.clone());
        Ok(())
    }

    /// Retries all queued future blocks in number order. Runs on the
    /// promoter tick.
    pub(crate) fn proc_future_blocks(&self) {
        // one by one: chain insertion needs contiguous ancestry
        for block in self.caches.future_blocks_by_number() {
            let _ = self.insert_chain(vec![block]);
        }
    }

    fn update_highest_verified_header(&self, header: &SealedHeader) {
        let Some(current) = self.highest_verified.load_full() else {
            self.highest_verified.store(Some(Arc::new(header.clone())));
            return;
        };
        let td = |header: &SealedHeader| {
            self.td(header.parent_hash, header.number.saturating_sub(1))
                .unwrap_or(U256::ZERO)
                + header.difficulty
        };
        if td(header) > td(&current) {
            self.highest_verified.store(Some(Arc::new(header.clone())));
        }
    }

    fn cache_receipts(&self, hash: BlockHash, receipts: &[Receipt]) {
        let mut receipts = receipts.to_vec();
        if self.config.patch_system_receipts {
            // system transactions sit at the tail of the block and are
            // written with a zero block hash; patch it for readers
            let len = receipts.len();
            for receipt in receipts.iter_mut().skip(len.saturating_sub(3)) {
                for log in &mut receipt.logs {
                    log.block_hash = hash;
                }
            }
        }
        self.caches.insert_receipts(hash, receipts);
    }

    /// Persists the offending block for forensics and logs a structured
    /// dump.
    fn report_block(&self, block: &SealedBlock, err: &ChainError) {
        if let Err(write_err) = schema::write_bad_block(&self.db, block) {
            warn!(%write_err, "Failed to persist bad block");
        }
        self.caches.insert_bad_block(block.hash());
        error!(
            number = block.number(),
            hash = %block.hash(),
            root = %block.root,
            txs = block.body.transactions.len(),
            %err,
            "########## BAD BLOCK #########"
        );
    }
}

// --------------------------------------------------------------- sidechains

impl ChainManager {
    /// Imports a batch whose ancestor state has been pruned: block data is
    /// written without state, and when the accumulated external TD outweighs
    /// the local chain, the pruned ancestors are re-executed in bounded
    /// batches.
    fn insert_side_chain<'a>(
        &self,
        it: &mut InsertIterator<'a>,
        mut cursor: Option<(&'a SealedBlock, Result<(), BlockError>)>,
        stats: &mut InsertStats,
    ) -> InsertResult {
        let current = self.current_block();
        let mut extern_td = U256::ZERO;
        let mut have_td = false;
        let mut last_seen: Option<SealedHeader> = None;

        // The first block is known to have a pruned ancestor; the rest of
        // the batch keeps reporting it as their parents get written below.
        // Anything else coming out of the iterator here means the block is
        // invalid and simply does not get written.
        while let Some((block, verdict)) = peek(&cursor) {
            if !matches!(verdict, Err(BlockError::PrunedAncestor)) {
                break;
            }
            let number = block.number();
            if current.number() >= number {
                let canonical = self.block_by_number(number);
                if let Some(canonical) = &canonical {
                    if canonical.hash() == block.hash() {
                        // re-import of a canonical block with pruned state
                        extern_td = self.td(block.hash(), number).unwrap_or_default();
                        have_td = true;
                        last_seen = Some(block.header.clone());
                        cursor = it.next();
                        continue;
                    }
                    if canonical.root == block.root {
                        // The side chain claims a state that already exists
                        // in the canonical chain: importing it would accept
                        // unverified state as verified.
                        warn!(number, side_root = %block.root, canon_root = %canonical.root,
                            "Sidechain ghost-state attack detected");
                        return Err(InsertionError::new(it.index(), BlockError::GhostState));
                    }
                }
            }
            if !have_td {
                extern_td = self
                    .td(block.parent_hash(), number.saturating_sub(1))
                    .unwrap_or_default();
                have_td = true;
            }
            extern_td += block.difficulty;

            if !self.has_block(block.hash(), number) {
                self.write_block_without_state(block, extern_td)
                    .map_err(|err| InsertionError::new(it.index(), err))?;
                debug!(number, hash = %block.hash(), difficulty = %block.difficulty,
                    "Injected sidechain block");
            }
            stats.ignored += 1;
            last_seen = Some(block.header.clone());
            cursor = it.next();
        }

        let Some(last_header) = last_seen else { return Ok(it.index()) };
        let reorg = self
            .fork_choice
            .reorg_needed_with_fast_finality(&*self.hc, &current.header, &last_header)
            .map_err(|err| InsertionError::new(it.index(), err))?;
        if !reorg {
            let local_td = self.td(current.hash(), current.number()).unwrap_or_default();
            info!(side_td = %extern_td, local_td = %local_td, "Sidechain written to disk");
            return Ok(it.index());
        }

        // the fork won: gather everything back to the last ancestor with
        // state and re-execute forward (hashes only, blocks are heavy)
        let mut hashes = Vec::new();
        let mut numbers = Vec::new();
        let mut parent = it.previous().cloned();
        while let Some(header) = parent {
            if self.has_state(header.root) {
                parent = Some(header);
                break;
            }
            hashes.push(header.hash());
            numbers.push(header.number);
            parent = self.hc.header(header.parent_hash, header.number.saturating_sub(1));
        }
        if parent.is_none() {
            return Err(InsertionError::new(it.index(), ChainError::MissingParent));
        }

        let mut batch: Vec<SealedBlock> = Vec::new();
        let mut memory = 0usize;
        for index in (0..hashes.len()).rev() {
            let Some(block) = self.block(hashes[index], numbers[index]) else {
                return Err(InsertionError::new(
                    it.index(),
                    ChainError::UnknownBlock(hashes[index]),
                ));
            };
            memory += block.size();
            batch.push(block.as_ref().clone());

            if batch.len() >= SIDE_CHAIN_BATCH_BLOCKS || memory > SIDE_CHAIN_BATCH_MEMORY {
                // too heavy: import and discard the raised events
                info!(blocks = batch.len(), start = batch[0].number(),
                    end = block.number(), "Importing heavy sidechain segment");
                let drained = std::mem::take(&mut batch);
                memory = 0;
                self.insert_chain_inner(&drained, true)?;
                if self.insert_stopped() {
                    debug!("Abort during blocks processing");
                    return Ok(0);
                }
            }
        }
        if !batch.is_empty() {
            info!(start = batch[0].number(), end = batch[batch.len() - 1].number(),
                "Importing sidechain segment");
            let processed = self.insert_chain_inner(&batch, true)?;
            return Ok(processed);
        }
        Ok(0)
    }

    /// Finds the closest ancestor with available state and re-executes all
    /// blocks from there up to (and including) `block`, without moving the
    /// head. Post-merge counterpart of side-chain insertion.
    fn recover_ancestors(&self, block: &SealedBlock) -> ChainResult<()> {
        let mut hashes = Vec::new();
        let mut numbers = Vec::new();
        let mut parent = Some(block.header.clone());
        while let Some(header) = parent {
            if self.has_state(header.root) {
                parent = Some(header);
                break;
            }
            hashes.push(header.hash());
            numbers.push(header.number);
            parent = self.hc.header(header.parent_hash, header.number.saturating_sub(1));
            if self.insert_stopped() {
                debug!("Abort during blocks iteration");
                return Err(ChainError::InsertionInterrupted);
            }
        }
        if parent.is_none() {
            return Err(ChainError::MissingParent);
        }
        for index in (0..hashes.len()).rev() {
            if self.insert_stopped() {
                debug!("Abort during blocks processing");
                return Err(ChainError::InsertionInterrupted);
            }
            let to_import = if index == 0 {
                block.clone()
            } else {
                self.block(hashes[index], numbers[index])
                    .ok_or(ChainError::UnknownBlock(hashes[index]))?
                    .as_ref()
                    .clone()
            };
            self.insert_chain_inner(&[to_import], false)
                .map_err(|err| err.error)?;
        }
        Ok(())
    }
}

// -------------------------------------------------------------------- reorg

impl ChainManager {
    /// Collects the (removed or reborn) logs of one block.
    fn collect_logs(&self, hash: BlockHash, removed: bool) -> Vec<Log> {
        let Some(number) = self.hc.block_number(hash) else { return Vec::new() };
        let receipts =
            schema::read_receipts(&self.db, hash, number).ok().flatten().unwrap_or_default();
        let mut logs = Vec::new();
        for receipt in receipts {
            for mut log in receipt.logs {
                log.removed = removed;
                logs.push(log);
            }
        }
        logs
    }

    /// Reorganizes the chain to make `new_head`'s branch canonical,
    /// reconstructing canonical mappings and transaction indices and
    /// announcing dropped and reborn logs. The new head block itself is not
    /// promoted here; callers handle it.
    fn reorg(&self, old_head: Arc<SealedBlock>, new_head: Arc<SealedBlock>) -> ChainResult<()> {
        let mut old_block = Arc::clone(&old_head);
        let mut new_block = Arc::clone(&new_head);
        let mut old_chain = Vec::new();
        let mut new_chain = Vec::new();
        let mut deleted_txs: Vec<TxHash> = Vec::new();
        let mut added_txs: Vec<TxHash> = Vec::new();
        let mut deleted_logs: Vec<Vec<Log>> = Vec::new();

        // reduce the longer chain to the same height as the shorter one
        while old_block.number() > new_block.number() {
            old_chain.push(Arc::clone(&old_block));
            deleted_txs.extend(old_block.body.transactions.iter().map(|tx| tx.hash()));
            let logs = self.collect_logs(old_block.hash(), true);
            if !logs.is_empty() {
                deleted_logs.push(logs);
            }
            old_block = self
                .block(old_block.parent_hash(), old_block.number() - 1)
                .ok_or(ChainError::InvalidOldChain)?;
        }
        while new_block.number() > old_block.number() {
            new_chain.push(Arc::clone(&new_block));
            new_block = self
                .block(new_block.parent_hash(), new_block.number() - 1)
                .ok_or(ChainError::InvalidNewChain)?;
        }
        // walk both in lockstep until the common ancestor
        let common = loop {
            if old_block.hash() == new_block.hash() {
                break old_block;
            }
            old_chain.push(Arc::clone(&old_block));
            deleted_txs.extend(old_block.body.transactions.iter().map(|tx| tx.hash()));
            let logs = self.collect_logs(old_block.hash(), true);
            if !logs.is_empty() {
                deleted_logs.push(logs);
            }
            new_chain.push(Arc::clone(&new_block));

            old_block = self
                .block(old_block.parent_hash(), old_block.number() - 1)
                .ok_or(ChainError::InvalidOldChain)?;
            new_block = self
                .block(new_block.parent_hash(), new_block.number() - 1)
                .ok_or(ChainError::InvalidNewChain)?;
        };

        if !old_chain.is_empty() && !new_chain.is_empty() {
            if old_chain.len() > LARGE_REORG_DEPTH {
                warn!(number = common.number(), hash = %common.hash(),
                    drop = old_chain.len(), add = new_chain.len(),
                    drop_from = %old_chain[0].hash(), add_from = %new_chain[0].hash(),
                    "Large chain reorg detected");
            } else {
                info!(number = common.number(), hash = %common.hash(),
                    drop = old_chain.len(), add = new_chain.len(),
                    "Chain reorg detected");
            }
            counter!("chain.reorg.add").increment(new_chain.len() as u64);
            counter!("chain.reorg.drop").increment(old_chain.len() as u64);
            counter!("chain.reorg.executes").increment(1);
        } else if !new_chain.is_empty() {
            // post-merge special case: extending the chain over a gap
            info!(add = new_chain.len(), number = new_chain[0].number(),
                hash = %new_chain[0].hash(), "Extend chain");
            counter!("chain.reorg.add").increment(new_chain.len() as u64);
        } else {
            error!(old_number = old_head.number(), old_hash = %old_head.hash(),
                new_number = new_head.number(), new_hash = %new_head.hash(),
                "Impossible reorg, please file an issue");
        }

        // rewrite history: promote every new-chain block except the head,
        // oldest first
        for block in new_chain.iter().rev().take(new_chain.len().saturating_sub(1)) {
            self.write_head_block(block);
            added_txs.extend(block.body.transactions.iter().map(|tx| tx.hash()));
        }

        // drop indices that did not survive the switch
        let added: HashSet<TxHash> = added_txs.into_iter().collect();
        let mut batch = WriteBatch::new();
        for tx in deleted_txs.into_iter().filter(|tx| !added.contains(tx)) {
            schema::delete_tx_lookup(&mut batch, tx);
        }
        // and any canonical assignment above the new head, scanning until
        // the mapping runs out
        let mut number = self.current_block().number() + 1;
        while self.hc.canonical_hash(number).is_some() {
            schema::delete_canonical_hash(&mut batch, number);
            number += 1;
        }
        self.write_fatal(batch);

        // collect reborn logs, oldest block first
        let mut rebirth_logs = Vec::new();
        for block in new_chain.iter().rev().take(new_chain.len().saturating_sub(1)) {
            let logs = self.collect_logs(block.hash(), false);
            if !logs.is_empty() {
                rebirth_logs.push(logs);
            }
        }

        if !deleted_logs.is_empty() {
            // collected newest-first during the walk, announced oldest-first
            let logs = deleted_logs.into_iter().rev().flatten().collect();
            self.feeds.send_removed_logs(RemovedLogsEvent { logs });
        }
        if !rebirth_logs.is_empty() {
            let logs = rebirth_logs.into_iter().flatten().collect();
            self.feeds.send_logs(LogsEvent { logs });
        }
        for block in old_chain.into_iter().rev() {
            self.feeds.send_chain_side(ChainSideEvent { block });
        }
        Ok(())
    }
}

// ----------------------------------------------------- rewinds and resets

impl ChainManager {
    /// Rewinds the chain to a new head at or below `head`, deleting minimal
    /// data while keeping the chain consistent.
    pub fn set_head(&self, head: BlockNumber) -> ChainResult<()> {
        let _ops = self.ops.enter();
        let Some(_guard) = self.chainmu.lock() else { return Err(ChainError::ChainStopped) };
        self.set_head_beyond_root(head, None, false).map(|_| ())
    }

    /// Rewinds to `head`, continuing backwards until a block with resolvable
    /// state is found. With a `root` threshold, keeps rewinding past stateful
    /// blocks until that root is crossed (bounded by `MAX_BEYOND_BLOCKS`).
    ///
    /// Returns the number of the block the requested root was found at, or
    /// zero when no root was requested or found.
    fn set_head_beyond_root(
        &self,
        head: BlockNumber,
        root: Option<B256>,
        repair: bool,
    ) -> ChainResult<u64> {
        let mut root_number = 0u64;
        let pivot = schema::read_last_pivot_number(&self.db)?;
        let frozen = self.db.ancients();

        let update_fn = |this: &Self,
                         batch: &mut WriteBatch,
                         header: &SealedHeader,
                         root_number: &mut u64|
         -> (BlockNumber, bool) {
            let current = this.current_block();
            if header.number <= current.number() {
                // rewind the block chain, ensuring no stateless head block;
                // depth equality is fine, set_head doubles as a reparation
                // mechanism that deletes nothing
                let mut new_head = match this.block(header.hash(), header.number) {
                    Some(block) => block,
                    None => {
                        error!(number = header.number, hash = %header.hash(),
                            "Gap in the chain, rewinding to genesis");
                        this.genesis_block()
                    }
                };
                if new_head.hash() != this.genesis_block().hash() {
                    let mut beyond_root = root.is_none();
                    let mut beyond_count = 0u64;
                    let last_block_num = header.number;
                    loop {
                        beyond_count += 1;
                        if let Some(target) = root {
                            if !beyond_root && new_head.root == target {
                                beyond_root = true;
                                *root_number = new_head.number();
                            }
                        }
                        let enough_beyond = beyond_count > MAX_BEYOND_BLOCKS;

                        if !this.state.has_state(new_head.root) {
                            debug!(number = new_head.number(), hash = %new_head.hash(),
                                "Block state missing, rewinding further");
                            if pivot.is_none() || new_head.number() > pivot.unwrap_or(0) {
                                match this
                                    .block(new_head.parent_hash(), new_head.number().saturating_sub(1))
                                {
                                    Some(parent) => {
                                        new_head = parent;
                                        continue;
                                    }
                                    None => {
                                        error!(number = new_head.number().saturating_sub(1),
                                            hash = %new_head.parent_hash(),
                                            "Missing block in the middle, aiming genesis");
                                        new_head = this.genesis_block();
                                    }
                                }
                            } else {
                                debug!(number = new_head.number(), hash = %new_head.hash(),
                                    "Rewind passed pivot, aiming genesis");
                                new_head = this.genesis_block();
                            }
                        }
                        if beyond_root
                            || (enough_beyond && root.is_some())
                            || new_head.number() == 0
                        {
                            if enough_beyond && root.is_some() && *root_number == 0 {
                                // the bounded backward search missed the
                                // root; scan forward for it
                                let mut scan = last_block_num;
                                loop {
                                    scan += 1;
                                    let Some(candidate) = this.block_by_number(scan) else {
                                        break;
                                    };
                                    if Some(candidate.root) == root {
                                        *root_number = candidate.number();
                                        break;
                                    }
                                }
                            }
                            debug!(number = new_head.number(), hash = %new_head.hash(),
                                "Rewound to block with state");
                            break;
                        }
                        debug!(number = new_head.number(), hash = %new_head.hash(),
                            root = %new_head.root, "Skipping block with threshold state");
                        new_head = this
                            .block(new_head.parent_hash(), new_head.number().saturating_sub(1))
                            .unwrap_or_else(|| this.genesis_block());
                    }
                }
                schema::write_head_block_hash(batch, new_head.hash());
                // markers are normally updated last, but set_head runs from
                // high to low so degrading them in place is safe
                this.current_block.store(Arc::clone(&new_head));
                this.update_head_gauges(&new_head);
            }
            // rewind the fast block in a simpleton way to the target head
            let fast = this.current_fast_block();
            if header.number < fast.number() {
                let new_fast = this
                    .block(header.hash(), header.number)
                    .unwrap_or_else(|| this.genesis_block());
                schema::write_head_fast_block_hash(batch, new_fast.hash());
                this.current_fast_block.store(Arc::clone(&new_fast));
                gauge!("chain.head.receipt").set(new_fast.number() as f64);
            }
            let head = this.current_block().number();

            // if the rewind underflowed the freezer and full blocks follow,
            // the segment between the stateful block and the target must go
            let wipe = head + 1 < frozen && (pivot.is_none() || head >= pivot.unwrap_or(0));
            (head, wipe)
        };

        let del_fn = |this: &Self, batch: &mut WriteBatch, hash: BlockHash, num: BlockNumber| {
            let frozen = this.db.ancients();
            if num + 1 <= frozen {
                // everything at and above num leaves the ancient store
                this.db.truncate_ancients(num);
                schema::delete_header_number(batch, hash);
            } else {
                schema::delete_body(batch, num, hash);
                schema::delete_receipts(batch, num, hash);
            }
        };

        if repair {
            // reparation only: leave the header chain alone unless the
            // freezer needs truncating
            let mut batch = WriteBatch::new();
            let (target, force) =
                update_fn(self, &mut batch, &self.current_header_inner(), &mut root_number);
            self.db.write(batch)?;
            if force {
                self.hc.set_head(
                    target,
                    |batch, header| update_fn(self, batch, header, &mut root_number),
                    |batch, hash, num| del_fn(self, batch, hash, num),
                )?;
            }
        } else {
            warn!(target = head, "Rewinding blockchain");
            self.hc.set_head(
                head,
                |batch, header| update_fn(self, batch, header, &mut root_number),
                |batch, hash, num| del_fn(self, batch, hash, num),
            )?;
        }

        self.caches.purge();
        self.load_last_state()?;
        Ok(root_number)
    }

    /// Purges the entire chain, restoring the genesis state.
    pub fn reset(&self) -> ChainResult<()> {
        let genesis = self.genesis_block().as_ref().clone();
        self.reset_with_genesis_block(genesis)
    }

    /// Purges the entire chain and re-initializes it from the given genesis
    /// block.
    pub fn reset_with_genesis_block(&self, genesis: SealedBlock) -> ChainResult<()> {
        self.set_head(0)?;
        let _ops = self.ops.enter();
        let Some(_guard) = self.chainmu.lock() else { return Err(ChainError::ChainStopped) };

        let genesis = Arc::new(genesis);
        let mut batch = WriteBatch::new();
        schema::write_td(&mut batch, genesis.number(), genesis.hash(), genesis.difficulty);
        schema::write_block(&mut batch, &genesis);
        self.write_fatal(batch);
        self.state
            .commit_external(genesis.root, Bytes::copy_from_slice(genesis.root.as_slice()))?;
        self.write_head_block(&genesis);

        self.genesis.store(Arc::clone(&genesis));
        self.current_block.store(Arc::clone(&genesis));
        self.update_head_gauges(&genesis);
        self.hc.set_genesis(genesis.header.clone());
        self.hc.set_current(genesis.header.clone());
        self.current_fast_block.store(Arc::clone(&genesis));
        gauge!("chain.head.receipt").set(genesis.number() as f64);
        Ok(())
    }

    /// Sets the current head to the block with the given hash, regardless of
    /// prior chain contents. Used when snap sync hands over to full sync.
    pub fn snap_sync_commit_head(&self, hash: BlockHash) -> ChainResult<()> {
        let block = self.block_by_hash(hash).ok_or(ChainError::UnknownBlock(hash))?;
        if !self.state.has_state(block.root) {
            return Err(ChainError::StateRootVerificationFailed);
        }
        {
            let _ops = self.ops.enter();
            let Some(_guard) = self.chainmu.lock() else {
                return Err(ChainError::ChainStopped);
            };
            self.current_block.store(Arc::clone(&block));
            self.update_head_gauges(&block);
        }
        // regenerate the snapshot outside the writer lock
        if let Some(snaps) = self.snaps() {
            snaps.rebuild(block.root)?;
        }
        info!(number = block.number(), hash = %hash, "Committed new head block");
        Ok(())
    }

    /// Rewinds the current head to roughly one block below it after its
    /// snapshot verification came back negative. Pipe-commit safety net.
    pub(crate) fn try_rewind_bad_blocks(&self) {
        let _ops = self.ops.enter();
        let Some(_guard) = self.chainmu.lock() else { return };
        let block = self.current_block();
        let Some(snaps) = self.snaps() else { return };
        let Some(layer) = snaps.snapshot(block.root) else { return };
        if layer.verified && !layer.valid {
            warn!(height = block.number(), hash = %block.hash(),
                "Current block verification failed, rewinding to its parent");
            self.caches.remove_future_block(block.hash());
            self.caches.insert_bad_block(block.hash());
            self.caches.remove_diff_layer(block.hash());
            self.report_block(&block, &ChainError::StateRootVerificationFailed);
            let _ = self.set_head_beyond_root(block.number().saturating_sub(1), None, false);
        }
    }
}

// ---------------------------------------------------- receipts & headers

impl ChainManager {
    /// Completes an already-verified header chain with bodies and receipts,
    /// without execution. Blocks at or below `ancient_limit` go straight to
    /// the ancient store, the rest to the live store.
    ///
    /// Does not take the writer lock except briefly to publish the new fast
    /// block: header insertion and receipt insertion are left to run
    /// concurrently.
    pub fn insert_receipt_chain(
        &self,
        blocks: Vec<SealedBlock>,
        receipts: Vec<Vec<Receipt>>,
        ancient_limit: u64,
    ) -> InsertResult {
        let _ops = self.ops.enter();

        let mut ancient_blocks = Vec::new();
        let mut ancient_receipts = Vec::new();
        let mut live_blocks = Vec::new();
        let mut live_receipts = Vec::new();
        for (index, block) in blocks.iter().enumerate() {
            if index != 0 {
                let prev = &blocks[index - 1];
                if block.number() != prev.number() + 1 || block.parent_hash() != prev.hash() {
                    error!(number = block.number(), hash = %block.hash(),
                        parent = %block.parent_hash(), prev_number = prev.number(),
                        prev_hash = %prev.hash(), "Non contiguous receipt insert");
                    return Err(InsertionError::new(
                        0,
                        ChainError::NonContiguousInsert {
                            prev_index: index - 1,
                            prev_number: prev.number(),
                            prev_hash: prev.hash(),
                            index,
                            number: block.number(),
                            hash: block.hash(),
                            parent: block.parent_hash(),
                        },
                    ));
                }
            }
            let block_receipts = receipts.get(index).cloned().unwrap_or_default();
            if block.number() <= ancient_limit {
                ancient_blocks.push(block.clone());
                ancient_receipts.push(block_receipts);
            } else {
                live_blocks.push(block.clone());
                live_receipts.push(block_receipts);
            }
        }

        let mut processed = 0usize;
        let mut ignored = 0usize;

        if !ancient_blocks.is_empty() {
            match self.write_ancient_receipts(&ancient_blocks, ancient_receipts, &mut processed) {
                Ok(()) => {}
                Err(InsertionError { error: ChainError::InsertionInterrupted, .. }) => {
                    return Ok(0)
                }
                Err(err) => return Err(err),
            }
        }
        // establish the tx index tail before the first live block
        if let Some(first_live) = live_blocks.first() {
            if first_live.number() == ancient_limit + 1
                && schema::read_tx_index_tail(&self.db).unwrap_or(None).is_none()
            {
                let limit = self.config.tx_lookup_limit.unwrap_or(0);
                let tail = if limit == 0 || ancient_limit <= limit {
                    0
                } else {
                    ancient_limit - limit
                };
                let mut batch = WriteBatch::new();
                schema::write_tx_index_tail(&mut batch, tail);
                self.db.write(batch).map_err(|err| InsertionError::new(0, err))?;
            }
        }
        if !live_blocks.is_empty() {
            match self.write_live_receipts(&live_blocks, live_receipts, &mut processed, &mut ignored)
            {
                Ok(()) => {}
                Err(InsertionError { error: ChainError::InsertionInterrupted, .. }) => {
                    return Ok(0)
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(head) = blocks.last() {
            info!(count = processed, ignored, number = head.number(), hash = %head.hash(),
                "Imported new block receipts");
        }
        Ok(processed)
    }

    /// Updates the head fast block if the inserted blocks are better.
    /// Returns whether the written chain is canonical.
    fn update_fast_head(&self, head: &SealedBlock) -> bool {
        let Some(_guard) = self.chainmu.lock() else { return false };
        // a rewind may have happened in between, bail in that case
        if self.current_header_inner().number < head.number() {
            return false;
        }
        let fast = self.current_fast_block();
        match self.fork_choice.reorg_needed_with_fast_finality(
            &*self.hc,
            &fast.header,
            &head.header,
        ) {
            Ok(true) => {
                let mut batch = WriteBatch::new();
                schema::write_head_fast_block_hash(&mut batch, head.hash());
                self.write_fatal(batch);
                let head = Arc::new(head.clone());
                self.current_fast_block.store(Arc::clone(&head));
                gauge!("chain.head.receipt").set(head.number() as f64);
                true
            }
            Ok(false) => false,
            Err(err) => {
                warn!(%err, "Fast-head fork-choice failed");
                false
            }
        }
    }

    fn write_ancient_receipts(
        &self,
        blocks: &[SealedBlock],
        receipts: Vec<Vec<Receipt>>,
        processed: &mut usize,
    ) -> Result<(), InsertionError> {
        let first = &blocks[0];
        let last = &blocks[blocks.len() - 1];

        // inserting at genesis+1 with empty ancients freezes genesis too
        if first.number() == 1 && self.db.ancients() == 0 {
            let genesis = self.genesis_block();
            self.db
                .write_ancient_blocks(vec![AncientBlock {
                    hash: genesis.hash(),
                    header: genesis.header.header().clone(),
                    body: genesis.body.clone(),
                    receipts: Vec::new(),
                    td: genesis.difficulty,
                }])
                .map_err(|err| InsertionError::new(0, err))?;
            info!("Wrote genesis to ancients");
        }
        // the chain is contiguous, checking the last block suffices
        if !self.hc.has_header(last.hash(), last.number()) {
            return Err(InsertionError::new(0, ChainError::UnknownBlock(last.hash())));
        }

        let mut td = self
            .td(first.parent_hash(), first.number().saturating_sub(1))
            .unwrap_or_default();
        let mut frozen = Vec::with_capacity(blocks.len());
        for (block, block_receipts) in blocks.iter().zip(receipts) {
            td += block.difficulty;
            frozen.push(AncientBlock {
                hash: block.hash(),
                header: block.header.header().clone(),
                body: block.body.clone(),
                receipts: block_receipts,
                td,
            });
        }
        let previous_fast = self.current_fast_block().number();
        self.db.write_ancient_blocks(frozen).map_err(|err| {
            // a failed freeze leaves a partial tail: trim it back
            self.db.truncate_ancients(previous_fast + 1);
            InsertionError::new(0, err)
        })?;

        // write tx indices for anything within the configured window
        let limit = self.config.tx_lookup_limit.unwrap_or(0);
        let ancient_limit = last.number();
        let mut batch = WriteBatch::new();
        for block in blocks {
            if self.insert_stopped() {
                return Err(InsertionError::new(0, ChainError::InsertionInterrupted));
            }
            if limit == 0
                || ancient_limit <= limit
                || block.number() >= ancient_limit - limit
                || schema::read_tx_index_tail(&self.db).unwrap_or(None).is_some()
            {
                schema::write_tx_lookups(&mut batch, block);
            }
            *processed += 1;
            if batch.value_size() > IDEAL_BATCH_SIZE {
                self.db.write(std::mem::take(&mut batch)).map_err(|err| {
                    self.db.truncate_ancients(previous_fast + 1);
                    InsertionError::new(0, err)
                })?;
            }
        }
        self.db.write(batch).map_err(|err| InsertionError::new(0, err))?;
        self.db.sync().map_err(|err| InsertionError::new(0, err))?;

        if !self.update_fast_head(last) {
            // the header chain reorged away; these blocks are side chain now
            self.db.truncate_ancients(previous_fast + 1);
            return Err(InsertionError::new(0, ChainError::SideChainReceipts));
        }

        // frozen blocks leave the live store; the hash-to-number entries
        // stay so lookups can still find the frozen data
        let mut batch = WriteBatch::new();
        let mut canonical = HashSet::new();
        for block in blocks {
            canonical.insert(block.hash());
            if block.number() == 0 {
                continue;
            }
            schema::delete_canonical_hash(&mut batch, block.number());
            schema::delete_body(&mut batch, block.number(), block.hash());
            schema::delete_receipts(&mut batch, block.number(), block.hash());
            schema::delete_td(&mut batch, block.number(), block.hash());
            schema::delete_header_without_number(&mut batch, block.number(), block.hash());
        }
        // side-chain leftovers in the frozen range are dropped entirely
        let hashes = schema::read_all_hashes_in_range(&self.db, first.number(), last.number())
            .map_err(|err| InsertionError::new(0, err))?;
        for (number, hash) in hashes {
            if !canonical.contains(&hash) {
                schema::delete_header(&mut batch, number, hash);
                schema::delete_body(&mut batch, number, hash);
                schema::delete_receipts(&mut batch, number, hash);
                schema::delete_td(&mut batch, number, hash);
            }
        }
        self.db.write(batch).map_err(|err| InsertionError::new(0, err))?;
        Ok(())
    }

    fn write_live_receipts(
        &self,
        blocks: &[SealedBlock],
        receipts: Vec<Vec<Receipt>>,
        processed: &mut usize,
        ignored: &mut usize,
    ) -> Result<(), InsertionError> {
        let mut skip_presence_check = false;
        let mut batch = WriteBatch::new();
        for (index, (block, block_receipts)) in blocks.iter().zip(receipts).enumerate() {
            if self.insert_stopped() {
                return Err(InsertionError::new(index, ChainError::InsertionInterrupted));
            }
            if !self.hc.has_header(block.hash(), block.number()) {
                return Err(InsertionError::new(index, ChainError::UnknownBlock(block.hash())));
            }
            if !skip_presence_check {
                if self.has_block(block.hash(), block.number()) {
                    *ignored += 1;
                    continue;
                }
                // if block N is missing, all later ones are too
                skip_presence_check = true;
            }
            schema::write_body(&mut batch, block.number(), block.hash(), &block.body);
            schema::write_receipts(&mut batch, block.number(), block.hash(), &block_receipts);
            // live blocks always get indexed, they are within any window
            schema::write_tx_lookups(&mut batch, block);

            if batch.value_size() >= IDEAL_BATCH_SIZE {
                self.db
                    .write(std::mem::take(&mut batch))
                    .map_err(|err| InsertionError::new(index, err))?;
            }
            *processed += 1;
        }
        self.db.write(batch).map_err(|err| InsertionError::new(0, err))?;
        if let Some(last) = blocks.last() {
            self.update_fast_head(last);
        }
        Ok(())
    }

    /// Inserts a header-only chain, possibly reorganizing the header chain.
    pub fn insert_header_chain(
        &self,
        headers: Vec<SealedHeader>,
        check_freq: usize,
    ) -> InsertResult {
        if headers.is_empty() {
            return Ok(0);
        }
        self.hc.validate_chain(&*self.engine, &headers, check_freq)?;

        let _ops = self.ops.enter();
        let Some(_guard) = self.chainmu.lock() else {
            return Err(InsertionError::new(0, ChainError::ChainStopped));
        };
        self.hc
            .insert(&headers, &self.fork_choice)
            .map(|_| headers.len())
            .map_err(|err| InsertionError::new(0, err))
    }

    /// Executes a block and persists it with state, without touching the
    /// canonical head. Pair with [`ChainManager::set_chain_head`].
    pub fn insert_block_without_set_head(&self, block: SealedBlock) -> ChainResult<()> {
        let _ops = self.ops.enter();
        let Some(_guard) = self.chainmu.lock() else { return Err(ChainError::ChainStopped) };
        self.insert_chain_inner(&[block], false).map(|_| ()).map_err(|err| err.error)
    }

    /// Reorganizes as needed to make the given (already inserted) block the
    /// canonical head.
    pub fn set_chain_head(&self, new_head: SealedBlock) -> ChainResult<()> {
        let _ops = self.ops.enter();
        let Some(_guard) = self.chainmu.lock() else { return Err(ChainError::ChainStopped) };

        let block = Arc::new(new_head);
        if block.parent_hash() != self.current_block().hash() {
            self.reorg(self.current_block(), Arc::clone(&block))?;
        }
        self.write_head_block(&block);

        let logs = self.collect_logs(block.hash(), false);
        self.feeds.send_chain(ChainEvent {
            block: Arc::clone(&block),
            hash: block.hash(),
            logs: logs.clone(),
        });
        if !logs.is_empty() {
            self.feeds.send_logs(LogsEvent { logs });
        }
        self.emit_chain_head(&block);
        info!(number = block.number(), hash = %block.hash(), "Set the chain head");
        Ok(())
    }
}

// ------------------------------------------------------------------- export

impl ChainManager {
    /// Writes the RLP encoding of every canonical block to `writer`.
    pub fn export(&self, writer: &mut dyn io::Write) -> ChainResult<()> {
        self.export_range(writer, 0, self.current_block().number())
    }

    /// Writes the RLP encoding of the canonical blocks in `[first, last]`.
    pub fn export_range(
        &self,
        writer: &mut dyn io::Write,
        first: BlockNumber,
        last: BlockNumber,
    ) -> ChainResult<()> {
        if first > last {
            return Err(ChainError::InvalidExportRange { first, last });
        }
        info!(count = last - first + 1, "Exporting batch of blocks");

        let mut parent_hash = BlockHash::ZERO;
        let start = Instant::now();
        let mut reported = Instant::now();
        for number in first..=last {
            let block = self.block_by_number(number).ok_or(ChainError::UnknownBlock(
                self.hc.canonical_hash(number).unwrap_or_default(),
            ))?;
            if number > first && block.parent_hash() != parent_hash {
                return Err(ChainError::ReorgDuringExport);
            }
            parent_hash = block.hash();
            let mut buf = Vec::with_capacity(block.size());
            block.as_ref().clone().unseal().encode(&mut buf);
            writer.write_all(&buf).map_err(|err| ChainError::ExportIo(err.to_string()))?;
            if reported.elapsed() >= STATS_REPORT_LIMIT {
                info!(exported = number - first, elapsed = ?start.elapsed(),
                    "Exporting blocks");
                reported = Instant::now();
            }
        }
        Ok(())
    }
}

/// Decodes a stream of blocks previously written by
/// [`ChainManager::export`].
pub fn decode_exported_blocks(mut data: &[u8]) -> ChainResult<Vec<SealedBlock>> {
    let mut blocks = Vec::new();
    while !data.is_empty() {
        let block = Block::decode(&mut data)
            .map_err(|err| ChainError::ExportIo(err.to_string()))?;
        blocks.push(block.seal_slow());
    }
    Ok(blocks)
}

// -------------------------------------------------------------- diff layers

impl ChainManager {
    /// Sorts, caches and (when a diff store is configured) queues a locally
    /// produced diff layer for persistence.
    fn cache_diff_layer(&self, mut diff: DiffLayer) {
        // maps are unordered; establish the canonical order before the diff
        // hash is ever taken
        diff.sort();
        self.caches.insert_diff_layer(diff.block_hash, diff.clone());
        if self.db.diff_store().is_some() {
            let _ = self.diff_tx.send(diff);
        }
    }

    /// Persists matured, still-canonical queued diffs and deletes the ones
    /// falling out of the retention window. Runs on the persister tick.
    pub(crate) fn persist_trusted_diffs(&self) {
        let Some(store) = self.db.diff_store().cloned() else { return };
        let current = self.current_block().number();
        let tries_in_memory = self.config.cache.tries_in_memory;

        let mut batch = WriteBatch::new();
        while let Some(diff) =
            self.trusted_diffs.pop_if(|number| number + tries_in_memory <= current)
        {
            if self.hc.canonical_hash(diff.number) == Some(diff.block_hash) {
                schema::write_diff_layer(&mut batch, diff.block_hash, &diff);
                if let Some(limit) = self.config.persist_diff_limit {
                    if let Some(stale) = diff
                        .number
                        .checked_sub(limit)
                        .and_then(|number| self.hc.canonical_hash(number))
                    {
                        schema::delete_diff_layer(&mut batch, stale);
                    }
                }
            }
            if batch.value_size() > IDEAL_BATCH_SIZE {
                if let Err(err) = store.write(std::mem::take(&mut batch)) {
                    error!(%err, "Failed to write diff layer");
                    return;
                }
            }
        }
        if !batch.is_empty() {
            if let Err(err) = store.write(batch) {
                error!(%err, "Failed to write diff layer");
            }
        }
    }

    /// Persists the entire queue regardless of maturity. Shutdown path.
    pub(crate) fn flush_trusted_diffs(&self) {
        let Some(store) = self.db.diff_store().cloned() else { return };
        let mut batch = WriteBatch::new();
        while let Some(diff) = self.trusted_diffs.pop() {
            schema::write_diff_layer(&mut batch, diff.block_hash, &diff);
            if batch.value_size() > IDEAL_BATCH_SIZE {
                if let Err(err) = store.write(std::mem::take(&mut batch)) {
                    error!(%err, "Failed to write diff layer");
                    return;
                }
            }
        }
        if !batch.is_empty() {
            if let Err(err) = store.write(batch) {
                error!(%err, "Failed to write diff layer");
            }
        }
    }

    /// Admits a peer-supplied diff layer into the untrusted index.
    pub fn handle_diff_layer(
        &self,
        diff: DiffLayer,
        peer: &str,
        fulfilled: bool,
    ) -> ChainResult<()> {
        self.untrusted_diffs.handle(diff, peer, fulfilled, self.current_block().number());
        Ok(())
    }

    /// The untrusted diff index.
    pub fn untrusted_diffs(&self) -> &UntrustedDiffs {
        &self.untrusted_diffs
    }

    /// A locally produced diff layer, from cache or the diff store.
    pub fn trusted_diff_layer(&self, block_hash: BlockHash) -> Option<DiffLayer> {
        if let Some(diff) = self.caches.diff_layer(block_hash) {
            return Some(diff);
        }
        let store = self.db.diff_store()?;
        schema::read_diff_layer(&**store, block_hash).ok().flatten()
    }

    /// An untrusted diff layer, preferring the given peer's submission.
    pub fn untrusted_diff_layer(&self, block_hash: BlockHash, peer: &str) -> Option<DiffLayer> {
        self.untrusted_diffs.get(block_hash, peer)
    }

    /// The encoded diff layer for a block: encoded cache, trusted cache,
    /// untrusted index, then the diff store.
    pub fn diff_layer_encoded(&self, block_hash: BlockHash) -> Option<Bytes> {
        if let Some(encoded) = self.caches.diff_layer_encoded(block_hash) {
            return Some(encoded);
        }
        if let Some(diff) = self.caches.diff_layer(block_hash) {
            let encoded = diff.encode();
            self.caches.insert_diff_layer_encoded(block_hash, encoded.clone());
            return Some(encoded);
        }
        if let Some(diff) = self.untrusted_diffs.get(block_hash, "") {
            // untrusted data is not worth caching
            return Some(diff.encode());
        }
        let store = self.db.diff_store()?;
        let raw = schema::read_diff_layer_encoded(&**store, block_hash).ok().flatten()?;
        let encoded: Bytes = raw.into();
        self.caches.insert_diff_layer_encoded(block_hash, encoded.clone());
        Some(encoded)
    }

    /// The accounts touched by a block, per its diff layer.
    pub fn diff_accounts(&self, block_hash: BlockHash) -> ChainResult<Vec<B256>> {
        let header =
            self.hc.header_by_hash(block_hash).ok_or(ChainError::UnknownBlock(block_hash))?;
        let diff = self.trusted_diff_layer(block_hash);
        let Some(diff) = diff else {
            if header.tx_root != EMPTY_TX_ROOT {
                return Err(ChainError::DiffLayerNotFound);
            }
            return Ok(Vec::new());
        };
        let accounts: Vec<B256> =
            diff.accounts.iter().map(|account| account.account).collect();
        if header.tx_root != EMPTY_TX_ROOT && accounts.is_empty() {
            return Err(ChainError::DiffLayerNotFound);
        }
        Ok(accounts)
    }

    /// Classifies a peer's diff verification request against the local
    /// chain and diff layers.
    pub fn verify_result(
        &self,
        block_number: BlockNumber,
        block_hash: BlockHash,
        diff_hash: B256,
    ) -> VerifyResult {
        let mut result = VerifyResult {
            status: VerifyStatus::UnexpectedError,
            block_number,
            block_hash,
            root: B256::ZERO,
        };
        let head = self.current_header_inner().number;
        if block_number > head + MAX_DIFF_FORK_DIST {
            result.status = VerifyStatus::BlockTooNew;
            return result;
        }
        if block_number > head {
            result.status = VerifyStatus::BlockNewer;
            return result;
        }
        let Some(header) = self.hc.header_by_hash(block_hash) else {
            result.status = if block_number > head.saturating_sub(MAX_DIFF_FORK_DIST) {
                VerifyStatus::PossibleFork
            } else {
                VerifyStatus::ImpossibleFork
            };
            return result;
        };
        match self.trusted_diff_layer(block_hash) {
            Some(diff) => {
                if diff.diff_hash() != diff_hash {
                    result.status = VerifyStatus::DiffHashMismatch;
                    return result;
                }
                result.status = VerifyStatus::FullVerified;
                result.root = header.root;
            }
            None => {
                result.status = VerifyStatus::PartiallyVerified;
                result.root = header.root;
            }
        }
        result
    }
}

fn read_block(
    db: &ChainDb,
    hash: BlockHash,
    number: BlockNumber,
) -> Result<Option<SealedBlock>, ChainError> {
    let Some(header) = schema::read_header(db, hash, number)? else { return Ok(None) };
    let Some(body) = schema::read_body(db, hash, number)? else { return Ok(None) };
    Ok(Some(SealedBlock { header: header.seal(hash), body }))
}

fn spawn_worker(name: &str, f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(f)
        .unwrap_or_else(|err| panic!("failed to spawn {name} worker: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        genesis_block, make_block, make_chain, setup_genesis, BlockParams, TestChain, TestEngine,
    };
    use crate::{CacheConfig, ChainConfig};
    use std::sync::atomic::AtomicU64;
    use trellis_storage::MemoryStore;

    fn chain_with(config: ChainConfig) -> TestChain {
        TestChain::with_config(config)
    }

    #[test]
    fn future_blocks_promote_once_their_time_comes() {
        let clock = Arc::new(AtomicU64::new(unix_now()));
        let engine = Arc::new(TestEngine::with_clock(Arc::clone(&clock), 5));
        let chain = TestChain::with_parts(
            ChainConfig::default(),
            engine,
            ChainDb::new(MemoryStore::new()),
        );

        // u is ten seconds ahead of the mocked clock, f chains onto it
        let now = clock.load(Ordering::SeqCst);
        let u = make_block(
            &chain.genesis,
            &BlockParams { difficulty: 2, time: Some(now + 10), ..Default::default() },
        );
        let f = make_block(&u, &BlockParams { difficulty: 2, time: Some(now + 11), ..Default::default() });

        chain.manager.insert_chain(vec![u.clone()]).unwrap();
        chain.manager.insert_chain(vec![f.clone()]).unwrap();
        assert_eq!(chain.manager.current_block().hash(), chain.genesis.hash());
        assert!(chain.manager.caches.has_future_block(u.hash()));
        assert!(chain.manager.caches.has_future_block(f.hash()));

        // promotion before their time changes nothing
        chain.manager.proc_future_blocks();
        assert_eq!(chain.manager.current_block().hash(), chain.genesis.hash());

        // advance the clock past both timestamps and promote again
        clock.fetch_add(20, Ordering::SeqCst);
        chain.manager.proc_future_blocks();
        assert_eq!(chain.manager.current_block().hash(), f.hash());
    }

    #[test]
    fn trusted_diff_layers_persist_when_matured() {
        let db = ChainDb::new(MemoryStore::new()).with_diff_store(MemoryStore::new());
        let config = ChainConfig {
            cache: CacheConfig { tries_in_memory: 4, ..Default::default() },
            persist_diff_limit: Some(5),
            ..Default::default()
        };
        let chain = TestChain::with_parts(config, Arc::new(TestEngine::new()), db.clone());
        let blocks = make_chain(
            &chain.genesis,
            10,
            BlockParams { difficulty: 2, txs: 1, ..Default::default() },
        );
        chain.manager.insert_chain(blocks.clone()).unwrap();

        // a stale diff for the block falling out of the retention window
        let store = db.diff_store().unwrap();
        let stale_hash = chain.manager.canonical_hash(0).unwrap();
        let mut batch = WriteBatch::new();
        schema::write_diff_layer(&mut batch, stale_hash, &DiffLayer::default());
        store.write(batch).unwrap();

        // queue a diff for block 5: head 10 - 5 >= tries_in_memory, matured
        let diff = DiffLayer {
            block_hash: blocks[4].hash(),
            number: 5,
            ..Default::default()
        };
        chain.manager.trusted_diffs.push(diff);
        chain.manager.persist_trusted_diffs();

        assert!(schema::read_diff_layer(&**store, blocks[4].hash()).unwrap().is_some());
        // and the one at 5 - persist_diff_limit was deleted
        assert!(schema::read_diff_layer(&**store, stale_hash).unwrap().is_none());
    }

    #[test]
    fn immature_diffs_stay_queued() {
        let db = ChainDb::new(MemoryStore::new()).with_diff_store(MemoryStore::new());
        let chain = TestChain::with_parts(
            ChainConfig::default(),
            Arc::new(TestEngine::new()),
            db.clone(),
        );
        let blocks = make_chain(&chain.genesis, 3, BlockParams::default());
        chain.manager.insert_chain(blocks.clone()).unwrap();

        // head 3, retention 128: nothing has matured
        chain.manager.trusted_diffs.push(DiffLayer {
            block_hash: blocks[0].hash(),
            number: 1,
            ..Default::default()
        });
        chain.manager.persist_trusted_diffs();
        assert!(!chain.manager.trusted_diffs.is_empty());

        // shutdown flushes regardless of maturity
        chain.manager.flush_trusted_diffs();
        let store = db.diff_store().unwrap();
        assert!(schema::read_diff_layer(&**store, blocks[0].hash()).unwrap().is_some());
    }

    #[test]
    fn receipt_chain_freezes_history_and_genesis() {
        let db = ChainDb::new(MemoryStore::new())
            .with_ancient(Arc::new(trellis_storage::AncientStore::new()));
        let chain = TestChain::with_parts(
            ChainConfig::default(),
            Arc::new(TestEngine::new()),
            db.clone(),
        );
        let blocks = make_chain(
            &chain.genesis,
            3,
            BlockParams { difficulty: 2, txs: 1, ..Default::default() },
        );
        let headers = blocks.iter().map(|block| block.header.clone()).collect();
        chain.manager.insert_header_chain(headers, 1).unwrap();

        let receipts: Vec<Vec<Receipt>> = blocks
            .iter()
            .map(|block| {
                block
                    .body
                    .transactions
                    .iter()
                    .map(|_| Receipt { success: true, ..Default::default() })
                    .collect()
            })
            .collect();
        chain.manager.insert_receipt_chain(blocks.clone(), receipts, 2).unwrap();

        // genesis plus blocks 1 and 2 are frozen, block 3 stays live
        assert_eq!(db.ancients(), 3);
        assert_eq!(chain.manager.current_fast_block().hash(), blocks[2].hash());
        assert!(chain.manager.receipts_by_hash(blocks[2].hash()).is_some());
        // frozen data remains readable through the facade
        assert!(chain.manager.receipts_by_hash(blocks[0].hash()).is_some());
        assert_eq!(chain.manager.canonical_hash(1), Some(blocks[0].hash()));
    }

    #[test]
    fn untrusted_diffs_flow_through_the_manager() {
        let chain = chain_with(ChainConfig::default());
        let blocks = make_chain(&chain.genesis, 2, BlockParams::default());
        chain.manager.insert_chain(blocks.clone()).unwrap();

        let diff = DiffLayer { block_hash: blocks[1].hash(), number: 2, ..Default::default() };
        chain.manager.handle_diff_layer(diff.clone(), "peer-1", true).unwrap();
        assert!(chain.manager.untrusted_diff_layer(blocks[1].hash(), "peer-1").is_some());

        // the encoded lookup falls through to the untrusted index
        assert!(chain.manager.diff_layer_encoded(blocks[1].hash()).is_some());
    }

    #[test]
    fn verify_result_classification() {
        let chain = chain_with(ChainConfig::default());
        let blocks = make_chain(
            &chain.genesis,
            3,
            BlockParams { difficulty: 2, txs: 1, ..Default::default() },
        );
        chain.manager.insert_chain(blocks.clone()).unwrap();

        // far above the head
        let result = chain.manager.verify_result(100, BlockHash::repeat_byte(9), B256::ZERO);
        assert_eq!(result.status, VerifyStatus::BlockTooNew);

        // barely above the head
        let result = chain.manager.verify_result(4, BlockHash::repeat_byte(9), B256::ZERO);
        assert_eq!(result.status, VerifyStatus::BlockNewer);

        // known block with a locally produced diff
        let diff = chain.manager.trusted_diff_layer(blocks[1].hash()).expect("local diff");
        let result = chain.manager.verify_result(2, blocks[1].hash(), diff.diff_hash());
        assert_eq!(result.status, VerifyStatus::FullVerified);
        assert_eq!(result.root, blocks[1].root);

        // same block, wrong diff hash
        let result = chain.manager.verify_result(2, blocks[1].hash(), B256::repeat_byte(1));
        assert_eq!(result.status, VerifyStatus::DiffHashMismatch);

        // unknown hash within fork distance
        let result = chain.manager.verify_result(2, BlockHash::repeat_byte(9), B256::ZERO);
        assert_eq!(result.status, VerifyStatus::PossibleFork);
    }

    #[test]
    fn recover_ancestors_reexecutes_pruned_state() {
        let config = ChainConfig {
            cache: CacheConfig { tries_in_memory: 4, ..Default::default() },
            ..Default::default()
        };
        let chain = chain_with(config);
        let blocks = make_chain(&chain.genesis, 10, BlockParams::default());
        chain.manager.insert_chain(blocks.clone()).unwrap();

        // block 3's state is long pruned
        assert!(!chain.manager.has_state(blocks[2].root));

        // inserting a child of block 3 without set-head recovers the
        // ancestor states first
        let side = make_block(&blocks[2], &BlockParams { difficulty: 1, extra: b"s", ..Default::default() });
        chain.manager.insert_block_without_set_head(side.clone()).unwrap();
        assert!(chain.manager.has_block(side.hash(), side.number()));
        assert!(chain.manager.has_state(side.root));
        // the canonical head did not move
        assert_eq!(chain.manager.current_block().hash(), blocks[9].hash());
    }

    #[test]
    fn bad_blocks_are_reported_and_cached() {
        let chain = chain_with(ChainConfig::default());
        // a block lying about its state root fails state validation
        let mut bad = make_block(&chain.genesis, &BlockParams::default()).unseal();
        bad.header.root = B256::repeat_byte(7);
        let bad = bad.seal_slow();

        let err = chain.manager.insert_chain(vec![bad.clone()]).unwrap_err();
        assert_matches::assert_matches!(
            err.error,
            ChainError::Block(BlockError::StateRootMismatch { .. })
        );
        assert!(schema::read_bad_block(&chain.db, bad.hash()).unwrap().is_some());
        assert!(chain.manager.caches.is_bad_block(bad.hash()));

        // a banned (cached bad) block short-circuits the next attempt
        let err = chain.manager.insert_chain(vec![bad.clone()]).unwrap_err();
        assert_matches::assert_matches!(err.error, ChainError::Block(BlockError::BannedHash(_)));
    }

    #[test]
    fn genesis_setup_smoke() {
        let db = ChainDb::new(MemoryStore::new());
        let genesis = genesis_block();
        setup_genesis(&db, &genesis);
        assert_eq!(schema::read_canonical_hash(&db, 0).unwrap(), Some(genesis.hash()));
        assert_eq!(schema::read_head_block_hash(&db).unwrap(), Some(genesis.hash()));
    }
}
