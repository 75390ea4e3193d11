//! Test helpers: a deterministic engine and processor, chain generators and
//! a ready-made chain fixture.

use crate::{
    engine::{ConsensusEngine, HeaderReader, PosaEngine},
    error::BlockError,
    traits::{ProcessOutcome, Processor},
    ChainConfig, ChainManager,
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};
use trellis_primitives::{
    keccak256, Address, Block, Body, Bytes, DiffAccount, DiffLayer, Log, Receipt, SealedBlock,
    SealedHeader, Transaction, B256, U256,
};
use trellis_storage::{schema, ChainDb, MemoryStore, WriteBatch};

/// Gas charged per test transaction.
pub const TEST_TX_GAS: u64 = 21_000;

fn wall_clock() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|delta| delta.as_secs()).unwrap_or_default()
}

/// A consensus engine for tests: structural checks plus a clock-skew bound,
/// with an optionally mocked clock so future-block promotion is testable
/// without sleeping.
#[derive(Debug)]
pub struct TestEngine {
    /// Seconds a header may be ahead of the clock before it is a future
    /// block.
    pub clock_skew: u64,
    clock: Option<Arc<AtomicU64>>,
}

impl Default for TestEngine {
    fn default() -> Self {
        Self { clock_skew: 15, clock: None }
    }
}

impl TestEngine {
    /// An engine reading the real wall clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine reading the given mock clock.
    pub fn with_clock(clock: Arc<AtomicU64>, clock_skew: u64) -> Self {
        Self { clock_skew, clock: Some(clock) }
    }

    fn now(&self) -> u64 {
        match &self.clock {
            Some(clock) => clock.load(Ordering::SeqCst),
            None => wall_clock(),
        }
    }
}

impl ConsensusEngine for TestEngine {
    fn verify_header(
        &self,
        _chain: &dyn HeaderReader,
        header: &SealedHeader,
        parent: Option<&SealedHeader>,
    ) -> Result<(), BlockError> {
        let Some(parent) = parent else { return Err(BlockError::UnknownAncestor) };
        if header.number != parent.number + 1 {
            return Err(BlockError::InvalidNumber { got: header.number, parent: parent.number });
        }
        if header.time > self.now() + self.clock_skew {
            return Err(BlockError::FutureBlock);
        }
        Ok(())
    }

    fn posa(&self) -> Option<&dyn PosaEngine> {
        None
    }
}

/// Derives the post-state root a [`TestProcessor`] will produce for a block.
pub fn expected_root(parent_root: B256, number: u64, tx_root: B256) -> B256 {
    let mut data = Vec::with_capacity(32 + 8 + 32);
    data.extend_from_slice(parent_root.as_slice());
    data.extend_from_slice(&number.to_be_bytes());
    data.extend_from_slice(tx_root.as_slice());
    keccak256(data)
}

/// A deterministic processor: one receipt with one log per transaction, a
/// diff-layer account entry per touched address, and a state root derived
/// from the parent root and the block contents.
#[derive(Debug, Default)]
pub struct TestProcessor;

impl Processor for TestProcessor {
    fn process(
        &self,
        block: &SealedBlock,
        parent_root: B256,
    ) -> Result<ProcessOutcome, BlockError> {
        let mut receipts = Vec::new();
        let mut logs = Vec::new();
        let mut accounts = Vec::new();
        for (index, tx) in block.body.transactions.iter().enumerate() {
            let log = Log {
                address: tx.to,
                topics: vec![tx.hash()],
                data: tx.input.clone(),
                block_number: block.number(),
                block_hash: block.hash(),
                tx_hash: tx.hash(),
                removed: false,
            };
            receipts.push(Receipt {
                success: true,
                cumulative_gas_used: TEST_TX_GAS * (index as u64 + 1),
                bloom: Default::default(),
                logs: vec![log.clone()],
            });
            logs.push(log);
            accounts.push(DiffAccount {
                account: keccak256(tx.to),
                blob: Bytes::copy_from_slice(tx.hash().as_slice()),
            });
        }
        let gas_used = TEST_TX_GAS * block.body.transactions.len() as u64;
        let preimages = block
            .body
            .transactions
            .iter()
            .map(|tx| (keccak256(tx.to), Bytes::copy_from_slice(tx.to.as_slice())))
            .collect();
        Ok(ProcessOutcome {
            root: expected_root(parent_root, block.number(), block.tx_root),
            receipts,
            logs,
            gas_used,
            diff: Some(DiffLayer { accounts, ..Default::default() }),
            preimages,
        })
    }
}

/// Builds the canonical test genesis: difficulty one, with a committed state
/// root derived from a fixed seed.
pub fn genesis_block() -> SealedBlock {
    let body = Body::default();
    let header = trellis_primitives::Header {
        number: 0,
        root: keccak256(b"genesis-state"),
        tx_root: body.compute_tx_root(),
        difficulty: U256::from(1u64),
        time: 0,
        extra: Bytes::from_static(b"test genesis"),
        ..Default::default()
    };
    Block { header, body }.seal_slow()
}

/// Parameters for one generated block.
#[derive(Debug, Clone)]
pub struct BlockParams {
    /// Header difficulty.
    pub difficulty: u64,
    /// Number of transactions to fabricate.
    pub txs: usize,
    /// Header timestamp; defaults to parent time + 1 when `None`.
    pub time: Option<u64>,
    /// Extra-data tag, distinguishing otherwise identical branches.
    pub extra: &'static [u8],
}

impl Default for BlockParams {
    fn default() -> Self {
        Self { difficulty: 2, txs: 0, time: None, extra: b"" }
    }
}

/// Generates one child block of `parent` whose state root matches what a
/// [`TestProcessor`] will compute for it.
pub fn make_block(parent: &SealedBlock, params: &BlockParams) -> SealedBlock {
    let number = parent.number() + 1;
    let transactions: Vec<Transaction> = (0..params.txs)
        .map(|index| Transaction {
            nonce: number * 1000 + index as u64,
            to: Address::from_slice(&parent.hash().as_slice()[..20]),
            value: U256::from(index as u64),
            // branch-specific payload so forked branches carry distinct txs
            input: Bytes::copy_from_slice(parent.hash().as_slice()),
        })
        .collect();
    let body = Body { transactions, uncles: vec![] };
    let tx_root = body.compute_tx_root();
    let header = trellis_primitives::Header {
        parent_hash: parent.hash(),
        number,
        root: expected_root(parent.root, number, tx_root),
        tx_root,
        difficulty: U256::from(params.difficulty),
        time: params.time.unwrap_or(parent.time + 1),
        extra: Bytes::from_static(params.extra),
    };
    Block { header, body }.seal_slow()
}

/// Generates `count` chained blocks on top of `parent`.
pub fn make_chain(parent: &SealedBlock, count: usize, params: BlockParams) -> Vec<SealedBlock> {
    let mut blocks = Vec::with_capacity(count);
    let mut parent = parent.clone();
    for _ in 0..count {
        let block = make_block(&parent, &params);
        parent = block.clone();
        blocks.push(block);
    }
    blocks
}

/// Writes the genesis block, its markers and its committed state into a
/// fresh database.
pub fn setup_genesis(db: &ChainDb, genesis: &SealedBlock) {
    let mut batch = WriteBatch::new();
    schema::write_block(&mut batch, genesis);
    schema::write_td(&mut batch, 0, genesis.hash(), genesis.difficulty);
    schema::write_canonical_hash(&mut batch, 0, genesis.hash());
    schema::write_state_blob(&mut batch, genesis.root, b"genesis".as_slice());
    schema::write_head_block_hash(&mut batch, genesis.hash());
    schema::write_head_header_hash(&mut batch, genesis.hash());
    schema::write_head_fast_block_hash(&mut batch, genesis.hash());
    db.write(batch).expect("genesis write");
}

/// A fully wired in-memory chain.
#[derive(Debug)]
pub struct TestChain {
    /// The backing database.
    pub db: ChainDb,
    /// The genesis block.
    pub genesis: SealedBlock,
    /// The chain manager under test.
    pub manager: Arc<ChainManager>,
}

impl TestChain {
    /// Builds a chain with the default configuration and engine.
    pub fn new() -> Self {
        Self::with_config(ChainConfig::default())
    }

    /// Builds a chain with the given configuration.
    pub fn with_config(config: ChainConfig) -> Self {
        Self::with_parts(config, Arc::new(TestEngine::new()), ChainDb::new(MemoryStore::new()))
    }

    /// Builds a chain from explicit parts; the database gets the genesis
    /// written if it has none.
    pub fn with_parts(
        config: ChainConfig,
        engine: Arc<dyn ConsensusEngine>,
        db: ChainDb,
    ) -> Self {
        let genesis = genesis_block();
        if schema::read_canonical_hash(&db, 0).expect("genesis probe").is_none() {
            setup_genesis(&db, &genesis);
        }
        let manager =
            ChainManager::new(db.clone(), config, engine, Arc::new(TestProcessor), None)
                .expect("chain manager");
        Self { db, genesis, manager }
    }
}

impl Default for TestChain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestChain {
    fn drop(&mut self) {
        self.manager.stop();
    }
}
