//! End-to-end chain manager scenarios over an in-memory database.

use assert_matches::assert_matches;
use std::sync::Arc;
use trellis_chain::{
    manager::decode_exported_blocks,
    test_utils::{make_block, make_chain, BlockParams, TestChain},
    BlockError, CacheConfig, ChainConfig, ChainError, HeaderReader,
};
use trellis_primitives::{SealedBlock, U256};

fn diff(difficulty: u64) -> BlockParams {
    BlockParams { difficulty, ..Default::default() }
}

fn with_txs(difficulty: u64, txs: usize, extra: &'static [u8]) -> BlockParams {
    BlockParams { difficulty, txs, extra, ..Default::default() }
}

#[test]
fn linear_import_advances_head() {
    let chain = TestChain::new();
    let mut chain_events = chain.manager.subscribe_chain();
    let mut head_events = chain.manager.subscribe_chain_head();

    let blocks = make_chain(&chain.genesis, 3, diff(2));
    let inserted = chain.manager.insert_chain(blocks.clone()).unwrap();
    assert_eq!(inserted, 2); // index of the last processed block

    let head = chain.manager.current_block();
    assert_eq!(head.hash(), blocks[2].hash());
    assert_eq!(
        chain.manager.td(head.hash(), head.number()),
        Some(U256::from(7u64)) // genesis 1 + 3 * 2
    );

    // three chain events in number order, one accumulated head event
    for expected in &blocks {
        assert_eq!(chain_events.try_recv().unwrap().hash, expected.hash());
    }
    assert!(chain_events.try_recv().is_err());
    assert_eq!(head_events.try_recv().unwrap().block.hash(), blocks[2].hash());
    assert!(head_events.try_recv().is_err());

    // unbroken canonical mapping from genesis to head
    for (number, block) in blocks.iter().enumerate() {
        assert_eq!(chain.manager.canonical_hash(number as u64 + 1), Some(block.hash()));
    }
}

#[test]
fn higher_difficulty_branch_reorgs() {
    let chain = TestChain::new();
    let a_chain = make_chain(&chain.genesis, 2, with_txs(2, 1, b"a"));
    chain.manager.insert_chain(a_chain.clone()).unwrap();
    assert_eq!(chain.manager.current_block().hash(), a_chain[1].hash());

    let mut removed_logs = chain.manager.subscribe_removed_logs();
    let mut side_events = chain.manager.subscribe_chain_side();

    // TD 10 beats the canonical TD 5
    let b_chain = make_chain(&chain.genesis, 3, with_txs(3, 1, b"b"));
    chain.manager.insert_chain(b_chain.clone()).unwrap();

    let head = chain.manager.current_block();
    assert_eq!(head.hash(), b_chain[2].hash());
    for (index, block) in b_chain.iter().enumerate() {
        assert_eq!(chain.manager.canonical_hash(index as u64 + 1), Some(block.hash()));
    }

    // the removed logs cover exactly the dropped branch
    let removed = removed_logs.try_recv().unwrap().logs;
    assert_eq!(removed.len(), 2);
    assert!(removed.iter().all(|log| log.removed));

    // both dropped blocks surface as side events
    let mut dropped = Vec::new();
    while let Ok(event) = side_events.try_recv() {
        dropped.push(event.block.hash());
    }
    assert!(dropped.contains(&a_chain[0].hash()));
    assert!(dropped.contains(&a_chain[1].hash()));
}

#[test]
fn shared_transactions_survive_reorg() {
    let chain = TestChain::new();
    let a1 = make_block(&chain.genesis, &with_txs(2, 2, b"a"));
    chain.manager.insert_chain(vec![a1.clone()]).unwrap();

    // the competing block spends the same transactions (same parent, so the
    // generator fabricates identical payloads) at higher difficulty
    let b1 = make_block(&chain.genesis, &with_txs(5, 2, b"b"));
    chain.manager.insert_chain(vec![b1.clone()]).unwrap();
    assert_eq!(chain.manager.current_block().hash(), b1.hash());

    // the tx lookups must follow the new canonical block
    for tx in &b1.body.transactions {
        assert_eq!(chain.manager.tx_lookup(tx.hash()), Some(1));
    }
}

#[test]
fn inserting_known_head_is_idempotent() {
    let chain = TestChain::new();
    let blocks = make_chain(&chain.genesis, 3, diff(2));
    chain.manager.insert_chain(blocks.clone()).unwrap();

    let mut head_events = chain.manager.subscribe_chain_head();
    let before = chain.manager.current_block();
    chain.manager.insert_chain(vec![blocks[2].clone()]).unwrap();

    assert_eq!(chain.manager.current_block().hash(), before.hash());
    assert!(head_events.try_recv().is_err(), "no duplicate head event");
}

#[test]
fn non_contiguous_insert_is_rejected() {
    let chain = TestChain::new();
    let blocks = make_chain(&chain.genesis, 3, diff(2));
    let gapped = vec![blocks[0].clone(), blocks[2].clone()];

    let err = chain.manager.insert_chain(gapped).unwrap_err();
    assert_eq!(err.index, 0);
    assert_matches!(err.error, ChainError::NonContiguousInsert { .. });
    // nothing was written
    assert_eq!(chain.manager.current_block().hash(), chain.genesis.hash());
    assert_eq!(chain.manager.canonical_hash(1), None);
}

#[test]
fn far_future_block_is_rejected() {
    let chain = TestChain::new();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let far = make_block(
        &chain.genesis,
        &BlockParams { difficulty: 2, time: Some(now + 120), ..Default::default() },
    );

    let err = chain.manager.insert_chain(vec![far]).unwrap_err();
    assert_matches!(err.error, ChainError::Block(BlockError::TooFarInFuture { .. }));
}

#[test]
fn zero_difficulty_future_block_is_dropped_silently() {
    let chain = TestChain::new();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let pos_block = make_block(
        &chain.genesis,
        &BlockParams { difficulty: 0, time: Some(now + 20), ..Default::default() },
    );

    // accepted without error, but never queued
    chain.manager.insert_chain(vec![pos_block]).unwrap();
    assert_eq!(chain.manager.current_block().hash(), chain.genesis.hash());
}

#[test]
fn set_head_rewinds_to_stateful_block() {
    let config = ChainConfig {
        cache: CacheConfig { tries_in_memory: 4, ..Default::default() },
        ..Default::default()
    };
    let chain = TestChain::with_config(config);
    let blocks = make_chain(&chain.genesis, 10, diff(2));
    chain.manager.insert_chain(blocks.clone()).unwrap();

    // recent states are still in memory, the rewind stops right at the target
    chain.manager.set_head(8).unwrap();
    assert_eq!(chain.manager.current_block().number(), 8);
    assert_eq!(chain.manager.canonical_hash(9), None);
    assert_eq!(chain.manager.canonical_hash(10), None);

    // states below the retention window were pruned: rewinding into the gap
    // keeps going until a stateful block, which is genesis here
    chain.manager.set_head(3).unwrap();
    assert_eq!(chain.manager.current_block().number(), 0);
    assert_eq!(chain.manager.current_block().hash(), chain.genesis.hash());
}

#[test]
fn ghost_state_attack_is_rejected() {
    let config = ChainConfig {
        cache: CacheConfig { tries_in_memory: 4, ..Default::default() },
        ..Default::default()
    };
    let chain = TestChain::with_config(config);
    let blocks = make_chain(&chain.genesis, 10, diff(2));
    chain.manager.insert_chain(blocks.clone()).unwrap();

    // a forged sibling of block 5 claiming the canonical state root; its
    // parent (block 4) has had its state pruned, so this takes the
    // side-chain path
    let mut forged = make_block(&blocks[3], &with_txs(2, 0, b"forged")).unseal();
    forged.header.root = blocks[4].root;
    let forged = forged.seal_slow();
    assert_ne!(forged.hash(), blocks[4].hash());

    let err = chain.manager.insert_chain(vec![forged.clone()]).unwrap_err();
    assert_matches!(err.error, ChainError::Block(BlockError::GhostState));
    assert!(!chain.manager.has_block(forged.hash(), forged.number()));
}

#[test]
fn export_reset_import_roundtrip() {
    let chain = TestChain::new();
    let blocks = make_chain(&chain.genesis, 5, with_txs(2, 1, b"x"));
    chain.manager.insert_chain(blocks.clone()).unwrap();

    let head = chain.manager.current_block();
    let td = chain.manager.td(head.hash(), head.number()).unwrap();

    let mut exported = Vec::new();
    chain.manager.export(&mut exported).unwrap();

    chain.manager.reset().unwrap();
    assert_eq!(chain.manager.current_block().hash(), chain.genesis.hash());

    let decoded: Vec<SealedBlock> = decode_exported_blocks(&exported)
        .unwrap()
        .into_iter()
        .filter(|block| block.number() > 0)
        .collect();
    chain.manager.insert_chain(decoded).unwrap();

    let restored = chain.manager.current_block();
    assert_eq!(restored.hash(), head.hash());
    assert_eq!(chain.manager.td(restored.hash(), restored.number()), Some(td));
}

#[test]
fn export_range_validates_bounds() {
    let chain = TestChain::new();
    let mut sink = Vec::new();
    assert_matches!(
        chain.manager.export_range(&mut sink, 5, 1),
        Err(ChainError::InvalidExportRange { first: 5, last: 1 })
    );
}

#[test]
fn header_only_insertion_moves_the_header_chain() {
    let chain = TestChain::new();
    let blocks = make_chain(&chain.genesis, 4, diff(2));
    let headers = blocks.iter().map(|block| block.header.clone()).collect();

    chain.manager.insert_header_chain(headers, 1).unwrap();
    let hc = chain.manager.header_chain();
    assert_eq!(hc.current_header().unwrap().hash(), blocks[3].hash());
    // the block chain head did not move
    assert_eq!(chain.manager.current_block().hash(), chain.genesis.hash());
}

#[test]
fn set_chain_head_follows_inserted_blocks() {
    let chain = TestChain::new();
    let blocks = make_chain(&chain.genesis, 2, diff(2));
    for block in &blocks {
        chain.manager.insert_block_without_set_head(block.clone()).unwrap();
    }
    assert_eq!(chain.manager.current_block().hash(), chain.genesis.hash());

    chain.manager.set_chain_head(blocks[1].clone()).unwrap();
    assert_eq!(chain.manager.current_block().hash(), blocks[1].hash());
    assert_eq!(chain.manager.canonical_hash(1), Some(blocks[0].hash()));
}

#[test]
fn stopped_chain_rejects_writers() {
    let chain = TestChain::new();
    chain.manager.stop();
    let err = chain.manager.insert_chain(make_chain(&chain.genesis, 1, diff(2))).unwrap_err();
    assert_matches!(err.error, ChainError::ChainStopped);
    assert_matches!(chain.manager.set_head(0), Err(ChainError::ChainStopped));
}

#[test]
fn database_version_mismatch_forces_resync() {
    let chain = TestChain::new();
    let db = chain.db.clone();
    drop(chain);

    db.live().put(b"DatabaseVersion".to_vec(), 3u64.to_be_bytes().to_vec()).unwrap();
    let result = trellis_chain::ChainManager::new(
        db,
        ChainConfig::default(),
        Arc::new(trellis_chain::test_utils::TestEngine::new()),
        Arc::new(trellis_chain::test_utils::TestProcessor),
        None,
    );
    assert!(result.is_err());
}
