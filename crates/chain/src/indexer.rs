//! Background transaction-index maintenance.

use crossbeam_channel::{bounded, select, Receiver};
use std::sync::{
    atomic::AtomicBool,
    Arc,
};
use tracing::{info, warn};
use trellis_primitives::BlockNumber;
use trellis_storage::{schema, ChainDb, StoreError, WriteBatch};

/// One round of index maintenance for the given head, honoring the retention
/// limit:
///
/// * `limit == 0` — retain everything, reindex any missing tail range,
/// * `limit == n` — keep `[head - n + 1, head]` indexed, unindex below.
pub(crate) fn index_blocks(
    db: &ChainDb,
    limit: u64,
    head: BlockNumber,
    interrupt: &AtomicBool,
) -> Result<(), StoreError> {
    match schema::read_tx_index_tail(db)? {
        // A fresh node that never ran with index pruning: establish the tail
        // and drop anything below it.
        None => {
            if limit == 0 || head < limit {
                let mut batch = WriteBatch::new();
                schema::write_tx_index_tail(&mut batch, 0);
                db.write(batch)
            } else {
                schema::unindex_transactions(db, 0, head - limit + 1, interrupt)
            }
        }
        Some(tail) => {
            if limit == 0 || head < limit {
                // everything must be indexed; backfill below the tail. The
                // chain may have been rewound below the old tail, so cap the
                // range at the head.
                if tail > 0 {
                    let end = tail.min(head + 1);
                    schema::index_transactions(db, 0, end, interrupt)
                } else {
                    Ok(())
                }
            } else if head - limit + 1 < tail {
                // window moved down (rewind): backfill the gap
                schema::index_transactions(db, head - limit + 1, tail, interrupt)
            } else {
                // window moved up: drop stale indices
                schema::unindex_transactions(db, tail, head - limit + 1, interrupt)
            }
        }
    }
}

/// The transaction-index maintainer worker.
///
/// Reindexes the ancient window once at startup, then runs one maintenance
/// task per head event, never overlapping tasks. On shutdown an active task
/// is awaited, not abandoned.
pub(crate) fn maintain_tx_index(
    db: ChainDb,
    limit: u64,
    ancients: u64,
    interrupt: Arc<AtomicBool>,
    head_rx: Receiver<BlockNumber>,
    quit: Receiver<()>,
) {
    // The node may have been opened over a pre-populated ancient store;
    // reconstruct the index window before serving any head events.
    if ancients > 0 {
        let from = if limit != 0 && ancients > limit { ancients - limit } else { 0 };
        if let Err(err) = schema::index_transactions(&db, from, ancients, &interrupt) {
            warn!(%err, "Failed to reindex ancient transactions");
        }
    }

    let (done_tx, done_rx) = bounded::<()>(1);
    let mut active = false;
    loop {
        select! {
            recv(head_rx) -> head => {
                let Ok(head) = head else { return };
                if active {
                    continue;
                }
                active = true;
                let db = db.clone();
                let interrupt = Arc::clone(&interrupt);
                let done_tx = done_tx.clone();
                std::thread::spawn(move || {
                    if let Err(err) = index_blocks(&db, limit, head, &interrupt) {
                        warn!(%err, head, "Transaction index maintenance failed");
                    }
                    let _ = done_tx.send(());
                });
            }
            recv(done_rx) -> _ => active = false,
            recv(quit) -> _ => {
                if active {
                    info!("Waiting for background transaction indexer to exit");
                    let _ = done_rx.recv();
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_primitives::{Block, Body, Header, Transaction};
    use trellis_storage::MemoryStore;

    fn chain_db(blocks: u64) -> ChainDb {
        let db = ChainDb::new(MemoryStore::new());
        let mut batch = WriteBatch::new();
        for number in 0..blocks {
            let body = Body {
                transactions: vec![Transaction { nonce: number, ..Default::default() }],
                uncles: vec![],
            };
            let header = Header { number, tx_root: body.compute_tx_root(), ..Default::default() };
            let block = Block { header, body }.seal_slow();
            schema::write_block(&mut batch, &block);
            schema::write_canonical_hash(&mut batch, number, block.hash());
            schema::write_tx_lookups(&mut batch, &block);
        }
        db.write(batch).unwrap();
        db
    }

    fn lookup(db: &ChainDb, nonce: u64) -> Option<BlockNumber> {
        let tx = Transaction { nonce, ..Default::default() };
        schema::read_tx_lookup(db, tx.hash()).unwrap()
    }

    #[test]
    fn window_advances_and_unindexes() {
        let db = chain_db(10);
        let interrupt = AtomicBool::new(false);
        // limit 4, head 9: only [6, 9] stays indexed
        index_blocks(&db, 4, 9, &interrupt).unwrap();
        assert_eq!(lookup(&db, 2), None);
        assert_eq!(lookup(&db, 6), Some(6));
        assert_eq!(schema::read_tx_index_tail(&db).unwrap(), Some(6));
    }

    #[test]
    fn rewind_backfills_missing_range() {
        let db = chain_db(10);
        let interrupt = AtomicBool::new(false);
        index_blocks(&db, 4, 9, &interrupt).unwrap();
        // head rewinds to 5: window is [2, 5], the gap gets reindexed
        index_blocks(&db, 4, 5, &interrupt).unwrap();
        assert_eq!(lookup(&db, 2), Some(2));
    }

    #[test]
    fn zero_limit_retains_everything() {
        let db = chain_db(6);
        let interrupt = AtomicBool::new(false);
        index_blocks(&db, 0, 5, &interrupt).unwrap();
        assert_eq!(lookup(&db, 0), Some(0));
        assert_eq!(schema::read_tx_index_tail(&db).unwrap(), Some(0));
    }
}
