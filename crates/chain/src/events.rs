//! Chain event feeds.
//!
//! Every feed is a multi-subscriber broadcast channel with a bounded queue;
//! subscribers that fall behind lose the oldest events, per channel policy.
//! Events for one insertion batch are published in block-number order, and
//! the terminal [`ChainHeadEvent`] fires at most once per batch.

use std::sync::Arc;
use tokio::sync::broadcast;
use trellis_primitives::{BlockHash, Log, SealedBlock, SealedHeader};

/// Queue capacity of every event feed.
pub const EVENT_CHANNEL_SIZE: usize = 256;

/// A block joined the canonical chain.
#[derive(Debug, Clone)]
pub struct ChainEvent {
    /// The canonical block.
    pub block: Arc<SealedBlock>,
    /// The block hash.
    pub hash: BlockHash,
    /// Logs emitted by the block.
    pub logs: Vec<Log>,
}

/// The canonical head moved. Fired once per insertion batch.
#[derive(Debug, Clone)]
pub struct ChainHeadEvent {
    /// The new head block.
    pub block: Arc<SealedBlock>,
}

/// A block finished processing, canonical or not.
#[derive(Debug, Clone)]
pub struct ChainBlockEvent {
    /// The processed block.
    pub block: Arc<SealedBlock>,
}

/// A block was written to a side chain, or dropped from the canonical chain
/// by a reorg.
#[derive(Debug, Clone)]
pub struct ChainSideEvent {
    /// The side-chain block.
    pub block: Arc<SealedBlock>,
}

/// Logs of blocks dropped by a reorg, flagged as removed.
#[derive(Debug, Clone)]
pub struct RemovedLogsEvent {
    /// The removed logs, newest block first.
    pub logs: Vec<Log>,
}

/// Logs that became canonical, either by insertion or by a reorg.
#[derive(Debug, Clone)]
pub struct LogsEvent {
    /// The live logs, in block order.
    pub logs: Vec<Log>,
}

/// Block processing started or stopped.
#[derive(Debug, Clone, Copy)]
pub struct BlockProcEvent {
    /// Whether processing is active.
    pub active: bool,
}

/// A new header was finalized by the fast-finality engine.
#[derive(Debug, Clone)]
pub struct FinalizedHeaderEvent {
    /// The finalized header.
    pub header: SealedHeader,
}

/// All event feeds of the chain manager.
///
/// Sends are fire-and-forget: a send with no live subscribers is dropped.
#[derive(Debug)]
pub(crate) struct EventFeeds {
    chain: broadcast::Sender<ChainEvent>,
    chain_head: broadcast::Sender<ChainHeadEvent>,
    chain_block: broadcast::Sender<ChainBlockEvent>,
    chain_side: broadcast::Sender<ChainSideEvent>,
    removed_logs: broadcast::Sender<RemovedLogsEvent>,
    logs: broadcast::Sender<LogsEvent>,
    block_proc: broadcast::Sender<BlockProcEvent>,
    finalized_header: broadcast::Sender<FinalizedHeaderEvent>,
}

impl EventFeeds {
    pub(crate) fn new() -> Self {
        Self {
            chain: broadcast::channel(EVENT_CHANNEL_SIZE).0,
            chain_head: broadcast::channel(EVENT_CHANNEL_SIZE).0,
            chain_block: broadcast::channel(EVENT_CHANNEL_SIZE).0,
            chain_side: broadcast::channel(EVENT_CHANNEL_SIZE).0,
            removed_logs: broadcast::channel(EVENT_CHANNEL_SIZE).0,
            logs: broadcast::channel(EVENT_CHANNEL_SIZE).0,
            block_proc: broadcast::channel(EVENT_CHANNEL_SIZE).0,
            finalized_header: broadcast::channel(EVENT_CHANNEL_SIZE).0,
        }
    }

    pub(crate) fn send_chain(&self, event: ChainEvent) {
        let _ = self.chain.send(event);
    }

    pub(crate) fn subscribe_chain(&self) -> broadcast::Receiver<ChainEvent> {
        self.chain.subscribe()
    }

    pub(crate) fn send_chain_head(&self, event: ChainHeadEvent) {
        let _ = self.chain_head.send(event);
    }

    pub(crate) fn subscribe_chain_head(&self) -> broadcast::Receiver<ChainHeadEvent> {
        self.chain_head.subscribe()
    }

    pub(crate) fn send_chain_block(&self, event: ChainBlockEvent) {
        let _ = self.chain_block.send(event);
    }

    pub(crate) fn subscribe_chain_block(&self) -> broadcast::Receiver<ChainBlockEvent> {
        self.chain_block.subscribe()
    }

    pub(crate) fn send_chain_side(&self, event: ChainSideEvent) {
        let _ = self.chain_side.send(event);
    }

    pub(crate) fn subscribe_chain_side(&self) -> broadcast::Receiver<ChainSideEvent> {
        self.chain_side.subscribe()
    }

    pub(crate) fn send_removed_logs(&self, event: RemovedLogsEvent) {
        let _ = self.removed_logs.send(event);
    }

    pub(crate) fn subscribe_removed_logs(&self) -> broadcast::Receiver<RemovedLogsEvent> {
        self.removed_logs.subscribe()
    }

    pub(crate) fn send_logs(&self, event: LogsEvent) {
        let _ = self.logs.send(event);
    }

    pub(crate) fn subscribe_logs(&self) -> broadcast::Receiver<LogsEvent> {
        self.logs.subscribe()
    }

    pub(crate) fn send_block_proc(&self, event: BlockProcEvent) {
        let _ = self.block_proc.send(event);
    }

    pub(crate) fn subscribe_block_proc(&self) -> broadcast::Receiver<BlockProcEvent> {
        self.block_proc.subscribe()
    }

    pub(crate) fn send_finalized_header(&self, event: FinalizedHeaderEvent) {
        let _ = self.finalized_header.send(event);
    }

    pub(crate) fn subscribe_finalized_header(&self) -> broadcast::Receiver<FinalizedHeaderEvent> {
        self.finalized_header.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_arrive_in_publication_order() {
        let feeds = EventFeeds::new();
        let mut rx = feeds.subscribe_block_proc();
        feeds.send_block_proc(BlockProcEvent { active: true });
        feeds.send_block_proc(BlockProcEvent { active: false });
        assert!(rx.try_recv().unwrap().active);
        assert!(!rx.try_recv().unwrap().active);
    }

    #[test]
    fn send_without_subscribers_is_fine() {
        let feeds = EventFeeds::new();
        feeds.send_chain_head(ChainHeadEvent { block: Arc::new(SealedBlock::default()) });
    }
}
