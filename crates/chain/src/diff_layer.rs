//! Diff-layer bookkeeping: the trusted persistence queue and the untrusted
//! per-peer index.

use crate::config::{
    MAX_DIFF_FORK_DIST, MAX_DIFF_LIMIT, MAX_DIFF_LIMIT_FOR_BROADCAST, MAX_DIFF_QUEUE_DIST,
};
use parking_lot::{Mutex, RwLock};
use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap, HashSet},
};
use tracing::debug;
use trellis_primitives::{BlockHash, BlockNumber, DiffLayer, B256};

/// A trusted diff layer queued for persistence, ordered by block number
/// (lowest first) with a sequence number as tie-breaker.
#[derive(Debug)]
struct QueuedDiff {
    number: BlockNumber,
    seq: u64,
    diff: DiffLayer,
}

impl PartialEq for QueuedDiff {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number && self.seq == other.seq
    }
}

impl Eq for QueuedDiff {}

impl PartialOrd for QueuedDiff {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedDiff {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.number, self.seq).cmp(&(other.number, other.seq))
    }
}

/// Priority queue of locally produced diff layers awaiting persistence,
/// drained lowest-block-first by the persister worker.
#[derive(Debug, Default)]
pub(crate) struct TrustedDiffQueue {
    heap: Mutex<BinaryHeap<Reverse<QueuedDiff>>>,
    seq: Mutex<u64>,
}

impl TrustedDiffQueue {
    pub(crate) fn push(&self, diff: DiffLayer) {
        let mut seq = self.seq.lock();
        *seq += 1;
        self.heap.lock().push(Reverse(QueuedDiff { number: diff.number, seq: *seq, diff }));
    }

    /// Pops the lowest-numbered queued diff.
    pub(crate) fn pop(&self) -> Option<DiffLayer> {
        self.heap.lock().pop().map(|entry| entry.0.diff)
    }

    /// Pops the lowest-numbered diff only if `matured` accepts its number.
    pub(crate) fn pop_if(&self, matured: impl Fn(BlockNumber) -> bool) -> Option<DiffLayer> {
        let mut heap = self.heap.lock();
        if matured(heap.peek()?.0.number) {
            heap.pop().map(|entry| entry.0.diff)
        } else {
            None
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

#[derive(Debug, Default)]
struct UntrustedInner {
    /// blockHash -> diffHash -> diff
    by_block: HashMap<BlockHash, HashMap<B256, DiffLayer>>,
    /// diffHash -> blockHash
    diff_to_block: HashMap<B256, BlockHash>,
    /// diffHash -> peers that sent it
    diff_to_peers: HashMap<B256, HashSet<String>>,
    /// number -> blockHashes with diffs at that height
    by_number: HashMap<BlockNumber, HashSet<BlockHash>>,
    /// peer -> diffHashes received from it
    peer_to_diffs: HashMap<String, HashSet<B256>>,
}

/// Index of diff layers received from peers, pending verification.
///
/// Bounded per peer and pruned by distance from the chain head; everything
/// in here is untrusted and may be dropped at any time.
#[derive(Debug, Default)]
pub struct UntrustedDiffs {
    inner: RwLock<UntrustedInner>,
}

impl UntrustedDiffs {
    /// Admits a peer-supplied diff layer, applying the distance and
    /// per-peer accumulation bounds. Out-of-range or duplicate diffs are
    /// dropped silently.
    pub(crate) fn handle(
        &self,
        diff: DiffLayer,
        peer: &str,
        fulfilled: bool,
        current_height: BlockNumber,
    ) {
        if diff.number > current_height && diff.number - current_height > MAX_DIFF_QUEUE_DIST {
            debug!(peer, number = diff.number, "Diff layer too new, dropping");
            return;
        }
        if diff.number < current_height && current_height - diff.number > MAX_DIFF_FORK_DIST {
            debug!(peer, number = diff.number, "Diff layer too old, dropping");
            return;
        }
        let diff_hash = diff.diff_hash();

        let mut inner = self.inner.write();
        if inner.diff_to_block.get(&diff_hash) == Some(&diff.block_hash) {
            return;
        }
        let accumulated = inner.peer_to_diffs.get(peer).map(HashSet::len).unwrap_or(0);
        if !fulfilled && accumulated > MAX_DIFF_LIMIT_FOR_BROADCAST {
            debug!(peer, "Too many broadcast diff layers accumulated");
            return;
        }
        if accumulated > MAX_DIFF_LIMIT {
            debug!(peer, "Too many diff layers accumulated");
            return;
        }
        if !inner.peer_to_diffs.entry(peer.to_owned()).or_default().insert(diff_hash) {
            return;
        }
        inner.by_number.entry(diff.number).or_default().insert(diff.block_hash);
        inner.diff_to_peers.entry(diff_hash).or_default().insert(peer.to_owned());
        inner.diff_to_block.insert(diff_hash, diff.block_hash);
        inner.by_block.entry(diff.block_hash).or_default().insert(diff_hash, diff);
    }

    /// Returns a diff for `block_hash`, preferring one received from `peer`.
    pub(crate) fn get(&self, block_hash: BlockHash, peer: &str) -> Option<DiffLayer> {
        let inner = self.inner.read();
        let diffs = inner.by_block.get(&block_hash)?;
        if diffs.is_empty() {
            return None;
        }
        if !peer.is_empty() {
            if let Some(peer_diffs) = inner.peer_to_diffs.get(peer) {
                for (diff_hash, diff) in diffs {
                    if peer_diffs.contains(diff_hash) {
                        return Some(diff.clone());
                    }
                }
            }
        }
        diffs.values().next().cloned()
    }

    /// Removes every diff layer tied (through any peer) to the given diff
    /// hash. Used when a diff turns out invalid: everything its senders
    /// contributed becomes suspect.
    pub(crate) fn remove_for(&self, diff_hash: B256) {
        let mut inner = self.inner.write();
        let peers = inner.diff_to_peers.remove(&diff_hash).unwrap_or_default();
        let mut invalid = HashSet::new();
        invalid.insert(diff_hash);
        for peer in &peers {
            if let Some(diffs) = inner.peer_to_diffs.remove(peer) {
                invalid.extend(diffs);
            }
        }
        for diff_hash in invalid {
            inner.diff_to_peers.remove(&diff_hash);
            if let Some(block_hash) = inner.diff_to_block.remove(&diff_hash) {
                if let Some(diffs) = inner.by_block.get_mut(&block_hash) {
                    diffs.remove(&diff_hash);
                    if diffs.is_empty() {
                        inner.by_block.remove(&block_hash);
                    }
                }
            }
        }
    }

    /// Drops all diffs for blocks more than the fork distance behind the
    /// head, along with every index entry pointing at them.
    pub(crate) fn prune(&self, current_height: BlockNumber) {
        let mut inner = self.inner.write();
        let horizon = current_height.saturating_sub(MAX_DIFF_FORK_DIST);

        let stale_numbers: Vec<BlockNumber> =
            inner.by_number.keys().copied().filter(|number| *number < horizon).collect();
        let mut stale_blocks = HashSet::new();
        for number in stale_numbers {
            if let Some(hashes) = inner.by_number.remove(&number) {
                stale_blocks.extend(hashes);
            }
        }

        let mut stale_diffs = HashSet::new();
        for block_hash in stale_blocks {
            if let Some(diffs) = inner.by_block.remove(&block_hash) {
                for diff_hash in diffs.into_keys() {
                    stale_diffs.insert(diff_hash);
                    inner.diff_to_block.remove(&diff_hash);
                    inner.diff_to_peers.remove(&diff_hash);
                }
            }
        }
        inner.peer_to_diffs.retain(|_, diffs| {
            diffs.retain(|diff_hash| !stale_diffs.contains(diff_hash));
            !diffs.is_empty()
        });
    }

    /// Number of distinct blocks with pending untrusted diffs.
    pub fn len(&self) -> usize {
        self.inner.read().by_block.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_block.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_primitives::DiffAccount;

    fn diff(number: BlockNumber, tag: u8) -> DiffLayer {
        DiffLayer {
            block_hash: BlockHash::repeat_byte(tag),
            number,
            accounts: vec![DiffAccount { account: B256::repeat_byte(tag), ..Default::default() }],
            ..Default::default()
        }
    }

    #[test]
    fn trusted_queue_orders_by_number() {
        let queue = TrustedDiffQueue::default();
        queue.push(diff(9, 1));
        queue.push(diff(3, 2));
        queue.push(diff(6, 3));
        assert_eq!(queue.pop().unwrap().number, 3);
        assert_eq!(queue.pop().unwrap().number, 6);
        assert_eq!(queue.pop().unwrap().number, 9);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn trusted_queue_pop_if_respects_maturity() {
        let queue = TrustedDiffQueue::default();
        queue.push(diff(100, 1));
        assert!(queue.pop_if(|number| number <= 50).is_none());
        assert!(queue.pop_if(|number| number <= 100).is_some());
    }

    #[test]
    fn untrusted_dedupes_per_block() {
        let diffs = UntrustedDiffs::default();
        diffs.handle(diff(5, 1), "peer-a", true, 10);
        diffs.handle(diff(5, 1), "peer-a", true, 10);
        assert_eq!(diffs.len(), 1);
        assert!(diffs.get(BlockHash::repeat_byte(1), "peer-a").is_some());
    }

    #[test]
    fn untrusted_drops_out_of_range() {
        let diffs = UntrustedDiffs::default();
        diffs.handle(diff(5000, 1), "peer-a", true, 10);
        diffs.handle(diff(1, 2), "peer-a", true, 5000);
        assert!(diffs.is_empty());
    }

    #[test]
    fn prune_removes_beyond_fork_distance() {
        let diffs = UntrustedDiffs::default();
        diffs.handle(diff(100, 1), "peer-a", true, 100);
        diffs.handle(diff(95, 2), "peer-a", true, 100);
        diffs.prune(110);
        // 95 is below the 110 - 11 horizon, 100 is not
        assert!(diffs.get(BlockHash::repeat_byte(2), "").is_none());
        assert!(diffs.get(BlockHash::repeat_byte(1), "").is_some());
    }

    #[test]
    fn remove_for_poisons_contributing_peers() {
        let diffs = UntrustedDiffs::default();
        let bad = diff(5, 1);
        let bad_hash = bad.diff_hash();
        diffs.handle(bad, "peer-a", true, 10);
        diffs.handle(diff(6, 2), "peer-a", true, 10);
        diffs.handle(diff(7, 3), "peer-b", true, 10);
        diffs.remove_for(bad_hash);
        assert!(diffs.get(BlockHash::repeat_byte(1), "").is_none());
        assert!(diffs.get(BlockHash::repeat_byte(2), "").is_none());
        assert!(diffs.get(BlockHash::repeat_byte(3), "").is_some());
    }
}
