//! Chain manager configuration.

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use trellis_primitives::BlockHash;

/// Bound of the block body caches.
pub(crate) const BODY_CACHE_LIMIT: u32 = 256;
/// Bound of the full block cache.
pub(crate) const BLOCK_CACHE_LIMIT: u32 = 256;
/// Bound of the decoded diff-layer cache.
pub(crate) const DIFF_LAYER_CACHE_LIMIT: u32 = 1024;
/// Bound of the encoded diff-layer cache.
pub(crate) const DIFF_LAYER_ENCODED_CACHE_LIMIT: u32 = 256;
/// Bound of the per-block receipts cache.
pub(crate) const RECEIPTS_CACHE_LIMIT: u32 = 10000;
/// Bound of the transaction-lookup cache.
pub(crate) const TX_LOOKUP_CACHE_LIMIT: u32 = 1024;
/// Bound of the bad-block cache.
pub(crate) const MAX_BAD_BLOCK_LIMIT: u32 = 16;
/// Bound of the future-block cache.
pub(crate) const MAX_FUTURE_BLOCKS: u32 = 256;
/// Seconds ahead of the wall clock a block may be to still get queued.
pub(crate) const MAX_TIME_FUTURE_BLOCKS: u64 = 30;
/// Backstop for the root-threshold search during a head rewind.
pub(crate) const MAX_BEYOND_BLOCKS: u64 = 2048;

/// Interval of the trusted diff-layer persister.
pub(crate) const DIFF_FREEZER_RECHECK_INTERVAL: Duration = Duration::from_secs(3);
/// Interval of the untrusted diff-layer pruner.
pub(crate) const DIFF_PRUNE_RECHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Maximum distance above the head a queued diff layer may have.
pub(crate) const MAX_DIFF_QUEUE_DIST: u64 = 2048;
/// Maximum unique diff layers a peer may have responded with.
pub(crate) const MAX_DIFF_LIMIT: usize = 2048;
/// Maximum distance below the head an untrusted diff layer is kept.
pub(crate) const MAX_DIFF_FORK_DIST: u64 = 11;
/// Maximum unique diff layers a peer may have broadcast unsolicited.
pub(crate) const MAX_DIFF_LIMIT_FOR_BROADCAST: usize = 128;

/// Interval of the bad-block rewinder.
pub(crate) const REWIND_BAD_BLOCK_INTERVAL: Duration = Duration::from_secs(1);
/// Interval of the future-block promoter.
pub(crate) const FUTURE_BLOCK_INTERVAL: Duration = Duration::from_secs(5);
/// Time a bad block stays in the bad-block cache.
pub(crate) const BAD_BLOCK_CACHE_EXPIRE: Duration = Duration::from_secs(30 * 60);
/// Minimum spacing of progress reports during exports and imports.
pub(crate) const STATS_REPORT_LIMIT: Duration = Duration::from_secs(8);

/// Maximum blocks per batch when re-executing a heavy side chain.
pub(crate) const SIDE_CHAIN_BATCH_BLOCKS: usize = 2048;
/// Maximum accumulated body size per heavy side-chain batch.
pub(crate) const SIDE_CHAIN_BATCH_MEMORY: usize = 64 * 1024 * 1024;

/// Reorgs deeper than this are logged at warning level.
pub(crate) const LARGE_REORG_DEPTH: usize = 63;

/// Configuration of the trie caching and pruning behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Memory allowance (MB) for caching clean state reads.
    pub trie_clean_limit: usize,
    /// Disk journal for persisting the clean cache across restarts.
    pub trie_clean_journal: Option<PathBuf>,
    /// Period for dumping the clean cache to its journal. Sanitized to at
    /// least one minute.
    pub trie_clean_rejournal: Option<Duration>,
    /// Memory limit (MB) at which dirty state is flushed to disk.
    pub trie_dirty_limit: usize,
    /// Disables dirty caching entirely: every root is flushed (archive mode).
    pub trie_dirty_disabled: bool,
    /// Accumulated canonical processing time that forces a flush.
    pub trie_time_limit: Duration,
    /// Memory allowance (MB) for the snapshot tree; 0 disables snapshots.
    pub snapshot_limit: usize,
    /// Whether to persist trie-key preimages.
    pub preimages: bool,
    /// How many recent state roots are kept unflushed in memory.
    pub tries_in_memory: u64,
    /// Skip state storage entirely. Insecure.
    pub no_tries: bool,
    /// Block startup until the snapshot tree is constructed.
    pub snapshot_wait: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            trie_clean_limit: 256,
            trie_clean_journal: None,
            trie_clean_rejournal: None,
            trie_dirty_limit: 256,
            trie_dirty_disabled: false,
            trie_time_limit: Duration::from_secs(5 * 60),
            snapshot_limit: 256,
            preimages: false,
            tries_in_memory: 128,
            no_tries: false,
            snapshot_wait: true,
        }
    }
}

impl CacheConfig {
    /// Returns the rejournal period clamped to the one-minute minimum.
    pub fn sanitized_rejournal(&self) -> Option<Duration> {
        self.trie_clean_rejournal.map(|period| period.max(Duration::from_secs(60)))
    }
}

/// Top-level configuration of the chain manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    /// Trie cache and pruning configuration.
    pub cache: CacheConfig,
    /// Transaction index retention:
    /// * `Some(0)` retains all indices and regenerates missing ranges,
    /// * `Some(n)` retains indices for the most recent `n` blocks,
    /// * `None` disables maintenance but still indexes new blocks.
    pub tx_lookup_limit: Option<u64>,
    /// Persist trusted diff layers, deleting those more than this many
    /// blocks behind the one being persisted. `None` disables persistence.
    pub persist_diff_limit: Option<u64>,
    /// Commit state concurrently with validation; spawns the invalid-header
    /// rewinder.
    pub pipe_commit: bool,
    /// Watch head events for two proposals at the same height by the same
    /// proposer.
    pub double_sign_monitor: bool,
    /// Patch the block hash onto the logs of the trailing system-transaction
    /// receipts when caching them.
    pub patch_system_receipts: bool,
    /// Hashes that must never become canonical.
    pub bad_hashes: Vec<BlockHash>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retention_window() {
        assert_eq!(CacheConfig::default().tries_in_memory, 128);
    }

    #[test]
    fn rejournal_is_sanitized() {
        let config = CacheConfig {
            trie_clean_rejournal: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        assert_eq!(config.sanitized_rejournal(), Some(Duration::from_secs(60)));
        assert_eq!(CacheConfig::default().sanitized_rejournal(), None);
    }
}
