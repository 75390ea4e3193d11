//! Canonical-chain manager for the trellis node.
//!
//! The [`ChainManager`] ingests candidate blocks, validates and executes them
//! against a versioned world state, persists the results atomically,
//! maintains a reorganizable canonical history and exposes a consistent head
//! across concurrent readers and writers.
//!
//! Writers serialize on a single closable lock; readers never take it and
//! rely on the database's own consistency plus atomically swapped head
//! markers. A handful of background workers (future-block promotion, diff
//! layer persistence and pruning, transaction-index maintenance) share the
//! same data and take the writer lock only for short critical sections.

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

pub mod cache;
pub use cache::LruMap;

mod caches;

pub mod config;
pub use config::{CacheConfig, ChainConfig};

pub mod diff_layer;
pub use diff_layer::UntrustedDiffs;

pub mod engine;
pub use engine::{ConsensusEngine, HeaderReader, PosaEngine};

pub mod error;
pub use error::{BlockError, ChainError, ChainResult, InsertionError};

pub mod events;
pub use events::{
    BlockProcEvent, ChainBlockEvent, ChainEvent, ChainHeadEvent, ChainSideEvent,
    FinalizedHeaderEvent, LogsEvent, RemovedLogsEvent,
};

pub mod fork_choice;
pub use fork_choice::ForkChoice;

pub mod header_chain;
pub use header_chain::HeaderChain;

mod iterator;

pub mod manager;
pub use manager::ChainManager;

pub mod monitor;
pub use monitor::DoubleSignMonitor;

pub mod snapshot;
pub use snapshot::SnapshotTree;

pub mod state;
pub use state::StateCache;

pub mod sync;
pub use sync::{ClosableLock, WaitGroup};

pub mod traits;
pub use traits::{ChainValidator, ProcessOutcome, Processor, Validator};

mod indexer;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
