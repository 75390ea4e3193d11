//! Persistent store facade for the trellis chain core.
//!
//! The chain manager persists through three stores:
//!
//! * a live key-value store with atomic batch writes and ordered scans,
//! * an optional append-only *ancient* segment holding the frozen, canonical
//!   prefix of the chain,
//! * an optional secondary store for snapshot diff layers.
//!
//! [`ChainDb`] bundles the three; the [`schema`] module defines the key
//! layout and typed accessors over them.

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

pub mod ancient;
pub use ancient::{AncientBlock, AncientStore};

pub mod db;
pub use db::ChainDb;

pub mod error;
pub use error::StoreError;

pub mod kv;
pub use kv::{KeyValueStore, MemoryStore, WriteBatch};

pub mod schema;

/// Preferred size of a single write batch; larger batches are split.
pub const IDEAL_BATCH_SIZE: usize = 100 * 1024;
