//! Storage Module
//!
//! Embedded transactional storage for the keys owned by this shard.

mod engine;

pub use engine::{PendingEntry, StorageEngine};
