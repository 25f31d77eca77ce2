//! Shard Module
//!
//! Static partitioning of the keyspace across the configured shards.

mod table;

pub use table::{fnv1_64, ShardTable};
