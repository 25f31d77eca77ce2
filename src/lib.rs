//! ShardKV - Statically Sharded Key-Value Store
//!
//! Every node owns a fixed partition of the keyspace, chosen by hashing the
//! key against a static shard table that all nodes load from the same
//! configuration file. Requests for keys owned elsewhere are forwarded to the
//! owning node and its response is relayed unchanged.
//!
//! # Architecture
//!
//! - [`shard::ShardTable`]: the ownership function and shard addresses
//! - [`storage::StorageEngine`]: SQLite-backed records plus a replication log
//!   written in the same transaction as every record
//! - [`router::RequestRouter`]: local execution or forwarding per key
//! - [`api::HttpServer`]: the HTTP surface built on the router

pub mod config;
pub mod error;
pub mod shard;
pub mod storage;
pub mod router;
pub mod api;

pub use config::ShardKvConfig;
pub use error::{Error, Result};

