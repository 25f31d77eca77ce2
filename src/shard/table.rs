//! Shard Table
//!
//! Immutable per-process view of the static partition plan: how many shards
//! exist, which one this process owns, and where every shard lives.

use std::collections::BTreeMap;

use crate::config::ShardConfig;
use crate::error::{Error, Result};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1 hash of raw bytes.
///
/// Unseeded and independent of the toolchain, so every process computes the
/// same owner for a key. Existing deployments depend on this exact variant.
pub fn fnv1_64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        hash.wrapping_mul(FNV_PRIME) ^ u64::from(b)
    })
}

/// Routing view of the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardTable {
    /// Total number of shards
    count: usize,
    /// Index owned by this process
    current_index: usize,
    /// HTTP address of every shard, by index
    addrs: Vec<String>,
}

impl ShardTable {
    /// Build the table from the configured shards, resolving `current_shard`
    /// to the index this process owns.
    pub fn new(shards: &[ShardConfig], current_shard: &str) -> Result<Self> {
        let count = shards.len();
        let mut addrs = BTreeMap::new();
        let mut current_index = None;

        for shard in shards {
            if addrs.insert(shard.idx, shard.address.clone()).is_some() {
                return Err(Error::DuplicateShardIndex(shard.idx));
            }
            if shard.name == current_shard {
                if current_index.is_some() {
                    return Err(Error::DuplicateShardName(shard.name.clone()));
                }
                current_index = Some(shard.idx);
            }
        }

        if let Some(missing) = (0..count).find(|idx| !addrs.contains_key(idx)) {
            return Err(Error::MissingShardIndex(missing));
        }

        let current_index =
            current_index.ok_or_else(|| Error::UnknownShard(current_shard.to_string()))?;

        // Keys are exactly 0..count at this point
        Ok(Self {
            count,
            current_index,
            addrs: addrs.into_values().collect(),
        })
    }

    /// Shard index that owns `key`
    pub fn index(&self, key: &[u8]) -> usize {
        (fnv1_64(key) % self.count as u64) as usize
    }

    /// Whether `key` is owned by this process
    pub fn is_local(&self, key: &[u8]) -> bool {
        self.index(key) == self.current_index
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Address of the shard at `index`
    pub fn address(&self, index: usize) -> Option<&str> {
        self.addrs.get(index).map(String::as_str)
    }

    /// Owning shard of `key` together with its address
    pub fn owner(&self, key: &[u8]) -> (usize, &str) {
        let index = self.index(key);
        (index, &self.addrs[index])
    }

    /// All shard addresses ordered by index
    pub fn addresses(&self) -> impl Iterator<Item = (usize, &str)> {
        self.addrs.iter().enumerate().map(|(idx, addr)| (idx, addr.as_str()))
    }
}
