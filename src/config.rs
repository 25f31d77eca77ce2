//! ShardKV Configuration
//!
//! The static sharding plan shared by every node of the cluster. All nodes
//! must be started with the same file so they agree on key ownership.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main ShardKV configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardKvConfig {
    /// Every shard of the cluster
    #[serde(default)]
    pub shards: Vec<ShardConfig>,

    /// Request forwarding configuration
    #[serde(default)]
    pub forward: ForwardConfig,
}

/// Descriptor of a single shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Unique shard name, matched against `--shard` at startup
    pub name: String,

    /// Position of the shard in the partition plan
    pub idx: usize,

    /// HTTP address (host:port) the shard listens on
    pub address: String,

    /// Replica addresses for this shard
    #[serde(default)]
    pub replicas: Vec<String>,
}

/// Request forwarding configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// Deadline for a forwarded request in milliseconds (unset = wait for the owner)
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ForwardConfig {
    /// Get forward timeout as Duration
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl ShardKvConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ShardKvConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// Index contiguity and shard name resolution are checked when the
    /// [`ShardTable`](crate::shard::ShardTable) is built.
    pub fn validate(&self) -> crate::Result<()> {
        if self.shards.is_empty() {
            return Err(crate::Error::Config("at least one shard must be configured".into()));
        }

        for shard in &self.shards {
            if shard.name.is_empty() {
                return Err(crate::Error::Config(format!(
                    "shard with index {} has an empty name",
                    shard.idx
                )));
            }
            if shard.address.is_empty() {
                return Err(crate::Error::Config(format!(
                    "shard {} has an empty address",
                    shard.name
                )));
            }
        }

        Ok(())
    }

    /// Render a sample configuration with `count` shards on consecutive ports
    pub fn sample(count: usize, host: &str, base_port: u16) -> String {
        let mut out = String::from("# ShardKV static sharding configuration\n");
        out.push_str("# Every node must be started with the same file.\n");
        for idx in 0..count {
            out.push_str(&format!(
                "\n[[shards]]\nname = \"shard-{idx}\"\nidx = {idx}\naddress = \"{host}:{port}\"\n",
                port = base_port as usize + idx,
            ));
        }
        out.push_str("\n[forward]\n# timeout_ms = 5000\n");
        out
    }
}
