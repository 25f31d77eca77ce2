//! ShardKV Error Types

use thiserror::Error;

/// Result type alias for ShardKV operations
pub type Result<T> = std::result::Result<T, Error>;

/// ShardKV error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Duplicate shard index {0}")]
    DuplicateShardIndex(usize),

    #[error("Shard with index {0} not found in config")]
    MissingShardIndex(usize),

    #[error("Shard with name {0} not found")]
    UnknownShard(String),

    #[error("Shard name {0} is used by more than one shard")]
    DuplicateShardName(String),

    // Storage errors
    #[error("Database is read-only, setting keys is not supported")]
    ReadOnly,

    #[error("Storage error: {0}")]
    Storage(String),

    // Network errors
    #[error("Error redirecting the request to {address}: {reason}")]
    Forward { address: String, reason: String },

    #[error("Network error: {0}")]
    Network(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(format!("SQLite error: {}", e))
    }
}
