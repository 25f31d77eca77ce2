//! Request Router
//!
//! Decides for every key-addressed request whether this shard owns the key.
//! Owned keys are served from the local storage engine, everything else is
//! relayed as-is to the owning shard.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::shard::ShardTable;
use crate::storage::StorageEngine;

/// Where a key is served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    /// This process owns the key
    Local,
    /// Another shard owns the key
    Remote { shard: usize, address: &'a str },
}

/// Response of the owning shard, kept opaque
#[derive(Debug, Clone)]
pub struct RemoteResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Result of dispatching a request
#[derive(Debug)]
pub enum Outcome<T> {
    /// Executed against the local storage engine
    Local(Result<T>),
    /// Relayed to the owning shard
    Forwarded {
        shard: usize,
        response: Result<RemoteResponse>,
    },
}

/// HTTP client relaying requests to other shards
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    /// Create a forwarder; without a timeout a forward waits for the owner
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        // Shards talk to each other directly
        let mut builder = reqwest::Client::builder().no_proxy();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Issue `request_uri` (path and query) against `address` and return the
    /// response without interpreting it
    pub async fn forward(&self, address: &str, request_uri: &str) -> Result<RemoteResponse> {
        let url = format!("http://{}{}", address, request_uri);
        let failed = |e: reqwest::Error| Error::Forward {
            address: address.to_string(),
            reason: e.to_string(),
        };

        let response = self.client.get(&url).send().await.map_err(failed)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(failed)?;

        Ok(RemoteResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Stateless dispatcher over the local engine and the shard table
#[derive(Clone)]
pub struct RequestRouter {
    engine: Arc<StorageEngine>,
    shards: Arc<ShardTable>,
    forwarder: Forwarder,
}

impl RequestRouter {
    pub fn new(engine: Arc<StorageEngine>, shards: Arc<ShardTable>, forwarder: Forwarder) -> Self {
        Self {
            engine,
            shards,
            forwarder,
        }
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn shards(&self) -> &Arc<ShardTable> {
        &self.shards
    }

    /// Decide where `key` is served
    pub fn route(&self, key: &[u8]) -> Route<'_> {
        let (shard, address) = self.shards.owner(key);
        if shard == self.shards.current_index() {
            Route::Local
        } else {
            Route::Remote { shard, address }
        }
    }

    /// Read `key` locally or from its owner
    pub async fn get(&self, key: &[u8], request_uri: &str) -> Outcome<Option<Vec<u8>>> {
        match self.route(key) {
            Route::Local => Outcome::Local(self.engine.get(key).await),
            Route::Remote { shard, address } => self.forward(shard, address, request_uri).await,
        }
    }

    /// Write `key` locally or on its owner
    pub async fn set(&self, key: &[u8], value: &[u8], request_uri: &str) -> Outcome<()> {
        match self.route(key) {
            Route::Local => {
                let result = self.engine.set(key, value).await;
                if let Err(e) = &result {
                    tracing::warn!("Failed to set key {:?}: {}", String::from_utf8_lossy(key), e);
                }
                Outcome::Local(result)
            }
            Route::Remote { shard, address } => self.forward(shard, address, request_uri).await,
        }
    }

    /// Delete every local key this shard no longer owns
    ///
    /// Meant for cleanup after the shard count changed. Keys written while
    /// the scan runs may survive.
    pub async fn prune_foreign_keys(&self) -> Result<usize> {
        let shards = Arc::clone(&self.shards);
        let deleted = self
            .engine
            .delete_many(move |key| !shards.is_local(key))
            .await?;
        tracing::info!(
            "Deleted {} keys not owned by shard {}",
            deleted,
            self.shards.current_index()
        );
        Ok(deleted)
    }

    async fn forward<T>(&self, shard: usize, address: &str, request_uri: &str) -> Outcome<T> {
        tracing::info!(
            current_shard = self.shards.current_index(),
            redirected_shard = shard,
            "Incorrect shard, redirecting to correct shard"
        );

        let response = self.forwarder.forward(address, request_uri).await;
        if let Err(e) = &response {
            tracing::warn!("Failed to forward to shard {}: {}", shard, e);
        }
        Outcome::Forwarded { shard, response }
    }
}
