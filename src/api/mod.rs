//! HTTP API Module
//!
//! Provides the key-value HTTP surface of a shard.

mod http;

pub use http::{
    AckResponse, AppState, DeleteExtraResponse, GetResponse, HealthResponse, HttpServer,
    PendingEntryJson, PendingResponse, SetResponse,
};
