//! HTTP API Server
//!
//! Key-value endpoints that route through the shard table, plus local
//! endpoints for cleanup, replication log access and health.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use percent_encoding::percent_decode;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::error::{Error, Result};
use crate::router::{Outcome, RemoteResponse, RequestRouter};

/// Shared application state
pub struct AppState {
    /// Name of the shard this process serves
    pub shard_name: String,
    /// Dispatcher for key-addressed requests
    pub router: RequestRouter,
}

/// HTTP API server
pub struct HttpServer {
    bind_address: String,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(bind_address: String, shard_name: String, router: RequestRouter) -> Self {
        let state = Arc::new(AppState { shard_name, router });
        Self {
            bind_address,
            state,
        }
    }

    /// Create the router
    pub fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            // Routed through the shard table
            .route("/get", get(handle_get))
            .route("/set", get(handle_set))
            // Local to this shard
            .route("/delete-extra", get(handle_delete_extra))
            .route("/next-replication-key", get(handle_next_replication_key))
            .route("/ack-replication", get(handle_ack_replication))
            .route("/health", get(handle_health))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the configured address and serve until the task is dropped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.bind_address);
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let app = Self::create_router(Arc::clone(&self.state));
        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;
        Ok(())
    }
}

// ============ Request/Response Types ============

/// Key and value of `/get` and `/set`, as raw bytes
///
/// Percent-escapes are decoded without assuming UTF-8, so `%FF` and `%FE`
/// stay distinct keys. A missing parameter is empty.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct KeyParams {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KeyParams {
    pub fn from_uri(uri: &Uri) -> Self {
        let query = uri.query().unwrap_or("");
        Self {
            key: query_param(query, b"key").unwrap_or_default(),
            value: query_param(query, b"value").unwrap_or_default(),
        }
    }
}

/// Query parameters of `/ack-replication`
#[derive(Debug, Deserialize)]
pub struct AckParams {
    pub seq: u64,
}

/// Get response
#[derive(Debug, Serialize, Deserialize)]
pub struct GetResponse {
    pub shard: usize,
    pub key: String,
    pub value: Option<String>,
    pub found: bool,
    pub error: Option<String>,
}

/// Set response
#[derive(Debug, Serialize, Deserialize)]
pub struct SetResponse {
    pub shard: usize,
    pub key: String,
    pub value: String,
    pub error: Option<String>,
}

/// Delete-extra response
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteExtraResponse {
    pub shard: usize,
    pub deleted: usize,
    pub error: Option<String>,
}

/// Replication log entry as exposed over HTTP
#[derive(Debug, Serialize, Deserialize)]
pub struct PendingEntryJson {
    pub seq: u64,
    pub key: String,
    pub value: String,
}

/// Next-replication-key response
#[derive(Debug, Serialize, Deserialize)]
pub struct PendingResponse {
    pub shard: usize,
    pub entry: Option<PendingEntryJson>,
    pub error: Option<String>,
}

/// Ack-replication response
#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub shard: usize,
    pub acknowledged: u64,
    pub error: Option<String>,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub shard_name: String,
    pub shard_index: usize,
    pub shard_count: usize,
    pub read_only: bool,
    pub records: u64,
    pub pending: u64,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// ============ Handlers ============

async fn handle_get(State(state): State<Arc<AppState>>, uri: Uri) -> Response {
    let shard = state.router.shards().current_index();
    let params = KeyParams::from_uri(&uri);
    match state.router.get(&params.key, request_uri(&uri)).await {
        Outcome::Local(Ok(value)) => (
            StatusCode::OK,
            Json(GetResponse {
                shard,
                key: lossy(&params.key),
                found: value.is_some(),
                value: value.as_deref().map(lossy),
                error: None,
            }),
        )
            .into_response(),
        Outcome::Local(Err(e)) => (
            error_status(&e),
            Json(GetResponse {
                shard,
                key: lossy(&params.key),
                value: None,
                found: false,
                error: Some(e.to_string()),
            }),
        )
            .into_response(),
        Outcome::Forwarded { response, .. } => relay(response),
    }
}

async fn handle_set(State(state): State<Arc<AppState>>, uri: Uri) -> Response {
    let shard = state.router.shards().current_index();
    let params = KeyParams::from_uri(&uri);
    let outcome = state
        .router
        .set(&params.key, &params.value, request_uri(&uri))
        .await;

    match outcome {
        Outcome::Local(result) => {
            let status = match &result {
                Ok(()) => StatusCode::OK,
                Err(e) => error_status(e),
            };
            (
                status,
                Json(SetResponse {
                    shard,
                    key: lossy(&params.key),
                    value: lossy(&params.value),
                    error: result.err().map(|e| e.to_string()),
                }),
            )
                .into_response()
        }
        Outcome::Forwarded { response, .. } => relay(response),
    }
}

async fn handle_delete_extra(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let shard = state.router.shards().current_index();
    match state.router.prune_foreign_keys().await {
        Ok(deleted) => (
            StatusCode::OK,
            Json(DeleteExtraResponse {
                shard,
                deleted,
                error: None,
            }),
        ),
        Err(e) => (
            error_status(&e),
            Json(DeleteExtraResponse {
                shard,
                deleted: 0,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn handle_next_replication_key(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let shard = state.router.shards().current_index();
    match state.router.engine().peek_oldest_pending().await {
        Ok(entry) => (
            StatusCode::OK,
            Json(PendingResponse {
                shard,
                entry: entry.map(|e| PendingEntryJson {
                    seq: e.seq,
                    key: lossy(&e.key),
                    value: lossy(&e.value),
                }),
                error: None,
            }),
        ),
        Err(e) => (
            error_status(&e),
            Json(PendingResponse {
                shard,
                entry: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn handle_ack_replication(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AckParams>,
) -> impl IntoResponse {
    let shard = state.router.shards().current_index();
    match state.router.engine().acknowledge_pending(params.seq).await {
        Ok(acknowledged) => (
            StatusCode::OK,
            Json(AckResponse {
                shard,
                acknowledged,
                error: None,
            }),
        ),
        Err(e) => (
            error_status(&e),
            Json(AckResponse {
                shard,
                acknowledged: 0,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    let engine = state.router.engine();
    let counts = async { Ok::<_, Error>((engine.record_count().await?, engine.pending_count().await?)) };

    match counts.await {
        Ok((records, pending)) => {
            let shards = state.router.shards();
            Json(HealthResponse {
                shard_name: state.shard_name.clone(),
                shard_index: shards.current_index(),
                shard_count: shards.count(),
                read_only: engine.is_read_only(),
                records,
                pending,
            })
            .into_response()
        }
        Err(e) => (
            error_status(&e),
            Json(ErrorResponse {
                error: e.to_string(),
                code: "STORAGE_ERROR".to_string(),
            }),
        )
            .into_response(),
    }
}

// ============ Helper Functions ============

/// Path and query of the inbound request, as it is forwarded
fn request_uri(uri: &Uri) -> &str {
    uri.path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path())
}

/// First value of `name` in a raw query string, percent-decoded to bytes
fn query_param(query: &str, name: &[u8]) -> Option<Vec<u8>> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .find(|(k, _)| decode_component(k) == name)
        .map(|(_, v)| decode_component(v))
}

/// Form decoding: `+` is a space, `%XX` is one raw byte
fn decode_component(s: &str) -> Vec<u8> {
    let plus_decoded: Vec<u8> = s.bytes().map(|b| if b == b'+' { b' ' } else { b }).collect();
    percent_decode(&plus_decoded).collect()
}

/// Display form of stored bytes in JSON bodies
fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn error_status(e: &Error) -> StatusCode {
    match e {
        Error::ReadOnly => StatusCode::FORBIDDEN,
        Error::Forward { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Relay the owning shard's response, or describe why it could not be reached
fn relay(response: Result<RemoteResponse>) -> Response {
    match response {
        Ok(remote) => {
            let status = StatusCode::from_u16(remote.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = (status, remote.body).into_response();
            if let Some(value) = remote
                .content_type
                .and_then(|ct| HeaderValue::from_str(&ct).ok())
            {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => (
            error_status(&e),
            Json(ErrorResponse {
                error: e.to_string(),
                code: "FORWARD_ERROR".to_string(),
            }),
        )
            .into_response(),
    }
}
