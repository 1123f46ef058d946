//! HTTP API of a node
//!
//! - `GET  /protocol/discover`
//! - `POST /protocol/prepare`, `/protocol/commit`, `/protocol/rollback`, `/protocol/takeover`
//! - `GET  /health`
//!
//! Rejections travel as `200 OK` with an `AcceptRejectResponse` body; only
//! storage, corruption and internal failures produce an error status.

use crate::common::messages::{CommitMessage, PrepareMessage, RollbackMessage, TakeoverMessage};
use crate::node::protocol::ProtocolServer;
use crate::Error;
use axum::{
    extract::State,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Largest request body a node accepts.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct NodeHttpState {
    pub protocol: Arc<ProtocolServer>,
}

pub fn create_router(state: NodeHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/protocol/discover", get(discover))
        .route("/protocol/prepare", post(prepare))
        .route("/protocol/commit", post(commit))
        .route("/protocol/rollback", post(rollback))
        .route("/protocol/takeover", post(takeover))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Run a protocol call off the async runtime; the ledger blocks on fsync.
async fn blocking<T, F>(state: &NodeHttpState, f: F) -> Result<Json<T>, Error>
where
    T: Serialize + Send + 'static,
    F: FnOnce(&ProtocolServer) -> crate::Result<T> + Send + 'static,
{
    let protocol = state.protocol.clone();
    tokio::task::spawn_blocking(move || f(&protocol))
        .await
        .map_err(|e| Error::Internal(format!("protocol task failed: {}", e)))?
        .map(Json)
}

async fn health(State(state): State<NodeHttpState>) -> impl IntoResponse {
    blocking(&state, |p| {
        let prepared = p.has_incomplete_change()?;
        Ok(json!({
            "status": "healthy",
            "node": p.node_name(),
            "prepared": prepared,
            "version": crate::VERSION,
        }))
    })
    .await
}

async fn discover(State(state): State<NodeHttpState>) -> impl IntoResponse {
    blocking(&state, |p| p.discover()).await
}

async fn prepare(
    State(state): State<NodeHttpState>,
    Json(msg): Json<PrepareMessage>,
) -> impl IntoResponse {
    blocking(&state, move |p| p.prepare(&msg)).await
}

async fn commit(
    State(state): State<NodeHttpState>,
    Json(msg): Json<CommitMessage>,
) -> impl IntoResponse {
    blocking(&state, move |p| p.commit(&msg)).await
}

async fn rollback(
    State(state): State<NodeHttpState>,
    Json(msg): Json<RollbackMessage>,
) -> impl IntoResponse {
    blocking(&state, move |p| p.rollback(&msg)).await
}

async fn takeover(
    State(state): State<NodeHttpState>,
    Json(msg): Json<TakeoverMessage>,
) -> impl IntoResponse {
    blocking(&state, move |p| p.takeover(&msg)).await
}
