//! # HTTP Status API
//!
//! Read-only axum router for operators and monitoring. Served on the
//! metrics port next to `/metrics`.
//!
//! ## Endpoints
//!
//! | Method | Path              | Description                     |
//! |--------|-------------------|---------------------------------|
//! | GET    | `/health`         | Liveness probe                  |
//! | GET    | `/status`         | Node snapshot plus build info   |
//! | GET    | `/peers`          | Peer store records              |
//! | GET    | `/blocks/:index`  | Finalized block by index        |
//! | GET    | `/metrics`        | Prometheus exposition           |

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use kestrel_protocol::network::{NodeHandle, NodeQuery, NodeSnapshot, QueryAnswer};

use crate::metrics::{metrics_handler, SharedMetrics};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub node: NodeHandle,
    pub metrics: SharedMetrics,
}

/// Response payload for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    #[serde(flatten)]
    pub node: NodeSnapshot,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    let metrics = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state.metrics.clone());

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/peers", get(peers_handler))
        .route("/blocks/:index", get(block_handler))
        .with_state(state)
        .merge(metrics)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let now = Utc::now();
    Json(StatusResponse {
        version: state.version.clone(),
        started_at: state.started_at,
        uptime_secs: (now - state.started_at).num_seconds(),
        node: state.node.snapshot(),
    })
}

async fn peers_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.node.query(NodeQuery::Peers).await {
        Ok(QueryAnswer::Peers(peers)) => Json(peers).into_response(),
        Ok(other) => unavailable(format!("unexpected answer {other:?}")),
        Err(e) => unavailable(e.to_string()),
    }
}

async fn block_handler(State(state): State<AppState>, Path(index): Path<u64>) -> impl IntoResponse {
    match state.node.query(NodeQuery::BlockByIndex(index)).await {
        Ok(QueryAnswer::Block(Some(block))) => Json(block).into_response(),
        Ok(QueryAnswer::Block(None)) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("no block at index {index}"),
            }),
        )
            .into_response(),
        Ok(other) => unavailable(format!("unexpected answer {other:?}")),
        Err(e) => unavailable(e.to_string()),
    }
}

fn unavailable(error: String) -> axum::response::Response {
    (StatusCode::SERVICE_UNAVAILABLE, Json(ErrorResponse { error })).into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
