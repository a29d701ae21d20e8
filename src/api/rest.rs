// =============================================================================
// HTTP Endpoints — Axum 0.7
// =============================================================================
//
// The dashboard port serves three diagnostic endpoints alongside the
// WebSocket upgrade:
//   GET  /health   — overall status and counts
//   GET  /metrics  — counters and the prediction latency histogram
//   POST /predict  — run a market frame through the prediction gateway
//
// CORS is configured permissively for development; tighten
// `allowed_origins` in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::BridgeState;
use crate::protocol::messages::MarketFrame;

/// Build the dashboard router with CORS middleware and shared state.
pub fn router(state: Arc<BridgeState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/predict", post(predict))
        .route("/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<Arc<BridgeState>>) -> impl IntoResponse {
    Json(state.health_snapshot())
}

async fn metrics(State(state): State<Arc<BridgeState>>) -> impl IntoResponse {
    Json(state.metrics_snapshot())
}

/// Diagnostics path through the same gateway the host link uses.
async fn predict(
    State(state): State<Arc<BridgeState>>,
    Json(frame): Json<MarketFrame>,
) -> impl IntoResponse {
    if frame.instrument.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "instrument is required" })),
        )
            .into_response();
    }

    let frame = match frame.validate() {
        Ok(()) => frame,
        Err(reason) => match frame.sanitized() {
            Some(fixed) => fixed,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": reason })),
                )
                    .into_response();
            }
        },
    };

    let prediction = state.gateway.predict(&frame).await;
    state.metrics.record_latency_ms(prediction.processing_ms);
    Json(prediction).into_response()
}
