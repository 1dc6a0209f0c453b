//! HTTP surface: the WebSocket endpoint plus health and metrics
//!
//! - `GET /ws` - the bidirectional run channel
//! - `GET /health` - liveness probe
//! - `GET /metrics` - one JSON document with pipeline, pool, queue,
//!   network and subnet snapshots

use axum::http::HeaderValue;
use axum::{routing::get, Json, Router};
use coderunner_core::metrics::PipelineMetrics;
use coderunner_core::network::NetworkManager;
use coderunner_core::orchestrator::SessionOrchestrator;
use coderunner_core::pool::SessionPool;
use coderunner_core::queue::ExecutionQueue;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::ws;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SessionOrchestrator>,
    pub metrics: Arc<PipelineMetrics>,
    pub pool: Arc<SessionPool>,
    pub networks: Arc<NetworkManager>,
    pub queue: Arc<ExecutionQueue>,
}

/// Build the router with CORS and request tracing
pub fn build_router(state: AppState, cors_origins: &Option<Vec<String>>) -> Router {
    let cors = match cors_origins {
        Some(origins) => {
            let parsed: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(parsed))
                .allow_methods(Any)
                .allow_headers(Any)
        }
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    };

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<serde_json::Value> {
    let network_stats = state.networks.get_network_stats().await.ok();
    Json(json!({
        "pipeline": state.metrics.get_stats(),
        "pool": state.pool.get_metrics().await,
        "poolStats": state.pool.get_stats().await,
        "queue": state.queue.get_stats(),
        "network": state.networks.get_network_metrics(),
        "networkStats": network_stats,
        "subnets": state.networks.get_subnet_stats(),
        "sessions": state.orchestrator.session_count(),
    }))
}
