//! HTTP status surface: liveness of the partition workers and counters.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use orderflow_infra::pipeline::StatsSnapshot;
use orderflow_infra::BridgeStats;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub fn router(stats: Arc<BridgeStats>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stats", get(stats_snapshot))
        .with_state(stats)
}

/// 503 once any partition has halted; the bridge needs an operator then.
async fn healthz(State(stats): State<Arc<BridgeStats>>) -> impl IntoResponse {
    if stats.is_healthy() {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    } else {
        let halted: Vec<String> = stats
            .snapshot()
            .partitions
            .iter()
            .filter(|(_, status)| status.state == orderflow_infra::pipeline::PartitionState::Halted)
            .map(|(partition, _)| partition.to_string())
            .collect();
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "halted", "partitions": halted })),
        )
    }
}

async fn stats_snapshot(State(stats): State<Arc<BridgeStats>>) -> Json<StatsSnapshot> {
    Json(stats.snapshot())
}

/// Serve the status routes until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, stats: Arc<BridgeStats>, shutdown: CancellationToken) -> std::io::Result<()> {
    axum::serve(listener, router(stats))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
