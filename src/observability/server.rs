//! Metrics server
//!
//! Small HTTP surface exposing the metrics summary and the current
//! dashboard snapshot on the configured port.

use anyhow::Result;
use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{DashboardFeed, ObservabilityManager};

#[derive(Clone)]
pub struct MetricsServerState {
    pub observability: Arc<ObservabilityManager>,
    pub dashboard: Arc<DashboardFeed>,
}

/// Build the router; split from `run` so tests can drive it directly.
pub fn metrics_router(state: MetricsServerState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(metrics_handler))
        .route("/dashboard", get(dashboard_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the metrics endpoints until the process exits.
pub async fn run_metrics_server(state: MetricsServerState, port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!("metrics server listening at http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, metrics_router(state)).await?;
    Ok(())
}

async fn metrics_handler(State(state): State<MetricsServerState>) -> Json<serde_json::Value> {
    Json(state.observability.metrics_summary().await)
}

async fn dashboard_handler(State(state): State<MetricsServerState>) -> Json<serde_json::Value> {
    let snapshot = state.dashboard.snapshot().await;
    Json(serde_json::to_value(snapshot).unwrap_or(serde_json::json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::ObservabilityConfig;

    #[tokio::test]
    async fn test_server_binds_and_reports_health() {
        let dir = tempfile::tempdir().unwrap();
        let state = MetricsServerState {
            observability: Arc::new(ObservabilityManager::new(ObservabilityConfig::record_all())),
            dashboard: Arc::new(DashboardFeed::new(dir.path())),
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = metrics_router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let body = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "OK");

        let metrics: serde_json::Value = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(metrics["total_metrics"], 0);
    }
}
