//! Health check and metrics endpoints

use super::{ApiResponse, ApiState};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use serde::Serialize;
use tracing::warn;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Lightning node identity, once connected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// Health check endpoint
pub async fn health_check(State(state): State<ApiState>) -> Json<ApiResponse<HealthResponse>> {
    let node_id = state.app.lsp_service.node_id();

    let response = HealthResponse {
        status: if node_id.is_some() { "healthy" } else { "starting" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_id,
    };

    Json(ApiResponse::success(response))
}

/// Prometheus text exposition of the LSP metrics
pub async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    match state.app.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::HtlcOutcome;
    use crate::test_utils::MockGateway;
    use crate::{Config, LspApp};
    use std::sync::Arc;

    async fn test_app() -> LspApp {
        let mut config = Config::default();
        config.database.url = "sqlite::memory:".to_string();
        LspApp::new(config, Arc::new(MockGateway::new())).await.unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_node_once_initialized() {
        let app = test_app().await;

        let Json(before) = health_check(State(ApiState { app: app.clone() })).await;
        let before = before.data.unwrap();
        assert_eq!(before.status, "starting");
        assert!(before.node_id.is_none());

        app.lsp_service.init().await.unwrap();
        let Json(after) = health_check(State(ApiState { app })).await;
        let after = after.data.unwrap();
        assert_eq!(after.status, "healthy");
        assert_eq!(after.node_id.as_deref(), Some("03lspnode"));
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let app = test_app().await;
        app.metrics.record_htlc(HtlcOutcome::Accepted);

        let response = metrics(State(ApiState { app })).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("lsp_channel_request_htlcs_total"));
    }
}
