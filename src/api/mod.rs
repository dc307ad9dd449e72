//! HTTP API for LSP services
//!
//! This module provides a RESTful API for:
//! - Creating channel requests
//! - Querying channel request status
//! - Health and Prometheus metrics

use crate::LspApp;
use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

mod channels;
mod health;

pub use channels::*;
pub use health::*;

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    /// The LSP application
    pub app: LspApp,
}

/// Build the API router
pub fn build_router(app: LspApp) -> Router {
    let enable_cors = app.config.api.enable_cors;
    let state = ApiState { app };

    let router = Router::new()
        // Operational endpoints
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        // Channel endpoints
        .route("/v1/channels", post(create_channel_request))
        .route("/v1/channels/:request_id", get(get_channel_request))
        .with_state(state);

    if enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Start the HTTP API server, stopping when `shutdown` fires
pub async fn serve_with_shutdown(app: LspApp, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = app
        .config
        .api_bind_address()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;
    let router = build_router(app);

    info!("Starting HTTP API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Received shutdown signal, stopping API server...");
        })
        .await?;

    info!("API server stopped gracefully");
    Ok(())
}

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Response data (only present if success is true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message (only present if success is false)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Convert LspError to HTTP status code
pub fn error_to_status_code(err: &crate::LspError) -> StatusCode {
    use crate::LspError;
    match err {
        LspError::Validation(_) => StatusCode::BAD_REQUEST,
        LspError::Channel(_) => StatusCode::CONFLICT,
        LspError::Node(_) => StatusCode::SERVICE_UNAVAILABLE,
        LspError::Gateway(_) => StatusCode::BAD_GATEWAY,
        LspError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        LspError::Funding(_) => StatusCode::INTERNAL_SERVER_ERROR,
        LspError::Api(_) => StatusCode::INTERNAL_SERVER_ERROR,
        LspError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
