//! hold-lsp: a Lightning Service Provider that opens zero-conf channels
//! paid for by the very payment that needs them
//!
//! The LSP sits in front of a Lightning node and:
//!
//! - **Intercepts HTLCs** addressed to pre-allocated SCID aliases and holds
//!   them until the full requested amount arrived
//! - **Batches channel opens** into shared, PSBT-funded transactions
//! - **Releases the held HTLCs** onto the new channel once it is open
//! - **Fails back** payments that never complete or whose channel never opens
//! - **HTTP API** for creating channel requests and inspecting their state
//!
//! # Architecture
//!
//! 1. A [`node::LightningGateway`] implementation connects to the node
//! 2. [`lsp::LspService`] consumes the node's streams and drives every
//!    channel request through its lifecycle
//! 3. Channel requests, held HTLCs and funding batches live in SQLite
//!
#![warn(missing_docs)]

pub mod api;
pub mod config;
pub mod db;
pub mod lsp;
pub mod metrics;
pub mod node;

#[cfg(test)]
mod test_utils;

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

pub use config::Config;
use config::LoggingConfig;
use db::Database;
use metrics::Metrics;
use node::{GatewayError, LightningGateway};

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let result = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        _ => builder.pretty().with_thread_ids(true).try_init(),
    };
    if let Err(e) = result {
        warn!("Tracing subscriber already installed: {}", e);
    }
}

/// The main LSP application state
#[derive(Clone)]
pub struct LspApp {
    /// Application configuration
    pub config: Arc<Config>,
    /// Connection to the Lightning node
    pub gateway: Arc<dyn LightningGateway>,
    /// Database connection
    pub db: Arc<Database>,
    /// LSP service for channel requests
    pub lsp_service: Arc<lsp::LspService>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Shutdown signal for every background task
    pub shutdown: CancellationToken,
}

impl LspApp {
    /// Create a new LSP application instance
    pub async fn new(config: Config, gateway: Arc<dyn LightningGateway>) -> Result<Self> {
        info!("Initializing hold-lsp application...");

        config
            .validate()
            .map_err(|e| LspError::Config(format!("Invalid configuration: {}", e)))?;
        let config = Arc::new(config);

        let db_url = config.resolve_database_url();
        let db = Arc::new(Database::connect(&db_url).await?);

        let metrics = Metrics::new()?;
        let shutdown = CancellationToken::new();

        let lsp_service = Arc::new(lsp::LspService::new(
            config.clone(),
            db.clone(),
            gateway.clone(),
            metrics.clone(),
            shutdown.clone(),
        ));

        info!("hold-lsp application initialized successfully");

        Ok(Self {
            config,
            gateway,
            db,
            lsp_service,
            metrics,
            shutdown,
        })
    }

    /// Start the LSP application and run until [`shutdown`](Self::shutdown)
    pub async fn run(&self) -> Result<()> {
        info!("Starting hold-lsp application...");

        // Node identity, crash recovery, payment timeouts, SCID pool
        if let Err(e) = self.lsp_service.init().await {
            error!("Failed to initialize LSP service: {}", e);
            return Err(e.into());
        }

        let mut streams = self.lsp_service.start();

        let api_handle = tokio::spawn({
            let app = self.clone();
            let shutdown = self.shutdown.clone();
            async move {
                if let Err(e) = api::serve_with_shutdown(app, shutdown).await {
                    warn!("API server error: {}", e);
                }
            }
        });

        info!(
            "hold-lsp application running. API available at http://{}",
            self.config.api_bind_address()
        );

        let mut outcome = Ok(());
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                joined = streams.join_next() => match joined {
                    Some(Ok(Ok(()))) => continue,
                    Some(Ok(Err(e))) => {
                        error!("Lightning node stream failed, shutting down: {}", e);
                        outcome = Err(LspError::from(e).into());
                        self.shutdown.cancel();
                        break;
                    }
                    Some(Err(e)) => {
                        error!("Stream task failed: {}", e);
                        self.shutdown.cancel();
                        outcome = Err(e.into());
                        break;
                    }
                    None => break,
                },
            }
        }

        api_handle.await?;
        outcome
    }

    /// Shutdown the LSP application gracefully
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down hold-lsp application...");

        self.lsp_service.shutdown();
        self.db.close().await;

        info!("hold-lsp application shutdown complete");
        Ok(())
    }
}

/// Error types for the LSP application
#[derive(thiserror::Error, Debug)]
pub enum LspError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lightning node error
    #[error("Lightning node error: {0}")]
    Node(String),

    /// Lightning node gateway call failed
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// API error
    #[error("API error: {0}")]
    Api(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Channel operation error
    #[error("Channel error: {0}")]
    Channel(String),

    /// Funding batch error
    #[error("Funding error: {0}")]
    Funding(String),
}

impl From<GatewayError> for LspError {
    fn from(e: GatewayError) -> Self {
        LspError::Gateway(e.to_string())
    }
}

/// Result type alias for LSP operations
pub type LspResult<T> = std::result::Result<T, LspError>;
