//! Configuration management for hold-lsp
//!
//! Configuration is loaded from a TOML file and then overridden by
//! environment variables.
//!
//! # Example Configuration File
//!
//! ```toml
//! [node]
//! data_dir = "/var/lib/hold-lsp"
//!
//! [lsp]
//! base_fee_msat = 1000
//! fee_rate_ppm = 10
//! time_lock_delta = 40
//! psbt_batch_timeout_secs = 30
//! htlc_resume_timeout_secs = 10
//! payment_timeout_secs = 30
//! scid_cache_size = 10
//!
//! [api]
//! bind_address = "0.0.0.0:8080"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node identity configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// LSP service configuration
    #[serde(default)]
    pub lsp: LspConfig,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local node state configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory for storing service state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("hold-lsp"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// LSP service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LspConfig {
    /// Base routing fee pushed onto newly opened channels (millisatoshis)
    #[serde(default = "default_base_fee_msat")]
    pub base_fee_msat: u64,

    /// Proportional routing fee pushed onto newly opened channels (ppm)
    #[serde(default = "default_fee_rate_ppm")]
    pub fee_rate_ppm: u64,

    /// CLTV delta pushed onto newly opened channels
    #[serde(default = "default_time_lock_delta")]
    pub time_lock_delta: u32,

    /// Length of a funding batch window (seconds)
    #[serde(default = "default_psbt_batch_timeout")]
    pub psbt_batch_timeout_secs: u64,

    /// Grace period between a channel opening and resuming its held HTLCs (seconds)
    #[serde(default = "default_htlc_resume_timeout")]
    pub htlc_resume_timeout_secs: u64,

    /// Time allowed to collect all payments of a channel request (seconds)
    #[serde(default = "default_payment_timeout")]
    pub payment_timeout_secs: u64,

    /// Number of SCID aliases kept pre-allocated
    #[serde(default = "default_scid_cache_size")]
    pub scid_cache_size: u32,

    /// Fee rate used when funding a batch PSBT (sat/vbyte)
    #[serde(default = "default_psbt_fee_rate")]
    pub psbt_fee_rate_sat_per_vbyte: u64,
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            base_fee_msat: default_base_fee_msat(),
            fee_rate_ppm: default_fee_rate_ppm(),
            time_lock_delta: default_time_lock_delta(),
            psbt_batch_timeout_secs: default_psbt_batch_timeout(),
            htlc_resume_timeout_secs: default_htlc_resume_timeout(),
            payment_timeout_secs: default_payment_timeout(),
            scid_cache_size: default_scid_cache_size(),
            psbt_fee_rate_sat_per_vbyte: default_psbt_fee_rate(),
        }
    }
}

fn default_base_fee_msat() -> u64 {
    1_000
}

fn default_fee_rate_ppm() -> u64 {
    10
}

fn default_time_lock_delta() -> u32 {
    40
}

fn default_psbt_batch_timeout() -> u64 {
    30
}

fn default_htlc_resume_timeout() -> u64 {
    10
}

fn default_payment_timeout() -> u64 {
    30
}

fn default_scid_cache_size() -> u32 {
    10
}

fn default_psbt_fee_rate() -> u64 {
    5
}

impl LspConfig {
    /// Funding batch window
    pub fn psbt_batch_timeout(&self) -> Duration {
        Duration::from_secs(self.psbt_batch_timeout_secs)
    }

    /// Delay before held HTLCs are resumed on a fresh channel
    pub fn htlc_resume_timeout(&self) -> Duration {
        Duration::from_secs(self.htlc_resume_timeout_secs)
    }

    /// Payment collection deadline
    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_timeout_secs)
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the API server to
    #[serde(default = "default_api_bind")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_bind(),
            enable_cors: true,
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL or path
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:hold-lsp.db".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Load configuration from the first config file found, then apply
    /// environment overrides
    pub async fn load() -> anyhow::Result<Self> {
        let config_paths = vec![
            PathBuf::from("./hold-lsp.toml"),
            PathBuf::from("/etc/hold-lsp/hold-lsp.toml"),
            dirs::config_dir()
                .map(|d| d.join("hold-lsp/hold-lsp.toml"))
                .unwrap_or_default(),
        ];

        let mut config = Config::default();
        for path in config_paths {
            if path.is_file() {
                info!("Loading configuration from: {}", path.display());
                let content = tokio::fs::read_to_string(&path).await?;
                config = toml::from_str(&content)?;
                break;
            }
        }

        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Override fields from environment-style variables supplied by `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("Ignoring invalid value for {}: {}", key, value);
                    None
                }
            }
        }

        if let Some(v) = parse("BASE_FEE_MSAT", lookup("BASE_FEE_MSAT")) {
            self.lsp.base_fee_msat = v;
        }
        if let Some(v) = parse("FEE_RATE_PPM", lookup("FEE_RATE_PPM")) {
            self.lsp.fee_rate_ppm = v;
        }
        if let Some(v) = parse("TIME_LOCK_DELTA", lookup("TIME_LOCK_DELTA")) {
            self.lsp.time_lock_delta = v;
        }
        if let Some(v) = parse("PSBT_BATCH_TIMEOUT", lookup("PSBT_BATCH_TIMEOUT")) {
            self.lsp.psbt_batch_timeout_secs = v;
        }
        if let Some(v) = parse("PBST_HTLC_RESUME_TIMEOUT", lookup("PBST_HTLC_RESUME_TIMEOUT")) {
            self.lsp.htlc_resume_timeout_secs = v;
        }
        if let Some(v) = parse("PAYMENT_TIMEOUT", lookup("PAYMENT_TIMEOUT")) {
            self.lsp.payment_timeout_secs = v;
        }
        if let Some(v) = parse("SCID_CACHE_SIZE", lookup("SCID_CACHE_SIZE")) {
            self.lsp.scid_cache_size = v;
        }
        if let Some(v) = parse("PSBT_FEE_RATE", lookup("PSBT_FEE_RATE")) {
            self.lsp.psbt_fee_rate_sat_per_vbyte = v;
        }
        if let Some(v) = lookup("DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = lookup("API_BIND_ADDRESS") {
            self.api.bind_address = v;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    /// Resolve the database URL, making it relative to data_dir if needed
    pub fn resolve_database_url(&self) -> String {
        let url = &self.database.url;

        if url.starts_with("sqlite:/") || url == "sqlite::memory:" {
            return url.clone();
        }

        let path = url.strip_prefix("sqlite:").unwrap_or(url);

        if std::path::Path::new(path).is_absolute() {
            return url.clone();
        }

        let db_path = self.node.data_dir.join(path);
        format!("sqlite:{}", db_path.display())
    }

    /// Get the API bind address
    pub fn api_bind_address(&self) -> String {
        self.api.bind_address.clone()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.lsp.fee_rate_ppm > 1_000_000 {
            return Err("Fee rate cannot exceed 100% (1,000,000 ppm)".to_string());
        }

        if self.lsp.psbt_batch_timeout_secs == 0 {
            return Err("PSBT batch timeout must be greater than zero".to_string());
        }

        if self.lsp.payment_timeout_secs == 0 {
            return Err("Payment timeout must be greater than zero".to_string());
        }

        if self.lsp.scid_cache_size == 0 {
            return Err("SCID cache size must be greater than zero".to_string());
        }

        if self.lsp.psbt_fee_rate_sat_per_vbyte == 0 {
            return Err("PSBT fee rate must be at least 1 sat/vbyte".to_string());
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(format!(
                "Invalid log format: {}. Must be one of: {:?}",
                self.logging.format, valid_formats
            ));
        }

        Ok(())
    }
}
