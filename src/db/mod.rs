//! Database module for hold-lsp
//!
//! This module handles persistent storage for:
//! - Channel requests and the HTLCs held for them
//! - PSBT funding batches and their channel requests
//! - Pre-allocated SCID aliases

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

mod models;
mod queries;

pub use models::*;
pub use queries::*;

/// Database connection pool
#[derive(Clone)]
pub struct Database {
    /// SQLite connection (wrapped in Arc<Mutex> for thread safety)
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Connect to the database
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!("Connecting to database at {}", database_url);

        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        // Ensure the directory exists for file-based databases
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Self::run_migrations(&conn)?;

        info!("Database connected successfully");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a fresh in-memory database
    pub async fn in_memory() -> anyhow::Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Run database migrations
    fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
        debug!("Running database migrations...");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS channel_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payment_hash BLOB NOT NULL UNIQUE,
                preimage BLOB NOT NULL,
                pending_chan_id BLOB NOT NULL UNIQUE,
                pubkey TEXT NOT NULL,
                amount_msat INTEGER NOT NULL,
                scid INTEGER NOT NULL,
                settled_msat INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                funding_amount INTEGER,
                funding_tx_id TEXT,
                output_index INTEGER,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_channel_requests_status
                ON channel_requests(status);
            CREATE INDEX IF NOT EXISTS idx_channel_requests_pubkey
                ON channel_requests(pubkey);

            CREATE TABLE IF NOT EXISTS channel_request_htlcs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_request_id INTEGER NOT NULL REFERENCES channel_requests(id),
                chan_id INTEGER NOT NULL,
                htlc_id INTEGER NOT NULL,
                amount_msat INTEGER NOT NULL,
                is_settled BOOLEAN NOT NULL DEFAULT 0,
                is_failed BOOLEAN NOT NULL DEFAULT 0,
                UNIQUE (channel_request_id, chan_id, htlc_id)
            );

            CREATE TABLE IF NOT EXISTS psbt_funding_states (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id TEXT NOT NULL,
                base_psbt BLOB NOT NULL,
                psbt BLOB NOT NULL,
                funded_psbt BLOB,
                signed_psbt BLOB,
                signed_tx BLOB,
                funding_tx_id TEXT,
                expiry_date DATETIME NOT NULL,
                is_failed BOOLEAN NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_psbt_funding_states_node
                ON psbt_funding_states(node_id, is_failed);

            CREATE TABLE IF NOT EXISTS psbt_funding_state_channel_requests (
                psbt_funding_state_id INTEGER NOT NULL REFERENCES psbt_funding_states(id),
                channel_request_id INTEGER NOT NULL REFERENCES channel_requests(id),
                PRIMARY KEY (psbt_funding_state_id, channel_request_id)
            );

            CREATE TABLE IF NOT EXISTS node_scids (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id TEXT NOT NULL,
                scid INTEGER NOT NULL UNIQUE
            );
            "#,
        )?;

        debug!("Database migrations completed");
        Ok(())
    }

    /// Get the database connection
    pub fn conn(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Close the database connection
    pub async fn close(&self) {
        info!("Closing database connection...");
        // The connection will be closed when the last Arc is dropped
        info!("Database connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_connect() {
        let db = Database::in_memory().await.unwrap();
        let conn_lock = db.conn();
        let conn = conn_lock.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE '%channel_request%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        // channel_requests, channel_request_htlcs, psbt_funding_state_channel_requests
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let conn_lock = db.conn();
        let conn = conn_lock.lock().await;
        Database::run_migrations(&conn).unwrap();
    }
}
