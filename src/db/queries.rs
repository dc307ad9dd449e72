//! Database queries

use super::{
    ChannelRequestHtlcModel, ChannelRequestModel, ChannelRequestStatus, Database,
    NewChannelRequest, NodeScidModel, PsbtFundingStateModel,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{
    params_from_iter,
    types::{Type, Value},
    OptionalExtension, Row,
};
use tracing::{debug, info};

const CHANNEL_REQUEST_COLUMNS: &str = "id, payment_hash, preimage, pending_chan_id, pubkey, amount_msat, scid, settled_msat, status, funding_amount, funding_tx_id, output_index, created_at, updated_at";

const HTLC_COLUMNS: &str = "id, channel_request_id, chan_id, htlc_id, amount_msat, is_settled, is_failed";

const PSBT_FUNDING_STATE_COLUMNS: &str = "id, node_id, base_psbt, psbt, funded_psbt, signed_psbt, signed_tx, funding_tx_id, expiry_date, is_failed, created_at";

fn blob_32(row: &Row<'_>, idx: usize) -> rusqlite::Result<[u8; 32]> {
    let bytes: Vec<u8> = row.get(idx)?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Blob,
            format!("expected 32 bytes, found {}", b.len()).into(),
        )
    })
}

fn channel_request_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelRequestModel> {
    let status: String = row.get(8)?;
    let status = status
        .parse::<ChannelRequestStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, e.into()))?;

    Ok(ChannelRequestModel {
        id: row.get(0)?,
        payment_hash: blob_32(row, 1)?,
        preimage: blob_32(row, 2)?,
        pending_chan_id: blob_32(row, 3)?,
        pubkey: row.get(4)?,
        amount_msat: row.get(5)?,
        scid: row.get::<_, i64>(6)? as u64,
        settled_msat: row.get(7)?,
        status,
        funding_amount: row.get(9)?,
        funding_tx_id: row.get(10)?,
        output_index: row.get::<_, Option<i64>>(11)?.map(|i| i as u32),
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn htlc_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelRequestHtlcModel> {
    Ok(ChannelRequestHtlcModel {
        id: row.get(0)?,
        channel_request_id: row.get(1)?,
        chan_id: row.get::<_, i64>(2)? as u64,
        htlc_id: row.get::<_, i64>(3)? as u64,
        amount_msat: row.get(4)?,
        is_settled: row.get(5)?,
        is_failed: row.get(6)?,
    })
}

fn psbt_funding_state_from_row(row: &Row<'_>) -> rusqlite::Result<PsbtFundingStateModel> {
    Ok(PsbtFundingStateModel {
        id: row.get(0)?,
        node_id: row.get(1)?,
        base_psbt: row.get(2)?,
        psbt: row.get(3)?,
        funded_psbt: row.get(4)?,
        signed_psbt: row.get(5)?,
        signed_tx: row.get(6)?,
        funding_tx_id: row.get(7)?,
        expiry_date: row.get(8)?,
        is_failed: row.get(9)?,
        created_at: row.get(10)?,
    })
}

/// Channel request queries
pub struct ChannelRequestQueries<'a> {
    db: &'a Database,
}

impl<'a> ChannelRequestQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new channel request in `REQUESTED` state
    pub async fn insert(&self, request: &NewChannelRequest) -> Result<ChannelRequestModel> {
        let now = Utc::now();
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO channel_requests (payment_hash, preimage, pending_chan_id, pubkey, amount_msat, scid, settled_msat, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?8)
            "#,
            rusqlite::params![
                &request.payment_hash[..],
                &request.preimage[..],
                &request.pending_chan_id[..],
                &request.pubkey,
                request.amount_msat,
                request.scid as i64,
                ChannelRequestStatus::Requested.as_str(),
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();

        info!(
            "DB: Inserted channel request: id={}, pubkey={}, amount_msat={}, scid={}",
            id, request.pubkey, request.amount_msat, request.scid
        );

        Ok(ChannelRequestModel {
            id,
            payment_hash: request.payment_hash,
            preimage: request.preimage,
            pending_chan_id: request.pending_chan_id,
            pubkey: request.pubkey.clone(),
            amount_msat: request.amount_msat,
            scid: request.scid,
            settled_msat: 0,
            status: ChannelRequestStatus::Requested,
            funding_amount: None,
            funding_tx_id: None,
            output_index: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn query_one(&self, filter: &str, params: Vec<Value>) -> Result<Option<ChannelRequestModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let sql = format!("SELECT {} FROM channel_requests WHERE {}", CHANNEL_REQUEST_COLUMNS, filter);
        let result = conn
            .query_row(&sql, params_from_iter(params), channel_request_from_row)
            .optional()?;
        Ok(result)
    }

    /// Get a channel request by ID
    pub async fn get_by_id(&self, id: i64) -> Result<Option<ChannelRequestModel>> {
        self.query_one("id = ?1", vec![Value::Integer(id)]).await
    }

    /// Get a channel request by payment hash
    pub async fn get_by_payment_hash(
        &self,
        payment_hash: &[u8; 32],
    ) -> Result<Option<ChannelRequestModel>> {
        self.query_one("payment_hash = ?1", vec![Value::Blob(payment_hash.to_vec())])
            .await
    }

    /// Get a channel request by its funding shim identifier
    pub async fn get_by_pending_chan_id(
        &self,
        pending_chan_id: &[u8; 32],
    ) -> Result<Option<ChannelRequestModel>> {
        self.query_one("pending_chan_id = ?1", vec![Value::Blob(pending_chan_id.to_vec())])
            .await
    }

    /// Get a channel request by remote pubkey and SCID alias
    pub async fn get_by_pubkey_and_scid(
        &self,
        pubkey: &str,
        scid: u64,
    ) -> Result<Option<ChannelRequestModel>> {
        self.query_one(
            "pubkey = ?1 AND scid = ?2",
            vec![Value::Text(pubkey.to_string()), Value::Integer(scid as i64)],
        )
        .await
    }

    /// Get a channel request by the channel point of its opened channel
    pub async fn get_by_channel_point(
        &self,
        funding_tx_id: &str,
        output_index: u32,
    ) -> Result<Option<ChannelRequestModel>> {
        self.query_one(
            "funding_tx_id = ?1 AND output_index = ?2",
            vec![
                Value::Text(funding_tx_id.to_string()),
                Value::Integer(output_index as i64),
            ],
        )
        .await
    }

    /// List channel requests by status
    pub async fn list_by_status(
        &self,
        status: ChannelRequestStatus,
    ) -> Result<Vec<ChannelRequestModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let sql = format!(
            "SELECT {} FROM channel_requests WHERE status = ?1 ORDER BY id",
            CHANNEL_REQUEST_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![status.as_str()], channel_request_from_row)?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        Ok(requests)
    }

    /// Persist the mutable fields of a channel request
    pub async fn update(&self, request: &ChannelRequestModel) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let updated = conn.execute(
            r#"
            UPDATE channel_requests
            SET settled_msat = ?1, status = ?2, funding_amount = ?3, funding_tx_id = ?4, output_index = ?5, updated_at = ?6
            WHERE id = ?7
            "#,
            rusqlite::params![
                request.settled_msat,
                request.status.as_str(),
                request.funding_amount,
                request.funding_tx_id.as_deref(),
                request.output_index.map(|i| i as i64),
                Utc::now(),
                request.id,
            ],
        )?;
        if updated == 0 {
            anyhow::bail!("channel request {} does not exist", request.id);
        }
        info!(
            "DB: Updated channel request: id={}, status={}, settled_msat={}/{}",
            request.id, request.status, request.settled_msat, request.amount_msat
        );
        Ok(())
    }

    /// Update the status of a channel request
    pub async fn update_status(&self, id: i64, status: ChannelRequestStatus) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE channel_requests SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status.as_str(), Utc::now(), id],
        )?;
        info!("DB: Updated channel request status: id={}, status={}", id, status);
        Ok(())
    }
}

/// Queries for HTLCs held on behalf of channel requests
pub struct ChannelRequestHtlcQueries<'a> {
    db: &'a Database,
}

impl<'a> ChannelRequestHtlcQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert an intercepted HTLC
    pub async fn insert(
        &self,
        channel_request_id: i64,
        chan_id: u64,
        htlc_id: u64,
        amount_msat: i64,
        is_failed: bool,
    ) -> Result<ChannelRequestHtlcModel> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO channel_request_htlcs (channel_request_id, chan_id, htlc_id, amount_msat, is_settled, is_failed)
            VALUES (?1, ?2, ?3, ?4, 0, ?5)
            "#,
            rusqlite::params![
                channel_request_id,
                chan_id as i64,
                htlc_id as i64,
                amount_msat,
                is_failed,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(
            "DB: Inserted channel request htlc: id={}, channel_request_id={}, circuit={}:{}, amount_msat={}",
            id, channel_request_id, chan_id, htlc_id, amount_msat
        );
        Ok(ChannelRequestHtlcModel {
            id,
            channel_request_id,
            chan_id,
            htlc_id,
            amount_msat,
            is_settled: false,
            is_failed,
        })
    }

    /// Get an HTLC of a channel request by its circuit key
    pub async fn get_by_circuit_key(
        &self,
        channel_request_id: i64,
        chan_id: u64,
        htlc_id: u64,
    ) -> Result<Option<ChannelRequestHtlcModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let sql = format!(
            "SELECT {} FROM channel_request_htlcs WHERE channel_request_id = ?1 AND chan_id = ?2 AND htlc_id = ?3",
            HTLC_COLUMNS
        );
        let result = conn
            .query_row(
                &sql,
                rusqlite::params![channel_request_id, chan_id as i64, htlc_id as i64],
                htlc_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// List every HTLC of a channel request
    pub async fn list(&self, channel_request_id: i64) -> Result<Vec<ChannelRequestHtlcModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let sql = format!(
            "SELECT {} FROM channel_request_htlcs WHERE channel_request_id = ?1 ORDER BY id",
            HTLC_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![channel_request_id], htlc_from_row)?;

        let mut htlcs = Vec::new();
        for row in rows {
            htlcs.push(row?);
        }
        Ok(htlcs)
    }

    /// List the HTLCs of a channel request that are still held
    pub async fn list_unsettled(&self, channel_request_id: i64) -> Result<Vec<ChannelRequestHtlcModel>> {
        let htlcs = self.list(channel_request_id).await?;
        Ok(htlcs.into_iter().filter(ChannelRequestHtlcModel::is_held).collect())
    }

    /// Persist the settled/failed flags of an HTLC
    pub async fn update(&self, htlc: &ChannelRequestHtlcModel) -> Result<()> {
        if htlc.is_settled && htlc.is_failed {
            anyhow::bail!("htlc {} cannot be both settled and failed", htlc.id);
        }
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE channel_request_htlcs SET is_settled = ?1, is_failed = ?2 WHERE id = ?3",
            rusqlite::params![htlc.is_settled, htlc.is_failed, htlc.id],
        )?;
        debug!(
            "DB: Updated channel request htlc: id={}, is_settled={}, is_failed={}",
            htlc.id, htlc.is_settled, htlc.is_failed
        );
        Ok(())
    }

    /// Mark every held HTLC of a channel request as failed
    pub async fn mark_failed_for_request(&self, channel_request_id: i64) -> Result<usize> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let updated = conn.execute(
            "UPDATE channel_request_htlcs SET is_failed = 1 WHERE channel_request_id = ?1 AND is_settled = 0 AND is_failed = 0",
            rusqlite::params![channel_request_id],
        )?;
        info!(
            "DB: Marked held htlcs failed: channel_request_id={}, count={}",
            channel_request_id, updated
        );
        Ok(updated)
    }
}

/// PSBT funding batch queries
pub struct PsbtFundingStateQueries<'a> {
    db: &'a Database,
}

impl<'a> PsbtFundingStateQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new funding batch
    pub async fn insert(
        &self,
        node_id: &str,
        base_psbt: &[u8],
        psbt: &[u8],
        expiry_date: DateTime<Utc>,
    ) -> Result<PsbtFundingStateModel> {
        let now = Utc::now();
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO psbt_funding_states (node_id, base_psbt, psbt, expiry_date, is_failed, created_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5)
            "#,
            rusqlite::params![node_id, base_psbt, psbt, expiry_date, now],
        )?;
        let id = conn.last_insert_rowid();
        info!(
            "DB: Inserted psbt funding state: id={}, node_id={}, expiry_date={}",
            id, node_id, expiry_date
        );
        Ok(PsbtFundingStateModel {
            id,
            node_id: node_id.to_string(),
            base_psbt: base_psbt.to_vec(),
            psbt: psbt.to_vec(),
            funded_psbt: None,
            signed_psbt: None,
            signed_tx: None,
            funding_tx_id: None,
            expiry_date,
            is_failed: false,
            created_at: now,
        })
    }

    async fn query_many(&self, filter: &str, params: Vec<Value>) -> Result<Vec<PsbtFundingStateModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let sql = format!(
            "SELECT {} FROM psbt_funding_states WHERE {} ORDER BY id",
            PSBT_FUNDING_STATE_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), psbt_funding_state_from_row)?;

        let mut states = Vec::new();
        for row in rows {
            states.push(row?);
        }
        Ok(states)
    }

    /// Get a funding batch by ID
    pub async fn get_by_id(&self, id: i64) -> Result<Option<PsbtFundingStateModel>> {
        Ok(self
            .query_many("id = ?1", vec![Value::Integer(id)])
            .await?
            .into_iter()
            .next())
    }

    /// Get the node's batch that is still accepting channel opens at `now`
    pub async fn get_unfunded(
        &self,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PsbtFundingStateModel>> {
        let states = self
            .query_many(
                "node_id = ?1 AND is_failed = 0 AND funded_psbt IS NULL",
                vec![Value::Text(node_id.to_string())],
            )
            .await?;
        Ok(states.into_iter().rev().find(|s| s.expiry_date > now))
    }

    /// List the node's batches that never completed funding and were not failed
    pub async fn list_unfinished(&self, node_id: &str) -> Result<Vec<PsbtFundingStateModel>> {
        self.query_many(
            "node_id = ?1 AND is_failed = 0 AND signed_tx IS NULL",
            vec![Value::Text(node_id.to_string())],
        )
        .await
    }

    /// List the node's signed batches whose publication was never recorded
    pub async fn list_unpublished(&self, node_id: &str) -> Result<Vec<PsbtFundingStateModel>> {
        self.query_many(
            "node_id = ?1 AND is_failed = 0 AND signed_tx IS NOT NULL AND funding_tx_id IS NULL",
            vec![Value::Text(node_id.to_string())],
        )
        .await
    }

    /// Get the batch that published the given transaction
    pub async fn get_by_funding_tx_id(&self, funding_tx_id: &str) -> Result<Option<PsbtFundingStateModel>> {
        Ok(self
            .query_many("funding_tx_id = ?1", vec![Value::Text(funding_tx_id.to_string())])
            .await?
            .into_iter()
            .next())
    }

    /// Persist the PSBT progress of a batch
    pub async fn update(&self, state: &PsbtFundingStateModel) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            r#"
            UPDATE psbt_funding_states
            SET psbt = ?1, funded_psbt = ?2, signed_psbt = ?3, signed_tx = ?4, funding_tx_id = ?5, is_failed = ?6
            WHERE id = ?7
            "#,
            rusqlite::params![
                &state.psbt,
                state.funded_psbt.as_deref(),
                state.signed_psbt.as_deref(),
                state.signed_tx.as_deref(),
                state.funding_tx_id.as_deref(),
                state.is_failed,
                state.id,
            ],
        )?;
        info!(
            "DB: Updated psbt funding state: id={}, funded={}, signed={}, is_failed={}",
            state.id,
            state.funded_psbt.is_some(),
            state.signed_tx.is_some(),
            state.is_failed
        );
        Ok(())
    }

    /// Link a channel request to a funding batch
    pub async fn link_channel_request(&self, psbt_funding_state_id: i64, channel_request_id: i64) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO psbt_funding_state_channel_requests (psbt_funding_state_id, channel_request_id)
            VALUES (?1, ?2)
            "#,
            rusqlite::params![psbt_funding_state_id, channel_request_id],
        )?;
        debug!(
            "DB: Linked channel request {} to psbt funding state {}",
            channel_request_id, psbt_funding_state_id
        );
        Ok(())
    }

    /// List the channel requests linked to a funding batch
    pub async fn list_channel_requests(&self, psbt_funding_state_id: i64) -> Result<Vec<ChannelRequestModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let columns = CHANNEL_REQUEST_COLUMNS
            .split(", ")
            .map(|c| format!("cr.{}", c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            SELECT {}
            FROM channel_requests cr
            JOIN psbt_funding_state_channel_requests link ON link.channel_request_id = cr.id
            WHERE link.psbt_funding_state_id = ?1
            ORDER BY cr.id
            "#,
            columns
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![psbt_funding_state_id], channel_request_from_row)?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        Ok(requests)
    }
}

/// Queries for the pre-allocated SCID pool
pub struct NodeScidQueries<'a> {
    db: &'a Database,
}

impl<'a> NodeScidQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Add an SCID alias to a node's pool
    pub async fn insert(&self, node_id: &str, scid: u64) -> Result<NodeScidModel> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT INTO node_scids (node_id, scid) VALUES (?1, ?2)",
            rusqlite::params![node_id, scid as i64],
        )?;
        let id = conn.last_insert_rowid();
        debug!("DB: Inserted node scid: id={}, node_id={}, scid={}", id, node_id, scid);
        Ok(NodeScidModel {
            id,
            node_id: node_id.to_string(),
            scid,
        })
    }

    /// Count the SCID aliases in a node's pool
    pub async fn count(&self, node_id: &str) -> Result<u32> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM node_scids WHERE node_id = ?1",
            rusqlite::params![node_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// Remove and return the oldest SCID alias of a node's pool in one transaction
    pub async fn pop(&self, node_id: &str) -> Result<Option<NodeScidModel>> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;
        let scid = tx
            .query_row(
                "SELECT id, node_id, scid FROM node_scids WHERE node_id = ?1 ORDER BY id LIMIT 1",
                rusqlite::params![node_id],
                |row| {
                    Ok(NodeScidModel {
                        id: row.get(0)?,
                        node_id: row.get(1)?,
                        scid: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()?;
        if let Some(ref scid) = scid {
            tx.execute("DELETE FROM node_scids WHERE id = ?1", rusqlite::params![scid.id])?;
        }
        tx.commit()?;
        Ok(scid)
    }
}
