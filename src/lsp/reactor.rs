//! Channel event reactor
//!
//! Opened channels are matched to their channel request, given the LSP's
//! forwarding policy, and after a grace period the HTLCs held for the
//! request are resumed onto them.

use super::{circuit_key, LspContext};
use crate::db::{
    ChannelRequestHtlcQueries, ChannelRequestModel, ChannelRequestQueries, ChannelRequestStatus,
    PsbtFundingStateQueries,
};
use crate::metrics::HtlcOutcome;
use crate::node::{ChannelEvent, ChannelPoint, ChannelPolicyUpdate, OpenChannelEvent, TransactionDetails};
use crate::{LspError, LspResult};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reacts to channel lifecycle events and wallet transactions
pub struct ChannelEventReactor {
    ctx: Arc<LspContext>,
}

impl ChannelEventReactor {
    pub(crate) fn new(ctx: Arc<LspContext>) -> Self {
        Self { ctx }
    }

    /// Handle one channel event; errors are logged
    pub async fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open(open) => {
                let point = open.channel_point.clone();
                if let Err(e) = self.on_channel_open(open).await {
                    error!("Failed to handle open of channel {}: {}", point, e);
                }
            }
            ChannelEvent::Closed {
                remote_pubkey,
                channel_point,
            } => {
                info!("Channel {} with {} closed", channel_point, remote_pubkey);
                if let Err(e) = self.on_channel_closed(&channel_point).await {
                    error!("Failed to handle close of channel {}: {}", channel_point, e);
                }
                self.refresh_node_counts().await;
            }
            ChannelEvent::FullyResolved { channel_point } => {
                debug!("Channel {} fully resolved", channel_point);
                self.refresh_node_counts().await;
            }
            ChannelEvent::PendingOpen { channel_point } => {
                debug!("Channel {} pending open", channel_point)
            }
            ChannelEvent::Active { channel_point } => debug!("Channel {} active", channel_point),
            ChannelEvent::Inactive { channel_point } => debug!("Channel {} inactive", channel_point),
        }
    }

    async fn find_request(&self, open: &OpenChannelEvent) -> LspResult<Option<ChannelRequestModel>> {
        let requests = ChannelRequestQueries::new(&self.ctx.db);
        for scid in &open.alias_scids {
            let found = requests
                .get_by_pubkey_and_scid(&open.remote_pubkey, *scid)
                .await
                .map_err(|e| LspError::Database(format!("Failed to look up scid: {}", e)))?;
            if found.is_some() {
                return Ok(found);
            }
        }
        match open.pending_chan_id {
            Some(ref pending_chan_id) => requests
                .get_by_pending_chan_id(pending_chan_id)
                .await
                .map_err(|e| LspError::Database(format!("Failed to look up pending_chan_id: {}", e))),
            None => Ok(None),
        }
    }

    /// Record the opened channel and schedule the release of its HTLCs.
    ///
    /// Returns the release task when the channel belongs to a request.
    pub async fn on_channel_open(&self, open: OpenChannelEvent) -> LspResult<Option<JoinHandle<()>>> {
        let Some(found) = self.find_request(&open).await? else {
            debug!("Channel {} does not belong to a channel request", open.channel_point);
            return Ok(None);
        };

        {
            let _guard = self.ctx.locks.lock(found.id).await;
            let requests = ChannelRequestQueries::new(&self.ctx.db);
            let mut request = requests
                .get_by_id(found.id)
                .await
                .map_err(|e| LspError::Database(format!("Failed to get channel request: {}", e)))?
                .ok_or_else(|| LspError::Database(format!("Channel request {} vanished", found.id)))?;
            if request.status != ChannelRequestStatus::OpeningChannel {
                warn!(
                    "Channel {} opened for request {} in status {}, ignoring",
                    open.channel_point, request.id, request.status
                );
                return Ok(None);
            }

            request.funding_tx_id = Some(open.channel_point.funding_txid.clone());
            request.output_index = Some(open.channel_point.output_index);
            request.funding_amount = Some(open.capacity_sat as i64);
            requests
                .update(&request)
                .await
                .map_err(|e| LspError::Database(format!("Failed to update channel request: {}", e)))?;
            info!(
                "Channel {} opened for request {}: capacity={} sat",
                open.channel_point, request.id, open.capacity_sat
            );
        }

        let lsp = &self.ctx.config.lsp;
        let policy = ChannelPolicyUpdate {
            channel_point: open.channel_point.clone(),
            base_fee_msat: lsp.base_fee_msat,
            fee_rate_ppm: lsp.fee_rate_ppm,
            time_lock_delta: lsp.time_lock_delta,
        };
        if let Err(e) = self.ctx.gateway.update_channel_policy(policy).await {
            warn!("Failed to set policy of channel {}: {}", open.channel_point, e);
        }

        let ctx = self.ctx.clone();
        let request_id = found.id;
        let grace = lsp.htlc_resume_timeout();
        Ok(Some(tokio::spawn(async move {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            if let Err(e) = resume_htlcs(&ctx, request_id).await {
                error!("Failed to resume htlcs of request {}: {}", request_id, e);
            }
        })))
    }

    async fn on_channel_closed(&self, channel_point: &ChannelPoint) -> LspResult<()> {
        let request = ChannelRequestQueries::new(&self.ctx.db)
            .get_by_channel_point(&channel_point.funding_txid, channel_point.output_index)
            .await
            .map_err(|e| LspError::Database(format!("Failed to look up channel point: {}", e)))?;
        let Some(request) = request else {
            return Ok(());
        };

        let _guard = self.ctx.locks.lock(request.id).await;
        let current = ChannelRequestQueries::new(&self.ctx.db)
            .get_by_id(request.id)
            .await
            .map_err(|e| LspError::Database(format!("Failed to get channel request: {}", e)))?;
        if let Some(mut current) = current {
            if current.status == ChannelRequestStatus::OpeningChannel {
                self.ctx
                    .fail_request_locked(&mut current, "channel closed before htlcs were released")
                    .await?;
            }
        }
        Ok(())
    }

    async fn refresh_node_counts(&self) {
        match self.ctx.gateway.get_info().await {
            Ok(info) => {
                self.ctx
                    .metrics
                    .set_node_counts(info.num_active_channels, info.num_peers);
            }
            Err(e) => warn!("Failed to refresh node counters: {}", e),
        }
    }

    /// Log confirmations of published funding batches
    pub async fn handle_transaction(&self, tx: TransactionDetails) {
        let batch = PsbtFundingStateQueries::new(&self.ctx.db)
            .get_by_funding_tx_id(&tx.tx_hash)
            .await;
        match batch {
            Ok(Some(batch)) => info!(
                "Funding batch {} transaction {}: {} confirmations",
                batch.id, tx.tx_hash, tx.num_confirmations
            ),
            Ok(None) => debug!("Wallet transaction {}: {} sat", tx.tx_hash, tx.amount_sat),
            Err(e) => error!("Failed to look up transaction {}: {}", tx.tx_hash, e),
        }
    }
}

/// Resume every held HTLC of an opened channel's request and complete it
async fn resume_htlcs(ctx: &LspContext, request_id: i64) -> LspResult<()> {
    let _guard = ctx.locks.lock(request_id).await;
    let requests = ChannelRequestQueries::new(&ctx.db);
    let htlcs = ChannelRequestHtlcQueries::new(&ctx.db);

    let mut request = requests
        .get_by_id(request_id)
        .await
        .map_err(|e| LspError::Database(format!("Failed to get channel request: {}", e)))?
        .ok_or_else(|| LspError::Database(format!("Channel request {} vanished", request_id)))?;
    if request.status != ChannelRequestStatus::OpeningChannel {
        warn!(
            "Not resuming htlcs of request {} in status {}",
            request.id, request.status
        );
        return Ok(());
    }

    let held = htlcs
        .list_unsettled(request_id)
        .await
        .map_err(|e| LspError::Database(format!("Failed to list held htlcs: {}", e)))?;
    for mut htlc in held {
        ctx.resolver.resume(circuit_key(&htlc));
        htlc.is_settled = true;
        htlcs
            .update(&htlc)
            .await
            .map_err(|e| LspError::Database(format!("Failed to settle htlc: {}", e)))?;
        ctx.metrics.record_htlc(HtlcOutcome::Settled);
    }

    request.status = ChannelRequestStatus::Completed;
    requests
        .update(&request)
        .await
        .map_err(|e| LspError::Database(format!("Failed to complete channel request: {}", e)))?;
    info!("Channel request {} completed", request.id);
    Ok(())
}
