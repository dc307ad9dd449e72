//! PSBT batch funding
//!
//! Channel opens arriving within one batch window share a single funding
//! transaction. The first open of a window creates the batch and arms its
//! timer; each open extends the batch PSBT with its channel output through a
//! PSBT funding shim. When the timer fires the batch is funded from the
//! wallet, verified and finalized by every pending channel, signed once and
//! published.
//!
//! All batch mutation runs under one node lock. Request locks are never
//! taken while it is held.

use super::LspContext;
use crate::db::{
    ChannelRequestHtlcQueries, ChannelRequestModel, ChannelRequestQueries, ChannelRequestStatus,
    PsbtFundingStateModel, PsbtFundingStateQueries,
};
use crate::node::{FundingStateStep, GatewayError, GatewayStream, OpenChannelRequest, OpenStatusUpdate, PsbtShim};
use crate::{LspError, LspResult};
use bitcoin::Transaction;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

struct BatchFailure {
    error: LspError,
    request_ids: Vec<i64>,
}

impl From<LspError> for BatchFailure {
    fn from(error: LspError) -> Self {
        Self {
            error,
            request_ids: Vec::new(),
        }
    }
}

/// Coordinates batched, PSBT-funded channel opens for the node
pub struct FundingCoordinator {
    ctx: Arc<LspContext>,
    node_lock: Mutex<()>,
}

impl FundingCoordinator {
    pub(crate) fn new(ctx: Arc<LspContext>) -> Self {
        Self {
            ctx,
            node_lock: Mutex::new(()),
        }
    }

    /// Enroll a channel open in the node's current funding batch, or a new one.
    ///
    /// Returns the ID of the batch. `request` must not carry a funding shim.
    pub async fn open_channel(
        self: &Arc<Self>,
        mut request: OpenChannelRequest,
        channel_request: &ChannelRequestModel,
    ) -> LspResult<i64> {
        if request.funding_shim.is_some() {
            return Err(LspError::Funding(
                "open channel request already carries a funding shim".to_string(),
            ));
        }

        let _node = self.node_lock.lock().await;
        let node_id = self.ctx.node_id()?.to_string();
        let batches = PsbtFundingStateQueries::new(&self.ctx.db);

        let batch = batches
            .get_unfunded(&node_id, Utc::now())
            .await
            .map_err(|e| LspError::Database(format!("Failed to get unfunded batch: {}", e)))?;

        let pending_chan_id = channel_request.pending_chan_id;
        request.funding_shim = Some(PsbtShim {
            pending_chan_id,
            base_psbt: batch.as_ref().map(|b| b.psbt.clone()).unwrap_or_default(),
            no_publish: true,
        });

        debug!(
            "Opening channel for request {}: funding={} sat, batch={:?}",
            channel_request.id,
            request.local_funding_amount,
            batch.as_ref().map(|b| b.id)
        );
        let updates = self.ctx.gateway.open_channel(request).await?;

        match self.enroll(&node_id, batch, channel_request.id, updates).await {
            Ok(batch_id) => Ok(batch_id),
            Err(e) => {
                self.cancel_shim(pending_chan_id).await;
                Err(e)
            }
        }
    }

    async fn enroll(
        self: &Arc<Self>,
        node_id: &str,
        batch: Option<PsbtFundingStateModel>,
        channel_request_id: i64,
        mut updates: GatewayStream<OpenStatusUpdate>,
    ) -> LspResult<i64> {
        let first = tokio::select! {
            _ = self.ctx.cancel.cancelled() => {
                return Err(LspError::Funding("shutting down".to_string()));
            }
            first = updates.next() => first,
        };
        let psbt = match first {
            Some(Ok(OpenStatusUpdate::PsbtFund { psbt, .. })) => psbt,
            Some(Ok(other)) => return Err(GatewayError::UnexpectedUpdate(format!("{:?}", other)).into()),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(GatewayError::StreamClosed.into()),
        };
        self.drain_updates(channel_request_id, updates);

        let batches = PsbtFundingStateQueries::new(&self.ctx.db);
        let batch_id = match batch {
            Some(mut batch) => {
                batch.psbt = psbt;
                batches
                    .update(&batch)
                    .await
                    .map_err(|e| LspError::Database(format!("Failed to update funding batch: {}", e)))?;
                batch.id
            }
            None => {
                let window = self.ctx.config.lsp.psbt_batch_timeout();
                let expiry = Utc::now()
                    + chrono::Duration::from_std(window)
                        .map_err(|e| LspError::Config(format!("Invalid batch timeout: {}", e)))?;
                let batch = batches
                    .insert(node_id, &[], &psbt, expiry)
                    .await
                    .map_err(|e| LspError::Database(format!("Failed to create funding batch: {}", e)))?;
                self.schedule_settlement(batch.id, window);
                batch.id
            }
        };

        batches
            .link_channel_request(batch_id, channel_request_id)
            .await
            .map_err(|e| LspError::Database(format!("Failed to link channel request: {}", e)))?;

        info!(
            "Channel request {} enrolled in funding batch {}",
            channel_request_id, batch_id
        );
        Ok(batch_id)
    }

    /// Keep consuming an open's updates so the node keeps the flow alive
    fn drain_updates(&self, channel_request_id: i64, mut updates: GatewayStream<OpenStatusUpdate>) {
        let cancel = self.ctx.cancel.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = updates.next() => next,
                };
                match next {
                    Some(Ok(update)) => {
                        debug!("Open update for request {}: {:?}", channel_request_id, update)
                    }
                    Some(Err(e)) => {
                        warn!("Open update stream of request {} failed: {}", channel_request_id, e);
                        break;
                    }
                    None => break,
                }
            }
        });
    }

    fn schedule_settlement(self: &Arc<Self>, batch_id: i64, window: Duration) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = coordinator.ctx.cancel.cancelled() => {
                    info!("Funding batch {} abandoned on shutdown", batch_id);
                }
                _ = tokio::time::sleep(window) => {
                    if let Err(e) = coordinator.fund_psbt(batch_id).await {
                        error!("Funding batch {} was not published: {}", batch_id, e);
                    }
                }
            }
        });
    }

    /// Fund, sign and publish a batch; returns the funding transaction ID.
    ///
    /// If the batch fails before it is published, it is marked failed, its
    /// pending channels are cancelled and its channel requests fail.
    pub async fn fund_psbt(&self, batch_id: i64) -> LspResult<String> {
        let outcome = {
            let _node = self.node_lock.lock().await;
            self.settle_locked(batch_id).await
        };

        match outcome {
            Ok(txid) => Ok(txid),
            Err(failure) => {
                for request_id in &failure.request_ids {
                    if let Err(e) = self.ctx.fail_request(*request_id, "funding batch failed").await {
                        error!("Failed to fail channel request {}: {}", request_id, e);
                    }
                }
                Err(failure.error)
            }
        }
    }

    async fn settle_locked(&self, batch_id: i64) -> Result<String, BatchFailure> {
        let batches = PsbtFundingStateQueries::new(&self.ctx.db);
        let mut batch = batches
            .get_by_id(batch_id)
            .await
            .map_err(|e| LspError::Database(format!("Failed to get funding batch: {}", e)))?
            .ok_or_else(|| LspError::Funding(format!("Funding batch {} not found", batch_id)))?;
        if !batch.is_open() {
            return Err(LspError::Funding(format!("Funding batch {} is already settled", batch_id)).into());
        }

        let requests = batches
            .list_channel_requests(batch_id)
            .await
            .map_err(|e| LspError::Database(format!("Failed to list batch requests: {}", e)))?;
        info!("Funding batch {} with {} channels", batch_id, requests.len());

        match self.sign_and_publish(&mut batch, &requests).await {
            Ok(txid) => {
                if let Err(e) = batches.update(&batch).await {
                    error!(
                        "Funding batch {} published as {} but not recorded, republishing on restart: {}",
                        batch_id, txid, e
                    );
                }
                self.ctx.metrics.record_batch(true);
                info!("Funding batch {} published: txid={}", batch_id, txid);
                Ok(txid)
            }
            Err(error) => {
                error!("Funding batch {} failed: {}", batch_id, error);
                batch.is_failed = true;
                if let Err(e) = batches.update(&batch).await {
                    error!("Failed to mark funding batch {} failed: {}", batch_id, e);
                }
                for request in &requests {
                    self.cancel_shim(request.pending_chan_id).await;
                }
                self.ctx.metrics.record_batch(false);
                Err(BatchFailure {
                    error,
                    request_ids: requests.iter().map(|r| r.id).collect(),
                })
            }
        }
    }

    async fn sign_and_publish(
        &self,
        batch: &mut PsbtFundingStateModel,
        requests: &[ChannelRequestModel],
    ) -> LspResult<String> {
        let gateway = &self.ctx.gateway;
        let fee_rate = self.ctx.config.lsp.psbt_fee_rate_sat_per_vbyte;

        let funded = gateway.fund_psbt(batch.psbt.clone(), fee_rate).await?;
        batch.funded_psbt = Some(funded.funded_psbt.clone());

        for request in requests {
            gateway
                .funding_state_step(FundingStateStep::PsbtVerify {
                    pending_chan_id: request.pending_chan_id,
                    funded_psbt: funded.funded_psbt.clone(),
                    skip_finalize: false,
                })
                .await?;
        }

        let finalized = gateway.finalize_psbt(funded.funded_psbt).await?;
        let tx: Transaction = bitcoin::consensus::deserialize(&finalized.raw_final_tx)
            .map_err(|e| LspError::Funding(format!("Invalid signed transaction: {}", e)))?;
        let txid = tx.compute_txid().to_string();
        batch.signed_psbt = Some(finalized.signed_psbt.clone());
        batch.signed_tx = Some(finalized.raw_final_tx.clone());

        for request in requests {
            gateway
                .funding_state_step(FundingStateStep::PsbtFinalize {
                    pending_chan_id: request.pending_chan_id,
                    signed_psbt: finalized.signed_psbt.clone(),
                })
                .await?;
        }

        // Once signed, a batch is republished on restart rather than failed
        PsbtFundingStateQueries::new(&self.ctx.db)
            .update(batch)
            .await
            .map_err(|e| LspError::Database(format!("Failed to record signed batch: {}", e)))?;

        gateway
            .publish_transaction(finalized.raw_final_tx, format!("hold-lsp funding batch {}", batch.id))
            .await?;
        batch.funding_tx_id = Some(txid.clone());
        Ok(txid)
    }

    async fn cancel_shim(&self, pending_chan_id: [u8; 32]) {
        let step = FundingStateStep::ShimCancel { pending_chan_id };
        if let Err(e) = self.ctx.gateway.funding_state_step(step).await {
            warn!("Failed to cancel funding shim {}: {}", hex::encode(pending_chan_id), e);
        }
    }

    /// Publish again every signed batch whose publication was never recorded
    async fn republish_signed(&self, node_id: &str) -> LspResult<usize> {
        let batches = PsbtFundingStateQueries::new(&self.ctx.db);
        let signed = batches
            .list_unpublished(node_id)
            .await
            .map_err(|e| LspError::Database(format!("Failed to list signed batches: {}", e)))?;

        let total = signed.len();
        let mut republished = 0;
        for (i, mut batch) in signed.into_iter().enumerate() {
            let Some(raw_tx) = batch.signed_tx.clone() else {
                continue;
            };
            let tx: Transaction = match bitcoin::consensus::deserialize(&raw_tx) {
                Ok(tx) => tx,
                Err(e) => {
                    error!("Signed transaction of funding batch {} is invalid: {}", batch.id, e);
                    continue;
                }
            };
            let txid = tx.compute_txid().to_string();
            info!(
                "[Funding Recovery {}/{}] Republishing signed batch {}: txid={}",
                i + 1,
                total,
                batch.id,
                txid
            );

            let label = format!("hold-lsp funding batch {}", batch.id);
            if let Err(e) = self.ctx.gateway.publish_transaction(raw_tx, label).await {
                warn!("Failed to republish funding batch {}: {}", batch.id, e);
                continue;
            }
            batch.funding_tx_id = Some(txid);
            batches
                .update(&batch)
                .await
                .map_err(|e| LspError::Database(format!("Failed to record published batch: {}", e)))?;
            republished += 1;
        }
        Ok(republished)
    }

    /// Republish signed batches, then fail every batch a previous run left
    /// unsigned, with its requests. Returns the number of failed batches.
    ///
    /// Funding negotiations do not survive a restart; the payers retry.
    pub async fn recover(&self) -> LspResult<usize> {
        info!("Recovering unfinished funding batches...");
        let node_id = self.ctx.node_id()?.to_string();
        let republished = self.republish_signed(&node_id).await?;
        if republished > 0 {
            info!("Republished {} signed funding batches", republished);
        }
        let batches = PsbtFundingStateQueries::new(&self.ctx.db);
        let requests = ChannelRequestQueries::new(&self.ctx.db);
        let htlcs = ChannelRequestHtlcQueries::new(&self.ctx.db);

        let unfinished = batches
            .list_unfinished(&node_id)
            .await
            .map_err(|e| LspError::Database(format!("Failed to list unfinished batches: {}", e)))?;
        if unfinished.is_empty() {
            info!("No unfinished funding batches to recover");
            return Ok(0);
        }

        let total = unfinished.len();
        for (i, mut batch) in unfinished.into_iter().enumerate() {
            let linked = batches
                .list_channel_requests(batch.id)
                .await
                .map_err(|e| LspError::Database(format!("Failed to list batch requests: {}", e)))?;
            info!(
                "[Funding Recovery {}/{}] Failing batch {} with {} channel requests",
                i + 1,
                total,
                batch.id,
                linked.len()
            );

            for request in linked {
                let _guard = self.ctx.locks.lock(request.id).await;
                let failed = htlcs
                    .mark_failed_for_request(request.id)
                    .await
                    .map_err(|e| LspError::Database(format!("Failed to fail htlcs: {}", e)))?;
                if !request.status.is_terminal() {
                    requests
                        .update_status(request.id, ChannelRequestStatus::Failed)
                        .await
                        .map_err(|e| LspError::Database(format!("Failed to fail channel request: {}", e)))?;
                }
                debug!("Channel request {} failed with {} htlcs", request.id, failed);
            }

            batch.is_failed = true;
            batches
                .update(&batch)
                .await
                .map_err(|e| LspError::Database(format!("Failed to mark batch failed: {}", e)))?;
        }

        info!("Funding recovery completed: {} batches failed", total);
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ChannelRequestHtlcQueries;
    use crate::node::{CommitmentType, ResolveHoldForwardAction};
    use crate::test_utils::{
        attach_sink, insert_request, sample_transaction, test_context, GatewayCall, MockGateway,
    };
    use std::sync::atomic::Ordering;

    fn open_request(scid: u64) -> OpenChannelRequest {
        OpenChannelRequest {
            node_pubkey: vec![2; 33],
            local_funding_amount: 20_000,
            private: true,
            commitment_type: CommitmentType::Anchors,
            zero_conf: true,
            scid: Some(scid),
            funding_shim: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_in_window_share_one_batch() {
        let gateway = Arc::new(MockGateway::new());
        let ctx = test_context(gateway.clone()).await;
        let coordinator = Arc::new(FundingCoordinator::new(ctx.clone()));
        let batches = PsbtFundingStateQueries::new(&ctx.db);

        let first = insert_request(&ctx, 100_000, 1).await;
        let second = insert_request(&ctx, 200_000, 2).await;
        let a = coordinator.open_channel(open_request(first.scid), &first).await.unwrap();
        let b = coordinator.open_channel(open_request(second.scid), &second).await.unwrap();
        assert_eq!(a, b);

        let opens = gateway.open_channel_calls();
        assert_eq!(opens[0].funding_shim.as_ref().unwrap().base_psbt, Vec::<u8>::new());
        assert_eq!(opens[1].funding_shim.as_ref().unwrap().base_psbt, vec![1]);
        assert!(opens.iter().all(|o| o.funding_shim.as_ref().unwrap().no_publish));

        let linked: Vec<i64> = batches.list_channel_requests(a).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(linked, vec![first.id, second.id]);
        assert_eq!(batches.get_by_id(a).await.unwrap().unwrap().psbt, vec![1, 2]);

        // Window closes: the batch is settled by its timer
        tokio::time::sleep(Duration::from_secs(31)).await;
        let settled = batches.get_by_id(a).await.unwrap().unwrap();
        let txid = sample_transaction().compute_txid().to_string();
        assert_eq!(settled.funding_tx_id.as_deref(), Some(txid.as_str()));
        assert!(settled.signed_tx.is_some());
        assert_eq!(gateway.published().len(), 1);
        assert_eq!(ctx.metrics.batch_count(true), 1);

        let third = insert_request(&ctx, 300_000, 3).await;
        let c = coordinator.open_channel(open_request(third.scid), &third).await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settlement_call_order() {
        let gateway = Arc::new(MockGateway::new());
        let ctx = test_context(gateway.clone()).await;
        let coordinator = Arc::new(FundingCoordinator::new(ctx.clone()));

        let first = insert_request(&ctx, 100_000, 1).await;
        let second = insert_request(&ctx, 200_000, 2).await;
        let batch_id = coordinator.open_channel(open_request(first.scid), &first).await.unwrap();
        coordinator.open_channel(open_request(second.scid), &second).await.unwrap();

        coordinator.fund_psbt(batch_id).await.unwrap();
        let settlement: Vec<&'static str> = gateway
            .calls()
            .iter()
            .filter_map(|c| match c {
                GatewayCall::FundPsbt(_) => Some("fund"),
                GatewayCall::FundingStateStep(FundingStateStep::PsbtVerify { .. }) => Some("verify"),
                GatewayCall::FinalizePsbt(_) => Some("sign"),
                GatewayCall::FundingStateStep(FundingStateStep::PsbtFinalize { .. }) => Some("finalize"),
                GatewayCall::PublishTransaction(_) => Some("publish"),
                _ => None,
            })
            .collect();
        assert_eq!(settlement, vec!["fund", "verify", "verify", "sign", "finalize", "finalize", "publish"]);

        // The timer finds the batch settled and leaves it alone
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(gateway.published().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_request_with_shim() {
        let gateway = Arc::new(MockGateway::new());
        let ctx = test_context(gateway.clone()).await;
        let coordinator = Arc::new(FundingCoordinator::new(ctx.clone()));
        let request = insert_request(&ctx, 100_000, 1).await;

        let mut open = open_request(request.scid);
        open.funding_shim = Some(PsbtShim {
            pending_chan_id: [0; 32],
            base_psbt: vec![],
            no_publish: true,
        });
        assert!(matches!(
            coordinator.open_channel(open, &request).await,
            Err(LspError::Funding(_))
        ));
        assert!(gateway.open_channel_calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_open_creates_no_batch() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_open_channel.store(true, Ordering::SeqCst);
        let ctx = test_context(gateway.clone()).await;
        let coordinator = Arc::new(FundingCoordinator::new(ctx.clone()));
        let request = insert_request(&ctx, 100_000, 1).await;

        assert!(matches!(
            coordinator.open_channel(open_request(request.scid), &request).await,
            Err(LspError::Gateway(_))
        ));
        let batch = PsbtFundingStateQueries::new(&ctx.db)
            .get_unfunded("03lspnode", Utc::now())
            .await
            .unwrap();
        assert!(batch.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_fails_all_requests() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_fund_psbt.store(true, Ordering::SeqCst);
        let ctx = test_context(gateway.clone()).await;
        let mut replies = attach_sink(&ctx);
        let coordinator = Arc::new(FundingCoordinator::new(ctx.clone()));
        let requests = ChannelRequestQueries::new(&ctx.db);
        let htlcs = ChannelRequestHtlcQueries::new(&ctx.db);

        let mut ids = vec![];
        let mut batch_id = 0;
        for seed in [1u8, 2] {
            let mut request = insert_request(&ctx, 100_000, seed).await;
            htlcs.insert(request.id, seed as u64, 0, 100_000, false).await.unwrap();
            request.settled_msat = 100_000;
            request.status = ChannelRequestStatus::OpeningChannel;
            requests.update(&request).await.unwrap();
            batch_id = coordinator.open_channel(open_request(request.scid), &request).await.unwrap();
            ids.push(request.id);
        }

        assert!(coordinator.fund_psbt(batch_id).await.is_err());

        let batch = PsbtFundingStateQueries::new(&ctx.db).get_by_id(batch_id).await.unwrap().unwrap();
        assert!(batch.is_failed);
        for id in &ids {
            let request = requests.get_by_id(*id).await.unwrap().unwrap();
            assert_eq!(request.status, ChannelRequestStatus::Failed);
            assert!(htlcs.list(*id).await.unwrap().iter().all(|h| h.is_failed));
        }
        for _ in 0..2 {
            assert_eq!(replies.recv().await.unwrap().action, ResolveHoldForwardAction::Fail);
        }

        let cancels = gateway
            .funding_steps()
            .into_iter()
            .filter(|s| matches!(s, FundingStateStep::ShimCancel { .. }))
            .count();
        assert_eq!(cancels, 2);
        assert!(gateway.published().is_empty());
        assert_eq!(ctx.metrics.batch_count(false), 1);
    }

    #[tokio::test]
    async fn test_rejected_broadcast_fails_batch() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_publish.store(true, Ordering::SeqCst);
        let ctx = test_context(gateway.clone()).await;
        let coordinator = Arc::new(FundingCoordinator::new(ctx.clone()));
        let request = insert_request(&ctx, 100_000, 1).await;

        let batch_id = coordinator.open_channel(open_request(request.scid), &request).await.unwrap();
        assert!(matches!(coordinator.fund_psbt(batch_id).await, Err(LspError::Gateway(_))));

        let batch = PsbtFundingStateQueries::new(&ctx.db).get_by_id(batch_id).await.unwrap().unwrap();
        assert!(batch.is_failed);
        assert!(batch.funding_tx_id.is_none());
        assert_eq!(gateway.published().len(), 1);
        assert!(gateway
            .funding_steps()
            .iter()
            .any(|s| matches!(s, FundingStateStep::ShimCancel { .. })));
        let stored = ChannelRequestQueries::new(&ctx.db).get_by_id(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChannelRequestStatus::Failed);
    }

    #[tokio::test]
    async fn test_recovery_fails_unfinished_batches() {
        let gateway = Arc::new(MockGateway::new());
        let ctx = test_context(gateway.clone()).await;
        let coordinator = FundingCoordinator::new(ctx.clone());
        let batches = PsbtFundingStateQueries::new(&ctx.db);
        let htlcs = ChannelRequestHtlcQueries::new(&ctx.db);

        let mut request = insert_request(&ctx, 100_000, 1).await;
        request.status = ChannelRequestStatus::OpeningChannel;
        ChannelRequestQueries::new(&ctx.db).update(&request).await.unwrap();
        htlcs.insert(request.id, 3, 0, 60_000, false).await.unwrap();
        htlcs.insert(request.id, 3, 1, 40_000, false).await.unwrap();

        let batch = batches
            .insert("03lspnode", &[], &[1], Utc::now() + chrono::Duration::seconds(30))
            .await
            .unwrap();
        batches.link_channel_request(batch.id, request.id).await.unwrap();

        assert_eq!(coordinator.recover().await.unwrap(), 1);

        assert!(batches.get_by_id(batch.id).await.unwrap().unwrap().is_failed);
        assert!(htlcs.list(request.id).await.unwrap().iter().all(|h| h.is_failed));
        let stored = ChannelRequestQueries::new(&ctx.db).get_by_id(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChannelRequestStatus::Failed);
        assert!(gateway.open_channel_calls().is_empty());
        assert!(gateway.funding_steps().is_empty());

        assert_eq!(coordinator.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unrecorded_publish_is_republished_on_recovery() {
        let gateway = Arc::new(MockGateway::new());
        let ctx = test_context(gateway.clone()).await;
        let coordinator = Arc::new(FundingCoordinator::new(ctx.clone()));
        let batches = PsbtFundingStateQueries::new(&ctx.db);
        let requests = ChannelRequestQueries::new(&ctx.db);

        let mut request = insert_request(&ctx, 100_000, 1).await;
        request.status = ChannelRequestStatus::OpeningChannel;
        requests.update(&request).await.unwrap();
        let batch_id = coordinator.open_channel(open_request(request.scid), &request).await.unwrap();

        let conn = ctx.db.conn();
        conn.lock()
            .await
            .execute_batch(
                "CREATE TRIGGER reject_txid BEFORE UPDATE ON psbt_funding_states \
                 WHEN NEW.funding_tx_id IS NOT NULL BEGIN SELECT RAISE(ABORT, 'store unavailable'); END;",
            )
            .unwrap();

        let txid = coordinator.fund_psbt(batch_id).await.unwrap();
        let batch = batches.get_by_id(batch_id).await.unwrap().unwrap();
        assert!(batch.signed_tx.is_some());
        assert!(batch.funding_tx_id.is_none());
        assert!(!batch.is_failed);

        conn.lock().await.execute_batch("DROP TRIGGER reject_txid;").unwrap();
        assert_eq!(coordinator.recover().await.unwrap(), 0);

        let batch = batches.get_by_id(batch_id).await.unwrap().unwrap();
        assert_eq!(batch.funding_tx_id.as_deref(), Some(txid.as_str()));
        assert!(!batch.is_failed);
        assert_eq!(gateway.published().len(), 2);
        let stored = requests.get_by_id(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChannelRequestStatus::OpeningChannel);
        assert!(gateway
            .funding_steps()
            .iter()
            .all(|s| !matches!(s, FundingStateStep::ShimCancel { .. })));
    }
}
