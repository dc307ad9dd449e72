//! HTLC interception engine
//!
//! Every HTLC the node holds for us is matched to a channel request by its
//! payment hash. HTLCs of unknown payments are resumed. HTLCs of a request
//! still collecting payments are stored and held; once their sum reaches
//! the requested amount the channel open is enrolled in a funding batch.
//! Held HTLCs get no reply here: the channel event reactor resumes them
//! when the channel is open.

use super::{FundingCoordinator, LspContext, PaymentWatchdog};
use crate::db::{
    ChannelRequestHtlcModel, ChannelRequestHtlcQueries, ChannelRequestModel, ChannelRequestQueries,
    ChannelRequestStatus,
};
use crate::metrics::HtlcOutcome;
use crate::node::{CommitmentType, ForwardHtlcInterceptRequest, OpenChannelRequest};
use crate::{LspError, LspResult};
use bitcoin::secp256k1::PublicKey;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Smallest channel the LSP opens (satoshis)
pub const MIN_FUNDING_AMOUNT_SAT: u64 = 20_000;

/// Local funding of the channel opened for a payment of `amount_sat`
pub fn local_funding_amount(amount_sat: u64) -> u64 {
    MIN_FUNDING_AMOUNT_SAT.max(amount_sat.saturating_mul(5) / 4)
}

/// Idle time after which a payment's worker exits
const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

const WORKER_QUEUE_SIZE: usize = 32;

/// Serial handler of the HTLCs of one payment hash
struct PaymentWorker {
    sender: mpsc::Sender<ForwardHtlcInterceptRequest>,
    handle: JoinHandle<()>,
}

/// What to do with an intercepted HTLC
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    /// Not one of ours
    Resume,
    /// Fail it back
    Reject(&'static str),
    /// Held for a channel request
    Hold,
    /// A reply was already issued
    Replied,
}

/// Decides the fate of every intercepted HTLC
pub struct HtlcInterceptor {
    ctx: Arc<LspContext>,
    funding: Arc<FundingCoordinator>,
    watchdog: Arc<PaymentWatchdog>,
}

impl HtlcInterceptor {
    pub(crate) fn new(
        ctx: Arc<LspContext>,
        funding: Arc<FundingCoordinator>,
        watchdog: Arc<PaymentWatchdog>,
    ) -> Self {
        Self {
            ctx,
            funding,
            watchdog,
        }
    }

    /// Handle intercepted HTLCs until the subscription ends.
    ///
    /// HTLCs of one payment hash are handled in arrival order by a single
    /// worker; distinct payments are handled concurrently.
    pub async fn run(self: Arc<Self>, mut htlcs: mpsc::Receiver<ForwardHtlcInterceptRequest>) {
        let mut workers: HashMap<[u8; 32], PaymentWorker> = HashMap::new();
        while let Some(htlc) = htlcs.recv().await {
            workers.retain(|_, worker| !worker.handle.is_finished());
            let payment_hash = htlc.payment_hash;

            let htlc = match workers.get(&payment_hash) {
                Some(worker) => match worker.sender.send(htlc).await {
                    Ok(()) => continue,
                    Err(mpsc::error::SendError(htlc)) => htlc,
                },
                None => htlc,
            };
            // An idle worker is draining; let it finish before its successor starts
            if let Some(stale) = workers.remove(&payment_hash) {
                let _ = stale.handle.await;
            }
            workers.insert(payment_hash, self.clone().spawn_worker(htlc));
        }

        for (_, worker) in workers.drain() {
            drop(worker.sender);
            let _ = worker.handle.await;
        }
        debug!("HTLC interceptor handler stopped");
    }

    fn spawn_worker(self: Arc<Self>, first: ForwardHtlcInterceptRequest) -> PaymentWorker {
        let (sender, mut receiver) = mpsc::channel(WORKER_QUEUE_SIZE);
        let handle = tokio::spawn(async move {
            self.handle_htlc(first).await;
            loop {
                match tokio::time::timeout(WORKER_IDLE_TIMEOUT, receiver.recv()).await {
                    Ok(Some(htlc)) => self.handle_htlc(htlc).await,
                    Ok(None) => break,
                    Err(_) => {
                        receiver.close();
                        while let Ok(htlc) = receiver.try_recv() {
                            self.handle_htlc(htlc).await;
                        }
                        break;
                    }
                }
            }
        });
        PaymentWorker { sender, handle }
    }

    /// Decide and, unless the HTLC is held, reply
    pub async fn handle_htlc(&self, htlc: ForwardHtlcInterceptRequest) {
        let key = htlc.incoming_circuit_key;
        debug!(
            "Intercepted htlc {}: payment_hash={}, amount={} msat",
            key,
            hex::encode(htlc.payment_hash),
            htlc.incoming_amount_msat
        );

        let verdict = match self.decide(&htlc).await {
            Ok(verdict) => verdict,
            Err(e) => {
                error!("Failed to process htlc {}: {}", key, e);
                Verdict::Reject("processing error")
            }
        };

        match verdict {
            Verdict::Resume => self.ctx.resolver.resume(key),
            Verdict::Reject(reason) => {
                info!("Failing htlc {}: {}", key, reason);
                self.ctx.resolver.fail(key);
                self.ctx.metrics.record_htlc(HtlcOutcome::Failed);
            }
            Verdict::Hold => {
                debug!("Holding htlc {}", key);
                self.ctx.metrics.record_htlc(HtlcOutcome::Accepted);
            }
            Verdict::Replied => {}
        }
    }

    async fn decide(&self, htlc: &ForwardHtlcInterceptRequest) -> LspResult<Verdict> {
        let requests = ChannelRequestQueries::new(&self.ctx.db);
        let htlcs = ChannelRequestHtlcQueries::new(&self.ctx.db);

        let found = requests
            .get_by_payment_hash(&htlc.payment_hash)
            .await
            .map_err(|e| LspError::Database(format!("Failed to look up payment hash: {}", e)))?;
        let Some(found) = found else {
            return Ok(Verdict::Resume);
        };
        if !found.status.accepts_htlcs() {
            return Ok(Verdict::Reject("channel request no longer accepts htlcs"));
        }

        let _guard = self.ctx.locks.lock(found.id).await;
        let mut request = requests
            .get_by_id(found.id)
            .await
            .map_err(|e| LspError::Database(format!("Failed to get channel request: {}", e)))?
            .ok_or_else(|| LspError::Database(format!("Channel request {} vanished", found.id)))?;
        if !request.status.accepts_htlcs() {
            return Ok(Verdict::Reject("channel request no longer accepts htlcs"));
        }

        let key = htlc.incoming_circuit_key;
        let existing = htlcs
            .get_by_circuit_key(request.id, key.chan_id, key.htlc_id)
            .await
            .map_err(|e| LspError::Database(format!("Failed to look up htlc: {}", e)))?;
        if existing.is_some() {
            return Ok(Verdict::Reject("duplicate htlc"));
        }

        let amount_msat = i64::try_from(htlc.incoming_amount_msat)
            .map_err(|_| LspError::Validation(format!("htlc amount {} out of range", htlc.incoming_amount_msat)))?;
        let overpays = request
            .settled_msat
            .checked_add(amount_msat)
            .map_or(true, |total| total > request.amount_msat);

        let mut stored = htlcs
            .insert(request.id, key.chan_id, key.htlc_id, amount_msat, overpays)
            .await
            .map_err(|e| LspError::Database(format!("Failed to store htlc: {}", e)))?;
        if overpays {
            warn!(
                "Htlc {} of {} msat overpays request {} ({}/{} msat)",
                key, amount_msat, request.id, request.settled_msat, request.amount_msat
            );
            return Ok(Verdict::Reject("overpayment"));
        }

        match self.hold(&mut request, &stored).await {
            Ok(verdict) => Ok(verdict),
            Err(e) => {
                // Answered FAIL; must not read as held
                stored.is_failed = true;
                if let Err(mark) = htlcs.update(&stored).await {
                    error!("Failed to mark htlc {} failed: {}", key, mark);
                }
                Err(e)
            }
        }
    }

    /// Account a stored HTLC to its request; the caller holds the request lock.
    ///
    /// The new amount and status are persisted before the channel open is
    /// enrolled.
    async fn hold(
        &self,
        request: &mut ChannelRequestModel,
        htlc: &ChannelRequestHtlcModel,
    ) -> LspResult<Verdict> {
        let first_htlc = request.status == ChannelRequestStatus::Requested;
        if first_htlc {
            request.status = ChannelRequestStatus::AwaitingPayments;
        }
        request.settled_msat += htlc.amount_msat;

        let complete = request.settled_msat == request.amount_msat;
        if complete {
            request.status = ChannelRequestStatus::OpeningChannel;
            request.funding_amount = Some(local_funding_amount(request.amount_msat as u64 / 1000) as i64);
        }

        ChannelRequestQueries::new(&self.ctx.db)
            .update(request)
            .await
            .map_err(|e| LspError::Database(format!("Failed to update channel request: {}", e)))?;

        if complete {
            if let Err(e) = self.open_channel(request).await {
                error!("Failed to open channel for request {}: {}", request.id, e);
                self.ctx
                    .fail_request_locked(request, "channel open failed")
                    .await?;
                return Ok(Verdict::Replied);
            }
            self.watchdog.notify_progress(request.id);
        } else if first_htlc {
            self.watchdog.start(request.id);
        }

        info!(
            "Holding htlc {}:{} for request {}: {}/{} msat, status={}",
            htlc.chan_id, htlc.htlc_id, request.id, request.settled_msat, request.amount_msat, request.status
        );
        Ok(Verdict::Hold)
    }

    /// Enroll the request's channel in a funding batch; returns the batch ID
    async fn open_channel(&self, request: &ChannelRequestModel) -> LspResult<i64> {
        let funding_amount = local_funding_amount(request.amount_msat as u64 / 1000);
        let pubkey = PublicKey::from_str(&request.pubkey)
            .map_err(|e| LspError::Validation(format!("Invalid pubkey {}: {}", request.pubkey, e)))?;

        let open = OpenChannelRequest {
            node_pubkey: pubkey.serialize().to_vec(),
            local_funding_amount: funding_amount,
            private: true,
            commitment_type: CommitmentType::Anchors,
            zero_conf: true,
            scid: Some(request.scid),
            funding_shim: None,
        };
        let batch_id = self.funding.open_channel(open, request).await?;
        info!(
            "Channel for request {} enrolled in batch {}: funding={} sat",
            request.id, batch_id, funding_amount
        );
        Ok(batch_id)
    }
}
