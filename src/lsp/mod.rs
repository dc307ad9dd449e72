//! LSP (Lightning Service Provider) core functionality
//!
//! This module implements the hold-and-open flow:
//! - Channel request creation (payment hash, preimage, SCID alias, fee terms)
//! - HTLC interception and holding until the full amount arrived
//! - Batched PSBT funding of the zero-conf channels
//! - Releasing the held HTLCs once the channel is open
//! - Failing requests whose payment never completes

use crate::{
    config::Config,
    db::{
        ChannelRequestHtlcModel, ChannelRequestHtlcQueries, ChannelRequestModel,
        ChannelRequestQueries, ChannelRequestStatus, Database, NewChannelRequest,
    },
    metrics::{HtlcOutcome, Metrics},
    node::{
        subscribe_with_retry, CircuitKey, GatewayError, GatewayResult, HtlcResolver,
        LightningGateway, RetryPolicy,
    },
    LspError, LspResult,
};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::PublicKey;
use rand::RngCore;
use serde::Serialize;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod funding;
mod interceptor;
mod locks;
mod reactor;
mod scid;
mod watchdog;

pub use funding::FundingCoordinator;
pub use interceptor::{local_funding_amount, HtlcInterceptor, MIN_FUNDING_AMOUNT_SAT};
pub use locks::KeyedLocks;
pub use reactor::ChannelEventReactor;
pub use scid::ScidAllocator;
pub use watchdog::PaymentWatchdog;

/// Capacity of the channels between stream subscribers and their handlers
const STREAM_BUFFER: usize = 256;

/// State shared by the LSP components
pub(crate) struct LspContext {
    pub(crate) config: Arc<Config>,
    pub(crate) db: Arc<Database>,
    pub(crate) gateway: Arc<dyn LightningGateway>,
    pub(crate) resolver: HtlcResolver,
    pub(crate) locks: KeyedLocks,
    pub(crate) metrics: Metrics,
    pub(crate) cancel: CancellationToken,
    node_id: OnceLock<String>,
}

impl LspContext {
    pub(crate) fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        gateway: Arc<dyn LightningGateway>,
        metrics: Metrics,
        cancel: CancellationToken,
    ) -> Self {
        let (resolver, _task) = HtlcResolver::spawn();
        Self {
            config,
            db,
            gateway,
            resolver,
            locks: KeyedLocks::new(),
            metrics,
            cancel,
            node_id: OnceLock::new(),
        }
    }

    /// Identity of the Lightning node, known after [`LspService::init`]
    pub(crate) fn node_id(&self) -> LspResult<&str> {
        self.node_id
            .get()
            .map(String::as_str)
            .ok_or_else(|| LspError::Node("Lightning node identity not loaded yet".to_string()))
    }

    pub(crate) fn set_node_id(&self, node_id: String) {
        if self.node_id.set(node_id).is_err() {
            debug!("Node identity already set");
        }
    }

    /// Lock the request, mark it `FAILED` and fail back its held HTLCs
    pub(crate) async fn fail_request(&self, request_id: i64, reason: &str) -> LspResult<usize> {
        let _guard = self.locks.lock(request_id).await;
        let request = ChannelRequestQueries::new(&self.db)
            .get_by_id(request_id)
            .await
            .map_err(|e| LspError::Database(format!("Failed to get channel request: {}", e)))?;
        match request {
            Some(mut request) => self.fail_request_locked(&mut request, reason).await,
            None => {
                warn!("Cannot fail unknown channel request {}", request_id);
                Ok(0)
            }
        }
    }

    /// Mark the request `FAILED` and fail back its held HTLCs.
    ///
    /// The caller holds the request lock. Completed requests are left alone.
    pub(crate) async fn fail_request_locked(
        &self,
        request: &mut ChannelRequestModel,
        reason: &str,
    ) -> LspResult<usize> {
        if request.status == ChannelRequestStatus::Completed {
            warn!("Not failing completed channel request {}: {}", request.id, reason);
            return Ok(0);
        }

        let requests = ChannelRequestQueries::new(&self.db);
        let htlcs = ChannelRequestHtlcQueries::new(&self.db);

        request.status = ChannelRequestStatus::Failed;
        requests
            .update(request)
            .await
            .map_err(|e| LspError::Database(format!("Failed to update channel request: {}", e)))?;

        let held = htlcs
            .list_unsettled(request.id)
            .await
            .map_err(|e| LspError::Database(format!("Failed to list held htlcs: {}", e)))?;
        htlcs
            .mark_failed_for_request(request.id)
            .await
            .map_err(|e| LspError::Database(format!("Failed to mark htlcs failed: {}", e)))?;

        for htlc in &held {
            self.resolver.fail(circuit_key(htlc));
            self.metrics.record_htlc(HtlcOutcome::Failed);
        }

        warn!(
            "Channel request {} failed: {} ({} held htlcs failed back)",
            request.id,
            reason,
            held.len()
        );
        Ok(held.len())
    }
}

/// Circuit key of a stored HTLC
pub(crate) fn circuit_key(htlc: &ChannelRequestHtlcModel) -> CircuitKey {
    CircuitKey {
        chan_id: htlc.chan_id,
        htlc_id: htlc.htlc_id,
    }
}

/// Parameters of a new channel request
#[derive(Debug, Clone)]
pub struct CreateChannelRequest {
    /// Remote node public key (hex)
    pub pubkey: String,
    /// Amount the payer will route through us (millisatoshis)
    pub amount_msat: u64,
    /// Payment hash (hex)
    pub payment_hash: String,
    /// Preimage of the payment hash (hex)
    pub preimage: String,
}

/// Terms returned to the requester of a channel
#[derive(Debug, Clone, Serialize)]
pub struct ChannelTerms {
    /// Channel request ID
    pub request_id: i64,
    /// Funding shim identifier (hex)
    pub pending_chan_id: String,
    /// SCID alias the payer must route through
    pub scid: u64,
    /// Base fee of the new channel (millisatoshis)
    pub fee_base_msat: u64,
    /// Proportional fee of the new channel (ppm)
    pub fee_proportional_millionths: u64,
    /// CLTV delta of the new channel
    pub cltv_expiry_delta: u32,
}

/// The main LSP service that manages channel requests
pub struct LspService {
    ctx: Arc<LspContext>,
    /// SCID alias pool
    pub scids: Arc<ScidAllocator>,
    /// PSBT batch funding
    pub funding: Arc<FundingCoordinator>,
    /// Payment timeouts
    pub watchdog: Arc<PaymentWatchdog>,
    /// HTLC interception engine
    pub interceptor: Arc<HtlcInterceptor>,
    /// Channel event reactor
    pub reactor: Arc<ChannelEventReactor>,
}

impl LspService {
    /// Create a new LSP service
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        gateway: Arc<dyn LightningGateway>,
        metrics: Metrics,
        cancel: CancellationToken,
    ) -> Self {
        let ctx = Arc::new(LspContext::new(config, db, gateway, metrics, cancel));
        Self::with_context(ctx)
    }

    pub(crate) fn with_context(ctx: Arc<LspContext>) -> Self {
        let scids = Arc::new(ScidAllocator::new(ctx.clone()));
        let funding = Arc::new(FundingCoordinator::new(ctx.clone()));
        let watchdog = Arc::new(PaymentWatchdog::new(ctx.clone()));
        let interceptor = Arc::new(HtlcInterceptor::new(
            ctx.clone(),
            funding.clone(),
            watchdog.clone(),
        ));
        let reactor = Arc::new(ChannelEventReactor::new(ctx.clone()));

        Self {
            ctx,
            scids,
            funding,
            watchdog,
            interceptor,
            reactor,
        }
    }

    /// Initialize the LSP service
    ///
    /// Loads the node identity, fails funding batches interrupted by a
    /// restart, re-arms payment timeouts and tops up the SCID pool.
    pub async fn init(&self) -> LspResult<()> {
        info!("Initializing LSP service...");

        let node_info = self
            .ctx
            .gateway
            .get_info()
            .await
            .map_err(|e| LspError::Node(format!("Failed to reach Lightning node: {}", e)))?;
        info!(
            "Connected to Lightning node {} ({}) at height {}",
            node_info.node_id, node_info.alias, node_info.block_height
        );
        self.ctx
            .metrics
            .set_node_counts(node_info.num_active_channels, node_info.num_peers);
        self.ctx.set_node_id(node_info.node_id);

        match self.ctx.gateway.wallet_balance().await {
            Ok(balance) if balance.confirmed_sat == 0 => {
                warn!("On-chain wallet has no confirmed funds, channel opens will fail")
            }
            Ok(balance) => info!(
                "On-chain wallet balance: {} sat confirmed, {} sat unconfirmed",
                balance.confirmed_sat, balance.unconfirmed_sat
            ),
            Err(e) => warn!("Failed to get wallet balance: {}", e),
        }

        self.funding.recover().await?;
        self.rearm_watchdogs().await?;

        let added = self.scids.top_up().await?;
        info!("SCID pool topped up with {} aliases", added);

        info!("LSP service initialized");
        Ok(())
    }

    /// Restart payment timeouts for requests still collecting HTLCs
    async fn rearm_watchdogs(&self) -> LspResult<()> {
        let requests = ChannelRequestQueries::new(&self.ctx.db)
            .list_by_status(ChannelRequestStatus::AwaitingPayments)
            .await
            .map_err(|e| LspError::Database(format!("Failed to list awaiting requests: {}", e)))?;

        if requests.is_empty() {
            info!("No channel requests awaiting payments");
            return Ok(());
        }

        let total = requests.len();
        for (i, request) in requests.iter().enumerate() {
            info!(
                "[Payment Timeouts {}/{}] Re-arming timeout for request {} ({}/{} msat)",
                i + 1,
                total,
                request.id,
                request.settled_msat,
                request.amount_msat
            );
            self.watchdog.start(request.id);
        }
        Ok(())
    }

    /// Subscribe to the node's streams and start handling them
    ///
    /// Each returned task ends with an error if its stream failed fatally.
    pub fn start(&self) -> JoinSet<GatewayResult<()>> {
        info!("Starting LSP stream consumers...");
        let mut tasks = JoinSet::new();
        let cancel = self.ctx.cancel.clone();

        // Intercepted HTLCs
        let (htlc_tx, htlc_rx) = mpsc::channel(STREAM_BUFFER);
        let gateway = self.ctx.gateway.clone();
        let resolver = self.ctx.resolver.clone();
        let subscription = subscribe_with_retry(
            "htlc interceptor",
            RetryPolicy::default(),
            cancel.clone(),
            move || {
                let gateway = gateway.clone();
                let resolver = resolver.clone();
                async move {
                    let stream = gateway.htlc_interceptor().await?;
                    resolver.attach(stream.responses);
                    Ok(stream.requests)
                }
            },
            htlc_tx,
        );
        tokio::spawn(self.interceptor.clone().run(htlc_rx));
        tasks.spawn(supervise("htlc interceptor", subscription));

        // Channel events
        let (event_tx, mut event_rx) = mpsc::channel(STREAM_BUFFER);
        let gateway = self.ctx.gateway.clone();
        let subscription = subscribe_with_retry(
            "channel events",
            RetryPolicy::default(),
            cancel.clone(),
            move || {
                let gateway = gateway.clone();
                async move { gateway.subscribe_channel_events().await }
            },
            event_tx,
        );
        let reactor = self.reactor.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                reactor.handle_channel_event(event).await;
            }
            debug!("Channel event handler stopped");
        });
        tasks.spawn(supervise("channel events", subscription));

        // Wallet transactions
        let (tx_tx, mut tx_rx) = mpsc::channel(STREAM_BUFFER);
        let gateway = self.ctx.gateway.clone();
        let subscription = subscribe_with_retry(
            "transactions",
            RetryPolicy::default(),
            cancel,
            move || {
                let gateway = gateway.clone();
                async move { gateway.subscribe_transactions().await }
            },
            tx_tx,
        );
        let reactor = self.reactor.clone();
        tokio::spawn(async move {
            while let Some(tx) = tx_rx.recv().await {
                reactor.handle_transaction(tx).await;
            }
            debug!("Transaction handler stopped");
        });
        tasks.spawn(supervise("transactions", subscription));

        info!("LSP stream consumers started");
        tasks
    }

    /// Create a channel request for a payer
    ///
    /// The caller supplies the payment hash and preimage of the payment the
    /// payer will route through the returned SCID alias.
    pub async fn create_channel_request(&self, req: CreateChannelRequest) -> LspResult<ChannelTerms> {
        info!(
            "Channel request from {} for {} msat, payment_hash={}",
            req.pubkey, req.amount_msat, req.payment_hash
        );

        let pubkey = PublicKey::from_str(&req.pubkey)
            .map_err(|e| LspError::Validation(format!("Invalid pubkey: {}", e)))?;
        if req.amount_msat == 0 {
            return Err(LspError::Validation("amount_msat must be positive".to_string()));
        }
        let amount_msat = i64::try_from(req.amount_msat)
            .map_err(|_| LspError::Validation("amount_msat is too large".to_string()))?;
        let payment_hash = decode_32("payment_hash", &req.payment_hash)?;
        let preimage = decode_32("preimage", &req.preimage)?;
        if sha256::Hash::hash(&preimage).to_byte_array() != payment_hash {
            return Err(LspError::Validation(
                "preimage does not match payment_hash".to_string(),
            ));
        }

        let requests = ChannelRequestQueries::new(&self.ctx.db);
        let existing = requests
            .get_by_payment_hash(&payment_hash)
            .await
            .map_err(|e| LspError::Database(format!("Failed to look up payment hash: {}", e)))?;
        if existing.is_some() {
            return Err(LspError::Channel(format!(
                "A channel request for payment hash {} already exists",
                req.payment_hash
            )));
        }

        let pending_chan_id = self.unused_pending_chan_id().await?;
        let scid = self.scids.allocate_scid().await?;

        let request = requests
            .insert(&NewChannelRequest {
                payment_hash,
                preimage,
                pending_chan_id,
                pubkey: pubkey.to_string(),
                amount_msat,
                scid,
            })
            .await
            .map_err(|e| LspError::Database(format!("Failed to save channel request: {}", e)))?;

        let lsp = &self.ctx.config.lsp;
        let terms = ChannelTerms {
            request_id: request.id,
            pending_chan_id: hex::encode(pending_chan_id),
            scid,
            fee_base_msat: lsp.base_fee_msat,
            fee_proportional_millionths: lsp.fee_rate_ppm,
            cltv_expiry_delta: lsp.time_lock_delta,
        };

        info!(
            "Channel request created: id={}, scid={}, pending_chan_id={}",
            terms.request_id, terms.scid, terms.pending_chan_id
        );
        Ok(terms)
    }

    /// Random funding shim identifier not used by any stored request
    async fn unused_pending_chan_id(&self) -> LspResult<[u8; 32]> {
        let requests = ChannelRequestQueries::new(&self.ctx.db);
        loop {
            let mut id = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut id);
            let taken = requests
                .get_by_pending_chan_id(&id)
                .await
                .map_err(|e| LspError::Database(format!("Failed to check pending_chan_id: {}", e)))?;
            if taken.is_none() {
                return Ok(id);
            }
            warn!("pending_chan_id collision, generating another");
        }
    }

    /// Get a channel request and its HTLCs
    pub async fn get_channel_request(
        &self,
        id: i64,
    ) -> LspResult<Option<(ChannelRequestModel, Vec<ChannelRequestHtlcModel>)>> {
        let request = ChannelRequestQueries::new(&self.ctx.db)
            .get_by_id(id)
            .await
            .map_err(|e| LspError::Database(format!("Failed to get channel request: {}", e)))?;
        let Some(request) = request else {
            return Ok(None);
        };
        let htlcs = ChannelRequestHtlcQueries::new(&self.ctx.db)
            .list(id)
            .await
            .map_err(|e| LspError::Database(format!("Failed to list htlcs: {}", e)))?;
        Ok(Some((request, htlcs)))
    }

    /// Identity of the Lightning node, once initialized
    pub fn node_id(&self) -> Option<String> {
        self.ctx.node_id().ok().map(str::to_string)
    }

    /// Stop every background task
    pub fn shutdown(&self) {
        info!("Stopping LSP service...");
        self.ctx.cancel.cancel();
    }
}

async fn supervise(
    name: &'static str,
    handle: tokio::task::JoinHandle<GatewayResult<()>>,
) -> GatewayResult<()> {
    match handle.await {
        Ok(result) => {
            if let Err(ref e) = result {
                error!("{} subscription stopped: {}", name, e);
            }
            result
        }
        Err(e) => {
            error!("{} subscription task panicked: {}", name, e);
            Err(GatewayError::StreamClosed)
        }
    }
}

fn decode_32(field: &str, value: &str) -> LspResult<[u8; 32]> {
    let bytes = hex::decode(value)
        .map_err(|e| LspError::Validation(format!("Invalid {} hex: {}", field, e)))?;
    bytes
        .try_into()
        .map_err(|_| LspError::Validation(format!("{} must be 32 bytes", field)))
}
