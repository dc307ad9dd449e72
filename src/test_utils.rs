//! In-memory gateway and fixtures shared by unit tests

use crate::config::Config;
use crate::db::{ChannelRequestModel, ChannelRequestQueries, Database, NewChannelRequest};
use crate::lsp::LspContext;
use crate::metrics::Metrics;
use crate::node::{
    ChannelEvent, CircuitKey, ChannelPolicyUpdate, FinalizedPsbt, ForwardHtlcInterceptRequest,
    ForwardHtlcInterceptResponse, FundedPsbt, FundingStateStep, GatewayError, GatewayResult,
    GatewayStream, InterceptorStream, LightningGateway, NodeInfo, OpenChannelRequest,
    OpenStatusUpdate, TransactionDetails, WalletBalance,
};
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Transaction, TxIn, TxOut};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Public key of a well-known test node
pub const REMOTE_PUBKEY: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

/// Every call made against the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    OpenChannel(OpenChannelRequest),
    FundingStateStep(FundingStateStep),
    FundPsbt(Vec<u8>),
    FinalizePsbt(Vec<u8>),
    PublishTransaction(Vec<u8>),
    UpdateChannelPolicy(ChannelPolicyUpdate),
    AllocateAlias(u64),
}

struct MockFeed<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<GatewayResult<T>>>>,
}

impl<T: Send + 'static> MockFeed<T> {
    fn new() -> Self {
        Self { tx: Mutex::new(None) }
    }

    fn subscribe(&self) -> GatewayStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().unwrap() = Some(tx);
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }

    fn push(&self, item: GatewayResult<T>) -> bool {
        match self.tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }
}

/// Scripted [`LightningGateway`] recording every call
pub struct MockGateway {
    pub info: NodeInfo,
    calls: Mutex<Vec<GatewayCall>>,
    next_alias: AtomicU64,
    pub fail_get_info: AtomicBool,
    pub fail_open_channel: AtomicBool,
    pub fail_fund_psbt: AtomicBool,
    pub fail_publish: AtomicBool,
    htlcs: MockFeed<ForwardHtlcInterceptRequest>,
    interceptor_responses: Mutex<Option<mpsc::Receiver<ForwardHtlcInterceptResponse>>>,
    channel_events: MockFeed<ChannelEvent>,
    transactions: MockFeed<TransactionDetails>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            info: NodeInfo {
                node_id: "03lspnode".to_string(),
                alias: "hold-lsp-test".to_string(),
                block_height: 800_000,
                num_peers: 4,
                num_active_channels: 2,
                num_pending_channels: 0,
            },
            calls: Mutex::new(Vec::new()),
            next_alias: AtomicU64::new(1_000_000),
            fail_get_info: AtomicBool::new(false),
            fail_open_channel: AtomicBool::new(false),
            fail_fund_psbt: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            htlcs: MockFeed::new(),
            interceptor_responses: Mutex::new(None),
            channel_events: MockFeed::new(),
            transactions: MockFeed::new(),
        }
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn open_channel_calls(&self) -> Vec<OpenChannelRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::OpenChannel(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn funding_steps(&self) -> Vec<FundingStateStep> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::FundingStateStep(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn published(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::PublishTransaction(tx) => Some(tx),
                _ => None,
            })
            .collect()
    }

    pub fn policy_updates(&self) -> Vec<ChannelPolicyUpdate> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::UpdateChannelPolicy(u) => Some(u),
                _ => None,
            })
            .collect()
    }

    /// Feed an HTLC into the registered interceptor
    pub fn intercept(&self, htlc: ForwardHtlcInterceptRequest) -> bool {
        self.htlcs.push(Ok(htlc))
    }

    /// Next reply the interceptor wrote
    pub async fn next_interceptor_response(&self) -> Option<ForwardHtlcInterceptResponse> {
        let mut rx = self.interceptor_responses.lock().unwrap().take()?;
        let response = rx.recv().await;
        *self.interceptor_responses.lock().unwrap() = Some(rx);
        response
    }

    /// Push a channel event to the subscriber
    pub fn emit_channel_event(&self, event: ChannelEvent) -> bool {
        self.channel_events.push(Ok(event))
    }

    /// Push a wallet transaction to the subscriber
    pub fn emit_transaction(&self, tx: TransactionDetails) -> bool {
        self.transactions.push(Ok(tx))
    }
}

/// A minimal consensus-encodable transaction
pub fn sample_transaction() -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn::default()],
        output: vec![TxOut {
            value: Amount::from_sat(125_000),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

#[async_trait]
impl LightningGateway for MockGateway {
    async fn get_info(&self) -> GatewayResult<NodeInfo> {
        if self.fail_get_info.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("connection refused".into()));
        }
        Ok(self.info.clone())
    }

    async fn htlc_interceptor(&self) -> GatewayResult<InterceptorStream> {
        let (responses, rx) = mpsc::channel(64);
        *self.interceptor_responses.lock().unwrap() = Some(rx);
        Ok(InterceptorStream {
            responses,
            requests: self.htlcs.subscribe(),
        })
    }

    async fn subscribe_channel_events(&self) -> GatewayResult<GatewayStream<ChannelEvent>> {
        Ok(self.channel_events.subscribe())
    }

    async fn subscribe_transactions(&self) -> GatewayResult<GatewayStream<TransactionDetails>> {
        Ok(self.transactions.subscribe())
    }

    async fn open_channel(&self, request: OpenChannelRequest) -> GatewayResult<GatewayStream<OpenStatusUpdate>> {
        self.record(GatewayCall::OpenChannel(request.clone()));
        if self.fail_open_channel.load(Ordering::SeqCst) {
            return Err(GatewayError::Rpc("peer is offline".into()));
        }
        let shim = request
            .funding_shim
            .ok_or_else(|| GatewayError::Rpc("psbt shim required".into()))?;

        // Each open appends one marker byte: its output
        let mut psbt = shim.base_psbt;
        psbt.push(shim.pending_chan_id[0]);

        let update = OpenStatusUpdate::PsbtFund {
            funding_address: "bcrt1qfunding".to_string(),
            funding_amount: request.local_funding_amount,
            psbt,
        };
        Ok(futures::stream::iter(vec![Ok(update)]).chain(futures::stream::pending()).boxed())
    }

    async fn funding_state_step(&self, step: FundingStateStep) -> GatewayResult<()> {
        self.record(GatewayCall::FundingStateStep(step));
        Ok(())
    }

    async fn fund_psbt(&self, psbt: Vec<u8>, _sat_per_vbyte: u64) -> GatewayResult<FundedPsbt> {
        self.record(GatewayCall::FundPsbt(psbt.clone()));
        if self.fail_fund_psbt.load(Ordering::SeqCst) {
            return Err(GatewayError::Rpc("insufficient funds".into()));
        }
        let mut funded_psbt = psbt;
        funded_psbt.extend_from_slice(b"+funded");
        Ok(FundedPsbt {
            funded_psbt,
            change_output_index: Some(0),
        })
    }

    async fn finalize_psbt(&self, funded_psbt: Vec<u8>) -> GatewayResult<FinalizedPsbt> {
        self.record(GatewayCall::FinalizePsbt(funded_psbt.clone()));
        let mut signed_psbt = funded_psbt;
        signed_psbt.extend_from_slice(b"+signed");
        Ok(FinalizedPsbt {
            signed_psbt,
            raw_final_tx: bitcoin::consensus::serialize(&sample_transaction()),
        })
    }

    async fn publish_transaction(&self, tx: Vec<u8>, _label: String) -> GatewayResult<()> {
        self.record(GatewayCall::PublishTransaction(tx));
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(GatewayError::Rpc("mempool rejected".into()));
        }
        Ok(())
    }

    async fn update_channel_policy(&self, update: ChannelPolicyUpdate) -> GatewayResult<()> {
        self.record(GatewayCall::UpdateChannelPolicy(update));
        Ok(())
    }

    async fn allocate_alias(&self) -> GatewayResult<u64> {
        let alias = self.next_alias.fetch_add(1, Ordering::SeqCst);
        self.record(GatewayCall::AllocateAlias(alias));
        Ok(alias)
    }

    async fn wallet_balance(&self) -> GatewayResult<WalletBalance> {
        Ok(WalletBalance {
            confirmed_sat: 10_000_000,
            unconfirmed_sat: 0,
        })
    }
}

/// Context over an in-memory database, with the mock's node identity loaded
pub async fn test_context(gateway: Arc<MockGateway>) -> Arc<LspContext> {
    test_context_with(gateway, Config::default()).await
}

/// Same as [`test_context`] with a custom configuration
pub async fn test_context_with(gateway: Arc<MockGateway>, config: Config) -> Arc<LspContext> {
    let db = Database::in_memory().await.unwrap();
    let node_id = gateway.info.node_id.clone();
    let ctx = LspContext::new(
        Arc::new(config),
        Arc::new(db),
        gateway,
        Metrics::new().unwrap(),
        CancellationToken::new(),
    );
    ctx.set_node_id(node_id);
    Arc::new(ctx)
}

/// Store a `REQUESTED` channel request; `seed` makes its hashes unique
pub async fn insert_request(ctx: &LspContext, amount_msat: i64, seed: u8) -> ChannelRequestModel {
    let mut pending_chan_id = [seed; 32];
    pending_chan_id[31] = 0xee;
    ChannelRequestQueries::new(&ctx.db)
        .insert(&NewChannelRequest {
            payment_hash: [seed; 32],
            preimage: [seed.wrapping_add(1); 32],
            pending_chan_id,
            pubkey: REMOTE_PUBKEY.to_string(),
            amount_msat,
            scid: 500_000 + seed as u64,
        })
        .await
        .unwrap()
}

/// An intercepted HTLC paying `payment_hash`
pub fn htlc(payment_hash: [u8; 32], chan_id: u64, htlc_id: u64, amount_msat: u64) -> ForwardHtlcInterceptRequest {
    ForwardHtlcInterceptRequest {
        incoming_circuit_key: CircuitKey { chan_id, htlc_id },
        incoming_amount_msat: amount_msat,
        incoming_expiry: 800_144,
        payment_hash,
        outgoing_requested_chan_id: 0,
        outgoing_amount_msat: amount_msat,
        outgoing_expiry: 800_104,
    }
}

/// Attach a fresh reply sink to the context's resolver
pub fn attach_sink(ctx: &LspContext) -> mpsc::Receiver<ForwardHtlcInterceptResponse> {
    let (tx, rx) = mpsc::channel(64);
    ctx.resolver.attach(tx);
    rx
}
