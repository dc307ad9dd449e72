//! Lightning node integration module
//!
//! The Lightning node is reached through the [`LightningGateway`] trait: a
//! streaming HTLC interceptor, streaming channel and transaction feeds, and
//! the unary calls the funding flow needs. Concrete transports are provided
//! by the embedding application.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use tokio::sync::mpsc;

pub mod events;
mod resolver;

pub use events::{subscribe_with_retry, RetryPolicy};
pub use resolver::HtlcResolver;

/// Errors returned by a Lightning node gateway
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The node is temporarily unreachable; the call may be retried
    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    /// The node rejected the call
    #[error("gateway rpc error: {0}")]
    Rpc(String),

    /// A stream ended while a message was expected
    #[error("gateway stream closed")]
    StreamClosed,

    /// A stream produced a message of the wrong kind
    #[error("unexpected update: {0}")]
    UnexpectedUpdate(String),
}

impl GatewayError {
    /// Whether the error is transient and the operation may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_) | GatewayError::StreamClosed)
    }
}

/// Result type alias for gateway calls
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Boxed stream of gateway messages
pub type GatewayStream<T> = BoxStream<'static, GatewayResult<T>>;

/// Abstract interface to the remote Lightning node
#[async_trait]
pub trait LightningGateway: Send + Sync {
    /// Node identity and counters
    async fn get_info(&self) -> GatewayResult<NodeInfo>;

    /// Register as the node's HTLC interceptor
    async fn htlc_interceptor(&self) -> GatewayResult<InterceptorStream>;

    /// Subscribe to channel lifecycle events
    async fn subscribe_channel_events(&self) -> GatewayResult<GatewayStream<ChannelEvent>>;

    /// Subscribe to on-chain wallet transactions
    async fn subscribe_transactions(&self) -> GatewayResult<GatewayStream<TransactionDetails>>;

    /// Start a channel open; the stream yields the open's progress updates
    async fn open_channel(&self, request: OpenChannelRequest) -> GatewayResult<GatewayStream<OpenStatusUpdate>>;

    /// Advance a PSBT-funded channel negotiation
    async fn funding_state_step(&self, step: FundingStateStep) -> GatewayResult<()>;

    /// Add wallet inputs and change to a PSBT
    async fn fund_psbt(&self, psbt: Vec<u8>, sat_per_vbyte: u64) -> GatewayResult<FundedPsbt>;

    /// Sign and finalize a funded PSBT
    async fn finalize_psbt(&self, funded_psbt: Vec<u8>) -> GatewayResult<FinalizedPsbt>;

    /// Broadcast a raw transaction
    async fn publish_transaction(&self, tx: Vec<u8>, label: String) -> GatewayResult<()>;

    /// Set the forwarding policy of a channel
    async fn update_channel_policy(&self, update: ChannelPolicyUpdate) -> GatewayResult<()>;

    /// Reserve a fresh SCID alias
    async fn allocate_alias(&self) -> GatewayResult<u64>;

    /// On-chain wallet balance
    async fn wallet_balance(&self) -> GatewayResult<WalletBalance>;
}

/// Node information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node ID (public key, hex)
    pub node_id: String,
    /// Node alias
    pub alias: String,
    /// Current block height
    pub block_height: u32,
    /// Number of connected peers
    pub num_peers: u32,
    /// Number of active channels
    pub num_active_channels: u32,
    /// Number of pending channels
    pub num_pending_channels: u32,
}

/// On-chain wallet balance (satoshis)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalletBalance {
    /// Confirmed balance
    pub confirmed_sat: u64,
    /// Unconfirmed balance
    pub unconfirmed_sat: u64,
}

/// `(channel id, htlc id)` pair identifying one HTLC on one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitKey {
    /// Incoming channel
    pub chan_id: u64,
    /// HTLC index on the incoming channel
    pub htlc_id: u64,
}

impl fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chan_id, self.htlc_id)
    }
}

/// An HTLC held by the node pending our decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardHtlcInterceptRequest {
    /// Incoming circuit key
    pub incoming_circuit_key: CircuitKey,
    /// Incoming amount (millisatoshis)
    pub incoming_amount_msat: u64,
    /// Incoming CLTV expiry
    pub incoming_expiry: u32,
    /// Payment hash
    pub payment_hash: [u8; 32],
    /// Requested outgoing channel (an SCID alias for our requests)
    pub outgoing_requested_chan_id: u64,
    /// Outgoing amount (millisatoshis)
    pub outgoing_amount_msat: u64,
    /// Outgoing CLTV expiry
    pub outgoing_expiry: u32,
}

/// Resolution of an intercepted HTLC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveHoldForwardAction {
    /// Settle with a preimage
    Settle,
    /// Fail back to the payer
    Fail,
    /// Continue normal forwarding
    Resume,
}

/// Our reply for one intercepted HTLC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardHtlcInterceptResponse {
    /// Incoming circuit key of the HTLC
    pub incoming_circuit_key: CircuitKey,
    /// What the node should do
    pub action: ResolveHoldForwardAction,
    /// Preimage, for `Settle`
    pub preimage: Option<[u8; 32]>,
}

impl ForwardHtlcInterceptResponse {
    /// Continue forwarding the HTLC
    pub fn resume(incoming_circuit_key: CircuitKey) -> Self {
        Self {
            incoming_circuit_key,
            action: ResolveHoldForwardAction::Resume,
            preimage: None,
        }
    }

    /// Fail the HTLC back
    pub fn fail(incoming_circuit_key: CircuitKey) -> Self {
        Self {
            incoming_circuit_key,
            action: ResolveHoldForwardAction::Fail,
            preimage: None,
        }
    }
}

/// The two halves of a registered HTLC interceptor
pub struct InterceptorStream {
    /// Sink for our replies
    pub responses: mpsc::Sender<ForwardHtlcInterceptResponse>,
    /// HTLCs intercepted by the node
    pub requests: GatewayStream<ForwardHtlcInterceptRequest>,
}

/// A channel funding outpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelPoint {
    /// Funding transaction ID (hex)
    pub funding_txid: String,
    /// Funding output index
    pub output_index: u32,
}

impl fmt::Display for ChannelPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.funding_txid, self.output_index)
    }
}

/// A channel that became active
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenChannelEvent {
    /// Remote node public key (hex)
    pub remote_pubkey: String,
    /// Funding outpoint
    pub channel_point: ChannelPoint,
    /// Channel capacity (satoshis)
    pub capacity_sat: u64,
    /// SCID aliases of the channel
    pub alias_scids: Vec<u64>,
    /// Funding shim identifier, when the node reports it
    pub pending_chan_id: Option<[u8; 32]>,
}

/// Channel lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A channel funding was broadcast
    PendingOpen {
        /// Funding outpoint
        channel_point: ChannelPoint,
    },
    /// A channel is open
    Open(OpenChannelEvent),
    /// A channel was closed
    Closed {
        /// Remote node public key (hex)
        remote_pubkey: String,
        /// Funding outpoint
        channel_point: ChannelPoint,
    },
    /// A closed channel's outputs are fully resolved
    FullyResolved {
        /// Funding outpoint
        channel_point: ChannelPoint,
    },
    /// A channel became active
    Active {
        /// Funding outpoint
        channel_point: ChannelPoint,
    },
    /// A channel became inactive
    Inactive {
        /// Funding outpoint
        channel_point: ChannelPoint,
    },
}

/// An on-chain wallet transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDetails {
    /// Transaction ID (hex)
    pub tx_hash: String,
    /// Confirmations so far
    pub num_confirmations: u32,
    /// Block height, when confirmed
    pub block_height: Option<u32>,
    /// Net amount (satoshis)
    pub amount_sat: i64,
}

/// Commitment format of a new channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitmentType {
    /// Static remote key
    StaticRemoteKey,
    /// Anchor outputs
    Anchors,
}

/// Funding shim handing the channel's funding output to an external PSBT flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsbtShim {
    /// Identifier tying FundingStateStep calls to this open
    pub pending_chan_id: [u8; 32],
    /// PSBT the channel output is appended to (empty to start a new one)
    pub base_psbt: Vec<u8>,
    /// Leave publishing to the caller
    pub no_publish: bool,
}

/// Parameters of a channel open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenChannelRequest {
    /// Remote node public key (33 bytes)
    pub node_pubkey: Vec<u8>,
    /// Local funding amount (satoshis)
    pub local_funding_amount: u64,
    /// Announce the channel
    pub private: bool,
    /// Commitment format
    pub commitment_type: CommitmentType,
    /// Usable before confirmation
    pub zero_conf: bool,
    /// Pre-allocated SCID alias for the zero-conf channel
    pub scid: Option<u64>,
    /// External funding shim
    pub funding_shim: Option<PsbtShim>,
}

/// Progress of a channel open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenStatusUpdate {
    /// The node waits for a PSBT paying the channel output
    PsbtFund {
        /// Funding output address
        funding_address: String,
        /// Funding output amount (satoshis)
        funding_amount: u64,
        /// Base PSBT extended with this channel's output
        psbt: Vec<u8>,
    },
    /// Funding transaction broadcast
    ChanPending {
        /// Funding outpoint
        channel_point: ChannelPoint,
    },
    /// Channel open
    ChanOpen {
        /// Funding outpoint
        channel_point: ChannelPoint,
    },
}

/// Steps of a PSBT-funded channel negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FundingStateStep {
    /// Check the funded PSBT pays the channel output
    PsbtVerify {
        /// Funding shim identifier
        pending_chan_id: [u8; 32],
        /// Funded PSBT
        funded_psbt: Vec<u8>,
        /// The PSBT will be published by us
        skip_finalize: bool,
    },
    /// Hand the signed PSBT to the channel
    PsbtFinalize {
        /// Funding shim identifier
        pending_chan_id: [u8; 32],
        /// Signed PSBT
        signed_psbt: Vec<u8>,
    },
    /// Abandon the negotiation
    ShimCancel {
        /// Funding shim identifier
        pending_chan_id: [u8; 32],
    },
}

/// A PSBT with wallet inputs and change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundedPsbt {
    /// Funded PSBT
    pub funded_psbt: Vec<u8>,
    /// Index of the change output, if any
    pub change_output_index: Option<u32>,
}

/// A signed PSBT and its extracted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedPsbt {
    /// Signed PSBT
    pub signed_psbt: Vec<u8>,
    /// Raw signed transaction
    pub raw_final_tx: Vec<u8>,
}

/// Forwarding policy for one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPolicyUpdate {
    /// Channel to update
    pub channel_point: ChannelPoint,
    /// Base fee (millisatoshis)
    pub base_fee_msat: u64,
    /// Proportional fee (ppm)
    pub fee_rate_ppm: u64,
    /// CLTV delta
    pub time_lock_delta: u32,
}
