//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a channel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelRequestStatus {
    /// Created, no HTLC seen yet
    Requested,
    /// At least one HTLC is held, waiting for the rest of the amount
    AwaitingPayments,
    /// Waiting for the payee to reveal the preimage (legacy flow)
    AwaitingPreimage,
    /// Full amount held, funding batch in progress
    OpeningChannel,
    /// Channel open and held HTLCs resumed
    Completed,
    /// Request abandoned, held HTLCs failed
    Failed,
}

impl ChannelRequestStatus {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::AwaitingPayments => "AWAITINGPAYMENTS",
            Self::AwaitingPreimage => "AWAITINGPREIMAGE",
            Self::OpeningChannel => "OPENINGCHANNEL",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Whether HTLCs for this request may still be intercepted and held
    pub fn accepts_htlcs(&self) -> bool {
        matches!(self, Self::Requested | Self::AwaitingPayments)
    }

    /// Whether the request is still collecting payments
    pub fn is_collecting(&self) -> bool {
        matches!(self, Self::AwaitingPayments | Self::AwaitingPreimage)
    }

    /// Whether the request has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ChannelRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelRequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQUESTED" => Ok(Self::Requested),
            "AWAITINGPAYMENTS" => Ok(Self::AwaitingPayments),
            "AWAITINGPREIMAGE" => Ok(Self::AwaitingPreimage),
            "OPENINGCHANNEL" => Ok(Self::OpeningChannel),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown channel request status: {}", other)),
        }
    }
}

/// Channel request database model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRequestModel {
    /// Surrogate ID
    pub id: i64,
    /// Payment hash of the payment funding this channel
    pub payment_hash: [u8; 32],
    /// Preimage of `payment_hash`
    pub preimage: [u8; 32],
    /// Funding shim identifier, unique per request
    pub pending_chan_id: [u8; 32],
    /// Remote node public key (hex)
    pub pubkey: String,
    /// Amount the payer must route through us (millisatoshis)
    pub amount_msat: i64,
    /// Pre-allocated SCID alias for the zero-conf channel
    pub scid: u64,
    /// Sum of accepted HTLC amounts (millisatoshis)
    pub settled_msat: i64,
    /// Request status
    pub status: ChannelRequestStatus,
    /// Local funding amount (satoshis), once the open was started
    pub funding_amount: Option<i64>,
    /// Funding transaction ID, once the channel opened
    pub funding_tx_id: Option<String>,
    /// Funding output index, once the channel opened
    pub output_index: Option<u32>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Fields of a channel request supplied at creation
#[derive(Debug, Clone)]
pub struct NewChannelRequest {
    /// Payment hash
    pub payment_hash: [u8; 32],
    /// Preimage of `payment_hash`
    pub preimage: [u8; 32],
    /// Funding shim identifier
    pub pending_chan_id: [u8; 32],
    /// Remote node public key (hex)
    pub pubkey: String,
    /// Requested amount (millisatoshis)
    pub amount_msat: i64,
    /// Pre-allocated SCID alias
    pub scid: u64,
}

/// An intercepted HTLC attributed to a channel request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRequestHtlcModel {
    /// Surrogate ID
    pub id: i64,
    /// Owning channel request
    pub channel_request_id: i64,
    /// Incoming channel of the circuit key
    pub chan_id: u64,
    /// HTLC index on the incoming channel
    pub htlc_id: u64,
    /// Incoming amount (millisatoshis)
    pub amount_msat: i64,
    /// Resumed onto the new channel
    pub is_settled: bool,
    /// Failed back to the payer
    pub is_failed: bool,
}

impl ChannelRequestHtlcModel {
    /// Still held: neither resumed nor failed
    pub fn is_held(&self) -> bool {
        !self.is_settled && !self.is_failed
    }
}

/// One funding transaction batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsbtFundingStateModel {
    /// Surrogate ID
    pub id: i64,
    /// Node the batch belongs to
    pub node_id: String,
    /// PSBT the first participant was enrolled on (empty)
    pub base_psbt: Vec<u8>,
    /// Latest accumulated, unsigned PSBT
    pub psbt: Vec<u8>,
    /// PSBT with wallet inputs and change added
    pub funded_psbt: Option<Vec<u8>>,
    /// Finalized PSBT
    pub signed_psbt: Option<Vec<u8>>,
    /// Raw signed transaction
    pub signed_tx: Option<Vec<u8>>,
    /// ID of the published funding transaction
    pub funding_tx_id: Option<String>,
    /// End of the batch window
    pub expiry_date: DateTime<Utc>,
    /// Batch abandoned
    pub is_failed: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl PsbtFundingStateModel {
    /// The batch has not been funded, published or failed yet
    pub fn is_open(&self) -> bool {
        !self.is_failed && self.funded_psbt.is_none()
    }
}

/// A pre-allocated SCID alias
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeScidModel {
    /// Surrogate ID
    pub id: i64,
    /// Owning node
    pub node_id: String,
    /// Short channel ID alias
    pub scid: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_db_string() {
        for status in [
            ChannelRequestStatus::Requested,
            ChannelRequestStatus::AwaitingPayments,
            ChannelRequestStatus::AwaitingPreimage,
            ChannelRequestStatus::OpeningChannel,
            ChannelRequestStatus::Completed,
            ChannelRequestStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ChannelRequestStatus>(), Ok(status));
        }
        assert!("pending_payment".parse::<ChannelRequestStatus>().is_err());
    }

    #[test]
    fn test_status_predicates() {
        assert!(ChannelRequestStatus::Requested.accepts_htlcs());
        assert!(!ChannelRequestStatus::OpeningChannel.accepts_htlcs());
        assert!(ChannelRequestStatus::AwaitingPreimage.is_collecting());
        assert!(!ChannelRequestStatus::Requested.is_collecting());
        assert!(ChannelRequestStatus::Failed.is_terminal());
    }
}
