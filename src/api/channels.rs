//! Channel request API endpoints

use super::{error_to_status_code, ApiResponse, ApiState};
use crate::db::{ChannelRequestHtlcModel, ChannelRequestModel};
use crate::lsp::CreateChannelRequest;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Create a channel request
#[derive(Debug, Deserialize)]
pub struct ChannelRequestBody {
    /// Client node ID (public key, hex)
    pub pubkey: String,
    /// Amount the payer will route through the LSP (millisatoshis)
    pub amount_msat: u64,
    /// Payment hash (hex)
    pub payment_hash: String,
    /// Preimage of the payment hash (hex)
    pub preimage: String,
}

/// Create a new channel request and return its terms
pub async fn create_channel_request(
    State(state): State<ApiState>,
    Json(body): Json<ChannelRequestBody>,
) -> impl IntoResponse {
    info!(
        "API: Channel request: pubkey={}, amount_msat={}",
        body.pubkey, body.amount_msat
    );

    let req = CreateChannelRequest {
        pubkey: body.pubkey,
        amount_msat: body.amount_msat,
        payment_hash: body.payment_hash,
        preimage: body.preimage,
    };

    match state.app.lsp_service.create_channel_request(req).await {
        Ok(terms) => (StatusCode::CREATED, Json(ApiResponse::success(terms))).into_response(),
        Err(e) => {
            let status = error_to_status_code(&e);
            (status, Json(ApiResponse::<()>::error(e.to_string()))).into_response()
        }
    }
}

/// A held or resolved HTLC of a channel request
#[derive(Debug, Serialize)]
pub struct HtlcView {
    /// Circuit key, `chan_id:htlc_id`
    pub circuit_key: String,
    /// Incoming amount (millisatoshis)
    pub amount_msat: i64,
    /// Resumed onto the new channel
    pub settled: bool,
    /// Failed back to the payer
    pub failed: bool,
}

impl From<ChannelRequestHtlcModel> for HtlcView {
    fn from(htlc: ChannelRequestHtlcModel) -> Self {
        Self {
            circuit_key: format!("{}:{}", htlc.chan_id, htlc.htlc_id),
            amount_msat: htlc.amount_msat,
            settled: htlc.is_settled,
            failed: htlc.is_failed,
        }
    }
}

/// Channel request status response
#[derive(Debug, Serialize)]
pub struct ChannelRequestResponse {
    /// Request ID
    pub request_id: i64,
    /// Current status
    pub status: String,
    /// Client node ID
    pub pubkey: String,
    /// Payment hash (hex)
    pub payment_hash: String,
    /// SCID alias of the channel
    pub scid: u64,
    /// Requested amount (millisatoshis)
    pub amount_msat: i64,
    /// Amount held so far (millisatoshis)
    pub settled_msat: i64,
    /// Funding amount (satoshis), once the open started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding_amount_sat: Option<i64>,
    /// Channel point, once the channel opened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_point: Option<String>,
    /// HTLCs of the payment
    pub htlcs: Vec<HtlcView>,
    /// Creation time
    pub created_at: String,
    /// Last update time
    pub updated_at: String,
}

impl ChannelRequestResponse {
    fn new(req: ChannelRequestModel, htlcs: Vec<ChannelRequestHtlcModel>) -> Self {
        let channel_point = match (&req.funding_tx_id, req.output_index) {
            (Some(txid), Some(index)) => Some(format!("{}:{}", txid, index)),
            _ => None,
        };
        Self {
            request_id: req.id,
            status: req.status.to_string(),
            pubkey: req.pubkey,
            payment_hash: hex::encode(req.payment_hash),
            scid: req.scid,
            amount_msat: req.amount_msat,
            settled_msat: req.settled_msat,
            funding_amount_sat: req.funding_amount,
            channel_point,
            htlcs: htlcs.into_iter().map(HtlcView::from).collect(),
            created_at: req.created_at.to_rfc3339(),
            updated_at: req.updated_at.to_rfc3339(),
        }
    }
}

/// Get a channel request
pub async fn get_channel_request(
    State(state): State<ApiState>,
    Path(request_id): Path<i64>,
) -> impl IntoResponse {
    info!("API: Get channel request: request_id={}", request_id);

    match state.app.lsp_service.get_channel_request(request_id).await {
        Ok(Some((req, htlcs))) => (
            StatusCode::OK,
            Json(ApiResponse::success(ChannelRequestResponse::new(req, htlcs))),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<()>::error("Channel request not found")),
        )
            .into_response(),
        Err(e) => {
            let status = error_to_status_code(&e);
            (status, Json(ApiResponse::<()>::error(e.to_string()))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockGateway, REMOTE_PUBKEY};
    use crate::{Config, LspApp};
    use bitcoin::hashes::{sha256, Hash};
    use std::sync::Arc;

    async fn test_state() -> ApiState {
        let mut config = Config::default();
        config.database.url = "sqlite::memory:".to_string();
        let app = LspApp::new(config, Arc::new(MockGateway::new())).await.unwrap();
        app.lsp_service.init().await.unwrap();
        ApiState { app }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request_body(preimage: [u8; 32]) -> ChannelRequestBody {
        ChannelRequestBody {
            pubkey: REMOTE_PUBKEY.to_string(),
            amount_msat: 50_000_000,
            payment_hash: hex::encode(sha256::Hash::hash(&preimage).to_byte_array()),
            preimage: hex::encode(preimage),
        }
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let state = test_state().await;

        let response = create_channel_request(State(state.clone()), Json(request_body([7; 32])))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let id = created["data"]["request_id"].as_i64().unwrap();
        assert!(created["data"]["scid"].as_u64().unwrap() > 0);

        let response = get_channel_request(State(state), Path(id)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let fetched = body_json(response).await;
        assert_eq!(fetched["data"]["status"], "REQUESTED");
        assert_eq!(fetched["data"]["amount_msat"], 50_000_000);
        assert_eq!(fetched["data"]["htlcs"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_preimage() {
        let state = test_state().await;
        let mut body = request_body([7; 32]);
        body.preimage = hex::encode([8u8; 32]);

        let response = create_channel_request(State(state), Json(body)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_unknown_request() {
        let state = test_state().await;
        let response = get_channel_request(State(state), Path(42)).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
