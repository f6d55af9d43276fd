//! Payment setup endpoints: SPSP, STREAM connections, and the
//! ILP-over-HTTP peer ingress

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Serialize;
use tracing::{debug, warn};

use super::{fail, ok, ApiResponse, ApiState, Reply};
use crate::db::{PeerQueries, WalletAddressQueries, WebhookEventType};
use crate::ilp::{Packet, Reject};
use crate::payment::ConnectionInfo;
use crate::pipeline::PacketSource;

/// SPSP media type
const SPSP_CONTENT_TYPE: &str = "application/spsp4+json";

/// SPSP setup response
#[derive(Debug, Serialize)]
pub struct SpspResponse {
    /// Destination ILP address for the wallet address
    pub destination_account: String,
    /// Base64url 32-byte shared secret
    pub shared_secret: String,
    /// Asset of the receiving account
    pub asset: SpspAsset,
}

/// Asset block of the SPSP response
#[derive(Debug, Serialize)]
pub struct SpspAsset {
    /// Asset code
    pub code: String,
    /// Asset scale
    pub scale: u8,
}

/// SPSP catch-all: serve payment setup for a wallet address URL
pub async fn handle_spsp(
    State(state): State<ApiState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response {
    let accepts_spsp = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains(SPSP_CONTENT_TYPE))
        .unwrap_or(false);
    if !accepts_spsp {
        return (
            StatusCode::NOT_ACCEPTABLE,
            Json(ApiResponse::<()>::error(
                StatusCode::NOT_ACCEPTABLE,
                "InvalidId",
                format!("expected Accept: {}", SPSP_CONTENT_TYPE),
            )),
        )
            .into_response();
    }

    let base = state.config.node.wallet_address_url.trim_end_matches('/');
    let url = format!("{}/{}", base, path.trim_start_matches('/'));

    let wallet = match WalletAddressQueries::new(&state.db).get_by_url(&url).await {
        Ok(wallet) => wallet,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<()>::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database",
                    e.to_string(),
                )),
            )
                .into_response()
        }
    };

    let wallet = match wallet {
        Some(wallet) if wallet.is_active() => wallet,
        _ => {
            debug!("SPSP request for unknown wallet address {}", url);
            let _ = state
                .webhooks
                .enqueue(
                    WebhookEventType::WalletAddressNotFound,
                    serde_json::json!({ "walletAddressUrl": url }),
                    None,
                )
                .await;
            return (
                StatusCode::NOT_FOUND,
                Json(ApiResponse::<()>::error(
                    StatusCode::NOT_FOUND,
                    "UnknownWalletAddress",
                    "unknown wallet address",
                )),
            )
                .into_response();
        }
    };

    let asset = match crate::db::AssetQueries::new(&state.db)
        .get_by_id(&wallet.asset_id)
        .await
    {
        Ok(Some(asset)) => asset,
        _ => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<()>::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database",
                    "wallet asset missing",
                )),
            )
                .into_response()
        }
    };

    let creds = state.incoming.wallet_credentials(&wallet.id);
    let body = SpspResponse {
        destination_account: creds.ilp_address,
        shared_secret: URL_SAFE_NO_PAD.encode(creds.shared_secret),
        asset: SpspAsset {
            code: asset.code,
            scale: asset.scale,
        },
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, SPSP_CONTENT_TYPE)],
        serde_json::to_string(&body).unwrap_or_default(),
    )
        .into_response()
}

/// STREAM connection descriptor; 404 once the payment is terminal
pub async fn get_connection(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Reply<ConnectionInfo> {
    match state.incoming.connection_info(&id).await {
        Ok(Some(info)) => ok(info),
        Ok(None) => fail(StatusCode::NOT_FOUND, "UnknownPayment", "unknown connection"),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, "Database", e.to_string()),
    }
}

/// ILP-over-HTTP ingress: authenticate the peer, run the packet through
/// the pipeline, reply with the encoded fulfill or reject
pub async fn handle_ilp(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };

    let peer = match PeerQueries::new(&state.db).get_by_incoming_token(token).await {
        Ok(Some(peer)) => peer,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "unknown token").into_response(),
        Err(e) => {
            warn!("Peer lookup failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "peer lookup failed").into_response();
        }
    };

    let reply = match Packet::decode(&body) {
        Ok(Packet::Prepare(prepare)) => {
            state
                .pipeline
                .handle(PacketSource::Peer(peer), prepare)
                .await
        }
        _ => Packet::Reject(Reject::new(
            crate::ilp::ErrorCode::InvalidPacket,
            state.config.node.ilp_address.clone(),
            "expected an ILP prepare",
        )),
    };

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        reply.encode(),
    )
        .into_response()
}
