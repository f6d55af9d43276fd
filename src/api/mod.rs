//! HTTP API
//!
//! This module provides the engine's HTTP surface:
//! - ILP-over-HTTP ingress for authenticated peers
//! - SPSP payment setup and STREAM connection descriptors
//! - Admin operations for assets, peers, wallet addresses, payments,
//!   quotes, and liquidity

use axum::{
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Config;
use crate::db::Database;
use crate::ledger::Ledger;
use crate::liquidity::LiquidityError;
use crate::payment::{
    IncomingPaymentError, IncomingPaymentService, OutgoingPaymentError, OutgoingPaymentService,
};
use crate::pipeline::PacketPipeline;
use crate::quote::{QuoteError, QuoteService};
use crate::receiver::ReceiverService;
use crate::webhook::WebhookService;
use crate::worker::Workers;

mod admin;
mod liquidity;
mod payments;
mod spsp;

pub use admin::{AdminError, AdminService};

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    /// Configuration
    pub config: Arc<Config>,
    /// Database handle
    pub db: Database,
    /// Ledger adapter
    pub ledger: Ledger,
    /// Packet pipeline
    pub pipeline: Arc<PacketPipeline>,
    /// Incoming payment service
    pub incoming: Arc<IncomingPaymentService>,
    /// Receiver resolver
    pub receivers: Arc<ReceiverService>,
    /// Quote engine
    pub quotes: Arc<QuoteService>,
    /// Outgoing payment service
    pub outgoing: Arc<OutgoingPaymentService>,
    /// Liquidity operations
    pub liquidity: Arc<crate::liquidity::LiquidityService>,
    /// Webhook service (not-found events)
    pub webhooks: Arc<WebhookService>,
    /// Workers (admin-triggered sweeps)
    pub workers: Arc<Workers>,
    /// Admin provisioning
    pub admin: Arc<AdminService>,
}

/// Build the API router
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // ILP-over-HTTP peer ingress
        .route("/ilp", post(spsp::handle_ilp))
        // STREAM connection descriptors
        .route("/connections/:id", get(spsp::get_connection))
        // Asset endpoints
        .route("/assets", post(admin::create_asset))
        .route("/assets/:id", get(admin::get_asset).put(admin::update_asset))
        .route("/assets/:id/liquidity", post(liquidity::add_asset_liquidity))
        .route(
            "/assets/:id/withdrawals",
            post(liquidity::create_asset_withdrawal),
        )
        .route("/assets/:id/fees", post(admin::set_fee))
        // Peer endpoints
        .route("/peers", post(admin::create_peer))
        .route(
            "/peers/:id",
            get(admin::get_peer)
                .put(admin::update_peer)
                .delete(admin::delete_peer),
        )
        .route("/peers/:id/liquidity", post(liquidity::add_peer_liquidity))
        .route(
            "/peers/:id/withdrawals",
            post(liquidity::create_peer_withdrawal),
        )
        // Wallet address endpoints
        .route("/wallet-addresses", post(admin::create_wallet_address))
        .route(
            "/wallet-addresses/:id",
            get(admin::get_wallet_address).put(admin::update_wallet_address),
        )
        .route(
            "/wallet-addresses/:id/withdrawals",
            post(liquidity::create_wallet_address_withdrawal),
        )
        .route(
            "/wallet-addresses/trigger-events",
            post(admin::trigger_wallet_address_events),
        )
        // Incoming payments
        .route("/incoming-payments", post(payments::create_incoming_payment))
        .route("/incoming-payments/:id", get(payments::get_incoming_payment))
        .route(
            "/incoming-payments/:id/complete",
            post(payments::complete_incoming_payment),
        )
        // Quotes
        .route("/quotes", post(payments::create_quote))
        .route("/quotes/:id", get(payments::get_quote))
        // Outgoing payments
        .route("/outgoing-payments", post(payments::create_outgoing_payment))
        .route("/outgoing-payments/:id", get(payments::get_outgoing_payment))
        .route(
            "/outgoing-payments/:id/fund",
            post(payments::fund_outgoing_payment),
        )
        // Withdrawal two-phase controls
        .route("/withdrawals/:id/post", post(liquidity::post_withdrawal))
        .route("/withdrawals/:id/void", post(liquidity::void_withdrawal))
        // Event liquidity
        .route("/events/:id/deposit", post(liquidity::deposit_event))
        .route("/events/:id/withdraw", post(liquidity::withdraw_event))
        // SPSP catch-all; specific routes above take precedence
        .route("/*path", get(spsp::handle_spsp))
        .with_state(state)
}

/// Start the HTTP API server with graceful shutdown
pub async fn serve_with_shutdown(
    state: ApiState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let config = state.config.clone();
    let router = build_router(state);

    let router = if config.api.enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };

    let addr: std::net::SocketAddr = config
        .api
        .bind_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;

    info!("Starting HTTP API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
            info!("Received shutdown signal, stopping API server...");
        })
        .await?;

    info!("API server stopped gracefully");
    Ok(())
}

/// Standard API response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// HTTP-style result code as a string
    pub code: String,
    /// Whether the request was successful
    pub success: bool,
    /// Human-readable message (only present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Machine-readable error kind (only present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Response data (only present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response
    pub fn success(data: T) -> Self {
        Self {
            code: "200".to_string(),
            success: true,
            message: None,
            error: None,
            data: Some(data),
        }
    }

    /// Create an error response
    pub fn error(status: StatusCode, kind: &str, message: impl Into<String>) -> Self {
        Self {
            code: status.as_u16().to_string(),
            success: false,
            message: Some(message.into()),
            error: Some(kind.to_string()),
            data: None,
        }
    }
}

/// A handler reply: status code plus envelope
pub type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

pub(crate) fn ok<T>(data: T) -> Reply<T> {
    (StatusCode::OK, Json(ApiResponse::success(data)))
}

pub(crate) fn fail<T>(status: StatusCode, kind: &str, message: impl Into<String>) -> Reply<T> {
    (status, Json(ApiResponse::error(status, kind, message)))
}

/// Map a quote error onto the response envelope
pub(crate) fn quote_error<T>(e: QuoteError) -> Reply<T> {
    let (status, kind) = match &e {
        QuoteError::UnknownWalletAddress => (StatusCode::NOT_FOUND, "UnknownWalletAddress"),
        QuoteError::InactiveWalletAddress => (StatusCode::FORBIDDEN, "InactiveWalletAddress"),
        QuoteError::InvalidAmount => (StatusCode::BAD_REQUEST, "InvalidAmount"),
        QuoteError::InvalidReceiver => (StatusCode::BAD_REQUEST, "InvalidReceiver"),
        QuoteError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database"),
    };
    fail(status, kind, e.to_string())
}

/// Map an incoming payment error onto the response envelope
pub(crate) fn incoming_error<T>(e: IncomingPaymentError) -> Reply<T> {
    let (status, kind) = match &e {
        IncomingPaymentError::UnknownWalletAddress => {
            (StatusCode::NOT_FOUND, "UnknownWalletAddress")
        }
        IncomingPaymentError::InactiveWalletAddress => {
            (StatusCode::FORBIDDEN, "InactiveWalletAddress")
        }
        IncomingPaymentError::InvalidAmount => (StatusCode::BAD_REQUEST, "InvalidAmount"),
        IncomingPaymentError::UnknownPayment => (StatusCode::NOT_FOUND, "UnknownPayment"),
        IncomingPaymentError::WrongState => (StatusCode::CONFLICT, "WrongState"),
        IncomingPaymentError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database"),
    };
    fail(status, kind, e.to_string())
}

/// Map an outgoing payment error onto the response envelope
pub(crate) fn outgoing_error<T>(e: OutgoingPaymentError) -> Reply<T> {
    let (status, kind) = match &e {
        OutgoingPaymentError::UnknownWalletAddress => {
            (StatusCode::NOT_FOUND, "UnknownWalletAddress")
        }
        OutgoingPaymentError::InactiveWalletAddress => {
            (StatusCode::FORBIDDEN, "InactiveWalletAddress")
        }
        OutgoingPaymentError::UnknownQuote => (StatusCode::NOT_FOUND, "UnknownQuote"),
        OutgoingPaymentError::InvalidQuote => (StatusCode::BAD_REQUEST, "InvalidQuote"),
        OutgoingPaymentError::UnknownPayment => (StatusCode::NOT_FOUND, "UnknownPayment"),
        OutgoingPaymentError::WrongState => (StatusCode::CONFLICT, "WrongState"),
        OutgoingPaymentError::InvalidAmount => (StatusCode::BAD_REQUEST, "InvalidAmount"),
        OutgoingPaymentError::InsufficientGrant => (StatusCode::FORBIDDEN, "InsufficientGrant"),
        OutgoingPaymentError::TransferExists => (StatusCode::CONFLICT, "TransferExists"),
        OutgoingPaymentError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database"),
    };
    fail(status, kind, e.to_string())
}

/// Map a liquidity error onto the response envelope
pub(crate) fn liquidity_error<T>(e: LiquidityError) -> Reply<T> {
    let (status, kind) = match &e {
        LiquidityError::InvalidId => (StatusCode::BAD_REQUEST, "InvalidId"),
        LiquidityError::UnknownAsset => (StatusCode::NOT_FOUND, "UnknownAsset"),
        LiquidityError::UnknownPeer => (StatusCode::NOT_FOUND, "UnknownPeer"),
        LiquidityError::UnknownWalletAddress => (StatusCode::NOT_FOUND, "UnknownWalletAddress"),
        LiquidityError::AmountZero => (StatusCode::BAD_REQUEST, "AmountZero"),
        LiquidityError::TransferExists => (StatusCode::CONFLICT, "TransferExists"),
        LiquidityError::InsufficientBalance => (StatusCode::FORBIDDEN, "InsufficientBalance"),
        LiquidityError::UnknownTransfer => (StatusCode::NOT_FOUND, "UnknownTransfer"),
        LiquidityError::AlreadyPosted => (StatusCode::CONFLICT, "AlreadyPosted"),
        LiquidityError::AlreadyVoided => (StatusCode::CONFLICT, "AlreadyVoided"),
        LiquidityError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database"),
    };
    fail(status, kind, e.to_string())
}

/// Health check endpoint
async fn health_check() -> Reply<serde_json::Value> {
    ok(serde_json::json!({"status": "ok"}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shapes() {
        let success: ApiResponse<u32> = ApiResponse::success(7);
        assert_eq!(success.code, "200");
        assert!(success.success);
        assert!(success.error.is_none());

        let failure: ApiResponse<u32> =
            ApiResponse::error(StatusCode::CONFLICT, "TransferExists", "transfer exists");
        assert_eq!(failure.code, "409");
        assert!(!failure.success);
        assert_eq!(failure.error.as_deref(), Some("TransferExists"));

        let encoded = serde_json::to_value(&failure).unwrap();
        assert!(encoded.get("data").is_none());
        assert_eq!(encoded["code"], "409");
    }
}
