//! Payment, quote, and funding endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use super::{fail, incoming_error, ok, outgoing_error, quote_error, ApiState, Reply};
use crate::db::{Amount, IncomingPaymentModel, OutgoingPaymentModel, QuoteModel};
use crate::payment::{
    CreateIncomingPaymentArgs, CreateOutgoingPaymentArgs, FundArgs, GrantLimits, PaymentGrant,
    RepeatingInterval,
};
use crate::quote::CreateQuoteArgs;

/// Create-incoming-payment request body
#[derive(Debug, Deserialize)]
pub struct CreateIncomingPaymentRequest {
    /// Receiving wallet address
    #[serde(rename = "walletAddressId")]
    pub wallet_address_id: String,
    /// Optional target amount
    #[serde(rename = "incomingAmount")]
    pub incoming_amount: Option<Amount>,
    /// Optional expiry
    #[serde(rename = "expiresAt")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Caller metadata
    pub metadata: Option<serde_json::Value>,
}

/// Create an incoming payment
pub async fn create_incoming_payment(
    State(state): State<ApiState>,
    axum::Json(req): axum::Json<CreateIncomingPaymentRequest>,
) -> Reply<IncomingPaymentModel> {
    match state
        .incoming
        .create(CreateIncomingPaymentArgs {
            wallet_address_id: req.wallet_address_id,
            incoming_amount: req.incoming_amount,
            expires_at: req.expires_at,
            metadata: req.metadata,
        })
        .await
    {
        Ok(payment) => ok(payment),
        Err(e) => incoming_error(e),
    }
}

/// Get an incoming payment
pub async fn get_incoming_payment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Reply<IncomingPaymentModel> {
    match state.incoming.get(&id).await {
        Ok(Some(payment)) => ok(payment),
        Ok(None) => fail(StatusCode::NOT_FOUND, "UnknownPayment", "unknown payment"),
        Err(e) => incoming_error(e),
    }
}

/// Explicitly complete an incoming payment
pub async fn complete_incoming_payment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Reply<IncomingPaymentModel> {
    match state.incoming.complete(&id).await {
        Ok(payment) => ok(payment),
        Err(e) => incoming_error(e),
    }
}

/// Create-quote request body
#[derive(Debug, Deserialize)]
pub struct CreateQuoteRequest {
    /// Source wallet address
    #[serde(rename = "walletAddressId")]
    pub wallet_address_id: String,
    /// Receiver URL
    pub receiver: String,
    /// Fixed source amount
    #[serde(rename = "debitAmount")]
    pub debit_amount: Option<Amount>,
    /// Fixed delivery amount
    #[serde(rename = "receiveAmount")]
    pub receive_amount: Option<Amount>,
    /// Requesting client identifier
    pub client: Option<String>,
}

/// Create a quote
pub async fn create_quote(
    State(state): State<ApiState>,
    axum::Json(req): axum::Json<CreateQuoteRequest>,
) -> Reply<QuoteModel> {
    match state
        .quotes
        .create(CreateQuoteArgs {
            wallet_address_id: req.wallet_address_id,
            receiver: req.receiver,
            debit_amount: req.debit_amount,
            receive_amount: req.receive_amount,
            client: req.client,
        })
        .await
    {
        Ok(quote) => ok(quote),
        Err(e) => quote_error(e),
    }
}

/// Get a quote
pub async fn get_quote(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<QuoteModel> {
    match state.quotes.get(&id).await {
        Ok(Some(quote)) => ok(quote),
        Ok(None) => fail(StatusCode::NOT_FOUND, "UnknownQuote", "unknown quote"),
        Err(e) => quote_error(e),
    }
}

/// Grant limits as presented by the authorization layer
#[derive(Debug, Deserialize)]
pub struct GrantLimitsRequest {
    /// Receiver restriction
    pub receiver: Option<String>,
    /// Cumulative debit budget
    #[serde(rename = "debitAmount")]
    pub debit_amount: Option<Amount>,
    /// Cumulative receive budget
    #[serde(rename = "receiveAmount")]
    pub receive_amount: Option<Amount>,
    /// ISO 8601 repeating interval
    pub interval: Option<String>,
}

/// Grant reference on a payment creation
#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    /// Grant id
    pub id: String,
    /// Limits, if any
    pub limits: Option<GrantLimitsRequest>,
}

/// Create-outgoing-payment request body
#[derive(Debug, Deserialize)]
pub struct CreateOutgoingPaymentRequest {
    /// Source wallet address
    #[serde(rename = "walletAddressId")]
    pub wallet_address_id: String,
    /// Quote to consume
    #[serde(rename = "quoteId")]
    pub quote_id: String,
    /// Caller metadata
    pub metadata: Option<serde_json::Value>,
    /// Authorization grant
    pub grant: Option<GrantRequest>,
    /// Requesting client identifier
    pub client: Option<String>,
}

/// Create an outgoing payment
pub async fn create_outgoing_payment(
    State(state): State<ApiState>,
    axum::Json(req): axum::Json<CreateOutgoingPaymentRequest>,
) -> Reply<OutgoingPaymentModel> {
    let grant = match req.grant {
        Some(grant) => {
            let limits = match grant.limits {
                Some(limits) => {
                    let interval = match limits.interval.as_deref() {
                        Some(s) => match RepeatingInterval::parse(s) {
                            Some(interval) => Some(interval),
                            None => {
                                return fail(
                                    StatusCode::BAD_REQUEST,
                                    "InvalidId",
                                    "malformed grant interval",
                                )
                            }
                        },
                        None => None,
                    };
                    Some(GrantLimits {
                        receiver: limits.receiver,
                        debit_amount: limits.debit_amount,
                        receive_amount: limits.receive_amount,
                        interval,
                    })
                }
                None => None,
            };
            Some(PaymentGrant {
                id: grant.id,
                limits,
            })
        }
        None => None,
    };

    match state
        .outgoing
        .create(CreateOutgoingPaymentArgs {
            wallet_address_id: req.wallet_address_id,
            quote_id: req.quote_id,
            metadata: req.metadata,
            grant,
            client: req.client,
        })
        .await
    {
        Ok(payment) => ok(payment),
        Err(e) => outgoing_error(e),
    }
}

/// Get an outgoing payment
pub async fn get_outgoing_payment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Reply<OutgoingPaymentModel> {
    match state.outgoing.get(&id).await {
        Ok(Some(payment)) => ok(payment),
        Ok(None) => fail(StatusCode::NOT_FOUND, "UnknownPayment", "unknown payment"),
        Err(e) => outgoing_error(e),
    }
}

/// Fund request body
#[derive(Debug, Deserialize)]
pub struct FundRequest {
    /// Deposit amount; must equal the quoted debit amount
    pub amount: u64,
    /// Idempotent transfer id; generated when absent
    #[serde(rename = "transferId")]
    pub transfer_id: Option<String>,
}

/// Fund an outgoing payment
pub async fn fund_outgoing_payment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    axum::Json(req): axum::Json<FundRequest>,
) -> Reply<OutgoingPaymentModel> {
    match state
        .outgoing
        .fund(FundArgs {
            id,
            amount: req.amount,
            transfer_id: req.transfer_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        })
        .await
    {
        Ok(payment) => ok(payment),
        Err(e) => outgoing_error(e),
    }
}
