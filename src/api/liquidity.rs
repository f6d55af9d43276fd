//! Liquidity endpoints

use axum::extract::{Path, State};
use chrono::Duration;
use serde::Deserialize;
use uuid::Uuid;

use super::{liquidity_error, ok, ApiState, Reply};

fn default_transfer_id() -> String {
    Uuid::new_v4().to_string()
}

/// Deposit request body
#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    /// Amount to deposit
    pub amount: u64,
    /// Idempotent transfer id; generated when absent
    #[serde(rename = "transferId")]
    pub transfer_id: Option<String>,
    /// Operation idempotency key
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: Option<String>,
}

/// Withdrawal request body
#[derive(Debug, Deserialize)]
pub struct WithdrawalRequest {
    /// Amount to withdraw
    pub amount: u64,
    /// Withdrawal (transfer) id; generated when absent
    #[serde(rename = "withdrawalId")]
    pub withdrawal_id: Option<String>,
    /// Seconds before the pending withdrawal auto-voids
    #[serde(rename = "timeoutSeconds", default = "default_withdrawal_timeout")]
    pub timeout_seconds: u64,
    /// Operation idempotency key
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: Option<String>,
}

fn default_withdrawal_timeout() -> u64 {
    60
}

/// Wallet address withdrawal request body (amount is the full balance)
#[derive(Debug, Deserialize)]
pub struct WalletAddressWithdrawalRequest {
    /// Withdrawal (transfer) id; generated when absent
    #[serde(rename = "withdrawalId")]
    pub withdrawal_id: Option<String>,
    /// Seconds before the pending withdrawal auto-voids
    #[serde(rename = "timeoutSeconds", default = "default_withdrawal_timeout")]
    pub timeout_seconds: u64,
    /// Operation idempotency key
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: Option<String>,
}

/// Idempotency-only request body
#[derive(Debug, Default, Deserialize)]
pub struct KeyedRequest {
    /// Operation idempotency key
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: Option<String>,
}

/// Deposit liquidity into an asset's account
pub async fn add_asset_liquidity(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    axum::Json(req): axum::Json<DepositRequest>,
) -> Reply<()> {
    let transfer_id = req.transfer_id.unwrap_or_else(default_transfer_id);
    match state
        .liquidity
        .add_asset_liquidity(&id, &transfer_id, req.amount, req.idempotency_key.as_deref())
        .await
    {
        Ok(()) => ok(()),
        Err(e) => liquidity_error(e),
    }
}

/// Deposit liquidity into a peer's account
pub async fn add_peer_liquidity(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    axum::Json(req): axum::Json<DepositRequest>,
) -> Reply<()> {
    let transfer_id = req.transfer_id.unwrap_or_else(default_transfer_id);
    match state
        .liquidity
        .add_peer_liquidity(&id, &transfer_id, req.amount, req.idempotency_key.as_deref())
        .await
    {
        Ok(()) => ok(()),
        Err(e) => liquidity_error(e),
    }
}

/// Begin a two-phase withdrawal from an asset's account
pub async fn create_asset_withdrawal(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    axum::Json(req): axum::Json<WithdrawalRequest>,
) -> Reply<serde_json::Value> {
    let withdrawal_id = req.withdrawal_id.unwrap_or_else(default_transfer_id);
    match state
        .liquidity
        .create_asset_liquidity_withdrawal(
            &id,
            &withdrawal_id,
            req.amount,
            Duration::seconds(req.timeout_seconds as i64),
            req.idempotency_key.as_deref(),
        )
        .await
    {
        Ok(()) => ok(serde_json::json!({ "withdrawalId": withdrawal_id })),
        Err(e) => liquidity_error(e),
    }
}

/// Begin a two-phase withdrawal from a peer's account
pub async fn create_peer_withdrawal(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    axum::Json(req): axum::Json<WithdrawalRequest>,
) -> Reply<serde_json::Value> {
    let withdrawal_id = req.withdrawal_id.unwrap_or_else(default_transfer_id);
    match state
        .liquidity
        .create_peer_liquidity_withdrawal(
            &id,
            &withdrawal_id,
            req.amount,
            Duration::seconds(req.timeout_seconds as i64),
            req.idempotency_key.as_deref(),
        )
        .await
    {
        Ok(()) => ok(serde_json::json!({ "withdrawalId": withdrawal_id })),
        Err(e) => liquidity_error(e),
    }
}

/// Withdraw a wallet address's accumulated balance
pub async fn create_wallet_address_withdrawal(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    axum::Json(req): axum::Json<WalletAddressWithdrawalRequest>,
) -> Reply<serde_json::Value> {
    let withdrawal_id = req.withdrawal_id.unwrap_or_else(default_transfer_id);
    match state
        .liquidity
        .create_wallet_address_withdrawal(
            &id,
            &withdrawal_id,
            Duration::seconds(req.timeout_seconds as i64),
            req.idempotency_key.as_deref(),
        )
        .await
    {
        Ok(()) => ok(serde_json::json!({ "withdrawalId": withdrawal_id })),
        Err(e) => liquidity_error(e),
    }
}

/// Commit a pending withdrawal
pub async fn post_withdrawal(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<axum::Json<KeyedRequest>>,
) -> Reply<()> {
    let key = body.and_then(|b| b.0.idempotency_key);
    match state
        .liquidity
        .post_liquidity_withdrawal(&id, key.as_deref())
        .await
    {
        Ok(()) => ok(()),
        Err(e) => liquidity_error(e),
    }
}

/// Roll back a pending withdrawal
pub async fn void_withdrawal(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<axum::Json<KeyedRequest>>,
) -> Reply<()> {
    let key = body.and_then(|b| b.0.idempotency_key);
    match state
        .liquidity
        .void_liquidity_withdrawal(&id, key.as_deref())
        .await
    {
        Ok(()) => ok(()),
        Err(e) => liquidity_error(e),
    }
}

/// Deposit the liquidity named by an `outgoing_payment.created` event
pub async fn deposit_event(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<axum::Json<KeyedRequest>>,
) -> Reply<()> {
    let key = body.and_then(|b| b.0.idempotency_key);
    match state
        .liquidity
        .deposit_event_liquidity(&id, key.as_deref())
        .await
    {
        Ok(()) => ok(()),
        Err(e) => liquidity_error(e),
    }
}

/// Execute the withdrawal attached to an event
pub async fn withdraw_event(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<axum::Json<KeyedRequest>>,
) -> Reply<()> {
    let key = body.and_then(|b| b.0.idempotency_key);
    match state
        .liquidity
        .withdraw_event_liquidity(&id, key.as_deref())
        .await
    {
        Ok(()) => ok(()),
        Err(e) => liquidity_error(e),
    }
}
