//! Incoming payment service
//!
//! An incoming payment starts Pending, becomes Processing on its first
//! credit, and reaches Completed when the target amount arrives or the
//! receiver completes it explicitly. The expiry worker moves overdue
//! payments to Expired. Terminal payments lose their connection id and
//! refuse further money.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{
    Amount, AssetQueries, Database, EventWithdrawal, IncomingPaymentModel, IncomingPaymentQueries,
    IncomingPaymentState, WalletAddressQueries, WebhookEventType,
};
use crate::ledger::{AccountRegistry, LiquidityAccountKind};
use crate::stream::StreamSecrets;
use crate::webhook::WebhookService;

/// Default lifetime (hours) of an incoming payment without an explicit expiry
const DEFAULT_EXPIRY_HOURS: i64 = 24;

/// Incoming payment operation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IncomingPaymentError {
    /// The wallet address does not exist
    #[error("unknown wallet address")]
    UnknownWalletAddress,
    /// The wallet address is deactivated
    #[error("inactive wallet address")]
    InactiveWalletAddress,
    /// Zero amount or currency mismatch
    #[error("invalid amount")]
    InvalidAmount,
    /// The payment does not exist
    #[error("unknown payment")]
    UnknownPayment,
    /// The payment is not in a state that allows the operation
    #[error("wrong state")]
    WrongState,
    /// Underlying storage failure
    #[error("database error: {0}")]
    Database(String),
}

impl From<anyhow::Error> for IncomingPaymentError {
    fn from(e: anyhow::Error) -> Self {
        IncomingPaymentError::Database(e.to_string())
    }
}

/// Arguments to create an incoming payment
#[derive(Debug, Clone)]
pub struct CreateIncomingPaymentArgs {
    /// Receiving wallet address
    pub wallet_address_id: String,
    /// Optional fixed target amount
    pub incoming_amount: Option<Amount>,
    /// Optional explicit expiry
    pub expires_at: Option<DateTime<Utc>>,
    /// Caller metadata
    pub metadata: Option<serde_json::Value>,
}

/// STREAM connection descriptor served at the connection URL
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionInfo {
    /// Connection id
    pub id: String,
    /// Destination ILP address for the connection
    #[serde(rename = "ilpAddress")]
    pub ilp_address: String,
    /// Base64url shared secret
    #[serde(rename = "sharedSecret")]
    pub shared_secret: String,
    /// Asset code of the receiving account
    #[serde(rename = "assetCode")]
    pub asset_code: String,
    /// Asset scale of the receiving account
    #[serde(rename = "assetScale")]
    pub asset_scale: u8,
}

/// Service owning the incoming payment state machine
#[derive(Clone)]
pub struct IncomingPaymentService {
    config: Arc<Config>,
    db: Database,
    secrets: StreamSecrets,
}

impl IncomingPaymentService {
    /// Create the service
    pub fn new(config: Arc<Config>, db: Database, secrets: StreamSecrets) -> Self {
        Self { config, db, secrets }
    }

    /// Register the credit hook so settled ledger credits drive the state
    /// machine
    pub async fn register_hooks(self: &Arc<Self>, registry: &AccountRegistry) {
        let service = self.clone();
        registry
            .register(
                LiquidityAccountKind::IncomingPayment,
                Arc::new(move |event| {
                    let service = service.clone();
                    Box::pin(async move {
                        if let Err(e) = service.on_credit(&event.account_id, event.total_received).await
                        {
                            warn!(
                                "Incoming payment credit hook failed for {}: {}",
                                event.account_id, e
                            );
                        }
                    })
                }),
            )
            .await;
    }

    /// Create an incoming payment and its `created` webhook event
    pub async fn create(
        &self,
        args: CreateIncomingPaymentArgs,
    ) -> Result<IncomingPaymentModel, IncomingPaymentError> {
        let wallets = WalletAddressQueries::new(&self.db);
        let wallet = wallets
            .get_by_id(&args.wallet_address_id)
            .await?
            .ok_or(IncomingPaymentError::UnknownWalletAddress)?;
        if !wallet.is_active() {
            return Err(IncomingPaymentError::InactiveWalletAddress);
        }

        let asset = AssetQueries::new(&self.db)
            .get_by_id(&wallet.asset_id)
            .await?
            .ok_or_else(|| IncomingPaymentError::Database("wallet asset missing".to_string()))?;

        if let Some(amount) = &args.incoming_amount {
            if amount.value == 0
                || amount.asset_code != asset.code
                || amount.asset_scale != asset.scale
            {
                return Err(IncomingPaymentError::InvalidAmount);
            }
        }

        let now = Utc::now();
        let payment = IncomingPaymentModel {
            id: Uuid::new_v4().to_string(),
            wallet_address_id: wallet.id.clone(),
            asset_id: wallet.asset_id.clone(),
            incoming_amount: args.incoming_amount.as_ref().map(|a| a.value),
            received_amount: 0,
            state: IncomingPaymentState::Pending,
            expires_at: args
                .expires_at
                .unwrap_or(now + Duration::hours(DEFAULT_EXPIRY_HOURS)),
            connection_id: Some(Uuid::new_v4().to_string()),
            metadata: args.metadata,
            process_at: None,
            created_at: now,
            updated_at: now,
        };

        {
            let conn = self.db.conn();
            let mut conn = conn.lock().await;
            let tx = conn
                .transaction()
                .map_err(|e| IncomingPaymentError::Database(e.to_string()))?;
            IncomingPaymentQueries::insert_tx(&tx, &payment)?;
            WebhookService::enqueue_tx(
                &tx,
                WebhookEventType::IncomingPaymentCreated,
                self.event_data(&payment, &asset.code, asset.scale),
                None,
            )?;
            tx.commit()
                .map_err(|e| IncomingPaymentError::Database(e.to_string()))?;
        }

        info!(
            "Created incoming payment {} for wallet address {}",
            payment.id, wallet.id
        );
        Ok(payment)
    }

    /// Load a payment
    pub async fn get(&self, id: &str) -> Result<Option<IncomingPaymentModel>, IncomingPaymentError> {
        Ok(IncomingPaymentQueries::new(&self.db).get_by_id(id).await?)
    }

    /// Explicitly complete a payment
    pub async fn complete(&self, id: &str) -> Result<IncomingPaymentModel, IncomingPaymentError> {
        let queries = IncomingPaymentQueries::new(&self.db);
        let payment = queries
            .get_by_id(id)
            .await?
            .ok_or(IncomingPaymentError::UnknownPayment)?;
        if payment.state.is_terminal() {
            return Err(IncomingPaymentError::WrongState);
        }
        self.finish(
            &payment,
            IncomingPaymentState::Completed,
            WebhookEventType::IncomingPaymentCompleted,
        )
        .await?;
        let payment = queries
            .get_by_id(id)
            .await?
            .ok_or(IncomingPaymentError::UnknownPayment)?;
        Ok(payment)
    }

    /// Move an overdue payment to Expired (expiry worker)
    pub async fn expire(&self, payment: &IncomingPaymentModel) -> Result<(), IncomingPaymentError> {
        self.finish(
            payment,
            IncomingPaymentState::Expired,
            WebhookEventType::IncomingPaymentExpired,
        )
        .await
    }

    async fn finish(
        &self,
        payment: &IncomingPaymentModel,
        state: IncomingPaymentState,
        event_type: WebhookEventType,
    ) -> Result<(), IncomingPaymentError> {
        let asset = AssetQueries::new(&self.db)
            .get_by_id(&payment.asset_id)
            .await?
            .ok_or_else(|| IncomingPaymentError::Database("payment asset missing".to_string()))?;

        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| IncomingPaymentError::Database(e.to_string()))?;
        let changed = IncomingPaymentQueries::transition_tx(
            &tx,
            &payment.id,
            &[IncomingPaymentState::Pending, IncomingPaymentState::Processing],
            state,
            None,
        )?;
        if !changed {
            return Err(IncomingPaymentError::WrongState);
        }

        let received: i64 = tx
            .query_row(
                "SELECT received_amount FROM incoming_payments WHERE id = ?1",
                [&payment.id],
                |row| row.get(0),
            )
            .map_err(|e| IncomingPaymentError::Database(e.to_string()))?;
        let received = received as u64;

        // funds already received become a withdrawal for the event consumer
        let withdrawal = (received > 0).then(|| EventWithdrawal {
            account_id: payment.id.clone(),
            asset_id: payment.asset_id.clone(),
            amount: received,
        });
        let mut finished = payment.clone();
        finished.state = state;
        finished.received_amount = received;
        WebhookService::enqueue_tx(
            &tx,
            event_type,
            self.event_data(&finished, &asset.code, asset.scale),
            withdrawal,
        )?;
        tx.commit()
            .map_err(|e| IncomingPaymentError::Database(e.to_string()))?;

        info!(
            "Incoming payment {} -> {} (received {})",
            payment.id,
            state.as_str(),
            received
        );
        Ok(())
    }

    /// Ledger credit hook: track received money and complete when the
    /// target is reached
    pub async fn on_credit(&self, payment_id: &str, total_received: u64) -> Result<(), IncomingPaymentError> {
        let queries = IncomingPaymentQueries::new(&self.db);
        if !queries.record_credit(payment_id, total_received).await? {
            // terminal or unknown; nothing to track
            return Ok(());
        }
        let payment = queries
            .get_by_id(payment_id)
            .await?
            .ok_or(IncomingPaymentError::UnknownPayment)?;
        if let Some(target) = payment.incoming_amount {
            if payment.received_amount >= target {
                self.finish(
                    &payment,
                    IncomingPaymentState::Completed,
                    WebhookEventType::IncomingPaymentCompleted,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// STREAM credentials for a payment
    pub fn credentials(&self, payment: &IncomingPaymentModel) -> crate::stream::StreamCredentials {
        self.secrets.credentials(&payment.id)
    }

    /// STREAM credentials for a wallet address (SPSP fallback). Packets
    /// sent with these land on the wallet's web monetization account.
    pub fn wallet_credentials(&self, wallet_address_id: &str) -> crate::stream::StreamCredentials {
        self.secrets.credentials(wallet_address_id)
    }

    /// Connection descriptor by connection id; None once terminal
    pub async fn connection_info(
        &self,
        connection_id: &str,
    ) -> Result<Option<ConnectionInfo>, IncomingPaymentError> {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let payment = IncomingPaymentQueries::new(&self.db)
            .get_by_connection_id(connection_id)
            .await?;
        let payment = match payment {
            Some(payment) if !payment.state.is_terminal() => payment,
            _ => return Ok(None),
        };
        let asset = AssetQueries::new(&self.db)
            .get_by_id(&payment.asset_id)
            .await?
            .ok_or_else(|| IncomingPaymentError::Database("payment asset missing".to_string()))?;
        let creds = self.credentials(&payment);
        Ok(Some(ConnectionInfo {
            id: connection_id.to_string(),
            ilp_address: creds.ilp_address,
            shared_secret: URL_SAFE_NO_PAD.encode(creds.shared_secret),
            asset_code: asset.code,
            asset_scale: asset.scale,
        }))
    }

    fn event_data(
        &self,
        payment: &IncomingPaymentModel,
        asset_code: &str,
        asset_scale: u8,
    ) -> serde_json::Value {
        serde_json::json!({
            "id": payment.id,
            "walletAddressId": payment.wallet_address_id,
            "state": payment.state.as_str(),
            "incomingAmount": payment.incoming_amount.map(|value| Amount::new(value, asset_code, asset_scale)),
            "receivedAmount": Amount::new(payment.received_amount, asset_code, asset_scale),
            "expiresAt": payment.expires_at.to_rfc3339(),
            "metadata": payment.metadata,
            "openPaymentsUrl": format!("{}/incoming-payments/{}", self.config.node.open_payments_url, payment.id),
        })
    }
}
