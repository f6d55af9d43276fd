//! Outgoing payment service
//!
//! An outgoing payment consumes a quote and starts in Funding. The funding
//! deposit moves it to Sending, the lifecycle worker drives it to
//! Completed or Failed, and any residual balance rides out on the terminal
//! webhook event as a withdrawal.
//!
//! Creations that present a grant are serialized on the grant row: the
//! cumulative debit or receive budget of the current interval is re-read
//! under the lock, with Failed partial sends counted at what they actually
//! sent.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::Config;
use crate::db::{
    Amount, AssetModel, AssetQueries, Database, GrantQueries, OutgoingPaymentModel,
    OutgoingPaymentQueries, OutgoingPaymentState, QuoteModel, QuoteQueries, WalletAddressQueries,
    WebhookEventType,
};
use crate::ledger::{AccountRef, Ledger, LedgerError, LiquidityAccountKind};
use crate::payment::grant::{GrantValidation, PaymentGrant};
use crate::receiver::ReceiverService;
use crate::webhook::WebhookService;

/// Outgoing payment operation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutgoingPaymentError {
    /// The wallet address does not exist
    #[error("unknown wallet address")]
    UnknownWalletAddress,
    /// The wallet address is deactivated
    #[error("inactive wallet address")]
    InactiveWalletAddress,
    /// The quote does not exist
    #[error("unknown quote")]
    UnknownQuote,
    /// The quote is consumed, expired, mismatched, or its receiver is gone
    #[error("invalid quote")]
    InvalidQuote,
    /// The payment does not exist
    #[error("unknown payment")]
    UnknownPayment,
    /// The payment is not in a state that allows the operation
    #[error("wrong state")]
    WrongState,
    /// The funding amount does not equal the quoted debit amount
    #[error("invalid amount")]
    InvalidAmount,
    /// The grant budget cannot cover the quote
    #[error("insufficient grant")]
    InsufficientGrant,
    /// The funding transfer was already recorded
    #[error("transfer already exists")]
    TransferExists,
    /// Underlying storage failure
    #[error("database error: {0}")]
    Database(String),
}

impl From<anyhow::Error> for OutgoingPaymentError {
    fn from(e: anyhow::Error) -> Self {
        OutgoingPaymentError::Database(e.to_string())
    }
}

/// Arguments to create an outgoing payment
#[derive(Debug, Clone)]
pub struct CreateOutgoingPaymentArgs {
    /// Source wallet address
    pub wallet_address_id: String,
    /// Quote to consume
    pub quote_id: String,
    /// Caller metadata
    pub metadata: Option<serde_json::Value>,
    /// Authorization grant the payment counts against
    pub grant: Option<PaymentGrant>,
    /// Requesting client identifier
    pub client: Option<String>,
}

/// Arguments to fund a payment
#[derive(Debug, Clone)]
pub struct FundArgs {
    /// Payment to fund
    pub id: String,
    /// Deposit amount; must equal the quoted debit amount
    pub amount: u64,
    /// Idempotent ledger transfer id
    pub transfer_id: String,
}

/// Service owning the outgoing payment state machine
pub struct OutgoingPaymentService {
    config: Arc<Config>,
    db: Database,
    ledger: Ledger,
    receivers: Arc<ReceiverService>,
}

impl std::fmt::Debug for OutgoingPaymentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingPaymentService").finish_non_exhaustive()
    }
}

impl OutgoingPaymentService {
    /// Create the service
    pub fn new(
        config: Arc<Config>,
        db: Database,
        ledger: Ledger,
        receivers: Arc<ReceiverService>,
    ) -> Self {
        Self {
            config,
            db,
            ledger,
            receivers,
        }
    }

    /// Load a payment
    pub async fn get(&self, id: &str) -> Result<Option<OutgoingPaymentModel>, OutgoingPaymentError> {
        Ok(OutgoingPaymentQueries::new(&self.db).get_by_id(id).await?)
    }

    /// Create an outgoing payment from a quote
    pub async fn create(
        &self,
        args: CreateOutgoingPaymentArgs,
    ) -> Result<OutgoingPaymentModel, OutgoingPaymentError> {
        let wallet = WalletAddressQueries::new(&self.db)
            .get_by_id(&args.wallet_address_id)
            .await?
            .ok_or(OutgoingPaymentError::UnknownWalletAddress)?;
        if !wallet.is_active() {
            return Err(OutgoingPaymentError::InactiveWalletAddress);
        }

        let quote = QuoteQueries::new(&self.db)
            .get_by_id(&args.quote_id)
            .await?
            .ok_or(OutgoingPaymentError::UnknownQuote)?;
        let now = Utc::now();
        if quote.wallet_address_id != wallet.id || quote.expires_at <= now {
            return Err(OutgoingPaymentError::InvalidQuote);
        }

        let asset = AssetQueries::new(&self.db)
            .get_by_id(&quote.asset_id)
            .await?
            .ok_or_else(|| OutgoingPaymentError::Database("quote asset missing".to_string()))?;

        // a quote whose receiver is already terminal cannot be paid
        if self
            .receivers
            .resolve(&quote.receiver)
            .await
            .map_err(|e| OutgoingPaymentError::Database(e.to_string()))?
            .is_none()
        {
            return Err(OutgoingPaymentError::InvalidQuote);
        }

        let debit = Amount::new(quote.debit_amount, asset.code.clone(), asset.scale);
        let receive = Amount::new(
            quote.receive_amount,
            quote.receive_asset_code.clone(),
            quote.receive_asset_scale,
        );

        let payment = {
            let conn = self.db.conn();
            let mut conn = conn.lock().await;
            let tx = conn
                .transaction()
                .map_err(|e| OutgoingPaymentError::Database(e.to_string()))?;

            let mut interval_bounds = None;
            if let Some(grant) = &args.grant {
                // the grant row is the serialization point for creations
                // sharing a grant
                GrantQueries::insert_or_get_tx(&tx, &grant.id)
                    .map_err(|e| OutgoingPaymentError::Database(e.to_string()))?;

                if let Some(limits) = &grant.limits {
                    match limits.check_static(&quote.receiver, &debit, &receive, now) {
                        GrantValidation::Ok => {}
                        _ => return Err(OutgoingPaymentError::InsufficientGrant),
                    }
                    interval_bounds = limits
                        .interval
                        .as_ref()
                        .and_then(|interval| interval.interval_containing(now));

                    let contributions = OutgoingPaymentQueries::grant_contributions_tx(
                        &tx,
                        &grant.id,
                        interval_bounds.map(|(start, _)| start),
                    )
                    .map_err(|e| OutgoingPaymentError::Database(e.to_string()))?;

                    if let Some(limit) = &limits.debit_amount {
                        let spent: u64 = contributions
                            .iter()
                            .map(|c| match c.state {
                                OutgoingPaymentState::Failed => c.sent_amount,
                                _ => c.debit_amount,
                            })
                            .sum();
                        if quote.debit_amount > limit.value.saturating_sub(spent) {
                            return Err(OutgoingPaymentError::InsufficientGrant);
                        }
                    }
                    if let Some(limit) = &limits.receive_amount {
                        let spent: u64 = contributions
                            .iter()
                            .map(|c| match c.state {
                                // a failed partial send counts at the
                                // receive equivalent of what it sent
                                OutgoingPaymentState::Failed if c.debit_amount > 0 => {
                                    ((c.sent_amount as f64) * (c.receive_amount as f64)
                                        / (c.debit_amount as f64))
                                        .floor() as u64
                                }
                                OutgoingPaymentState::Failed => 0,
                                _ => c.receive_amount,
                            })
                            .sum();
                        if quote.receive_amount > limit.value.saturating_sub(spent) {
                            return Err(OutgoingPaymentError::InsufficientGrant);
                        }
                    }
                }
            }

            if OutgoingPaymentQueries::quote_consumed_tx(&tx, &quote.id)
                .map_err(|e| OutgoingPaymentError::Database(e.to_string()))?
            {
                return Err(OutgoingPaymentError::InvalidQuote);
            }

            let payment = OutgoingPaymentModel {
                // the payment takes the quote's id
                id: quote.id.clone(),
                wallet_address_id: wallet.id.clone(),
                quote_id: quote.id.clone(),
                state: OutgoingPaymentState::Funding,
                sent_amount: 0,
                state_attempts: 0,
                error: None,
                peer_id: None,
                grant_id: args.grant.as_ref().map(|g| g.id.clone()),
                grant_interval_start: interval_bounds.map(|(start, _)| start),
                grant_interval_end: interval_bounds.map(|(_, end)| end),
                metadata: args.metadata,
                client: args.client,
                process_at: None,
                lease_expires_at: None,
                created_at: now,
                updated_at: now,
            };
            OutgoingPaymentQueries::insert_tx(&tx, &payment)
                .map_err(|e| OutgoingPaymentError::Database(e.to_string()))?;
            WebhookService::enqueue_tx(
                &tx,
                WebhookEventType::OutgoingPaymentCreated,
                payment_event_data(&payment, &debit, &receive),
                None,
            )
            .map_err(|e| OutgoingPaymentError::Database(e.to_string()))?;
            tx.commit()
                .map_err(|e| OutgoingPaymentError::Database(e.to_string()))?;
            payment
        };

        info!(
            "Created outgoing payment {} (quote {}, debit {})",
            payment.id, quote.id, quote.debit_amount
        );
        Ok(payment)
    }

    /// Fund a payment: deposit the quoted amount into its account and move
    /// it to Sending
    pub async fn fund(&self, args: FundArgs) -> Result<OutgoingPaymentModel, OutgoingPaymentError> {
        let queries = OutgoingPaymentQueries::new(&self.db);
        let payment = queries
            .get_by_id(&args.id)
            .await?
            .ok_or(OutgoingPaymentError::UnknownPayment)?;
        if payment.state != OutgoingPaymentState::Funding {
            return Err(OutgoingPaymentError::WrongState);
        }
        let quote = QuoteQueries::new(&self.db)
            .get_by_id(&payment.quote_id)
            .await?
            .ok_or(OutgoingPaymentError::UnknownQuote)?;
        if args.amount != quote.debit_amount {
            return Err(OutgoingPaymentError::InvalidAmount);
        }

        match self
            .ledger
            .create_liquidity_account(&AccountRef::new(
                &payment.id,
                &quote.asset_id,
                LiquidityAccountKind::OutgoingPayment,
            ))
            .await
        {
            Ok(()) | Err(LedgerError::AccountAlreadyExists) => {}
            Err(e) => return Err(OutgoingPaymentError::Database(e.to_string())),
        }
        match self
            .ledger
            .create_deposit(&args.transfer_id, &payment.id, args.amount)
            .await
        {
            Ok(()) => {}
            Err(LedgerError::TransferExists) => return Err(OutgoingPaymentError::TransferExists),
            Err(e) => return Err(OutgoingPaymentError::Database(e.to_string())),
        }

        {
            let conn = self.db.conn();
            let conn = conn.lock().await;
            if !OutgoingPaymentQueries::fund_tx(&conn, &payment.id)
                .map_err(|e| OutgoingPaymentError::Database(e.to_string()))?
            {
                return Err(OutgoingPaymentError::WrongState);
            }
        }

        info!("Funded outgoing payment {} with {}", payment.id, args.amount);
        queries
            .get_by_id(&args.id)
            .await?
            .ok_or(OutgoingPaymentError::UnknownPayment)
    }

    /// The quote a payment consumed
    pub async fn quote_for(
        &self,
        payment: &OutgoingPaymentModel,
    ) -> Result<QuoteModel, OutgoingPaymentError> {
        QuoteQueries::new(&self.db)
            .get_by_id(&payment.quote_id)
            .await?
            .ok_or(OutgoingPaymentError::UnknownQuote)
    }

    /// Enqueue the terminal webhook event with the residual withdrawal
    pub async fn emit_terminal_event(
        &self,
        payment: &OutgoingPaymentModel,
        quote: &QuoteModel,
        asset: &AssetModel,
    ) -> Result<(), OutgoingPaymentError> {
        let event_type = match payment.state {
            OutgoingPaymentState::Completed => WebhookEventType::OutgoingPaymentCompleted,
            OutgoingPaymentState::Failed => WebhookEventType::OutgoingPaymentFailed,
            _ => return Err(OutgoingPaymentError::WrongState),
        };
        let residual = self
            .ledger
            .get_balance(&payment.id)
            .await
            .unwrap_or(0);
        let withdrawal = (residual > 0).then(|| crate::db::EventWithdrawal {
            account_id: payment.id.clone(),
            asset_id: quote.asset_id.clone(),
            amount: residual,
        });

        let debit = Amount::new(quote.debit_amount, asset.code.clone(), asset.scale);
        let receive = Amount::new(
            quote.receive_amount,
            quote.receive_asset_code.clone(),
            quote.receive_asset_scale,
        );
        let conn = self.db.conn();
        let conn = conn.lock().await;
        WebhookService::enqueue_tx(
            &conn,
            event_type,
            payment_event_data(payment, &debit, &receive),
            withdrawal,
        )
        .map_err(|e| OutgoingPaymentError::Database(e.to_string()))?;
        Ok(())
    }
}

fn payment_event_data(
    payment: &OutgoingPaymentModel,
    debit: &Amount,
    receive: &Amount,
) -> serde_json::Value {
    serde_json::json!({
        "id": payment.id,
        "walletAddressId": payment.wallet_address_id,
        "state": payment.state.as_str(),
        "debitAmount": debit,
        "receiveAmount": receive,
        "sentAmount": Amount::new(payment.sent_amount, debit.asset_code.clone(), debit.asset_scale),
        "error": payment.error,
        "metadata": payment.metadata,
    })
}
