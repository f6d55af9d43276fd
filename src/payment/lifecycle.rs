//! Outgoing payment lifecycle
//!
//! The lifecycle worker claims one due Sending payment at a time, runs a
//! single pay step against the packet pipeline, and persists the outcome:
//! retry with exponential backoff on retryable errors, Failed on fatal
//! ones or an exhausted attempt budget, Completed when the quoted delivery
//! is done. Terminal transitions enqueue the matching webhook event with
//! the residual balance attached as a withdrawal.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{
    AssetModel, AssetQueries, Database, OutgoingPaymentModel, OutgoingPaymentQueries,
    OutgoingPaymentState, WalletAddressQueries,
};
use crate::ilp::{ErrorCode, Packet, Prepare};
use crate::pipeline::{PacketPipeline, PacketSource};
use crate::receiver::{Receiver, ReceiverService};
use crate::stream;

use super::outgoing::OutgoingPaymentService;

/// Lease held on a payment while one worker runs its pay step
const CLAIM_LEASE_SECS: i64 = 60;

/// Ceiling on packets per pay step
const MAX_PACKETS_PER_STEP: u64 = 10_000;

/// Errors surfaced by the pay runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PayError {
    /// The receiver closed the connection
    #[error("receiver closed the stream")]
    ClosedByReceiver,
    /// No progress was made before the idle deadline
    #[error("stream idle timeout")]
    IdleTimeout,
    /// The connection could not be established
    #[error("could not establish stream")]
    EstablishmentFailed,
    /// The realized rate fell below the quoted minimum
    #[error("insufficient exchange rate")]
    InsufficientExchangeRate,
    /// The rate probe failed
    #[error("rate probe failed")]
    RateProbeFailed,
    /// A connector between here and the receiver rejected temporarily
    #[error("connector error")]
    ConnectorError,
    /// The receiver broke protocol
    #[error("receiver protocol violation")]
    ReceiverProtocolViolation,
    /// The receiver's asset changed mid-payment
    #[error("destination asset conflict")]
    DestinationAssetConflict,
    /// The receiver cannot accept the quoted amount
    #[error("incompatible receive max")]
    IncompatibleReceiveMax,
    /// The sender produced an invalid packet sequence
    #[error("invalid generated sequence")]
    InvalidGeneratedSequence,
    /// The source wallet's asset no longer matches the quote
    #[error("source asset conflict")]
    SourceAssetConflict,
}

impl PayError {
    /// Whether a later attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ClosedByReceiver
                | Self::IdleTimeout
                | Self::EstablishmentFailed
                | Self::InsufficientExchangeRate
                | Self::RateProbeFailed
                | Self::ConnectorError
        )
    }
}

/// One pay attempt's plan, derived from the quote and prior progress
#[derive(Debug, Clone)]
pub struct PayPlan {
    /// Payment being driven
    pub payment_id: String,
    /// Ledger account holding the reserved source amount
    pub source_account_id: String,
    /// Source asset
    pub source_asset: AssetModel,
    /// Resolved receiver credentials
    pub receiver: Receiver,
    /// Source budget left
    pub debit_remaining: u64,
    /// Delivery target left
    pub receive_remaining: u64,
    /// Per-packet ceiling
    pub max_packet_amount: u64,
    /// Quoted minimum exchange rate
    pub min_exchange_rate: f64,
    /// Quoted low rate estimate used to size packets
    pub low_exchange_rate: f64,
}

/// Progress of one pay attempt
#[derive(Debug, Clone, PartialEq)]
pub struct PayOutcome {
    /// Source amount sent this attempt
    pub amount_sent: u64,
    /// Destination amount delivered this attempt (rate-derived)
    pub amount_delivered: u64,
    /// Error that stopped the attempt, if any
    pub error: Option<PayError>,
}

/// The pay runtime: sends value toward a receiver per a plan
#[async_trait]
pub trait PaySender: Send + Sync {
    /// Run one pay attempt
    async fn pay(&self, plan: &PayPlan) -> PayOutcome;
}

/// Production sender: streams packets through the pipeline
pub struct StreamPaySender {
    pipeline: Arc<PacketPipeline>,
}

impl StreamPaySender {
    /// Create the sender over a pipeline
    pub fn new(pipeline: Arc<PacketPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl PaySender for StreamPaySender {
    async fn pay(&self, plan: &PayPlan) -> PayOutcome {
        let mut sent: u64 = 0;
        let mut delivered: u64 = 0;
        let mut max_packet = plan.max_packet_amount.max(1);
        let rate = plan.low_exchange_rate;
        let mut sequence: u64 = 0;

        loop {
            let remaining_receive = plan.receive_remaining.saturating_sub(delivered);
            let remaining_debit = plan.debit_remaining.saturating_sub(sent);
            if remaining_receive == 0 || remaining_debit == 0 {
                return PayOutcome {
                    amount_sent: sent,
                    amount_delivered: delivered,
                    error: None,
                };
            }
            if rate <= 0.0 {
                return PayOutcome {
                    amount_sent: sent,
                    amount_delivered: delivered,
                    error: Some(PayError::RateProbeFailed),
                };
            }
            sequence += 1;
            if sequence > MAX_PACKETS_PER_STEP {
                return PayOutcome {
                    amount_sent: sent,
                    amount_delivered: delivered,
                    error: Some(PayError::IdleTimeout),
                };
            }

            let needed = (remaining_receive as f64 / rate).ceil() as u64;
            let amount = remaining_debit.min(max_packet).min(needed.max(1));
            let data = sequence.to_be_bytes().to_vec();
            let condition = stream::condition(&plan.receiver.shared_secret, &data);
            let prepare = Prepare {
                amount,
                expires_at: Utc::now() + Duration::seconds(30),
                execution_condition: condition,
                destination: plan.receiver.ilp_address.clone(),
                data,
            };

            let reply = self
                .pipeline
                .handle(
                    PacketSource::Payment {
                        account_id: plan.source_account_id.clone(),
                        asset: plan.source_asset.clone(),
                    },
                    prepare,
                )
                .await;

            match reply {
                Packet::Fulfill(_) => {
                    sent += amount;
                    delivered += (amount as f64 * rate).floor() as u64;
                }
                Packet::Reject(reject) => {
                    let error = match reject.code {
                        ErrorCode::AmountTooLarge => {
                            // the cap rides in the reject data; otherwise halve
                            let cap = reject
                                .data
                                .get(8..16)
                                .and_then(|b| b.try_into().ok())
                                .map(u64::from_be_bytes)
                                .filter(|cap| *cap > 0 && *cap < amount);
                            max_packet = cap.unwrap_or(amount / 2);
                            if max_packet == 0 {
                                Some(PayError::ConnectorError)
                            } else {
                                continue;
                            }
                        }
                        ErrorCode::Unreachable => Some(PayError::ClosedByReceiver),
                        ErrorCode::WrongCondition
                        | ErrorCode::UnexpectedPayment
                        | ErrorCode::BadRequest
                        | ErrorCode::InvalidPacket
                        | ErrorCode::ApplicationError => Some(PayError::ReceiverProtocolViolation),
                        _ => Some(PayError::ConnectorError),
                    };
                    return PayOutcome {
                        amount_sent: sent,
                        amount_delivered: delivered,
                        error,
                    };
                }
                Packet::Prepare(_) => {
                    return PayOutcome {
                        amount_sent: sent,
                        amount_delivered: delivered,
                        error: Some(PayError::ReceiverProtocolViolation),
                    };
                }
            }
        }
    }
}

/// Drives Sending payments, one claimed step at a time
pub struct PaymentLifecycle {
    config: Arc<Config>,
    db: Database,
    outgoing: Arc<OutgoingPaymentService>,
    receivers: Arc<ReceiverService>,
    sender: Arc<dyn PaySender>,
}

impl PaymentLifecycle {
    /// Create the lifecycle runner
    pub fn new(
        config: Arc<Config>,
        db: Database,
        outgoing: Arc<OutgoingPaymentService>,
        receivers: Arc<ReceiverService>,
        sender: Arc<dyn PaySender>,
    ) -> Self {
        Self {
            config,
            db,
            outgoing,
            receivers,
            sender,
        }
    }

    /// Retry delay after `attempts` tries
    pub fn backoff(&self, attempts: u32) -> Duration {
        let base = self.config.workers.retry_backoff_secs as i64;
        Duration::seconds(base.saturating_mul(1i64 << attempts.min(30)))
    }

    /// Claim one due payment and run a pay step. Returns false when no
    /// payment was due.
    pub async fn process_one(&self) -> anyhow::Result<bool> {
        let queries = OutgoingPaymentQueries::new(&self.db);
        let payment = queries
            .claim_due(Utc::now(), Duration::seconds(CLAIM_LEASE_SECS))
            .await?;
        let payment = match payment {
            Some(payment) => payment,
            None => return Ok(false),
        };
        debug!("Claimed outgoing payment {} for a pay step", payment.id);
        self.step(payment).await?;
        Ok(true)
    }

    async fn step(&self, payment: OutgoingPaymentModel) -> anyhow::Result<()> {
        let quote = self.outgoing.quote_for(&payment).await?;
        let asset = AssetQueries::new(&self.db)
            .get_by_id(&quote.asset_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("quote asset missing"))?;
        let wallet = WalletAddressQueries::new(&self.db)
            .get_by_id(&payment.wallet_address_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("payment wallet missing"))?;

        if wallet.asset_id != quote.asset_id {
            return self
                .finish(payment, 0, Some(PayError::SourceAssetConflict), &quote, &asset)
                .await;
        }

        let delivered_so_far = if quote.debit_amount > 0 {
            ((payment.sent_amount as f64) * (quote.receive_amount as f64)
                / (quote.debit_amount as f64))
                .floor() as u64
        } else {
            0
        };
        if delivered_so_far >= quote.receive_amount || payment.sent_amount >= quote.debit_amount {
            return self.finish(payment, 0, None, &quote, &asset).await;
        }

        let receiver = match self.receivers.resolve(&quote.receiver).await? {
            Some(receiver) => receiver,
            None => {
                // receiver gone or terminal; retry until the budget decides
                return self
                    .finish(payment, 0, Some(PayError::ClosedByReceiver), &quote, &asset)
                    .await;
            }
        };
        let plan = PayPlan {
            payment_id: payment.id.clone(),
            source_account_id: payment.id.clone(),
            source_asset: asset.clone(),
            receiver,
            debit_remaining: quote.debit_amount.saturating_sub(payment.sent_amount),
            receive_remaining: quote.receive_amount.saturating_sub(delivered_so_far),
            max_packet_amount: quote.max_packet_amount,
            min_exchange_rate: quote.min_exchange_rate,
            low_exchange_rate: quote.low_estimated_exchange_rate,
        };

        let outcome = self.sender.pay(&plan).await;
        debug!(
            "Pay step for {}: sent {}, delivered {}, error {:?}",
            payment.id, outcome.amount_sent, outcome.amount_delivered, outcome.error
        );
        self.finish(payment, outcome.amount_sent, outcome.error, &quote, &asset)
            .await
    }

    async fn finish(
        &self,
        payment: OutgoingPaymentModel,
        sent_delta: u64,
        error: Option<PayError>,
        quote: &crate::db::QuoteModel,
        asset: &AssetModel,
    ) -> anyhow::Result<()> {
        let queries = OutgoingPaymentQueries::new(&self.db);
        let new_sent = payment.sent_amount + sent_delta;

        let (state, attempts, error_text, process_at) = match error {
            None => (OutgoingPaymentState::Completed, payment.state_attempts, None, None),
            Some(error) if error.is_retryable() => {
                let attempts = payment.state_attempts + 1;
                if attempts >= self.config.workers.max_state_attempts {
                    (OutgoingPaymentState::Failed, attempts, Some(error), None)
                } else {
                    let next = Utc::now() + self.backoff(payment.state_attempts);
                    (OutgoingPaymentState::Sending, attempts, Some(error), Some(next))
                }
            }
            Some(error) => (
                OutgoingPaymentState::Failed,
                payment.state_attempts + 1,
                Some(error),
                None,
            ),
        };

        let error_string = error_text.map(|e| e.to_string());
        queries
            .finish_step(
                &payment.id,
                state,
                new_sent,
                attempts,
                error_string.as_deref(),
                process_at,
            )
            .await?;

        match state {
            OutgoingPaymentState::Completed => {
                info!(
                    "Outgoing payment {} completed (sent {})",
                    payment.id, new_sent
                );
            }
            OutgoingPaymentState::Failed => {
                warn!(
                    "Outgoing payment {} failed after {} attempts: {:?}",
                    payment.id, attempts, error_string
                );
            }
            _ => {
                debug!(
                    "Outgoing payment {} retrying (attempt {}) at {:?}",
                    payment.id, attempts, process_at
                );
            }
        }

        if matches!(
            state,
            OutgoingPaymentState::Completed | OutgoingPaymentState::Failed
        ) {
            let finished = queries
                .get_by_id(&payment.id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("payment vanished"))?;
            self.outgoing
                .emit_terminal_event(&finished, quote, asset)
                .await
                .map_err(|e| anyhow::anyhow!("terminal event failed: {}", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Amount, WalletAddressModel, WebhookEventQueries, WebhookEventType};
    use crate::ledger::{AccountRegistry, Ledger};
    use crate::payment::{CreateOutgoingPaymentArgs, FundArgs, IncomingPaymentService};
    use crate::quote::{CreateQuoteArgs, QuoteService, RateService};
    use crate::receiver::CreateReceiverArgs;
    use crate::stream::StreamSecrets;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted sender: pops one outcome per step and debits the payment
    /// account like real packet sends would
    struct MockSender {
        ledger: Ledger,
        outcomes: Mutex<Vec<PayOutcome>>,
    }

    #[async_trait]
    impl PaySender for MockSender {
        async fn pay(&self, plan: &PayPlan) -> PayOutcome {
            let outcome = self.outcomes.lock().unwrap().remove(0);
            if outcome.amount_sent > 0 {
                self.ledger
                    .create_withdrawal(
                        &uuid::Uuid::new_v4().to_string(),
                        &plan.source_account_id,
                        outcome.amount_sent,
                        None,
                    )
                    .await
                    .unwrap();
            }
            outcome
        }
    }

    struct Fixture {
        db: Database,
        ledger: Ledger,
        outgoing: Arc<OutgoingPaymentService>,
        receivers: Arc<ReceiverService>,
        quotes: QuoteService,
        config: Arc<Config>,
    }

    async fn fixture() -> Fixture {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let mut config = Config::default();
        config.quotes.slippage = 0.0;
        let config = Arc::new(config);
        let ledger = Ledger::new(db.clone(), AccountRegistry::new());
        let secrets = StreamSecrets::new([42u8; 32], config.node.ilp_address.clone());
        let incoming = Arc::new(IncomingPaymentService::new(
            config.clone(),
            db.clone(),
            secrets,
        ));
        incoming.register_hooks(ledger.registry()).await;
        let receivers = Arc::new(ReceiverService::new(config.clone(), db.clone(), incoming));
        let rates = Arc::new(RateService::with_rates("USD", HashMap::new()));
        let quotes = QuoteService::new(config.clone(), db.clone(), rates, receivers.clone());
        let outgoing = Arc::new(OutgoingPaymentService::new(
            config.clone(),
            db.clone(),
            ledger.clone(),
            receivers.clone(),
        ));

        let now = Utc::now();
        AssetQueries::new(&db)
            .insert(&AssetModel {
                id: "usd".to_string(),
                code: "USD".to_string(),
                scale: 2,
                withdrawal_threshold: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        let wallets = WalletAddressQueries::new(&db);
        for (id, url) in [
            ("wa-a", "http://127.0.0.1:3001/alice"),
            ("wa-b", "http://127.0.0.1:3001/bob"),
        ] {
            wallets
                .insert(&WalletAddressModel {
                    id: id.to_string(),
                    url: url.to_string(),
                    asset_id: "usd".to_string(),
                    public_name: None,
                    total_events_amount: 0,
                    process_at: None,
                    deactivated_at: None,
                    created_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();
        }

        Fixture {
            db,
            ledger,
            outgoing,
            receivers,
            quotes,
            config,
        }
    }

    async fn funded_payment(fixture: &Fixture, debit: u64) -> OutgoingPaymentModel {
        let receiver = fixture
            .receivers
            .create_receiver(CreateReceiverArgs {
                wallet_address_url: "http://127.0.0.1:3001/bob".to_string(),
                incoming_amount: None,
                expires_at: None,
                metadata: None,
            })
            .await
            .unwrap();
        let quote = fixture
            .quotes
            .create(CreateQuoteArgs {
                wallet_address_id: "wa-a".to_string(),
                receiver: receiver.url,
                debit_amount: Some(Amount::new(debit, "USD", 2)),
                receive_amount: None,
                client: None,
            })
            .await
            .unwrap();
        let payment = fixture
            .outgoing
            .create(CreateOutgoingPaymentArgs {
                wallet_address_id: "wa-a".to_string(),
                quote_id: quote.id,
                metadata: None,
                grant: None,
                client: None,
            })
            .await
            .unwrap();
        fixture
            .outgoing
            .fund(FundArgs {
                id: payment.id.clone(),
                amount: debit,
                transfer_id: format!("fund-{}", payment.id),
            })
            .await
            .unwrap()
    }

    fn lifecycle_with(fixture: &Fixture, outcomes: Vec<PayOutcome>) -> PaymentLifecycle {
        PaymentLifecycle::new(
            fixture.config.clone(),
            fixture.db.clone(),
            fixture.outgoing.clone(),
            fixture.receivers.clone(),
            Arc::new(MockSender {
                ledger: fixture.ledger.clone(),
                outcomes: Mutex::new(outcomes),
            }),
        )
    }

    #[tokio::test]
    async fn test_successful_step_completes_payment() {
        let fixture = fixture().await;
        let payment = funded_payment(&fixture, 100).await;
        let lifecycle = lifecycle_with(
            &fixture,
            vec![PayOutcome {
                amount_sent: 100,
                amount_delivered: 100,
                error: None,
            }],
        );

        assert!(lifecycle.process_one().await.unwrap());
        let finished = fixture.outgoing.get(&payment.id).await.unwrap().unwrap();
        assert_eq!(finished.state, OutgoingPaymentState::Completed);
        assert_eq!(finished.sent_amount, 100);

        let events = WebhookEventQueries::new(&fixture.db)
            .list_due(Utc::now(), 20)
            .await
            .unwrap();
        let completed = events
            .iter()
            .find(|e| e.event_type == WebhookEventType::OutgoingPaymentCompleted)
            .unwrap();
        // fully sent: no residual withdrawal
        assert!(completed.withdrawal.is_none());
    }

    #[tokio::test]
    async fn test_retryable_errors_back_off_then_fail_with_partial_sent() {
        let fixture = fixture().await;
        let payment = funded_payment(&fixture, 100).await;

        // every attempt moves 10 units then the receiver closes
        let attempt = PayOutcome {
            amount_sent: 10,
            amount_delivered: 10,
            error: Some(PayError::ClosedByReceiver),
        };
        let max = fixture.config.workers.max_state_attempts as usize;
        let lifecycle = lifecycle_with(&fixture, vec![attempt; max]);

        for k in 0..max {
            // clear the backoff so the claim finds the payment again
            if k > 0 {
                let conn = fixture.db.conn();
                let conn = conn.lock().await;
                conn.execute(
                    "UPDATE outgoing_payments SET process_at = ?1 WHERE id = ?2",
                    rusqlite::params![Utc::now(), &payment.id],
                )
                .unwrap();
            }
            assert!(lifecycle.process_one().await.unwrap());
        }

        let finished = fixture.outgoing.get(&payment.id).await.unwrap().unwrap();
        assert_eq!(finished.state, OutgoingPaymentState::Failed);
        assert_eq!(finished.sent_amount, 50);
        assert_eq!(finished.state_attempts, max as u32);
        assert!(finished.error.is_some());

        // the failed event carries the residual 100 - 50
        let events = WebhookEventQueries::new(&fixture.db)
            .list_due(Utc::now(), 20)
            .await
            .unwrap();
        let failed = events
            .iter()
            .find(|e| e.event_type == WebhookEventType::OutgoingPaymentFailed)
            .unwrap();
        assert_eq!(failed.withdrawal.as_ref().unwrap().amount, 50);
    }

    #[tokio::test]
    async fn test_retry_schedules_exponential_backoff() {
        let fixture = fixture().await;
        let payment = funded_payment(&fixture, 100).await;
        let lifecycle = lifecycle_with(
            &fixture,
            vec![PayOutcome {
                amount_sent: 0,
                amount_delivered: 0,
                error: Some(PayError::ConnectorError),
            }],
        );

        let before = Utc::now();
        assert!(lifecycle.process_one().await.unwrap());
        let after = fixture.outgoing.get(&payment.id).await.unwrap().unwrap();
        assert_eq!(after.state, OutgoingPaymentState::Sending);
        assert_eq!(after.state_attempts, 1);
        let base = fixture.config.workers.retry_backoff_secs as i64;
        let scheduled = after.process_at.unwrap();
        assert!(scheduled >= before + Duration::seconds(base));
        assert!(scheduled <= Utc::now() + Duration::seconds(base) + Duration::seconds(2));
    }

    #[tokio::test]
    async fn test_fatal_error_fails_immediately() {
        let fixture = fixture().await;
        let payment = funded_payment(&fixture, 100).await;
        let lifecycle = lifecycle_with(
            &fixture,
            vec![PayOutcome {
                amount_sent: 0,
                amount_delivered: 0,
                error: Some(PayError::ReceiverProtocolViolation),
            }],
        );

        assert!(lifecycle.process_one().await.unwrap());
        let finished = fixture.outgoing.get(&payment.id).await.unwrap().unwrap();
        assert_eq!(finished.state, OutgoingPaymentState::Failed);
    }

    #[tokio::test]
    async fn test_claim_skips_leased_payment() {
        let fixture = fixture().await;
        let _payment = funded_payment(&fixture, 100).await;

        let queries = OutgoingPaymentQueries::new(&fixture.db);
        // first claim takes the lease
        let first = queries
            .claim_due(Utc::now(), Duration::seconds(60))
            .await
            .unwrap();
        assert!(first.is_some());
        // a concurrent worker sees nothing claimable
        let second = queries
            .claim_due(Utc::now(), Duration::seconds(60))
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_nothing_due_returns_false() {
        let fixture = fixture().await;
        let lifecycle = lifecycle_with(&fixture, vec![]);
        assert!(!lifecycle.process_one().await.unwrap());
    }
}
