//! Quote engine
//!
//! A quote is a time-bounded commitment: for a source wallet address and a
//! resolved receiver it fixes the debit amount, the receive amount, the
//! minimum acceptable exchange rate, and the per-packet ceiling. Quotes are
//! single-use inputs to outgoing payments.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::db::{
    Amount, AssetQueries, Database, FeeQueries, FeeType, QuoteModel, QuoteQueries,
    WalletAddressQueries,
};
use crate::receiver::ReceiverService;

mod fee;
mod rates;

pub use fee::Fee;
pub use rates::RateService;

/// Quote creation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuoteError {
    /// The wallet address does not exist
    #[error("unknown wallet address")]
    UnknownWalletAddress,
    /// The wallet address is deactivated
    #[error("inactive wallet address")]
    InactiveWalletAddress,
    /// Non-positive amount, both or neither amount given, or currency
    /// mismatch
    #[error("invalid amount")]
    InvalidAmount,
    /// The receiver is unknown, terminal, or unreachable
    #[error("invalid receiver")]
    InvalidReceiver,
    /// Underlying storage or rate lookup failure
    #[error("quote failed: {0}")]
    Database(String),
}

impl From<anyhow::Error> for QuoteError {
    fn from(e: anyhow::Error) -> Self {
        QuoteError::Database(e.to_string())
    }
}

/// Arguments to create a quote
#[derive(Debug, Clone)]
pub struct CreateQuoteArgs {
    /// Source wallet address
    pub wallet_address_id: String,
    /// Receiver URL
    pub receiver: String,
    /// Fixed source amount (exclusive with `receive_amount`)
    pub debit_amount: Option<Amount>,
    /// Fixed delivery amount (exclusive with `debit_amount`)
    pub receive_amount: Option<Amount>,
    /// Requesting client identifier
    pub client: Option<String>,
}

/// The quote engine
pub struct QuoteService {
    config: Arc<Config>,
    db: Database,
    rates: Arc<RateService>,
    receivers: Arc<ReceiverService>,
}

impl std::fmt::Debug for QuoteService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuoteService").finish_non_exhaustive()
    }
}

/// Smallest float strictly greater than `value`; the exclusive upper bound
/// on the estimated exchange rate.
fn next_up(value: f64) -> f64 {
    if value.is_nan() || value == f64::INFINITY {
        return value;
    }
    let bits = if value == 0.0 { 1 } else { value.to_bits() + 1 };
    f64::from_bits(bits)
}

impl QuoteService {
    /// Create the service
    pub fn new(
        config: Arc<Config>,
        db: Database,
        rates: Arc<RateService>,
        receivers: Arc<ReceiverService>,
    ) -> Self {
        Self {
            config,
            db,
            rates,
            receivers,
        }
    }

    /// Load a quote
    pub async fn get(&self, id: &str) -> Result<Option<QuoteModel>, QuoteError> {
        QuoteQueries::new(&self.db)
            .get_by_id(id)
            .await
            .map_err(|e| QuoteError::Database(e.to_string()))
    }

    /// Create a quote against a receiver
    pub async fn create(&self, args: CreateQuoteArgs) -> Result<QuoteModel, QuoteError> {
        let wallet = WalletAddressQueries::new(&self.db)
            .get_by_id(&args.wallet_address_id)
            .await
            .map_err(|e| QuoteError::Database(e.to_string()))?
            .ok_or(QuoteError::UnknownWalletAddress)?;
        if !wallet.is_active() {
            return Err(QuoteError::InactiveWalletAddress);
        }
        let asset = AssetQueries::new(&self.db)
            .get_by_id(&wallet.asset_id)
            .await
            .map_err(|e| QuoteError::Database(e.to_string()))?
            .ok_or_else(|| QuoteError::Database("wallet asset missing".to_string()))?;

        if args.debit_amount.is_some() && args.receive_amount.is_some() {
            return Err(QuoteError::InvalidAmount);
        }
        if let Some(debit) = &args.debit_amount {
            if debit.value == 0 || debit.asset_code != asset.code || debit.asset_scale != asset.scale
            {
                return Err(QuoteError::InvalidAmount);
            }
        }

        let receiver = self
            .receivers
            .resolve(&args.receiver)
            .await?
            .ok_or(QuoteError::InvalidReceiver)?;

        if let Some(receive) = &args.receive_amount {
            if receive.value == 0
                || receive.asset_code != receiver.asset_code
                || receive.asset_scale != receiver.asset_scale
            {
                return Err(QuoteError::InvalidAmount);
            }
            if let Some(remaining) = receiver.remaining_amount() {
                if receive.value > remaining {
                    return Err(QuoteError::InvalidAmount);
                }
            }
        }

        let raw_rate = self
            .rates
            .rate(&asset.code, &receiver.asset_code)
            .await
            .map_err(|e| QuoteError::Database(e.to_string()))?;
        let low_rate =
            raw_rate * 10f64.powi(receiver.asset_scale as i32 - asset.scale as i32);
        let high_rate = next_up(low_rate);
        let min_rate = low_rate * (1.0 - self.config.quotes.slippage);

        let sending_fee = FeeQueries::new(&self.db)
            .get_latest_for_asset(&asset.id, FeeType::Sending)
            .await
            .map_err(|e| QuoteError::Database(e.to_string()))?;
        let fee = sending_fee
            .as_ref()
            .map(Fee::from_model)
            .unwrap_or_else(Fee::zero);
        let fee_id = sending_fee.map(|f| f.id);

        let (debit_amount, receive_amount) = match (&args.debit_amount, &args.receive_amount) {
            // fixed source: the fee reduces what gets converted
            (Some(debit), None) => {
                let net = debit.value.saturating_sub(fee.amount(debit.value));
                if net == 0 {
                    return Err(QuoteError::InvalidAmount);
                }
                let receive = (net as f64 * low_rate).floor() as u64;
                if receive == 0 {
                    return Err(QuoteError::InvalidAmount);
                }
                (debit.value, receive)
            }
            // fixed delivery: the fee inflates what gets debited
            (None, receive) => {
                let target = match receive {
                    Some(receive) => receive.value,
                    None => receiver
                        .remaining_amount()
                        .filter(|remaining| *remaining > 0)
                        .ok_or(QuoteError::InvalidAmount)?,
                };
                let base_debit = (target as f64 / low_rate).ceil() as u64;
                if base_debit == 0 {
                    return Err(QuoteError::InvalidAmount);
                }
                (base_debit + fee.amount(base_debit), target)
            }
            (Some(_), Some(_)) => unreachable!("both amounts rejected above"),
        };

        let now = Utc::now();
        let mut expires_at = now + self.config.quote_lifespan();
        if let Some(receiver_expiry) = receiver.expires_at {
            expires_at = expires_at.min(receiver_expiry);
        }

        let quote = QuoteModel {
            id: Uuid::new_v4().to_string(),
            wallet_address_id: wallet.id,
            asset_id: asset.id,
            receiver: args.receiver,
            debit_amount,
            receive_amount,
            receive_asset_code: receiver.asset_code,
            receive_asset_scale: receiver.asset_scale,
            max_packet_amount: i64::MAX as u64,
            min_exchange_rate: min_rate,
            low_estimated_exchange_rate: low_rate,
            high_estimated_exchange_rate: high_rate,
            fee_id,
            expires_at,
            client: args.client,
            created_at: now,
        };
        QuoteQueries::new(&self.db)
            .insert(&quote)
            .await
            .map_err(|e| QuoteError::Database(e.to_string()))?;
        info!(
            "Created quote {}: debit {} {} -> receive {} {}",
            quote.id, quote.debit_amount, asset.code, quote.receive_amount, quote.receive_asset_code
        );
        Ok(quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AssetModel, FeeModel, WalletAddressModel};
    use crate::payment::IncomingPaymentService;
    use crate::receiver::CreateReceiverArgs;
    use crate::stream::StreamSecrets;
    use std::collections::HashMap;

    struct Fixture {
        service: QuoteService,
        receivers: Arc<ReceiverService>,
        db: Database,
    }

    async fn fixture(slippage: f64) -> Fixture {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let mut config = Config::default();
        config.quotes.slippage = slippage;
        let config = Arc::new(config);
        let secrets = StreamSecrets::new([42u8; 32], config.node.ilp_address.clone());
        let incoming = Arc::new(IncomingPaymentService::new(
            config.clone(),
            db.clone(),
            secrets,
        ));
        let receivers = Arc::new(ReceiverService::new(config.clone(), db.clone(), incoming));
        let rates = Arc::new(RateService::with_rates(
            "USD",
            HashMap::from([("XRP".to_string(), 0.5)]),
        ));
        let service = QuoteService::new(config, db.clone(), rates, receivers.clone());

        let now = Utc::now();
        let assets = AssetQueries::new(&db);
        for (id, code, scale) in [("usd", "USD", 9u8), ("xrp", "XRP", 9u8), ("usd2", "USD2", 2u8)] {
            assets
                .insert(&AssetModel {
                    id: id.to_string(),
                    code: code.to_string(),
                    scale,
                    withdrawal_threshold: None,
                    created_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();
        }
        let wallets = WalletAddressQueries::new(&db);
        for (id, url, asset_id) in [
            ("wa-a", "http://127.0.0.1:3001/alice", "usd"),
            ("wa-b", "http://127.0.0.1:3001/bob", "xrp"),
            ("wa-c", "http://127.0.0.1:3001/carol", "usd2"),
            ("wa-d", "http://127.0.0.1:3001/dave", "usd2"),
        ] {
            wallets
                .insert(&WalletAddressModel {
                    id: id.to_string(),
                    url: url.to_string(),
                    asset_id: asset_id.to_string(),
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
            service,
            receivers,
            db,
        }
    }

    async fn receiver_on(fixture: &Fixture, wallet_url: &str, amount: Option<Amount>) -> String {
        fixture
            .receivers
            .create_receiver(CreateReceiverArgs {
                wallet_address_url: wallet_url.to_string(),
                incoming_amount: amount,
                expires_at: None,
                metadata: None,
            })
            .await
            .unwrap()
            .url
    }

    #[tokio::test]
    async fn test_fixed_source_cross_currency_quote() {
        let fixture = fixture(0.01).await;
        let receiver = receiver_on(
            &fixture,
            "http://127.0.0.1:3001/bob",
            Some(Amount::new(56_000_000_000, "XRP", 9)),
        )
        .await;

        let quote = fixture
            .service
            .create(CreateQuoteArgs {
                wallet_address_id: "wa-a".to_string(),
                receiver,
                debit_amount: Some(Amount::new(123, "USD", 9)),
                receive_amount: None,
                client: None,
            })
            .await
            .unwrap();

        // 123 USD at 0.5, floored
        assert_eq!(quote.debit_amount, 123);
        assert_eq!(quote.receive_amount, 61);
        assert!((quote.min_exchange_rate - 0.5 * 0.99).abs() < 1e-12);
        assert!((quote.low_estimated_exchange_rate - 0.5).abs() < 1e-12);
        assert!(quote.high_estimated_exchange_rate > quote.low_estimated_exchange_rate);
        assert_eq!(quote.max_packet_amount, i64::MAX as u64);
    }

    #[tokio::test]
    async fn test_fixed_delivery_with_sending_fee() {
        let fixture = fixture(0.0).await;
        FeeQueries::new(&fixture.db)
            .insert(&FeeModel {
                id: "fee-1".to_string(),
                asset_id: "usd2".to_string(),
                fee_type: FeeType::Sending,
                fixed: 150,
                basis_points: 200,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let receiver = receiver_on(
            &fixture,
            "http://127.0.0.1:3001/dave",
            Some(Amount::new(3364, "USD2", 2)),
        )
        .await;

        // neither amount given: deliver the receiver's incoming amount
        let quote = fixture
            .service
            .create(CreateQuoteArgs {
                wallet_address_id: "wa-c".to_string(),
                receiver,
                debit_amount: None,
                receive_amount: None,
                client: None,
            })
            .await
            .unwrap();

        assert_eq!(quote.receive_amount, 3364);
        // 3364 + 150 fixed + ceil(3364 * 200 / 10000) = 3364 + 218
        assert_eq!(quote.debit_amount, 3582);
        assert_eq!(quote.fee_id.as_deref(), Some("fee-1"));
    }

    #[tokio::test]
    async fn test_invalid_amounts_rejected() {
        let fixture = fixture(0.01).await;
        let receiver = receiver_on(&fixture, "http://127.0.0.1:3001/bob", None).await;

        // zero debit
        let result = fixture
            .service
            .create(CreateQuoteArgs {
                wallet_address_id: "wa-a".to_string(),
                receiver: receiver.clone(),
                debit_amount: Some(Amount::new(0, "USD", 9)),
                receive_amount: None,
                client: None,
            })
            .await;
        assert_eq!(result.unwrap_err(), QuoteError::InvalidAmount);

        // currency mismatch against the source wallet
        let result = fixture
            .service
            .create(CreateQuoteArgs {
                wallet_address_id: "wa-a".to_string(),
                receiver: receiver.clone(),
                debit_amount: Some(Amount::new(100, "XRP", 9)),
                receive_amount: None,
                client: None,
            })
            .await;
        assert_eq!(result.unwrap_err(), QuoteError::InvalidAmount);

        // both amounts specified
        let result = fixture
            .service
            .create(CreateQuoteArgs {
                wallet_address_id: "wa-a".to_string(),
                receiver: receiver.clone(),
                debit_amount: Some(Amount::new(100, "USD", 9)),
                receive_amount: Some(Amount::new(50, "XRP", 9)),
                client: None,
            })
            .await;
        assert_eq!(result.unwrap_err(), QuoteError::InvalidAmount);

        // neither amount and no incoming amount on the receiver
        let result = fixture
            .service
            .create(CreateQuoteArgs {
                wallet_address_id: "wa-a".to_string(),
                receiver,
                debit_amount: None,
                receive_amount: None,
                client: None,
            })
            .await;
        assert_eq!(result.unwrap_err(), QuoteError::InvalidAmount);
    }

    #[tokio::test]
    async fn test_receive_amount_over_receiver_target_rejected() {
        let fixture = fixture(0.01).await;
        let receiver = receiver_on(
            &fixture,
            "http://127.0.0.1:3001/bob",
            Some(Amount::new(50, "XRP", 9)),
        )
        .await;

        let result = fixture
            .service
            .create(CreateQuoteArgs {
                wallet_address_id: "wa-a".to_string(),
                receiver: receiver.clone(),
                debit_amount: None,
                receive_amount: Some(Amount::new(51, "XRP", 9)),
                client: None,
            })
            .await;
        assert_eq!(result.unwrap_err(), QuoteError::InvalidAmount);

        // exactly the target is fine
        let quote = fixture
            .service
            .create(CreateQuoteArgs {
                wallet_address_id: "wa-a".to_string(),
                receiver,
                debit_amount: None,
                receive_amount: Some(Amount::new(50, "XRP", 9)),
                client: None,
            })
            .await
            .unwrap();
        assert_eq!(quote.receive_amount, 50);
    }

    #[tokio::test]
    async fn test_unknown_and_dead_receivers() {
        let fixture = fixture(0.01).await;
        let result = fixture
            .service
            .create(CreateQuoteArgs {
                wallet_address_id: "wa-a".to_string(),
                receiver: "http://127.0.0.1:3001/bob/incoming-payments/missing".to_string(),
                debit_amount: Some(Amount::new(100, "USD", 9)),
                receive_amount: None,
                client: None,
            })
            .await;
        assert_eq!(result.unwrap_err(), QuoteError::InvalidReceiver);
    }

    #[tokio::test]
    async fn test_quote_expiry_clamped_to_receiver() {
        let fixture = fixture(0.01).await;
        let receiver_expiry = Utc::now() + chrono::Duration::seconds(30);
        let receiver = fixture
            .receivers
            .create_receiver(CreateReceiverArgs {
                wallet_address_url: "http://127.0.0.1:3001/bob".to_string(),
                incoming_amount: None,
                expires_at: Some(receiver_expiry),
                metadata: None,
            })
            .await
            .unwrap()
            .url;

        let quote = fixture
            .service
            .create(CreateQuoteArgs {
                wallet_address_id: "wa-a".to_string(),
                receiver,
                debit_amount: Some(Amount::new(100, "USD", 9)),
                receive_amount: None,
                client: None,
            })
            .await
            .unwrap();
        assert!(quote.expires_at <= receiver_expiry);
    }

    #[test]
    fn test_next_up_is_exclusive_bound() {
        let low = 0.5f64;
        let high = next_up(low);
        assert!(high > low);
        assert_eq!(next_up(0.0).to_bits(), 1);
    }
}
