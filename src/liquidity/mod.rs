//! Liquidity operations
//!
//! Admin-facing deposits and withdrawals against the ledger accounts of
//! assets, peers, and wallet addresses, plus the event-driven pair that
//! funds outgoing payments and withdraws terminal balances. Every
//! operation is idempotent per `(operation, idempotency_key)`: the first
//! outcome is recorded and replayed verbatim on repeats.

use chrono::Duration;
use thiserror::Error;
use tracing::info;

use crate::db::{
    AssetQueries, Database, IdempotencyQueries, PeerQueries, WalletAddressQueries,
    WebhookEventQueries, WebhookEventType,
};
use crate::ledger::{Ledger, LedgerError};

/// Liquidity operation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiquidityError {
    /// Malformed or inapplicable id
    #[error("invalid id")]
    InvalidId,
    /// The asset does not exist
    #[error("unknown asset")]
    UnknownAsset,
    /// The peer does not exist
    #[error("unknown peer")]
    UnknownPeer,
    /// The wallet address does not exist
    #[error("unknown wallet address")]
    UnknownWalletAddress,
    /// Zero amount
    #[error("amount is zero")]
    AmountZero,
    /// The transfer id was already used
    #[error("transfer exists")]
    TransferExists,
    /// The account cannot cover the withdrawal
    #[error("insufficient balance")]
    InsufficientBalance,
    /// The withdrawal does not exist
    #[error("unknown transfer")]
    UnknownTransfer,
    /// The withdrawal was already posted
    #[error("already posted")]
    AlreadyPosted,
    /// The withdrawal was already voided
    #[error("already voided")]
    AlreadyVoided,
    /// Underlying storage failure
    #[error("database error: {0}")]
    Database(String),
}

impl LiquidityError {
    /// Stable kind string stored for idempotent replay
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidId => "InvalidId",
            Self::UnknownAsset => "UnknownAsset",
            Self::UnknownPeer => "UnknownPeer",
            Self::UnknownWalletAddress => "UnknownWalletAddress",
            Self::AmountZero => "AmountZero",
            Self::TransferExists => "TransferExists",
            Self::InsufficientBalance => "InsufficientBalance",
            Self::UnknownTransfer => "UnknownTransfer",
            Self::AlreadyPosted => "AlreadyPosted",
            Self::AlreadyVoided => "AlreadyVoided",
            Self::Database(_) => "Database",
        }
    }

    fn from_kind(kind: &str) -> Self {
        match kind {
            "InvalidId" => Self::InvalidId,
            "UnknownAsset" => Self::UnknownAsset,
            "UnknownPeer" => Self::UnknownPeer,
            "UnknownWalletAddress" => Self::UnknownWalletAddress,
            "AmountZero" => Self::AmountZero,
            "TransferExists" => Self::TransferExists,
            "InsufficientBalance" => Self::InsufficientBalance,
            "UnknownTransfer" => Self::UnknownTransfer,
            "AlreadyPosted" => Self::AlreadyPosted,
            "AlreadyVoided" => Self::AlreadyVoided,
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for LiquidityError {
    fn from(e: anyhow::Error) -> Self {
        LiquidityError::Database(e.to_string())
    }
}

fn map_ledger_error(e: LedgerError) -> LiquidityError {
    match e {
        LedgerError::InvalidAmount => LiquidityError::AmountZero,
        LedgerError::TransferExists => LiquidityError::TransferExists,
        LedgerError::InsufficientBalance => LiquidityError::InsufficientBalance,
        LedgerError::UnknownTransfer => LiquidityError::UnknownTransfer,
        LedgerError::AlreadyPosted => LiquidityError::AlreadyPosted,
        LedgerError::AlreadyVoided => LiquidityError::AlreadyVoided,
        LedgerError::UnknownAccount | LedgerError::AccountAlreadyExists => {
            LiquidityError::InvalidId
        }
        LedgerError::Database(e) => LiquidityError::Database(e),
    }
}

/// Stored outcome of an idempotent operation
#[derive(serde::Serialize, serde::Deserialize)]
struct StoredOutcome {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// The liquidity operations service
pub struct LiquidityService {
    db: Database,
    ledger: Ledger,
}

impl std::fmt::Debug for LiquidityService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiquidityService").finish_non_exhaustive()
    }
}

impl LiquidityService {
    /// Create the service
    pub fn new(db: Database, ledger: Ledger) -> Self {
        Self { db, ledger }
    }

    async fn replay(
        &self,
        operation: &str,
        key: Option<&str>,
    ) -> Result<Option<Result<(), LiquidityError>>, LiquidityError> {
        let Some(key) = key else { return Ok(None) };
        let stored = IdempotencyQueries::new(&self.db)
            .get(operation, key)
            .await
            .map_err(|e| LiquidityError::Database(e.to_string()))?;
        let Some(stored) = stored else { return Ok(None) };
        let outcome: StoredOutcome = serde_json::from_str(&stored)
            .map_err(|e| LiquidityError::Database(e.to_string()))?;
        Ok(Some(if outcome.success {
            Ok(())
        } else {
            Err(LiquidityError::from_kind(
                outcome.error.as_deref().unwrap_or("Database"),
            ))
        }))
    }

    async fn record(
        &self,
        operation: &str,
        key: Option<&str>,
        result: &Result<(), LiquidityError>,
    ) -> Result<(), LiquidityError> {
        let Some(key) = key else { return Ok(()) };
        let outcome = StoredOutcome {
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.kind().to_string()),
        };
        let encoded = serde_json::to_string(&outcome)
            .map_err(|e| LiquidityError::Database(e.to_string()))?;
        let conn = self.db.conn();
        let conn = conn.lock().await;
        IdempotencyQueries::put_tx(&conn, operation, key, &encoded)
            .map_err(|e| LiquidityError::Database(e.to_string()))?;
        Ok(())
    }

    /// Deposit liquidity into an asset's account
    pub async fn add_asset_liquidity(
        &self,
        asset_id: &str,
        transfer_id: &str,
        amount: u64,
        idempotency_key: Option<&str>,
    ) -> Result<(), LiquidityError> {
        if let Some(stored) = self.replay("addAssetLiquidity", idempotency_key).await? {
            return stored;
        }
        let result = self.do_add_asset_liquidity(asset_id, transfer_id, amount).await;
        self.record("addAssetLiquidity", idempotency_key, &result).await?;
        result
    }

    async fn do_add_asset_liquidity(
        &self,
        asset_id: &str,
        transfer_id: &str,
        amount: u64,
    ) -> Result<(), LiquidityError> {
        if amount == 0 {
            return Err(LiquidityError::AmountZero);
        }
        AssetQueries::new(&self.db)
            .get_by_id(asset_id)
            .await
            .map_err(|e| LiquidityError::Database(e.to_string()))?
            .ok_or(LiquidityError::UnknownAsset)?;
        self.ledger
            .create_deposit(transfer_id, asset_id, amount)
            .await
            .map_err(map_ledger_error)?;
        info!("Added {} liquidity to asset {}", amount, asset_id);
        Ok(())
    }

    /// Deposit liquidity into a peer's account
    pub async fn add_peer_liquidity(
        &self,
        peer_id: &str,
        transfer_id: &str,
        amount: u64,
        idempotency_key: Option<&str>,
    ) -> Result<(), LiquidityError> {
        if let Some(stored) = self.replay("addPeerLiquidity", idempotency_key).await? {
            return stored;
        }
        let result = self.do_add_peer_liquidity(peer_id, transfer_id, amount).await;
        self.record("addPeerLiquidity", idempotency_key, &result).await?;
        result
    }

    async fn do_add_peer_liquidity(
        &self,
        peer_id: &str,
        transfer_id: &str,
        amount: u64,
    ) -> Result<(), LiquidityError> {
        if amount == 0 {
            return Err(LiquidityError::AmountZero);
        }
        PeerQueries::new(&self.db)
            .get_by_id(peer_id)
            .await
            .map_err(|e| LiquidityError::Database(e.to_string()))?
            .ok_or(LiquidityError::UnknownPeer)?;
        self.ledger
            .create_deposit(transfer_id, peer_id, amount)
            .await
            .map_err(map_ledger_error)?;
        info!("Added {} liquidity to peer {}", amount, peer_id);
        Ok(())
    }

    /// Begin a two-phase withdrawal from an asset's account
    pub async fn create_asset_liquidity_withdrawal(
        &self,
        asset_id: &str,
        withdrawal_id: &str,
        amount: u64,
        timeout: Duration,
        idempotency_key: Option<&str>,
    ) -> Result<(), LiquidityError> {
        if let Some(stored) = self
            .replay("createAssetLiquidityWithdrawal", idempotency_key)
            .await?
        {
            return stored;
        }
        let result = async {
            if amount == 0 {
                return Err(LiquidityError::AmountZero);
            }
            AssetQueries::new(&self.db)
                .get_by_id(asset_id)
                .await
                .map_err(|e| LiquidityError::Database(e.to_string()))?
                .ok_or(LiquidityError::UnknownAsset)?;
            self.ledger
                .create_withdrawal(withdrawal_id, asset_id, amount, Some(timeout))
                .await
                .map_err(map_ledger_error)
        }
        .await;
        self.record("createAssetLiquidityWithdrawal", idempotency_key, &result)
            .await?;
        result
    }

    /// Begin a two-phase withdrawal from a peer's account
    pub async fn create_peer_liquidity_withdrawal(
        &self,
        peer_id: &str,
        withdrawal_id: &str,
        amount: u64,
        timeout: Duration,
        idempotency_key: Option<&str>,
    ) -> Result<(), LiquidityError> {
        if let Some(stored) = self
            .replay("createPeerLiquidityWithdrawal", idempotency_key)
            .await?
        {
            return stored;
        }
        let result = async {
            if amount == 0 {
                return Err(LiquidityError::AmountZero);
            }
            PeerQueries::new(&self.db)
                .get_by_id(peer_id)
                .await
                .map_err(|e| LiquidityError::Database(e.to_string()))?
                .ok_or(LiquidityError::UnknownPeer)?;
            self.ledger
                .create_withdrawal(withdrawal_id, peer_id, amount, Some(timeout))
                .await
                .map_err(map_ledger_error)
        }
        .await;
        self.record("createPeerLiquidityWithdrawal", idempotency_key, &result)
            .await?;
        result
    }

    /// Withdraw a wallet address's accumulated web monetization balance
    pub async fn create_wallet_address_withdrawal(
        &self,
        wallet_address_id: &str,
        withdrawal_id: &str,
        timeout: Duration,
        idempotency_key: Option<&str>,
    ) -> Result<(), LiquidityError> {
        if let Some(stored) = self
            .replay("createWalletAddressWithdrawal", idempotency_key)
            .await?
        {
            return stored;
        }
        let result = async {
            let wallet = WalletAddressQueries::new(&self.db)
                .get_by_id(wallet_address_id)
                .await
                .map_err(|e| LiquidityError::Database(e.to_string()))?
                .ok_or(LiquidityError::UnknownWalletAddress)?;
            let balance = self
                .ledger
                .get_balance(&wallet.id)
                .await
                .map_err(map_ledger_error)?;
            if balance == 0 {
                return Err(LiquidityError::AmountZero);
            }
            self.ledger
                .create_withdrawal(withdrawal_id, &wallet.id, balance, Some(timeout))
                .await
                .map_err(map_ledger_error)
        }
        .await;
        self.record("createWalletAddressWithdrawal", idempotency_key, &result)
            .await?;
        result
    }

    /// Commit a pending liquidity withdrawal
    pub async fn post_liquidity_withdrawal(
        &self,
        withdrawal_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<(), LiquidityError> {
        if let Some(stored) = self.replay("postLiquidityWithdrawal", idempotency_key).await? {
            return stored;
        }
        let result = self
            .ledger
            .post_withdrawal(withdrawal_id)
            .await
            .map_err(map_ledger_error);
        self.record("postLiquidityWithdrawal", idempotency_key, &result)
            .await?;
        result
    }

    /// Roll back a pending liquidity withdrawal
    pub async fn void_liquidity_withdrawal(
        &self,
        withdrawal_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<(), LiquidityError> {
        if let Some(stored) = self.replay("voidLiquidityWithdrawal", idempotency_key).await? {
            return stored;
        }
        let result = self
            .ledger
            .void_withdrawal(withdrawal_id)
            .await
            .map_err(map_ledger_error);
        self.record("voidLiquidityWithdrawal", idempotency_key, &result)
            .await?;
        result
    }

    /// Fund the outgoing payment named by an `outgoing_payment.created`
    /// event: deposit its quoted debit amount
    pub async fn deposit_event_liquidity(
        &self,
        event_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<(), LiquidityError> {
        if let Some(stored) = self.replay("depositEventLiquidity", idempotency_key).await? {
            return stored;
        }
        let result = self.do_deposit_event_liquidity(event_id).await;
        self.record("depositEventLiquidity", idempotency_key, &result)
            .await?;
        result
    }

    async fn do_deposit_event_liquidity(&self, event_id: &str) -> Result<(), LiquidityError> {
        let event = WebhookEventQueries::new(&self.db)
            .get_by_id(event_id)
            .await
            .map_err(|e| LiquidityError::Database(e.to_string()))?
            .ok_or(LiquidityError::InvalidId)?;
        if event.event_type != WebhookEventType::OutgoingPaymentCreated {
            return Err(LiquidityError::InvalidId);
        }
        let payment_id = event
            .data
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or(LiquidityError::InvalidId)?;
        let amount = event
            .data
            .get("debitAmount")
            .and_then(|v| v.get("value"))
            .and_then(|v| v.as_u64())
            .ok_or(LiquidityError::InvalidId)?;

        let payment = crate::db::OutgoingPaymentQueries::new(&self.db)
            .get_by_id(payment_id)
            .await
            .map_err(|e| LiquidityError::Database(e.to_string()))?
            .ok_or(LiquidityError::InvalidId)?;

        let quote = crate::db::QuoteQueries::new(&self.db)
            .get_by_id(&payment.quote_id)
            .await
            .map_err(|e| LiquidityError::Database(e.to_string()))?
            .ok_or(LiquidityError::InvalidId)?;
        match self
            .ledger
            .create_liquidity_account(&crate::ledger::AccountRef::new(
                &payment.id,
                &quote.asset_id,
                crate::ledger::LiquidityAccountKind::OutgoingPayment,
            ))
            .await
        {
            Ok(()) | Err(LedgerError::AccountAlreadyExists) => {}
            Err(e) => return Err(map_ledger_error(e)),
        }
        self.ledger
            .create_deposit(event_id, &payment.id, amount)
            .await
            .map_err(map_ledger_error)?;

        // the deposit is the funding leg: move the payment to Sending
        let conn = self.db.conn();
        let conn = conn.lock().await;
        crate::db::OutgoingPaymentQueries::fund_tx(&conn, &payment.id)
            .map_err(|e| LiquidityError::Database(e.to_string()))?;
        Ok(())
    }

    /// Execute the withdrawal attached to an event
    pub async fn withdraw_event_liquidity(
        &self,
        event_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<(), LiquidityError> {
        if let Some(stored) = self.replay("withdrawEventLiquidity", idempotency_key).await? {
            return stored;
        }
        let result = self.do_withdraw_event_liquidity(event_id).await;
        self.record("withdrawEventLiquidity", idempotency_key, &result)
            .await?;
        result
    }

    async fn do_withdraw_event_liquidity(&self, event_id: &str) -> Result<(), LiquidityError> {
        let event = WebhookEventQueries::new(&self.db)
            .get_by_id(event_id)
            .await
            .map_err(|e| LiquidityError::Database(e.to_string()))?
            .ok_or(LiquidityError::InvalidId)?;
        let withdrawal = event.withdrawal.ok_or(LiquidityError::InvalidId)?;
        self.ledger
            .create_withdrawal(event_id, &withdrawal.account_id, withdrawal.amount, None)
            .await
            .map_err(map_ledger_error)?;
        info!(
            "Withdrew {} from {} for event {}",
            withdrawal.amount, withdrawal.account_id, event_id
        );

        // wallet address withdrawals advance the events accumulator
        if event.event_type == WebhookEventType::WalletAddressWebMonetization {
            WalletAddressQueries::new(&self.db)
                .advance_total_events_amount(&withdrawal.account_id, withdrawal.amount)
                .await
                .map_err(|e| LiquidityError::Database(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{AssetModel, PeerModel};
    use crate::ledger::{AccountRef, AccountRegistry, LiquidityAccountKind};
    use chrono::Utc;
    use std::sync::Arc;

    struct Fixture {
        service: LiquidityService,
        ledger: Ledger,
        db: Database,
    }

    async fn fixture() -> Fixture {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let ledger = Ledger::new(db.clone(), AccountRegistry::new());
        let service = LiquidityService::new(db.clone(), ledger.clone());

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
        ledger
            .create_liquidity_account(&AccountRef::new("usd", "usd", LiquidityAccountKind::Asset))
            .await
            .unwrap();
        PeerQueries::new(&db)
            .insert(&PeerModel {
                id: "peer-1".to_string(),
                asset_id: "usd".to_string(),
                static_ilp_address: "test.peer".to_string(),
                max_packet_amount: None,
                http_incoming_token: "in".to_string(),
                http_outgoing_token: "out".to_string(),
                http_outgoing_endpoint: "http://peer.example".to_string(),
                liquidity_threshold: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        ledger
            .create_liquidity_account(&AccountRef::new("peer-1", "usd", LiquidityAccountKind::Peer))
            .await
            .unwrap();

        Fixture {
            service,
            ledger,
            db,
        }
    }

    #[tokio::test]
    async fn test_add_asset_liquidity_and_errors() {
        let fixture = fixture().await;
        fixture
            .service
            .add_asset_liquidity("usd", "t1", 100, None)
            .await
            .unwrap();
        assert_eq!(fixture.ledger.get_balance("usd").await.unwrap(), 100);

        assert_eq!(
            fixture.service.add_asset_liquidity("usd", "t1", 100, None).await,
            Err(LiquidityError::TransferExists)
        );
        assert_eq!(
            fixture.service.add_asset_liquidity("usd", "t2", 0, None).await,
            Err(LiquidityError::AmountZero)
        );
        assert_eq!(
            fixture.service.add_asset_liquidity("nope", "t3", 5, None).await,
            Err(LiquidityError::UnknownAsset)
        );
    }

    #[tokio::test]
    async fn test_idempotency_key_replays_without_second_transfer() {
        let fixture = fixture().await;
        fixture
            .service
            .add_asset_liquidity("usd", "t1", 100, Some("key-1"))
            .await
            .unwrap();
        // the repeat returns the stored success and moves no money
        fixture
            .service
            .add_asset_liquidity("usd", "t1", 100, Some("key-1"))
            .await
            .unwrap();
        assert_eq!(fixture.ledger.get_balance("usd").await.unwrap(), 100);

        // a failed outcome replays as the same failure
        assert_eq!(
            fixture
                .service
                .add_asset_liquidity("usd", "t2", 0, Some("key-2"))
                .await,
            Err(LiquidityError::AmountZero)
        );
        assert_eq!(
            fixture
                .service
                .add_asset_liquidity("usd", "t2", 0, Some("key-2"))
                .await,
            Err(LiquidityError::AmountZero)
        );
    }

    #[tokio::test]
    async fn test_peer_withdrawal_lifecycle() {
        let fixture = fixture().await;
        fixture
            .service
            .add_peer_liquidity("peer-1", "d1", 100, None)
            .await
            .unwrap();

        fixture
            .service
            .create_peer_liquidity_withdrawal("peer-1", "w1", 10, Duration::seconds(10), None)
            .await
            .unwrap();
        fixture
            .service
            .post_liquidity_withdrawal("w1", None)
            .await
            .unwrap();
        // repeats surface the terminal state
        assert_eq!(
            fixture.service.post_liquidity_withdrawal("w1", None).await,
            Err(LiquidityError::AlreadyPosted)
        );
        assert_eq!(
            fixture.service.void_liquidity_withdrawal("w1", None).await,
            Err(LiquidityError::AlreadyPosted)
        );
        assert_eq!(fixture.ledger.get_balance("peer-1").await.unwrap(), 90);
    }

    #[tokio::test]
    async fn test_withdraw_event_liquidity() {
        let fixture = fixture().await;
        fixture
            .service
            .add_peer_liquidity("peer-1", "d1", 100, None)
            .await
            .unwrap();

        let webhooks =
            crate::webhook::WebhookService::new(Arc::new(Config::default()), fixture.db.clone());
        let event = webhooks
            .enqueue(
                WebhookEventType::IncomingPaymentCompleted,
                serde_json::json!({"id": "x"}),
                Some(crate::db::EventWithdrawal {
                    account_id: "peer-1".to_string(),
                    asset_id: "usd".to_string(),
                    amount: 40,
                }),
            )
            .await
            .unwrap();

        fixture
            .service
            .withdraw_event_liquidity(&event.id, None)
            .await
            .unwrap();
        assert_eq!(fixture.ledger.get_balance("peer-1").await.unwrap(), 60);

        // second withdrawal for the same event is a duplicate transfer
        assert_eq!(
            fixture.service.withdraw_event_liquidity(&event.id, None).await,
            Err(LiquidityError::TransferExists)
        );

        // events without a withdrawal are not withdrawable
        let bare = webhooks
            .enqueue(
                WebhookEventType::IncomingPaymentCreated,
                serde_json::json!({"id": "y"}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            fixture.service.withdraw_event_liquidity(&bare.id, None).await,
            Err(LiquidityError::InvalidId)
        );
    }
}
