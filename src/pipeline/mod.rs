//! ILP packet pipeline
//!
//! One inbound prepare runs through a fixed sequence of stages: source
//! limits, ILDCP, destination resolution, the two-phase balance
//! reservation, and either local STREAM fulfillment or the forward to the
//! outgoing peer. Each stage returns `Result<(), Reject>`-shaped outcomes
//! and the top level serializes any reject with this node's address.
//!
//! The ledger reservation brackets the send: it is prepared strictly
//! before the packet leaves and posted or voided exactly once when the
//! reply (or a local decision) comes back.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::db::{
    AssetModel, AssetQueries, Database, IncomingPaymentQueries, PeerModel, WalletAddressQueries,
};
use crate::ilp::{
    ildcp_condition, is_ildcp_request, ErrorCode, Fulfill, IldcpResponse, Packet, Prepare, Reject,
};
use crate::ledger::{
    AccountRef, Ledger, LedgerError, LiquidityAccountKind, TransferArgs, TransferHandle,
};
use crate::quote::RateService;
use crate::stream::{self, StreamSecrets};

mod limits;

pub use limits::PeerLimiter;

/// Who handed the packet to the pipeline
#[derive(Debug, Clone)]
pub enum PacketSource {
    /// An authenticated peer (ILP-over-HTTP ingress)
    Peer(PeerModel),
    /// A local outgoing payment acting as sender
    Payment {
        /// Ledger account holding the payment's reserved funds
        account_id: String,
        /// Source asset
        asset: AssetModel,
    },
}

/// Resolved outgoing side of a packet
enum Destination {
    /// Local incoming payment, addressed by STREAM tag
    IncomingPayment {
        account_id: String,
        asset: AssetModel,
        tag: String,
    },
    /// Local wallet address (SPSP fallback), addressed by STREAM tag
    WalletAddress {
        account_id: String,
        asset: AssetModel,
        tag: String,
    },
    /// Next hop on the ILP network
    Peer(PeerModel),
}

/// The per-packet middleware chain
pub struct PacketPipeline {
    config: Arc<Config>,
    db: Database,
    ledger: Ledger,
    secrets: StreamSecrets,
    rates: Arc<RateService>,
    packet_rate: PeerLimiter,
    incoming_throughput: PeerLimiter,
    outgoing_throughput: PeerLimiter,
    http: reqwest::Client,
}

impl PacketPipeline {
    /// Build the pipeline
    pub fn new(
        config: Arc<Config>,
        db: Database,
        ledger: Ledger,
        secrets: StreamSecrets,
        rates: Arc<RateService>,
    ) -> Self {
        let packet_rate = PeerLimiter::new(config.pipeline.incoming_packets_per_second);
        let incoming_throughput = PeerLimiter::new(config.pipeline.incoming_amount_per_second);
        let outgoing_throughput = PeerLimiter::new(config.pipeline.outgoing_amount_per_second);
        Self {
            config,
            db,
            ledger,
            secrets,
            rates,
            packet_rate,
            incoming_throughput,
            outgoing_throughput,
            http: reqwest::Client::new(),
        }
    }

    /// The STREAM secret codec used by this pipeline
    pub fn secrets(&self) -> &StreamSecrets {
        &self.secrets
    }

    fn reject(&self, code: ErrorCode, message: impl Into<String>) -> Reject {
        Reject::new(code, self.config.node.ilp_address.clone(), message)
    }

    /// Run one prepare through the chain and return the reply packet
    pub async fn handle(&self, source: PacketSource, prepare: Prepare) -> Packet {
        match self.process(source, prepare).await {
            Ok(fulfill) => Packet::Fulfill(fulfill),
            Err(reject) => Packet::Reject(reject),
        }
    }

    async fn process(&self, source: PacketSource, prepare: Prepare) -> Result<Fulfill, Reject> {
        // Source-side limits apply to peer traffic only; a local payment's
        // budget is its own funded account.
        if let PacketSource::Peer(peer) = &source {
            if let Some(max) = peer.max_packet_amount {
                if prepare.amount > max {
                    let mut data = Vec::with_capacity(16);
                    data.extend_from_slice(&prepare.amount.to_be_bytes());
                    data.extend_from_slice(&max.to_be_bytes());
                    let mut reject = self.reject(
                        ErrorCode::AmountTooLarge,
                        format!("packet amount exceeds maximum of {}", max),
                    );
                    reject.data = data;
                    return Err(reject);
                }
            }
            if !self.packet_rate.take(&peer.id, 1).await {
                return Err(self.reject(ErrorCode::RateLimitExceeded, "too many packets"));
            }
            if prepare.amount > 0
                && !self.incoming_throughput.take(&peer.id, prepare.amount).await
            {
                return Err(self.reject(
                    ErrorCode::InsufficientLiquidity,
                    "exceeded money bandwidth, throttling",
                ));
            }

            if is_ildcp_request(&prepare) {
                return self.respond_ildcp(peer, &prepare).await;
            }
        } else if is_ildcp_request(&prepare) {
            return Err(self.reject(ErrorCode::Unreachable, "no route specified"));
        }

        let now = Utc::now();
        if prepare.expires_at <= now {
            return Err(self.reject(ErrorCode::TransferTimedOut, "packet expired"));
        }

        let destination = self.resolve_destination(&prepare).await?;

        let (source_account_id, source_asset) = match &source {
            PacketSource::Peer(peer) => (peer.id.clone(), self.load_asset(&peer.asset_id).await?),
            PacketSource::Payment { account_id, asset } => (account_id.clone(), asset.clone()),
        };
        let (destination_account_id, destination_asset) = match &destination {
            Destination::IncomingPayment { account_id, asset, .. }
            | Destination::WalletAddress { account_id, asset, .. } => {
                (account_id.clone(), asset.clone())
            }
            Destination::Peer(peer) => (peer.id.clone(), self.load_asset(&peer.asset_id).await?),
        };

        // Exactly one ledger reservation per packet attempt, prepared
        // before the packet goes anywhere.
        let transfer = if prepare.amount == 0 {
            None
        } else {
            let destination_amount = self
                .convert(prepare.amount, &source_asset, &destination_asset)
                .await?;
            if destination_amount == Some(0) {
                return Err(self.reject(
                    ErrorCode::InsufficientLiquidity,
                    "amount is below the destination's smallest unit",
                ));
            }
            let timeout = prepare.expires_at - now;
            let handle = self
                .ledger
                .create_transfer(TransferArgs {
                    source_account_id: source_account_id.clone(),
                    destination_account_id,
                    source_amount: prepare.amount,
                    destination_amount,
                    timeout,
                })
                .await
                .map_err(|e| match e {
                    LedgerError::InsufficientBalance => {
                        self.reject(ErrorCode::InsufficientLiquidity, "insufficient balance")
                    }
                    other => {
                        warn!("Balance middleware failed to reserve transfer: {}", other);
                        self.reject(ErrorCode::InternalError, "transfer failed")
                    }
                })?;
            Some(handle)
        };

        match destination {
            Destination::IncomingPayment { tag, .. } | Destination::WalletAddress { tag, .. } => {
                self.fulfill_local(&tag, &prepare, transfer).await
            }
            Destination::Peer(peer) => self.forward(&peer, prepare, transfer).await,
        }
    }

    async fn respond_ildcp(&self, peer: &PeerModel, prepare: &Prepare) -> Result<Fulfill, Reject> {
        if prepare.execution_condition != ildcp_condition() {
            return Err(self.reject(ErrorCode::WrongCondition, "unexpected ILDCP condition"));
        }
        let asset = self.load_asset(&peer.asset_id).await?;
        debug!("Responding to ILDCP request from peer {}", peer.id);
        Ok(IldcpResponse {
            ilp_address: peer.static_ilp_address.clone(),
            asset_scale: asset.scale,
            asset_code: asset.code,
        }
        .into_fulfill())
    }

    async fn load_asset(&self, asset_id: &str) -> Result<AssetModel, Reject> {
        AssetQueries::new(&self.db)
            .get_by_id(asset_id)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| self.reject(ErrorCode::InternalError, "unknown asset"))
    }

    async fn resolve_destination(&self, prepare: &Prepare) -> Result<Destination, Reject> {
        if let Ok(tag) = self.secrets.decode_destination(&prepare.destination) {
            let payments = IncomingPaymentQueries::new(&self.db);
            if let Ok(Some(payment)) = payments.get_by_id(&tag).await {
                if payment.state.is_terminal() && prepare.amount != 0 {
                    return Err(self.reject(
                        ErrorCode::Unreachable,
                        "incoming payment is completed or expired",
                    ));
                }
                // The payment's ledger account exists from its first credit
                // attempt onward.
                match self
                    .ledger
                    .create_liquidity_account(&AccountRef::new(
                        &payment.id,
                        &payment.asset_id,
                        LiquidityAccountKind::IncomingPayment,
                    ))
                    .await
                {
                    Ok(()) | Err(LedgerError::AccountAlreadyExists) => {}
                    Err(e) => {
                        warn!("Failed to create incoming payment account: {}", e);
                        return Err(self.reject(ErrorCode::InternalError, "account failed"));
                    }
                }
                let asset = self.load_asset(&payment.asset_id).await?;
                return Ok(Destination::IncomingPayment {
                    account_id: payment.id,
                    asset,
                    tag,
                });
            }

            // SPSP fallback: the tag names a wallet address and credits its
            // web monetization account, created lazily here.
            let wallets = WalletAddressQueries::new(&self.db);
            if let Ok(Some(wallet)) = wallets.get_by_id(&tag).await {
                if !wallet.is_active() {
                    return Err(self.reject(ErrorCode::Unreachable, "wallet address is inactive"));
                }
                match self
                    .ledger
                    .create_liquidity_account(&AccountRef::new(
                        &wallet.id,
                        &wallet.asset_id,
                        LiquidityAccountKind::WebMonetization,
                    ))
                    .await
                {
                    Ok(()) | Err(LedgerError::AccountAlreadyExists) => {}
                    Err(e) => {
                        warn!("Failed to create web monetization account: {}", e);
                        return Err(self.reject(ErrorCode::InternalError, "account failed"));
                    }
                }
                let asset = self.load_asset(&wallet.asset_id).await?;
                return Ok(Destination::WalletAddress {
                    account_id: wallet.id,
                    asset,
                    tag,
                });
            }

            return Err(self.reject(ErrorCode::Unreachable, "no account found for destination"));
        }

        let peers = crate::db::PeerQueries::new(&self.db);
        if let Ok(Some(peer)) = peers.find_by_destination(&prepare.destination).await {
            return Ok(Destination::Peer(peer));
        }

        if prepare.destination == self.config.node.ilp_address
            || prepare
                .destination
                .starts_with(&format!("{}.", self.config.node.ilp_address))
        {
            // Reserved: a well-formed local ILP-access account id would land
            // here. The branch is intentionally unhandled.
            return Err(self.reject(ErrorCode::Unreachable, "no account found for destination"));
        }

        Err(self.reject(ErrorCode::Unreachable, "no route to destination"))
    }

    /// Destination amount for a cross-asset delivery, None when the assets
    /// match and the ledger can move the source amount directly.
    async fn convert(
        &self,
        amount: u64,
        source: &AssetModel,
        destination: &AssetModel,
    ) -> Result<Option<u64>, Reject> {
        if source.id == destination.id {
            return Ok(None);
        }
        let rate = self
            .rates
            .rate(&source.code, &destination.code)
            .await
            .map_err(|e| {
                warn!("Rate lookup failed: {}", e);
                self.reject(ErrorCode::InternalError, "rate lookup failed")
            })?;
        let scaled =
            rate * 10f64.powi(destination.scale as i32 - source.scale as i32);
        Ok(Some((amount as f64 * scaled).floor() as u64))
    }

    async fn fulfill_local(
        &self,
        tag: &str,
        prepare: &Prepare,
        transfer: Option<TransferHandle>,
    ) -> Result<Fulfill, Reject> {
        let shared_secret = self.secrets.shared_secret(tag);
        match stream::fulfill_if_valid(&shared_secret, &prepare.data, &prepare.execution_condition)
        {
            Some(fulfillment) => {
                if let Some(transfer) = transfer {
                    transfer.post().await.map_err(|e| {
                        warn!("Failed to post transfer on fulfillment: {}", e);
                        self.reject(ErrorCode::InternalError, "transfer failed")
                    })?;
                }
                Ok(Fulfill {
                    fulfillment,
                    data: Vec::new(),
                })
            }
            None => {
                if let Some(transfer) = transfer {
                    if let Err(e) = transfer.void().await {
                        warn!("Failed to void transfer on reject: {}", e);
                    }
                }
                Err(self.reject(ErrorCode::WrongCondition, "condition does not match"))
            }
        }
    }

    async fn forward(
        &self,
        peer: &PeerModel,
        mut prepare: Prepare,
        transfer: Option<TransferHandle>,
    ) -> Result<Fulfill, Reject> {
        let void_with = |reject: Reject, transfer: Option<TransferHandle>| async move {
            if let Some(transfer) = transfer {
                if let Err(e) = transfer.void().await {
                    warn!("Failed to void transfer on reject: {}", e);
                }
            }
            reject
        };

        if prepare.amount > 0 && !self.outgoing_throughput.take(&peer.id, prepare.amount).await {
            return Err(void_with(
                self.reject(
                    ErrorCode::InsufficientLiquidity,
                    "exceeded money bandwidth, throttling",
                ),
                transfer,
            )
            .await);
        }

        // Clamp the hold to our exposure window, then refuse to forward a
        // packet that has no time left.
        let now = Utc::now();
        let max_expiry = now + Duration::milliseconds(self.config.pipeline.max_hold_ms as i64);
        if prepare.expires_at > max_expiry {
            prepare.expires_at = max_expiry;
        }
        if prepare.expires_at <= now {
            return Err(void_with(
                self.reject(ErrorCode::TransferTimedOut, "packet expired"),
                transfer,
            )
            .await);
        }

        let condition = prepare.execution_condition;
        let timeout = (prepare.expires_at - now)
            .to_std()
            .unwrap_or(std::time::Duration::from_millis(1));
        let body = Packet::Prepare(prepare).encode();

        let response = self
            .http
            .post(&peer.http_outgoing_endpoint)
            .bearer_auth(&peer.http_outgoing_token)
            .header("Content-Type", "application/octet-stream")
            .timeout(timeout)
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(void_with(
                    self.reject(ErrorCode::TransferTimedOut, "request to peer timed out"),
                    transfer,
                )
                .await);
            }
            Err(e) => {
                warn!("Failed to reach peer {}: {}", peer.id, e);
                return Err(void_with(
                    self.reject(ErrorCode::PeerBusy, "peer is unreachable"),
                    transfer,
                )
                .await);
            }
        };

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to read reply from peer {}: {}", peer.id, e);
                return Err(void_with(
                    self.reject(ErrorCode::PeerBusy, "peer reply unreadable"),
                    transfer,
                )
                .await);
            }
        };

        match Packet::decode(&bytes) {
            Ok(Packet::Fulfill(fulfill)) => {
                use sha2::{Digest, Sha256};
                let hashed: [u8; 32] = Sha256::digest(fulfill.fulfillment).into();
                if hashed != condition {
                    return Err(void_with(
                        self.reject(
                            ErrorCode::WrongCondition,
                            "fulfillment does not match condition",
                        ),
                        transfer,
                    )
                    .await);
                }
                if let Some(transfer) = transfer {
                    transfer.post().await.map_err(|e| {
                        warn!("Failed to post transfer on fulfillment: {}", e);
                        self.reject(ErrorCode::InternalError, "transfer failed")
                    })?;
                }
                Ok(fulfill)
            }
            Ok(Packet::Reject(reject)) => Err(void_with(reject, transfer).await),
            Ok(Packet::Prepare(_)) | Err(_) => Err(void_with(
                self.reject(ErrorCode::PeerBusy, "invalid reply from peer"),
                transfer,
            )
            .await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{IncomingPaymentModel, IncomingPaymentState, WalletAddressModel};
    use crate::ledger::AccountRegistry;
    use chrono::Utc;

    async fn fixture() -> (PacketPipeline, Database, Ledger) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let ledger = Ledger::new(db.clone(), AccountRegistry::new());
        let config = Arc::new(Config::default());
        let secrets = StreamSecrets::new([42u8; 32], config.node.ilp_address.clone());
        let rates = Arc::new(RateService::with_rates(
            "USD",
            [("XRP".to_string(), 0.5)].into_iter().collect(),
        ));
        let pipeline = PacketPipeline::new(
            config,
            db.clone(),
            ledger.clone(),
            secrets,
            rates,
        );
        (pipeline, db, ledger)
    }

    async fn seed_asset(db: &Database, id: &str, code: &str, scale: u8) {
        let now = Utc::now();
        AssetQueries::new(db)
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

    async fn seed_peer(db: &Database, ledger: &Ledger, id: &str, asset_id: &str, prefix: &str) -> PeerModel {
        let now = Utc::now();
        let peer = PeerModel {
            id: id.to_string(),
            asset_id: asset_id.to_string(),
            static_ilp_address: prefix.to_string(),
            max_packet_amount: Some(1_000),
            http_incoming_token: format!("in-{}", id),
            http_outgoing_token: format!("out-{}", id),
            http_outgoing_endpoint: "http://127.0.0.1:9/ilp".to_string(),
            liquidity_threshold: None,
            created_at: now,
            updated_at: now,
        };
        crate::db::PeerQueries::new(db).insert(&peer).await.unwrap();
        ledger
            .create_liquidity_account(&AccountRef::new(id, asset_id, LiquidityAccountKind::Peer))
            .await
            .unwrap();
        peer
    }

    async fn seed_incoming_payment(
        db: &Database,
        id: &str,
        wallet_id: &str,
        asset_id: &str,
        state: IncomingPaymentState,
    ) {
        let now = Utc::now();
        let wallets = WalletAddressQueries::new(db);
        if wallets.get_by_id(wallet_id).await.unwrap().is_none() {
            wallets
                .insert(&WalletAddressModel {
                    id: wallet_id.to_string(),
                    url: format!("https://pay.example/{}", wallet_id),
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
        let conn = db.conn();
        let conn = conn.lock().await;
        IncomingPaymentQueries::insert_tx(
            &conn,
            &IncomingPaymentModel {
                id: id.to_string(),
                wallet_address_id: wallet_id.to_string(),
                asset_id: asset_id.to_string(),
                incoming_amount: Some(1_000),
                received_amount: 0,
                state,
                expires_at: now + Duration::days(1),
                connection_id: Some(id.to_string()),
                metadata: None,
                process_at: None,
                created_at: now,
                updated_at: now,
            },
        )
        .unwrap();
    }

    fn prepare_for(pipeline: &PacketPipeline, tag: &str, amount: u64, data: &[u8]) -> Prepare {
        let creds = pipeline.secrets().credentials(tag);
        Prepare {
            amount,
            expires_at: Utc::now() + Duration::seconds(30),
            execution_condition: stream::condition(&creds.shared_secret, data),
            destination: creds.ilp_address,
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_peer_packet_fulfills_local_incoming_payment() {
        let (pipeline, db, ledger) = fixture().await;
        seed_asset(&db, "usd", "USD", 9).await;
        let peer = seed_peer(&db, &ledger, "peer-1", "usd", "test.peer").await;
        ledger.create_deposit("seed", "peer-1", 500).await.unwrap();
        seed_incoming_payment(&db, "ip-1", "wa-1", "usd", IncomingPaymentState::Pending).await;

        let prepare = prepare_for(&pipeline, "ip-1", 200, b"stream data");
        match pipeline.handle(PacketSource::Peer(peer), prepare).await {
            Packet::Fulfill(_) => {}
            other => panic!("expected fulfill, got {:?}", other),
        }
        // the reservation was committed: value moved peer -> payment
        assert_eq!(ledger.get_total_received("ip-1").await.unwrap(), 200);
        assert_eq!(ledger.get_total_sent("peer-1").await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_wrong_condition_voids_reservation() {
        let (pipeline, db, ledger) = fixture().await;
        seed_asset(&db, "usd", "USD", 9).await;
        let peer = seed_peer(&db, &ledger, "peer-1", "usd", "test.peer").await;
        ledger.create_deposit("seed", "peer-1", 500).await.unwrap();
        seed_incoming_payment(&db, "ip-1", "wa-1", "usd", IncomingPaymentState::Pending).await;

        let mut prepare = prepare_for(&pipeline, "ip-1", 200, b"stream data");
        prepare.execution_condition = [9u8; 32];
        match pipeline.handle(PacketSource::Peer(peer), prepare).await {
            Packet::Reject(reject) => assert_eq!(reject.code, ErrorCode::WrongCondition),
            other => panic!("expected reject, got {:?}", other),
        }
        assert_eq!(ledger.get_total_received("ip-1").await.unwrap(), 0);
        assert_eq!(ledger.get_balance("peer-1").await.unwrap(), 500);
    }

    #[tokio::test]
    async fn test_terminal_payment_is_unreachable() {
        let (pipeline, db, ledger) = fixture().await;
        seed_asset(&db, "usd", "USD", 9).await;
        let peer = seed_peer(&db, &ledger, "peer-1", "usd", "test.peer").await;
        ledger.create_deposit("seed", "peer-1", 500).await.unwrap();
        seed_incoming_payment(&db, "ip-1", "wa-1", "usd", IncomingPaymentState::Completed).await;

        let prepare = prepare_for(&pipeline, "ip-1", 200, b"stream data");
        match pipeline.handle(PacketSource::Peer(peer), prepare).await {
            Packet::Reject(reject) => assert_eq!(reject.code, ErrorCode::Unreachable),
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_amount_probe_reaches_terminal_payment() {
        let (pipeline, db, ledger) = fixture().await;
        seed_asset(&db, "usd", "USD", 9).await;
        let peer = seed_peer(&db, &ledger, "peer-1", "usd", "test.peer").await;
        seed_incoming_payment(&db, "ip-1", "wa-1", "usd", IncomingPaymentState::Completed).await;

        let prepare = prepare_for(&pipeline, "ip-1", 0, b"probe");
        match pipeline.handle(PacketSource::Peer(peer), prepare).await {
            Packet::Fulfill(_) => {}
            other => panic!("expected fulfill, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_max_packet_amount_rejected_with_cap() {
        let (pipeline, db, ledger) = fixture().await;
        seed_asset(&db, "usd", "USD", 9).await;
        let peer = seed_peer(&db, &ledger, "peer-1", "usd", "test.peer").await;
        seed_incoming_payment(&db, "ip-1", "wa-1", "usd", IncomingPaymentState::Pending).await;

        let prepare = prepare_for(&pipeline, "ip-1", 5_000, b"stream data");
        match pipeline.handle(PacketSource::Peer(peer), prepare).await {
            Packet::Reject(reject) => {
                assert_eq!(reject.code, ErrorCode::AmountTooLarge);
                // data carries (received, maximum)
                assert_eq!(reject.data.len(), 16);
                let max = u64::from_be_bytes(reject.data[8..16].try_into().unwrap());
                assert_eq!(max, 1_000);
            }
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_insufficient_peer_liquidity() {
        let (pipeline, db, ledger) = fixture().await;
        seed_asset(&db, "usd", "USD", 9).await;
        let peer = seed_peer(&db, &ledger, "peer-1", "usd", "test.peer").await;
        // no deposit: the peer has no balance to draw on
        seed_incoming_payment(&db, "ip-1", "wa-1", "usd", IncomingPaymentState::Pending).await;

        let prepare = prepare_for(&pipeline, "ip-1", 200, b"stream data");
        match pipeline.handle(PacketSource::Peer(peer), prepare).await {
            Packet::Reject(reject) => assert_eq!(reject.code, ErrorCode::InsufficientLiquidity),
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_destination_unreachable() {
        let (pipeline, db, ledger) = fixture().await;
        seed_asset(&db, "usd", "USD", 9).await;
        let peer = seed_peer(&db, &ledger, "peer-1", "usd", "test.peer").await;

        let prepare = Prepare {
            amount: 10,
            expires_at: Utc::now() + Duration::seconds(30),
            execution_condition: [0u8; 32],
            destination: "test.nowhere.alice".to_string(),
            data: Vec::new(),
        };
        match pipeline.handle(PacketSource::Peer(peer), prepare).await {
            Packet::Reject(reject) => assert_eq!(reject.code, ErrorCode::Unreachable),
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_ilp_access_branch_is_reserved() {
        let (pipeline, db, ledger) = fixture().await;
        seed_asset(&db, "usd", "USD", 9).await;
        let peer = seed_peer(&db, &ledger, "peer-1", "usd", "test.peer").await;

        let prepare = Prepare {
            amount: 10,
            expires_at: Utc::now() + Duration::seconds(30),
            execution_condition: [0u8; 32],
            // under our own prefix but not a decodable stream tag
            destination: "test.engine.some-local-account".to_string(),
            data: Vec::new(),
        };
        match pipeline.handle(PacketSource::Peer(peer), prepare).await {
            Packet::Reject(reject) => assert_eq!(reject.code, ErrorCode::Unreachable),
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expired_prepare_rejected_without_reservation() {
        let (pipeline, db, ledger) = fixture().await;
        seed_asset(&db, "usd", "USD", 9).await;
        let peer = seed_peer(&db, &ledger, "peer-1", "usd", "test.peer").await;
        ledger.create_deposit("seed", "peer-1", 500).await.unwrap();
        seed_incoming_payment(&db, "ip-1", "wa-1", "usd", IncomingPaymentState::Pending).await;

        let mut prepare = prepare_for(&pipeline, "ip-1", 100, b"stream data");
        prepare.expires_at = Utc::now() - Duration::seconds(1);
        match pipeline.handle(PacketSource::Peer(peer), prepare).await {
            Packet::Reject(reject) => assert_eq!(reject.code, ErrorCode::TransferTimedOut),
            other => panic!("expected reject, got {:?}", other),
        }
        assert_eq!(ledger.get_balance("peer-1").await.unwrap(), 500);
    }

    #[tokio::test]
    async fn test_ildcp_request_answered_for_peer() {
        let (pipeline, db, ledger) = fixture().await;
        seed_asset(&db, "usd", "USD", 2).await;
        let peer = seed_peer(&db, &ledger, "peer-1", "usd", "test.peer").await;

        let prepare = Prepare {
            amount: 0,
            expires_at: Utc::now() + Duration::seconds(30),
            execution_condition: ildcp_condition(),
            destination: crate::ilp::ILDCP_DESTINATION.to_string(),
            data: Vec::new(),
        };
        match pipeline.handle(PacketSource::Peer(peer), prepare).await {
            Packet::Fulfill(fulfill) => {
                let response = IldcpResponse::decode(&fulfill.data).unwrap();
                assert_eq!(response.ilp_address, "test.peer");
                assert_eq!(response.asset_code, "USD");
                assert_eq!(response.asset_scale, 2);
            }
            other => panic!("expected fulfill, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cross_asset_delivery_applies_rate() {
        let (pipeline, db, ledger) = fixture().await;
        seed_asset(&db, "usd", "USD", 9).await;
        seed_asset(&db, "xrp", "XRP", 9).await;
        let peer = seed_peer(&db, &ledger, "peer-1", "usd", "test.peer").await;
        ledger.create_deposit("seed", "peer-1", 1_000).await.unwrap();
        seed_incoming_payment(&db, "ip-1", "wa-1", "xrp", IncomingPaymentState::Pending).await;

        let prepare = prepare_for(&pipeline, "ip-1", 200, b"stream data");
        match pipeline.handle(PacketSource::Peer(peer), prepare).await {
            Packet::Fulfill(_) => {}
            other => panic!("expected fulfill, got {:?}", other),
        }
        // USD -> XRP at 0.5, equal scales
        assert_eq!(ledger.get_total_sent("peer-1").await.unwrap(), 200);
        assert_eq!(ledger.get_total_received("ip-1").await.unwrap(), 100);
    }
}
