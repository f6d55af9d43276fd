//! ilp-engine: an account-servicing Interledger payment engine
//!
//! This crate implements the core of a payments backend that sits between
//! a double-entry liquidity ledger and the Interledger network:
//!
//! - **Packet pipeline**: a per-packet middleware chain that authenticates
//!   peers, enforces limits, reserves balance two-phase, and fulfills
//!   STREAM packets locally or forwards them to the next hop
//! - **Payment lifecycle**: durable incoming and outgoing payment state
//!   machines driven by polling workers, with quote-then-fund-then-send
//!   semantics and grant-limited creation
//! - **Liquidity substrate**: idempotent deposits and two-phase
//!   withdrawals binding assets, peers, wallet addresses, and payments to
//!   ledger accounts, reconciled through at-least-once webhook events
//!
//! # Architecture
//!
//! The [`Engine`] wires the services over one shared SQLite database:
//!
//! 1. Admin calls provision assets, peers, and wallet addresses
//! 2. Quotes resolve a receiver and fix amounts and rates
//! 3. Outgoing payments consume a quote, get funded by a ledger deposit,
//!    and are driven by the lifecycle worker through the pipeline
//! 4. Inbound packets credit incoming payments or wallet addresses, whose
//!    lifecycle hooks complete payments and schedule webhook events
#![warn(missing_docs)]

pub mod api;
pub mod config;
pub mod db;
pub mod ilp;
pub mod ledger;
pub mod liquidity;
pub mod payment;
pub mod pipeline;
pub mod quote;
pub mod receiver;
pub mod stream;
pub mod webhook;
pub mod worker;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use api::AdminService;
pub use config::Config;
use db::Database;
use ledger::{AccountRegistry, Ledger};
use payment::{
    IncomingPaymentService, OutgoingPaymentService, PaymentLifecycle, StreamPaySender,
};
use pipeline::PacketPipeline;
use quote::{QuoteService, RateService};
use receiver::ReceiverService;
use stream::StreamSecrets;
use webhook::WebhookService;
use worker::Workers;

/// The assembled payment engine
#[derive(Clone)]
pub struct Engine {
    /// Application configuration
    pub config: Arc<Config>,
    /// Database connection
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
    /// Lifecycle runner
    pub lifecycle: Arc<PaymentLifecycle>,
    /// Liquidity operations
    pub liquidity: Arc<liquidity::LiquidityService>,
    /// Webhook dispatcher
    pub webhooks: Arc<WebhookService>,
    /// Background workers
    pub workers: Arc<Workers>,
    /// Admin provisioning
    pub admin: Arc<AdminService>,
}

impl Engine {
    /// Create a new engine instance from configuration
    pub async fn new(config: Config) -> Result<Self> {
        let rates = Arc::new(RateService::new(&config.rates));
        Self::build(config, rates).await
    }

    /// Assemble the engine with an explicit rate service
    pub async fn build(config: Config, rates: Arc<RateService>) -> Result<Self> {
        info!("Initializing payment engine...");

        let config = Arc::new(config);

        let db_url = config.resolve_database_url();
        info!("Connecting to database at: {}", db_url);
        let db = Database::connect(&db_url).await?;

        let registry = AccountRegistry::new();
        let ledger = Ledger::new(db.clone(), registry.clone());
        let secrets = StreamSecrets::new(
            config.stream.secret_bytes()?,
            config.node.ilp_address.clone(),
        );

        let incoming = Arc::new(IncomingPaymentService::new(
            config.clone(),
            db.clone(),
            secrets.clone(),
        ));
        incoming.register_hooks(&registry).await;
        worker::register_wallet_address_hook(&registry, db.clone(), config.clone()).await;

        let pipeline = Arc::new(PacketPipeline::new(
            config.clone(),
            db.clone(),
            ledger.clone(),
            secrets,
            rates.clone(),
        ));
        let receivers = Arc::new(ReceiverService::new(
            config.clone(),
            db.clone(),
            incoming.clone(),
        ));
        let quotes = Arc::new(QuoteService::new(
            config.clone(),
            db.clone(),
            rates,
            receivers.clone(),
        ));
        let outgoing = Arc::new(OutgoingPaymentService::new(
            config.clone(),
            db.clone(),
            ledger.clone(),
            receivers.clone(),
        ));
        let lifecycle = Arc::new(PaymentLifecycle::new(
            config.clone(),
            db.clone(),
            outgoing.clone(),
            receivers.clone(),
            Arc::new(StreamPaySender::new(pipeline.clone())),
        ));
        let liquidity = Arc::new(liquidity::LiquidityService::new(db.clone(), ledger.clone()));
        let webhooks = Arc::new(WebhookService::new(config.clone(), db.clone()));
        let workers = Arc::new(Workers::new(
            config.clone(),
            db.clone(),
            ledger.clone(),
            lifecycle.clone(),
            incoming.clone(),
            webhooks.clone(),
        ));
        let admin = Arc::new(AdminService::new(db.clone(), ledger.clone()));

        info!("Payment engine initialized successfully");

        Ok(Self {
            config,
            db,
            ledger,
            pipeline,
            incoming,
            receivers,
            quotes,
            outgoing,
            lifecycle,
            liquidity,
            webhooks,
            workers,
            admin,
        })
    }

    fn api_state(&self) -> api::ApiState {
        api::ApiState {
            config: self.config.clone(),
            db: self.db.clone(),
            ledger: self.ledger.clone(),
            pipeline: self.pipeline.clone(),
            incoming: self.incoming.clone(),
            receivers: self.receivers.clone(),
            quotes: self.quotes.clone(),
            outgoing: self.outgoing.clone(),
            liquidity: self.liquidity.clone(),
            webhooks: self.webhooks.clone(),
            workers: self.workers.clone(),
            admin: self.admin.clone(),
        }
    }

    /// Start the engine: background workers plus the HTTP API
    pub async fn run(&self) -> Result<()> {
        self.run_with_shutdown(tokio::sync::oneshot::channel().1)
            .await
    }

    /// Start the engine with a shutdown signal
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        info!("Starting payment engine...");

        let worker_handles = self.workers.clone().spawn();

        info!(
            "Payment engine running. API available at http://{}",
            self.config.api.bind_address
        );
        let result = api::serve_with_shutdown(self.api_state(), shutdown_rx).await;

        for handle in worker_handles {
            handle.abort();
        }
        result
    }

    /// Shutdown the engine gracefully
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down payment engine...");
        self.db.close().await;
        info!("Payment engine shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;
    use db::{Amount, IncomingPaymentState, OutgoingPaymentState, WebhookEventType};
    use payment::{CreateIncomingPaymentArgs, CreateOutgoingPaymentArgs, FundArgs};
    use quote::CreateQuoteArgs;
    use std::collections::HashMap;

    async fn engine_with_rates(rates: HashMap<String, f64>) -> Engine {
        let mut config = Config::default();
        config.database.url = "sqlite::memory:".to_string();
        config.quotes.slippage = 0.01;
        Engine::build(config, Arc::new(RateService::with_rates("USD", rates)))
            .await
            .unwrap()
    }

    /// Fixed-send to a local incoming payment across currencies: quote,
    /// create, fund, drive to completion, check both sides of the ledger.
    #[tokio::test]
    async fn test_fixed_send_local_payment_end_to_end() {
        let engine =
            engine_with_rates(HashMap::from([("XRP".to_string(), 0.5)])).await;

        let usd = engine.admin.create_asset("USD", 9, None).await.unwrap();
        let xrp = engine.admin.create_asset("XRP", 9, None).await.unwrap();
        let alice = engine
            .admin
            .create_wallet_address("http://127.0.0.1:3001/alice", &usd.id, None)
            .await
            .unwrap();
        let bob = engine
            .admin
            .create_wallet_address("http://127.0.0.1:3001/bob", &xrp.id, None)
            .await
            .unwrap();

        let incoming = engine
            .incoming
            .create(CreateIncomingPaymentArgs {
                wallet_address_id: bob.id.clone(),
                incoming_amount: Some(Amount::new(56, "XRP", 9)),
                expires_at: None,
                metadata: None,
            })
            .await
            .unwrap();
        let receiver_url = format!("http://127.0.0.1:3001/bob/incoming-payments/{}", incoming.id);

        let quote = engine
            .quotes
            .create(CreateQuoteArgs {
                wallet_address_id: alice.id.clone(),
                receiver: receiver_url,
                debit_amount: Some(Amount::new(123, "USD", 9)),
                receive_amount: None,
                client: None,
            })
            .await
            .unwrap();
        assert_eq!(quote.receive_amount, 61);
        assert!((quote.min_exchange_rate - 0.5 * 0.99).abs() < 1e-12);

        let payment = engine
            .outgoing
            .create(CreateOutgoingPaymentArgs {
                wallet_address_id: alice.id.clone(),
                quote_id: quote.id.clone(),
                metadata: None,
                grant: None,
                client: None,
            })
            .await
            .unwrap();
        engine
            .outgoing
            .fund(FundArgs {
                id: payment.id.clone(),
                amount: 123,
                transfer_id: "fund-1".to_string(),
            })
            .await
            .unwrap();

        // one worker pass drives the whole send
        assert!(engine.lifecycle.process_one().await.unwrap());

        let finished = engine.outgoing.get(&payment.id).await.unwrap().unwrap();
        assert_eq!(finished.state, OutgoingPaymentState::Completed);
        // at rate 0.5 the sender pays two source units per delivered unit
        assert_eq!(finished.sent_amount, 2 * quote.receive_amount);

        let received = engine.incoming.get(&incoming.id).await.unwrap().unwrap();
        assert_eq!(received.received_amount, quote.receive_amount);
        // 61 >= the 56 target: the incoming payment completed
        assert_eq!(received.state, IncomingPaymentState::Completed);

        // ledger agrees with both domain tables
        assert_eq!(
            engine.ledger.get_total_sent(&payment.id).await.unwrap(),
            finished.sent_amount
        );
        assert_eq!(
            engine.ledger.get_total_received(&incoming.id).await.unwrap(),
            received.received_amount
        );
        // residual = debit - sent stays on the payment account for the
        // terminal event's withdrawal
        assert_eq!(
            engine.ledger.get_balance(&payment.id).await.unwrap(),
            123 - finished.sent_amount
        );
    }

    /// SPSP fallback: a packet addressed to a wallet address credits its
    /// web monetization account and arms the withdrawal schedule.
    #[tokio::test]
    async fn test_spsp_fallback_credits_wallet_address() {
        use ilp::Prepare;
        use pipeline::PacketSource;

        let engine = engine_with_rates(HashMap::new()).await;
        let usd = engine.admin.create_asset("USD", 9, None).await.unwrap();
        let alice = engine
            .admin
            .create_wallet_address("http://127.0.0.1:3001/alice", &usd.id, None)
            .await
            .unwrap();
        let peer = engine
            .admin
            .create_peer(&usd.id, "test.peer", None, "in-token", "out-token", "http://peer", None)
            .await
            .unwrap();
        engine
            .liquidity
            .add_peer_liquidity(&peer.id, "seed", 1_000, None)
            .await
            .unwrap();

        // SPSP hands out credentials tagged with the wallet address id
        let creds = engine.incoming.wallet_credentials(&alice.id);
        let data = b"wm payment".to_vec();
        let prepare = Prepare {
            amount: 250,
            expires_at: chrono::Utc::now() + chrono::Duration::seconds(30),
            execution_condition: stream::condition(&creds.shared_secret, &data),
            destination: creds.ilp_address,
            data,
        };

        match engine.pipeline.handle(PacketSource::Peer(peer), prepare).await {
            ilp::Packet::Fulfill(_) => {}
            other => panic!("expected fulfill, got {:?}", other),
        }
        assert_eq!(engine.ledger.get_total_received(&alice.id).await.unwrap(), 250);

        // the credit hook armed the throttled withdrawal schedule
        let wallet = db::WalletAddressQueries::new(&engine.db)
            .get_by_id(&alice.id)
            .await
            .unwrap()
            .unwrap();
        assert!(wallet.process_at.is_some());

        // a due sweep emits the web monetization event with the delta
        db::WalletAddressQueries::new(&engine.db)
            .set_process_at(&alice.id, Some(chrono::Utc::now() - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        engine.workers.process_due_wallet_addresses().await.unwrap();
        let events = db::WebhookEventQueries::new(&engine.db)
            .list_due(chrono::Utc::now(), 20)
            .await
            .unwrap();
        let event = events
            .iter()
            .find(|e| e.event_type == WebhookEventType::WalletAddressWebMonetization)
            .unwrap();
        assert_eq!(event.withdrawal.as_ref().unwrap().amount, 250);
    }
}
