//! Background workers
//!
//! Four interval loops share the database: the outgoing payment worker
//! (claims one due payment per tick and runs a pay step), the incoming
//! payment expiry worker, the wallet address withdrawal worker, and the
//! webhook delivery worker. Each loop survives individual tick failures.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::db::{
    Database, IncomingPaymentQueries, WalletAddressQueries, WebhookEventType,
};
use crate::ledger::{AccountRegistry, Ledger, LiquidityAccountKind};
use crate::payment::{IncomingPaymentService, PaymentLifecycle};
use crate::webhook::WebhookService;

/// How many due rows a worker handles per tick
const WORKER_BATCH: u32 = 20;

/// Register the wallet address credit hook: a settled web monetization
/// credit schedules a throttled withdrawal event.
pub async fn register_wallet_address_hook(
    registry: &AccountRegistry,
    db: Database,
    config: Arc<Config>,
) {
    registry
        .register(
            LiquidityAccountKind::WebMonetization,
            Arc::new(move |event| {
                let db = db.clone();
                let delay = config.withdrawal_throttle_delay();
                Box::pin(async move {
                    let queries = WalletAddressQueries::new(&db);
                    if let Err(e) = queries
                        .schedule_process_at_if_unset(&event.account_id, Utc::now() + delay)
                        .await
                    {
                        error!(
                            "Failed to schedule wallet address {} for withdrawal: {}",
                            event.account_id, e
                        );
                    }
                })
            }),
        )
        .await;
}

/// The background worker set
pub struct Workers {
    config: Arc<Config>,
    db: Database,
    ledger: Ledger,
    lifecycle: Arc<PaymentLifecycle>,
    incoming: Arc<IncomingPaymentService>,
    webhooks: Arc<WebhookService>,
}

impl Workers {
    /// Create the worker set
    pub fn new(
        config: Arc<Config>,
        db: Database,
        ledger: Ledger,
        lifecycle: Arc<PaymentLifecycle>,
        incoming: Arc<IncomingPaymentService>,
        webhooks: Arc<WebhookService>,
    ) -> Self {
        Self {
            config,
            db,
            ledger,
            lifecycle,
            incoming,
            webhooks,
        }
    }

    /// Spawn all worker loops
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        info!("Starting background workers");
        vec![
            self.clone().spawn_outgoing_worker(),
            self.clone().spawn_incoming_expiry_worker(),
            self.clone().spawn_wallet_address_worker(),
            self.spawn_webhook_worker(),
        ]
    }

    fn spawn_outgoing_worker(self: Arc<Self>) -> JoinHandle<()> {
        let poll = Duration::from_millis(self.config.workers.outgoing_poll_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll);
            loop {
                interval.tick().await;
                // drain everything due, one claimed payment at a time
                loop {
                    match self.lifecycle.process_one().await {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(e) => {
                            error!("Outgoing payment worker tick failed: {}", e);
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_incoming_expiry_worker(self: Arc<Self>) -> JoinHandle<()> {
        let poll = Duration::from_millis(self.config.workers.incoming_poll_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll);
            loop {
                interval.tick().await;
                if let Err(e) = self.expire_due_incoming_payments().await {
                    error!("Incoming payment expiry tick failed: {}", e);
                }
            }
        })
    }

    /// One expiry sweep. Public for tests and manual ticks.
    pub async fn expire_due_incoming_payments(&self) -> anyhow::Result<usize> {
        let due = IncomingPaymentQueries::new(&self.db)
            .list_due_expiry(Utc::now(), WORKER_BATCH)
            .await?;
        let count = due.len();
        for payment in due {
            debug!("Expiring incoming payment {}", payment.id);
            if let Err(e) = self.incoming.expire(&payment).await {
                error!("Failed to expire incoming payment {}: {}", payment.id, e);
            }
        }
        Ok(count)
    }

    fn spawn_wallet_address_worker(self: Arc<Self>) -> JoinHandle<()> {
        let poll = Duration::from_millis(self.config.workers.wallet_address_poll_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll);
            loop {
                interval.tick().await;
                if let Err(e) = self.process_due_wallet_addresses().await {
                    error!("Wallet address worker tick failed: {}", e);
                }
            }
        })
    }

    /// One wallet address sweep: emit a web monetization event for the
    /// delta accumulated since the last one. Public for tests and the
    /// admin trigger operation.
    pub async fn process_due_wallet_addresses(&self) -> anyhow::Result<usize> {
        let queries = WalletAddressQueries::new(&self.db);
        let due = queries.list_due(Utc::now(), WORKER_BATCH).await?;
        let count = due.len();
        for wallet in due {
            let total_received = match self.ledger.get_total_received(&wallet.id).await {
                Ok(total) => total,
                Err(e) => {
                    error!("No ledger account for wallet address {}: {}", wallet.id, e);
                    queries.set_process_at(&wallet.id, None).await?;
                    continue;
                }
            };
            let delta = total_received.saturating_sub(wallet.total_events_amount);
            if delta == 0 {
                queries.set_process_at(&wallet.id, None).await?;
                continue;
            }
            debug!(
                "Wallet address {} accumulated {} since last event",
                wallet.id, delta
            );
            self.webhooks
                .enqueue(
                    WebhookEventType::WalletAddressWebMonetization,
                    serde_json::json!({
                        "walletAddressId": wallet.id,
                        "walletAddressUrl": wallet.url,
                    }),
                    Some(crate::db::EventWithdrawal {
                        account_id: wallet.id.clone(),
                        asset_id: wallet.asset_id.clone(),
                        amount: delta,
                    }),
                )
                .await?;
            // the accumulator advances when the consumer withdraws; clear
            // the schedule so new credits re-arm it
            queries.set_process_at(&wallet.id, None).await?;
        }
        Ok(count)
    }

    fn spawn_webhook_worker(self: Arc<Self>) -> JoinHandle<()> {
        let poll = Duration::from_millis(self.config.workers.webhook_poll_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll);
            loop {
                interval.tick().await;
                if let Err(e) = self.webhooks.process_due(Utc::now(), WORKER_BATCH).await {
                    error!("Webhook worker tick failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        Amount, AssetModel, AssetQueries, IncomingPaymentState, WalletAddressModel,
        WebhookEventQueries,
    };
    use crate::ledger::AccountRef;
    use crate::payment::{CreateIncomingPaymentArgs, PaySender};
    use crate::receiver::ReceiverService;
    use crate::stream::StreamSecrets;
    use async_trait::async_trait;

    struct NoopSender;

    #[async_trait]
    impl PaySender for NoopSender {
        async fn pay(&self, _plan: &crate::payment::PayPlan) -> crate::payment::PayOutcome {
            crate::payment::PayOutcome {
                amount_sent: 0,
                amount_delivered: 0,
                error: None,
            }
        }
    }

    async fn fixture() -> (Workers, Arc<IncomingPaymentService>, Ledger, Database) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let config = Arc::new(Config::default());
        let registry = AccountRegistry::new();
        let ledger = Ledger::new(db.clone(), registry.clone());
        let secrets = StreamSecrets::new([42u8; 32], config.node.ilp_address.clone());
        let incoming = Arc::new(IncomingPaymentService::new(
            config.clone(),
            db.clone(),
            secrets,
        ));
        incoming.register_hooks(&registry).await;
        register_wallet_address_hook(&registry, db.clone(), config.clone()).await;
        let receivers = Arc::new(ReceiverService::new(
            config.clone(),
            db.clone(),
            incoming.clone(),
        ));
        let outgoing = Arc::new(crate::payment::OutgoingPaymentService::new(
            config.clone(),
            db.clone(),
            ledger.clone(),
            receivers.clone(),
        ));
        let lifecycle = Arc::new(PaymentLifecycle::new(
            config.clone(),
            db.clone(),
            outgoing,
            receivers,
            Arc::new(NoopSender),
        ));
        let webhooks = Arc::new(WebhookService::new(config.clone(), db.clone()));
        let workers = Workers::new(
            config,
            db.clone(),
            ledger.clone(),
            lifecycle,
            incoming.clone(),
            webhooks,
        );

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
        WalletAddressQueries::new(&db)
            .insert(&WalletAddressModel {
                id: "wa-1".to_string(),
                url: "https://pay.example/alice".to_string(),
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
        (workers, incoming, ledger, db)
    }

    #[tokio::test]
    async fn test_expiry_sweep_expires_overdue_payments() {
        let (workers, incoming, _ledger, _db) = fixture().await;
        let payment = incoming
            .create(CreateIncomingPaymentArgs {
                wallet_address_id: "wa-1".to_string(),
                incoming_amount: Some(Amount::new(100, "USD", 2)),
                expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
                metadata: None,
            })
            .await
            .unwrap();

        let expired = workers.expire_due_incoming_payments().await.unwrap();
        assert_eq!(expired, 1);
        let loaded = incoming.get(&payment.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, IncomingPaymentState::Expired);

        // nothing left to expire
        assert_eq!(workers.expire_due_incoming_payments().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wallet_address_sweep_emits_delta_withdrawal() {
        let (workers, _incoming, ledger, db) = fixture().await;

        // a web monetization credit arms the schedule through the hook
        ledger
            .create_liquidity_account(&AccountRef::new(
                "wa-1",
                "usd",
                LiquidityAccountKind::WebMonetization,
            ))
            .await
            .unwrap();
        ledger.create_deposit("c1", "wa-1", 70).await.unwrap();

        let wallets = WalletAddressQueries::new(&db);
        let armed = wallets.get_by_id("wa-1").await.unwrap().unwrap();
        assert!(armed.process_at.is_some());

        // force the schedule due now
        wallets
            .set_process_at("wa-1", Some(Utc::now() - chrono::Duration::seconds(1)))
            .await
            .unwrap();

        let processed = workers.process_due_wallet_addresses().await.unwrap();
        assert_eq!(processed, 1);

        let events = WebhookEventQueries::new(&db)
            .list_due(Utc::now(), 10)
            .await
            .unwrap();
        let event = events
            .iter()
            .find(|e| e.event_type == WebhookEventType::WalletAddressWebMonetization)
            .unwrap();
        assert_eq!(event.withdrawal.as_ref().unwrap().amount, 70);

        // the schedule is cleared until the next credit
        let after = wallets.get_by_id("wa-1").await.unwrap().unwrap();
        assert!(after.process_at.is_none());
    }
}
