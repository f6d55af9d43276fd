//! Webhook dispatcher
//!
//! Events are written in the same database transaction as the state change
//! they report and delivered at least once by the webhook worker. Failed
//! deliveries back off exponentially; after the configured attempt budget
//! the event is parked (`process_at = NULL`) and flagged in the log.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{
    Database, EventWithdrawal, WebhookEventModel, WebhookEventQueries, WebhookEventType,
};

/// Longest backoff between delivery attempts
const MAX_BACKOFF_SECS: i64 = 60 * 60 * 24;

/// Builds, stores, and delivers webhook events
#[derive(Clone)]
pub struct WebhookService {
    config: Arc<Config>,
    db: Database,
    client: reqwest::Client,
}

impl WebhookService {
    /// Create the service
    pub fn new(config: Arc<Config>, db: Database) -> Self {
        Self {
            config,
            db,
            client: reqwest::Client::new(),
        }
    }

    /// Build an event due for immediate delivery
    pub fn build_event(
        event_type: WebhookEventType,
        data: serde_json::Value,
        withdrawal: Option<EventWithdrawal>,
    ) -> WebhookEventModel {
        let now = Utc::now();
        WebhookEventModel {
            id: Uuid::new_v4().to_string(),
            event_type,
            data,
            process_at: Some(now),
            attempts: 0,
            status_code: None,
            withdrawal,
            created_at: now,
            updated_at: now,
        }
    }

    /// Insert an event inside the caller's transaction
    pub fn enqueue_tx(
        conn: &Connection,
        event_type: WebhookEventType,
        data: serde_json::Value,
        withdrawal: Option<EventWithdrawal>,
    ) -> anyhow::Result<WebhookEventModel> {
        let event = Self::build_event(event_type, data, withdrawal);
        WebhookEventQueries::insert_tx(conn, &event)?;
        debug!("Enqueued webhook event {} ({})", event.id, event_type.as_str());
        Ok(event)
    }

    /// Insert an event on its own
    pub async fn enqueue(
        &self,
        event_type: WebhookEventType,
        data: serde_json::Value,
        withdrawal: Option<EventWithdrawal>,
    ) -> anyhow::Result<WebhookEventModel> {
        let event = Self::build_event(event_type, data, withdrawal);
        WebhookEventQueries::new(&self.db).insert(&event).await?;
        debug!("Enqueued webhook event {} ({})", event.id, event_type.as_str());
        Ok(event)
    }

    /// Delivery backoff after `attempts` tries
    pub fn backoff(&self, attempts: u32) -> Duration {
        let base = self.config.webhooks.retry_backoff_secs as i64;
        let secs = base
            .saturating_mul(1i64 << attempts.min(30))
            .min(MAX_BACKOFF_SECS);
        Duration::seconds(secs)
    }

    /// Deliver every due event once. Returns the number processed.
    pub async fn process_due(&self, now: DateTime<Utc>, limit: u32) -> anyhow::Result<usize> {
        let queries = WebhookEventQueries::new(&self.db);
        let due = queries.list_due(now, limit).await?;
        let count = due.len();
        for event in due {
            self.deliver(event).await?;
        }
        Ok(count)
    }

    /// One delivery attempt for one event
    pub async fn deliver(&self, event: WebhookEventModel) -> anyhow::Result<()> {
        let queries = WebhookEventQueries::new(&self.db);
        let body = serde_json::json!({
            "id": event.id,
            "type": event.event_type.as_str(),
            "data": event.data,
        });

        debug!(
            "Delivering webhook event {} (attempt {})",
            event.id,
            event.attempts + 1
        );

        let result = self
            .client
            .post(&self.config.webhooks.webhook_url)
            .timeout(StdDuration::from_millis(self.config.webhooks.timeout_ms))
            .json(&body)
            .send()
            .await;

        let status = match &result {
            Ok(response) => Some(response.status().as_u16()),
            Err(_) => None,
        };

        let delivered = matches!(&result, Ok(response) if response.status().is_success());
        if delivered {
            info!(
                "Webhook event {} ({}) delivered",
                event.id,
                event.event_type.as_str()
            );
            // append-only table is garbage-collected after delivery
            queries.delete(&event.id).await?;
            return Ok(());
        }

        let attempts = event.attempts + 1;
        if attempts >= self.config.webhooks.max_attempts {
            error!(
                "Webhook event {} ({}) gave up after {} attempts (last status {:?})",
                event.id,
                event.event_type.as_str(),
                attempts,
                status
            );
            queries.record_attempt(&event.id, status, None).await?;
        } else {
            let next = Utc::now() + self.backoff(event.attempts);
            warn!(
                "Webhook event {} delivery failed (status {:?}), retrying at {}",
                event.id, status, next
            );
            queries.record_attempt(&event.id, status, Some(next)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> WebhookService {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        WebhookService::new(Arc::new(Config::default()), db)
    }

    #[tokio::test]
    async fn test_backoff_doubles_and_caps() {
        let service = service().await;
        let base = service.config.webhooks.retry_backoff_secs as i64;
        assert_eq!(service.backoff(0), Duration::seconds(base));
        assert_eq!(service.backoff(1), Duration::seconds(base * 2));
        assert_eq!(service.backoff(3), Duration::seconds(base * 8));
        assert_eq!(service.backoff(60), Duration::seconds(MAX_BACKOFF_SECS));
    }

    #[tokio::test]
    async fn test_enqueue_and_list_due() {
        let service = service().await;
        let event = service
            .enqueue(
                WebhookEventType::IncomingPaymentCompleted,
                serde_json::json!({"id": "ip-1"}),
                Some(EventWithdrawal {
                    account_id: "ip-1".to_string(),
                    asset_id: "usd".to_string(),
                    amount: 42,
                }),
            )
            .await
            .unwrap();

        let queries = WebhookEventQueries::new(&service.db);
        let due = queries.list_due(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, event.id);
        assert_eq!(due[0].withdrawal.as_ref().unwrap().amount, 42);
    }

    #[tokio::test]
    async fn test_failed_delivery_reschedules_then_parks() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let mut config = Config::default();
        // nothing is listening on this port
        config.webhooks.webhook_url = "http://127.0.0.1:9/webhooks".to_string();
        config.webhooks.timeout_ms = 200;
        config.webhooks.max_attempts = 2;
        let service = WebhookService::new(Arc::new(config), db);

        let event = service
            .enqueue(
                WebhookEventType::OutgoingPaymentFailed,
                serde_json::json!({"id": "op-1"}),
                None,
            )
            .await
            .unwrap();

        let queries = WebhookEventQueries::new(&service.db);

        // first failure: rescheduled into the future
        service.deliver(queries.get_by_id(&event.id).await.unwrap().unwrap()).await.unwrap();
        let after_first = queries.get_by_id(&event.id).await.unwrap().unwrap();
        assert_eq!(after_first.attempts, 1);
        assert!(after_first.process_at.unwrap() > Utc::now());

        // second failure: attempt budget exhausted, event parked
        service.deliver(after_first).await.unwrap();
        let after_second = queries.get_by_id(&event.id).await.unwrap().unwrap();
        assert_eq!(after_second.attempts, 2);
        assert!(after_second.process_at.is_none());
    }
}
