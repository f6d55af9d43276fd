//! Receiver resolution
//!
//! A receiver URL names either an incoming payment
//! (`{walletAddress}/incoming-payments/{id}`) or a STREAM connection
//! (`{openPaymentsUrl}/connections/{id}`). Local URLs are read straight
//! from the database; remote ones are fetched over Open Payments with a
//! cached grant. Resolution failures surface as `None` so quoting can
//! answer `InvalidReceiver` deterministically.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::db::{Amount, AssetQueries, Database, WalletAddressQueries};
use crate::payment::{
    CreateIncomingPaymentArgs, IncomingPaymentError, IncomingPaymentService,
};

mod grants;

pub use grants::{GrantCache, GrantKey};

/// Failures creating a receiver
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiverError {
    /// The wallet address URL is not served by anyone we can reach
    #[error("unknown wallet address")]
    UnknownWalletAddress,
    /// The local incoming payment could not be created
    #[error("failed to create local receiver: {0}")]
    Local(#[from] IncomingPaymentError),
    /// The remote Open Payments call failed
    #[error("failed to create remote receiver: {0}")]
    Remote(String),
}

/// A resolved receiver: everything a quote or send needs to target it
#[derive(Debug, Clone, PartialEq)]
pub struct Receiver {
    /// The receiver URL as given
    pub url: String,
    /// Destination asset code
    pub asset_code: String,
    /// Destination asset scale
    pub asset_scale: u8,
    /// STREAM destination address
    pub ilp_address: String,
    /// STREAM shared secret
    pub shared_secret: [u8; 32],
    /// Target amount, when the receiver is an incoming payment with one
    pub incoming_amount: Option<Amount>,
    /// Amount received so far
    pub received_amount: Option<Amount>,
    /// Receiver expiry
    pub expires_at: Option<DateTime<Utc>>,
}

impl Receiver {
    /// Remaining amount the receiver will accept, if it advertises a target
    pub fn remaining_amount(&self) -> Option<u64> {
        let target = self.incoming_amount.as_ref()?;
        let received = self.received_amount.as_ref().map(|a| a.value).unwrap_or(0);
        Some(target.value.saturating_sub(received))
    }
}

/// Open Payments wire form of an amount (value as a decimal string)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpAmount {
    /// Decimal string value
    pub value: String,
    /// Asset code
    #[serde(rename = "assetCode")]
    pub asset_code: String,
    /// Asset scale
    #[serde(rename = "assetScale")]
    pub asset_scale: u8,
}

impl From<Amount> for OpAmount {
    fn from(amount: Amount) -> Self {
        Self {
            value: amount.value.to_string(),
            asset_code: amount.asset_code,
            asset_scale: amount.asset_scale,
        }
    }
}

impl TryFrom<OpAmount> for Amount {
    type Error = std::num::ParseIntError;

    fn try_from(amount: OpAmount) -> Result<Self, Self::Error> {
        Ok(Amount {
            value: amount.value.parse()?,
            asset_code: amount.asset_code,
            asset_scale: amount.asset_scale,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OpWalletAddress {
    #[serde(rename = "authServer")]
    auth_server: String,
}

#[derive(Debug, Deserialize)]
struct OpPaymentMethod {
    #[serde(rename = "type")]
    method_type: String,
    #[serde(rename = "ilpAddress")]
    ilp_address: String,
    #[serde(rename = "sharedSecret")]
    shared_secret: String,
}

#[derive(Debug, Deserialize)]
struct OpIncomingPayment {
    #[serde(rename = "incomingAmount")]
    incoming_amount: Option<OpAmount>,
    #[serde(rename = "receivedAmount")]
    received_amount: Option<OpAmount>,
    #[serde(default)]
    completed: bool,
    #[serde(rename = "expiresAt")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    methods: Vec<OpPaymentMethod>,
}

#[derive(Debug, Deserialize)]
struct OpConnection {
    #[serde(rename = "ilpAddress")]
    ilp_address: String,
    #[serde(rename = "sharedSecret")]
    shared_secret: String,
    #[serde(rename = "assetCode")]
    asset_code: String,
    #[serde(rename = "assetScale")]
    asset_scale: u8,
}

/// Arguments to create a receiver on a wallet address
#[derive(Debug, Clone)]
pub struct CreateReceiverArgs {
    /// Wallet address URL to receive on
    pub wallet_address_url: String,
    /// Optional target amount
    pub incoming_amount: Option<Amount>,
    /// Optional expiry
    pub expires_at: Option<DateTime<Utc>>,
    /// Caller metadata
    pub metadata: Option<serde_json::Value>,
}

/// Resolves and creates receivers, local or remote
pub struct ReceiverService {
    config: Arc<Config>,
    db: Database,
    incoming: Arc<IncomingPaymentService>,
    grants: GrantCache,
    http: reqwest::Client,
}

impl std::fmt::Debug for ReceiverService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverService").finish_non_exhaustive()
    }
}

impl ReceiverService {
    /// Create the service
    pub fn new(config: Arc<Config>, db: Database, incoming: Arc<IncomingPaymentService>) -> Self {
        let grants = GrantCache::new(config.clone());
        Self {
            config,
            db,
            incoming,
            grants,
            http: reqwest::Client::new(),
        }
    }

    /// Resolve a receiver URL. `None` means the receiver is unusable:
    /// unknown, terminal, or unreachable.
    pub async fn resolve(&self, url: &str) -> anyhow::Result<Option<Receiver>> {
        if let Some(receiver) = self.resolve_local(url).await? {
            return Ok(Some(receiver));
        }
        if self.is_local_url(url) {
            // a local URL that did not resolve is dead, not remote
            return Ok(None);
        }
        Ok(self.resolve_remote(url).await)
    }

    fn is_local_url(&self, url: &str) -> bool {
        url.starts_with(&self.config.node.open_payments_url)
            || url.starts_with(&self.config.node.wallet_address_url)
    }

    async fn resolve_local(&self, url: &str) -> anyhow::Result<Option<Receiver>> {
        let payment = if let Some(connection_id) = parse_segment(url, "/connections/") {
            if !self.is_local_url(url) {
                return Ok(None);
            }
            crate::db::IncomingPaymentQueries::new(&self.db)
                .get_by_connection_id(&connection_id)
                .await?
        } else if let Some(payment_id) = parse_segment(url, "/incoming-payments/") {
            let wallets = WalletAddressQueries::new(&self.db);
            // only treat the URL as local when its wallet prefix is ours
            if wallets.find_by_url_prefix(url).await?.is_none() && !self.is_local_url(url) {
                return Ok(None);
            }
            crate::db::IncomingPaymentQueries::new(&self.db)
                .get_by_id(&payment_id)
                .await?
        } else {
            None
        };

        let payment = match payment {
            Some(payment) if !payment.state.is_terminal() => payment,
            _ => return Ok(None),
        };

        let asset = AssetQueries::new(&self.db)
            .get_by_id(&payment.asset_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("payment asset missing"))?;
        let creds = self.incoming.credentials(&payment);
        Ok(Some(Receiver {
            url: url.to_string(),
            asset_code: asset.code.clone(),
            asset_scale: asset.scale,
            ilp_address: creds.ilp_address,
            shared_secret: creds.shared_secret,
            incoming_amount: payment
                .incoming_amount
                .map(|value| Amount::new(value, asset.code.clone(), asset.scale)),
            received_amount: Some(Amount::new(
                payment.received_amount,
                asset.code,
                asset.scale,
            )),
            expires_at: Some(payment.expires_at),
        }))
    }

    async fn resolve_remote(&self, url: &str) -> Option<Receiver> {
        if url.contains("/connections/") {
            return self.resolve_remote_connection(url).await;
        }

        let wallet_url = url.split("/incoming-payments/").next()?;
        let wallet = self.fetch_wallet_address(wallet_url).await?;
        let token = self
            .grants
            .get(GrantKey::new(
                &wallet.auth_server,
                "incoming-payment",
                &["read-all"],
            ))
            .await?;

        let response = self
            .http
            .get(url)
            .timeout(std::time::Duration::from_secs(10))
            .header("Authorization", format!("GNAP {}", token))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            debug!("Remote incoming payment fetch failed: {}", response.status());
            return None;
        }
        let payment: OpIncomingPayment = response.json().await.ok()?;
        self.receiver_from_remote(url, payment)
    }

    async fn resolve_remote_connection(&self, url: &str) -> Option<Receiver> {
        let response = self
            .http
            .get(url)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let connection: OpConnection = response.json().await.ok()?;
        let shared_secret = decode_shared_secret(&connection.shared_secret)?;
        Some(Receiver {
            url: url.to_string(),
            asset_code: connection.asset_code,
            asset_scale: connection.asset_scale,
            ilp_address: connection.ilp_address,
            shared_secret,
            incoming_amount: None,
            received_amount: None,
            expires_at: None,
        })
    }

    fn receiver_from_remote(&self, url: &str, payment: OpIncomingPayment) -> Option<Receiver> {
        if payment.completed {
            return None;
        }
        if matches!(payment.expires_at, Some(at) if at <= Utc::now()) {
            return None;
        }
        let method = payment.methods.iter().find(|m| m.method_type == "ilp")?;
        let shared_secret = decode_shared_secret(&method.shared_secret)?;
        Some(Receiver {
            url: url.to_string(),
            asset_code: payment
                .received_amount
                .as_ref()
                .or(payment.incoming_amount.as_ref())?
                .asset_code
                .clone(),
            asset_scale: payment
                .received_amount
                .as_ref()
                .or(payment.incoming_amount.as_ref())?
                .asset_scale,
            ilp_address: method.ilp_address.clone(),
            shared_secret,
            incoming_amount: payment
                .incoming_amount
                .and_then(|a| Amount::try_from(a).ok()),
            received_amount: payment
                .received_amount
                .and_then(|a| Amount::try_from(a).ok()),
            expires_at: payment.expires_at,
        })
    }

    async fn fetch_wallet_address(&self, wallet_url: &str) -> Option<OpWalletAddress> {
        let response = self
            .http
            .get(wallet_url)
            .timeout(std::time::Duration::from_secs(10))
            .header("Accept", "application/json")
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json().await.ok()
    }

    /// Create an incoming payment on a wallet address, local or remote,
    /// and return it as a receiver
    pub async fn create_receiver(&self, args: CreateReceiverArgs) -> Result<Receiver, ReceiverError> {
        let wallets = WalletAddressQueries::new(&self.db);
        let local_wallet = wallets
            .get_by_url(&args.wallet_address_url)
            .await
            .map_err(|e| ReceiverError::Remote(e.to_string()))?;

        if let Some(wallet) = local_wallet {
            let payment = self
                .incoming
                .create(CreateIncomingPaymentArgs {
                    wallet_address_id: wallet.id,
                    incoming_amount: args.incoming_amount,
                    expires_at: args.expires_at,
                    metadata: args.metadata,
                })
                .await?;
            let url = format!("{}/incoming-payments/{}", args.wallet_address_url, payment.id);
            return self
                .resolve_local(&url)
                .await
                .map_err(|e| ReceiverError::Remote(e.to_string()))?
                .ok_or(ReceiverError::UnknownWalletAddress);
        }

        // remote wallet address: create through Open Payments
        let wallet = self
            .fetch_wallet_address(&args.wallet_address_url)
            .await
            .ok_or(ReceiverError::UnknownWalletAddress)?;
        let token = self
            .grants
            .get(GrantKey::new(
                &wallet.auth_server,
                "incoming-payment",
                &["create", "read-all"],
            ))
            .await
            .ok_or_else(|| ReceiverError::Remote("no grant for incoming-payment".to_string()))?;

        let url = format!("{}/incoming-payments", args.wallet_address_url);
        let body = serde_json::json!({
            "incomingAmount": args.incoming_amount.map(OpAmount::from),
            "expiresAt": args.expires_at.map(|at| at.to_rfc3339()),
            "metadata": args.metadata,
        });
        let response = self
            .http
            .post(&url)
            .timeout(std::time::Duration::from_secs(10))
            .header("Authorization", format!("GNAP {}", token))
            .json(&body)
            .send()
            .await
            .map_err(|e| ReceiverError::Remote(e.to_string()))?;
        if !response.status().is_success() {
            warn!(
                "Remote incoming payment creation at {} failed: {}",
                url,
                response.status()
            );
            return Err(ReceiverError::Remote(format!(
                "creation failed with {}",
                response.status()
            )));
        }
        let payment: OpIncomingPayment = response
            .json()
            .await
            .map_err(|e| ReceiverError::Remote(e.to_string()))?;
        self.receiver_from_remote(&args.wallet_address_url, payment)
            .ok_or_else(|| ReceiverError::Remote("unusable receiver returned".to_string()))
    }
}

fn parse_segment(url: &str, marker: &str) -> Option<String> {
    let (_, rest) = url.split_once(marker)?;
    let id = rest.split(['/', '?']).next()?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

fn decode_shared_secret(encoded: &str) -> Option<[u8; 32]> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(encoded))
        .ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AssetModel, WalletAddressModel};
    use crate::stream::StreamSecrets;

    async fn fixture() -> (ReceiverService, Database) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let config = Arc::new(Config::default());
        let secrets = StreamSecrets::new([42u8; 32], config.node.ilp_address.clone());
        let incoming = Arc::new(IncomingPaymentService::new(
            config.clone(),
            db.clone(),
            secrets,
        ));
        let service = ReceiverService::new(config, db.clone(), incoming);

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
                url: "http://127.0.0.1:3001/alice".to_string(),
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
        (service, db)
    }

    #[test]
    fn test_amount_wire_roundtrip() {
        let amount = Amount::new(3364, "USD", 2);
        let wire = OpAmount::from(amount.clone());
        assert_eq!(wire.value, "3364");
        assert_eq!(Amount::try_from(wire).unwrap(), amount);
    }

    #[test]
    fn test_segment_parsing() {
        assert_eq!(
            parse_segment("https://x/alice/incoming-payments/abc", "/incoming-payments/"),
            Some("abc".to_string())
        );
        assert_eq!(
            parse_segment("https://x/connections/c-1?x=1", "/connections/"),
            Some("c-1".to_string())
        );
        assert_eq!(parse_segment("https://x/alice", "/incoming-payments/"), None);
    }

    #[tokio::test]
    async fn test_create_and_resolve_local_receiver() {
        let (service, _db) = fixture().await;
        let receiver = service
            .create_receiver(CreateReceiverArgs {
                wallet_address_url: "http://127.0.0.1:3001/alice".to_string(),
                incoming_amount: Some(Amount::new(500, "USD", 2)),
                expires_at: None,
                metadata: None,
            })
            .await
            .unwrap();
        assert_eq!(receiver.asset_code, "USD");
        assert_eq!(receiver.incoming_amount.as_ref().unwrap().value, 500);
        assert_eq!(receiver.remaining_amount(), Some(500));
        assert!(receiver.ilp_address.starts_with("test.engine."));

        let resolved = service.resolve(&receiver.url).await.unwrap().unwrap();
        assert_eq!(resolved, receiver);
    }

    #[tokio::test]
    async fn test_terminal_local_receiver_resolves_to_none() {
        let (service, _db) = fixture().await;
        let receiver = service
            .create_receiver(CreateReceiverArgs {
                wallet_address_url: "http://127.0.0.1:3001/alice".to_string(),
                incoming_amount: None,
                expires_at: None,
                metadata: None,
            })
            .await
            .unwrap();
        let payment_id = parse_segment(&receiver.url, "/incoming-payments/").unwrap();
        service.incoming.complete(&payment_id).await.unwrap();

        assert!(service.resolve(&receiver.url).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_on_unknown_local_wallet_fails() {
        let (service, _db) = fixture().await;
        // the URL is under our own host, so it is never treated as remote
        let result = service
            .create_receiver(CreateReceiverArgs {
                wallet_address_url: "http://127.0.0.1:3001/nobody".to_string(),
                incoming_amount: None,
                expires_at: None,
                metadata: None,
            })
            .await;
        assert!(result.is_err());
    }
}
