//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An amount in a concrete asset denomination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    /// Value in the smallest unit of the asset
    pub value: u64,
    /// Asset code (e.g. "USD")
    #[serde(rename = "assetCode")]
    pub asset_code: String,
    /// Asset scale (number of decimal places)
    #[serde(rename = "assetScale")]
    pub asset_scale: u8,
}

impl Amount {
    /// Construct an amount
    pub fn new(value: u64, asset_code: impl Into<String>, asset_scale: u8) -> Self {
        Self {
            value,
            asset_code: asset_code.into(),
            asset_scale,
        }
    }
}

/// Asset database model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetModel {
    /// Asset ID
    pub id: String,
    /// Currency code
    pub code: String,
    /// Scale (decimal places)
    pub scale: u8,
    /// Balance above which a liquidity webhook fires
    pub withdrawal_threshold: Option<u64>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Peer database model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerModel {
    /// Peer ID
    pub id: String,
    /// Asset the peer settles in
    pub asset_id: String,
    /// ILP address prefix used for routing
    pub static_ilp_address: String,
    /// Per-packet amount cap
    pub max_packet_amount: Option<u64>,
    /// Token expected on inbound ILP-over-HTTP requests
    pub http_incoming_token: String,
    /// Token presented on outbound ILP-over-HTTP requests
    pub http_outgoing_token: String,
    /// Peer's ILP-over-HTTP endpoint
    pub http_outgoing_endpoint: String,
    /// Balance below which a liquidity webhook fires
    pub liquidity_threshold: Option<u64>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Wallet address database model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletAddressModel {
    /// Wallet address ID
    pub id: String,
    /// Public payment pointer URL
    pub url: String,
    /// Asset of the wallet address
    pub asset_id: String,
    /// Display name
    pub public_name: Option<String>,
    /// Total previously withdrawn web monetization credits
    pub total_events_amount: u64,
    /// When the withdrawal worker should next look at this address
    pub process_at: Option<DateTime<Utc>>,
    /// Deactivation time; active while unset or in the future
    pub deactivated_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl WalletAddressModel {
    /// Whether the wallet address can be used for new payments
    pub fn is_active(&self) -> bool {
        match self.deactivated_at {
            None => true,
            Some(at) => at > Utc::now(),
        }
    }
}

/// Incoming payment state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncomingPaymentState {
    /// Created, no money received yet
    Pending,
    /// At least one credit received
    Processing,
    /// Target reached or explicitly completed
    Completed,
    /// Timed out before completion
    Expired,
}

impl IncomingPaymentState {
    /// Stable string form stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }

    /// Parse the stored string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Whether the payment can still receive money
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired)
    }
}

/// Incoming payment database model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingPaymentModel {
    /// Payment ID
    pub id: String,
    /// Receiving wallet address
    pub wallet_address_id: String,
    /// Asset of the payment
    pub asset_id: String,
    /// Target amount, if fixed
    pub incoming_amount: Option<u64>,
    /// Total received so far (derived from the ledger)
    pub received_amount: u64,
    /// Current state
    pub state: IncomingPaymentState,
    /// Expiry deadline
    pub expires_at: DateTime<Utc>,
    /// STREAM connection tag; null once terminal
    pub connection_id: Option<String>,
    /// Caller-supplied metadata (JSON)
    pub metadata: Option<serde_json::Value>,
    /// When the expiry/completion worker should look at this payment
    pub process_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Quote database model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteModel {
    /// Quote ID
    pub id: String,
    /// Source wallet address
    pub wallet_address_id: String,
    /// Source asset
    pub asset_id: String,
    /// Receiver URL the quote targets
    pub receiver: String,
    /// Amount debited from the source account
    pub debit_amount: u64,
    /// Amount delivered to the receiver
    pub receive_amount: u64,
    /// Receiver asset code
    pub receive_asset_code: String,
    /// Receiver asset scale
    pub receive_asset_scale: u8,
    /// Per-packet ceiling for the send
    pub max_packet_amount: u64,
    /// Minimum acceptable exchange rate (slippage applied)
    pub min_exchange_rate: f64,
    /// Low end of the estimated exchange rate
    pub low_estimated_exchange_rate: f64,
    /// High end of the estimated exchange rate (exclusive)
    pub high_estimated_exchange_rate: f64,
    /// Fee configuration applied, if any
    pub fee_id: Option<String>,
    /// Quote expiry
    pub expires_at: DateTime<Utc>,
    /// Requesting client identifier
    pub client: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Outgoing payment state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutgoingPaymentState {
    /// Created, waiting for the funding deposit
    Funding,
    /// Funded; the lifecycle worker is sending
    Sending,
    /// All value delivered
    Completed,
    /// Gave up with a terminal error
    Failed,
}

impl OutgoingPaymentState {
    /// Stable string form stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Funding => "funding",
            Self::Sending => "sending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse the stored string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "funding" => Some(Self::Funding),
            "sending" => Some(Self::Sending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Outgoing payment database model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingPaymentModel {
    /// Payment ID (same as the consumed quote's ID)
    pub id: String,
    /// Source wallet address
    pub wallet_address_id: String,
    /// Consumed quote
    pub quote_id: String,
    /// Current state
    pub state: OutgoingPaymentState,
    /// Source amount sent so far
    pub sent_amount: u64,
    /// Pay-step attempts in the current state
    pub state_attempts: u32,
    /// Last error, if any
    pub error: Option<String>,
    /// Outgoing peer selected for the send
    pub peer_id: Option<String>,
    /// Authorization grant this payment counts against
    pub grant_id: Option<String>,
    /// Start of the grant interval the payment was created in
    pub grant_interval_start: Option<DateTime<Utc>>,
    /// End of the grant interval the payment was created in
    pub grant_interval_end: Option<DateTime<Utc>>,
    /// Caller-supplied metadata (JSON)
    pub metadata: Option<serde_json::Value>,
    /// Requesting client identifier
    pub client: Option<String>,
    /// When the lifecycle worker should next pick up this payment
    pub process_at: Option<DateTime<Utc>>,
    /// Worker lease; another worker may claim once expired
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Fee kind: applied when sending from or receiving into an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeType {
    /// Applied to outgoing quotes on the source asset
    Sending,
    /// Applied to incoming value on the destination asset
    Receiving,
}

impl FeeType {
    /// Stable string form stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Receiving => "receiving",
        }
    }

    /// Parse the stored string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(Self::Sending),
            "receiving" => Some(Self::Receiving),
            _ => None,
        }
    }
}

/// Fee configuration database model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeModel {
    /// Fee ID
    pub id: String,
    /// Asset the fee is configured for
    pub asset_id: String,
    /// Sending or receiving
    pub fee_type: FeeType,
    /// Flat component in the asset's smallest unit
    pub fixed: u64,
    /// Variable component in basis points (1/100 of a percent)
    pub basis_points: u32,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Webhook event types emitted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEventType {
    /// An incoming payment was created
    IncomingPaymentCreated,
    /// An incoming payment expired with funds to withdraw
    IncomingPaymentExpired,
    /// An incoming payment completed
    IncomingPaymentCompleted,
    /// An outgoing payment was created and awaits funding
    OutgoingPaymentCreated,
    /// An outgoing payment completed
    OutgoingPaymentCompleted,
    /// An outgoing payment failed
    OutgoingPaymentFailed,
    /// A wallet address accumulated web monetization credits
    WalletAddressWebMonetization,
    /// A request named an unknown wallet address
    WalletAddressNotFound,
}

impl WebhookEventType {
    /// Stable string form stored in the database and sent on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IncomingPaymentCreated => "incoming_payment.created",
            Self::IncomingPaymentExpired => "incoming_payment.expired",
            Self::IncomingPaymentCompleted => "incoming_payment.completed",
            Self::OutgoingPaymentCreated => "outgoing_payment.created",
            Self::OutgoingPaymentCompleted => "outgoing_payment.completed",
            Self::OutgoingPaymentFailed => "outgoing_payment.failed",
            Self::WalletAddressWebMonetization => "wallet_address.web_monetization",
            Self::WalletAddressNotFound => "wallet_address.not_found",
        }
    }

    /// Parse the stored string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incoming_payment.created" => Some(Self::IncomingPaymentCreated),
            "incoming_payment.expired" => Some(Self::IncomingPaymentExpired),
            "incoming_payment.completed" => Some(Self::IncomingPaymentCompleted),
            "outgoing_payment.created" => Some(Self::OutgoingPaymentCreated),
            "outgoing_payment.completed" => Some(Self::OutgoingPaymentCompleted),
            "outgoing_payment.failed" => Some(Self::OutgoingPaymentFailed),
            "wallet_address.web_monetization" => Some(Self::WalletAddressWebMonetization),
            "wallet_address.not_found" => Some(Self::WalletAddressNotFound),
            _ => None,
        }
    }
}

/// Withdrawal attached to a webhook event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWithdrawal {
    /// Ledger account to withdraw from
    pub account_id: String,
    /// Asset of the withdrawal
    pub asset_id: String,
    /// Amount to withdraw
    pub amount: u64,
}

/// Webhook event database model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEventModel {
    /// Event ID
    pub id: String,
    /// Event type
    pub event_type: WebhookEventType,
    /// JSON payload sent to the webhook endpoint
    pub data: serde_json::Value,
    /// Next delivery attempt; null once delivered or given up
    pub process_at: Option<DateTime<Utc>>,
    /// Delivery attempts so far
    pub attempts: u32,
    /// HTTP status of the last attempt
    pub status_code: Option<u16>,
    /// Withdrawal the consumer should execute on receipt
    pub withdrawal: Option<EventWithdrawal>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}
