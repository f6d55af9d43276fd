//! Configuration management for the payment engine
//!
//! Configuration is loaded from TOML files and environment variables.
//!
//! # Example Configuration File
//!
//! ```toml
//! [node]
//! ilp_address = "test.engine"
//! open_payments_url = "https://op.example.com"
//! wallet_address_url = "https://op.example.com/.well-known/pay"
//! auth_server_grant_url = "https://auth.example.com"
//!
//! [stream]
//! secret = "6a3b...32 bytes of hex..."
//!
//! [rates]
//! exchange_rates_url = "https://rates.example.com/prices"
//! exchange_rates_lifetime_ms = 15000
//!
//! [quotes]
//! quote_lifespan_ms = 300000
//! slippage = 0.01
//!
//! [webhooks]
//! webhook_url = "https://wallet.example.com/webhooks"
//!
//! [api]
//! bind_address = "0.0.0.0:3001"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identity and Open Payments endpoints
    #[serde(default)]
    pub node: NodeConfig,

    /// STREAM receiver configuration
    #[serde(default)]
    pub stream: StreamConfig,

    /// Exchange rate lookup configuration
    #[serde(default)]
    pub rates: RatesConfig,

    /// Quote engine configuration
    #[serde(default)]
    pub quotes: QuoteConfig,

    /// Packet pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Webhook delivery configuration
    #[serde(default)]
    pub webhooks: WebhookConfig,

    /// Background worker configuration
    #[serde(default)]
    pub workers: WorkerConfig,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            stream: StreamConfig::default(),
            rates: RatesConfig::default(),
            quotes: QuoteConfig::default(),
            pipeline: PipelineConfig::default(),
            webhooks: WebhookConfig::default(),
            workers: WorkerConfig::default(),
            api: ApiConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

/// Node identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// ILP address prefix under which local accounts are addressable
    #[serde(default = "default_ilp_address")]
    pub ilp_address: String,

    /// Base URL for the local Open Payments resource server
    #[serde(default = "default_open_payments_url")]
    pub open_payments_url: String,

    /// Base URL under which wallet addresses are served
    #[serde(default = "default_open_payments_url")]
    pub wallet_address_url: String,

    /// Grant endpoint of the external authorization server
    #[serde(default = "default_auth_server_url")]
    pub auth_server_grant_url: String,

    /// Key id presented on signed outgoing Open Payments calls
    #[serde(default)]
    pub key_id: String,

    /// Private key material for outgoing call signatures (PEM or raw hex)
    #[serde(default)]
    pub private_key: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ilp_address: default_ilp_address(),
            open_payments_url: default_open_payments_url(),
            wallet_address_url: default_open_payments_url(),
            auth_server_grant_url: default_auth_server_url(),
            key_id: String::new(),
            private_key: String::new(),
        }
    }
}

fn default_ilp_address() -> String {
    "test.engine".to_string()
}

fn default_open_payments_url() -> String {
    "http://127.0.0.1:3001".to_string()
}

fn default_auth_server_url() -> String {
    "http://127.0.0.1:3006".to_string()
}

/// STREAM receiver configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    /// 32-byte server secret, hex encoded. Shared secrets and connection
    /// addresses are derived from it. Generated at startup when empty.
    #[serde(default)]
    pub secret: String,
}

impl StreamConfig {
    /// Decode the configured secret, or generate a fresh one
    pub fn secret_bytes(&self) -> anyhow::Result<[u8; 32]> {
        if self.secret.is_empty() {
            let mut secret = [0u8; 32];
            rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut secret);
            return Ok(secret);
        }
        let bytes = hex::decode(&self.secret)
            .map_err(|e| anyhow::anyhow!("stream secret is not valid hex: {}", e))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("stream secret must be exactly 32 bytes"))?;
        Ok(bytes)
    }
}

/// Exchange rate lookup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatesConfig {
    /// URL of the external rates service
    #[serde(default = "default_rates_url")]
    pub exchange_rates_url: String,

    /// How long a fetched rate set stays fresh (milliseconds)
    #[serde(default = "default_rates_lifetime_ms")]
    pub exchange_rates_lifetime_ms: u64,
}

impl Default for RatesConfig {
    fn default() -> Self {
        Self {
            exchange_rates_url: default_rates_url(),
            exchange_rates_lifetime_ms: default_rates_lifetime_ms(),
        }
    }
}

fn default_rates_url() -> String {
    "http://127.0.0.1:3010/prices".to_string()
}

fn default_rates_lifetime_ms() -> u64 {
    15_000
}

/// Quote engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteConfig {
    /// How long a quote may be used after creation (milliseconds)
    #[serde(default = "default_quote_lifespan_ms")]
    pub quote_lifespan_ms: u64,

    /// Tolerated exchange rate slippage, 0..1
    #[serde(default = "default_slippage")]
    pub slippage: f64,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            quote_lifespan_ms: default_quote_lifespan_ms(),
            slippage: default_slippage(),
        }
    }
}

fn default_quote_lifespan_ms() -> u64 {
    5 * 60 * 1000
}

fn default_slippage() -> f64 {
    0.01
}

/// Packet pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Longest hold we keep a packet open toward a peer (milliseconds)
    #[serde(default = "default_max_hold_ms")]
    pub max_hold_ms: u64,

    /// Incoming packets per second per peer
    #[serde(default = "default_packets_per_second")]
    pub incoming_packets_per_second: u64,

    /// Incoming amount per second per peer
    #[serde(default = "default_amount_per_second")]
    pub incoming_amount_per_second: u64,

    /// Outgoing amount per second per peer
    #[serde(default = "default_amount_per_second")]
    pub outgoing_amount_per_second: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_hold_ms: default_max_hold_ms(),
            incoming_packets_per_second: default_packets_per_second(),
            incoming_amount_per_second: default_amount_per_second(),
            outgoing_amount_per_second: default_amount_per_second(),
        }
    }
}

fn default_max_hold_ms() -> u64 {
    30_000
}

fn default_packets_per_second() -> u64 {
    1_000
}

fn default_amount_per_second() -> u64 {
    1_000_000_000_000
}

/// Webhook delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Endpoint that receives event POSTs
    #[serde(default = "default_webhook_url")]
    pub webhook_url: String,

    /// Per-attempt HTTP timeout (milliseconds)
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum delivery attempts before the event is parked
    #[serde(default = "default_webhook_max_attempts")]
    pub max_attempts: u32,

    /// Base of the exponential retry backoff (seconds)
    #[serde(default = "default_webhook_backoff_secs")]
    pub retry_backoff_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            webhook_url: default_webhook_url(),
            timeout_ms: default_webhook_timeout_ms(),
            max_attempts: default_webhook_max_attempts(),
            retry_backoff_secs: default_webhook_backoff_secs(),
        }
    }
}

fn default_webhook_url() -> String {
    "http://127.0.0.1:3011/webhooks".to_string()
}

fn default_webhook_timeout_ms() -> u64 {
    10_000
}

fn default_webhook_max_attempts() -> u32 {
    10
}

fn default_webhook_backoff_secs() -> u64 {
    10
}

/// Background worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Poll interval for the outgoing payment worker (milliseconds)
    #[serde(default = "default_worker_poll_ms")]
    pub outgoing_poll_ms: u64,

    /// Poll interval for the incoming payment expiry worker (milliseconds)
    #[serde(default = "default_worker_poll_ms")]
    pub incoming_poll_ms: u64,

    /// Poll interval for the wallet address worker (milliseconds)
    #[serde(default = "default_worker_poll_ms")]
    pub wallet_address_poll_ms: u64,

    /// Poll interval for the webhook worker (milliseconds)
    #[serde(default = "default_worker_poll_ms")]
    pub webhook_poll_ms: u64,

    /// Base of the pay-step retry backoff (seconds)
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// Pay-step attempts before an outgoing payment fails permanently
    #[serde(default = "default_max_state_attempts")]
    pub max_state_attempts: u32,

    /// Delay before a wallet address withdrawal event is emitted (milliseconds)
    #[serde(default = "default_withdrawal_throttle_ms")]
    pub withdrawal_throttle_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            outgoing_poll_ms: default_worker_poll_ms(),
            incoming_poll_ms: default_worker_poll_ms(),
            wallet_address_poll_ms: default_worker_poll_ms(),
            webhook_poll_ms: default_worker_poll_ms(),
            retry_backoff_secs: default_retry_backoff_secs(),
            max_state_attempts: default_max_state_attempts(),
            withdrawal_throttle_delay_ms: default_withdrawal_throttle_ms(),
        }
    }
}

fn default_worker_poll_ms() -> u64 {
    1_000
}

fn default_retry_backoff_secs() -> u64 {
    10
}

fn default_max_state_attempts() -> u32 {
    5
}

fn default_withdrawal_throttle_ms() -> u64 {
    60_000
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Bind address for the HTTP server
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Enable permissive CORS
    #[serde(default)]
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            enable_cors: false,
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:3001".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (sqlite path or `sqlite::memory:`)
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Data directory used when the URL is relative
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:ilp-engine.db".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("ilp-engine"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

impl Config {
    /// Validate the configuration before startup
    pub fn validate(&self) -> Result<(), String> {
        if self.node.ilp_address.is_empty() {
            return Err("node.ilp_address must not be empty".to_string());
        }
        if self
            .node
            .ilp_address
            .split('.')
            .any(|segment| segment.is_empty())
        {
            return Err(format!(
                "node.ilp_address '{}' contains an empty segment",
                self.node.ilp_address
            ));
        }
        if !(0.0..1.0).contains(&self.quotes.slippage) {
            return Err(format!(
                "quotes.slippage {} must be in [0, 1)",
                self.quotes.slippage
            ));
        }
        if !self.stream.secret.is_empty() {
            self.stream.secret_bytes().map_err(|e| e.to_string())?;
        }
        if self.api.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!(
                "api.bind_address '{}' is not a valid socket address",
                self.api.bind_address
            ));
        }
        Ok(())
    }

    /// Resolve the database URL, anchoring relative sqlite paths in data_dir
    pub fn resolve_database_url(&self) -> String {
        let url = &self.database.url;
        if url == "sqlite::memory:" {
            return url.clone();
        }
        let path = url.strip_prefix("sqlite:").unwrap_or(url);
        if std::path::Path::new(path).is_absolute() {
            format!("sqlite:{}", path)
        } else {
            format!("sqlite:{}", self.database.data_dir.join(path).display())
        }
    }

    /// Quote lifespan as a chrono duration
    pub fn quote_lifespan(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.quotes.quote_lifespan_ms as i64)
    }

    /// Withdrawal throttle delay as a chrono duration
    pub fn withdrawal_throttle_delay(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.workers.withdrawal_throttle_delay_ms as i64)
    }
}
