//! Database module for the payment engine
//!
//! This module handles persistent storage for:
//! - Assets, peers, and wallet addresses
//! - Incoming payments, quotes, and outgoing payments
//! - Webhook events and idempotency keys
//! - The double-entry ledger (accounts and two-phase transfers)

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

mod models;
mod queries;

pub use models::*;
pub use queries::*;

/// Database connection handle
#[derive(Clone)]
pub struct Database {
    /// SQLite connection (wrapped in Arc<Mutex> for thread safety)
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Connect to the database
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!("Connecting to database at {}", database_url);

        let path = if database_url.starts_with("sqlite:") {
            database_url.strip_prefix("sqlite:").unwrap_or(database_url)
        } else {
            database_url
        };

        // Ensure the directory exists for file-based databases
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Self::run_migrations(&conn)?;

        info!("Database connected successfully");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run database migrations
    fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
        debug!("Running database migrations...");

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS assets (
                id TEXT PRIMARY KEY,
                code TEXT NOT NULL,
                scale INTEGER NOT NULL,
                withdrawal_threshold INTEGER,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                UNIQUE (code, scale)
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS peers (
                id TEXT PRIMARY KEY,
                asset_id TEXT NOT NULL REFERENCES assets(id),
                static_ilp_address TEXT NOT NULL,
                max_packet_amount INTEGER,
                http_incoming_token TEXT NOT NULL,
                http_outgoing_token TEXT NOT NULL,
                http_outgoing_endpoint TEXT NOT NULL,
                liquidity_threshold INTEGER,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_addresses (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                asset_id TEXT NOT NULL REFERENCES assets(id),
                public_name TEXT,
                total_events_amount INTEGER NOT NULL DEFAULT 0,
                process_at DATETIME,
                deactivated_at DATETIME,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS incoming_payments (
                id TEXT PRIMARY KEY,
                wallet_address_id TEXT NOT NULL REFERENCES wallet_addresses(id),
                asset_id TEXT NOT NULL REFERENCES assets(id),
                incoming_amount INTEGER,
                received_amount INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                expires_at DATETIME NOT NULL,
                connection_id TEXT,
                metadata TEXT,
                process_at DATETIME,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS quotes (
                id TEXT PRIMARY KEY,
                wallet_address_id TEXT NOT NULL REFERENCES wallet_addresses(id),
                asset_id TEXT NOT NULL REFERENCES assets(id),
                receiver TEXT NOT NULL,
                debit_amount INTEGER NOT NULL,
                receive_amount INTEGER NOT NULL,
                receive_asset_code TEXT NOT NULL,
                receive_asset_scale INTEGER NOT NULL,
                max_packet_amount INTEGER NOT NULL,
                min_exchange_rate REAL NOT NULL,
                low_estimated_exchange_rate REAL NOT NULL,
                high_estimated_exchange_rate REAL NOT NULL,
                fee_id TEXT,
                expires_at DATETIME NOT NULL,
                client TEXT,
                created_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS outgoing_payment_grants (
                id TEXT PRIMARY KEY,
                created_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS outgoing_payments (
                id TEXT PRIMARY KEY,
                wallet_address_id TEXT NOT NULL REFERENCES wallet_addresses(id),
                quote_id TEXT NOT NULL UNIQUE REFERENCES quotes(id),
                state TEXT NOT NULL,
                sent_amount INTEGER NOT NULL DEFAULT 0,
                state_attempts INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                peer_id TEXT,
                grant_id TEXT REFERENCES outgoing_payment_grants(id),
                grant_interval_start DATETIME,
                grant_interval_end DATETIME,
                metadata TEXT,
                client TEXT,
                process_at DATETIME,
                lease_expires_at DATETIME,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS fees (
                id TEXT PRIMARY KEY,
                asset_id TEXT NOT NULL REFERENCES assets(id),
                fee_type TEXT NOT NULL,
                fixed INTEGER NOT NULL DEFAULT 0,
                basis_points INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS webhook_events (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                data TEXT NOT NULL,
                process_at DATETIME,
                attempts INTEGER NOT NULL DEFAULT 0,
                status_code INTEGER,
                withdrawal_account_id TEXT,
                withdrawal_asset_id TEXT,
                withdrawal_amount INTEGER,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS idempotency_keys (
                operation TEXT NOT NULL,
                key TEXT NOT NULL,
                result TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                PRIMARY KEY (operation, key)
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_accounts (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                asset_id TEXT NOT NULL,
                debits_pending INTEGER NOT NULL DEFAULT 0,
                debits_posted INTEGER NOT NULL DEFAULT 0,
                credits_pending INTEGER NOT NULL DEFAULT 0,
                credits_posted INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_transfers (
                id TEXT PRIMARY KEY,
                debit_account_id TEXT NOT NULL REFERENCES ledger_accounts(id),
                credit_account_id TEXT NOT NULL REFERENCES ledger_accounts(id),
                amount INTEGER NOT NULL,
                state TEXT NOT NULL,
                expires_at DATETIME,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        // Indexes for worker scans and routing lookups
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_incoming_payments_state ON incoming_payments(state, expires_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_incoming_payments_wallet ON incoming_payments(wallet_address_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_outgoing_payments_process_at ON outgoing_payments(state, process_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_outgoing_payments_grant ON outgoing_payments(grant_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_webhook_events_process_at ON webhook_events(process_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_wallet_addresses_process_at ON wallet_addresses(process_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_peers_static_ilp_address ON peers(static_ilp_address)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_ledger_transfers_state ON ledger_transfers(state, expires_at)",
            [],
        )?;

        debug!("Database migrations completed");
        Ok(())
    }

    /// Get the database connection
    pub fn conn(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Close the database connection
    pub async fn close(&self) {
        info!("Closing database connection...");
        // The connection will be closed when the Arc is dropped
        info!("Database connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_connect() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let conn_lock = db.conn();
        let conn = conn_lock.lock().await;
        let count: i64 = conn.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let conn_lock = db.conn();
        let conn = conn_lock.lock().await;
        for table in [
            "assets",
            "peers",
            "wallet_addresses",
            "incoming_payments",
            "quotes",
            "outgoing_payments",
            "outgoing_payment_grants",
            "fees",
            "webhook_events",
            "idempotency_keys",
            "ledger_accounts",
            "ledger_transfers",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {}", table);
        }
    }
}
