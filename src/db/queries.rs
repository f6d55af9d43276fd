//! Database queries
//!
//! One query struct per entity, borrowing the shared connection. State
//! machine transitions are guarded UPDATEs: the WHERE clause names the
//! states the transition is legal from and the caller inspects the changed
//! row count.

use super::{
    AssetModel, Database, EventWithdrawal, FeeModel, FeeType, IncomingPaymentModel,
    IncomingPaymentState, OutgoingPaymentModel, OutgoingPaymentState, PeerModel, QuoteModel,
    WalletAddressModel, WebhookEventModel, WebhookEventType,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

fn map_asset(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssetModel> {
    Ok(AssetModel {
        id: row.get(0)?,
        code: row.get(1)?,
        scale: row.get::<_, i64>(2)? as u8,
        withdrawal_threshold: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

const ASSET_COLUMNS: &str = "id, code, scale, withdrawal_threshold, created_at, updated_at";

/// Asset queries
pub struct AssetQueries<'a> {
    db: &'a Database,
}

impl<'a> AssetQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new asset. Fails on a duplicate (code, scale) pair.
    pub async fn insert(&self, asset: &AssetModel) -> Result<()> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO assets (id, code, scale, withdrawal_threshold, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            rusqlite::params![
                &asset.id,
                &asset.code,
                asset.scale as i64,
                asset.withdrawal_threshold.map(|v| v as i64),
                asset.created_at,
                asset.updated_at,
            ],
        )?;
        info!(
            "DB: Created asset: id={}, code={}, scale={}",
            asset.id, asset.code, asset.scale
        );
        Ok(())
    }

    /// Get an asset by ID
    pub async fn get_by_id(&self, id: &str) -> Result<Option<AssetModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM assets WHERE id = ?1", ASSET_COLUMNS),
                [id],
                map_asset,
            )
            .optional()?;
        Ok(result)
    }

    /// Get an asset by (code, scale)
    pub async fn get_by_code_and_scale(&self, code: &str, scale: u8) -> Result<Option<AssetModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM assets WHERE code = ?1 AND scale = ?2",
                    ASSET_COLUMNS
                ),
                rusqlite::params![code, scale as i64],
                map_asset,
            )
            .optional()?;
        Ok(result)
    }

    /// Update the withdrawal threshold (the only mutable column)
    pub async fn update_withdrawal_threshold(
        &self,
        id: &str,
        threshold: Option<u64>,
    ) -> Result<bool> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let changed = conn.execute(
            "UPDATE assets SET withdrawal_threshold = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![threshold.map(|v| v as i64), Utc::now(), id],
        )?;
        Ok(changed > 0)
    }

    /// List all assets
    pub async fn list(&self) -> Result<Vec<AssetModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM assets ORDER BY created_at",
            ASSET_COLUMNS
        ))?;
        let rows = stmt.query_map([], map_asset)?;
        let mut assets = Vec::new();
        for row in rows {
            assets.push(row?);
        }
        Ok(assets)
    }
}

fn map_peer(row: &rusqlite::Row<'_>) -> rusqlite::Result<PeerModel> {
    Ok(PeerModel {
        id: row.get(0)?,
        asset_id: row.get(1)?,
        static_ilp_address: row.get(2)?,
        max_packet_amount: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
        http_incoming_token: row.get(4)?,
        http_outgoing_token: row.get(5)?,
        http_outgoing_endpoint: row.get(6)?,
        liquidity_threshold: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const PEER_COLUMNS: &str = "id, asset_id, static_ilp_address, max_packet_amount, \
     http_incoming_token, http_outgoing_token, http_outgoing_endpoint, liquidity_threshold, \
     created_at, updated_at";

/// Peer queries
pub struct PeerQueries<'a> {
    db: &'a Database,
}

impl<'a> PeerQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new peer
    pub async fn insert(&self, peer: &PeerModel) -> Result<()> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO peers (id, asset_id, static_ilp_address, max_packet_amount,
                http_incoming_token, http_outgoing_token, http_outgoing_endpoint,
                liquidity_threshold, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            rusqlite::params![
                &peer.id,
                &peer.asset_id,
                &peer.static_ilp_address,
                peer.max_packet_amount.map(|v| v as i64),
                &peer.http_incoming_token,
                &peer.http_outgoing_token,
                &peer.http_outgoing_endpoint,
                peer.liquidity_threshold.map(|v| v as i64),
                peer.created_at,
                peer.updated_at,
            ],
        )?;
        info!(
            "DB: Created peer: id={}, ilp_address={}",
            peer.id, peer.static_ilp_address
        );
        Ok(())
    }

    /// Get a peer by ID
    pub async fn get_by_id(&self, id: &str) -> Result<Option<PeerModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM peers WHERE id = ?1", PEER_COLUMNS),
                [id],
                map_peer,
            )
            .optional()?;
        Ok(result)
    }

    /// Look up the peer authenticated by an inbound ILP-over-HTTP token
    pub async fn get_by_incoming_token(&self, token: &str) -> Result<Option<PeerModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM peers WHERE http_incoming_token = ?1",
                    PEER_COLUMNS
                ),
                [token],
                map_peer,
            )
            .optional()?;
        Ok(result)
    }

    /// Find the peer whose static ILP address is the longest prefix of the
    /// destination address.
    pub async fn find_by_destination(&self, destination: &str) -> Result<Option<PeerModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM peers \
                     WHERE ?1 = static_ilp_address OR ?1 LIKE static_ilp_address || '.%' \
                     ORDER BY LENGTH(static_ilp_address) DESC LIMIT 1",
                    PEER_COLUMNS
                ),
                [destination],
                map_peer,
            )
            .optional()?;
        Ok(result)
    }

    /// Update mutable peer columns
    pub async fn update(&self, peer: &PeerModel) -> Result<bool> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let changed = conn.execute(
            r#"
            UPDATE peers
            SET static_ilp_address = ?1, max_packet_amount = ?2, http_incoming_token = ?3,
                http_outgoing_token = ?4, http_outgoing_endpoint = ?5, liquidity_threshold = ?6,
                updated_at = ?7
            WHERE id = ?8
            "#,
            rusqlite::params![
                &peer.static_ilp_address,
                peer.max_packet_amount.map(|v| v as i64),
                &peer.http_incoming_token,
                &peer.http_outgoing_token,
                &peer.http_outgoing_endpoint,
                peer.liquidity_threshold.map(|v| v as i64),
                Utc::now(),
                &peer.id,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Delete a peer
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let changed = conn.execute("DELETE FROM peers WHERE id = ?1", [id])?;
        if changed > 0 {
            info!("DB: Deleted peer: id={}", id);
        }
        Ok(changed > 0)
    }

    /// List all peers
    pub async fn list(&self) -> Result<Vec<PeerModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM peers ORDER BY created_at",
            PEER_COLUMNS
        ))?;
        let rows = stmt.query_map([], map_peer)?;
        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }
}

fn map_wallet_address(row: &rusqlite::Row<'_>) -> rusqlite::Result<WalletAddressModel> {
    Ok(WalletAddressModel {
        id: row.get(0)?,
        url: row.get(1)?,
        asset_id: row.get(2)?,
        public_name: row.get(3)?,
        total_events_amount: row.get::<_, i64>(4)? as u64,
        process_at: row.get(5)?,
        deactivated_at: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const WALLET_ADDRESS_COLUMNS: &str = "id, url, asset_id, public_name, total_events_amount, \
     process_at, deactivated_at, created_at, updated_at";

/// Wallet address queries
pub struct WalletAddressQueries<'a> {
    db: &'a Database,
}

impl<'a> WalletAddressQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new wallet address
    pub async fn insert(&self, wallet: &WalletAddressModel) -> Result<()> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO wallet_addresses (id, url, asset_id, public_name, total_events_amount,
                process_at, deactivated_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            rusqlite::params![
                &wallet.id,
                &wallet.url,
                &wallet.asset_id,
                wallet.public_name.as_deref(),
                wallet.total_events_amount as i64,
                wallet.process_at,
                wallet.deactivated_at,
                wallet.created_at,
                wallet.updated_at,
            ],
        )?;
        info!("DB: Created wallet address: id={}, url={}", wallet.id, wallet.url);
        Ok(())
    }

    /// Get a wallet address by ID
    pub async fn get_by_id(&self, id: &str) -> Result<Option<WalletAddressModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM wallet_addresses WHERE id = ?1",
                    WALLET_ADDRESS_COLUMNS
                ),
                [id],
                map_wallet_address,
            )
            .optional()?;
        Ok(result)
    }

    /// Get a wallet address by exact URL
    pub async fn get_by_url(&self, url: &str) -> Result<Option<WalletAddressModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM wallet_addresses WHERE url = ?1",
                    WALLET_ADDRESS_COLUMNS
                ),
                [url],
                map_wallet_address,
            )
            .optional()?;
        Ok(result)
    }

    /// Find the wallet address whose URL prefixes the given resource URL
    pub async fn find_by_url_prefix(&self, url: &str) -> Result<Option<WalletAddressModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM wallet_addresses \
                     WHERE ?1 = url OR ?1 LIKE url || '/%' \
                     ORDER BY LENGTH(url) DESC LIMIT 1",
                    WALLET_ADDRESS_COLUMNS
                ),
                [url],
                map_wallet_address,
            )
            .optional()?;
        Ok(result)
    }

    /// Update public name and deactivation time
    pub async fn update(
        &self,
        id: &str,
        public_name: Option<&str>,
        deactivated_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let changed = conn.execute(
            "UPDATE wallet_addresses SET public_name = ?1, deactivated_at = ?2, updated_at = ?3 \
             WHERE id = ?4",
            rusqlite::params![public_name, deactivated_at, Utc::now(), id],
        )?;
        Ok(changed > 0)
    }

    /// Schedule (or clear) the withdrawal worker visit
    pub async fn set_process_at(&self, id: &str, process_at: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE wallet_addresses SET process_at = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![process_at, Utc::now(), id],
        )?;
        Ok(())
    }

    /// Schedule the withdrawal worker visit only if none is pending yet
    pub async fn schedule_process_at_if_unset(
        &self,
        id: &str,
        process_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE wallet_addresses SET process_at = ?1, updated_at = ?2 \
             WHERE id = ?3 AND process_at IS NULL",
            rusqlite::params![process_at, Utc::now(), id],
        )?;
        Ok(())
    }

    /// Advance the withdrawn-credits accumulator and clear the schedule
    pub async fn advance_total_events_amount(&self, id: &str, delta: u64) -> Result<()> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE wallet_addresses \
             SET total_events_amount = total_events_amount + ?1, process_at = NULL, updated_at = ?2 \
             WHERE id = ?3",
            rusqlite::params![delta as i64, Utc::now(), id],
        )?;
        Ok(())
    }

    /// List wallet addresses due for the withdrawal worker
    pub async fn list_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<WalletAddressModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM wallet_addresses \
             WHERE process_at IS NOT NULL AND process_at <= ?1 \
             ORDER BY process_at LIMIT ?2",
            WALLET_ADDRESS_COLUMNS
        ))?;
        let rows = stmt.query_map(rusqlite::params![now, limit as i64], map_wallet_address)?;
        let mut wallets = Vec::new();
        for row in rows {
            wallets.push(row?);
        }
        Ok(wallets)
    }
}

fn map_incoming_payment(row: &rusqlite::Row<'_>) -> rusqlite::Result<IncomingPaymentModel> {
    let state: String = row.get(5)?;
    let metadata: Option<String> = row.get(8)?;
    Ok(IncomingPaymentModel {
        id: row.get(0)?,
        wallet_address_id: row.get(1)?,
        asset_id: row.get(2)?,
        incoming_amount: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
        received_amount: row.get::<_, i64>(4)? as u64,
        state: IncomingPaymentState::parse(&state).unwrap_or(IncomingPaymentState::Pending),
        expires_at: row.get(6)?,
        connection_id: row.get(7)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        process_at: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

const INCOMING_PAYMENT_COLUMNS: &str = "id, wallet_address_id, asset_id, incoming_amount, \
     received_amount, state, expires_at, connection_id, metadata, process_at, created_at, \
     updated_at";

/// Incoming payment queries
pub struct IncomingPaymentQueries<'a> {
    db: &'a Database,
}

impl<'a> IncomingPaymentQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a payment row inside an open transaction
    pub fn insert_tx(conn: &Connection, payment: &IncomingPaymentModel) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO incoming_payments (id, wallet_address_id, asset_id, incoming_amount,
                received_amount, state, expires_at, connection_id, metadata, process_at,
                created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            rusqlite::params![
                &payment.id,
                &payment.wallet_address_id,
                &payment.asset_id,
                payment.incoming_amount.map(|v| v as i64),
                payment.received_amount as i64,
                payment.state.as_str(),
                payment.expires_at,
                payment.connection_id.as_deref(),
                payment
                    .metadata
                    .as_ref()
                    .map(|m| serde_json::to_string(m).unwrap_or_default()),
                payment.process_at,
                payment.created_at,
                payment.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Get a payment by ID
    pub async fn get_by_id(&self, id: &str) -> Result<Option<IncomingPaymentModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM incoming_payments WHERE id = ?1",
                    INCOMING_PAYMENT_COLUMNS
                ),
                [id],
                map_incoming_payment,
            )
            .optional()?;
        Ok(result)
    }

    /// Get a payment by its STREAM connection tag
    pub async fn get_by_connection_id(
        &self,
        connection_id: &str,
    ) -> Result<Option<IncomingPaymentModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM incoming_payments WHERE connection_id = ?1",
                    INCOMING_PAYMENT_COLUMNS
                ),
                [connection_id],
                map_incoming_payment,
            )
            .optional()?;
        Ok(result)
    }

    /// List payments for a wallet address, newest first
    pub async fn list_by_wallet(&self, wallet_address_id: &str) -> Result<Vec<IncomingPaymentModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM incoming_payments WHERE wallet_address_id = ?1 \
             ORDER BY created_at DESC",
            INCOMING_PAYMENT_COLUMNS
        ))?;
        let rows = stmt.query_map([wallet_address_id], map_incoming_payment)?;
        let mut payments = Vec::new();
        for row in rows {
            payments.push(row?);
        }
        Ok(payments)
    }

    /// Record a credit: bump received_amount and move Pending to Processing
    pub async fn record_credit(&self, id: &str, received_amount: u64) -> Result<bool> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let changed = conn.execute(
            "UPDATE incoming_payments \
             SET received_amount = ?1, \
                 state = CASE WHEN state = 'pending' THEN 'processing' ELSE state END, \
                 updated_at = ?2 \
             WHERE id = ?3 AND state IN ('pending', 'processing')",
            rusqlite::params![received_amount as i64, Utc::now(), id],
        )?;
        Ok(changed > 0)
    }

    /// Guarded state transition; nulls the connection tag on terminal states
    pub async fn transition(
        &self,
        id: &str,
        from: &[IncomingPaymentState],
        to: IncomingPaymentState,
        process_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        Self::transition_tx(&conn, id, from, to, process_at)
    }

    /// Guarded state transition inside an open transaction
    pub fn transition_tx(
        conn: &Connection,
        id: &str,
        from: &[IncomingPaymentState],
        to: IncomingPaymentState,
        process_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let from_list = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let clear_connection = if to.is_terminal() {
            ", connection_id = NULL"
        } else {
            ""
        };
        let changed = conn.execute(
            &format!(
                "UPDATE incoming_payments \
                 SET state = ?1, process_at = ?2, updated_at = ?3{} \
                 WHERE id = ?4 AND state IN ({})",
                clear_connection, from_list
            ),
            rusqlite::params![to.as_str(), process_at, Utc::now(), id],
        )?;
        Ok(changed > 0)
    }

    /// List payments due for expiry processing
    pub async fn list_due_expiry(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<IncomingPaymentModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM incoming_payments \
             WHERE state IN ('pending', 'processing') AND expires_at <= ?1 \
             ORDER BY expires_at LIMIT ?2",
            INCOMING_PAYMENT_COLUMNS
        ))?;
        let rows = stmt.query_map(rusqlite::params![now, limit as i64], map_incoming_payment)?;
        let mut payments = Vec::new();
        for row in rows {
            payments.push(row?);
        }
        Ok(payments)
    }
}

fn map_quote(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuoteModel> {
    Ok(QuoteModel {
        id: row.get(0)?,
        wallet_address_id: row.get(1)?,
        asset_id: row.get(2)?,
        receiver: row.get(3)?,
        debit_amount: row.get::<_, i64>(4)? as u64,
        receive_amount: row.get::<_, i64>(5)? as u64,
        receive_asset_code: row.get(6)?,
        receive_asset_scale: row.get::<_, i64>(7)? as u8,
        max_packet_amount: row.get::<_, i64>(8)? as u64,
        min_exchange_rate: row.get(9)?,
        low_estimated_exchange_rate: row.get(10)?,
        high_estimated_exchange_rate: row.get(11)?,
        fee_id: row.get(12)?,
        expires_at: row.get(13)?,
        client: row.get(14)?,
        created_at: row.get(15)?,
    })
}

const QUOTE_COLUMNS: &str = "id, wallet_address_id, asset_id, receiver, debit_amount, \
     receive_amount, receive_asset_code, receive_asset_scale, max_packet_amount, \
     min_exchange_rate, low_estimated_exchange_rate, high_estimated_exchange_rate, fee_id, \
     expires_at, client, created_at";

/// Quote queries
pub struct QuoteQueries<'a> {
    db: &'a Database,
}

impl<'a> QuoteQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new quote
    pub async fn insert(&self, quote: &QuoteModel) -> Result<()> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO quotes (id, wallet_address_id, asset_id, receiver, debit_amount,
                receive_amount, receive_asset_code, receive_asset_scale, max_packet_amount,
                min_exchange_rate, low_estimated_exchange_rate, high_estimated_exchange_rate,
                fee_id, expires_at, client, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
            rusqlite::params![
                &quote.id,
                &quote.wallet_address_id,
                &quote.asset_id,
                &quote.receiver,
                quote.debit_amount as i64,
                quote.receive_amount as i64,
                &quote.receive_asset_code,
                quote.receive_asset_scale as i64,
                quote.max_packet_amount as i64,
                quote.min_exchange_rate,
                quote.low_estimated_exchange_rate,
                quote.high_estimated_exchange_rate,
                quote.fee_id.as_deref(),
                quote.expires_at,
                quote.client.as_deref(),
                quote.created_at,
            ],
        )?;
        info!(
            "DB: Created quote: id={}, debit={}, receive={}",
            quote.id, quote.debit_amount, quote.receive_amount
        );
        Ok(())
    }

    /// Get a quote by ID
    pub async fn get_by_id(&self, id: &str) -> Result<Option<QuoteModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM quotes WHERE id = ?1", QUOTE_COLUMNS),
                [id],
                map_quote,
            )
            .optional()?;
        Ok(result)
    }

    /// Get a quote by ID inside an open transaction
    pub fn get_by_id_tx(conn: &Connection, id: &str) -> Result<Option<QuoteModel>> {
        let result = conn
            .query_row(
                &format!("SELECT {} FROM quotes WHERE id = ?1", QUOTE_COLUMNS),
                [id],
                map_quote,
            )
            .optional()?;
        Ok(result)
    }

    /// List quotes for a wallet address, newest first
    pub async fn list_by_wallet(&self, wallet_address_id: &str) -> Result<Vec<QuoteModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM quotes WHERE wallet_address_id = ?1 ORDER BY created_at DESC",
            QUOTE_COLUMNS
        ))?;
        let rows = stmt.query_map([wallet_address_id], map_quote)?;
        let mut quotes = Vec::new();
        for row in rows {
            quotes.push(row?);
        }
        Ok(quotes)
    }
}

fn map_outgoing_payment(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutgoingPaymentModel> {
    let state: String = row.get(3)?;
    let metadata: Option<String> = row.get(11)?;
    Ok(OutgoingPaymentModel {
        id: row.get(0)?,
        wallet_address_id: row.get(1)?,
        quote_id: row.get(2)?,
        state: OutgoingPaymentState::parse(&state).unwrap_or(OutgoingPaymentState::Funding),
        sent_amount: row.get::<_, i64>(4)? as u64,
        state_attempts: row.get::<_, i64>(5)? as u32,
        error: row.get(6)?,
        peer_id: row.get(7)?,
        grant_id: row.get(8)?,
        grant_interval_start: row.get(9)?,
        grant_interval_end: row.get(10)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        client: row.get(12)?,
        process_at: row.get(13)?,
        lease_expires_at: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

const OUTGOING_PAYMENT_COLUMNS: &str = "id, wallet_address_id, quote_id, state, sent_amount, \
     state_attempts, error, peer_id, grant_id, grant_interval_start, grant_interval_end, \
     metadata, client, process_at, lease_expires_at, created_at, updated_at";

/// A prior payment's contribution to its grant budget
#[derive(Debug, Clone)]
pub struct GrantContribution {
    /// Payment state
    pub state: OutgoingPaymentState,
    /// Quoted debit amount
    pub debit_amount: u64,
    /// Quoted receive amount
    pub receive_amount: u64,
    /// Actual source amount sent
    pub sent_amount: u64,
}

/// Outgoing payment queries
pub struct OutgoingPaymentQueries<'a> {
    db: &'a Database,
}

impl<'a> OutgoingPaymentQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a payment row inside an open transaction
    pub fn insert_tx(conn: &Connection, payment: &OutgoingPaymentModel) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO outgoing_payments (id, wallet_address_id, quote_id, state, sent_amount,
                state_attempts, error, peer_id, grant_id, grant_interval_start,
                grant_interval_end, metadata, client, process_at, lease_expires_at,
                created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
            rusqlite::params![
                &payment.id,
                &payment.wallet_address_id,
                &payment.quote_id,
                payment.state.as_str(),
                payment.sent_amount as i64,
                payment.state_attempts as i64,
                payment.error.as_deref(),
                payment.peer_id.as_deref(),
                payment.grant_id.as_deref(),
                payment.grant_interval_start,
                payment.grant_interval_end,
                payment
                    .metadata
                    .as_ref()
                    .map(|m| serde_json::to_string(m).unwrap_or_default()),
                payment.client.as_deref(),
                payment.process_at,
                payment.lease_expires_at,
                payment.created_at,
                payment.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Get a payment by ID
    pub async fn get_by_id(&self, id: &str) -> Result<Option<OutgoingPaymentModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM outgoing_payments WHERE id = ?1",
                    OUTGOING_PAYMENT_COLUMNS
                ),
                [id],
                map_outgoing_payment,
            )
            .optional()?;
        Ok(result)
    }

    /// Whether a quote has already been consumed by a payment
    pub fn quote_consumed_tx(conn: &Connection, quote_id: &str) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outgoing_payments WHERE quote_id = ?1",
            [quote_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// List payments for a wallet address, newest first
    pub async fn list_by_wallet(&self, wallet_address_id: &str) -> Result<Vec<OutgoingPaymentModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM outgoing_payments WHERE wallet_address_id = ?1 \
             ORDER BY created_at DESC",
            OUTGOING_PAYMENT_COLUMNS
        ))?;
        let rows = stmt.query_map([wallet_address_id], map_outgoing_payment)?;
        let mut payments = Vec::new();
        for row in rows {
            payments.push(row?);
        }
        Ok(payments)
    }

    /// Contributions of prior payments on the same grant within an interval
    pub fn grant_contributions_tx(
        conn: &Connection,
        grant_id: &str,
        interval_start: Option<DateTime<Utc>>,
    ) -> Result<Vec<GrantContribution>> {
        let mut stmt = conn.prepare(
            "SELECT p.state, q.debit_amount, q.receive_amount, p.sent_amount \
             FROM outgoing_payments p JOIN quotes q ON q.id = p.quote_id \
             WHERE p.grant_id = ?1 \
               AND (?2 IS NULL OR p.created_at >= ?2)",
        )?;
        let rows = stmt.query_map(rusqlite::params![grant_id, interval_start], |row| {
            let state: String = row.get(0)?;
            Ok(GrantContribution {
                state: OutgoingPaymentState::parse(&state).unwrap_or(OutgoingPaymentState::Funding),
                debit_amount: row.get::<_, i64>(1)? as u64,
                receive_amount: row.get::<_, i64>(2)? as u64,
                sent_amount: row.get::<_, i64>(3)? as u64,
            })
        })?;
        let mut contributions = Vec::new();
        for row in rows {
            contributions.push(row?);
        }
        Ok(contributions)
    }

    /// Funding -> Sending transition inside an open transaction
    pub fn fund_tx(conn: &Connection, id: &str) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE outgoing_payments \
             SET state = 'sending', process_at = ?1, updated_at = ?1 \
             WHERE id = ?2 AND state = 'funding'",
            rusqlite::params![Utc::now(), id],
        )?;
        Ok(changed > 0)
    }

    /// Claim one due payment for a pay step. The lease keeps other workers
    /// off the payment until it expires or the step releases it.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<OutgoingPaymentModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!(
                    "UPDATE outgoing_payments SET lease_expires_at = ?1 \
                     WHERE id = (SELECT id FROM outgoing_payments \
                                 WHERE state = 'sending' AND process_at IS NOT NULL \
                                   AND process_at <= ?2 \
                                   AND (lease_expires_at IS NULL OR lease_expires_at <= ?2) \
                                 ORDER BY process_at LIMIT 1) \
                     RETURNING {}",
                    OUTGOING_PAYMENT_COLUMNS
                ),
                rusqlite::params![now + lease, now],
                map_outgoing_payment,
            )
            .optional()?;
        Ok(result)
    }

    /// Persist the outcome of one pay step and release the lease
    #[allow(clippy::too_many_arguments)]
    pub async fn finish_step(
        &self,
        id: &str,
        state: OutgoingPaymentState,
        sent_amount: u64,
        state_attempts: u32,
        error: Option<&str>,
        process_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let changed = conn.execute(
            "UPDATE outgoing_payments \
             SET state = ?1, sent_amount = ?2, state_attempts = ?3, error = ?4, \
                 process_at = ?5, lease_expires_at = NULL, updated_at = ?6 \
             WHERE id = ?7 AND state = 'sending'",
            rusqlite::params![
                state.as_str(),
                sent_amount as i64,
                state_attempts as i64,
                error,
                process_at,
                Utc::now(),
                id,
            ],
        )?;
        Ok(changed > 0)
    }
}

/// Outgoing payment grant queries
pub struct GrantQueries<'a> {
    db: &'a Database,
}

impl<'a> GrantQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert the grant row if missing. Together with the connection lock
    /// this serializes payment creations per grant.
    pub fn insert_or_get_tx(conn: &Connection, id: &str) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO outgoing_payment_grants (id, created_at) VALUES (?1, ?2)",
            rusqlite::params![id, Utc::now()],
        )?;
        Ok(())
    }

    /// Whether a grant row exists
    pub async fn exists(&self, id: &str) -> Result<bool> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outgoing_payment_grants WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn map_fee(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeeModel> {
    let fee_type: String = row.get(2)?;
    Ok(FeeModel {
        id: row.get(0)?,
        asset_id: row.get(1)?,
        fee_type: FeeType::parse(&fee_type).unwrap_or(FeeType::Sending),
        fixed: row.get::<_, i64>(3)? as u64,
        basis_points: row.get::<_, i64>(4)? as u32,
        created_at: row.get(5)?,
    })
}

const FEE_COLUMNS: &str = "id, asset_id, fee_type, fixed, basis_points, created_at";

/// Fee configuration queries
pub struct FeeQueries<'a> {
    db: &'a Database,
}

impl<'a> FeeQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a fee configuration. Fees are append-only; the latest row
    /// for an (asset, type) pair wins.
    pub async fn insert(&self, fee: &FeeModel) -> Result<()> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT INTO fees (id, asset_id, fee_type, fixed, basis_points, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                &fee.id,
                &fee.asset_id,
                fee.fee_type.as_str(),
                fee.fixed as i64,
                fee.basis_points as i64,
                fee.created_at,
            ],
        )?;
        info!(
            "DB: Created fee: id={}, asset={}, type={}",
            fee.id,
            fee.asset_id,
            fee.fee_type.as_str()
        );
        Ok(())
    }

    /// Get a fee by ID
    pub async fn get_by_id(&self, id: &str) -> Result<Option<FeeModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM fees WHERE id = ?1", FEE_COLUMNS),
                [id],
                map_fee,
            )
            .optional()?;
        Ok(result)
    }

    /// Latest fee configured for an asset and direction
    pub async fn get_latest_for_asset(
        &self,
        asset_id: &str,
        fee_type: FeeType,
    ) -> Result<Option<FeeModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM fees WHERE asset_id = ?1 AND fee_type = ?2 \
                     ORDER BY created_at DESC LIMIT 1",
                    FEE_COLUMNS
                ),
                rusqlite::params![asset_id, fee_type.as_str()],
                map_fee,
            )
            .optional()?;
        Ok(result)
    }
}

fn map_webhook_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<WebhookEventModel> {
    let event_type: String = row.get(1)?;
    let data: String = row.get(2)?;
    let withdrawal_account: Option<String> = row.get(6)?;
    let withdrawal = match withdrawal_account {
        Some(account_id) => Some(EventWithdrawal {
            account_id,
            asset_id: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
            amount: row.get::<_, Option<i64>>(8)?.unwrap_or(0) as u64,
        }),
        None => None,
    };
    Ok(WebhookEventModel {
        id: row.get(0)?,
        event_type: WebhookEventType::parse(&event_type)
            .unwrap_or(WebhookEventType::WalletAddressNotFound),
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        process_at: row.get(3)?,
        attempts: row.get::<_, i64>(4)? as u32,
        status_code: row.get::<_, Option<i64>>(5)?.map(|v| v as u16),
        withdrawal,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

const WEBHOOK_EVENT_COLUMNS: &str = "id, type, data, process_at, attempts, status_code, \
     withdrawal_account_id, withdrawal_asset_id, withdrawal_amount, created_at, updated_at";

/// Webhook event queries
pub struct WebhookEventQueries<'a> {
    db: &'a Database,
}

impl<'a> WebhookEventQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert an event inside an open transaction (same transaction as the
    /// state change it reports)
    pub fn insert_tx(conn: &Connection, event: &WebhookEventModel) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO webhook_events (id, type, data, process_at, attempts, status_code,
                withdrawal_account_id, withdrawal_asset_id, withdrawal_amount,
                created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            rusqlite::params![
                &event.id,
                event.event_type.as_str(),
                serde_json::to_string(&event.data).unwrap_or_default(),
                event.process_at,
                event.attempts as i64,
                event.status_code.map(|v| v as i64),
                event.withdrawal.as_ref().map(|w| w.account_id.as_str()),
                event.withdrawal.as_ref().map(|w| w.asset_id.as_str()),
                event.withdrawal.as_ref().map(|w| w.amount as i64),
                event.created_at,
                event.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Insert an event outside any transaction
    pub async fn insert(&self, event: &WebhookEventModel) -> Result<()> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        Self::insert_tx(&conn, event)
    }

    /// Get an event by ID
    pub async fn get_by_id(&self, id: &str) -> Result<Option<WebhookEventModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM webhook_events WHERE id = ?1",
                    WEBHOOK_EVENT_COLUMNS
                ),
                [id],
                map_webhook_event,
            )
            .optional()?;
        Ok(result)
    }

    /// List events due for delivery
    pub async fn list_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<WebhookEventModel>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM webhook_events \
             WHERE process_at IS NOT NULL AND process_at <= ?1 \
             ORDER BY process_at LIMIT ?2",
            WEBHOOK_EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(rusqlite::params![now, limit as i64], map_webhook_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Record a delivery attempt and its reschedule (None parks the event)
    pub async fn record_attempt(
        &self,
        id: &str,
        status_code: Option<u16>,
        process_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE webhook_events \
             SET attempts = attempts + 1, status_code = ?1, process_at = ?2, updated_at = ?3 \
             WHERE id = ?4",
            rusqlite::params![status_code.map(|v| v as i64), process_at, Utc::now(), id],
        )?;
        Ok(())
    }

    /// Delete an event after successful delivery
    pub async fn delete(&self, id: &str) -> Result<()> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        conn.execute("DELETE FROM webhook_events WHERE id = ?1", [id])?;
        Ok(())
    }
}

/// Idempotency key queries
pub struct IdempotencyQueries<'a> {
    db: &'a Database,
}

impl<'a> IdempotencyQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Stored result for an (operation, key) pair, if any
    pub async fn get(&self, operation: &str, key: &str) -> Result<Option<String>> {
        let conn = self.db.conn().clone();
        let conn = conn.lock().await;
        Self::get_tx(&conn, operation, key)
    }

    /// Stored result lookup inside an open transaction
    pub fn get_tx(conn: &Connection, operation: &str, key: &str) -> Result<Option<String>> {
        let result = conn
            .query_row(
                "SELECT result FROM idempotency_keys WHERE operation = ?1 AND key = ?2",
                [operation, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    /// Record a result inside the same transaction as the operation itself
    pub fn put_tx(conn: &Connection, operation: &str, key: &str, result: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO idempotency_keys (operation, key, result, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![operation, key, result, Utc::now()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::connect("sqlite::memory:").await.unwrap()
    }

    fn test_asset(code: &str) -> AssetModel {
        let now = Utc::now();
        AssetModel {
            id: uuid::Uuid::new_v4().to_string(),
            code: code.to_string(),
            scale: 9,
            withdrawal_threshold: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_asset_insert_and_get() {
        let db = test_db().await;
        let queries = AssetQueries::new(&db);
        let asset = test_asset("USD");
        queries.insert(&asset).await.unwrap();

        let loaded = queries.get_by_id(&asset.id).await.unwrap().unwrap();
        assert_eq!(loaded.code, "USD");
        assert_eq!(loaded.scale, 9);

        // duplicate (code, scale) rejected
        let dup = test_asset("USD");
        assert!(queries.insert(&dup).await.is_err());
    }

    #[tokio::test]
    async fn test_peer_destination_prefix_routing() {
        let db = test_db().await;
        let assets = AssetQueries::new(&db);
        let asset = test_asset("XRP");
        assets.insert(&asset).await.unwrap();

        let peers = PeerQueries::new(&db);
        let now = Utc::now();
        for (id, prefix) in [("a", "test.peer"), ("b", "test.peer.sub")] {
            peers
                .insert(&PeerModel {
                    id: id.to_string(),
                    asset_id: asset.id.clone(),
                    static_ilp_address: prefix.to_string(),
                    max_packet_amount: None,
                    http_incoming_token: format!("in-{}", id),
                    http_outgoing_token: format!("out-{}", id),
                    http_outgoing_endpoint: "http://peer.example".to_string(),
                    liquidity_threshold: None,
                    created_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();
        }

        // longest prefix wins
        let hit = peers
            .find_by_destination("test.peer.sub.alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.id, "b");

        let hit = peers
            .find_by_destination("test.peer.other")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.id, "a");

        // no partial-segment match
        assert!(peers
            .find_by_destination("test.peerother")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_incoming_payment_transition_guard() {
        let db = test_db().await;
        let assets = AssetQueries::new(&db);
        let asset = test_asset("USD");
        assets.insert(&asset).await.unwrap();

        let wallets = WalletAddressQueries::new(&db);
        let now = Utc::now();
        let wallet = WalletAddressModel {
            id: "wa".to_string(),
            url: "https://pay.example/alice".to_string(),
            asset_id: asset.id.clone(),
            public_name: None,
            total_events_amount: 0,
            process_at: None,
            deactivated_at: None,
            created_at: now,
            updated_at: now,
        };
        wallets.insert(&wallet).await.unwrap();

        let payment = IncomingPaymentModel {
            id: "ip".to_string(),
            wallet_address_id: wallet.id.clone(),
            asset_id: asset.id.clone(),
            incoming_amount: Some(100),
            received_amount: 0,
            state: IncomingPaymentState::Pending,
            expires_at: now + chrono::Duration::days(1),
            connection_id: Some("tag".to_string()),
            metadata: None,
            process_at: None,
            created_at: now,
            updated_at: now,
        };
        {
            let conn = db.conn();
            let conn = conn.lock().await;
            IncomingPaymentQueries::insert_tx(&conn, &payment).unwrap();
        }

        let queries = IncomingPaymentQueries::new(&db);
        assert!(queries.record_credit("ip", 40).await.unwrap());
        let loaded = queries.get_by_id("ip").await.unwrap().unwrap();
        assert_eq!(loaded.state, IncomingPaymentState::Processing);
        assert_eq!(loaded.received_amount, 40);

        // terminal transition clears the connection tag
        assert!(queries
            .transition(
                "ip",
                &[IncomingPaymentState::Pending, IncomingPaymentState::Processing],
                IncomingPaymentState::Completed,
                None,
            )
            .await
            .unwrap());
        let loaded = queries.get_by_id("ip").await.unwrap().unwrap();
        assert_eq!(loaded.state, IncomingPaymentState::Completed);
        assert!(loaded.connection_id.is_none());

        // illegal transition changes nothing
        assert!(!queries
            .transition(
                "ip",
                &[IncomingPaymentState::Pending],
                IncomingPaymentState::Expired,
                None,
            )
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_idempotency_put_and_get() {
        let db = test_db().await;
        {
            let conn = db.conn();
            let conn = conn.lock().await;
            IdempotencyQueries::put_tx(&conn, "addAssetLiquidity", "k1", "{\"success\":true}")
                .unwrap();
        }
        let queries = IdempotencyQueries::new(&db);
        let stored = queries.get("addAssetLiquidity", "k1").await.unwrap();
        assert_eq!(stored.unwrap(), "{\"success\":true}");
        assert!(queries.get("addAssetLiquidity", "k2").await.unwrap().is_none());
        assert!(queries.get("addPeerLiquidity", "k1").await.unwrap().is_none());
    }
}
