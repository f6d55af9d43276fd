//! Double-entry liquidity ledger
//!
//! The authority for all balances. Every domain object with value is backed
//! by a ledger account; money moves between accounts through transfers that
//! are either posted immediately (deposits) or prepared as two-phase
//! reservations that a later post commits or a void (explicit or by
//! timeout) rolls back.
//!
//! Account balances are four counters: pending and posted debits, pending
//! and posted credits. The available balance is
//! `credits_posted - debits_posted - debits_pending`; pending credits never
//! count until they settle.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::Database;

mod account;

pub use account::{
    settlement_account_id, AccountRef, AccountRegistry, CreditEvent, LiquidityAccountKind,
    OnCreditHook,
};

/// Errors surfaced by ledger operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The liquidity account was already created
    #[error("account already exists")]
    AccountAlreadyExists,
    /// The named account does not exist
    #[error("unknown account")]
    UnknownAccount,
    /// Zero or otherwise unusable amount
    #[error("invalid amount")]
    InvalidAmount,
    /// A transfer with this id was already recorded
    #[error("transfer already exists")]
    TransferExists,
    /// The named transfer does not exist
    #[error("unknown transfer")]
    UnknownTransfer,
    /// The transfer was already posted
    #[error("transfer already posted")]
    AlreadyPosted,
    /// The transfer was already voided
    #[error("transfer already voided")]
    AlreadyVoided,
    /// The debited account cannot cover the amount
    #[error("insufficient balance")]
    InsufficientBalance,
    /// Underlying storage failure
    #[error("ledger database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Database(e.to_string())
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// A ledger account row
#[derive(Debug, Clone)]
pub struct LedgerAccount {
    /// Account id (the owning object's id)
    pub id: String,
    /// Owner kind
    pub kind: LiquidityAccountKind,
    /// Asset of the account
    pub asset_id: String,
    /// Reserved outgoing value
    pub debits_pending: u64,
    /// Settled outgoing value
    pub debits_posted: u64,
    /// Reserved incoming value
    pub credits_pending: u64,
    /// Settled incoming value
    pub credits_posted: u64,
}

impl LedgerAccount {
    /// Balance available for new debits
    pub fn balance(&self) -> u64 {
        self.credits_posted
            .saturating_sub(self.debits_posted)
            .saturating_sub(self.debits_pending)
    }
}

/// Arguments to a two-phase transfer between liquidity accounts
#[derive(Debug, Clone)]
pub struct TransferArgs {
    /// Account to debit
    pub source_account_id: String,
    /// Account to credit
    pub destination_account_id: String,
    /// Amount debited from the source
    pub source_amount: u64,
    /// Amount credited to the destination; defaults to the source amount.
    /// Differs on cross-currency transfers, which route both legs through
    /// the assets' settlement accounts.
    pub destination_amount: Option<u64>,
    /// Reservation lifetime before auto-void
    pub timeout: Duration,
}

/// Handle to a prepared two-phase transfer. Consume with [`post`] to commit
/// or [`void`] to roll back; the reservation auto-voids after its timeout.
///
/// [`post`]: TransferHandle::post
/// [`void`]: TransferHandle::void
#[derive(Debug)]
pub struct TransferHandle {
    ledger: Ledger,
    transfer_ids: Vec<String>,
}

impl TransferHandle {
    /// Commit the reserved transfer
    pub async fn post(self) -> Result<(), LedgerError> {
        self.ledger.post_transfers(&self.transfer_ids).await
    }

    /// Roll back the reserved transfer
    pub async fn void(self) -> Result<(), LedgerError> {
        self.ledger.void_transfers(&self.transfer_ids).await
    }
}

/// The ledger adapter
#[derive(Clone)]
pub struct Ledger {
    db: Database,
    registry: AccountRegistry,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

impl Ledger {
    /// Create a ledger over the shared database
    pub fn new(db: Database, registry: AccountRegistry) -> Self {
        Self { db, registry }
    }

    /// The credit hook registry
    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    /// Create a liquidity account. Fails with `AccountAlreadyExists` when
    /// the owner already has one; callers treat that as success on retry.
    pub async fn create_liquidity_account(&self, account: &AccountRef) -> Result<(), LedgerError> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn.execute(
            "INSERT INTO ledger_accounts (id, kind, asset_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![&account.id, account.kind.as_str(), &account.asset_id, Utc::now()],
        );
        match result {
            Ok(_) => {
                debug!(
                    "Ledger: created {} account {}",
                    account.kind.as_str(),
                    account.id
                );
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(LedgerError::AccountAlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    /// Create the settlement pool account for an asset if it is missing
    pub async fn ensure_settlement_account(&self, asset_id: &str) -> Result<(), LedgerError> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        Self::ensure_settlement_account_tx(&conn, asset_id)
    }

    fn ensure_settlement_account_tx(conn: &Connection, asset_id: &str) -> Result<(), LedgerError> {
        conn.execute(
            "INSERT OR IGNORE INTO ledger_accounts (id, kind, asset_id, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                settlement_account_id(asset_id),
                LiquidityAccountKind::Settlement.as_str(),
                asset_id,
                Utc::now()
            ],
        )?;
        Ok(())
    }

    fn get_account_tx(conn: &Connection, id: &str) -> Result<Option<LedgerAccount>, LedgerError> {
        let account = conn
            .query_row(
                "SELECT id, kind, asset_id, debits_pending, debits_posted, credits_pending, \
                        credits_posted \
                 FROM ledger_accounts WHERE id = ?1",
                [id],
                |row| {
                    let kind: String = row.get(1)?;
                    Ok(LedgerAccount {
                        id: row.get(0)?,
                        kind: LiquidityAccountKind::parse(&kind)
                            .unwrap_or(LiquidityAccountKind::Settlement),
                        asset_id: row.get(2)?,
                        debits_pending: row.get::<_, i64>(3)? as u64,
                        debits_posted: row.get::<_, i64>(4)? as u64,
                        credits_pending: row.get::<_, i64>(5)? as u64,
                        credits_posted: row.get::<_, i64>(6)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(account)
    }

    /// Load an account
    pub async fn get_account(&self, id: &str) -> Result<Option<LedgerAccount>, LedgerError> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        Self::void_expired_tx(&conn, Utc::now())?;
        Self::get_account_tx(&conn, id)
    }

    /// Available balance of an account
    pub async fn get_balance(&self, id: &str) -> Result<u64, LedgerError> {
        self.get_account(id)
            .await?
            .map(|a| a.balance())
            .ok_or(LedgerError::UnknownAccount)
    }

    /// Total settled debits of an account
    pub async fn get_total_sent(&self, id: &str) -> Result<u64, LedgerError> {
        self.get_account(id)
            .await?
            .map(|a| a.debits_posted)
            .ok_or(LedgerError::UnknownAccount)
    }

    /// Total settled credits of an account
    pub async fn get_total_received(&self, id: &str) -> Result<u64, LedgerError> {
        self.get_account(id)
            .await?
            .map(|a| a.credits_posted)
            .ok_or(LedgerError::UnknownAccount)
    }

    /// Roll back every pending transfer whose reservation has timed out
    fn void_expired_tx(conn: &Connection, now: DateTime<Utc>) -> Result<(), LedgerError> {
        let expired: Vec<(String, String, String, i64)> = {
            let mut stmt = conn.prepare(
                "SELECT id, debit_account_id, credit_account_id, amount FROM ledger_transfers \
                 WHERE state = 'pending' AND expires_at IS NOT NULL AND expires_at <= ?1",
            )?;
            let rows = stmt.query_map([now], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            let mut expired = Vec::new();
            for row in rows {
                expired.push(row?);
            }
            expired
        };
        for (id, debit_account, credit_account, amount) in expired {
            debug!("Ledger: auto-voiding expired transfer {}", id);
            Self::apply_void_tx(conn, &id, &debit_account, &credit_account, amount, now)?;
        }
        Ok(())
    }

    fn apply_void_tx(
        conn: &Connection,
        transfer_id: &str,
        debit_account: &str,
        credit_account: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        conn.execute(
            "UPDATE ledger_accounts SET debits_pending = debits_pending - ?1 WHERE id = ?2",
            rusqlite::params![amount, debit_account],
        )?;
        conn.execute(
            "UPDATE ledger_accounts SET credits_pending = credits_pending - ?1 WHERE id = ?2",
            rusqlite::params![amount, credit_account],
        )?;
        conn.execute(
            "UPDATE ledger_transfers SET state = 'voided', updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now, transfer_id],
        )?;
        Ok(())
    }

    fn transfer_exists_tx(conn: &Connection, id: &str) -> Result<bool, LedgerError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ledger_transfers WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Post a deposit from the asset's settlement pool into an account.
    /// Idempotent on `transfer_id`: a repeat surfaces `TransferExists`.
    pub async fn create_deposit(
        &self,
        transfer_id: &str,
        account_id: &str,
        amount: u64,
    ) -> Result<(), LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let event = {
            let conn = self.db.conn();
            let mut conn = conn.lock().await;
            let tx = conn.transaction().map_err(LedgerError::from)?;

            let account =
                Self::get_account_tx(&tx, account_id)?.ok_or(LedgerError::UnknownAccount)?;
            if Self::transfer_exists_tx(&tx, transfer_id)? {
                return Err(LedgerError::TransferExists);
            }
            Self::ensure_settlement_account_tx(&tx, &account.asset_id)?;
            let settlement = settlement_account_id(&account.asset_id);
            let now = Utc::now();
            tx.execute(
                "INSERT INTO ledger_transfers (id, debit_account_id, credit_account_id, amount, \
                    state, expires_at, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, 'posted', NULL, ?5, ?5)",
                rusqlite::params![transfer_id, &settlement, account_id, amount as i64, now],
            )?;
            tx.execute(
                "UPDATE ledger_accounts SET debits_posted = debits_posted + ?1 WHERE id = ?2",
                rusqlite::params![amount as i64, &settlement],
            )?;
            tx.execute(
                "UPDATE ledger_accounts SET credits_posted = credits_posted + ?1 WHERE id = ?2",
                rusqlite::params![amount as i64, account_id],
            )?;
            let total_received: i64 = tx.query_row(
                "SELECT credits_posted FROM ledger_accounts WHERE id = ?1",
                [account_id],
                |row| row.get(0),
            )?;
            tx.commit().map_err(LedgerError::from)?;
            info!(
                "Ledger: deposited {} into {} account {}",
                amount,
                account.kind.as_str(),
                account_id
            );
            CreditEvent {
                account_id: account_id.to_string(),
                asset_id: account.asset_id,
                kind: account.kind,
                total_received: total_received as u64,
            }
        };
        self.registry.dispatch(event).await;
        Ok(())
    }

    /// Create a withdrawal out of an account. With a timeout the transfer
    /// is a two-phase reservation to be posted or voided; without one it
    /// settles immediately.
    pub async fn create_withdrawal(
        &self,
        transfer_id: &str,
        account_id: &str,
        amount: u64,
        timeout: Option<Duration>,
    ) -> Result<(), LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction().map_err(LedgerError::from)?;
        let now = Utc::now();
        Self::void_expired_tx(&tx, now)?;

        let account = Self::get_account_tx(&tx, account_id)?.ok_or(LedgerError::UnknownAccount)?;
        if Self::transfer_exists_tx(&tx, transfer_id)? {
            return Err(LedgerError::TransferExists);
        }
        if account.balance() < amount {
            return Err(LedgerError::InsufficientBalance);
        }
        Self::ensure_settlement_account_tx(&tx, &account.asset_id)?;
        let settlement = settlement_account_id(&account.asset_id);

        match timeout {
            Some(timeout) => {
                tx.execute(
                    "INSERT INTO ledger_transfers (id, debit_account_id, credit_account_id, \
                        amount, state, expires_at, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)",
                    rusqlite::params![
                        transfer_id,
                        account_id,
                        &settlement,
                        amount as i64,
                        now + timeout,
                        now
                    ],
                )?;
                tx.execute(
                    "UPDATE ledger_accounts SET debits_pending = debits_pending + ?1 WHERE id = ?2",
                    rusqlite::params![amount as i64, account_id],
                )?;
                tx.execute(
                    "UPDATE ledger_accounts SET credits_pending = credits_pending + ?1 WHERE id = ?2",
                    rusqlite::params![amount as i64, &settlement],
                )?;
            }
            None => {
                tx.execute(
                    "INSERT INTO ledger_transfers (id, debit_account_id, credit_account_id, \
                        amount, state, expires_at, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, 'posted', NULL, ?5, ?5)",
                    rusqlite::params![transfer_id, account_id, &settlement, amount as i64, now],
                )?;
                tx.execute(
                    "UPDATE ledger_accounts SET debits_posted = debits_posted + ?1 WHERE id = ?2",
                    rusqlite::params![amount as i64, account_id],
                )?;
                tx.execute(
                    "UPDATE ledger_accounts SET credits_posted = credits_posted + ?1 WHERE id = ?2",
                    rusqlite::params![amount as i64, &settlement],
                )?;
            }
        }
        tx.commit().map_err(LedgerError::from)?;
        info!(
            "Ledger: withdrawal {} of {} from account {} ({})",
            transfer_id,
            amount,
            account_id,
            if timeout.is_some() { "pending" } else { "posted" }
        );
        Ok(())
    }

    /// Commit a pending withdrawal
    pub async fn post_withdrawal(&self, transfer_id: &str) -> Result<(), LedgerError> {
        let events = self.post_transfer_ids(&[transfer_id.to_string()]).await?;
        for event in events {
            self.registry.dispatch(event).await;
        }
        Ok(())
    }

    /// Roll back a pending withdrawal
    pub async fn void_withdrawal(&self, transfer_id: &str) -> Result<(), LedgerError> {
        self.void_transfers(&[transfer_id.to_string()]).await
    }

    /// Prepare a two-phase transfer between two liquidity accounts.
    /// Cross-currency transfers run both legs through the settlement pools.
    pub async fn create_transfer(&self, args: TransferArgs) -> Result<TransferHandle, LedgerError> {
        if args.source_amount == 0 || args.destination_amount == Some(0) {
            return Err(LedgerError::InvalidAmount);
        }
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction().map_err(LedgerError::from)?;
        let now = Utc::now();
        Self::void_expired_tx(&tx, now)?;

        let source = Self::get_account_tx(&tx, &args.source_account_id)?
            .ok_or(LedgerError::UnknownAccount)?;
        let destination = Self::get_account_tx(&tx, &args.destination_account_id)?
            .ok_or(LedgerError::UnknownAccount)?;
        if source.balance() < args.source_amount {
            return Err(LedgerError::InsufficientBalance);
        }

        // Same-asset transfers are a single leg. Cross-currency transfers
        // debit the source into its settlement pool and credit the
        // destination out of its own, with possibly different amounts.
        let mut legs: Vec<(String, String, u64)> = Vec::new();
        let destination_amount = args.destination_amount.unwrap_or(args.source_amount);
        if source.asset_id == destination.asset_id && args.destination_amount.is_none() {
            legs.push((
                args.source_account_id.clone(),
                args.destination_account_id.clone(),
                args.source_amount,
            ));
        } else {
            Self::ensure_settlement_account_tx(&tx, &source.asset_id)?;
            Self::ensure_settlement_account_tx(&tx, &destination.asset_id)?;
            legs.push((
                args.source_account_id.clone(),
                settlement_account_id(&source.asset_id),
                args.source_amount,
            ));
            legs.push((
                settlement_account_id(&destination.asset_id),
                args.destination_account_id.clone(),
                destination_amount,
            ));
        }

        let expires_at = now + args.timeout;
        let mut transfer_ids = Vec::with_capacity(legs.len());
        for (debit_account, credit_account, amount) in &legs {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO ledger_transfers (id, debit_account_id, credit_account_id, amount, \
                    state, expires_at, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)",
                rusqlite::params![&id, debit_account, credit_account, *amount as i64, expires_at, now],
            )?;
            tx.execute(
                "UPDATE ledger_accounts SET debits_pending = debits_pending + ?1 WHERE id = ?2",
                rusqlite::params![*amount as i64, debit_account],
            )?;
            tx.execute(
                "UPDATE ledger_accounts SET credits_pending = credits_pending + ?1 WHERE id = ?2",
                rusqlite::params![*amount as i64, credit_account],
            )?;
            transfer_ids.push(id);
        }
        tx.commit().map_err(LedgerError::from)?;
        debug!(
            "Ledger: prepared transfer {} -> {} ({} / {})",
            args.source_account_id, args.destination_account_id, args.source_amount, destination_amount
        );
        Ok(TransferHandle {
            ledger: self.clone(),
            transfer_ids,
        })
    }

    async fn post_transfers(&self, transfer_ids: &[String]) -> Result<(), LedgerError> {
        let events = self.post_transfer_ids(transfer_ids).await?;
        for event in events {
            self.registry.dispatch(event).await;
        }
        Ok(())
    }

    async fn post_transfer_ids(
        &self,
        transfer_ids: &[String],
    ) -> Result<Vec<CreditEvent>, LedgerError> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction().map_err(LedgerError::from)?;
        let now = Utc::now();
        Self::void_expired_tx(&tx, now)?;

        let mut events = Vec::new();
        for transfer_id in transfer_ids {
            let row: Option<(String, String, i64, String)> = tx
                .query_row(
                    "SELECT debit_account_id, credit_account_id, amount, state \
                     FROM ledger_transfers WHERE id = ?1",
                    [transfer_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            let (debit_account, credit_account, amount, state) =
                row.ok_or(LedgerError::UnknownTransfer)?;
            match state.as_str() {
                "pending" => {}
                "posted" => return Err(LedgerError::AlreadyPosted),
                _ => return Err(LedgerError::AlreadyVoided),
            }
            tx.execute(
                "UPDATE ledger_accounts \
                 SET debits_pending = debits_pending - ?1, debits_posted = debits_posted + ?1 \
                 WHERE id = ?2",
                rusqlite::params![amount, &debit_account],
            )?;
            tx.execute(
                "UPDATE ledger_accounts \
                 SET credits_pending = credits_pending - ?1, credits_posted = credits_posted + ?1 \
                 WHERE id = ?2",
                rusqlite::params![amount, &credit_account],
            )?;
            tx.execute(
                "UPDATE ledger_transfers SET state = 'posted', updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, transfer_id],
            )?;
            let credited = Self::get_account_tx(&tx, &credit_account)?
                .ok_or(LedgerError::UnknownAccount)?;
            events.push(CreditEvent {
                account_id: credited.id,
                asset_id: credited.asset_id,
                kind: credited.kind,
                total_received: credited.credits_posted,
            });
        }
        tx.commit().map_err(LedgerError::from)?;
        Ok(events)
    }

    async fn void_transfers(&self, transfer_ids: &[String]) -> Result<(), LedgerError> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction().map_err(LedgerError::from)?;
        let now = Utc::now();

        for transfer_id in transfer_ids {
            let row: Option<(String, String, i64, String)> = tx
                .query_row(
                    "SELECT debit_account_id, credit_account_id, amount, state \
                     FROM ledger_transfers WHERE id = ?1",
                    [transfer_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            let (debit_account, credit_account, amount, state) =
                row.ok_or(LedgerError::UnknownTransfer)?;
            match state.as_str() {
                "pending" => {}
                "posted" => return Err(LedgerError::AlreadyPosted),
                _ => return Err(LedgerError::AlreadyVoided),
            }
            Self::apply_void_tx(&tx, transfer_id, &debit_account, &credit_account, amount, now)?;
        }
        tx.commit().map_err(LedgerError::from)?;
        Ok(())
    }
}
