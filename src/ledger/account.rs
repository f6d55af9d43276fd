//! Liquidity account references and credit hooks
//!
//! Every domain object that can hold value (asset, peer, wallet address,
//! incoming/outgoing payment) is bound to a ledger account through a tagged
//! reference. Lifecycle reactions to settled credits are registered per tag
//! and dispatched by the ledger after the balance change commits.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// The kind of domain object a ledger account backs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiquidityAccountKind {
    /// Asset liquidity pool
    Asset,
    /// Peer liquidity
    Peer,
    /// Incoming payment
    IncomingPayment,
    /// Outgoing payment reservation
    OutgoingPayment,
    /// Wallet address web monetization credits
    WebMonetization,
    /// Per-asset settlement pool backing deposits and withdrawals
    Settlement,
}

impl LiquidityAccountKind {
    /// Stable string form stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asset => "asset",
            Self::Peer => "peer",
            Self::IncomingPayment => "incoming",
            Self::OutgoingPayment => "outgoing",
            Self::WebMonetization => "web_monetization",
            Self::Settlement => "settlement",
        }
    }

    /// Parse the stored string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "asset" => Some(Self::Asset),
            "peer" => Some(Self::Peer),
            "incoming" => Some(Self::IncomingPayment),
            "outgoing" => Some(Self::OutgoingPayment),
            "web_monetization" => Some(Self::WebMonetization),
            "settlement" => Some(Self::Settlement),
            _ => None,
        }
    }
}

/// Reference to a liquidity account: the owning object's id plus its kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRef {
    /// Account id; equals the owning domain object's id
    pub id: String,
    /// Asset the account is denominated in
    pub asset_id: String,
    /// Owner kind
    pub kind: LiquidityAccountKind,
}

impl AccountRef {
    /// Build a reference
    pub fn new(id: impl Into<String>, asset_id: impl Into<String>, kind: LiquidityAccountKind) -> Self {
        Self {
            id: id.into(),
            asset_id: asset_id.into(),
            kind,
        }
    }
}

/// Id of the settlement account for an asset
pub fn settlement_account_id(asset_id: &str) -> String {
    format!("settlement:{}", asset_id)
}

/// A settled credit on a liquidity account
#[derive(Debug, Clone)]
pub struct CreditEvent {
    /// Credited account
    pub account_id: String,
    /// Asset of the account
    pub asset_id: String,
    /// Owner kind
    pub kind: LiquidityAccountKind,
    /// Total posted credits on the account after this credit
    pub total_received: u64,
}

/// Async reaction to a settled credit
pub type OnCreditHook = Arc<dyn Fn(CreditEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Registry of per-kind credit hooks
#[derive(Clone, Default)]
pub struct AccountRegistry {
    hooks: Arc<RwLock<HashMap<LiquidityAccountKind, OnCreditHook>>>,
}

impl AccountRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the hook for an account kind, replacing any existing one
    pub async fn register(&self, kind: LiquidityAccountKind, hook: OnCreditHook) {
        self.hooks.write().await.insert(kind, hook);
    }

    /// Dispatch a credit to the hook registered for its kind
    pub async fn dispatch(&self, event: CreditEvent) {
        let hook = {
            let hooks = self.hooks.read().await;
            hooks.get(&event.kind).cloned()
        };
        match hook {
            Some(hook) => hook(event).await,
            None => {
                // Settlement and reservation accounts have no lifecycle
                if !matches!(
                    event.kind,
                    LiquidityAccountKind::Settlement
                        | LiquidityAccountKind::Asset
                        | LiquidityAccountKind::Peer
                        | LiquidityAccountKind::OutgoingPayment
                ) {
                    warn!(
                        "No credit hook registered for {} account {}",
                        event.kind.as_str(),
                        event.account_id
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_kind_string_roundtrip() {
        for kind in [
            LiquidityAccountKind::Asset,
            LiquidityAccountKind::Peer,
            LiquidityAccountKind::IncomingPayment,
            LiquidityAccountKind::OutgoingPayment,
            LiquidityAccountKind::WebMonetization,
            LiquidityAccountKind::Settlement,
        ] {
            assert_eq!(LiquidityAccountKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(LiquidityAccountKind::parse("bogus"), None);
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_kind() {
        let registry = AccountRegistry::new();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = seen.clone();
        registry
            .register(
                LiquidityAccountKind::IncomingPayment,
                Arc::new(move |event| {
                    let seen = seen_clone.clone();
                    Box::pin(async move {
                        seen.store(event.total_received, Ordering::SeqCst);
                    })
                }),
            )
            .await;

        registry
            .dispatch(CreditEvent {
                account_id: "ip".to_string(),
                asset_id: "a".to_string(),
                kind: LiquidityAccountKind::IncomingPayment,
                total_received: 77,
            })
            .await;
        assert_eq!(seen.load(Ordering::SeqCst), 77);

        // unregistered kind is a no-op
        registry
            .dispatch(CreditEvent {
                account_id: "peer".to_string(),
                asset_id: "a".to_string(),
                kind: LiquidityAccountKind::Peer,
                total_received: 1,
            })
            .await;
    }
}
