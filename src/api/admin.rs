//! Admin provisioning endpoints
//!
//! Assets, peers, and wallet addresses are created here. Creation binds
//! each object to its ledger liquidity account (the wallet address's web
//! monetization account stays lazy, created on first credit).

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::{fail, ok, ApiState, Reply};
use crate::db::{
    AssetModel, AssetQueries, Database, FeeModel, FeeQueries, FeeType, PeerModel, PeerQueries,
    WalletAddressModel, WalletAddressQueries,
};
use crate::ledger::{AccountRef, Ledger, LedgerError, LiquidityAccountKind};

/// Admin provisioning failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdminError {
    /// Duplicate asset (code, scale) or duplicate wallet address URL
    #[error("already exists")]
    AlreadyExists,
    /// The referenced asset does not exist
    #[error("unknown asset")]
    UnknownAsset,
    /// The referenced peer does not exist
    #[error("unknown peer")]
    UnknownPeer,
    /// The referenced wallet address does not exist
    #[error("unknown wallet address")]
    UnknownWalletAddress,
    /// Malformed input
    #[error("invalid input: {0}")]
    Invalid(String),
    /// Underlying storage failure
    #[error("database error: {0}")]
    Database(String),
}

impl From<anyhow::Error> for AdminError {
    fn from(e: anyhow::Error) -> Self {
        let text = e.to_string();
        if text.contains("UNIQUE constraint failed") {
            AdminError::AlreadyExists
        } else {
            AdminError::Database(text)
        }
    }
}

/// Provisioning service for assets, peers, and wallet addresses
pub struct AdminService {
    db: Database,
    ledger: Ledger,
}

impl AdminService {
    /// Create the service
    pub fn new(db: Database, ledger: Ledger) -> Self {
        Self { db, ledger }
    }

    /// Create an asset and its liquidity + settlement accounts
    pub async fn create_asset(
        &self,
        code: &str,
        scale: u8,
        withdrawal_threshold: Option<u64>,
    ) -> Result<AssetModel, AdminError> {
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AdminError::Invalid("asset code".to_string()));
        }
        let now = Utc::now();
        let asset = AssetModel {
            id: Uuid::new_v4().to_string(),
            code: code.to_uppercase(),
            scale,
            withdrawal_threshold,
            created_at: now,
            updated_at: now,
        };
        AssetQueries::new(&self.db).insert(&asset).await?;
        match self
            .ledger
            .create_liquidity_account(&AccountRef::new(
                &asset.id,
                &asset.id,
                LiquidityAccountKind::Asset,
            ))
            .await
        {
            Ok(()) | Err(LedgerError::AccountAlreadyExists) => {}
            Err(e) => return Err(AdminError::Database(e.to_string())),
        }
        self.ledger
            .ensure_settlement_account(&asset.id)
            .await
            .map_err(|e| AdminError::Database(e.to_string()))?;
        info!("Provisioned asset {} ({} scale {})", asset.id, asset.code, asset.scale);
        Ok(asset)
    }

    /// Update an asset's withdrawal threshold
    pub async fn update_asset(
        &self,
        id: &str,
        withdrawal_threshold: Option<u64>,
    ) -> Result<AssetModel, AdminError> {
        let queries = AssetQueries::new(&self.db);
        if !queries.update_withdrawal_threshold(id, withdrawal_threshold).await? {
            return Err(AdminError::UnknownAsset);
        }
        queries
            .get_by_id(id)
            .await?
            .ok_or(AdminError::UnknownAsset)
    }

    /// Create a peer and its liquidity account
    #[allow(clippy::too_many_arguments)]
    pub async fn create_peer(
        &self,
        asset_id: &str,
        static_ilp_address: &str,
        max_packet_amount: Option<u64>,
        http_incoming_token: &str,
        http_outgoing_token: &str,
        http_outgoing_endpoint: &str,
        liquidity_threshold: Option<u64>,
    ) -> Result<PeerModel, AdminError> {
        AssetQueries::new(&self.db)
            .get_by_id(asset_id)
            .await?
            .ok_or(AdminError::UnknownAsset)?;
        if static_ilp_address.is_empty()
            || static_ilp_address.split('.').any(|segment| segment.is_empty())
        {
            return Err(AdminError::Invalid("static ILP address".to_string()));
        }
        let now = Utc::now();
        let peer = PeerModel {
            id: Uuid::new_v4().to_string(),
            asset_id: asset_id.to_string(),
            static_ilp_address: static_ilp_address.to_string(),
            max_packet_amount,
            http_incoming_token: http_incoming_token.to_string(),
            http_outgoing_token: http_outgoing_token.to_string(),
            http_outgoing_endpoint: http_outgoing_endpoint.to_string(),
            liquidity_threshold,
            created_at: now,
            updated_at: now,
        };
        PeerQueries::new(&self.db).insert(&peer).await?;
        match self
            .ledger
            .create_liquidity_account(&AccountRef::new(
                &peer.id,
                asset_id,
                LiquidityAccountKind::Peer,
            ))
            .await
        {
            Ok(()) | Err(LedgerError::AccountAlreadyExists) => {}
            Err(e) => return Err(AdminError::Database(e.to_string())),
        }
        info!("Provisioned peer {} at {}", peer.id, peer.static_ilp_address);
        Ok(peer)
    }

    /// Update a peer
    pub async fn update_peer(&self, peer: &PeerModel) -> Result<PeerModel, AdminError> {
        if !PeerQueries::new(&self.db).update(peer).await? {
            return Err(AdminError::UnknownPeer);
        }
        PeerQueries::new(&self.db)
            .get_by_id(&peer.id)
            .await?
            .ok_or(AdminError::UnknownPeer)
    }

    /// Delete a peer
    pub async fn delete_peer(&self, id: &str) -> Result<(), AdminError> {
        if !PeerQueries::new(&self.db).delete(id).await? {
            return Err(AdminError::UnknownPeer);
        }
        Ok(())
    }

    /// Create a wallet address
    pub async fn create_wallet_address(
        &self,
        url: &str,
        asset_id: &str,
        public_name: Option<&str>,
    ) -> Result<WalletAddressModel, AdminError> {
        AssetQueries::new(&self.db)
            .get_by_id(asset_id)
            .await?
            .ok_or(AdminError::UnknownAsset)?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(AdminError::Invalid("wallet address URL".to_string()));
        }
        let now = Utc::now();
        let wallet = WalletAddressModel {
            id: Uuid::new_v4().to_string(),
            url: url.trim_end_matches('/').to_string(),
            asset_id: asset_id.to_string(),
            public_name: public_name.map(|s| s.to_string()),
            total_events_amount: 0,
            process_at: None,
            deactivated_at: None,
            created_at: now,
            updated_at: now,
        };
        WalletAddressQueries::new(&self.db).insert(&wallet).await?;
        info!("Provisioned wallet address {} at {}", wallet.id, wallet.url);
        Ok(wallet)
    }

    /// Update a wallet address's public name and deactivation time
    pub async fn update_wallet_address(
        &self,
        id: &str,
        public_name: Option<&str>,
        deactivated_at: Option<DateTime<Utc>>,
    ) -> Result<WalletAddressModel, AdminError> {
        let queries = WalletAddressQueries::new(&self.db);
        if !queries.update(id, public_name, deactivated_at).await? {
            return Err(AdminError::UnknownWalletAddress);
        }
        queries
            .get_by_id(id)
            .await?
            .ok_or(AdminError::UnknownWalletAddress)
    }

    /// Configure a sending or receiving fee on an asset
    pub async fn set_fee(
        &self,
        asset_id: &str,
        fee_type: FeeType,
        fixed: u64,
        basis_points: u32,
    ) -> Result<FeeModel, AdminError> {
        AssetQueries::new(&self.db)
            .get_by_id(asset_id)
            .await?
            .ok_or(AdminError::UnknownAsset)?;
        if basis_points > 10_000 {
            return Err(AdminError::Invalid("basis points above 10000".to_string()));
        }
        let fee = FeeModel {
            id: Uuid::new_v4().to_string(),
            asset_id: asset_id.to_string(),
            fee_type,
            fixed,
            basis_points,
            created_at: Utc::now(),
        };
        FeeQueries::new(&self.db).insert(&fee).await?;
        Ok(fee)
    }
}

fn admin_error<T>(e: AdminError) -> Reply<T> {
    let (status, kind) = match &e {
        AdminError::AlreadyExists => (StatusCode::CONFLICT, "AlreadyExists"),
        AdminError::UnknownAsset => (StatusCode::NOT_FOUND, "UnknownAsset"),
        AdminError::UnknownPeer => (StatusCode::NOT_FOUND, "UnknownPeer"),
        AdminError::UnknownWalletAddress => (StatusCode::NOT_FOUND, "UnknownWalletAddress"),
        AdminError::Invalid(_) => (StatusCode::BAD_REQUEST, "InvalidId"),
        AdminError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database"),
    };
    fail(status, kind, e.to_string())
}

/// Create-asset request body
#[derive(Debug, Deserialize)]
pub struct CreateAssetRequest {
    /// Currency code
    pub code: String,
    /// Decimal scale
    pub scale: u8,
    /// Optional withdrawal threshold
    #[serde(rename = "withdrawalThreshold")]
    pub withdrawal_threshold: Option<u64>,
}

/// Create an asset
pub async fn create_asset(
    State(state): State<ApiState>,
    axum::Json(req): axum::Json<CreateAssetRequest>,
) -> Reply<AssetModel> {
    match state
        .admin
        .create_asset(&req.code, req.scale, req.withdrawal_threshold)
        .await
    {
        Ok(asset) => ok(asset),
        Err(e) => admin_error(e),
    }
}

/// Get an asset
pub async fn get_asset(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<AssetModel> {
    match AssetQueries::new(&state.db).get_by_id(&id).await {
        Ok(Some(asset)) => ok(asset),
        Ok(None) => fail(StatusCode::NOT_FOUND, "UnknownAsset", "unknown asset"),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, "Database", e.to_string()),
    }
}

/// Update-asset request body
#[derive(Debug, Deserialize)]
pub struct UpdateAssetRequest {
    /// New withdrawal threshold (absent clears it)
    #[serde(rename = "withdrawalThreshold")]
    pub withdrawal_threshold: Option<u64>,
}

/// Update an asset's withdrawal threshold
pub async fn update_asset(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    axum::Json(req): axum::Json<UpdateAssetRequest>,
) -> Reply<AssetModel> {
    match state.admin.update_asset(&id, req.withdrawal_threshold).await {
        Ok(asset) => ok(asset),
        Err(e) => admin_error(e),
    }
}

/// Set-fee request body
#[derive(Debug, Deserialize)]
pub struct SetFeeRequest {
    /// "sending" or "receiving"
    #[serde(rename = "type")]
    pub fee_type: String,
    /// Flat component
    pub fixed: u64,
    /// Variable component in basis points
    #[serde(rename = "basisPoints")]
    pub basis_points: u32,
}

/// Configure a fee on an asset
pub async fn set_fee(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    axum::Json(req): axum::Json<SetFeeRequest>,
) -> Reply<FeeModel> {
    let Some(fee_type) = FeeType::parse(&req.fee_type) else {
        return fail(StatusCode::BAD_REQUEST, "InvalidId", "unknown fee type");
    };
    match state
        .admin
        .set_fee(&id, fee_type, req.fixed, req.basis_points)
        .await
    {
        Ok(fee) => ok(fee),
        Err(e) => admin_error(e),
    }
}

/// Create-peer request body
#[derive(Debug, Deserialize)]
pub struct CreatePeerRequest {
    /// Asset the peer settles in
    #[serde(rename = "assetId")]
    pub asset_id: String,
    /// Routing prefix
    #[serde(rename = "staticIlpAddress")]
    pub static_ilp_address: String,
    /// Per-packet cap
    #[serde(rename = "maxPacketAmount")]
    pub max_packet_amount: Option<u64>,
    /// Inbound auth token
    #[serde(rename = "httpIncomingToken")]
    pub http_incoming_token: String,
    /// Outbound auth token
    #[serde(rename = "httpOutgoingToken")]
    pub http_outgoing_token: String,
    /// Peer's ILP-over-HTTP endpoint
    #[serde(rename = "httpOutgoingEndpoint")]
    pub http_outgoing_endpoint: String,
    /// Low-liquidity alert threshold
    #[serde(rename = "liquidityThreshold")]
    pub liquidity_threshold: Option<u64>,
}

/// Create a peer
pub async fn create_peer(
    State(state): State<ApiState>,
    axum::Json(req): axum::Json<CreatePeerRequest>,
) -> Reply<PeerModel> {
    match state
        .admin
        .create_peer(
            &req.asset_id,
            &req.static_ilp_address,
            req.max_packet_amount,
            &req.http_incoming_token,
            &req.http_outgoing_token,
            &req.http_outgoing_endpoint,
            req.liquidity_threshold,
        )
        .await
    {
        Ok(peer) => ok(peer),
        Err(e) => admin_error(e),
    }
}

/// Get a peer
pub async fn get_peer(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<PeerModel> {
    match PeerQueries::new(&state.db).get_by_id(&id).await {
        Ok(Some(peer)) => ok(peer),
        Ok(None) => fail(StatusCode::NOT_FOUND, "UnknownPeer", "unknown peer"),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, "Database", e.to_string()),
    }
}

/// Update-peer request body
#[derive(Debug, Deserialize)]
pub struct UpdatePeerRequest {
    /// Routing prefix
    #[serde(rename = "staticIlpAddress")]
    pub static_ilp_address: Option<String>,
    /// Per-packet cap
    #[serde(rename = "maxPacketAmount")]
    pub max_packet_amount: Option<u64>,
    /// Low-liquidity alert threshold
    #[serde(rename = "liquidityThreshold")]
    pub liquidity_threshold: Option<u64>,
}

/// Update a peer
pub async fn update_peer(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    axum::Json(req): axum::Json<UpdatePeerRequest>,
) -> Reply<PeerModel> {
    let existing = match PeerQueries::new(&state.db).get_by_id(&id).await {
        Ok(Some(peer)) => peer,
        Ok(None) => return fail(StatusCode::NOT_FOUND, "UnknownPeer", "unknown peer"),
        Err(e) => return fail(StatusCode::INTERNAL_SERVER_ERROR, "Database", e.to_string()),
    };
    let mut updated = existing;
    if let Some(address) = req.static_ilp_address {
        updated.static_ilp_address = address;
    }
    if req.max_packet_amount.is_some() {
        updated.max_packet_amount = req.max_packet_amount;
    }
    if req.liquidity_threshold.is_some() {
        updated.liquidity_threshold = req.liquidity_threshold;
    }
    match state.admin.update_peer(&updated).await {
        Ok(peer) => ok(peer),
        Err(e) => admin_error(e),
    }
}

/// Delete a peer
pub async fn delete_peer(State(state): State<ApiState>, Path(id): Path<String>) -> Reply<()> {
    match state.admin.delete_peer(&id).await {
        Ok(()) => ok(()),
        Err(e) => admin_error(e),
    }
}

/// Create-wallet-address request body
#[derive(Debug, Deserialize)]
pub struct CreateWalletAddressRequest {
    /// Public payment pointer URL
    pub url: String,
    /// Asset of the wallet address
    #[serde(rename = "assetId")]
    pub asset_id: String,
    /// Display name
    #[serde(rename = "publicName")]
    pub public_name: Option<String>,
}

/// Create a wallet address
pub async fn create_wallet_address(
    State(state): State<ApiState>,
    axum::Json(req): axum::Json<CreateWalletAddressRequest>,
) -> Reply<WalletAddressModel> {
    match state
        .admin
        .create_wallet_address(&req.url, &req.asset_id, req.public_name.as_deref())
        .await
    {
        Ok(wallet) => ok(wallet),
        Err(e) => admin_error(e),
    }
}

/// Get a wallet address
pub async fn get_wallet_address(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Reply<WalletAddressModel> {
    match WalletAddressQueries::new(&state.db).get_by_id(&id).await {
        Ok(Some(wallet)) => ok(wallet),
        Ok(None) => fail(
            StatusCode::NOT_FOUND,
            "UnknownWalletAddress",
            "unknown wallet address",
        ),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, "Database", e.to_string()),
    }
}

/// Update-wallet-address request body
#[derive(Debug, Deserialize)]
pub struct UpdateWalletAddressRequest {
    /// New display name
    #[serde(rename = "publicName")]
    pub public_name: Option<String>,
    /// Deactivation time
    #[serde(rename = "deactivatedAt")]
    pub deactivated_at: Option<DateTime<Utc>>,
}

/// Update a wallet address
pub async fn update_wallet_address(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    axum::Json(req): axum::Json<UpdateWalletAddressRequest>,
) -> Reply<WalletAddressModel> {
    match state
        .admin
        .update_wallet_address(&id, req.public_name.as_deref(), req.deactivated_at)
        .await
    {
        Ok(wallet) => ok(wallet),
        Err(e) => admin_error(e),
    }
}

/// Trigger-events request body
#[derive(Debug, Deserialize)]
pub struct TriggerEventsRequest {
    /// Maximum wallet addresses to process
    pub limit: Option<u32>,
}

/// Run one wallet address withdrawal sweep on demand
pub async fn trigger_wallet_address_events(
    State(state): State<ApiState>,
    axum::Json(_req): axum::Json<TriggerEventsRequest>,
) -> Reply<serde_json::Value> {
    match state.workers.process_due_wallet_addresses().await {
        Ok(count) => ok(serde_json::json!({ "processed": count })),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, "Database", e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::AccountRegistry;

    async fn service() -> (AdminService, Ledger) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let ledger = Ledger::new(db.clone(), AccountRegistry::new());
        (AdminService::new(db, ledger.clone()), ledger)
    }

    #[tokio::test]
    async fn test_create_asset_provisions_accounts() {
        let (admin, ledger) = service().await;
        let asset = admin.create_asset("usd", 2, None).await.unwrap();
        assert_eq!(asset.code, "USD");

        // the asset liquidity account exists and can take deposits
        ledger.create_deposit("d1", &asset.id, 10).await.unwrap();
        assert_eq!(ledger.get_balance(&asset.id).await.unwrap(), 10);

        // duplicate (code, scale)
        assert_eq!(
            admin.create_asset("USD", 2, None).await,
            Err(AdminError::AlreadyExists)
        );
        // same code at another scale is a different asset
        admin.create_asset("USD", 9, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_peer_requires_asset_and_valid_prefix() {
        let (admin, _ledger) = service().await;
        assert_eq!(
            admin
                .create_peer("missing", "test.peer", None, "in", "out", "http://x", None)
                .await,
            Err(AdminError::UnknownAsset)
        );

        let asset = admin.create_asset("USD", 2, None).await.unwrap();
        assert!(matches!(
            admin
                .create_peer(&asset.id, "test..peer", None, "in", "out", "http://x", None)
                .await,
            Err(AdminError::Invalid(_))
        ));

        let peer = admin
            .create_peer(&asset.id, "test.peer", Some(1000), "in", "out", "http://x", None)
            .await
            .unwrap();
        assert_eq!(peer.max_packet_amount, Some(1000));

        admin.delete_peer(&peer.id).await.unwrap();
        assert_eq!(admin.delete_peer(&peer.id).await, Err(AdminError::UnknownPeer));
    }

    #[tokio::test]
    async fn test_wallet_address_lifecycle() {
        let (admin, _ledger) = service().await;
        let asset = admin.create_asset("USD", 2, None).await.unwrap();
        let wallet = admin
            .create_wallet_address("https://pay.example/alice/", &asset.id, Some("Alice"))
            .await
            .unwrap();
        // trailing slash trimmed
        assert_eq!(wallet.url, "https://pay.example/alice");
        assert!(wallet.is_active());

        let deactivated = admin
            .update_wallet_address(&wallet.id, None, Some(Utc::now() - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        assert!(!deactivated.is_active());
    }
}
