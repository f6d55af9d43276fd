//! Authorization server grant cache
//!
//! Remote Open Payments calls carry grant-issued access tokens. Grants are
//! cached per (auth server, access type, actions); an expired grant is
//! rotated through its management URL. A failed rotation evicts the entry
//! and the lookup yields nothing, so callers observe the same result until
//! a fresh request path asks for a new grant.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;

/// Cache key: one grant per (auth server, type, actions) tuple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GrantKey {
    /// Authorization server grant endpoint
    pub auth_server: String,
    /// Access type (e.g. "incoming-payment")
    pub access_type: String,
    /// Sorted access actions
    pub actions: Vec<String>,
}

impl GrantKey {
    /// Build a key with normalized action order
    pub fn new(auth_server: &str, access_type: &str, actions: &[&str]) -> Self {
        let mut actions: Vec<String> = actions.iter().map(|a| a.to_string()).collect();
        actions.sort();
        Self {
            auth_server: auth_server.to_string(),
            access_type: access_type.to_string(),
            actions,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedGrant {
    access_token: String,
    manage_url: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedGrant {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if at <= Utc::now())
    }
}

#[derive(Debug, Deserialize)]
struct GrantResponse {
    access_token: GrantAccessToken,
}

#[derive(Debug, Deserialize)]
struct GrantAccessToken {
    value: String,
    #[serde(default)]
    manage: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Client-side grant store for remote Open Payments access
pub struct GrantCache {
    config: Arc<Config>,
    http: reqwest::Client,
    cache: Mutex<HashMap<GrantKey, CachedGrant>>,
}

impl std::fmt::Debug for GrantCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantCache").finish_non_exhaustive()
    }
}

impl GrantCache {
    /// Create the cache
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Access token for the key: cached, rotated, or freshly requested
    pub async fn get(&self, key: GrantKey) -> Option<String> {
        let mut cache = self.cache.lock().await;
        if let Some(grant) = cache.get(&key) {
            if !grant.is_expired() {
                return Some(grant.access_token.clone());
            }
            // expired: rotate through the management URL or evict
            let rotated = match &grant.manage_url {
                Some(manage_url) => self.rotate(manage_url, &grant.access_token).await,
                None => None,
            };
            return match rotated {
                Some(rotated) => {
                    let token = rotated.access_token.clone();
                    cache.insert(key, rotated);
                    Some(token)
                }
                None => {
                    warn!(
                        "Grant rotation failed for {} ({}), evicting",
                        key.auth_server, key.access_type
                    );
                    cache.remove(&key);
                    None
                }
            };
        }

        let granted = self.request(&key).await?;
        let token = granted.access_token.clone();
        cache.insert(key, granted);
        Some(token)
    }

    /// Drop a cached grant (e.g. after the server rejected its token)
    pub async fn evict(&self, key: &GrantKey) {
        self.cache.lock().await.remove(key);
    }

    async fn request(&self, key: &GrantKey) -> Option<CachedGrant> {
        debug!(
            "Requesting grant from {} for type {}",
            key.auth_server, key.access_type
        );
        let body = serde_json::json!({
            "access_token": {
                "access": [{
                    "type": key.access_type,
                    "actions": key.actions,
                }]
            },
            "client": self.config.node.wallet_address_url,
        });
        let response = self
            .http
            .post(&key.auth_server)
            .timeout(std::time::Duration::from_secs(10))
            .header("Key-Id", &self.config.node.key_id)
            .json(&body)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            warn!(
                "Grant request to {} failed with {}",
                key.auth_server,
                response.status()
            );
            return None;
        }
        let grant: GrantResponse = response.json().await.ok()?;
        Some(Self::cache_entry(grant))
    }

    async fn rotate(&self, manage_url: &str, token: &str) -> Option<CachedGrant> {
        debug!("Rotating grant via {}", manage_url);
        let response = self
            .http
            .post(manage_url)
            .timeout(std::time::Duration::from_secs(10))
            .header("Authorization", format!("GNAP {}", token))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let grant: GrantResponse = response.json().await.ok()?;
        Some(Self::cache_entry(grant))
    }

    fn cache_entry(grant: GrantResponse) -> CachedGrant {
        CachedGrant {
            access_token: grant.access_token.value,
            manage_url: grant.access_token.manage,
            expires_at: grant
                .access_token
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs as i64)),
        }
    }
}
