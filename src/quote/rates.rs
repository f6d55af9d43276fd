//! Exchange rate lookup
//!
//! Queries the external rates service and caches the returned sheet for
//! the configured lifetime. Rates are quoted against a base currency; the
//! pairwise rate is derived from the two per-currency entries.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::config::RatesConfig;

/// A fetched rate sheet
#[derive(Debug, Clone, serde::Deserialize)]
struct RateSheet {
    /// Base currency code
    base: String,
    /// Units of each currency per one unit of base
    rates: HashMap<String, f64>,
}

impl RateSheet {
    fn rate(&self, from: &str, to: &str) -> Option<f64> {
        let lookup = |code: &str| {
            if code == self.base {
                Some(1.0)
            } else {
                self.rates.get(code).copied()
            }
        };
        let from_rate = lookup(from)?;
        let to_rate = lookup(to)?;
        if from_rate <= 0.0 || to_rate <= 0.0 {
            return None;
        }
        Some(to_rate / from_rate)
    }
}

/// Cached exchange rate client
pub struct RateService {
    api_url: String,
    lifetime: Duration,
    client: reqwest::Client,
    cache: Mutex<Option<(Instant, RateSheet)>>,
    static_sheet: Option<RateSheet>,
}

impl std::fmt::Debug for RateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateService")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

impl RateService {
    /// Create a rate service from configuration
    pub fn new(config: &RatesConfig) -> Self {
        Self {
            api_url: config.exchange_rates_url.clone(),
            lifetime: Duration::from_millis(config.exchange_rates_lifetime_ms),
            client: reqwest::Client::new(),
            cache: Mutex::new(None),
            static_sheet: None,
        }
    }

    /// Create a service with a fixed rate sheet, bypassing the network.
    /// Useful for single-currency deployments and tests.
    pub fn with_rates(base: impl Into<String>, rates: HashMap<String, f64>) -> Self {
        Self {
            api_url: String::new(),
            lifetime: Duration::from_secs(0),
            client: reqwest::Client::new(),
            cache: Mutex::new(None),
            static_sheet: Some(RateSheet {
                base: base.into(),
                rates,
            }),
        }
    }

    /// Exchange rate from one currency code to another, at identical scale
    pub async fn rate(&self, from: &str, to: &str) -> anyhow::Result<f64> {
        if from == to {
            return Ok(1.0);
        }
        if let Some(sheet) = &self.static_sheet {
            return sheet
                .rate(from, to)
                .ok_or_else(|| anyhow::anyhow!("no rate for {} -> {}", from, to));
        }

        let mut cache = self.cache.lock().await;
        let fresh = matches!(&*cache, Some((at, _)) if at.elapsed() < self.lifetime);
        if !fresh {
            let sheet = self.fetch().await?;
            *cache = Some((Instant::now(), sheet));
        }
        let (_, sheet) = cache.as_ref().expect("cache was just filled");
        sheet
            .rate(from, to)
            .ok_or_else(|| anyhow::anyhow!("no rate for {} -> {}", from, to))
    }

    async fn fetch(&self) -> anyhow::Result<RateSheet> {
        debug!("Fetching exchange rates from {}...", self.api_url);

        let response = self
            .client
            .get(&self.api_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| {
                error!("Failed to fetch exchange rates: {}", e);
                anyhow::anyhow!("Failed to fetch exchange rates: {}", e)
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!("Rates API returned error: {} - {}", status, text);
            return Err(anyhow::anyhow!(
                "Rates API returned error: {} - {}",
                status,
                text
            ));
        }

        let sheet: RateSheet = response.json().await.map_err(|e| {
            error!("Failed to parse rates response: {}", e);
            anyhow::anyhow!("Failed to parse rates response: {}", e)
        })?;

        debug!(
            "Fetched {} rates against base {}",
            sheet.rates.len(),
            sheet.base
        );
        Ok(sheet)
    }
}
