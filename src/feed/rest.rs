//! Pull-based fallback price sources.
//!
//! Each source answers `latest_price()` with a single REST call. Used in
//! priority order when the stream cannot be restored.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{PriceQuote, PriceSource};
use crate::config::FallbackSourceConfig;

const REQUEST_TIMEOUT_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BinanceTicker {
    price: String,
}

#[derive(Debug, Deserialize)]
struct CoinbaseSpot {
    data: CoinbaseAmount,
}

#[derive(Debug, Deserialize)]
struct CoinbaseAmount {
    amount: String,
}

/// Response layout of a REST source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestFormat {
    /// `{"symbol":"BTCUSDT","price":"43000.12"}`
    Binance,
    /// `{"data":{"base":"BTC","currency":"USD","amount":"43000.12"}}`
    Coinbase,
}

impl RestFormat {
    pub fn parse(&self, body: &str) -> Result<f64> {
        let raw = match self {
            RestFormat::Binance => {
                serde_json::from_str::<BinanceTicker>(body)
                    .context("Failed to parse Binance ticker")?
                    .price
            }
            RestFormat::Coinbase => {
                serde_json::from_str::<CoinbaseSpot>(body)
                    .context("Failed to parse Coinbase spot price")?
                    .data
                    .amount
            }
        };
        let price: f64 = raw
            .trim()
            .parse()
            .with_context(|| format!("Price is not a number: {raw}"))?;
        if !price.is_finite() || price <= 0.0 {
            anyhow::bail!("Price out of range: {price}");
        }
        Ok(price)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct RestPriceSource {
    http: Client,
    name: String,
    url: String,
    format: RestFormat,
}

impl RestPriceSource {
    pub fn new(name: &str, url: &str, format: RestFormat) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build price source HTTP client")?;
        Ok(Self {
            http,
            name: name.to_string(),
            url: url.to_string(),
            format,
        })
    }

    pub fn from_config(cfg: &FallbackSourceConfig) -> Result<Self> {
        let format = match cfg.kind.as_str() {
            "binance" => RestFormat::Binance,
            "coinbase" => RestFormat::Coinbase,
            other => anyhow::bail!("Unknown fallback price source kind: {other}"),
        };
        Self::new(&cfg.kind, &cfg.url, format)
    }
}

#[async_trait]
impl PriceSource for RestPriceSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn latest_price(&self) -> Result<PriceQuote> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("{} price request failed", self.name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("{} price API error {status}: {body}", self.name);
        }

        let body = resp.text().await.context("Failed to read price response")?;
        let price = self.format.parse(&body)?;
        debug!(source = %self.name, price, "Fallback price fetched");

        Ok(PriceQuote {
            price,
            timestamp: Utc::now(),
        })
    }
}

/// Build the configured fallback chain, preserving priority order.
pub fn build_fallbacks(configs: &[FallbackSourceConfig]) -> Result<Vec<Box<dyn PriceSource>>> {
    configs
        .iter()
        .map(|c| RestPriceSource::from_config(c).map(|s| Box::new(s) as Box<dyn PriceSource>))
        .collect()
}
