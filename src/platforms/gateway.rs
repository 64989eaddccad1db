//! HTTP order gateway connector.
//!
//! Thin JSON-over-HTTP adapter for a venue gateway:
//! - `GET  /markets/{slug}`                 market lookup
//! - `POST /orders`                          place an order
//! - `GET  /orders/{id}`                     order status
//! - `GET  /orders?client_order_id={id}`     lookup by idempotency key
//!
//! Auth: `Authorization: Bearer {key}`, key resolved from the environment.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ConnectorError, MarketConnector, OrderHandle, SettlementPoll};
use crate::config::MarketConfig;
use crate::types::{Direction, Outcome};

const CONNECTOR_NAME: &str = "gateway";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MarketResponse {
    #[serde(default)]
    active: bool,
}

#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    market: &'a str,
    side: &'static str,
    size: Decimal,
    client_order_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    client_order_id: String,
    side: String,
    size: Decimal,
    price: Decimal,
    created_at: DateTime<Utc>,
    /// "open" | "won" | "lost"
    #[serde(default)]
    status: String,
}

impl OrderResponse {
    /// A fill must be a share price in (0, 1) for a positive size.
    fn into_handle(self) -> Result<OrderHandle, ConnectorError> {
        let direction = parse_side(&self.side)?;
        if self.price <= Decimal::ZERO || self.price >= Decimal::ONE {
            return Err(ConnectorError::Rejected(format!(
                "order {} filled at {}, outside (0, 1)",
                self.id, self.price
            )));
        }
        if self.size <= Decimal::ZERO {
            return Err(ConnectorError::Rejected(format!(
                "order {} has non-positive size {}",
                self.id, self.size
            )));
        }
        Ok(OrderHandle {
            order_id: self.id,
            client_order_id: self.client_order_id,
            direction,
            size: self.size,
            fill_price: self.price,
            placed_at: self.created_at,
        })
    }

    fn settlement(&self) -> SettlementPoll {
        match self.status.as_str() {
            "won" => SettlementPoll::Resolved(Outcome::Win),
            "lost" => SettlementPoll::Resolved(Outcome::Loss),
            _ => SettlementPoll::Pending,
        }
    }
}

fn side_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Up => "up",
        Direction::Down => "down",
    }
}

fn parse_side(side: &str) -> Result<Direction, ConnectorError> {
    match side.to_ascii_lowercase().as_str() {
        "up" => Ok(Direction::Up),
        "down" => Ok(Direction::Down),
        other => Err(ConnectorError::Rejected(format!("unknown order side '{other}'"))),
    }
}

/// Map an HTTP status to the connector error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> ConnectorError {
    let msg = format!("{status}: {body}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ConnectorError::Auth(msg),
        StatusCode::NOT_FOUND => ConnectorError::NotFound(msg),
        StatusCode::TOO_MANY_REQUESTS => ConnectorError::Transient(msg),
        s if s.is_server_error() => ConnectorError::Transient(msg),
        _ => ConnectorError::Rejected(msg),
    }
}

fn transport(e: reqwest::Error) -> ConnectorError {
    ConnectorError::Transient(e.to_string())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct GatewayConnector {
    http: Client,
    base_url: String,
    market_slug: String,
    api_key: SecretString,
}

impl GatewayConnector {
    pub fn new(base_url: &str, market_slug: &str, api_key: SecretString) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .user_agent(concat!("UPDOWN/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client for order gateway")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            market_slug: market_slug.to_string(),
            api_key,
        })
    }

    /// Build from config, resolving the API key from the environment.
    pub fn from_config(config: &MarketConfig) -> Result<Self> {
        let key = crate::config::AppConfig::resolve_env(&config.api_key_env)?;
        Self::new(&config.base_url, &config.market_slug, SecretString::new(key))
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key.expose_secret())
    }

    async fn check(resp: Response) -> Result<Response, ConnectorError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, ConnectorError> {
        debug!(url = %url, "Gateway GET");
        let resp = self
            .http
            .get(url)
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(transport)?;
        Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| ConnectorError::Transient(format!("malformed response: {e}")))
    }
}

#[async_trait]
impl MarketConnector for GatewayConnector {
    async fn market_exists(&self) -> Result<bool, ConnectorError> {
        let url = format!(
            "{}/markets/{}",
            self.base_url,
            urlencoding::encode(&self.market_slug)
        );
        match self.get_json::<MarketResponse>(&url).await {
            Ok(m) => Ok(m.active),
            Err(ConnectorError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn submit(
        &self,
        direction: Direction,
        size: Decimal,
        client_order_id: &str,
    ) -> Result<OrderHandle, ConnectorError> {
        let body = OrderRequest {
            market: &self.market_slug,
            side: side_str(direction),
            size,
            client_order_id,
        };
        let resp = self
            .http
            .post(format!("{}/orders", self.base_url))
            .header("Authorization", self.bearer())
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let order: OrderResponse = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| ConnectorError::Transient(format!("malformed order response: {e}")))?;

        let handle = order.into_handle()?;
        info!(
            order_id = %handle.order_id,
            direction = %direction,
            size = %size,
            price = %handle.fill_price,
            "Gateway order placed"
        );
        Ok(handle)
    }

    async fn poll_settlement(&self, handle: &OrderHandle) -> Result<SettlementPoll, ConnectorError> {
        let url = format!(
            "{}/orders/{}",
            self.base_url,
            urlencoding::encode(&handle.order_id)
        );
        let order: OrderResponse = self.get_json(&url).await?;
        Ok(order.settlement())
    }

    async fn find_order(&self, client_order_id: &str) -> Result<Option<OrderHandle>, ConnectorError> {
        let url = format!(
            "{}/orders?client_order_id={}",
            self.base_url,
            urlencoding::encode(client_order_id)
        );
        let orders: Vec<OrderResponse> = match self.get_json(&url).await {
            Ok(o) => o,
            Err(ConnectorError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        orders
            .into_iter()
            .find(|o| o.client_order_id == client_order_id)
            .map(OrderResponse::into_handle)
            .transpose()
    }

    fn name(&self) -> &str {
        CONNECTOR_NAME
    }
}
