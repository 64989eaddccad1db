//! Market connectors.
//!
//! Defines the `MarketConnector` trait the orchestrator trades through and
//! provides two implementations:
//! - Paper: simulated fills settled against the live price feed (dry run)
//! - Gateway: JSON-over-HTTP client for a venue order gateway

pub mod gateway;
pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{Direction, Outcome, Position};

/// Venue acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderHandle {
    pub order_id: String,
    pub client_order_id: String,
    pub direction: Direction,
    pub size: Decimal,
    /// Share price the order filled at, in (0, 1).
    pub fill_price: Decimal,
    pub placed_at: DateTime<Utc>,
}

impl OrderHandle {
    /// Rebuild a handle from a persisted position. `None` until the venue
    /// has acknowledged the order.
    pub fn from_position(position: &Position) -> Option<Self> {
        let order_id = position.external_order_id.clone()?;
        Some(Self {
            order_id,
            client_order_id: position.client_order_id.clone(),
            direction: position.direction,
            size: position.size,
            fill_price: position.entry_price,
            placed_at: position.opened_at,
        })
    }
}

/// Result of a single settlement query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementPoll {
    Pending,
    Resolved(Outcome),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    /// Credentials rejected. Fatal for the run.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The venue refused the request. Retrying will not help.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Network trouble, throttling or a venue-side fault.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl ConnectorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectorError::Transient(_))
    }
}

/// Boundary to the counterparty market.
///
/// Every call is a fallible network operation; retry policy lives in the
/// executor, not in implementations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketConnector: Send + Sync {
    /// Whether the configured market is listed and open.
    async fn market_exists(&self) -> Result<bool, ConnectorError>;

    /// Place an order. `client_order_id` is an idempotency key: submitting
    /// the same key twice must not open a second position.
    async fn submit(
        &self,
        direction: Direction,
        size: Decimal,
        client_order_id: &str,
    ) -> Result<OrderHandle, ConnectorError>;

    /// One settlement query, no waiting.
    async fn poll_settlement(&self, handle: &OrderHandle) -> Result<SettlementPoll, ConnectorError>;

    /// Look up an order by its idempotency key.
    async fn find_order(&self, client_order_id: &str) -> Result<Option<OrderHandle>, ConnectorError>;

    /// Connector name for logging.
    fn name(&self) -> &str;
}
