//! Paper-trading connector.
//!
//! Fills every order at a fixed share price and settles it against the
//! live price feed: once the interval has elapsed, UP wins if the price is
//! strictly above the price at submission, DOWN wins otherwise. Lets the
//! full loop run without a venue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use super::{ConnectorError, MarketConnector, OrderHandle, SettlementPoll};
use crate::feed::FeedSnapshot;
use crate::types::{Direction, Outcome};

const CONNECTOR_NAME: &str = "paper";

#[derive(Debug, Clone)]
struct PaperOrder {
    handle: OrderHandle,
    open_price: f64,
    settles_at: DateTime<Utc>,
    outcome: Option<Outcome>,
}

pub struct PaperConnector {
    feed: watch::Receiver<FeedSnapshot>,
    fill_price: Decimal,
    settle_after: chrono::Duration,
    max_price_age: chrono::Duration,
    orders: Mutex<HashMap<String, PaperOrder>>,
}

impl PaperConnector {
    pub fn new(
        feed: watch::Receiver<FeedSnapshot>,
        fill_price: Decimal,
        settle_after: chrono::Duration,
        max_price_age: chrono::Duration,
    ) -> Self {
        Self {
            feed,
            fill_price,
            settle_after,
            max_price_age,
            orders: Mutex::new(HashMap::new()),
        }
    }

    fn current_price(&self, now: DateTime<Utc>) -> Option<f64> {
        let snapshot = self.feed.borrow();
        snapshot
            .fresh_price(now, self.max_price_age)
            .map(|s| s.price)
    }
}

/// UP needs a strictly higher price; anything else pays DOWN.
pub fn settle(direction: Direction, open_price: f64, close_price: f64) -> Outcome {
    let went_up = close_price > open_price;
    match (direction, went_up) {
        (Direction::Up, true) | (Direction::Down, false) => Outcome::Win,
        _ => Outcome::Loss,
    }
}

#[async_trait]
impl MarketConnector for PaperConnector {
    async fn market_exists(&self) -> Result<bool, ConnectorError> {
        Ok(true)
    }

    async fn submit(
        &self,
        direction: Direction,
        size: Decimal,
        client_order_id: &str,
    ) -> Result<OrderHandle, ConnectorError> {
        let mut orders = self.orders.lock().await;
        if let Some(existing) = orders.get(client_order_id) {
            return Ok(existing.handle.clone());
        }

        let now = Utc::now();
        let open_price = self
            .current_price(now)
            .ok_or_else(|| ConnectorError::Transient("no fresh price to fill against".into()))?;

        let handle = OrderHandle {
            order_id: format!("paper-{}", uuid::Uuid::new_v4()),
            client_order_id: client_order_id.to_string(),
            direction,
            size,
            fill_price: self.fill_price,
            placed_at: now,
        };
        info!(
            order_id = %handle.order_id,
            direction = %direction,
            size = %size,
            open_price,
            "Paper order filled"
        );
        orders.insert(
            client_order_id.to_string(),
            PaperOrder {
                handle: handle.clone(),
                open_price,
                settles_at: now + self.settle_after,
                outcome: None,
            },
        );
        Ok(handle)
    }

    async fn poll_settlement(&self, handle: &OrderHandle) -> Result<SettlementPoll, ConnectorError> {
        let mut orders = self.orders.lock().await;
        let order = orders
            .get_mut(&handle.client_order_id)
            .ok_or_else(|| ConnectorError::NotFound(handle.order_id.clone()))?;

        if let Some(outcome) = order.outcome {
            return Ok(SettlementPoll::Resolved(outcome));
        }
        let now = Utc::now();
        if now < order.settles_at {
            return Ok(SettlementPoll::Pending);
        }
        let Some(close_price) = self.current_price(now) else {
            debug!(order_id = %handle.order_id, "No fresh price to settle against yet");
            return Ok(SettlementPoll::Pending);
        };

        let outcome = settle(order.handle.direction, order.open_price, close_price);
        order.outcome = Some(outcome);
        info!(
            order_id = %handle.order_id,
            open_price = order.open_price,
            close_price,
            outcome = %outcome,
            "Paper order settled"
        );
        Ok(SettlementPoll::Resolved(outcome))
    }

    async fn find_order(&self, client_order_id: &str) -> Result<Option<OrderHandle>, ConnectorError> {
        let orders = self.orders.lock().await;
        Ok(orders.get(client_order_id).map(|o| o.handle.clone()))
    }

    fn name(&self) -> &str {
        CONNECTOR_NAME
    }
}
