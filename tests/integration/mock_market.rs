//! Scripted market for integration testing.
//!
//! Provides a deterministic `MarketConnector` that fills every order at a
//! fixed share price and settles it with the next scripted outcome. All
//! state is in-memory; failures are injected from test code.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use updown::platforms::{ConnectorError, MarketConnector, OrderHandle, SettlementPoll};
use updown::types::{Direction, Outcome};

struct Order {
    handle: OrderHandle,
    outcome: Outcome,
}

pub struct ScriptedMarket {
    script: Mutex<VecDeque<Outcome>>,
    orders: Mutex<HashMap<String, Order>>,
    fill_price: Decimal,
    listed: AtomicBool,
    auth_failure: AtomicBool,
    /// While set, every settlement query reports pending.
    hold: AtomicBool,
    /// Submissions to fail with a transient error before reaching the book.
    outages: AtomicU32,
    /// Submissions to accept and then report as transient failures.
    lost_acks: AtomicU32,
    submit_calls: AtomicU32,
    polls: AtomicU32,
}

impl ScriptedMarket {
    /// Every order wins unless outcomes are scripted.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            orders: Mutex::new(HashMap::new()),
            fill_price: dec!(0.50),
            listed: AtomicBool::new(true),
            auth_failure: AtomicBool::new(false),
            hold: AtomicBool::new(false),
            outages: AtomicU32::new(0),
            lost_acks: AtomicU32::new(0),
            submit_calls: AtomicU32::new(0),
            polls: AtomicU32::new(0),
        }
    }

    /// Outcomes for the next orders, in submission order.
    pub fn with_outcomes(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        let market = Self::new();
        market.script.lock().unwrap().extend(outcomes);
        market
    }

    pub fn hold_settlements(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    pub fn fail_next_submits(&self, n: u32) {
        self.outages.store(n, Ordering::SeqCst);
    }

    pub fn lose_next_acks(&self, n: u32) {
        self.lost_acks.store(n, Ordering::SeqCst);
    }

    pub fn fail_auth(&self, fail: bool) {
        self.auth_failure.store(fail, Ordering::SeqCst);
    }

    pub fn delist(&self) {
        self.listed.store(false, Ordering::SeqCst);
    }

    /// Put an order on the book directly, as a previous process would have.
    pub fn place(&self, client_order_id: &str, direction: Direction, size: Decimal) -> OrderHandle {
        let mut orders = self.orders.lock().unwrap();
        if let Some(existing) = orders.get(client_order_id) {
            return existing.handle.clone();
        }
        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Outcome::Win);
        let handle = OrderHandle {
            order_id: format!("mk-{}", orders.len() + 1),
            client_order_id: client_order_id.to_string(),
            direction,
            size,
            fill_price: self.fill_price,
            placed_at: Utc::now(),
        };
        orders.insert(
            client_order_id.to_string(),
            Order {
                handle: handle.clone(),
                outcome,
            },
        );
        handle
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }

    pub fn submit_calls(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

/// Decrement `counter` if positive. True if it was.
fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl MarketConnector for ScriptedMarket {
    async fn market_exists(&self) -> Result<bool, ConnectorError> {
        Ok(self.listed.load(Ordering::SeqCst))
    }

    async fn submit(
        &self,
        direction: Direction,
        size: Decimal,
        client_order_id: &str,
    ) -> Result<OrderHandle, ConnectorError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if self.auth_failure.load(Ordering::SeqCst) {
            return Err(ConnectorError::Auth("scripted credential failure".into()));
        }
        if take(&self.outages) {
            return Err(ConnectorError::Transient("scripted outage".into()));
        }
        let handle = self.place(client_order_id, direction, size);
        if take(&self.lost_acks) {
            return Err(ConnectorError::Transient("acknowledgement lost".into()));
        }
        Ok(handle)
    }

    async fn poll_settlement(&self, handle: &OrderHandle) -> Result<SettlementPoll, ConnectorError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.hold.load(Ordering::SeqCst) {
            return Ok(SettlementPoll::Pending);
        }
        let orders = self.orders.lock().unwrap();
        orders
            .values()
            .find(|o| o.handle.order_id == handle.order_id)
            .map(|o| SettlementPoll::Resolved(o.outcome))
            .ok_or_else(|| ConnectorError::NotFound(handle.order_id.clone()))
    }

    async fn find_order(&self, client_order_id: &str) -> Result<Option<OrderHandle>, ConnectorError> {
        if self.auth_failure.load(Ordering::SeqCst) {
            return Err(ConnectorError::Auth("scripted credential failure".into()));
        }
        Ok(self
            .orders
            .lock()
            .unwrap()
            .get(client_order_id)
            .map(|o| o.handle.clone()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submit_is_idempotent() {
        let market = ScriptedMarket::new();
        let a = market.submit(Direction::Up, dec!(5), "c1").await.unwrap();
        let b = market.submit(Direction::Up, dec!(5), "c1").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(market.order_count(), 1);
    }

    #[tokio::test]
    async fn test_scripted_outcomes_in_order() {
        let market = ScriptedMarket::with_outcomes([Outcome::Loss, Outcome::Win]);
        let a = market.submit(Direction::Up, dec!(5), "a").await.unwrap();
        let b = market.submit(Direction::Up, dec!(5), "b").await.unwrap();
        assert_eq!(
            market.poll_settlement(&a).await.unwrap(),
            SettlementPoll::Resolved(Outcome::Loss)
        );
        assert_eq!(
            market.poll_settlement(&b).await.unwrap(),
            SettlementPoll::Resolved(Outcome::Win)
        );
    }

    #[tokio::test]
    async fn test_lost_ack_still_books_order() {
        let market = ScriptedMarket::new();
        market.lose_next_acks(1);
        assert!(market.submit(Direction::Down, dec!(5), "c1").await.is_err());
        assert!(market.find_order("c1").await.unwrap().is_some());
    }
}
