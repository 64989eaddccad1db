//! Trade executor.
//!
//! Wraps the market connector with the run's retry and polling policy:
//! bounded exponential backoff around submission, a bounded settlement
//! poll loop, and the reconciliation query used at startup and at the end
//! of a run. Every wait selects on shutdown.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ExecutionConfig;
use crate::platforms::{ConnectorError, MarketConnector, OrderHandle, SettlementPoll};
use crate::shutdown::Shutdown;
use crate::types::{Direction, Outcome, Position, UpdownError};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// How the settlement wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementResult {
    Resolved(Outcome),
    /// Not observed within `settlement_timeout_secs` of the close.
    TimedOut,
    /// Shutdown arrived first.
    Interrupted,
}

/// Outcome of reconciling a persisted position with the venue.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Resolved { handle: OrderHandle, outcome: Outcome },
    /// Still unresolved. Carries the handle when the venue knows the order.
    Pending(Option<OrderHandle>),
    /// The venue has no order under this idempotency key.
    NeverPlaced,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    connector: Arc<dyn MarketConnector>,
    config: ExecutionConfig,
}

impl Executor {
    pub fn new(connector: Arc<dyn MarketConnector>, config: ExecutionConfig) -> Self {
        Self { connector, config }
    }

    pub fn connector(&self) -> &dyn MarketConnector {
        self.connector.as_ref()
    }

    /// Delay before retry `n` (1-based). The last configured entry repeats.
    fn backoff(&self, retry: u32) -> Duration {
        let delays = &self.config.submit_backoff_secs;
        let idx = (retry as usize).saturating_sub(1).min(delays.len().saturating_sub(1));
        Duration::from_secs(delays.get(idx).copied().unwrap_or(0))
    }

    /// Submit with bounded retries on transient failures.
    ///
    /// Auth failures are fatal; rejections and exhausted retries skip the
    /// cycle. The idempotency key makes a retry after a lost response safe.
    pub async fn submit(
        &self,
        direction: Direction,
        size: Decimal,
        client_order_id: &str,
        shutdown: &mut Shutdown,
    ) -> Result<OrderHandle, UpdownError> {
        let retries = self.config.submit_retries;
        let mut last_error = None;

        for attempt in 0..=retries {
            if attempt > 0 {
                let delay = self.backoff(attempt);
                debug!(attempt, delay_secs = delay.as_secs(), "Retrying order submission");
                if !shutdown.sleep(delay).await {
                    return Err(UpdownError::SubmitFailed("interrupted by shutdown".into()));
                }
            }

            match self.connector.submit(direction, size, client_order_id).await {
                Ok(handle) => {
                    info!(
                        order_id = %handle.order_id,
                        client_order_id,
                        direction = %direction,
                        size = %size,
                        attempt,
                        "Order submitted"
                    );
                    return Ok(handle);
                }
                Err(ConnectorError::Auth(msg)) => return Err(UpdownError::Auth(msg)),
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "Order submission failed, will retry");
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!(error = %e, "Order rejected");
                    return Err(UpdownError::SubmitFailed(e.to_string()));
                }
            }
        }

        Err(UpdownError::SubmitFailed(format!(
            "gave up after {} retries: {}",
            retries,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// One settlement query. Transient trouble reads as still pending.
    pub async fn poll_once(&self, handle: &OrderHandle) -> Result<SettlementPoll, UpdownError> {
        match self.connector.poll_settlement(handle).await {
            Ok(poll) => Ok(poll),
            Err(ConnectorError::Auth(msg)) => Err(UpdownError::Auth(msg)),
            Err(e) => {
                debug!(order_id = %handle.order_id, error = %e, "Settlement poll failed");
                Ok(SettlementPoll::Pending)
            }
        }
    }

    /// Wait for the interval to close at `close_at`, then poll until
    /// resolved or until `settlement_timeout_secs` past the close.
    pub async fn await_settlement(
        &self,
        handle: &OrderHandle,
        close_at: Instant,
        shutdown: &mut Shutdown,
    ) -> Result<SettlementResult, UpdownError> {
        let until_close = close_at.saturating_duration_since(Instant::now());
        debug!(order_id = %handle.order_id, wait_secs = until_close.as_secs(), "Waiting for settlement");
        if !shutdown.sleep(until_close).await {
            return Ok(SettlementResult::Interrupted);
        }

        let timeout = Duration::from_secs(self.config.settlement_timeout_secs);
        let resolved = self.poll_until(handle, timeout, shutdown).await?;
        Ok(match resolved {
            Some(outcome) => SettlementResult::Resolved(outcome),
            None if shutdown.is_triggered() => SettlementResult::Interrupted,
            None => {
                warn!(
                    order_id = %handle.order_id,
                    timeout_secs = timeout.as_secs(),
                    "Settlement not observed before timeout"
                );
                SettlementResult::TimedOut
            }
        })
    }

    /// Reconcile a persisted OPEN or UNKNOWN position within `budget`.
    /// A zero budget means a single query.
    pub async fn reconcile(
        &self,
        position: &Position,
        budget: Duration,
        shutdown: &mut Shutdown,
    ) -> Result<Reconciliation, UpdownError> {
        let handle = match OrderHandle::from_position(position) {
            Some(h) => h,
            None => match self.connector.find_order(&position.client_order_id).await {
                Ok(Some(h)) => {
                    info!(
                        client_order_id = %position.client_order_id,
                        order_id = %h.order_id,
                        "Found unacknowledged order at venue"
                    );
                    h
                }
                Ok(None) => return Ok(Reconciliation::NeverPlaced),
                Err(ConnectorError::Auth(msg)) => return Err(UpdownError::Auth(msg)),
                Err(e) => {
                    warn!(client_order_id = %position.client_order_id, error = %e, "Order lookup failed");
                    return Ok(Reconciliation::Pending(None));
                }
            },
        };

        Ok(match self.poll_until(&handle, budget, shutdown).await? {
            Some(outcome) => Reconciliation::Resolved { handle, outcome },
            None => Reconciliation::Pending(Some(handle)),
        })
    }

    /// Poll every `settlement_poll_secs` until resolved or `budget` spent.
    async fn poll_until(
        &self,
        handle: &OrderHandle,
        budget: Duration,
        shutdown: &mut Shutdown,
    ) -> Result<Option<Outcome>, UpdownError> {
        let every = Duration::from_secs(self.config.settlement_poll_secs.max(1));
        let deadline = Instant::now() + budget;
        loop {
            if let SettlementPoll::Resolved(outcome) = self.poll_once(handle).await? {
                return Ok(Some(outcome));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if !shutdown.sleep(every.min(deadline - now)).await {
                return Ok(None);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
