//! Price feed adapter.
//!
//! Runs as one background task, independent of the cycle clock. Prefers a
//! streaming source, reconnecting with capped exponential backoff; when the
//! stream cannot be restored it polls the REST fallbacks in priority order,
//! re-probing the stream periodically. Every price passes an anomaly filter
//! before it reaches the indicator buffer.
//!
//! The task is the only writer of the latest `FeedSnapshot`; the
//! orchestrator reads it through a `watch::Receiver` and never waits on
//! the network.

pub mod rest;
pub mod stream;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{FeedConfig, IndicatorConfig};
use crate::indicators::{IndicatorEngine, IndicatorSnapshot, InsufficientData};
use crate::shutdown::Shutdown;
use crate::types::PriceSample;

// ---------------------------------------------------------------------------
// Source contracts
// ---------------------------------------------------------------------------

/// A price observation from any source, before filtering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceQuote {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Pull-based source: one request, one price.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;

    async fn latest_price(&self) -> Result<PriceQuote>;
}

/// Push-based source. Each `connect` opens a fresh session that yields
/// quotes until it errors or ends.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn connect(&self) -> Result<BoxStream<'static, Result<PriceQuote>>>;
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    Connecting,
    Streaming,
    Polling,
    /// Stream down and every fallback failed on the last poll.
    Unavailable,
}

/// What the orchestrator sees of the feed. Immutable once published.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    /// Most recent accepted price, at its own timestamp.
    pub latest: Option<PriceSample>,
    pub indicators: Result<IndicatorSnapshot, InsufficientData>,
    /// Buffered prices, oldest first.
    pub prices: Arc<[f64]>,
    pub mode: FeedMode,
    pub rejected: u64,
}

impl FeedSnapshot {
    pub fn empty(need: usize) -> Self {
        Self {
            latest: None,
            indicators: Err(InsufficientData { have: 0, need }),
            prices: Arc::from(Vec::new()),
            mode: FeedMode::Connecting,
            rejected: 0,
        }
    }

    /// The latest price if it is no older than `max_age`.
    pub fn fresh_price(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> Option<&PriceSample> {
        self.latest
            .as_ref()
            .filter(|s| now - s.timestamp <= max_age)
    }
}

// ---------------------------------------------------------------------------
// Anomaly filter
// ---------------------------------------------------------------------------

/// Consecutive rejected prices, each within the threshold of the first,
/// after which the filter takes them as the new level.
pub const REANCHOR_AFTER: u32 = 5;

/// Drops a price whose relative move from the last accepted price exceeds
/// the ceiling. Rejected prices are not substituted.
///
/// A genuine re-price (for example across a stream outage) shows up as a
/// run of rejections that agree with each other; after `REANCHOR_AFTER`
/// of them the filter re-anchors on the new level.
#[derive(Debug, Clone)]
pub struct AnomalyFilter {
    threshold: f64,
    last_accepted: Option<f64>,
    /// First rejected price of the current run and the run's length.
    pending: Option<(f64, u32)>,
}

impl AnomalyFilter {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            last_accepted: None,
            pending: None,
        }
    }

    fn within(&self, from: f64, to: f64) -> bool {
        ((to - from) / from).abs() <= self.threshold
    }

    /// Returns true and remembers the price if it is accepted.
    pub fn accept(&mut self, price: f64) -> bool {
        if !price.is_finite() || price <= 0.0 {
            return false;
        }
        let Some(last) = self.last_accepted else {
            self.last_accepted = Some(price);
            return true;
        };
        if self.within(last, price) {
            self.pending = None;
            self.last_accepted = Some(price);
            return true;
        }

        let (anchor, run) = match self.pending {
            Some((anchor, run)) if self.within(anchor, price) => (anchor, run + 1),
            _ => (price, 1),
        };
        if run >= REANCHOR_AFTER {
            warn!(
                from = last,
                to = price,
                samples = run,
                "Sustained price level outside anomaly threshold, re-anchoring"
            );
            self.pending = None;
            self.last_accepted = Some(price);
            return true;
        }
        self.pending = Some((anchor, run));
        false
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Single writer of the feed snapshot.
pub struct FeedPublisher {
    engine: IndicatorEngine,
    filter: AnomalyFilter,
    spacing: chrono::Duration,
    latest: Option<PriceSample>,
    mode: FeedMode,
    rejected: u64,
    tx: watch::Sender<FeedSnapshot>,
}

impl FeedPublisher {
    pub fn new(
        indicators: &IndicatorConfig,
        anomaly_threshold: f64,
    ) -> (Self, watch::Receiver<FeedSnapshot>) {
        let engine = IndicatorEngine::new(indicators);
        let (tx, rx) = watch::channel(FeedSnapshot::empty(engine.warmup()));
        let spacing = chrono::Duration::seconds(indicators.sample_interval_secs as i64);
        (
            Self {
                engine,
                filter: AnomalyFilter::new(anomaly_threshold),
                spacing,
                latest: None,
                mode: FeedMode::Connecting,
                rejected: 0,
                tx,
            },
            rx,
        )
    }

    /// Filter a quote and, if accepted, fold it in and publish.
    pub fn ingest(&mut self, quote: PriceQuote, source: &str) -> bool {
        if !self.filter.accept(quote.price) {
            self.rejected += 1;
            warn!(
                source,
                price = quote.price,
                last = ?self.latest.as_ref().map(|s| s.price),
                "Price rejected by anomaly filter"
            );
            self.publish();
            return false;
        }

        let sample = PriceSample {
            timestamp: quote.timestamp,
            price: quote.price,
            source: source.to_string(),
        };
        self.engine.record(sample.clone(), self.spacing);
        self.latest = Some(sample);
        self.publish();
        true
    }

    pub fn set_mode(&mut self, mode: FeedMode) {
        if self.mode != mode {
            info!(from = ?self.mode, to = ?mode, "Price feed mode changed");
            self.mode = mode;
            self.publish();
        }
    }

    fn publish(&self) {
        let snapshot = FeedSnapshot {
            latest: self.latest.clone(),
            indicators: self.engine.compute(),
            prices: Arc::from(self.engine.prices()),
            mode: self.mode,
            rejected: self.rejected,
        };
        self.tx.send_replace(snapshot);
    }
}

// ---------------------------------------------------------------------------
// Feed task
// ---------------------------------------------------------------------------

/// Capped exponential delay: `base * 2^(attempt-1)`, at most `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(max)
}

pub struct PriceFeed {
    config: FeedConfig,
    stream: Option<Box<dyn StreamSource>>,
    fallbacks: Vec<Box<dyn PriceSource>>,
    publisher: FeedPublisher,
}

impl PriceFeed {
    pub fn new(
        config: FeedConfig,
        stream: Option<Box<dyn StreamSource>>,
        fallbacks: Vec<Box<dyn PriceSource>>,
        publisher: FeedPublisher,
    ) -> Self {
        Self {
            config,
            stream,
            fallbacks,
            publisher,
        }
    }

    /// Spawn the feed as a background task.
    pub fn spawn(self, shutdown: Shutdown) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run until shutdown: stream while possible, poll fallbacks otherwise.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        info!(
            stream = self.stream.is_some(),
            fallbacks = self.fallbacks.len(),
            "Price feed starting"
        );
        loop {
            if !self.stream_phase(&mut shutdown).await {
                break;
            }
            if !self.polling_phase(&mut shutdown).await {
                break;
            }
        }
        info!("Price feed stopped");
    }

    /// Keep the stream up. Returns when attempts are exhausted (true) or
    /// on shutdown (false).
    async fn stream_phase(&mut self, shutdown: &mut Shutdown) -> bool {
        let Some(stream) = self.stream.take() else {
            return !shutdown.is_triggered();
        };
        let base = Duration::from_millis(self.config.stream_backoff_base_ms);
        let max = Duration::from_millis(self.config.stream_backoff_max_ms);
        let idle = Duration::from_secs(self.config.stream_idle_timeout_secs.max(1));

        let mut attempt: u32 = 0;
        let mut keep_running = true;
        while attempt < self.config.max_stream_attempts {
            self.publisher.set_mode(FeedMode::Connecting);
            let session = tokio::select! {
                res = stream.connect() => res,
                _ = shutdown.wait() => { keep_running = false; break; }
            };

            match session {
                Ok(mut quotes) => {
                    self.publisher.set_mode(FeedMode::Streaming);
                    let mut delivered = false;
                    loop {
                        let next = tokio::select! {
                            n = tokio::time::timeout(idle, quotes.next()) => n,
                            _ = shutdown.wait() => { keep_running = false; break; }
                        };
                        match next {
                            Ok(Some(Ok(quote))) => {
                                delivered = true;
                                self.publisher.ingest(quote, "stream");
                            }
                            Ok(Some(Err(e))) => {
                                warn!(error = %e, "Price stream error");
                                break;
                            }
                            Ok(None) => {
                                warn!("Price stream ended");
                                break;
                            }
                            Err(_) => {
                                warn!(idle_secs = idle.as_secs(), "Price stream idle, reconnecting");
                                break;
                            }
                        }
                    }
                    if !keep_running {
                        break;
                    }
                    // A session that produced data earns a fresh set of attempts.
                    attempt = if delivered { 1 } else { attempt + 1 };
                }
                Err(e) => {
                    attempt += 1;
                    warn!(attempt, max = self.config.max_stream_attempts, error = %e, "Price stream connect failed");
                }
            }

            if attempt >= self.config.max_stream_attempts {
                break;
            }
            let delay = backoff_delay(attempt, base, max);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Stream reconnect backoff");
            if !shutdown.sleep(delay).await {
                keep_running = false;
                break;
            }
        }

        self.stream = Some(stream);
        if keep_running {
            warn!(
                attempts = self.config.max_stream_attempts,
                "Price stream could not be restored, falling back to polling"
            );
        }
        keep_running
    }

    /// Poll fallbacks until the stream re-probe is due (true) or shutdown
    /// (false).
    async fn polling_phase(&mut self, shutdown: &mut Shutdown) -> bool {
        let poll_every = Duration::from_secs(self.config.fallback_poll_secs.max(1));
        let reprobe_at = tokio::time::Instant::now()
            + Duration::from_secs(self.config.stream_reprobe_secs.max(1));
        let has_stream = self.stream.is_some();

        loop {
            self.poll_once().await;
            if has_stream && tokio::time::Instant::now() >= reprobe_at {
                info!("Re-probing price stream");
                return true;
            }
            if !shutdown.sleep(poll_every).await {
                return false;
            }
        }
    }

    /// Ask each fallback in priority order; the first success wins.
    pub async fn poll_once(&mut self) -> bool {
        for source in &self.fallbacks {
            match source.latest_price().await {
                Ok(quote) => {
                    self.publisher.set_mode(FeedMode::Polling);
                    self.publisher.ingest(quote, source.name());
                    return true;
                }
                Err(e) => {
                    debug!(source = source.name(), error = %e, "Fallback price source failed");
                }
            }
        }
        warn!(sources = self.fallbacks.len(), "All fallback price sources failed");
        self.publisher.set_mode(FeedMode::Unavailable);
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
