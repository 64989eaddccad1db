//! Shared types for the UPDOWN agent.
//!
//! These types form the data model used across all modules.
//! `RunState` is the single durable aggregate; everything else is either
//! ephemeral per-cycle data or an append-only record folded into it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version of the persisted `RunState` layout. Bumped on breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Directional call on the next interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "UP"),
            Direction::Down => write!(f, "DOWN"),
        }
    }
}

/// Settlement result of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Win,
    Loss,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Win => write!(f, "WIN"),
            Outcome::Loss => write!(f, "LOSS"),
        }
    }
}

/// Lifecycle of a position record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Settled,
    /// Settlement could not be observed in time. Never treated as a win or
    /// a loss; resolved only by a later reconciliation.
    Unknown,
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionStatus::Open => write!(f, "OPEN"),
            PositionStatus::Settled => write!(f, "SETTLED"),
            PositionStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Qualitative confidence attached to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

impl fmt::Display for ConfidenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfidenceTier::High => write!(f, "high"),
            ConfidenceTier::Medium => write!(f, "medium"),
            ConfidenceTier::Low => write!(f, "low"),
        }
    }
}

/// Which rule produced a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonCode {
    RsiOversold,
    RsiOverbought,
    MaCrossUp,
    MaCrossDown,
    /// No rule fired and the policy is to sit the interval out.
    NoSignal,
    /// No rule fired and the policy is to default to DOWN.
    DefaultDown,
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReasonCode::RsiOversold => "rsi_oversold",
            ReasonCode::RsiOverbought => "rsi_overbought",
            ReasonCode::MaCrossUp => "ma_cross_up",
            ReasonCode::MaCrossDown => "ma_cross_down",
            ReasonCode::NoSignal => "no_signal",
            ReasonCode::DefaultDown => "default_down",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Price & signal
// ---------------------------------------------------------------------------

/// One accepted price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    /// Source name, e.g. "stream", "binance", "coinbase".
    pub source: String,
}

impl fmt::Display for PriceSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2} @ {} [{}]",
            self.price,
            self.timestamp.format("%H:%M:%S"),
            self.source
        )
    }
}

/// Trade intent for one cycle. `direction == None` means no trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub direction: Option<Direction>,
    pub reason: ReasonCode,
    pub confidence: ConfidenceTier,
}

impl Signal {
    pub fn none() -> Self {
        Self {
            direction: None,
            reason: ReasonCode::NoSignal,
            confidence: ConfidenceTier::Low,
        }
    }

    pub fn is_trade(&self) -> bool {
        self.direction.is_some()
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Some(d) => write!(f, "{d} ({}, {})", self.reason, self.confidence),
            None => write!(f, "NONE ({})", self.reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Position & trade records
// ---------------------------------------------------------------------------

/// The single live position. At most one exists at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// 1-based cycle index in which the position was opened.
    pub cycle: u32,
    pub direction: Direction,
    pub size: Decimal,
    /// Share price paid, in (0, 1).
    pub entry_price: Decimal,
    pub opened_at: DateTime<Utc>,
    pub expected_settlement_at: DateTime<Utc>,
    /// Idempotency key generated before submission.
    pub client_order_id: String,
    /// Venue order id, known only once submission succeeded.
    pub external_order_id: Option<String>,
    pub status: PositionStatus,
    pub outcome: Option<Outcome>,
    pub pnl: Option<Decimal>,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} ${:.2} @ {:.2} [{}] {}",
            self.cycle,
            self.direction,
            self.size,
            self.entry_price,
            self.status,
            self.external_order_id.as_deref().unwrap_or(&self.client_order_id),
        )
    }
}

impl Position {
    /// Realised P&L for a binary share position, rounded toward zero to
    /// `increment`.
    ///
    /// WIN pays `size * (1 - p) / p`, LOSS forfeits `size`. `None` when the
    /// payout does not fit in a `Decimal`.
    pub fn realized_pnl(&self, outcome: Outcome, increment: Decimal) -> Option<Decimal> {
        match outcome {
            Outcome::Loss => Some(-self.size),
            Outcome::Win => {
                let p = self.entry_price;
                if p <= Decimal::ZERO || p >= Decimal::ONE {
                    return Some(Decimal::ZERO);
                }
                let raw = self
                    .size
                    .checked_mul(Decimal::ONE - p)?
                    .checked_div(p)?;
                round_down(raw, increment)
            }
        }
    }
}

/// One settled trade. The ordered trade log is the source of truth for
/// the win streak.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub cycle: u32,
    pub client_order_id: String,
    pub external_order_id: Option<String>,
    pub direction: Direction,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub outcome: Outcome,
    pub pnl: Decimal,
    pub opened_at: DateTime<Utc>,
    pub settled_at: DateTime<Utc>,
    pub equity_after: Decimal,
}

/// Equity snapshot appended once per committed cycle or late settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub cycle: u32,
    pub equity: Decimal,
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Durable state of one run.
///
/// Mutated only on the orchestrator's decision path and written only by
/// the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub schema_version: u32,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub starting_capital: Decimal,
    pub current_equity: Decimal,
    pub win_streak: u32,
    pub cycles_completed: u32,
    /// Interval slots consumed, traded or not.
    pub intervals_elapsed: u32,
    /// Fixed at creation; a run never mixes both interpretations.
    pub skips_consume_cycle: bool,
    pub open_position: Option<Position>,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<TradeRecord>,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "equity=${:.2} (start ${:.2}) | streak={} | cycles={} | trades={} (W{}/L{}) | drawdown={:.1}%{}{}",
            self.current_equity,
            self.starting_capital,
            self.win_streak,
            self.cycles_completed,
            self.trades.len(),
            self.wins(),
            self.losses(),
            self.drawdown() * Decimal::ONE_HUNDRED,
            if self.open_position.is_some() { " | position open" } else { "" },
            if self.halted { " | HALTED" } else { "" },
        )
    }
}

impl RunState {
    /// Fresh run with default counters.
    pub fn new(starting_capital: Decimal, skips_consume_cycle: bool) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            starting_capital,
            current_equity: starting_capital,
            win_streak: 0,
            cycles_completed: 0,
            intervals_elapsed: 0,
            skips_consume_cycle,
            open_position: None,
            halted: false,
            halt_reason: None,
            equity_curve: Vec::new(),
            trades: Vec::new(),
        }
    }

    /// Fractional loss from starting capital. Zero when in profit.
    pub fn drawdown(&self) -> Decimal {
        if self.starting_capital <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let dd = (self.starting_capital - self.current_equity) / self.starting_capital;
        dd.max(Decimal::ZERO)
    }

    /// Streak derived from the ordered trade log: consecutive wins since
    /// the last loss.
    pub fn recompute_streak(&self) -> u32 {
        self.trades
            .iter()
            .rev()
            .take_while(|t| t.outcome == Outcome::Win)
            .count() as u32
    }

    pub fn wins(&self) -> usize {
        self.trades.iter().filter(|t| t.outcome == Outcome::Win).count()
    }

    pub fn losses(&self) -> usize {
        self.trades.iter().filter(|t| t.outcome == Outcome::Loss).count()
    }

    pub fn total_pnl(&self) -> Decimal {
        self.trades.iter().map(|t| t.pnl).sum()
    }

    /// Whether a trade with this idempotency key was already folded.
    pub fn has_trade(&self, client_order_id: &str) -> bool {
        self.trades.iter().any(|t| t.client_order_id == client_order_id)
    }

    /// True once the run has nothing left to do.
    pub fn is_terminal(&self, run_length: u32, max_intervals: u32) -> bool {
        self.halted
            || self.cycles_completed >= run_length
            || self.intervals_elapsed >= max_intervals
    }

    /// Record a halt. Irreversible within a run.
    pub fn halt(&mut self, reason: impl Into<String>) {
        if !self.halted {
            self.halted = true;
            self.halt_reason = Some(reason.into());
        }
    }
}

// ---------------------------------------------------------------------------
// Decimal helpers
// ---------------------------------------------------------------------------

/// Round `value` toward zero to a multiple of `increment`, without
/// trailing zeros. A non-positive increment leaves the value untouched.
/// `None` on overflow.
pub fn round_down(value: Decimal, increment: Decimal) -> Option<Decimal> {
    if increment <= Decimal::ZERO {
        return Some(value.normalize());
    }
    let steps = value.checked_div(increment)?.trunc();
    Some(steps.checked_mul(increment)?.normalize())
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Run-level consequence of an error. Only the orchestrator acts on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Stop trading for the rest of the run and exit non-zero.
    Fatal,
    /// Abandon the current cycle only.
    Skip,
    /// Rejected before any side effect; the cycle is skipped.
    Validation,
}

/// Domain-specific error types for UPDOWN.
#[derive(Debug, thiserror::Error)]
pub enum UpdownError {
    #[error("Authentication failed at market connector: {0}")]
    Auth(String),

    #[error("Persisted state is corrupt: {0}")]
    CorruptState(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Market not found: {0}")]
    MarketMissing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Equity would go negative: {equity} + {pnl}")]
    NegativeEquity { equity: Decimal, pnl: Decimal },

    #[error("Payout for {size} at {entry_price} cannot be represented")]
    PayoutOverflow { size: Decimal, entry_price: Decimal },

    #[error("Price feed unavailable")]
    FeedUnavailable,

    #[error("Volatility breaker tripped: {0}")]
    Volatility(String),

    #[error("Order submission failed: {0}")]
    SubmitFailed(String),

    #[error("Settlement not observed before timeout")]
    SettlementTimeout,

    #[error("Insufficient indicator data: have {have}, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("Invalid position size: {0}")]
    Sizing(String),
}

impl UpdownError {
    pub fn class(&self) -> ErrorClass {
        match self {
            UpdownError::Auth(_)
            | UpdownError::CorruptState(_)
            | UpdownError::Storage(_)
            | UpdownError::MarketMissing(_)
            | UpdownError::Config(_)
            | UpdownError::NegativeEquity { .. }
            | UpdownError::PayoutOverflow { .. } => ErrorClass::Fatal,
            UpdownError::FeedUnavailable
            | UpdownError::Volatility(_)
            | UpdownError::SubmitFailed(_)
            | UpdownError::SettlementTimeout => ErrorClass::Skip,
            UpdownError::InsufficientData { .. } | UpdownError::Sizing(_) => {
                ErrorClass::Validation
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
