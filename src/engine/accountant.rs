//! Accountant: folds settlements and cycle commits into the run state.
//!
//! The only place equity, the win streak, the trade log and the cycle
//! counters change. Every fold is idempotent on the order's idempotency
//! key, so replaying a settlement after a restart cannot double count.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::types::{
    EquityPoint, Outcome, PositionStatus, RunState, TradeRecord, UpdownError,
};

pub struct Accountant;

impl Accountant {
    /// Fold the open position's outcome into equity, streak and trade log,
    /// then clear the position.
    ///
    /// Returns the new trade record, or `None` if this order was already
    /// folded (the position is cleared either way). An update that would
    /// leave equity negative, or whose payout overflows, is refused and
    /// halts the run.
    pub fn apply_settlement(
        state: &mut RunState,
        outcome: Outcome,
        increment: Decimal,
        settled_at: DateTime<Utc>,
    ) -> Result<Option<TradeRecord>, UpdownError> {
        let Some(position) = state.open_position.as_ref() else {
            return Ok(None);
        };

        if state.has_trade(&position.client_order_id) {
            info!(
                client_order_id = %position.client_order_id,
                "Settlement already recorded, clearing position"
            );
            state.open_position = None;
            return Ok(None);
        }

        let Some(pnl) = position.realized_pnl(outcome, increment) else {
            let (size, entry_price) = (position.size, position.entry_price);
            warn!(size = %size, entry_price = %entry_price, "Settlement payout overflows");
            state.halt(format!("payout for {size} at {entry_price} cannot be represented"));
            return Err(UpdownError::PayoutOverflow { size, entry_price });
        };
        let Some(equity_after) = state.current_equity.checked_add(pnl) else {
            let (size, entry_price) = (position.size, position.entry_price);
            state.halt(format!("equity overflow settling {size} at {entry_price}"));
            return Err(UpdownError::PayoutOverflow { size, entry_price });
        };
        if equity_after < Decimal::ZERO {
            let equity = state.current_equity;
            warn!(equity = %equity, pnl = %pnl, "Settlement would leave equity negative");
            state.halt(format!("equity would go negative: {equity} + {pnl}"));
            return Err(UpdownError::NegativeEquity { equity, pnl });
        }

        let record = TradeRecord {
            cycle: position.cycle,
            client_order_id: position.client_order_id.clone(),
            external_order_id: position.external_order_id.clone(),
            direction: position.direction,
            size: position.size,
            entry_price: position.entry_price,
            outcome,
            pnl,
            opened_at: position.opened_at,
            settled_at,
            equity_after,
        };

        state.current_equity = equity_after;
        state.trades.push(record.clone());
        state.win_streak = state.recompute_streak();
        state.open_position = None;

        info!(
            cycle = record.cycle,
            outcome = %outcome,
            pnl = %pnl,
            equity = %equity_after,
            streak = state.win_streak,
            "Settlement folded"
        );
        Ok(Some(record))
    }

    /// Mark the open position as unresolved. Equity and streak stay put.
    pub fn mark_unknown(state: &mut RunState) {
        if let Some(pos) = state.open_position.as_mut() {
            pos.status = PositionStatus::Unknown;
        }
    }

    /// Close out one interval slot.
    ///
    /// `traded` is whether an order reached the market this interval. A
    /// skipped interval consumes a cycle only under the run's skip policy.
    pub fn commit_cycle(state: &mut RunState, traded: bool, at: DateTime<Utc>) {
        state.intervals_elapsed += 1;
        if traded || state.skips_consume_cycle {
            state.cycles_completed += 1;
        }
        Self::record_equity(state, at);
    }

    /// Append an equity point, keeping the curve time-ordered.
    pub fn record_equity(state: &mut RunState, at: DateTime<Utc>) {
        let timestamp = state
            .equity_curve
            .last()
            .map_or(at, |last| at.max(last.timestamp));
        state.equity_curve.push(EquityPoint {
            timestamp,
            cycle: state.intervals_elapsed,
            equity: state.current_equity,
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
