//! Status API route handlers.
//!
//! All endpoints return JSON built from the latest committed `RunState`,
//! read from the orchestrator's watch channel. Handlers never block the
//! run: a `borrow()` clones out what it needs and lets go.

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;

use crate::types::{EquityPoint, Position, RunState, TradeRecord};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub run: watch::Receiver<RunState>,
    pub run_length: u32,
}

impl AppState {
    pub fn new(run: watch::Receiver<RunState>, run_length: u32) -> Self {
        Self { run, run_length }
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub run_id: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub starting_capital: Decimal,
    pub current_equity: Decimal,
    pub total_pnl: Decimal,
    pub drawdown: Decimal,
    pub win_streak: u32,
    pub cycles_completed: u32,
    pub run_length: u32,
    pub intervals_elapsed: u32,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub open_position: Option<Position>,
    pub halt_reason: Option<String>,
}

impl StatusResponse {
    fn from_state(state: &RunState, run_length: u32) -> Self {
        let wins = state.wins();
        let losses = state.losses();
        let settled = wins + losses;
        let status = if state.halted {
            "HALTED"
        } else if state.cycles_completed >= run_length {
            "FINISHED"
        } else {
            "RUNNING"
        };

        Self {
            run_id: state.run_id.clone(),
            status: status.into(),
            started_at: state.started_at,
            starting_capital: state.starting_capital,
            current_equity: state.current_equity,
            total_pnl: state.total_pnl(),
            drawdown: state.drawdown().round_dp(4),
            win_streak: state.win_streak,
            cycles_completed: state.cycles_completed,
            run_length,
            intervals_elapsed: state.intervals_elapsed,
            wins,
            losses,
            win_rate: if settled > 0 {
                wins as f64 / settled as f64
            } else {
                0.0
            },
            open_position: state.open_position.clone(),
            halt_reason: state.halt_reason.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let run = state.run.borrow();
    Json(StatusResponse::from_state(&run, state.run_length))
}

/// GET /api/equity-curve
pub async fn get_equity_curve(State(state): State<AppState>) -> Json<Vec<EquityPoint>> {
    Json(state.run.borrow().equity_curve.clone())
}

/// GET /api/trades
pub async fn get_trades(State(state): State<AppState>) -> Json<Vec<TradeRecord>> {
    Json(state.run.borrow().trades.clone())
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
