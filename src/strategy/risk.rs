//! Risk gate.
//!
//! Three ordered checks over the run state and recent price history:
//! position overlap, volatility circuit breaker, drawdown halt. The gate
//! only reports; the orchestrator applies the consequence.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::config::RiskConfig;
use crate::types::RunState;

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Why a trade was not approved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateReason {
    /// The run was halted earlier.
    RunHalted,
    /// A position is already open or awaiting reconciliation.
    PositionOpen { cycle: u32 },
    /// Short-window dispersion exceeded the baseline multiple.
    Volatility { short: f64, baseline: f64, multiple: f64 },
    /// Drawdown from starting capital reached the threshold.
    Drawdown { drawdown: Decimal, threshold: Decimal },
}

impl fmt::Display for GateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateReason::RunHalted => write!(f, "run already halted"),
            GateReason::PositionOpen { cycle } => {
                write!(f, "position from cycle {cycle} still open")
            }
            GateReason::Volatility { short, baseline, multiple } => write!(
                f,
                "volatility {:.6} exceeds {:.1}x baseline {:.6}",
                short, multiple, baseline
            ),
            GateReason::Drawdown { drawdown, threshold } => write!(
                f,
                "drawdown {:.2}% reached limit {:.2}%",
                drawdown * Decimal::ONE_HUNDRED,
                threshold * Decimal::ONE_HUNDRED
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum GateDecision {
    Approved,
    SkippedThisCycle(GateReason),
    Halted(GateReason),
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateDecision::Approved => write!(f, "approved"),
            GateDecision::SkippedThisCycle(r) => write!(f, "skipped: {r}"),
            GateDecision::Halted(r) => write!(f, "halted: {r}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

pub struct RiskGate {
    config: RiskConfig,
}

impl RiskGate {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Run the checks in order; the first failing check decides.
    pub fn evaluate(&self, state: &RunState, prices: &[f64]) -> GateDecision {
        if state.halted {
            return GateDecision::Halted(GateReason::RunHalted);
        }

        if let Some(pos) = &state.open_position {
            return GateDecision::SkippedThisCycle(GateReason::PositionOpen { cycle: pos.cycle });
        }

        if let Some((short, baseline)) = self.volatility(prices) {
            let limit = baseline * self.config.volatility_multiplier;
            debug!(short, baseline, limit, "Volatility check");
            if short > limit {
                return GateDecision::SkippedThisCycle(GateReason::Volatility {
                    short,
                    baseline,
                    multiple: self.config.volatility_multiplier,
                });
            }
        }

        let drawdown = state.drawdown();
        if drawdown >= self.config.max_drawdown {
            return GateDecision::Halted(GateReason::Drawdown {
                drawdown,
                threshold: self.config.max_drawdown,
            });
        }

        GateDecision::Approved
    }

    /// Standard deviation of simple returns over the last
    /// `volatility_window` samples, and over the older returns before them.
    ///
    /// `None` when the baseline part is shorter than the window or flat.
    pub fn volatility(&self, prices: &[f64]) -> Option<(f64, f64)> {
        let returns = simple_returns(prices);
        let window = self.config.volatility_window;
        if window < 2 || returns.len() < window * 2 {
            return None;
        }
        let (older, recent) = returns.split_at(returns.len() - window);
        let baseline = std_dev(older)?;
        if baseline <= 0.0 {
            return None;
        }
        let short = std_dev(recent)?;
        Some((short, baseline))
    }
}

fn simple_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

/// Population standard deviation.
fn std_dev(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let sd = var.sqrt();
    sd.is_finite().then_some(sd)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
