//! Strategy engine: signal generation, risk gating and stake sizing.

pub mod risk;
pub mod signal;
pub mod sizing;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::indicators::{IndicatorSnapshot, MaRelation};
use crate::types::{RunState, Signal, UpdownError};
use risk::{GateDecision, GateReason, RiskGate};
use signal::SignalGenerator;
use sizing::CapitalAllocator;

// ---------------------------------------------------------------------------
// Decision log
// ---------------------------------------------------------------------------

/// What the strategy pipeline decided for one cycle, including the
/// opportunities it passed on and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DecisionRecord {
    /// Trade approved and sized, ready for execution.
    Selected { signal: Signal, size: Decimal },
    /// No rule fired and the policy is to skip.
    NoSignal { signal: Signal },
    /// The risk gate skipped the cycle or halted the run.
    GateRejected { signal: Signal, gate: GateDecision },
    /// Sizing produced an invalid stake.
    SizingRejected { signal: Signal, error: String },
}

impl DecisionRecord {
    /// The error behind a rejected trade, when the rejection is one.
    ///
    /// No signal and an already open position are decisions, not errors.
    pub fn rejection(&self) -> Option<UpdownError> {
        match self {
            DecisionRecord::GateRejected {
                gate: GateDecision::SkippedThisCycle(reason @ GateReason::Volatility { .. }),
                ..
            } => Some(UpdownError::Volatility(reason.to_string())),
            DecisionRecord::SizingRejected { error, .. } => Some(UpdownError::Sizing(error.clone())),
            _ => None,
        }
    }

    /// The halt reason, if the gate halted the run.
    pub fn halt_reason(&self) -> Option<&GateReason> {
        match self {
            DecisionRecord::GateRejected {
                gate: GateDecision::Halted(reason),
                ..
            } => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for DecisionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionRecord::Selected { signal, size } => write!(f, "{signal} ${size:.2}"),
            DecisionRecord::NoSignal { signal } => write!(f, "{signal}"),
            DecisionRecord::GateRejected { signal, gate } => write!(f, "{signal} {gate}"),
            DecisionRecord::SizingRejected { signal, error } => {
                write!(f, "{signal} sizing rejected: {error}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Pipelines signal generation → risk gate → capital allocation.
///
/// The gate runs on every cycle, trade or not, so a drawdown breach halts
/// the run even through a quiet stretch.
pub struct StrategyPipeline {
    signals: SignalGenerator,
    gate: RiskGate,
    allocator: CapitalAllocator,
}

impl StrategyPipeline {
    pub fn new(signals: SignalGenerator, gate: RiskGate, allocator: CapitalAllocator) -> Self {
        Self {
            signals,
            gate,
            allocator,
        }
    }

    /// Decide the current cycle. Reads the state, never mutates it.
    pub fn decide(
        &self,
        snapshot: &IndicatorSnapshot,
        previous: Option<MaRelation>,
        state: &RunState,
        prices: &[f64],
    ) -> DecisionRecord {
        let signal = self.signals.evaluate(snapshot, previous);
        debug!(signal = %signal, indicators = %snapshot, "Signal evaluated");

        let gate = self.gate.evaluate(state, prices);
        match &gate {
            GateDecision::Halted(reason) => {
                warn!(reason = %reason, "Risk gate halted the run");
                return DecisionRecord::GateRejected { signal, gate };
            }
            GateDecision::SkippedThisCycle(reason) if signal.is_trade() => {
                warn!(signal = %signal, reason = %reason, "Trade skipped by risk gate");
                return DecisionRecord::GateRejected { signal, gate };
            }
            _ => {}
        }

        if !signal.is_trade() {
            return DecisionRecord::NoSignal { signal };
        }

        match self.allocator.size(state.win_streak, state.current_equity) {
            Ok(size) => {
                info!(
                    signal = %signal,
                    size = %size,
                    streak = state.win_streak,
                    equity = %state.current_equity,
                    "Trade approved"
                );
                DecisionRecord::Selected { signal, size }
            }
            Err(e) => {
                warn!(signal = %signal, error = %e, "Sizing rejected");
                DecisionRecord::SizingRejected {
                    signal,
                    error: e.to_string(),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RiskConfig, SignalConfig, SizingConfig};
    use crate::types::{Direction, ErrorClass, ReasonCode};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn pipeline() -> StrategyPipeline {
        StrategyPipeline::new(
            SignalGenerator::new(&SignalConfig::default()),
            RiskGate::new(RiskConfig::default()),
            CapitalAllocator::new(SizingConfig::default()),
        )
    }

    fn snap(rsi: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            rsi,
            fast_ema: 100.0,
            slow_ema: 100.0,
            last_price: 100.0,
            samples: 60,
            as_of: Utc::now(),
        }
    }

    fn calm() -> Vec<f64> {
        (0..60).map(|i| 100.0 + (i % 2) as f64 * 0.1).collect()
    }

    #[test]
    fn test_oversold_trade_selected() {
        let mut state = RunState::new(dec!(100), true);
        state.win_streak = 2;
        let d = pipeline().decide(&snap(25.0), None, &state, &calm());
        match d {
            DecisionRecord::Selected { signal, size } => {
                assert_eq!(signal.direction, Some(Direction::Up));
                assert_eq!(signal.reason, ReasonCode::RsiOversold);
                assert_eq!(size, dec!(11.25));
            }
            other => panic!("expected Selected, got {other:?}"),
        }
    }

    #[test]
    fn test_no_signal_skips() {
        let state = RunState::new(dec!(100), true);
        let d = pipeline().decide(&snap(50.0), None, &state, &calm());
        assert!(matches!(d, DecisionRecord::NoSignal { .. }));
        assert!(d.halt_reason().is_none());
    }

    #[test]
    fn test_drawdown_halts_even_without_signal() {
        let mut state = RunState::new(dec!(100), true);
        state.current_equity = dec!(69);
        let d = pipeline().decide(&snap(50.0), None, &state, &calm());
        assert!(matches!(d.halt_reason(), Some(GateReason::Drawdown { .. })));
    }

    #[test]
    fn test_volatility_rejection_maps_to_skip_error() {
        let state = RunState::new(dec!(100), true);
        let mut prices: Vec<f64> = (0..50).map(|i| 100.0 + (i % 2) as f64 * 0.01).collect();
        prices.extend((0..10).map(|i| if i % 2 == 0 { 90.0 } else { 110.0 }));
        let d = pipeline().decide(&snap(25.0), None, &state, &prices);
        let err = d.rejection().unwrap();
        assert!(matches!(err, UpdownError::Volatility(_)));
        assert_eq!(err.class(), ErrorClass::Skip);
    }

    #[test]
    fn test_sizing_rejection_maps_to_validation_error() {
        let mut state = RunState::new(dec!(100), true);
        state.current_equity = dec!(0.001);
        let gate = RiskGate::new(RiskConfig {
            max_drawdown: dec!(1),
            ..RiskConfig::default()
        });
        let p = StrategyPipeline::new(
            SignalGenerator::new(&SignalConfig::default()),
            gate,
            CapitalAllocator::new(SizingConfig::default()),
        );
        let d = p.decide(&snap(25.0), None, &state, &calm());
        let err = d.rejection().unwrap();
        assert!(matches!(err, UpdownError::Sizing(_)));
        assert_eq!(err.class(), ErrorClass::Validation);
    }

    #[test]
    fn test_quiet_cycle_is_not_an_error() {
        let state = RunState::new(dec!(100), true);
        let d = pipeline().decide(&snap(50.0), None, &state, &calm());
        assert!(d.rejection().is_none());
    }

    #[test]
    fn test_decision_record_tagged_json() {
        let state = RunState::new(dec!(100), true);
        let d = pipeline().decide(&snap(75.0), None, &state, &calm());
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["action"], "selected");
        assert_eq!(json["size"], "5");
        let back: DecisionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, d);
    }
}
