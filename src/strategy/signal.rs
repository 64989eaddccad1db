//! Signal generator.
//!
//! Maps an indicator snapshot to a directional call using a fixed rule
//! order. Stateless apart from the caller-supplied previous MA relation,
//! which is what lets a crossover be detected.

use crate::config::{NoSignalPolicy, SignalConfig};
use crate::indicators::{IndicatorSnapshot, MaRelation};
use crate::types::{ConfidenceTier, Direction, ReasonCode, Signal};

pub struct SignalGenerator {
    oversold: f64,
    overbought: f64,
    policy: NoSignalPolicy,
}

impl SignalGenerator {
    pub fn new(config: &SignalConfig) -> Self {
        Self {
            oversold: config.rsi_oversold,
            overbought: config.rsi_overbought,
            policy: config.no_signal_policy,
        }
    }

    /// Evaluate the rules in priority order; the first match wins.
    ///
    /// 1. RSI below the oversold line: UP, high confidence.
    /// 2. RSI above the overbought line: DOWN, high confidence.
    /// 3. Fast EMA crossed above slow since the previous cycle: UP, medium.
    /// 4. Fast EMA crossed below slow: DOWN, medium.
    /// 5. Otherwise the no-signal policy applies.
    ///
    /// `previous` is the MA relation seen on the last evaluated cycle;
    /// without it no crossover can fire.
    pub fn evaluate(&self, snapshot: &IndicatorSnapshot, previous: Option<MaRelation>) -> Signal {
        if snapshot.rsi < self.oversold {
            return trade(Direction::Up, ReasonCode::RsiOversold, ConfidenceTier::High);
        }
        if snapshot.rsi > self.overbought {
            return trade(Direction::Down, ReasonCode::RsiOverbought, ConfidenceTier::High);
        }

        let current = snapshot.ma_relation();
        match (previous, current) {
            (Some(MaRelation::Below | MaRelation::Equal), MaRelation::Above) => {
                return trade(Direction::Up, ReasonCode::MaCrossUp, ConfidenceTier::Medium);
            }
            (Some(MaRelation::Above | MaRelation::Equal), MaRelation::Below) => {
                return trade(Direction::Down, ReasonCode::MaCrossDown, ConfidenceTier::Medium);
            }
            _ => {}
        }

        match self.policy {
            NoSignalPolicy::Skip => Signal::none(),
            NoSignalPolicy::DefaultDown => {
                trade(Direction::Down, ReasonCode::DefaultDown, ConfidenceTier::Low)
            }
        }
    }
}

fn trade(direction: Direction, reason: ReasonCode, confidence: ConfidenceTier) -> Signal {
    Signal {
        direction: Some(direction),
        reason,
        confidence,
    }
}
