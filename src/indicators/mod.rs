//! Indicator engine.
//!
//! Holds a fixed-capacity ring buffer of price samples and derives the
//! RSI and fast/slow EMA pair from it. Pure computation, no I/O.

pub mod ema;
pub mod rsi;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::config::IndicatorConfig;
use crate::types::PriceSample;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Where the fast average sits relative to the slow one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaRelation {
    Above,
    Equal,
    Below,
}

/// Indicator values derived from the buffer at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi: f64,
    pub fast_ema: f64,
    pub slow_ema: f64,
    pub last_price: f64,
    pub samples: usize,
    pub as_of: DateTime<Utc>,
}

impl IndicatorSnapshot {
    pub fn ma_relation(&self) -> MaRelation {
        if self.fast_ema > self.slow_ema {
            MaRelation::Above
        } else if self.fast_ema < self.slow_ema {
            MaRelation::Below
        } else {
            MaRelation::Equal
        }
    }
}

impl fmt::Display for IndicatorSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rsi={:.1} fast={:.2} slow={:.2} last={:.2} n={}",
            self.rsi, self.fast_ema, self.slow_ema, self.last_price, self.samples
        )
    }
}

/// The buffer has not reached its warm-up count yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("insufficient indicator data: have {have}, need {need}")]
pub struct InsufficientData {
    pub have: usize,
    pub need: usize,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct IndicatorEngine {
    samples: VecDeque<PriceSample>,
    capacity: usize,
    rsi_period: usize,
    fast_period: usize,
    slow_period: usize,
}

impl IndicatorEngine {
    pub fn new(config: &IndicatorConfig) -> Self {
        let capacity = config.buffer_capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            rsi_period: config.rsi_period,
            fast_period: config.fast_period,
            slow_period: config.slow_period,
        }
    }

    /// Samples needed before any indicator is reported.
    pub fn warmup(&self) -> usize {
        (self.rsi_period + 1).max(self.slow_period).max(self.fast_period)
    }

    /// Append a sample, evicting the oldest on overflow.
    pub fn push(&mut self, sample: PriceSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Fold a sample in at a fixed cadence: a sample arriving less than
    /// `spacing` after the newest slot replaces that slot instead of
    /// opening a new one.
    pub fn record(&mut self, sample: PriceSample, spacing: chrono::Duration) {
        if let Some(last) = self.samples.back_mut() {
            if sample.timestamp - last.timestamp < spacing {
                // Keep the slot's opening time so the cadence does not creep.
                let slot_start = last.timestamp;
                *last = sample;
                last.timestamp = slot_start;
                return;
            }
        }
        self.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&PriceSample> {
        self.samples.back()
    }

    /// Buffered prices, oldest first.
    pub fn prices(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.price).collect()
    }

    /// Derive the current snapshot from the buffer.
    pub fn compute(&self) -> Result<IndicatorSnapshot, InsufficientData> {
        let need = self.warmup();
        let have = self.samples.len();
        let insufficient = InsufficientData { have, need };
        if have < need {
            return Err(insufficient);
        }

        let prices = self.prices();
        let rsi = rsi::wilder_rsi(&prices, self.rsi_period).ok_or(insufficient)?;
        let fast_ema = ema::ema(&prices, self.fast_period).ok_or(insufficient)?;
        let slow_ema = ema::ema(&prices, self.slow_period).ok_or(insufficient)?;
        let last = self.samples.back().ok_or(insufficient)?;

        Ok(IndicatorSnapshot {
            rsi,
            fast_ema,
            slow_ema,
            last_price: last.price,
            samples: have,
            as_of: last.timestamp,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
