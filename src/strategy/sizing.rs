//! Streak-based capital allocation.
//!
//! Stake grows geometrically with the win streak and is capped by the
//! exposure limit and by current equity:
//!
//! `size = min(base * multiplier^streak, max_exposure, equity)`
//!
//! rounded down to the smallest tradable increment.

use rust_decimal::Decimal;
use tracing::debug;

use crate::config::SizingConfig;
use crate::types::round_down;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SizingError {
    #[error("computed size {0} is not positive")]
    NonPositive(Decimal),

    #[error("computed size {size} exceeds equity {equity}")]
    ExceedsEquity { size: Decimal, equity: Decimal },

    #[error("size {size} cannot be rounded to increment {increment}")]
    Unrepresentable { size: Decimal, increment: Decimal },
}

pub struct CapitalAllocator {
    config: SizingConfig,
}

impl CapitalAllocator {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    /// Stake for the next trade.
    pub fn size(&self, win_streak: u32, equity: Decimal) -> Result<Decimal, SizingError> {
        let raw = self.streak_stake(win_streak);
        let capped = raw.min(self.config.max_exposure).min(equity);
        let increment = self.config.increment;
        let size = round_down(capped, increment).ok_or(SizingError::Unrepresentable {
            size: capped,
            increment,
        })?;

        if size <= Decimal::ZERO {
            return Err(SizingError::NonPositive(size));
        }
        if size > equity {
            return Err(SizingError::ExceedsEquity { size, equity });
        }

        debug!(
            win_streak,
            raw = %raw,
            size = %size,
            equity = %equity,
            "Position sized"
        );
        Ok(size)
    }

    /// `base * multiplier^streak`, evaluated only until it reaches the cap.
    fn streak_stake(&self, win_streak: u32) -> Decimal {
        let cap = self.config.max_exposure;
        let mut stake = self.config.base_size;
        for _ in 0..win_streak {
            if stake >= cap {
                break;
            }
            stake = match stake.checked_mul(self.config.multiplier) {
                Some(next) => next,
                None => return cap,
            };
        }
        stake
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
