//! Exponential moving average.

/// EMA of `prices` with smoothing `α = 2 / (period + 1)`.
///
/// Seeded with the simple mean of the first `period` prices, then every
/// later price is folded in as `α·price + (1−α)·prev`. Returns `None`
/// when fewer than `period` prices are available.
pub fn ema(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let seed = prices[..period].iter().sum::<f64>() / period as f64;
    let value = prices[period..]
        .iter()
        .fold(seed, |prev, &p| alpha * p + (1.0 - alpha) * prev);
    value.is_finite().then_some(value)
}
