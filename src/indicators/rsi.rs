//! Relative Strength Index with Wilder smoothing.

/// RSI over `prices` using Wilder's smoothing.
///
/// The first `period` price changes seed the average gain/loss with a
/// simple mean; every later change is folded in as
/// `avg = (avg * (period - 1) + x) / period`.
///
/// Returns `None` when fewer than `period + 1` finite prices are given.
/// A window with no losses reads 100, no gains 0, and no movement 50.
pub fn wilder_rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }
    if prices.iter().any(|p| !p.is_finite()) {
        return None;
    }

    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;
    for w in prices[..=period].windows(2) {
        let change = w[1] - w[0];
        if change > 0.0 {
            gain_sum += change;
        } else {
            loss_sum -= change;
        }
    }

    let p = period as f64;
    let mut avg_gain = gain_sum / p;
    let mut avg_loss = loss_sum / p;

    for w in prices[period..].windows(2) {
        let change = w[1] - w[0];
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
    }

    if avg_loss == 0.0 && avg_gain == 0.0 {
        return Some(50.0);
    }
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}
