/// Simple Moving Average of the last `period` values
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Exponential Moving Average seeded with the SMA of the first `period` values
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = calculate_sma(&prices[..period], period)?;
    for price in &prices[period..] {
        ema = (price - ema) * multiplier + ema;
    }

    Some(ema)
}

/// SMA as of `back` values before the newest one
pub fn sma_at(prices: &[f64], period: usize, back: usize) -> Option<f64> {
    let end = prices.len().checked_sub(back)?;
    calculate_sma(&prices[..end], period)
}

/// `fast` moved from at or below `slow` to above it on the newest value
pub fn crossover(fast_prev: f64, slow_prev: f64, fast: f64, slow: f64) -> bool {
    fast_prev <= slow_prev && fast > slow
}

/// `fast` moved from at or above `slow` to below it on the newest value
pub fn crossunder(fast_prev: f64, slow_prev: f64, fast: f64, slow: f64) -> bool {
    fast_prev >= slow_prev && fast < slow
}
