use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

/// Round to `decimals` places, half-to-even like the venue's own rounding
pub fn round_to(value: f64, decimals: u32) -> f64 {
    with_decimal(value, |d| d.round_dp(decimals))
}

/// Truncate toward zero at `decimals` places (order sizes never round up past the balance)
pub fn floor_to(value: f64, decimals: u32) -> f64 {
    with_decimal(value, |d| {
        d.round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
    })
}

fn with_decimal(value: f64, f: impl FnOnce(Decimal) -> Decimal) -> f64 {
    if !value.is_finite() {
        return value;
    }
    Decimal::from_f64(value)
        .map(f)
        .and_then(|d| d.to_f64())
        .unwrap_or(value)
}
