use crate::precision::round_to;

/// Minimum pyramiding order, as a fraction of the cap
const PYRAMIDING_DUST_RATIO: f64 = 0.02;

/// Quantity for a directional entry, or None when already positioned that way.
/// An opposite position is flattened and reversed in one order.
pub fn entry_qty(long: bool, qty: f64, position: f64, decimals: u32) -> Option<f64> {
    if (long && position > 0.0) || (!long && position < 0.0) {
        return None;
    }
    let ord = round_to(qty.abs() + position.abs(), decimals);
    (ord > 0.0).then_some(ord)
}

/// Quantity for one pyramiding step, capped at `pyramiding * qty` total exposure
pub fn pyramiding_qty(
    long: bool,
    qty: f64,
    position: f64,
    pyramiding: u32,
    decimals: u32,
) -> Option<f64> {
    if qty <= 0.0 {
        return None;
    }
    let cap = pyramiding as f64 * qty;
    if (long && position >= cap) || (!long && position <= -cap) {
        return None;
    }

    let opposite = (long && position < 0.0) || (!long && position > 0.0);
    let mut ord = if opposite { qty + position.abs() } else { qty };

    if (long && position + qty > cap) || (!long && position - qty < -cap) {
        ord = cap - position.abs();
    }

    if ord < cap * PYRAMIDING_DUST_RATIO {
        tracing::debug!("Pyramiding step {} below minimum for cap {}", ord, cap);
        return None;
    }
    Some(round_to(ord, decimals))
}
