//! Decimal arithmetic helpers for sizing and scoring.

use rust_decimal::Decimal;

/// Round down to lot size (quantity precision).
///
/// Negative values round toward zero so a sell never exceeds the holding.
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size <= Decimal::ZERO {
        return value;
    }
    (value / lot_size).trunc() * lot_size
}

/// Fractional change from `base` to `value` (0.1 = +10%). `None` when `base` is zero.
pub fn fractional_change(value: Decimal, base: Decimal) -> Option<Decimal> {
    if base == Decimal::ZERO {
        None
    } else {
        Some((value - base) / base)
    }
}
