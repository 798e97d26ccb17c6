//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Price moved by a fractional offset: `(1 + offset) * price`.
pub fn apply_offset(price: Decimal, offset: Decimal) -> Decimal {
    (Decimal::ONE + offset) * price
}

/// Whole units affordable with `budget` at `price`, rounded down.
pub fn whole_units(budget: Decimal, price: Decimal) -> Decimal {
    safe_div(budget, price).floor()
}

/// Calculate weighted average of `(value, weight)` pairs.
pub fn weighted_average(values: &[(Decimal, Decimal)]) -> Decimal {
    let (sum, weight_sum) = values.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(sum, weight_sum), (val, weight)| (sum + val * weight, weight_sum + weight),
    );

    safe_div(sum, weight_sum)
}

/// Lossy conversion for statistics.
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
