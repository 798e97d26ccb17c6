//! Per-symbol holdings.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A non-flat holding. Flat positions are removed from the book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed quantity; negative is short
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    /// Most recent quote used to value the position
    pub last_price: Decimal,
}

impl Position {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            quantity: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            last_price: Decimal::ZERO,
        }
    }

    /// Apply a signed fill and return the new quantity.
    ///
    /// The average entry follows weighted-average cost over signed
    /// quantities. A fill that flips the sign of the position resets it to
    /// the fill price; a fill that flattens the position leaves it as is.
    pub fn apply_fill(&mut self, quantity: Decimal, price: Decimal) -> Decimal {
        let old = self.quantity;
        let new = old + quantity;

        if !new.is_zero() {
            let crosses_zero = !old.is_zero() && old.is_sign_negative() != new.is_sign_negative();
            self.avg_entry_price = if old.is_zero() || crosses_zero {
                price
            } else {
                (old * self.avg_entry_price + quantity * price) / new
            };
        }

        self.quantity = new;
        self.last_price = price;
        new
    }

    pub fn market_value(&self) -> Decimal {
        self.quantity * self.last_price
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.quantity * (self.last_price - self.avg_entry_price)
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }
}
