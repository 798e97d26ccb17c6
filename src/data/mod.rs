//! Market data contract.
//!
//! Every call is bound to a point in virtual time and must never return a
//! value that was not yet known at that time.

mod bars;

pub use bars::{Bar, BarDataProvider};

use crate::error::DataError;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bar field a history request reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl FromStr for PriceField {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(PriceField::Open),
            "high" => Ok(PriceField::High),
            "low" => Ok(PriceField::Low),
            "close" => Ok(PriceField::Close),
            "volume" => Ok(PriceField::Volume),
            other => Err(DataError::UnknownField(other.to_string())),
        }
    }
}

impl fmt::Display for PriceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PriceField::Open => "open",
            PriceField::High => "high",
            PriceField::Low => "low",
            PriceField::Close => "close",
            PriceField::Volume => "volume",
        };
        write!(f, "{}", name)
    }
}

/// How far back a history request reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryWindow {
    /// The last `n` known values.
    Length(usize),
    /// Every known value at or after this time.
    Since(NaiveDateTime),
}

/// Observed low/high over an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceRange {
    pub low: Decimal,
    pub high: Decimal,
}

impl PriceRange {
    pub fn point(price: Decimal) -> Self {
        Self {
            low: price,
            high: price,
        }
    }

    pub fn merge(self, other: PriceRange) -> Self {
        Self {
            low: self.low.min(other.low),
            high: self.high.max(other.high),
        }
    }
}

/// A point-in-time ordered series.
pub type Series = Vec<(NaiveDateTime, Decimal)>;

/// Source of quotes and history. Failures are fatal to a run.
#[cfg_attr(test, mockall::automock)]
pub trait DataProvider: Send + Sync {
    /// Price of `symbol` as known at `at`.
    fn quote(&self, symbol: &str, at: NaiveDateTime) -> Result<Decimal, DataError>;

    /// Values of `field` known at `end`, oldest first.
    fn history(
        &self,
        symbol: &str,
        field: PriceField,
        window: HistoryWindow,
        end: NaiveDateTime,
    ) -> Result<Series, DataError>;

    /// Low/high observed in `(from, to]`, or `None` when nothing was
    /// observed yet.
    fn price_range(
        &self,
        symbol: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Option<PriceRange>, DataError>;
}
