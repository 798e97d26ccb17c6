//! Order requests, conditional orders, fills and rejections.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A request to trade `quantity` (signed: positive buys, negative sells).
///
/// `limit` and `stop` are fractional offsets from the current quote, e.g.
/// `-0.02` is two percent below. Carrying both produces a bracket whose
/// legs cancel each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub quantity: Decimal,
    pub limit: Option<Decimal>,
    pub stop: Option<Decimal>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            limit: None,
            stop: None,
        }
    }

    pub fn with_limit(mut self, offset: Decimal) -> Self {
        self.limit = Some(offset);
        self
    }

    pub fn with_stop(mut self, offset: Decimal) -> Self {
        self.stop = Some(offset);
        self
    }

    pub fn is_conditional(&self) -> bool {
        self.limit.is_some() || self.stop.is_some()
    }

    pub fn side(&self) -> Side {
        if self.quantity.is_sign_negative() {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
}

impl OrderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderKind::Market => "market",
            OrderKind::Limit => "limit",
            OrderKind::Stop => "stop",
        }
    }

    /// Whether `offset` points the right way for this kind of order.
    ///
    /// Buy limits sit below the market and sell limits above it; stops are
    /// the mirror image.
    pub fn offset_is_valid(self, side: Side, offset: Decimal) -> bool {
        match (self, side) {
            (OrderKind::Market, _) => true,
            (OrderKind::Limit, Side::Buy) | (OrderKind::Stop, Side::Sell) => {
                offset < Decimal::ZERO
            }
            (OrderKind::Limit, Side::Sell) | (OrderKind::Stop, Side::Buy) => {
                offset > Decimal::ZERO
            }
        }
    }
}

/// Which way the price has to move to fire a conditional order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Fires when the observed low reaches the trigger price.
    Below,
    /// Fires when the observed high reaches the trigger price.
    Above,
}

impl Direction {
    pub fn from_offset(offset: Decimal) -> Self {
        if offset.is_sign_negative() {
            Direction::Below
        } else {
            Direction::Above
        }
    }
}

/// A resting limit or stop leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub id: u64,
    /// Legs created by the same request share a group and cancel each other
    pub group: u64,
    pub symbol: String,
    pub placed_at: NaiveDateTime,
    pub trigger_price: Decimal,
    pub quantity: Decimal,
    pub direction: Direction,
    pub kind: OrderKind,
}

impl PendingOrder {
    pub fn is_triggered(&self, low: Decimal, high: Decimal) -> bool {
        match self.direction {
            Direction::Below => low <= self.trigger_price,
            Direction::Above => high >= self.trigger_price,
        }
    }
}

/// An executed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: u64,
    pub symbol: String,
    pub time: NaiveDateTime,
    pub quantity: Decimal,
    pub price: Decimal,
    pub kind: OrderKind,
}

impl Fill {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

/// Why an order was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectReason {
    InsufficientCash {
        required: Decimal,
        available: Decimal,
    },
    InsufficientShares {
        requested: Decimal,
        held: Decimal,
    },
    InvalidTargetPercent {
        fraction: Decimal,
    },
    InvalidLimitDirection {
        kind: OrderKind,
        side: Side,
        offset: Decimal,
    },
}

impl RejectReason {
    /// Machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::InsufficientCash { .. } => "insufficient_cash",
            RejectReason::InsufficientShares { .. } => "insufficient_shares",
            RejectReason::InvalidTargetPercent { .. } => "invalid_target_percent",
            RejectReason::InvalidLimitDirection { .. } => "invalid_limit_direction",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::InsufficientCash {
                required,
                available,
            } => write!(f, "order costs {} but only {} cash is available", required, available),
            RejectReason::InsufficientShares { requested, held } => {
                write!(f, "tried to sell {} but only {} held", requested, held)
            }
            RejectReason::InvalidTargetPercent { fraction } => {
                write!(f, "target fraction {} is outside [0, 1]", fraction)
            }
            RejectReason::InvalidLimitDirection { kind, side, offset } => write!(
                f,
                "{:?} {} offset {} points the wrong way",
                side,
                kind.as_str(),
                offset
            ),
        }
    }
}

/// A refused order, as recorded in the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub time: NaiveDateTime,
    pub symbol: String,
    /// `None` when the request was refused before an order size existed
    pub quantity: Option<Decimal>,
    pub reason: RejectReason,
}

/// Result of submitting an order. Rejections are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderOutcome {
    Filled(Fill),
    /// Conditional legs registered, by id
    Pending(Vec<u64>),
    Rejected(Rejection),
    /// Nothing to trade
    Unchanged,
}

impl OrderOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, OrderOutcome::Rejected(_))
    }

    pub fn fill(&self) -> Option<&Fill> {
        match self {
            OrderOutcome::Filled(fill) => Some(fill),
            _ => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            OrderOutcome::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }
}
