//! Simulated broker: cash, positions and conditional orders.

mod order;
mod portfolio;
mod position;

pub use order::{
    Direction, Fill, OrderKind, OrderOutcome, OrderRequest, PendingOrder, RejectReason, Rejection,
    Side,
};
pub use portfolio::Portfolio;
pub use position::Position;
