//! Strategy contract.
//!
//! A strategy owns a trigger and is invoked once per matching fire time.
//! It sees the market and the account only through a [`StrategyContext`]
//! frozen at that fire time.

mod context;
mod live;
mod macd;

pub use context::StrategyContext;
pub use live::{Invocation, InvocationGuard};
pub use macd::{Ema, MacdIndicator, MacdParams, MacdStrategy};

use crate::schedule::Trigger;

/// Schedule used when a strategy does not set its own: every minute
/// from 09:00 through 16:59.
pub const DEFAULT_SCHEDULE: &str = "* 9-16 * * *";

pub trait Strategy: Send {
    fn name(&self) -> &str;

    fn trigger(&self) -> &Trigger;

    /// Called once per fire time. Errors abort the run; data errors raised
    /// through the context keep their classification.
    fn on_fire(&mut self, ctx: &mut StrategyContext<'_>) -> anyhow::Result<()>;
}
