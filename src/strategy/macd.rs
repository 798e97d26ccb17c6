//! MACD-histogram demo strategy.

use super::{Strategy, StrategyContext};
use crate::broker::OrderOutcome;
use crate::data::PriceField;
use crate::schedule::{ScheduleSpec, Trigger};
use crate::utils::decimal::to_f64;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Exponential moving average seeded with the first observation,
/// `alpha = 2 / (window + 1)`.
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f64,
    window: usize,
    pub value: f64,
    count: usize,
}

impl Ema {
    pub fn new(window: usize) -> Self {
        Self {
            alpha: 2.0 / (window as f64 + 1.0),
            window,
            value: 0.0,
            count: 0,
        }
    }

    /// At least `window` values seen.
    pub fn is_ready(&self) -> bool {
        self.count >= self.window
    }

    /// Feed one value, return the current average.
    pub fn update(&mut self, x: f64) -> f64 {
        if self.count == 0 {
            self.value = x;
        } else {
            self.value = self.alpha * x + (1.0 - self.alpha) * self.value;
        }
        self.count += 1;
        self.value
    }
}

/// MACD histogram: MACD line minus its signal line.
///
/// The MACD line exists once the slow average has warmed up; the signal
/// average is seeded from the first such value and the histogram exists
/// once the signal has warmed up in turn.
#[derive(Debug, Clone)]
pub struct MacdIndicator {
    ema_fast: Ema,
    ema_slow: Ema,
    ema_signal: Ema,
    pub histogram: Option<f64>,
}

impl MacdIndicator {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            ema_fast: Ema::new(fast),
            ema_slow: Ema::new(slow),
            ema_signal: Ema::new(signal),
            histogram: None,
        }
    }

    pub fn update(&mut self, price: f64) -> Option<f64> {
        let fast = self.ema_fast.update(price);
        let slow = self.ema_slow.update(price);
        if !self.ema_slow.is_ready() {
            return None;
        }

        let macd_line = fast - slow;
        let signal = self.ema_signal.update(macd_line);
        self.histogram = self
            .ema_signal
            .is_ready()
            .then_some(macd_line - signal);
        self.histogram
    }

    /// Histogram after feeding the whole series, `None` while warming up.
    pub fn last_histogram(
        fast: usize,
        slow: usize,
        signal: usize,
        prices: &[f64],
    ) -> Option<f64> {
        let mut macd = Self::new(fast, slow, signal);
        for price in prices {
            macd.update(*price);
        }
        macd.histogram
    }
}

fn default_symbol() -> String {
    "SPY".to_string()
}

fn default_schedule() -> Vec<ScheduleSpec> {
    vec![ScheduleSpec::from("30 9 * * *")]
}

fn default_fast() -> usize {
    5
}

fn default_slow() -> usize {
    10
}

fn default_signal() -> usize {
    3
}

fn default_lookback_days() -> u32 {
    20
}

fn default_stop_offset() -> Option<Decimal> {
    Some(Decimal::new(-6, 2))
}

/// MACD strategy parameters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MacdParams {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_schedule")]
    pub schedule: Vec<ScheduleSpec>,
    #[serde(default = "default_fast")]
    pub fast: usize,
    #[serde(default = "default_slow")]
    pub slow: usize,
    #[serde(default = "default_signal")]
    pub signal: usize,
    /// History window in trading days
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    /// Protective sell-stop offset placed under a long position
    #[serde(default = "default_stop_offset")]
    pub stop_offset: Option<Decimal>,
}

impl Default for MacdParams {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            schedule: default_schedule(),
            fast: default_fast(),
            slow: default_slow(),
            signal: default_signal(),
            lookback_days: default_lookback_days(),
            stop_offset: default_stop_offset(),
        }
    }
}

/// Goes fully long while the MACD histogram of daily opens is positive,
/// flat otherwise.
pub struct MacdStrategy {
    name: String,
    params: MacdParams,
    trigger: Trigger,
}

impl MacdStrategy {
    pub fn new(params: MacdParams, timezone: Tz) -> anyhow::Result<Self> {
        anyhow::ensure!(
            params.fast > 0 && params.fast < params.slow,
            "fast window ({}) must be positive and below slow window ({})",
            params.fast,
            params.slow
        );
        anyhow::ensure!(params.signal > 0, "signal window must be positive");

        let trigger = Trigger::from_specs(&params.schedule, timezone)?;
        Ok(Self {
            name: format!("macd-{}", params.symbol),
            params,
            trigger,
        })
    }

    pub fn params(&self) -> &MacdParams {
        &self.params
    }
}

impl Strategy for MacdStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    fn on_fire(&mut self, ctx: &mut StrategyContext<'_>) -> anyhow::Result<()> {
        let symbol = self.params.symbol.as_str();
        let opens = ctx.history_days(symbol, PriceField::Open, self.params.lookback_days)?;
        let prices: Vec<f64> = opens.iter().map(|(_, p)| to_f64(*p)).collect();
        let Some(histogram) = MacdIndicator::last_histogram(
            self.params.fast,
            self.params.slow,
            self.params.signal,
            &prices,
        ) else {
            debug!(%symbol, bars = opens.len(), "Not enough history for MACD, skipping");
            return Ok(());
        };

        debug!(%symbol, histogram, now = %ctx.now(), "MACD evaluated");

        ctx.cancel_orders(Some(symbol));
        if histogram > 0.0 {
            let outcome = ctx.set_target_percent(symbol, Decimal::ONE, None, None)?;
            if let OrderOutcome::Filled(fill) = &outcome {
                info!(%symbol, quantity = %fill.quantity, price = %fill.price, "MACD entry");
            }

            let held = ctx.quantity(symbol);
            if let Some(stop) = self.params.stop_offset {
                if held > Decimal::ZERO {
                    ctx.place_order(symbol, -held, None, Some(stop))?;
                }
            }
        } else {
            ctx.set_target_percent(symbol, Decimal::ZERO, None, None)?;
        }

        Ok(())
    }
}
