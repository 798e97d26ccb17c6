//! What a strategy may do while it runs.

use crate::broker::{OrderOutcome, OrderRequest, Portfolio, Position};
use crate::calendar::TradingCalendar;
use crate::data::{DataProvider, HistoryWindow, PriceField, Series};
use crate::error::DataError;
use chrono::{NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;

/// A strategy's view of the world at one fire time.
///
/// Every call is bound to [`StrategyContext::now`]; data after that instant
/// is unreachable.
pub struct StrategyContext<'a> {
    now: NaiveDateTime,
    portfolio: &'a mut Portfolio,
    data: &'a dyn DataProvider,
    calendar: &'a dyn TradingCalendar,
}

impl<'a> StrategyContext<'a> {
    pub fn new(
        now: NaiveDateTime,
        portfolio: &'a mut Portfolio,
        data: &'a dyn DataProvider,
        calendar: &'a dyn TradingCalendar,
    ) -> Self {
        Self {
            now,
            portfolio,
            data,
            calendar,
        }
    }

    pub fn now(&self) -> NaiveDateTime {
        self.now
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    /// Buy (positive) or sell (negative) `quantity`, optionally as limit
    /// and/or stop legs at fractional offsets from the current quote.
    pub fn place_order(
        &mut self,
        symbol: &str,
        quantity: Decimal,
        limit: Option<Decimal>,
        stop: Option<Decimal>,
    ) -> Result<OrderOutcome, DataError> {
        let request = OrderRequest {
            symbol: symbol.to_string(),
            quantity,
            limit,
            stop,
        };
        self.portfolio.place_order(self.data, self.now, &request)
    }

    pub fn set_target_percent(
        &mut self,
        symbol: &str,
        fraction: Decimal,
        limit: Option<Decimal>,
        stop: Option<Decimal>,
    ) -> Result<OrderOutcome, DataError> {
        self.portfolio
            .set_target_percent(self.data, self.now, symbol, fraction, limit, stop)
    }

    pub fn cancel_orders(&mut self, symbol: Option<&str>) -> usize {
        self.portfolio.cancel_orders(symbol)
    }

    // ------------------------------------------------------------------
    // Account
    // ------------------------------------------------------------------

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.portfolio.position(symbol).cloned()
    }

    pub fn quantity(&self, symbol: &str) -> Decimal {
        self.portfolio.quantity(symbol)
    }

    pub fn cash(&self) -> Decimal {
        self.portfolio.cash()
    }

    pub fn value(&self) -> Result<Decimal, DataError> {
        self.portfolio.value(self.data, self.now)
    }

    // ------------------------------------------------------------------
    // Market data
    // ------------------------------------------------------------------

    pub fn quote(&self, symbol: &str) -> Result<Decimal, DataError> {
        self.data.quote(symbol, self.now)
    }

    /// The last `length` known values of `field`.
    pub fn history(
        &self,
        symbol: &str,
        field: PriceField,
        length: usize,
    ) -> Result<Series, DataError> {
        self.data
            .history(symbol, field, HistoryWindow::Length(length), self.now)
    }

    /// Known values of `field` from the start of the trading day `days`
    /// trading days back.
    pub fn history_days(
        &self,
        symbol: &str,
        field: PriceField,
        days: u32,
    ) -> Result<Series, DataError> {
        let today = self.now.date();
        let first_day = self
            .calendar
            .trading_day_offset(today, -i64::from(days))
            .ok_or(DataError::CalendarExhausted { from: today, days })?;
        let since = first_day.and_time(NaiveTime::MIN);

        self.data
            .history(symbol, field, HistoryWindow::Since(since), self.now)
    }
}
