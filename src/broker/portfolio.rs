//! Simulated brokerage account.

use super::order::{
    Direction, Fill, OrderKind, OrderOutcome, OrderRequest, PendingOrder, RejectReason, Rejection,
};
use super::position::Position;
use crate::data::DataProvider;
use crate::error::DataError;
use crate::utils::decimal::{apply_offset, whole_units};
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Cash, positions and resting conditional orders for one run.
///
/// Every order either applies in full or is rejected with a reason and
/// leaves the account untouched. Data provider failures are returned as
/// errors and are fatal to the caller.
#[derive(Debug, Clone)]
pub struct Portfolio {
    initial_cash: Decimal,
    cash: Decimal,
    positions: BTreeMap<String, Position>,
    /// Resting legs in placement order
    pending: Vec<PendingOrder>,
    fills: Vec<Fill>,
    rejections: Vec<Rejection>,
    next_order_id: u64,
}

impl Portfolio {
    pub fn new(initial_cash: Decimal) -> Self {
        Self {
            initial_cash,
            cash: initial_cash,
            positions: BTreeMap::new(),
            pending: Vec::new(),
            fills: Vec::new(),
            rejections: Vec::new(),
            next_order_id: 1,
        }
    }

    pub fn initial_cash(&self) -> Decimal {
        self.initial_cash
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Signed quantity held, zero when flat.
    pub fn quantity(&self, symbol: &str) -> Decimal {
        self.positions
            .get(symbol)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn pending_orders(&self) -> &[PendingOrder] {
        &self.pending
    }

    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }

    pub fn rejections(&self) -> &[Rejection] {
        &self.rejections
    }

    /// Cash plus positions at their last recorded prices.
    pub fn last_value(&self) -> Decimal {
        self.cash + self.positions.values().map(Position::market_value).sum::<Decimal>()
    }

    /// Cash plus positions quoted at `now`. Does not modify the account.
    pub fn value(&self, data: &dyn DataProvider, now: NaiveDateTime) -> Result<Decimal, DataError> {
        let mut total = self.cash;
        for position in self.positions.values() {
            total += position.quantity * data.quote(&position.symbol, now)?;
        }
        Ok(total)
    }

    /// Re-quote every position at `now` and return the account value.
    pub fn mark_to_market(
        &mut self,
        data: &dyn DataProvider,
        now: NaiveDateTime,
    ) -> Result<Decimal, DataError> {
        for position in self.positions.values_mut() {
            position.last_price = data.quote(&position.symbol, now)?;
        }
        Ok(self.last_value())
    }

    /// Submit an order at virtual time `now`.
    ///
    /// Market orders fill at the current quote. Limit and stop offsets
    /// register conditional legs priced off the current quote; they are
    /// only registered if the whole request validates.
    pub fn place_order(
        &mut self,
        data: &dyn DataProvider,
        now: NaiveDateTime,
        request: &OrderRequest,
    ) -> Result<OrderOutcome, DataError> {
        if request.quantity.is_zero() {
            return Ok(OrderOutcome::Unchanged);
        }

        let quote = data.quote(&request.symbol, now)?;
        let order_id = self.allocate_id();

        if !request.is_conditional() {
            let executed = self.execute(
                order_id,
                &request.symbol,
                request.quantity,
                quote,
                now,
                OrderKind::Market,
            );
            return Ok(match executed {
                Ok(fill) => OrderOutcome::Filled(fill),
                Err(reason) => OrderOutcome::Rejected(self.reject_request(now, request, reason)),
            });
        }

        let side = request.side();
        let legs: Vec<(OrderKind, Decimal)> = [
            (OrderKind::Limit, request.limit),
            (OrderKind::Stop, request.stop),
        ]
        .into_iter()
        .filter_map(|(kind, offset)| offset.map(|o| (kind, o)))
        .collect();

        for (kind, offset) in &legs {
            if !kind.offset_is_valid(side, *offset) {
                let reason = RejectReason::InvalidLimitDirection {
                    kind: *kind,
                    side,
                    offset: *offset,
                };
                return Ok(OrderOutcome::Rejected(self.reject_request(now, request, reason)));
            }
        }

        // Check affordability at each leg's own price before registering any
        for (_, offset) in &legs {
            let trigger_price = apply_offset(quote, *offset);
            let affordable = self.check_affordable(&request.symbol, request.quantity, trigger_price);
            if let Err(reason) = affordable {
                return Ok(OrderOutcome::Rejected(self.reject_request(now, request, reason)));
            }
        }

        let mut ids = Vec::with_capacity(legs.len());
        for (i, (kind, offset)) in legs.into_iter().enumerate() {
            let id = if i == 0 { order_id } else { self.allocate_id() };
            let pending = PendingOrder {
                id,
                group: order_id,
                symbol: request.symbol.clone(),
                placed_at: now,
                trigger_price: apply_offset(quote, offset),
                quantity: request.quantity,
                direction: Direction::from_offset(offset),
                kind,
            };

            info!(
                order_id = id,
                group = order_id,
                symbol = %pending.symbol,
                kind = kind.as_str(),
                quantity = %pending.quantity,
                trigger_price = %pending.trigger_price,
                direction = ?pending.direction,
                "Conditional order registered"
            );

            ids.push(id);
            self.pending.push(pending);
        }

        Ok(OrderOutcome::Pending(ids))
    }

    /// Trade towards holding `fraction` of account value in `symbol`.
    ///
    /// The target is `floor(value * fraction / quote)` whole units; the
    /// difference from the current holding is submitted as a market order,
    /// or as conditional legs when offsets are given.
    pub fn set_target_percent(
        &mut self,
        data: &dyn DataProvider,
        now: NaiveDateTime,
        symbol: &str,
        fraction: Decimal,
        limit: Option<Decimal>,
        stop: Option<Decimal>,
    ) -> Result<OrderOutcome, DataError> {
        if fraction < Decimal::ZERO || fraction > Decimal::ONE {
            let reason = RejectReason::InvalidTargetPercent { fraction };
            return Ok(OrderOutcome::Rejected(self.reject(now, symbol, None, reason)));
        }

        let value = self.value(data, now)?;
        let price = data.quote(symbol, now)?;
        let current = self.quantity(symbol);
        let desired = whole_units(value * fraction, price);
        let diff = desired - current;

        debug!(
            %symbol,
            %fraction,
            %value,
            %price,
            %current,
            %desired,
            "Target percent"
        );

        if diff.is_zero() {
            return Ok(OrderOutcome::Unchanged);
        }

        let request = OrderRequest {
            symbol: symbol.to_string(),
            quantity: diff,
            limit,
            stop,
        };

        let required = diff * price;
        if required > self.cash {
            let reason = RejectReason::InsufficientCash {
                required,
                available: self.cash,
            };
            return Ok(OrderOutcome::Rejected(self.reject_request(now, &request, reason)));
        }

        self.place_order(data, now, &request)
    }

    /// Drop resting orders for `symbol`, or for every symbol. Returns how
    /// many legs were removed.
    pub fn cancel_orders(&mut self, symbol: Option<&str>) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|order| symbol.is_some_and(|s| order.symbol != s));
        let cancelled = before - self.pending.len();

        if cancelled > 0 {
            info!(symbol = symbol.unwrap_or("*"), cancelled, "Pending orders cancelled");
        }
        cancelled
    }

    /// Fire every resting leg whose trigger price was reached between its
    /// placement and `as_of`.
    ///
    /// Fired legs fill at their trigger price and are removed together with
    /// their siblings. A fired leg that can no longer be afforded is removed
    /// and recorded as a rejection.
    pub fn check_pending(
        &mut self,
        data: &dyn DataProvider,
        as_of: NaiveDateTime,
    ) -> Result<Vec<Fill>, DataError> {
        let mut fills = Vec::new();
        let candidates: Vec<PendingOrder> = self.pending.clone();

        for order in candidates {
            // a sibling may already have filled in this pass
            if !self.pending.iter().any(|p| p.id == order.id) {
                continue;
            }

            let Some(range) = data.price_range(&order.symbol, order.placed_at, as_of)? else {
                continue;
            };
            if !order.is_triggered(range.low, range.high) {
                continue;
            }

            debug!(
                order_id = order.id,
                symbol = %order.symbol,
                trigger_price = %order.trigger_price,
                low = %range.low,
                high = %range.high,
                "Conditional order triggered"
            );

            let executed = self.execute(
                order.id,
                &order.symbol,
                order.quantity,
                order.trigger_price,
                as_of,
                order.kind,
            );
            match executed {
                Ok(fill) => {
                    self.pending.retain(|p| p.group != order.group);
                    fills.push(fill);
                }
                Err(reason) => {
                    self.pending.retain(|p| p.id != order.id);
                    self.reject(as_of, &order.symbol, Some(order.quantity), reason);
                }
            }
        }

        Ok(fills)
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_order_id;
        self.next_order_id += 1;
        id
    }

    fn check_affordable(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<(), RejectReason> {
        let held = self.quantity(symbol);
        if quantity.is_sign_negative() && quantity.abs() > held {
            return Err(RejectReason::InsufficientShares {
                requested: quantity.abs(),
                held,
            });
        }

        let required = quantity * price;
        if required > self.cash {
            return Err(RejectReason::InsufficientCash {
                required,
                available: self.cash,
            });
        }

        Ok(())
    }

    /// Apply a fill in full, or refuse it without touching the account.
    fn execute(
        &mut self,
        order_id: u64,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
        time: NaiveDateTime,
        kind: OrderKind,
    ) -> Result<Fill, RejectReason> {
        self.check_affordable(symbol, quantity, price)?;

        self.cash -= quantity * price;
        let position = self
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position::new(symbol));
        let remaining = position.apply_fill(quantity, price);
        let avg_entry = position.avg_entry_price;
        if remaining.is_zero() {
            self.positions.remove(symbol);
        }

        let fill = Fill {
            order_id,
            symbol: symbol.to_string(),
            time,
            quantity,
            price,
            kind,
        };

        info!(
            order_id,
            %symbol,
            side = if quantity.is_sign_negative() { "sell" } else { "buy" },
            kind = kind.as_str(),
            quantity = %quantity.abs(),
            %price,
            position = %remaining,
            avg_entry = %avg_entry,
            cash = %self.cash,
            "Order filled"
        );

        self.fills.push(fill.clone());
        Ok(fill)
    }

    fn reject_request(
        &mut self,
        time: NaiveDateTime,
        request: &OrderRequest,
        reason: RejectReason,
    ) -> Rejection {
        self.reject(time, &request.symbol, Some(request.quantity), reason)
    }

    fn reject(
        &mut self,
        time: NaiveDateTime,
        symbol: &str,
        quantity: Option<Decimal>,
        reason: RejectReason,
    ) -> Rejection {
        warn!(
            %symbol,
            quantity = ?quantity,
            reason = reason.code(),
            detail = %reason,
            "Order rejected"
        );

        let rejection = Rejection {
            time,
            symbol: symbol.to_string(),
            quantity,
            reason,
        };
        self.rejections.push(rejection.clone());
        rejection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MockDataProvider, PriceRange};
    use chrono::NaiveDate;
    use crate::data::BarDataProvider;
    use mockall::predicate::eq;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn ts(d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn quoting(price: Decimal) -> MockDataProvider {
        let mut data = MockDataProvider::new();
        data.expect_quote().returning(move |_, _| Ok(price));
        data
    }

    fn snapshot(p: &Portfolio) -> (Decimal, Vec<Position>, Vec<PendingOrder>, Vec<Fill>) {
        (
            p.cash(),
            p.positions().cloned().collect(),
            p.pending_orders().to_vec(),
            p.fills().to_vec(),
        )
    }

    // =========================================================================
    // Market Order Tests
    // =========================================================================

    #[test]
    fn test_buy_then_oversell_scenario() {
        let data = quoting(dec!(100));
        let mut p = Portfolio::new(dec!(10000));

        let outcome = p
            .place_order(&data, ts(2, 10), &OrderRequest::market("SPY", dec!(10)))
            .unwrap();
        assert!(outcome.fill().is_some());
        assert_eq!(p.cash(), dec!(9000));
        let pos = p.position("SPY").unwrap();
        assert_eq!(pos.quantity, dec!(10));
        assert_eq!(pos.avg_entry_price, dec!(100));

        let before = snapshot(&p);
        let outcome = p
            .place_order(&data, ts(2, 11), &OrderRequest::market("SPY", dec!(-12)))
            .unwrap();
        assert_eq!(outcome.rejection().unwrap().reason.code(), "insufficient_shares");
        assert_eq!(snapshot(&p), before);
        assert_eq!(p.rejections().len(), 1);
    }

    #[test]
    fn test_buy_exceeding_cash_rejected() {
        let data = quoting(dec!(100));
        let mut p = Portfolio::new(dec!(999));

        let outcome = p
            .place_order(&data, ts(2, 10), &OrderRequest::market("SPY", dec!(10)))
            .unwrap();
        match outcome {
            OrderOutcome::Rejected(r) => assert_eq!(
                r.reason,
                RejectReason::InsufficientCash {
                    required: dec!(1000),
                    available: dec!(999)
                }
            ),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(p.cash(), dec!(999));
        assert!(p.position("SPY").is_none());
    }

    #[test]
    fn test_close_position_removes_it() {
        let data = quoting(dec!(100));
        let mut p = Portfolio::new(dec!(10000));
        p.place_order(&data, ts(2, 10), &OrderRequest::market("SPY", dec!(10))).unwrap();
        p.place_order(&data, ts(2, 11), &OrderRequest::market("SPY", dec!(-10))).unwrap();

        assert!(p.position("SPY").is_none());
        assert_eq!(p.cash(), dec!(10000));
        assert_eq!(p.fills().len(), 2);
    }

    #[test]
    fn test_zero_quantity_is_unchanged() {
        let data = MockDataProvider::new();
        let mut p = Portfolio::new(dec!(10000));
        let outcome = p
            .place_order(&data, ts(2, 10), &OrderRequest::market("SPY", Decimal::ZERO))
            .unwrap();
        assert_eq!(outcome, OrderOutcome::Unchanged);
    }

    #[test]
    fn test_data_error_is_not_a_rejection() {
        let mut data = MockDataProvider::new();
        data.expect_quote()
            .returning(|s, _| Err(DataError::UnknownSymbol(s.to_string())));
        let mut p = Portfolio::new(dec!(10000));

        let result = p.place_order(&data, ts(2, 10), &OrderRequest::market("XYZ", dec!(1)));
        assert!(matches!(result, Err(DataError::UnknownSymbol(_))));
        assert!(p.rejections().is_empty());
    }

    // =========================================================================
    // Valuation Tests
    // =========================================================================

    #[test]
    fn test_value_requotes_positions() {
        let mut data = MockDataProvider::new();
        data.expect_quote()
            .with(eq("SPY"), eq(ts(2, 10)))
            .returning(|_, _| Ok(dec!(100)));
        data.expect_quote()
            .with(eq("SPY"), eq(ts(3, 10)))
            .returning(|_, _| Ok(dec!(110)));

        let mut p = Portfolio::new(dec!(10000));
        p.place_order(&data, ts(2, 10), &OrderRequest::market("SPY", dec!(10))).unwrap();

        assert_eq!(p.value(&data, ts(3, 10)).unwrap(), dec!(10100));
        // value() leaves last prices alone
        assert_eq!(p.last_value(), dec!(10000));
        assert_eq!(p.mark_to_market(&data, ts(3, 10)).unwrap(), dec!(10100));
        assert_eq!(p.position("SPY").unwrap().last_price, dec!(110));
    }

    // =========================================================================
    // Target Percent Tests
    // =========================================================================

    #[test]
    fn test_target_percent_scenario() {
        let data = quoting(dec!(50));
        let mut p = Portfolio::new(dec!(10000));

        let outcome = p
            .set_target_percent(&data, ts(2, 10), "SPY", dec!(0.5), None, None)
            .unwrap();
        let fill = outcome.fill().unwrap();
        assert_eq!(fill.quantity, dec!(100));
        assert_eq!(fill.price, dec!(50));
        assert_eq!(p.cash(), dec!(5000));
    }

    #[test]
    fn test_target_percent_sells_down() {
        let data = quoting(dec!(50));
        let mut p = Portfolio::new(dec!(10000));
        p.set_target_percent(&data, ts(2, 10), "SPY", dec!(0.5), None, None).unwrap();

        let outcome = p
            .set_target_percent(&data, ts(2, 11), "SPY", Decimal::ZERO, None, None)
            .unwrap();
        assert_eq!(outcome.fill().unwrap().quantity, dec!(-100));
        assert!(p.position("SPY").is_none());
    }

    #[test]
    fn test_target_percent_rejects_bad_fraction() {
        let data = MockDataProvider::new();
        let mut p = Portfolio::new(dec!(10000));

        for fraction in [dec!(1.01), dec!(-0.1)] {
            let outcome = p
                .set_target_percent(&data, ts(2, 10), "SPY", fraction, None, None)
                .unwrap();
            let rejection = outcome.rejection().unwrap();
            assert_eq!(rejection.reason.code(), "invalid_target_percent");
            assert_eq!(rejection.quantity, None);
        }
        assert_eq!(p.cash(), dec!(10000));
    }

    #[test]
    fn test_target_percent_already_there_is_unchanged() {
        let data = quoting(dec!(50));
        let mut p = Portfolio::new(dec!(10000));
        p.set_target_percent(&data, ts(2, 10), "SPY", dec!(0.5), None, None).unwrap();
        let outcome = p
            .set_target_percent(&data, ts(2, 11), "SPY", dec!(0.5), None, None)
            .unwrap();
        assert_eq!(outcome, OrderOutcome::Unchanged);
    }

    #[test]
    fn test_target_percent_with_stop_registers_leg() {
        let data = quoting(dec!(100));
        let mut p = Portfolio::new(dec!(10000));
        p.set_target_percent(&data, ts(2, 10), "SPY", dec!(0.5), None, None).unwrap();

        // sell down to zero with a protective stop 5% below
        let outcome = p
            .set_target_percent(&data, ts(2, 11), "SPY", Decimal::ZERO, None, Some(dec!(-0.05)))
            .unwrap();
        assert!(matches!(outcome, OrderOutcome::Pending(ref ids) if ids.len() == 1));
        let leg = &p.pending_orders()[0];
        assert_eq!(leg.trigger_price, dec!(95));
        assert_eq!(leg.quantity, dec!(-50));
        assert_eq!(leg.direction, Direction::Below);
    }

    // =========================================================================
    // Conditional Order Tests
    // =========================================================================

    #[test]
    fn test_buy_limit_above_market_rejected() {
        let data = quoting(dec!(100));
        let mut p = Portfolio::new(dec!(10000));

        let request = OrderRequest::market("SPY", dec!(10)).with_limit(dec!(0.02));
        let outcome = p.place_order(&data, ts(2, 10), &request).unwrap();
        assert_eq!(
            outcome.rejection().unwrap().reason.code(),
            "invalid_limit_direction"
        );
        assert!(p.pending_orders().is_empty());
    }

    #[test]
    fn test_invalid_leg_rejects_whole_bracket() {
        let data = quoting(dec!(100));
        let mut p = Portfolio::new(dec!(10000));
        p.place_order(&data, ts(2, 10), &OrderRequest::market("SPY", dec!(10))).unwrap();

        // sell limit is fine, sell stop above market is not
        let request = OrderRequest::market("SPY", dec!(-10))
            .with_limit(dec!(0.05))
            .with_stop(dec!(0.05));
        let outcome = p.place_order(&data, ts(2, 11), &request).unwrap();
        assert!(outcome.is_rejected());
        assert!(p.pending_orders().is_empty());
    }

    #[test]
    fn test_unaffordable_conditional_not_registered() {
        let data = quoting(dec!(100));
        let mut p = Portfolio::new(dec!(10000));

        let request = OrderRequest::market("SPY", dec!(-5)).with_stop(dec!(-0.05));
        let outcome = p.place_order(&data, ts(2, 10), &request).unwrap();
        assert_eq!(outcome.rejection().unwrap().reason.code(), "insufficient_shares");
        assert!(p.pending_orders().is_empty());
    }

    #[test]
    fn test_stop_fills_at_trigger_price_scenario() {
        let mut data = MockDataProvider::new();
        data.expect_quote().returning(|_, _| Ok(dec!(100)));
        data.expect_price_range()
            .with(eq("SPY"), eq(ts(2, 11)), eq(ts(3, 10)))
            .returning(|_, _, _| {
                Ok(Some(PriceRange {
                    low: dec!(94),
                    high: dec!(101),
                }))
            });

        let mut p = Portfolio::new(dec!(10000));
        p.place_order(&data, ts(2, 10), &OrderRequest::market("SPY", dec!(10))).unwrap();
        let request = OrderRequest::market("SPY", dec!(-10)).with_stop(dec!(-0.05));
        p.place_order(&data, ts(2, 11), &request).unwrap();
        assert_eq!(p.pending_orders()[0].trigger_price, dec!(95));

        let fills = p.check_pending(&data, ts(3, 10)).unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, dec!(95));
        assert_eq!(fills[0].kind, OrderKind::Stop);
        assert_eq!(fills[0].time, ts(3, 10));
        assert!(p.pending_orders().is_empty());
        assert!(p.position("SPY").is_none());
        assert_eq!(p.cash(), dec!(9950));
    }

    #[test]
    fn test_untriggered_order_persists() {
        let mut data = MockDataProvider::new();
        data.expect_quote().returning(|_, _| Ok(dec!(100)));
        data.expect_price_range().returning(|_, _, _| {
            Ok(Some(PriceRange {
                low: dec!(97),
                high: dec!(103),
            }))
        });

        let mut p = Portfolio::new(dec!(10000));
        let request = OrderRequest::market("SPY", dec!(10)).with_limit(dec!(-0.05));
        p.place_order(&data, ts(2, 10), &request).unwrap();

        assert!(p.check_pending(&data, ts(3, 10)).unwrap().is_empty());
        assert_eq!(p.pending_orders().len(), 1);
    }

    #[test]
    fn test_bracket_one_cancels_other() {
        let mut data = MockDataProvider::new();
        data.expect_quote().returning(|_, _| Ok(dec!(100)));
        data.expect_price_range().returning(|_, _, _| {
            Ok(Some(PriceRange {
                low: dec!(99),
                high: dec!(111),
            }))
        });

        let mut p = Portfolio::new(dec!(10000));
        p.place_order(&data, ts(2, 10), &OrderRequest::market("SPY", dec!(10))).unwrap();
        let request = OrderRequest::market("SPY", dec!(-10))
            .with_limit(dec!(0.10))
            .with_stop(dec!(-0.05));
        let outcome = p.place_order(&data, ts(2, 10), &request).unwrap();
        assert!(matches!(outcome, OrderOutcome::Pending(ref ids) if ids.len() == 2));

        let fills = p.check_pending(&data, ts(3, 10)).unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].kind, OrderKind::Limit);
        assert_eq!(fills[0].price, dec!(110));
        assert!(p.pending_orders().is_empty());
    }

    #[test]
    fn test_fired_but_unaffordable_leg_is_rejected_once() {
        let mut data = MockDataProvider::new();
        data.expect_quote().returning(|_, _| Ok(dec!(100)));
        data.expect_price_range().returning(|_, _, _| {
            Ok(Some(PriceRange {
                low: dec!(80),
                high: dec!(100),
            }))
        });

        let mut p = Portfolio::new(dec!(10000));
        let request = OrderRequest::market("SPY", dec!(100)).with_limit(dec!(-0.10));
        p.place_order(&data, ts(2, 10), &request).unwrap();
        // spend the cash before the limit fires
        p.place_order(&data, ts(2, 11), &OrderRequest::market("SPY", dec!(95))).unwrap();

        assert!(p.check_pending(&data, ts(3, 10)).unwrap().is_empty());
        assert!(p.pending_orders().is_empty());
        assert_eq!(p.rejections().len(), 1);
        assert_eq!(p.rejections()[0].reason.code(), "insufficient_cash");
    }

    #[test]
    fn test_cancel_orders_by_symbol_and_all() {
        let data = quoting(dec!(100));
        let mut p = Portfolio::new(dec!(10000));
        for symbol in ["SPY", "QQQ", "SPY"] {
            let request = OrderRequest::market(symbol, dec!(1)).with_limit(dec!(-0.05));
            p.place_order(&data, ts(2, 10), &request).unwrap();
        }

        assert_eq!(p.cancel_orders(Some("SPY")), 2);
        assert_eq!(p.pending_orders().len(), 1);
        assert_eq!(p.cancel_orders(None), 1);
        assert!(p.pending_orders().is_empty());
        assert!(p.fills().is_empty());
    }
    #[test]
    fn test_limit_ignores_extremes_before_placement() {
        let bars = BarDataProvider::from_csv_content(
            "start,end,symbol,open,high,low,close,volume
2024-01-02T09:30:00,2024-01-02T16:00:00,SPY,100,101,94,97,1000
",
        )
        .unwrap();
        let at = |h, m| {
            NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(h, m, 0)
                .unwrap()
        };

        let mut p = Portfolio::new(dec!(10000));
        let request = OrderRequest::market("SPY", dec!(10)).with_limit(dec!(-0.05));
        p.place_order(&bars, at(15, 59), &request).unwrap();
        assert_eq!(p.pending_orders()[0].trigger_price, dec!(95));

        // the day's low of 94 may have printed before 15:59
        assert!(p.check_pending(&bars, at(16, 0)).unwrap().is_empty());
        assert_eq!(p.pending_orders().len(), 1);
        assert_eq!(p.cash(), dec!(10000));
    }

    // =========================================================================
    // Property Tests
    // =========================================================================

    proptest! {
        #[test]
        fn prop_oversell_rejected_state_unchanged(
            held in 0i64..200,
            excess in 1i64..200,
        ) {
            let data = quoting(dec!(100));
            let mut p = Portfolio::new(dec!(100000));
            p.place_order(&data, ts(2, 10), &OrderRequest::market("SPY", Decimal::from(held)))
                .unwrap();
            let before = snapshot(&p);

            let sell = OrderRequest::market("SPY", -Decimal::from(held + excess));
            let outcome = p.place_order(&data, ts(2, 11), &sell).unwrap();

            prop_assert_eq!(outcome.rejection().unwrap().reason.code(), "insufficient_shares");
            prop_assert_eq!(snapshot(&p), before);
        }

        #[test]
        fn prop_wrong_direction_offset_rejected(
            buy in any::<bool>(),
            bps in 0i64..5000,
        ) {
            let data = quoting(dec!(100));
            let mut p = Portfolio::new(dec!(100000));
            p.place_order(&data, ts(2, 10), &OrderRequest::market("SPY", dec!(10))).unwrap();
            let before = snapshot(&p);

            // buy limits must sit below the quote, sell limits above
            let (quantity, offset) = if buy {
                (dec!(1), Decimal::new(bps, 4))
            } else {
                (dec!(-1), -Decimal::new(bps, 4))
            };
            let request = OrderRequest::market("SPY", quantity).with_limit(offset);
            let outcome = p.place_order(&data, ts(2, 11), &request).unwrap();

            prop_assert_eq!(outcome.rejection().unwrap().reason.code(), "invalid_limit_direction");
            prop_assert_eq!(snapshot(&p), before);
        }
    }
}
