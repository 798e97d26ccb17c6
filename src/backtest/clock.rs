//! Virtual time.

use crate::calendar::TradingCalendar;
use crate::error::{EngineError, EngineResult, ScheduleError};
use crate::schedule::Trigger;
use chrono::{NaiveDateTime, NaiveTime};
use tracing::trace;

/// Default cap on calendar skips when looking for a trading-day fire time.
pub const DEFAULT_MAX_CALENDAR_SKIPS: u32 = 30;

/// The simulation's notion of "now". Only ever moves forward, and only
/// onto trading days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualClock {
    now: NaiveDateTime,
}

impl VirtualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self { now: start }
    }

    pub fn now(&self) -> NaiveDateTime {
        self.now
    }

    pub fn advance_to(
        &mut self,
        t: NaiveDateTime,
        calendar: &dyn TradingCalendar,
    ) -> EngineResult<()> {
        if t < self.now {
            return Err(EngineError::ClockRegression {
                now: self.now,
                requested: t,
            });
        }
        if !calendar.is_trading_day(t.date()) {
            return Err(EngineError::NonTradingDay {
                date: t.date(),
                requested: t,
            });
        }

        self.now = t;
        Ok(())
    }
}

/// Next fire time of `trigger` strictly after `after` that lands on a
/// trading day.
///
/// Fire times on closed days restart the search at the following midnight.
/// Returns `Ok(None)` once the trigger has no further fire times, and an
/// error when more than `max_skips` closed days are hit in a row.
pub fn advance_to_next_trading_fire_time(
    trigger: &Trigger,
    calendar: &dyn TradingCalendar,
    after: NaiveDateTime,
    max_skips: u32,
) -> Result<Option<NaiveDateTime>, ScheduleError> {
    let Some(mut candidate) = trigger.next_fire_time(after) else {
        return Ok(None);
    };

    let mut skips = 0;
    while !calendar.is_trading_day(candidate.date()) {
        skips += 1;
        if skips > max_skips {
            return Err(ScheduleError::NoTradingDayFire {
                after,
                attempts: max_skips,
            });
        }

        trace!(%candidate, skips, "Fire time on a closed day, skipping");
        let Some(next_day) = candidate.date().succ_opt() else {
            return Ok(None);
        };
        let Some(next) = trigger.first_fire_at_or_after(next_day.and_time(NaiveTime::MIN)) else {
            return Ok(None);
        };
        candidate = next;
    }

    Ok(Some(candidate))
}
