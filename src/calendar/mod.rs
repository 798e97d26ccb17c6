//! Trading calendars.
//!
//! The engine only asks one question of a calendar: is this date a trading
//! day? Everything else (stepping over holidays, sizing history windows in
//! trading days) is built on that.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Longest run of consecutive closed days a calendar may have before
/// stepping gives up.
const MAX_CLOSED_RUN: i64 = 31;

pub trait TradingCalendar: Send + Sync {
    fn is_trading_day(&self, date: NaiveDate) -> bool;

    /// Step `n` trading days away from `date` (forward for positive `n`,
    /// backward for negative). `n == 0` returns `date` unchanged.
    fn trading_day_offset(&self, date: NaiveDate, n: i64) -> Option<NaiveDate> {
        let step = if n >= 0 { 1 } else { -1 };
        let mut remaining = n.unsigned_abs();
        let mut current = date;
        let mut closed_run = 0;

        while remaining > 0 {
            current = current.checked_add_signed(Duration::days(step))?;
            if self.is_trading_day(current) {
                remaining -= 1;
                closed_run = 0;
            } else {
                closed_run += 1;
                if closed_run > MAX_CLOSED_RUN {
                    return None;
                }
            }
        }

        Some(current)
    }

    /// First trading day strictly after `date`.
    fn next_trading_day(&self, date: NaiveDate) -> Option<NaiveDate> {
        self.trading_day_offset(date, 1)
    }
}

/// Which built-in calendar to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarKind {
    /// NYSE full-day closures plus weekends.
    Nyse,
    /// Monday to Friday, no holidays.
    Weekdays,
    /// Every day trades.
    AlwaysOpen,
}

impl fmt::Display for CalendarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalendarKind::Nyse => write!(f, "nyse"),
            CalendarKind::Weekdays => write!(f, "weekdays"),
            CalendarKind::AlwaysOpen => write!(f, "always_open"),
        }
    }
}

/// A rule-based exchange calendar with optional extra closures.
#[derive(Debug, Clone)]
pub struct ExchangeCalendar {
    kind: CalendarKind,
    extra_holidays: BTreeSet<NaiveDate>,
}

impl ExchangeCalendar {
    pub fn new(kind: CalendarKind) -> Self {
        Self {
            kind,
            extra_holidays: BTreeSet::new(),
        }
    }

    pub fn nyse() -> Self {
        Self::new(CalendarKind::Nyse)
    }

    pub fn weekdays() -> Self {
        Self::new(CalendarKind::Weekdays)
    }

    pub fn always_open() -> Self {
        Self::new(CalendarKind::AlwaysOpen)
    }

    /// Add ad-hoc closures (national mourning days, storms).
    pub fn with_extra_holidays(mut self, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.extra_holidays.extend(dates);
        self
    }

    pub fn kind(&self) -> CalendarKind {
        self.kind
    }

    /// Rule-derived closures for `year`, weekends excluded.
    pub fn holidays(&self, year: i32) -> Vec<NaiveDate> {
        let mut days: Vec<NaiveDate> = match self.kind {
            CalendarKind::Nyse => nyse_holidays(year),
            CalendarKind::Weekdays | CalendarKind::AlwaysOpen => Vec::new(),
        };
        days.extend(self.extra_holidays.iter().filter(|d| d.year() == year));
        days.sort_unstable();
        days.dedup();
        days
    }
}

impl TradingCalendar for ExchangeCalendar {
    fn is_trading_day(&self, date: NaiveDate) -> bool {
        if self.extra_holidays.contains(&date) {
            return false;
        }

        match self.kind {
            CalendarKind::AlwaysOpen => true,
            CalendarKind::Weekdays => !is_weekend(date),
            CalendarKind::Nyse => !is_weekend(date) && !is_nyse_holiday(date),
        }
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn is_nyse_holiday(date: NaiveDate) -> bool {
    // Observed New Year's Day never moves into the previous year, so the
    // date's own year is enough.
    nyse_holidays(date.year()).contains(&date)
}

/// NYSE full-day closures for a year.
fn nyse_holidays(year: i32) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(10);
    let mut push = |d: Option<NaiveDate>| {
        if let Some(d) = d {
            days.push(d);
        }
    };

    // New Year's Day: Sunday moves to Monday, Saturday is not made up
    push(NaiveDate::from_ymd_opt(year, 1, 1).and_then(|d| match d.weekday() {
        Weekday::Sun => d.succ_opt(),
        Weekday::Sat => None,
        _ => Some(d),
    }));
    if year >= 1998 {
        push(NaiveDate::from_weekday_of_month_opt(year, 1, Weekday::Mon, 3));
    }
    push(NaiveDate::from_weekday_of_month_opt(year, 2, Weekday::Mon, 3));
    push(easter_sunday(year).and_then(|d| d.checked_sub_signed(Duration::days(2))));
    push(last_weekday_of_month(year, 5, Weekday::Mon));
    if year >= 2022 {
        push(NaiveDate::from_ymd_opt(year, 6, 19).map(observed));
    }
    push(NaiveDate::from_ymd_opt(year, 7, 4).map(observed));
    push(NaiveDate::from_weekday_of_month_opt(year, 9, Weekday::Mon, 1));
    push(NaiveDate::from_weekday_of_month_opt(year, 11, Weekday::Thu, 4));
    push(NaiveDate::from_ymd_opt(year, 12, 25).map(observed));

    days
}

/// Saturday holidays are observed on Friday, Sunday holidays on Monday.
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date.pred_opt().unwrap_or(date),
        Weekday::Sun => date.succ_opt().unwrap_or(date),
        _ => date,
    }
}

fn last_weekday_of_month(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let last = first_of_next.pred_opt()?;
    let back = (7 + last.weekday().num_days_from_monday() - weekday.num_days_from_monday()) % 7;
    last.checked_sub_signed(Duration::days(i64::from(back)))
}

/// Gregorian Easter Sunday (anonymous computus).
fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}
