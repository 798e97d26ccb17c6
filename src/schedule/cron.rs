//! A single rule set: one constraint per calendar field.
//!
//! Fire times are found by field-by-field rollover from the most significant
//! field down, so the cost of a lookup does not depend on how far in the
//! future the next fire time lies.

use super::field::{Field, FieldRule};
use super::spec::{FieldSpec, FieldValue};
use crate::error::ScheduleError;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rollovers never exceed a handful (dow jump, hour, minute, second, plus the
/// carries between them); this only guards against a broken invariant.
const MAX_ROLLOVERS: usize = 32;

/// One cron-like rule set over {second, minute, hour, day_of_week}.
///
/// Day of week counts from Monday = 0 to Sunday = 6.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronRule {
    pub second: FieldRule,
    pub minute: FieldRule,
    pub hour: FieldRule,
    pub day_of_week: FieldRule,
}

impl CronRule {
    /// Build a rule set from already-parsed field rules, validating each.
    pub fn new(
        second: FieldRule,
        minute: FieldRule,
        hour: FieldRule,
        day_of_week: FieldRule,
    ) -> Result<Self, ScheduleError> {
        second.validate(Field::Second)?;
        minute.validate(Field::Minute)?;
        hour.validate(Field::Hour)?;
        day_of_week.validate(Field::DayOfWeek)?;

        Ok(Self {
            second,
            minute,
            hour,
            day_of_week,
        })
    }

    /// Parse a five-field crontab line: `minute hour day month day_of_week`.
    ///
    /// Day-of-month and month must be wildcards; seconds are pinned to 0.
    pub fn from_crontab(line: &str) -> Result<Self, ScheduleError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ScheduleError::CrontabArity(line.to_string()));
        }

        for (name, expr) in [("day", parts[2]), ("month", parts[3])] {
            if expr != "*" && expr != "?" {
                return Err(ScheduleError::UnsupportedField {
                    field: name,
                    expr: expr.to_string(),
                });
            }
        }

        Self::new(
            FieldRule::Fixed(0),
            FieldRule::parse(Field::Minute, parts[0])?,
            FieldRule::parse(Field::Hour, parts[1])?,
            FieldRule::parse(Field::DayOfWeek, parts[4])?,
        )
    }

    /// Build from keyword fields.
    ///
    /// Fields more significant than the most significant one given default
    /// to `*`; less significant ones default to their minimum.
    pub fn from_fields(spec: &FieldSpec) -> Result<Self, ScheduleError> {
        // Most significant first.
        let given: [(Field, Option<&FieldValue>); 4] = [
            (Field::DayOfWeek, spec.day_of_week.as_ref()),
            (Field::Hour, spec.hour.as_ref()),
            (Field::Minute, spec.minute.as_ref()),
            (Field::Second, spec.second.as_ref()),
        ];
        let first_set = given.iter().position(|(_, value)| value.is_some());

        let mut rules = Vec::with_capacity(4);
        for (idx, (field, value)) in given.iter().enumerate() {
            let rule = match value {
                Some(value) => FieldRule::parse(*field, &value.to_expr())?,
                None => match first_set {
                    Some(first) if idx > first => FieldRule::Fixed(field.min()),
                    _ => FieldRule::Any,
                },
            };
            rules.push(rule);
        }

        let second = rules.pop().unwrap_or(FieldRule::Any);
        let minute = rules.pop().unwrap_or(FieldRule::Any);
        let hour = rules.pop().unwrap_or(FieldRule::Any);
        let day_of_week = rules.pop().unwrap_or(FieldRule::Any);
        Self::new(second, minute, hour, day_of_week)
    }

    /// True iff `t` is exactly a fire time (second resolution).
    pub fn matches(&self, t: NaiveDateTime) -> bool {
        t.nanosecond() == 0
            && self.second.matches(t.second())
            && self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self
                .day_of_week
                .matches(t.weekday().num_days_from_monday())
    }

    /// Smallest fire time strictly after `after`.
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let floor = after.with_nanosecond(0)?;
        self.first_at_or_after(floor.checked_add_signed(Duration::seconds(1))?)
    }

    /// Smallest fire time at or after `from`. Sub-second parts round up.
    pub fn first_at_or_after(&self, from: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut t = ceil_to_second(from)?;

        for _ in 0..MAX_ROLLOVERS {
            let date = t.date();

            let dow = date.weekday().num_days_from_monday();
            if !self.day_of_week.matches(dow) {
                let target = self
                    .day_of_week
                    .next_at_or_after(Field::DayOfWeek, dow)
                    .map(|d| d - dow)
                    .or_else(|| {
                        self.day_of_week
                            .first(Field::DayOfWeek)
                            .map(|d| d + 7 - dow)
                    })?;
                t = start_of_day(date.checked_add_signed(Duration::days(target as i64))?);
                continue;
            }

            let Some(hour) = self.hour.next_at_or_after(Field::Hour, t.hour()) else {
                t = start_of_day(date.succ_opt()?);
                continue;
            };
            if hour > t.hour() {
                t = at(date, hour, 0, 0)?;
            }

            let Some(minute) = self.minute.next_at_or_after(Field::Minute, t.minute()) else {
                t = at(date, hour, 0, 0)?.checked_add_signed(Duration::hours(1))?;
                continue;
            };
            if minute > t.minute() {
                t = at(date, hour, minute, 0)?;
            }

            let Some(second) = self.second.next_at_or_after(Field::Second, t.second()) else {
                t = at(date, hour, minute, 0)?.checked_add_signed(Duration::minutes(1))?;
                continue;
            };

            return at(date, hour, minute, second);
        }

        None
    }
}

impl fmt::Display for CronRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "second={} minute={} hour={} day_of_week={}",
            self.second, self.minute, self.hour, self.day_of_week
        )
    }
}

fn ceil_to_second(t: NaiveDateTime) -> Option<NaiveDateTime> {
    if t.nanosecond() == 0 {
        return Some(t);
    }
    t.with_nanosecond(0)?
        .checked_add_signed(Duration::seconds(1))
}

fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

fn at(date: NaiveDate, hour: u32, minute: u32, second: u32) -> Option<NaiveDateTime> {
    date.and_hms_opt(hour, minute, second)
}
