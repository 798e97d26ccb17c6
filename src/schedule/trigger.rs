//! Triggers: rule sets bound to an evaluation timezone, combined with OR.

use super::cron::CronRule;
use super::spec::ScheduleSpec;
use crate::error::ScheduleError;
use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use std::fmt;

/// Exchange-local timezone used when none is configured.
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::New_York;

/// Candidates skipped while mapping local fire times onto UTC (DST gaps).
const MAX_UTC_CANDIDATES: usize = 8;

/// Resolve an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimezone(name.to_string()))
}

/// One rule set evaluated in a timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronTrigger {
    pub rule: CronRule,
    pub timezone: Tz,
}

/// A schedule. Immutable once built; [`Trigger::with_timezone`] derives
/// copies.
///
/// Backtests evaluate triggers against naive exchange-local timestamps. The
/// bound timezone only matters for [`Trigger::next_fire_time_utc`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Cron(CronTrigger),
    Any(Vec<Trigger>),
}

impl Trigger {
    pub fn cron(rule: CronRule, timezone: Tz) -> Self {
        Trigger::Cron(CronTrigger { rule, timezone })
    }

    /// Parse a single crontab line in the default timezone.
    pub fn from_crontab(line: &str) -> Result<Self, ScheduleError> {
        Ok(Self::cron(CronRule::from_crontab(line)?, DEFAULT_TIMEZONE))
    }

    /// Build a trigger from one or more declarative rule sets, OR-combined.
    pub fn from_specs(specs: &[ScheduleSpec], timezone: Tz) -> Result<Self, ScheduleError> {
        let mut children = specs
            .iter()
            .map(|spec| {
                let rule = match spec {
                    ScheduleSpec::Crontab(line) => CronRule::from_crontab(line)?,
                    ScheduleSpec::Fields(fields) => CronRule::from_fields(fields)?,
                };
                Ok(Self::cron(rule, timezone))
            })
            .collect::<Result<Vec<_>, ScheduleError>>()?;

        match children.len() {
            0 => Err(ScheduleError::EmptyTrigger),
            1 => Ok(children.remove(0)),
            _ => Ok(Trigger::Any(children)),
        }
    }

    /// OR-combine triggers. Nested composites are flattened.
    pub fn any(triggers: impl IntoIterator<Item = Trigger>) -> Result<Self, ScheduleError> {
        let mut children = Vec::new();
        for trigger in triggers {
            match trigger {
                Trigger::Any(nested) => children.extend(nested),
                cron => children.push(cron),
            }
        }

        match children.len() {
            0 => Err(ScheduleError::EmptyTrigger),
            1 => Ok(children.remove(0)),
            _ => Ok(Trigger::Any(children)),
        }
    }

    /// Smallest fire time strictly after `after`, or `None` if the schedule
    /// runs past the representable date range.
    pub fn next_fire_time(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Trigger::Cron(c) => c.rule.next_after(after),
            Trigger::Any(children) => children
                .iter()
                .filter_map(|child| child.next_fire_time(after))
                .min(),
        }
    }

    /// Smallest fire time at or after `from`.
    pub fn first_fire_at_or_after(&self, from: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Trigger::Cron(c) => c.rule.first_at_or_after(from),
            Trigger::Any(children) => children
                .iter()
                .filter_map(|child| child.first_fire_at_or_after(from))
                .min(),
        }
    }

    /// True iff `t` is exactly a fire time of some rule set.
    pub fn matches(&self, t: NaiveDateTime) -> bool {
        match self {
            Trigger::Cron(c) => c.rule.matches(t),
            Trigger::Any(children) => children.iter().any(|child| child.matches(t)),
        }
    }

    /// An equivalent trigger evaluated in `timezone`. `self` is untouched.
    pub fn with_timezone(&self, timezone: Tz) -> Self {
        match self {
            Trigger::Cron(c) => Self::cron(c.rule.clone(), timezone),
            Trigger::Any(children) => {
                Trigger::Any(children.iter().map(|c| c.with_timezone(timezone)).collect())
            }
        }
    }

    /// Next fire instant strictly after `after`, with local fire times mapped
    /// through the bound timezone.
    ///
    /// Local times that fall into a DST gap do not exist and are skipped.
    /// Local times repeated by a DST fold fire on their earliest occurrence
    /// that is still after `after`.
    pub fn next_fire_time_utc(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron(c) => c.next_fire_time_utc(after),
            Trigger::Any(children) => children
                .iter()
                .filter_map(|child| child.next_fire_time_utc(after))
                .min(),
        }
    }

    /// Number of rule sets in this trigger.
    pub fn rule_count(&self) -> usize {
        match self {
            Trigger::Cron(_) => 1,
            Trigger::Any(children) => children.iter().map(Trigger::rule_count).sum(),
        }
    }
}

impl CronTrigger {
    fn next_fire_time_utc(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        let naive = local.naive_local();
        let forward = self.first_instant_after(naive, after);

        // On the first pass through a fold the wall-clock times just behind
        // us come round again.
        let repeated = match self.timezone.from_local_datetime(&naive) {
            LocalResult::Ambiguous(earlier, later) if earlier == local => {
                let shift = earlier.offset().fix().local_minus_utc()
                    - later.offset().fix().local_minus_utc();
                naive
                    .checked_sub_signed(Duration::seconds(i64::from(shift)))
                    .and_then(|from| self.rule.next_after(from))
                    .filter(|candidate| *candidate <= naive)
                    .and_then(|candidate| match self.timezone.from_local_datetime(&candidate) {
                        LocalResult::Ambiguous(_, later) => Some(later.with_timezone(&Utc)),
                        _ => None,
                    })
            }
            _ => None,
        };

        match (forward, repeated) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn first_instant_after(
        &self,
        mut local: NaiveDateTime,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        for _ in 0..MAX_UTC_CANDIDATES {
            let candidate = self.rule.next_after(local)?;
            let instant = match self.timezone.from_local_datetime(&candidate) {
                LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
                LocalResult::Ambiguous(first, second) => [first, second]
                    .into_iter()
                    .map(|dt| dt.with_timezone(&Utc))
                    .find(|dt| *dt > after),
                LocalResult::None => None,
            };

            match instant {
                Some(instant) if instant > after => return Some(instant),
                _ => local = candidate,
            }
        }

        None
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Cron(c) => write!(f, "cron[{}] ({})", c.rule, c.timezone),
            Trigger::Any(children) => {
                write!(f, "any(")?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::spec::{FieldSpec, FieldValue};
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(&ts(y, m, d, h, min, 0))
    }

    // =========================================================================
    // Composite Tests
    // =========================================================================

    #[test]
    fn test_any_takes_minimum_of_children() {
        let trigger = Trigger::any([
            Trigger::from_crontab("0 16 * * *").unwrap(),
            Trigger::from_crontab("30 9 * * *").unwrap(),
        ])
        .unwrap();

        let t = ts(2024, 1, 2, 10, 0, 0);
        assert_eq!(trigger.next_fire_time(t), Some(ts(2024, 1, 2, 16, 0, 0)));
        assert!(trigger.matches(ts(2024, 1, 3, 9, 30, 0)));
        assert!(trigger.matches(ts(2024, 1, 3, 16, 0, 0)));
        assert!(!trigger.matches(ts(2024, 1, 3, 12, 0, 0)));
    }

    #[test]
    fn test_any_flattens_nested_composites() {
        let inner = Trigger::any([
            Trigger::from_crontab("0 10 * * *").unwrap(),
            Trigger::from_crontab("0 11 * * *").unwrap(),
        ])
        .unwrap();
        let outer = Trigger::any([inner, Trigger::from_crontab("0 12 * * *").unwrap()]).unwrap();

        assert_eq!(outer.rule_count(), 3);
        assert!(matches!(outer, Trigger::Any(ref c) if c.len() == 3));
    }

    #[test]
    fn test_empty_trigger_is_an_error() {
        assert_eq!(
            Trigger::from_specs(&[], DEFAULT_TIMEZONE),
            Err(ScheduleError::EmptyTrigger)
        );
        assert_eq!(
            Trigger::any(Vec::new()),
            Err(ScheduleError::EmptyTrigger)
        );
    }

    #[test]
    fn test_from_specs_mixes_crontab_and_fields() {
        let specs = vec![
            ScheduleSpec::from("30 9 * * *"),
            ScheduleSpec::Fields(FieldSpec {
                second: Some(FieldValue::Number(30)),
                minute: Some(FieldValue::Number(30)),
                hour: Some(FieldValue::Text("13".to_string())),
                day_of_week: Some(FieldValue::Text("mon-fri".to_string())),
            }),
        ];
        let trigger = Trigger::from_specs(&specs, DEFAULT_TIMEZONE).unwrap();

        assert_eq!(trigger.rule_count(), 2);
        assert!(trigger.matches(ts(2024, 1, 6, 9, 30, 0)));
        assert!(trigger.matches(ts(2024, 1, 5, 13, 30, 30)));
        assert!(!trigger.matches(ts(2024, 1, 6, 13, 30, 30)));
    }

    #[test]
    fn test_match_and_next_agree() {
        let trigger = Trigger::from_crontab("*/15 9-16 * * mon-fri").unwrap();
        let t = ts(2024, 1, 2, 9, 14, 59);
        let next = trigger.next_fire_time(t).unwrap();
        assert_eq!(next, ts(2024, 1, 2, 9, 15, 0));
        assert!(trigger.matches(next));
        assert_eq!(trigger.first_fire_at_or_after(next), Some(next));
    }

    // =========================================================================
    // Timezone Tests
    // =========================================================================

    #[test]
    fn test_with_timezone_derives_copy() {
        let original = Trigger::from_crontab("30 9 * * *").unwrap();
        let london = original.with_timezone(chrono_tz::Europe::London);

        assert!(matches!(&original, Trigger::Cron(c) if c.timezone == DEFAULT_TIMEZONE));
        assert!(matches!(&london, Trigger::Cron(c) if c.timezone == chrono_tz::Europe::London));

        let t = ts(2024, 3, 1, 0, 0, 0);
        assert_eq!(original.next_fire_time(t), london.next_fire_time(t));
    }

    #[test]
    fn test_next_fire_time_utc_follows_dst() {
        let trigger = Trigger::from_crontab("30 9 * * *").unwrap();
        // EST: 09:30 local = 14:30 UTC
        assert_eq!(
            trigger.next_fire_time_utc(utc(2024, 1, 2, 0, 0)),
            Some(utc(2024, 1, 2, 14, 30))
        );
        // EDT: 09:30 local = 13:30 UTC
        assert_eq!(
            trigger.next_fire_time_utc(utc(2024, 7, 2, 0, 0)),
            Some(utc(2024, 7, 2, 13, 30))
        );
    }

    #[test]
    fn test_next_fire_time_utc_skips_dst_gap() {
        // 2024-03-10 02:30 does not exist in New York
        let trigger = Trigger::from_crontab("30 2 * * *").unwrap();
        assert_eq!(
            trigger.next_fire_time_utc(utc(2024, 3, 10, 5, 0)),
            Some(utc(2024, 3, 11, 6, 30))
        );
    }

    #[test]
    fn test_next_fire_time_utc_fold_fires_once_per_occurrence() {
        // 2024-11-03 01:30 happens twice in New York
        let trigger = Trigger::from_crontab("30 1 * * *").unwrap();
        let first = trigger.next_fire_time_utc(utc(2024, 11, 3, 4, 0)).unwrap();
        assert_eq!(first, utc(2024, 11, 3, 5, 30));
        let second = trigger.next_fire_time_utc(first).unwrap();
        assert_eq!(second, utc(2024, 11, 3, 6, 30));
    }

    #[test]
    fn test_parse_timezone() {
        assert_eq!(parse_timezone("Europe/London"), Ok(chrono_tz::Europe::London));
        assert!(matches!(
            parse_timezone("Mars/Olympus"),
            Err(ScheduleError::UnknownTimezone(_))
        ));
    }

    // =========================================================================
    // Property Tests
    // =========================================================================

    fn field_expr(max: u32) -> impl Strategy<Value = String> {
        prop_oneof![
            Just("*".to_string()),
            (0..=max).prop_map(|v| v.to_string()),
            (0..=max, 0..=max).prop_map(|(a, b)| format!("{}-{}", a.min(b), a.max(b))),
            (1..=max).prop_map(|s| format!("*/{}", s)),
            proptest::collection::vec(0..=max, 1..4).prop_map(|vs| {
                vs.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
            }),
        ]
    }

    fn crontab() -> impl Strategy<Value = String> {
        (field_expr(59), field_expr(23), field_expr(6))
            .prop_map(|(m, h, d)| format!("{} {} * * {}", m, h, d))
    }

    proptest! {
        #[test]
        fn prop_next_fire_time_is_increasing_and_matches(
            lines in proptest::collection::vec(crontab(), 1..4),
            start_offset in 0i64..(5 * 365 * 24 * 3600),
        ) {
            let children = lines
                .iter()
                .map(|l| Trigger::from_crontab(l).unwrap())
                .collect::<Vec<_>>();
            let trigger = Trigger::any(children).unwrap();

            let mut t = ts(2020, 1, 1, 0, 0, 0) + chrono::Duration::seconds(start_offset);
            for _ in 0..50 {
                let next = trigger.next_fire_time(t).unwrap();
                prop_assert!(next > t);
                prop_assert!(trigger.matches(next));
                t = next;
            }
        }

        #[test]
        fn prop_no_match_is_skipped(
            line in crontab(),
            start_offset in 0i64..(365 * 24 * 3600),
        ) {
            let trigger = Trigger::from_crontab(&line).unwrap();
            let t = ts(2021, 1, 1, 0, 0, 0) + chrono::Duration::seconds(start_offset);
            let next = trigger.next_fire_time(t).unwrap();

            // every whole minute strictly between t and next must not match
            let mut candidate = t + chrono::Duration::seconds(60 - (t.and_utc().timestamp() % 60));
            let mut checked = 0;
            while candidate < next && checked < 2000 {
                prop_assert!(!trigger.matches(candidate));
                candidate += chrono::Duration::minutes(1);
                checked += 1;
            }
        }
    }
}
