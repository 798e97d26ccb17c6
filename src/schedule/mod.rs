//! Schedule engine.
//!
//! A [`Trigger`] is an OR-combination of cron-like rule sets over
//! `{second, minute, hour, day_of_week}`. Fire times are derived
//! analytically; `next_fire_time` and `matches` always agree.

mod cron;
mod field;
mod spec;
mod trigger;

pub use cron::CronRule;
pub use field::{Field, FieldRule};
pub use spec::{FieldSpec, FieldValue, ScheduleSpec};
pub use trigger::{parse_timezone, CronTrigger, Trigger, DEFAULT_TIMEZONE};
