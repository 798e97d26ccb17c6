//! Calendar field rules: the per-field building block of a cron rule set.

use crate::error::ScheduleError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The calendar fields a rule set constrains, in ascending significance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Second,
    Minute,
    Hour,
    DayOfWeek,
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Field::Second => "second",
            Field::Minute => "minute",
            Field::Hour => "hour",
            Field::DayOfWeek => "day_of_week",
        }
    }

    pub fn min(self) -> u32 {
        0
    }

    pub fn max(self) -> u32 {
        match self {
            Field::Second | Field::Minute => 59,
            Field::Hour => 23,
            Field::DayOfWeek => 6,
        }
    }
}

const WEEKDAY_NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

/// A single field constraint.
///
/// Lists are stored sorted and deduplicated so lookups can walk them in
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldRule {
    Any,
    Fixed(u32),
    List(Vec<u32>),
    Range { start: u32, end: u32, step: u32 },
}

impl FieldRule {
    /// Parse an expression such as `*`, `5`, `1,15,30`, `9-16`, `*/15`,
    /// `mon-fri` or `0-30/10` for the given field.
    pub fn parse(field: Field, expr: &str) -> Result<Self, ScheduleError> {
        let expr = expr.trim().to_ascii_lowercase();
        if expr.is_empty() {
            return Err(ScheduleError::EmptyExpression { field: field.name() });
        }

        if expr == "*" || expr == "?" {
            return Ok(FieldRule::Any);
        }

        if expr.contains(',') {
            let mut values = Vec::new();
            for part in expr.split(',') {
                match Self::parse_term(field, part)? {
                    FieldRule::Fixed(v) => values.push(v),
                    FieldRule::Range { start, end, step } => {
                        values.extend((start..=end).step_by(step as usize))
                    }
                    // parse_term never yields these
                    FieldRule::Any | FieldRule::List(_) => {
                        return Err(invalid(field, &expr, "wildcard inside a list"))
                    }
                }
            }
            values.sort_unstable();
            values.dedup();
            return Ok(FieldRule::List(values));
        }

        Self::parse_term(field, &expr)
    }

    /// Parse one list element: a value, a range, or a stepped range.
    fn parse_term(field: Field, term: &str) -> Result<Self, ScheduleError> {
        let term = term.trim();
        if term.is_empty() {
            return Err(ScheduleError::EmptyExpression { field: field.name() });
        }

        let (body, step) = match term.split_once('/') {
            Some((body, step)) => {
                let step: u32 = step
                    .trim()
                    .parse()
                    .map_err(|_| invalid(field, term, "step is not a number"))?;
                if step == 0 {
                    return Err(invalid(field, term, "step must be positive"));
                }
                (body.trim(), Some(step))
            }
            None => (term, None),
        };

        let (start, end) = if body == "*" {
            (field.min(), field.max())
        } else if let Some((lo, hi)) = body.split_once('-') {
            (parse_value(field, lo)?, parse_value(field, hi)?)
        } else {
            let value = parse_value(field, body)?;
            match step {
                // `5/10` means "from 5 to the end in steps of 10"
                Some(_) => (value, field.max()),
                None => return Ok(FieldRule::Fixed(value)),
            }
        };

        if start > end {
            return Err(invalid(field, term, "range start is after range end"));
        }

        Ok(FieldRule::Range {
            start,
            end,
            step: step.unwrap_or(1),
        })
    }

    /// Check that every value lies inside the field's bounds and that the
    /// rule admits at least one value.
    pub fn validate(&self, field: Field) -> Result<(), ScheduleError> {
        let check = |value: u32| {
            if value < field.min() || value > field.max() {
                Err(ScheduleError::OutOfRange {
                    field: field.name(),
                    value,
                    min: field.min(),
                    max: field.max(),
                })
            } else {
                Ok(())
            }
        };

        match self {
            FieldRule::Any => Ok(()),
            FieldRule::Fixed(v) => check(*v),
            FieldRule::List(values) => {
                if values.is_empty() {
                    return Err(ScheduleError::EmptyExpression { field: field.name() });
                }
                values.iter().try_for_each(|v| check(*v))
            }
            FieldRule::Range { start, end, step } => {
                check(*start)?;
                check(*end)?;
                if start > end || *step == 0 {
                    return Err(invalid(field, &self.to_string(), "empty range"));
                }
                Ok(())
            }
        }
    }

    /// Does `value` satisfy this rule?
    pub fn matches(&self, value: u32) -> bool {
        match self {
            FieldRule::Any => true,
            FieldRule::Fixed(v) => *v == value,
            FieldRule::List(values) => values.binary_search(&value).is_ok(),
            FieldRule::Range { start, end, step } => {
                value >= *start && value <= *end && (value - start) % step == 0
            }
        }
    }

    /// Smallest admitted value that is `>= value` and within the field's
    /// bounds, or `None` if the field has to roll over.
    pub fn next_at_or_after(&self, field: Field, value: u32) -> Option<u32> {
        let candidate = match self {
            FieldRule::Any => Some(value.max(field.min())),
            FieldRule::Fixed(v) => (*v >= value).then_some(*v),
            FieldRule::List(values) => values.iter().copied().find(|v| *v >= value),
            FieldRule::Range { start, end, step } => {
                if value <= *start {
                    Some(*start)
                } else {
                    let offset = value - start;
                    let aligned = start + offset.div_ceil(*step) * step;
                    (aligned <= *end).then_some(aligned)
                }
            }
        };
        candidate.filter(|v| *v <= field.max())
    }

    /// Smallest admitted value of the field.
    pub fn first(&self, field: Field) -> Option<u32> {
        self.next_at_or_after(field, field.min())
    }
}

impl fmt::Display for FieldRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldRule::Any => write!(f, "*"),
            FieldRule::Fixed(v) => write!(f, "{}", v),
            FieldRule::List(values) => {
                let parts: Vec<String> = values.iter().map(u32::to_string).collect();
                write!(f, "{}", parts.join(","))
            }
            FieldRule::Range { start, end, step } if *step == 1 => write!(f, "{}-{}", start, end),
            FieldRule::Range { start, end, step } => write!(f, "{}-{}/{}", start, end, step),
        }
    }
}

fn parse_value(field: Field, raw: &str) -> Result<u32, ScheduleError> {
    let raw = raw.trim();
    if field == Field::DayOfWeek {
        if let Some(idx) = WEEKDAY_NAMES.iter().position(|name| *name == raw) {
            return Ok(idx as u32);
        }
    }

    let value: u32 = raw
        .parse()
        .map_err(|_| invalid(field, raw, "not a number"))?;

    if value > field.max() {
        return Err(ScheduleError::OutOfRange {
            field: field.name(),
            value,
            min: field.min(),
            max: field.max(),
        });
    }
    Ok(value)
}

fn invalid(field: Field, expr: &str, reason: &str) -> ScheduleError {
    ScheduleError::InvalidExpression {
        field: field.name(),
        expr: expr.to_string(),
        reason: reason.to_string(),
    }
}
