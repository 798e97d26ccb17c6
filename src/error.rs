//! Error taxonomy for the backtester.
//!
//! Order rejections are not errors: they are reported as values by the
//! broker (see [`crate::broker::Rejection`]). The types here cover the two
//! fatal classes, configuration problems and data problems.

use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;

/// Invalid or unsatisfiable schedule definitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("empty expression for field `{field}`")]
    EmptyExpression { field: &'static str },

    #[error("invalid expression `{expr}` for field `{field}`: {reason}")]
    InvalidExpression {
        field: &'static str,
        expr: String,
        reason: String,
    },

    #[error("value {value} out of range {min}..={max} for field `{field}`")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("crontab `{0}` must have 5 fields (minute hour day month day_of_week)")]
    CrontabArity(String),

    #[error("crontab field `{field}` must be `*`, got `{expr}`")]
    UnsupportedField { field: &'static str, expr: String },

    #[error("unknown timezone `{0}`")]
    UnknownTimezone(String),

    #[error("trigger has no rule sets")]
    EmptyTrigger,

    #[error("no fire time on a trading day after {after} within {attempts} calendar skips")]
    NoTradingDayFire {
        after: NaiveDateTime,
        attempts: u32,
    },
}

/// Failures of the market data provider. Always fatal to a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("unknown symbol `{0}`")]
    UnknownSymbol(String),

    #[error("no data for `{symbol}` at or before {at}")]
    OutOfCoverage { symbol: String, at: NaiveDateTime },

    #[error("unknown price field `{0}`")]
    UnknownField(String),

    #[error("malformed bar data at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("cannot count {days} trading days back from {from}: calendar closed too long")]
    CalendarExhausted { from: NaiveDate, days: u32 },
}

/// Errors that abort setup or a running backtest.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("virtual clock cannot move backwards from {now} to {requested}")]
    ClockRegression {
        now: NaiveDateTime,
        requested: NaiveDateTime,
    },

    #[error("{requested} falls on {date}, which is not a trading day")]
    NonTradingDay {
        date: NaiveDate,
        requested: NaiveDateTime,
    },

    #[error("backtest is {state}, cannot {action}")]
    InvalidState {
        state: &'static str,
        action: &'static str,
    },

    #[error("strategy `{strategy}` failed: {source}")]
    Strategy {
        strategy: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
