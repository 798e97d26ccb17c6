//! Configuration management for the backtester.
//!
//! Loads settings from an optional `config` file and `ALGO__`-prefixed
//! environment variables.

use crate::backtest::{BacktestSettings, DEFAULT_MAX_CALENDAR_SKIPS};
use crate::calendar::{CalendarKind, ExchangeCalendar};
use crate::schedule::{parse_timezone, ScheduleSpec, Trigger};
use crate::strategy::MacdParams;
use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Run bounds and loop options
    #[serde(default)]
    pub backtest: BacktestConfig,
    /// Exchange calendar
    #[serde(default)]
    pub calendar: CalendarConfig,
    /// Market data source
    #[serde(default)]
    pub data: DataConfig,
    /// Bundled MACD strategy
    #[serde(default)]
    pub strategy: MacdParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// First instant of the run (inclusive). Required.
    #[serde(default)]
    pub start: Option<NaiveDateTime>,
    /// Last instant of the run (exclusive). Required.
    #[serde(default)]
    pub end: Option<NaiveDateTime>,
    #[serde(default = "default_initial_cash")]
    pub initial_cash: Decimal,
    /// Symbol quoted with every snapshot; empty disables it
    #[serde(default = "default_benchmark")]
    pub benchmark: Option<String>,
    /// When to snapshot the portfolio
    #[serde(default = "default_log_schedule")]
    pub log_schedule: Vec<ScheduleSpec>,
    /// IANA timezone the schedules are written in
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Consecutive closed days tolerated when searching for a fire time
    #[serde(default = "default_max_calendar_skips")]
    pub max_calendar_skips: u32,
    #[serde(default = "default_record_snapshots")]
    pub record_snapshots: bool,
    /// Steps between progress log lines
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    #[serde(default = "default_exchange")]
    pub exchange: CalendarKind,
    /// Closures on top of the exchange rules
    #[serde(default)]
    pub extra_holidays: Vec<NaiveDate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataConfig {
    /// Bar CSV (`start,end,symbol,open,high,low,close,volume`)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_initial_cash() -> Decimal {
    Decimal::new(10000, 0)
}

fn default_benchmark() -> Option<String> {
    Some("SPY".to_string())
}

fn default_log_schedule() -> Vec<ScheduleSpec> {
    vec![ScheduleSpec::from("30 9 * * *")]
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

fn default_max_calendar_skips() -> u32 {
    DEFAULT_MAX_CALENDAR_SKIPS
}

fn default_record_snapshots() -> bool {
    true
}

fn default_progress_every() -> u64 {
    500
}

fn default_exchange() -> CalendarKind {
    CalendarKind::Nyse
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            initial_cash: default_initial_cash(),
            benchmark: default_benchmark(),
            log_schedule: default_log_schedule(),
            timezone: default_timezone(),
            max_calendar_skips: default_max_calendar_skips(),
            record_snapshots: default_record_snapshots(),
            progress_every: default_progress_every(),
        }
    }
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            extra_holidays: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from `config.*` in the working directory (if
    /// present) and environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration from an explicit file, or the default lookup
    /// when `path` is `None`. Environment variables override both.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("config").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::default().separator("__").prefix("ALGO"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let bt = &self.backtest;
        let (start, end) = self.bounds()?;
        anyhow::ensure!(start < end, "backtest.start ({start}) must be before backtest.end ({end})");

        anyhow::ensure!(
            bt.initial_cash > Decimal::ZERO,
            "backtest.initial_cash must be positive"
        );

        anyhow::ensure!(
            bt.max_calendar_skips >= 1,
            "backtest.max_calendar_skips must be at least 1"
        );

        let tz = self.timezone()?;
        Trigger::from_specs(&bt.log_schedule, tz).context("Invalid backtest.log_schedule")?;
        Trigger::from_specs(&self.strategy.schedule, tz).context("Invalid strategy.schedule")?;

        Ok(())
    }

    /// Run bounds; both must be configured.
    pub fn bounds(&self) -> Result<(NaiveDateTime, NaiveDateTime)> {
        let start = self
            .backtest
            .start
            .context("backtest.start is required")?;
        let end = self.backtest.end.context("backtest.end is required")?;
        Ok((start, end))
    }

    pub fn timezone(&self) -> Result<Tz> {
        parse_timezone(&self.backtest.timezone).context("Invalid backtest.timezone")
    }

    pub fn exchange_calendar(&self) -> ExchangeCalendar {
        ExchangeCalendar::new(self.calendar.exchange)
            .with_extra_holidays(self.calendar.extra_holidays.iter().copied())
    }

    /// Engine settings for this configuration.
    pub fn backtest_settings(&self) -> Result<BacktestSettings> {
        let bt = &self.backtest;
        let (start, end) = self.bounds()?;
        let log_trigger = Trigger::from_specs(&bt.log_schedule, self.timezone()?)
            .context("Invalid backtest.log_schedule")?;

        let mut settings = BacktestSettings::new(start, end, bt.initial_cash, log_trigger);
        settings.benchmark = bt.benchmark.clone().filter(|s| !s.is_empty());
        settings.max_calendar_skips = bt.max_calendar_skips;
        settings.record_snapshots = bt.record_snapshots;
        settings.progress_every = bt.progress_every;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::FieldValue;
    use rust_decimal_macros::dec;

    fn from_toml(toml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    const MINIMAL: &str = r#"
        [backtest]
        start = "2024-01-02T00:00:00"
        end = "2024-03-01T00:00:00"
    "#;

    #[test]
    fn test_defaults_fill_unset_values() {
        let config = from_toml(MINIMAL);
        assert!(config.validate().is_ok());

        assert_eq!(config.backtest.initial_cash, dec!(10000));
        assert_eq!(config.backtest.benchmark.as_deref(), Some("SPY"));
        assert_eq!(config.backtest.max_calendar_skips, 30);
        assert_eq!(config.calendar.exchange, CalendarKind::Nyse);
        assert_eq!(config.strategy, MacdParams::default());
    }

    #[test]
    fn test_bounds_are_required() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("backtest.start is required"));
    }

    #[test]
    fn test_inverted_bounds_are_rejected() {
        let config = from_toml(
            r#"
            [backtest]
            start = "2024-03-01T00:00:00"
            end = "2024-01-02T00:00:00"
        "#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keyword_and_crontab_schedules() {
        let config = from_toml(
            r#"
            [backtest]
            start = "2024-01-02T00:00:00"
            end = "2024-03-01T00:00:00"
            log_schedule = ["0 16 * * *"]

            [strategy]
            symbol = "QQQ"
            schedule = [{ minute = 30, hour = "9", day_of_week = "mon-fri" }]
        "#,
        );
        assert!(config.validate().is_ok());

        match &config.strategy.schedule[0] {
            ScheduleSpec::Fields(f) => {
                assert_eq!(f.minute, Some(FieldValue::Number(30)));
                assert_eq!(f.day_of_week, Some(FieldValue::Text("mon-fri".to_string())));
            }
            other => panic!("expected keyword spec, got {:?}", other),
        }
        assert_eq!(config.strategy.symbol, "QQQ");
    }

    #[test]
    fn test_invalid_schedule_fails_validation() {
        let config = from_toml(
            r#"
            [backtest]
            start = "2024-01-02T00:00:00"
            end = "2024-03-01T00:00:00"
            log_schedule = ["61 9 * * *"]
        "#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_and_calendar() {
        let config = from_toml(
            r#"
            [backtest]
            start = "2024-01-02T00:00:00"
            end = "2024-03-01T00:00:00"
            initial_cash = 25000
            benchmark = ""

            [calendar]
            exchange = "weekdays"
            extra_holidays = ["2024-01-03"]
        "#,
        );

        let settings = config.backtest_settings().unwrap();
        assert_eq!(settings.initial_cash, dec!(25000));
        assert_eq!(settings.benchmark, None);

        use crate::calendar::TradingCalendar;
        let calendar = config.exchange_calendar();
        assert_eq!(calendar.kind(), CalendarKind::Weekdays);
        assert!(!calendar.is_trading_day(NaiveDate::from_ymd_opt(2024, 1, 3).unwrap()));
        assert!(calendar.is_trading_day(NaiveDate::from_ymd_opt(2024, 1, 4).unwrap()));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backtest.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = Config::load_from(Some(&path)).unwrap();
        assert!(config.backtest.start.is_some());
    }
}
