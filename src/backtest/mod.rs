//! Backtesting module.
//!
//! This module provides:
//! - The virtual clock and trading-day fire time search
//! - The discrete-event simulation engine
//! - Performance metrics calculation
//! - Report sinks for the finished run
//!
//! # Example
//!
//! ```rust,ignore
//! use algo_backtester::backtest::{BacktestEngine, BacktestSettings};
//! use algo_backtester::calendar::ExchangeCalendar;
//! use algo_backtester::data::BarDataProvider;
//! use algo_backtester::schedule::Trigger;
//!
//! let data = BarDataProvider::load("data/spy_daily.csv")?;
//! let settings = BacktestSettings::new(start, end, dec!(10000), Trigger::from_crontab("0 16 * * *")?)
//!     .with_benchmark("SPY");
//! let mut engine = BacktestEngine::new(settings, data, ExchangeCalendar::nyse())?;
//! engine.add_strategy(Box::new(strategy))?;
//!
//! let report = engine.run()?;
//! println!("{}", report.summary());
//! ```

mod clock;
mod engine;
mod metrics;
mod report;

pub use clock::{advance_to_next_trading_fire_time, VirtualClock, DEFAULT_MAX_CALENDAR_SKIPS};
pub use engine::{BacktestEngine, BacktestSettings, RunState, StopHandle};
pub use metrics::{BacktestMetrics, RunCounts, Snapshot};
pub use report::{BacktestReport, CsvReportSink, ReportSink, EQUITY_CSV_HEADER};
