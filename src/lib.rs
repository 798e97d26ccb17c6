//! # Algo Backtester
//!
//! A calendar-aware, cron-scheduled strategy backtesting engine with a
//! simulated broker.
//!
//! ## Architecture
//!
//! - `schedule`: Cron-like triggers with analytic next-fire-time search
//! - `calendar`: Exchange trading-day calendars
//! - `data`: Point-in-time market data provider contract and CSV bars
//! - `broker`: Simulated account, market and conditional orders
//! - `strategy`: Strategy contract, context capability and the MACD demo
//! - `backtest`: Virtual clock, simulation loop, metrics and reports
//! - `persistence`: SQLite archive of finished runs
//! - `config`: Configuration management and validation
//! - `utils`: Shared utilities and decimal arithmetic

pub mod backtest;
pub mod broker;
pub mod calendar;
pub mod config;
pub mod data;
pub mod error;
pub mod persistence;
pub mod schedule;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use error::{DataError, EngineError, EngineResult, ScheduleError};
