//! Backtesting simulation engine.
//!
//! Steps a virtual clock through the merged fire times of every registered
//! strategy and the logging trigger, on trading days only.

use crate::backtest::clock::{
    advance_to_next_trading_fire_time, VirtualClock, DEFAULT_MAX_CALENDAR_SKIPS,
};
use crate::backtest::metrics::{BacktestMetrics, RunCounts, Snapshot};
use crate::backtest::report::{BacktestReport, ReportSink};
use crate::broker::Portfolio;
use crate::calendar::TradingCalendar;
use crate::data::DataProvider;
use crate::error::{DataError, EngineError, EngineResult};
use crate::schedule::Trigger;
use crate::strategy::{Strategy, StrategyContext};
use chrono::{Duration, NaiveDateTime};
use rust_decimal::Decimal;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Run bounds and loop options. There is no ambient-time fallback: `start`
/// and `end` are always explicit.
#[derive(Debug, Clone)]
pub struct BacktestSettings {
    pub start: NaiveDateTime,
    /// Exclusive
    pub end: NaiveDateTime,
    pub initial_cash: Decimal,
    /// Symbol quoted alongside every snapshot
    pub benchmark: Option<String>,
    /// When to snapshot the portfolio
    pub log_trigger: Trigger,
    pub max_calendar_skips: u32,
    pub record_snapshots: bool,
    /// Steps between progress log lines
    pub progress_every: u64,
}

impl BacktestSettings {
    pub fn new(
        start: NaiveDateTime,
        end: NaiveDateTime,
        initial_cash: Decimal,
        log_trigger: Trigger,
    ) -> Self {
        Self {
            start,
            end,
            initial_cash,
            benchmark: None,
            log_trigger,
            max_calendar_skips: DEFAULT_MAX_CALENDAR_SKIPS,
            record_snapshots: true,
            progress_every: 500,
        }
    }

    pub fn with_benchmark(mut self, symbol: impl Into<String>) -> Self {
        self.benchmark = Some(symbol.into());
        self
    }

    fn validate(&self) -> EngineResult<()> {
        if self.start >= self.end {
            return Err(EngineError::Config(format!(
                "start {} must be before end {}",
                self.start, self.end
            )));
        }
        if self.initial_cash <= Decimal::ZERO {
            return Err(EngineError::Config(format!(
                "initial cash must be positive, got {}",
                self.initial_cash
            )));
        }
        if self.max_calendar_skips == 0 {
            return Err(EngineError::Config(
                "max_calendar_skips must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Finished,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Finished => "finished",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests a cooperative stop. Checked between steps; a strategy that is
/// already running finishes first.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The backtesting simulation engine. Owns the clock, the portfolio and
/// every registered strategy.
pub struct BacktestEngine<D: DataProvider> {
    settings: BacktestSettings,
    data: D,
    calendar: Box<dyn TradingCalendar>,
    strategies: Vec<Box<dyn Strategy>>,
    portfolio: Portfolio,
    clock: VirtualClock,
    state: RunState,
    stop: StopHandle,
    composite: Option<Trigger>,
    last_fire: Option<NaiveDateTime>,

    // Tracking for metrics
    snapshots: Vec<Snapshot>,
    fire_times: Vec<NaiveDateTime>,
    peak_value: Decimal,
    fires: u64,
    stopped_early: bool,
}

impl<D: DataProvider> BacktestEngine<D> {
    /// Create an engine in the `Idle` state. Fails on invalid bounds.
    pub fn new(
        settings: BacktestSettings,
        data: D,
        calendar: impl TradingCalendar + 'static,
    ) -> EngineResult<Self> {
        settings.validate()?;

        Ok(Self {
            portfolio: Portfolio::new(settings.initial_cash),
            clock: VirtualClock::new(settings.start),
            peak_value: settings.initial_cash,
            settings,
            data,
            calendar: Box::new(calendar),
            strategies: Vec::new(),
            state: RunState::Idle,
            stop: StopHandle::default(),
            composite: None,
            last_fire: None,
            snapshots: Vec::new(),
            fire_times: Vec::new(),
            fires: 0,
            stopped_early: false,
        })
    }

    /// Register a strategy. Strategies run in registration order when they
    /// share a fire time.
    pub fn add_strategy(&mut self, strategy: Box<dyn Strategy>) -> EngineResult<()> {
        if self.state != RunState::Idle {
            return Err(EngineError::InvalidState {
                state: self.state.as_str(),
                action: "add a strategy",
            });
        }

        info!(strategy = %strategy.name(), trigger = %strategy.trigger(), "Strategy registered");
        self.strategies.push(strategy);
        Ok(())
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Validate every schedule against the calendar and enter `Running`.
    ///
    /// A trigger that cannot reach a trading day within the skip cap is a
    /// configuration error and the run never starts.
    pub fn start(&mut self) -> EngineResult<()> {
        if self.state != RunState::Idle {
            return Err(EngineError::InvalidState {
                state: self.state.as_str(),
                action: "start",
            });
        }

        let seed = self.seed();
        let skips = self.settings.max_calendar_skips;
        for strategy in &self.strategies {
            advance_to_next_trading_fire_time(strategy.trigger(), self.calendar.as_ref(), seed, skips)?;
        }
        advance_to_next_trading_fire_time(
            &self.settings.log_trigger,
            self.calendar.as_ref(),
            seed,
            skips,
        )?;

        let triggers = self
            .strategies
            .iter()
            .map(|s| s.trigger().clone())
            .chain(std::iter::once(self.settings.log_trigger.clone()));
        self.composite = Some(Trigger::any(triggers)?);
        self.state = RunState::Running;

        info!(
            start = %self.settings.start,
            end = %self.settings.end,
            strategies = self.strategies.len(),
            initial_cash = %self.settings.initial_cash,
            "Starting backtest"
        );
        Ok(())
    }

    /// Advance to the next fire time and process it.
    ///
    /// Returns the instant processed, or `None` once the run has finished.
    pub fn step(&mut self) -> EngineResult<Option<NaiveDateTime>> {
        if self.state != RunState::Running {
            return Err(EngineError::InvalidState {
                state: self.state.as_str(),
                action: "step",
            });
        }

        if self.stop.is_stop_requested() {
            warn!(now = %self.clock.now(), "Stop requested, finishing early");
            self.stopped_early = true;
            self.finish()?;
            return Ok(None);
        }

        let Some(composite) = self.composite.as_ref() else {
            return Err(EngineError::InvalidState {
                state: self.state.as_str(),
                action: "step without a schedule",
            });
        };

        let after = self.last_fire.unwrap_or_else(|| self.seed());
        let next = advance_to_next_trading_fire_time(
            composite,
            self.calendar.as_ref(),
            after,
            self.settings.max_calendar_skips,
        )?;
        let now = match next {
            Some(t) if t < self.settings.end => t,
            _ => {
                self.finish()?;
                return Ok(None);
            }
        };

        self.clock.advance_to(now, self.calendar.as_ref())?;
        self.last_fire = Some(now);
        self.fire_times.push(now);

        // Conditional orders see the elapsed interval before any strategy acts
        let fills = self.portfolio.check_pending(&self.data, now)?;
        if !fills.is_empty() {
            debug!(%now, fills = fills.len(), "Pending orders filled");
        }

        for strategy in self.strategies.iter_mut() {
            if !strategy.trigger().matches(now) {
                continue;
            }

            self.fires += 1;
            let mut ctx =
                StrategyContext::new(now, &mut self.portfolio, &self.data, self.calendar.as_ref());
            if let Err(source) = strategy.on_fire(&mut ctx) {
                return Err(classify_strategy_error(strategy.name(), source));
            }
        }

        if self.settings.log_trigger.matches(now) {
            self.take_snapshot(now)?;
        }

        let steps = self.fire_times.len() as u64;
        if self.settings.progress_every > 0 && steps % self.settings.progress_every == 0 {
            debug!(
                steps,
                %now,
                value = %self.portfolio.last_value(),
                fills = self.portfolio.fills().len(),
                "Progress"
            );
        }

        Ok(Some(now))
    }

    /// Run the backtest from start to end.
    pub fn run(&mut self) -> EngineResult<BacktestReport> {
        if self.state == RunState::Idle {
            self.start()?;
        }
        while self.step()?.is_some() {}
        Ok(self.report())
    }

    /// Run to completion and hand the report to every sink.
    pub fn run_and_publish(
        &mut self,
        sinks: &mut [Box<dyn ReportSink>],
    ) -> anyhow::Result<BacktestReport> {
        let report = self.run()?;
        for sink in sinks.iter_mut() {
            sink.publish(&report)?;
        }
        Ok(report)
    }

    /// Build the report from the current state.
    pub fn report(&self) -> BacktestReport {
        let counts = RunCounts {
            fires: self.fires,
            fills: self.portfolio.fills().len() as u64,
            rejections: self.portfolio.rejections().len() as u64,
        };

        BacktestReport {
            strategies: self.strategies.iter().map(|s| s.name().to_string()).collect(),
            start: self.settings.start,
            end: self.settings.end,
            initial_cash: self.settings.initial_cash,
            final_value: self.portfolio.last_value(),
            snapshots: self.snapshots.clone(),
            fills: self.portfolio.fills().to_vec(),
            rejections: self.portfolio.rejections().to_vec(),
            fire_times: self.fire_times.clone(),
            metrics: BacktestMetrics::calculate(&self.snapshots, self.settings.initial_cash, counts),
            stopped_early: self.stopped_early,
        }
    }

    /// Search origin for the first step, so a fire time equal to `start`
    /// is included.
    fn seed(&self) -> NaiveDateTime {
        self.settings.start - Duration::seconds(1)
    }

    fn take_snapshot(&mut self, now: NaiveDateTime) -> EngineResult<()> {
        let value = self.portfolio.mark_to_market(&self.data, now)?;
        let benchmark = match self.settings.benchmark.as_deref() {
            Some(symbol) => Some(self.data.quote(symbol, now)?),
            None => None,
        };

        if value > self.peak_value {
            self.peak_value = value;
        }
        let snapshot = Snapshot::new(now, value, benchmark, self.peak_value);
        debug!(
            %now,
            value = %value,
            drawdown = %snapshot.drawdown,
            "Snapshot"
        );

        if self.settings.record_snapshots {
            self.snapshots.push(snapshot);
        }
        Ok(())
    }

    fn finish(&mut self) -> EngineResult<()> {
        if let Some(last) = self.last_fire {
            self.portfolio.mark_to_market(&self.data, last)?;
        }
        self.state = RunState::Finished;

        info!(
            steps = self.fire_times.len(),
            fires = self.fires,
            fills = self.portfolio.fills().len(),
            rejections = self.portfolio.rejections().len(),
            final_value = %self.portfolio.last_value(),
            stopped_early = self.stopped_early,
            "Backtest complete"
        );
        Ok(())
    }
}

/// Data errors raised through the context keep their class; anything else
/// is attributed to the strategy.
fn classify_strategy_error(strategy: &str, source: anyhow::Error) -> EngineError {
    match source.downcast::<DataError>() {
        Ok(data) => EngineError::Data(data),
        Err(source) => EngineError::Strategy {
            strategy: strategy.to_string(),
            source,
        },
    }
}
