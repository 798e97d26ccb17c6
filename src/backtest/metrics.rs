//! Performance metrics calculation for backtesting.
//!
//! Provides return, drawdown and risk-adjusted statistics computed from the
//! snapshot series, plus alpha/beta against the benchmark when one was
//! quoted.

use crate::utils::decimal::to_f64;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Cap applied to the Sortino ratio when no period lost money.
const SORTINO_CAP: f64 = 100.0;

/// A point on the equity curve, taken when the logging trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: NaiveDateTime,
    pub portfolio_value: Decimal,
    /// Benchmark quote at the same instant
    pub benchmark_value: Option<Decimal>,
    /// Fraction below the running peak
    pub drawdown: Decimal,
}

impl Snapshot {
    pub fn new(
        timestamp: NaiveDateTime,
        portfolio_value: Decimal,
        benchmark_value: Option<Decimal>,
        peak_value: Decimal,
    ) -> Self {
        let drawdown = if peak_value > Decimal::ZERO && portfolio_value < peak_value {
            (peak_value - portfolio_value) / peak_value
        } else {
            Decimal::ZERO
        };

        Self {
            timestamp,
            portfolio_value,
            benchmark_value,
            drawdown,
        }
    }
}

/// Event counts accumulated by the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Strategy invocations
    pub fires: u64,
    pub fills: u64,
    pub rejections: u64,
}

/// Backtest performance metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    // Returns
    /// Final value minus initial cash
    pub total_return: Decimal,
    /// Total return as percentage
    pub total_return_pct: f64,
    /// Compound annual growth rate as percentage
    pub cagr: f64,
    /// Benchmark return over the snapshots that quoted it, as percentage
    pub benchmark_return_pct: Option<f64>,

    // Risk
    /// Maximum drawdown as a fraction of the peak
    pub max_drawdown: f64,
    /// Duration of maximum drawdown in hours
    pub max_drawdown_duration_hours: i64,
    /// Annualized volatility (std dev of returns)
    pub volatility: f64,

    // Risk-adjusted
    /// Sharpe ratio (assuming 0 risk-free rate)
    pub sharpe_ratio: f64,
    /// Sortino ratio (downside deviation only)
    pub sortino_ratio: f64,
    /// CAGR over max drawdown
    pub calmar_ratio: f64,
    /// Annualized excess return over beta-adjusted benchmark
    pub alpha: Option<f64>,
    pub beta: Option<f64>,

    // Period returns
    pub avg_win: f64,
    pub avg_loss: f64,
    /// Winning periods over non-flat periods, as percentage
    pub win_rate: f64,

    // Activity
    pub counts: RunCounts,

    // Time
    /// Span of the snapshot series in days
    pub duration_days: f64,
}

impl BacktestMetrics {
    /// Calculate metrics from the snapshot series.
    pub fn calculate(snapshots: &[Snapshot], initial_cash: Decimal, counts: RunCounts) -> Self {
        let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) else {
            return Self {
                counts,
                ..Self::empty()
            };
        };

        // Duration
        let duration = last.timestamp - first.timestamp;
        let duration_days = duration.num_seconds() as f64 / 86400.0;
        let duration_years = duration_days / 365.0;

        // Returns
        let total_return = last.portfolio_value - initial_cash;
        let growth = if initial_cash > Decimal::ZERO {
            to_f64(last.portfolio_value) / to_f64(initial_cash)
        } else {
            1.0
        };
        let total_return_pct = (growth - 1.0) * 100.0;
        let cagr = if duration_years > 0.0 && growth > 0.0 {
            (growth.powf(1.0 / duration_years) - 1.0) * 100.0
        } else {
            0.0
        };

        // Drawdown
        let (max_drawdown, max_drawdown_duration_hours) = calculate_max_drawdown(snapshots, initial_cash);

        let returns = calculate_period_returns(snapshots);
        let volatility = calculate_volatility(&returns, duration_years);
        let sharpe_ratio = calculate_sharpe(&returns, duration_years);
        let sortino_ratio = calculate_sortino(&returns, duration_years);
        let calmar_ratio = if max_drawdown > 0.0 {
            cagr / (max_drawdown * 100.0)
        } else {
            0.0
        };

        // Benchmark
        let paired = calculate_paired_returns(snapshots);
        let (alpha, beta) = match calculate_beta(&paired) {
            Some(beta) => (calculate_alpha(&paired, beta, duration_years), Some(beta)),
            None => (None, None),
        };
        let benchmark_return_pct = calculate_benchmark_return(snapshots);

        let (avg_win, avg_loss, win_rate) = calculate_win_loss(&returns);

        Self {
            total_return,
            total_return_pct,
            cagr,
            benchmark_return_pct,
            max_drawdown,
            max_drawdown_duration_hours,
            volatility,
            sharpe_ratio,
            sortino_ratio,
            calmar_ratio,
            alpha,
            beta,
            avg_win,
            avg_loss,
            win_rate,
            counts,
            duration_days,
        }
    }

    /// Create empty metrics (no snapshots were taken).
    pub fn empty() -> Self {
        Self {
            total_return: Decimal::ZERO,
            total_return_pct: 0.0,
            cagr: 0.0,
            benchmark_return_pct: None,
            max_drawdown: 0.0,
            max_drawdown_duration_hours: 0,
            volatility: 0.0,
            sharpe_ratio: 0.0,
            sortino_ratio: 0.0,
            calmar_ratio: 0.0,
            alpha: None,
            beta: None,
            avg_win: 0.0,
            avg_loss: 0.0,
            win_rate: 0.0,
            counts: RunCounts::default(),
            duration_days: 0.0,
        }
    }

    /// Format metrics as a summary string.
    pub fn summary(&self) -> String {
        let optional = |v: Option<f64>, precision: usize| match v {
            Some(v) => format!("{:.*}", precision, v),
            None => "n/a".to_string(),
        };

        format!(
            r#"═══════════════════════════════════════════════
BACKTEST RESULTS ({:.1} days)
═══════════════════════════════════════════════
RETURNS
  Total Return:      ${:.2} ({:.2}%)
  CAGR:              {:.2}%
  Benchmark:         {}%

RISK
  Max Drawdown:      {:.2}% ({}h)
  Volatility:        {:.2}%

RISK-ADJUSTED
  Sharpe Ratio:      {:.3}
  Sortino Ratio:     {:.3}
  Calmar Ratio:      {:.3}
  Alpha:             {}
  Beta:              {}

PERIODS
  Average Win:       {:.4}%
  Average Loss:      {:.4}%
  Win Rate:          {:.1}%

ACTIVITY
  Strategy Fires:    {}
  Fills:             {}
  Rejections:        {}
═══════════════════════════════════════════════"#,
            self.duration_days,
            self.total_return,
            self.total_return_pct,
            self.cagr,
            optional(self.benchmark_return_pct, 2),
            self.max_drawdown * 100.0,
            self.max_drawdown_duration_hours,
            self.volatility * 100.0,
            self.sharpe_ratio,
            self.sortino_ratio,
            self.calmar_ratio,
            optional(self.alpha, 4),
            optional(self.beta, 3),
            self.avg_win * 100.0,
            self.avg_loss * 100.0,
            self.win_rate,
            self.counts.fires,
            self.counts.fills,
            self.counts.rejections,
        )
    }
}

fn simple_return(prev: Decimal, curr: Decimal) -> Option<f64> {
    if prev > Decimal::ZERO {
        Some(to_f64((curr - prev) / prev))
    } else {
        None
    }
}

/// Calculate period returns from the snapshot series.
fn calculate_period_returns(snapshots: &[Snapshot]) -> Vec<f64> {
    snapshots
        .windows(2)
        .map(|w| simple_return(w[0].portfolio_value, w[1].portfolio_value).unwrap_or(0.0))
        .collect()
}

/// Portfolio and benchmark returns over periods where both ends quoted the
/// benchmark.
fn calculate_paired_returns(snapshots: &[Snapshot]) -> Vec<(f64, f64)> {
    snapshots
        .windows(2)
        .filter_map(|w| {
            let bench = simple_return(w[0].benchmark_value?, w[1].benchmark_value?)?;
            let strat = simple_return(w[0].portfolio_value, w[1].portfolio_value)?;
            Some((strat, bench))
        })
        .collect()
}

fn calculate_benchmark_return(snapshots: &[Snapshot]) -> Option<f64> {
    let first = snapshots.iter().find_map(|s| s.benchmark_value)?;
    let last = snapshots.iter().rev().find_map(|s| s.benchmark_value)?;
    simple_return(first, last).map(|r| r * 100.0)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Covariance with the benchmark over benchmark variance.
fn calculate_beta(paired: &[(f64, f64)]) -> Option<f64> {
    if paired.len() < 2 {
        return None;
    }

    let n = paired.len() as f64;
    let mean_s = paired.iter().map(|(s, _)| s).sum::<f64>() / n;
    let mean_b = paired.iter().map(|(_, b)| b).sum::<f64>() / n;

    let covariance = paired
        .iter()
        .map(|(s, b)| (s - mean_s) * (b - mean_b))
        .sum::<f64>()
        / n;
    let variance = paired.iter().map(|(_, b)| (b - mean_b).powi(2)).sum::<f64>() / n;

    if variance < 1e-18 {
        return None;
    }
    Some(covariance / variance)
}

/// Jensen's alpha with a zero risk-free rate, annualized.
fn calculate_alpha(paired: &[(f64, f64)], beta: f64, duration_years: f64) -> Option<f64> {
    if paired.is_empty() || duration_years <= 0.0 {
        return None;
    }

    let n = paired.len() as f64;
    let mean_s = paired.iter().map(|(s, _)| s).sum::<f64>() / n;
    let mean_b = paired.iter().map(|(_, b)| b).sum::<f64>() / n;
    let periods_per_year = n / duration_years;

    Some((mean_s - beta * mean_b) * periods_per_year)
}

/// Average winning return, average losing return, and win rate (%) over
/// periods that moved.
fn calculate_win_loss(returns: &[f64]) -> (f64, f64, f64) {
    let wins: Vec<f64> = returns.iter().copied().filter(|r| *r > 0.0).collect();
    let losses: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();

    let avg_win = if wins.is_empty() { 0.0 } else { mean(&wins) };
    let avg_loss = if losses.is_empty() { 0.0 } else { mean(&losses) };
    let moved = wins.len() + losses.len();
    let win_rate = if moved > 0 {
        wins.len() as f64 / moved as f64 * 100.0
    } else {
        0.0
    };

    (avg_win, avg_loss, win_rate)
}

/// Calculate maximum drawdown and its duration. The running peak starts at
/// the initial cash, as it does for each snapshot's own drawdown.
fn calculate_max_drawdown(snapshots: &[Snapshot], initial_cash: Decimal) -> (f64, i64) {
    let Some(first) = snapshots.first() else {
        return (0.0, 0);
    };

    let mut peak = initial_cash;
    let mut peak_time = first.timestamp;
    let mut max_dd = Decimal::ZERO;
    let mut max_dd_duration: i64 = 0;

    for point in snapshots {
        if point.portfolio_value >= peak {
            peak = point.portfolio_value;
            peak_time = point.timestamp;
            continue;
        }

        if peak > Decimal::ZERO {
            let dd = (peak - point.portfolio_value) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }

        let duration = (point.timestamp - peak_time).num_hours();
        if duration > max_dd_duration {
            max_dd_duration = duration;
        }
    }

    (to_f64(max_dd), max_dd_duration)
}

/// Calculate annualized volatility from returns.
fn calculate_volatility(returns: &[f64], duration_years: f64) -> f64 {
    if returns.len() < 2 || duration_years <= 0.0 {
        return 0.0;
    }

    let n = returns.len() as f64;
    let avg = mean(returns);
    let variance = returns.iter().map(|r| (r - avg).powi(2)).sum::<f64>() / n;

    let periods_per_year = n / duration_years;
    variance.sqrt() * periods_per_year.sqrt()
}

/// Calculate Sharpe ratio (assuming 0 risk-free rate).
fn calculate_sharpe(returns: &[f64], duration_years: f64) -> f64 {
    if returns.is_empty() || duration_years <= 0.0 {
        return 0.0;
    }

    let n = returns.len() as f64;
    let avg = mean(returns);
    let variance = returns.iter().map(|r| (r - avg).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();

    if std_dev < 1e-10 {
        return 0.0;
    }

    // Annualize
    let periods_per_year = n / duration_years;
    let annualized_return = avg * periods_per_year;
    let annualized_std = std_dev * periods_per_year.sqrt();

    annualized_return / annualized_std
}

/// Calculate Sortino ratio (downside deviation only).
fn calculate_sortino(returns: &[f64], duration_years: f64) -> f64 {
    if returns.is_empty() || duration_years <= 0.0 {
        return 0.0;
    }

    let n = returns.len() as f64;
    let avg = mean(returns);

    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        return if avg > 0.0 { SORTINO_CAP } else { 0.0 };
    }

    let downside_variance = downside.iter().map(|r| r.powi(2)).sum::<f64>() / downside.len() as f64;
    let downside_deviation = downside_variance.sqrt();

    if downside_deviation < 1e-10 {
        return SORTINO_CAP;
    }

    let periods_per_year = n / duration_years;
    let annualized_return = avg * periods_per_year;
    let annualized_dd = downside_deviation * periods_per_year.sqrt();

    (annualized_return / annualized_dd).min(SORTINO_CAP)
}
