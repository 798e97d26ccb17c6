//! Finished-run report and the sinks that receive it.

use crate::backtest::metrics::{BacktestMetrics, Snapshot};
use crate::broker::{Fill, Rejection};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

pub const EQUITY_CSV_HEADER: &str = "timestamp,portfolio_value,benchmark_value,drawdown";

/// Complete result of a backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    /// Registered strategy names, in registration order
    pub strategies: Vec<String>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub initial_cash: Decimal,
    pub final_value: Decimal,
    pub snapshots: Vec<Snapshot>,
    pub fills: Vec<Fill>,
    pub rejections: Vec<Rejection>,
    /// Every instant the loop stepped to
    pub fire_times: Vec<NaiveDateTime>,
    pub metrics: BacktestMetrics,
    /// Stopped on request before reaching `end`
    pub stopped_early: bool,
}

impl BacktestReport {
    /// Write the snapshot series as CSV.
    pub fn write_equity_csv<W: Write>(&self, mut out: W) -> std::io::Result<()> {
        writeln!(out, "{}", EQUITY_CSV_HEADER)?;

        for point in &self.snapshots {
            let benchmark = point
                .benchmark_value
                .map(|v| v.to_string())
                .unwrap_or_default();
            writeln!(
                out,
                "{},{},{},{}",
                point.timestamp.format("%Y-%m-%dT%H:%M:%S"),
                point.portfolio_value,
                benchmark,
                point.drawdown,
            )?;
        }

        Ok(())
    }

    /// Export equity curve to CSV.
    pub fn equity_to_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        self.write_equity_csv(std::io::BufWriter::new(file))
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Get a summary string.
    pub fn summary(&self) -> String {
        format!(
            "{}\n\nStrategies: {}\nBacktest Period: {} to {}{}\nFinal Value: ${:.2}\nSnapshots: {}",
            self.metrics.summary(),
            self.strategies.join(", "),
            self.start,
            self.end,
            if self.stopped_early { " (stopped early)" } else { "" },
            self.final_value,
            self.snapshots.len(),
        )
    }
}

/// Receives the report once a run finishes.
pub trait ReportSink {
    fn publish(&mut self, report: &BacktestReport) -> Result<()>;
}

/// Writes `equity.csv` and `summary.json` into a directory.
#[derive(Debug, Clone)]
pub struct CsvReportSink {
    dir: PathBuf,
}

impl CsvReportSink {
    pub const EQUITY_FILE: &'static str = "equity.csv";
    pub const SUMMARY_FILE: &'static str = "summary.json";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[derive(Serialize)]
struct SummaryFile<'a> {
    strategies: &'a [String],
    start: NaiveDateTime,
    end: NaiveDateTime,
    initial_cash: Decimal,
    final_value: Decimal,
    stopped_early: bool,
    metrics: &'a BacktestMetrics,
}

impl ReportSink for CsvReportSink {
    fn publish(&mut self, report: &BacktestReport) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let equity_path = self.dir.join(Self::EQUITY_FILE);
        report.equity_to_csv(&equity_path)?;

        let summary = SummaryFile {
            strategies: &report.strategies,
            start: report.start,
            end: report.end,
            initial_cash: report.initial_cash,
            final_value: report.final_value,
            stopped_early: report.stopped_early,
            metrics: &report.metrics,
        };
        let summary_path = self.dir.join(Self::SUMMARY_FILE);
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(&summary_path, json)
            .with_context(|| format!("Failed to write {}", summary_path.display()))?;

        info!(dir = %self.dir.display(), snapshots = report.snapshots.len(), "Report written");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backtest::metrics::RunCounts;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    pub(crate) fn sample_report() -> BacktestReport {
        let t = |d: u32| {
            NaiveDate::from_ymd_opt(2024, 1, d)
                .unwrap()
                .and_hms_opt(9, 30, 0)
                .unwrap()
        };
        let snapshots = vec![
            Snapshot::new(t(2), dec!(10000), Some(dec!(470.5)), dec!(10000)),
            Snapshot::new(t(3), dec!(9900), None, dec!(10000)),
        ];
        let metrics = BacktestMetrics::calculate(&snapshots, dec!(10000), RunCounts::default());

        BacktestReport {
            strategies: vec!["macd-SPY".to_string()],
            start: t(2),
            end: t(4),
            initial_cash: dec!(10000),
            final_value: dec!(9900),
            snapshots,
            fills: Vec::new(),
            rejections: Vec::new(),
            fire_times: vec![t(2), t(3)],
            metrics,
            stopped_early: false,
        }
    }

    #[test]
    fn test_equity_csv_format() {
        let report = sample_report();
        let mut out = Vec::new();
        report.write_equity_csv(&mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], EQUITY_CSV_HEADER);
        assert_eq!(lines[1], "2024-01-02T09:30:00,10000,470.5,0");
        assert_eq!(lines[2], "2024-01-03T09:30:00,9900,,0.01");
    }

    #[test]
    fn test_csv_sink_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvReportSink::new(dir.path().join("run"));
        sink.publish(&sample_report()).unwrap();

        let equity = std::fs::read_to_string(sink.dir().join(CsvReportSink::EQUITY_FILE)).unwrap();
        assert_eq!(equity.lines().count(), 3);

        let summary = std::fs::read_to_string(sink.dir().join(CsvReportSink::SUMMARY_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&summary).unwrap();
        assert_eq!(json["strategies"][0], "macd-SPY");
        assert_eq!(json["final_value"], "9900");
    }

    #[test]
    fn test_summary_mentions_period() {
        let summary = sample_report().summary();
        assert!(summary.contains("macd-SPY"));
        assert!(summary.contains("2024-01-02 09:30:00"));
        assert!(!summary.contains("stopped early"));
    }
}
