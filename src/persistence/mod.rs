//! SQLite run store for finished backtests.
//!
//! Persists every published report:
//! - Run bounds, outcome and metrics
//! - The snapshot series
//! - Fill history
//! - Rejections with their reason codes

use crate::backtest::{BacktestMetrics, BacktestReport, ReportSink, Snapshot};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// A stored run, without its series.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRun {
    pub id: i64,
    pub strategies: Vec<String>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub initial_cash: Decimal,
    pub final_value: Decimal,
    pub stopped_early: bool,
    pub metrics: BacktestMetrics,
}

/// SQLite-backed archive of backtest reports.
pub struct RunStore {
    conn: Connection,
}

impl RunStore {
    /// Open or create a run store at the given path.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self { conn };
        store.init_schema()?;

        info!("Run store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategies TEXT NOT NULL,
                start TEXT NOT NULL,
                "end" TEXT NOT NULL,
                initial_cash TEXT NOT NULL,
                final_value TEXT NOT NULL,
                stopped_early INTEGER NOT NULL,
                metrics TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS snapshots (
                run_id INTEGER NOT NULL REFERENCES runs(id),
                seq INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                portfolio_value TEXT NOT NULL,
                benchmark_value TEXT,
                drawdown TEXT NOT NULL,
                PRIMARY KEY (run_id, seq)
            );

            CREATE TABLE IF NOT EXISTS fills (
                run_id INTEGER NOT NULL REFERENCES runs(id),
                order_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                symbol TEXT NOT NULL,
                kind TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_fills_run ON fills(run_id);

            CREATE TABLE IF NOT EXISTS rejections (
                run_id INTEGER NOT NULL REFERENCES runs(id),
                timestamp TEXT NOT NULL,
                symbol TEXT NOT NULL,
                quantity TEXT,
                code TEXT NOT NULL,
                detail TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rejections_run ON rejections(run_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Save a complete report. Returns the new run id.
    pub fn save_report(&self, report: &BacktestReport) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO runs (strategies, start, "end", initial_cash, final_value,
                              stopped_early, metrics)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                serde_json::to_string(&report.strategies)?,
                format_ts(report.start),
                format_ts(report.end),
                report.initial_cash.to_string(),
                report.final_value.to_string(),
                report.stopped_early,
                serde_json::to_string(&report.metrics)?,
            ],
        )?;
        let run_id = tx.last_insert_rowid();

        for (seq, snapshot) in report.snapshots.iter().enumerate() {
            tx.execute(
                r#"
                INSERT INTO snapshots (run_id, seq, timestamp, portfolio_value,
                                       benchmark_value, drawdown)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    run_id,
                    seq as i64,
                    format_ts(snapshot.timestamp),
                    snapshot.portfolio_value.to_string(),
                    snapshot.benchmark_value.map(|v| v.to_string()),
                    snapshot.drawdown.to_string(),
                ],
            )?;
        }

        for fill in &report.fills {
            tx.execute(
                r#"
                INSERT INTO fills (run_id, order_id, timestamp, symbol, kind, quantity, price)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    run_id,
                    fill.order_id as i64,
                    format_ts(fill.time),
                    fill.symbol,
                    fill.kind.as_str(),
                    fill.quantity.to_string(),
                    fill.price.to_string(),
                ],
            )?;
        }

        for rejection in &report.rejections {
            tx.execute(
                r#"
                INSERT INTO rejections (run_id, timestamp, symbol, quantity, code, detail)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    run_id,
                    format_ts(rejection.time),
                    rejection.symbol,
                    rejection.quantity.map(|q| q.to_string()),
                    rejection.reason.code(),
                    rejection.reason.to_string(),
                ],
            )?;
        }

        tx.commit()?;

        debug!(
            run_id,
            snapshots = report.snapshots.len(),
            fills = report.fills.len(),
            "Run saved to database"
        );
        Ok(run_id)
    }

    /// Load a run header.
    pub fn load_run(&self, run_id: i64) -> Result<Option<StoredRun>> {
        let row: Option<(String, String, String, String, String, bool, String)> = self
            .conn
            .query_row(
                r#"
                SELECT strategies, start, "end", initial_cash, final_value, stopped_early, metrics
                FROM runs WHERE id = ?1
                "#,
                [run_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((strategies, start, end, initial_cash, final_value, stopped_early, metrics)) = row
        else {
            return Ok(None);
        };

        Ok(Some(StoredRun {
            id: run_id,
            strategies: serde_json::from_str(&strategies).context("Corrupt strategies column")?,
            start: parse_ts(&start)?,
            end: parse_ts(&end)?,
            initial_cash: parse_decimal(&initial_cash)?,
            final_value: parse_decimal(&final_value)?,
            stopped_early,
            metrics: serde_json::from_str(&metrics).context("Corrupt metrics column")?,
        }))
    }

    /// Ids of every stored run, oldest first.
    pub fn run_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare("SELECT id FROM runs ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// The snapshot series of a run, in order.
    pub fn load_snapshots(&self, run_id: i64) -> Result<Vec<Snapshot>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, portfolio_value, benchmark_value, drawdown
            FROM snapshots
            WHERE run_id = ?1
            ORDER BY seq
            "#,
        )?;

        let rows = stmt
            .query_map([run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(ts, value, benchmark, drawdown)| {
                Ok(Snapshot {
                    timestamp: parse_ts(&ts)?,
                    portfolio_value: parse_decimal(&value)?,
                    benchmark_value: benchmark.as_deref().map(parse_decimal).transpose()?,
                    drawdown: parse_decimal(&drawdown)?,
                })
            })
            .collect()
    }

    pub fn fill_count(&self, run_id: i64) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM fills WHERE run_id = ?1",
            [run_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Rejections of a run grouped by reason code.
    pub fn rejection_counts(&self, run_id: i64) -> Result<BTreeMap<String, u64>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT code, COUNT(*)
            FROM rejections
            WHERE run_id = ?1
            GROUP BY code
            "#,
        )?;

        let counts = stmt
            .query_map([run_id], |row| {
                let code: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((code, count as u64))
            })?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;

        Ok(counts)
    }
}

impl ReportSink for RunStore {
    fn publish(&mut self, report: &BacktestReport) -> Result<()> {
        let run_id = self.save_report(report)?;
        info!(run_id, "Run recorded");
        Ok(())
    }
}

fn format_ts(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_ts(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .with_context(|| format!("Corrupt timestamp `{s}`"))
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("Corrupt decimal `{s}`"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::RunCounts;
    use crate::broker::{Fill, OrderKind, RejectReason, Rejection};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn t(d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(h, 30, 0)
            .unwrap()
    }

    fn report() -> BacktestReport {
        let snapshots = vec![
            Snapshot::new(t(2, 9), dec!(10000), Some(dec!(470.5)), dec!(10000)),
            Snapshot::new(t(3, 9), dec!(9950), None, dec!(10000)),
        ];
        let counts = RunCounts {
            fires: 2,
            fills: 1,
            rejections: 2,
        };
        let rejection = |qty| Rejection {
            time: t(3, 9),
            symbol: "SPY".to_string(),
            quantity: Some(qty),
            reason: RejectReason::InsufficientShares {
                requested: qty.abs(),
                held: dec!(10),
            },
        };

        BacktestReport {
            strategies: vec!["macd-SPY".to_string()],
            start: t(2, 0),
            end: t(4, 0),
            initial_cash: dec!(10000),
            final_value: dec!(9950),
            metrics: BacktestMetrics::calculate(&snapshots, dec!(10000), counts),
            snapshots,
            fills: vec![Fill {
                order_id: 1,
                symbol: "SPY".to_string(),
                time: t(2, 9),
                quantity: dec!(10),
                price: dec!(100),
                kind: OrderKind::Market,
            }],
            rejections: vec![rejection(dec!(-12)), rejection(dec!(-15))],
            fire_times: vec![t(2, 9), t(3, 9)],
            stopped_early: false,
        }
    }

    #[test]
    fn test_save_and_load_run() {
        let store = RunStore::open_in_memory().unwrap();
        let report = report();

        let run_id = store.save_report(&report).unwrap();
        let run = store.load_run(run_id).unwrap().unwrap();

        assert_eq!(run.strategies, report.strategies);
        assert_eq!(run.start, report.start);
        assert_eq!(run.final_value, dec!(9950));
        assert_eq!(run.metrics.counts, report.metrics.counts);
        assert!(!run.stopped_early);

        assert_eq!(store.load_snapshots(run_id).unwrap(), report.snapshots);
        assert_eq!(store.fill_count(run_id).unwrap(), 1);
    }

    #[test]
    fn test_rejections_grouped_by_code() {
        let store = RunStore::open_in_memory().unwrap();
        let run_id = store.save_report(&report()).unwrap();

        let counts = store.rejection_counts(run_id).unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts["insufficient_shares"], 2);
    }

    #[test]
    fn test_publish_appends_runs() {
        let mut store = RunStore::open_in_memory().unwrap();
        store.publish(&report()).unwrap();
        store.publish(&report()).unwrap();

        let ids = store.run_ids().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(store.load_run(ids[1] + 1).unwrap().is_none());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");

        let run_id = RunStore::open(&path).unwrap().save_report(&report()).unwrap();
        let reopened = RunStore::open(&path).unwrap();
        assert_eq!(reopened.load_snapshots(run_id).unwrap().len(), 2);
    }
}
