//! Algo Backtester - Main Entry Point
//!
//! Runs the bundled MACD strategy over CSV bars, previews schedules, and
//! inspects stored runs.

use anyhow::{Context, Result};
use algo_backtester::backtest::{
    advance_to_next_trading_fire_time, BacktestEngine, CsvReportSink, ReportSink,
};
use algo_backtester::calendar::{CalendarKind, ExchangeCalendar};
use algo_backtester::config::Config;
use algo_backtester::data::BarDataProvider;
use algo_backtester::persistence::RunStore;
use algo_backtester::schedule::{parse_timezone, ScheduleSpec, Trigger, DEFAULT_TIMEZONE};
use algo_backtester::strategy::MacdStrategy;
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Algo Backtester CLI
#[derive(Parser)]
#[command(name = "algo-backtester")]
#[command(version, about = "Calendar-aware, cron-scheduled strategy backtester")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the MACD strategy over historical bars
    Backtest {
        /// Config file (defaults to ./config.* if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Bar CSV, overrides data.path
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Start (YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS), overrides backtest.start
        #[arg(short, long)]
        start: Option<String>,

        /// End, exclusive, overrides backtest.end
        #[arg(short, long)]
        end: Option<String>,

        /// Output directory for equity.csv and summary.json
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// SQLite database to record the run in
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Preview upcoming trading-day fire times of a schedule
    Schedule {
        /// Crontab expression; repeat to OR-combine
        #[arg(long = "cron", required = true)]
        cron: Vec<String>,

        /// Search origin (exclusive)
        #[arg(long)]
        from: String,

        /// Number of fire times to print
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,

        #[arg(long, value_enum, default_value = "nyse")]
        calendar: CalendarArg,

        /// IANA timezone; also prints UTC instants
        #[arg(long)]
        tz: Option<String>,

        #[arg(long, default_value = "30")]
        max_skips: u32,
    },

    /// List runs recorded in a database
    Runs {
        #[arg(long, default_value = "backtests.db")]
        db: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CalendarArg {
    Nyse,
    Weekdays,
    AlwaysOpen,
}

impl From<CalendarArg> for CalendarKind {
    fn from(arg: CalendarArg) -> Self {
        match arg {
            CalendarArg::Nyse => CalendarKind::Nyse,
            CalendarArg::Weekdays => CalendarKind::Weekdays,
            CalendarArg::AlwaysOpen => CalendarKind::AlwaysOpen,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    match cli.command {
        Commands::Backtest {
            config,
            data,
            start,
            end,
            output,
            db,
        } => {
            run_backtest(
                config.as_deref(),
                data,
                start.as_deref(),
                end.as_deref(),
                output,
                db,
            )
            .await
        }
        Commands::Schedule {
            cron,
            from,
            count,
            calendar,
            tz,
            max_skips,
        } => preview_schedule(&cron, &from, count, calendar.into(), tz.as_deref(), max_skips),
        Commands::Runs { db } => list_runs(&db),
    }
}

/// Parse a CLI timestamp given as a date (midnight) or a full timestamp.
fn parse_time(s: &str) -> Result<NaiveDateTime> {
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(t);
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid timestamp '{}'", s))?;
    Ok(date.and_time(chrono::NaiveTime::MIN))
}

async fn run_backtest(
    config_path: Option<&Path>,
    data_path: Option<PathBuf>,
    start: Option<&str>,
    end: Option<&str>,
    output_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║              BACKTEST MODE                                 ║");
    info!("╚════════════════════════════════════════════════════════════╝");

    let mut config = Config::load_from(config_path)?;
    if let Some(path) = data_path {
        config.data.path = Some(path);
    }
    if let Some(start) = start {
        config.backtest.start = Some(parse_time(start)?);
    }
    if let Some(end) = end {
        config.backtest.end = Some(parse_time(end)?);
    }
    config.validate()?;

    let data_path = config
        .data
        .path
        .clone()
        .context("No bar data given: set data.path or pass --data")?;
    info!(path = %data_path.display(), "Loading bars");
    let data = BarDataProvider::load(&data_path)?;
    for symbol in data.symbols() {
        if let Some((first, last)) = data.coverage(&symbol) {
            info!(%symbol, %first, %last, "Data coverage");
        }
    }

    let settings = config.backtest_settings()?;
    let timezone = config.timezone()?;
    let strategy = MacdStrategy::new(config.strategy.clone(), timezone)?;

    let mut engine = BacktestEngine::new(settings, data, config.exchange_calendar())?;
    engine.add_strategy(Box::new(strategy))?;

    let stop = engine.stop_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("Shutdown signal received, stopping after the current step");
        stop.request_stop();
    });

    let mut sinks: Vec<Box<dyn ReportSink>> = Vec::new();
    if let Some(dir) = output_dir {
        sinks.push(Box::new(CsvReportSink::new(dir)));
    }
    if let Some(db) = db_path {
        sinks.push(Box::new(RunStore::open(db)?));
    }

    let report = tokio::task::block_in_place(|| engine.run_and_publish(&mut sinks))?;
    println!("\n{}", report.summary());

    Ok(())
}

fn preview_schedule(
    cron: &[String],
    from: &str,
    count: usize,
    calendar: CalendarKind,
    tz: Option<&str>,
    max_skips: u32,
) -> Result<()> {
    let timezone = match tz {
        Some(name) => parse_timezone(name)?,
        None => DEFAULT_TIMEZONE,
    };
    let specs: Vec<ScheduleSpec> = cron.iter().map(|c| ScheduleSpec::from(c.as_str())).collect();
    let trigger = Trigger::from_specs(&specs, timezone)?;
    let calendar = ExchangeCalendar::new(calendar);

    println!("Schedule: {}", trigger);
    println!("Calendar: {}", calendar.kind());

    let mut after = parse_time(from)?;
    for _ in 0..count {
        let Some(next) = advance_to_next_trading_fire_time(&trigger, &calendar, after, max_skips)?
        else {
            break;
        };

        match tz {
            Some(_) => {
                let utc = timezone
                    .from_local_datetime(&next)
                    .earliest()
                    .map(|t| t.with_timezone(&Utc).to_rfc3339())
                    .unwrap_or_else(|| "(skipped by DST)".to_string());
                println!("  {}  {}", next.format("%a %Y-%m-%d %H:%M:%S"), utc);
            }
            None => println!("  {}", next.format("%a %Y-%m-%d %H:%M:%S")),
        }
        after = next;
    }

    Ok(())
}

fn list_runs(db_path: &Path) -> Result<()> {
    if !db_path.exists() {
        println!("Database not found: {}", db_path.display());
        return Ok(());
    }

    let store = RunStore::open(db_path)?;
    let ids = store.run_ids()?;
    if ids.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    for id in ids {
        let Some(run) = store.load_run(id)? else {
            continue;
        };
        println!(
            "#{:<4} {:<20} {} -> {}  ${:.2} -> ${:.2} ({:+.2}%){}",
            run.id,
            run.strategies.join(","),
            run.start,
            run.end,
            run.initial_cash,
            run.final_value,
            run.metrics.total_return_pct,
            if run.stopped_early { " [stopped]" } else { "" },
        );

        let rejections = store.rejection_counts(id)?;
        if !rejections.is_empty() {
            let parts: Vec<String> = rejections
                .iter()
                .map(|(code, n)| format!("{}={}", code, n))
                .collect();
            println!("       fills={} rejections: {}", store.fill_count(id)?, parts.join(" "));
        }
    }

    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "algo-backtester.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("algo_backtester=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}
