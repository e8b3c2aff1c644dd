//! Momentum Rotator - Main Entry Point
//!
//! Backtests, ranks and paper-trades the configured strategy against CSV bars.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use momentum_rotator::backtest::{BacktestConfig, BacktestEngine, CsvBarLoader, DataLoader};
use momentum_rotator::config::{Config, StrategyKind};
use momentum_rotator::exchange::{HistoryProvider, PaperBroker};
use momentum_rotator::schedule::{run_scheduled, Schedule};
use momentum_rotator::strategy::RotationEngine;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Momentum Rotator CLI
#[derive(Parser)]
#[command(name = "momentum-rotator")]
#[command(version, about = "Scheduled top-K momentum rotation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backtest simulation on historical bars
    Backtest {
        /// Path to CSV bar file
        #[arg(short, long)]
        data: String,

        /// Start date (YYYY-MM-DD)
        #[arg(short, long)]
        start: String,

        /// End date (YYYY-MM-DD)
        #[arg(short, long)]
        end: String,

        /// Initial cash, defaults to `paper.initial_cash`
        #[arg(short = 'c', long)]
        initial_cash: Option<f64>,

        /// Output directory for results
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Print the current ranking and the selection it implies
    Rank {
        /// Path to CSV bar file
        #[arg(short, long)]
        data: String,

        /// Rank as of this date (YYYY-MM-DD), defaults to after the last bar
        #[arg(short, long)]
        as_of: Option<String>,
    },

    /// Paper trade on the schedule until Ctrl-C, marked at the latest CSV closes
    Paper {
        /// Path to CSV bar file
        #[arg(short, long)]
        data: String,

        /// Initial cash, defaults to `paper.initial_cash`
        #[arg(short = 'c', long)]
        initial_cash: Option<f64>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;

    match cli.command {
        Commands::Backtest {
            data,
            start,
            end,
            initial_cash,
            output,
        } => run_backtest(config, &data, &start, &end, initial_cash, output.as_deref()).await,
        Commands::Rank { data, as_of } => run_rank(config, &data, as_of.as_deref()).await,
        Commands::Paper { data, initial_cash } => run_paper(config, &data, initial_cash).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Initialize comprehensive logging with file output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "momentum-rotator.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("momentum_rotator=debug".parse()?)
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

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Strategy: {}", config.strategy.kind);
    match config.strategy.kind {
        StrategyKind::MomentumRotation => {
            info!("   Universe: {} symbols", config.strategy.universe.len());
            info!(
                "   Top K: {} (lookback {} bars, {:?} momentum)",
                config.selection.top_k, config.selection.lookback, config.selection.momentum_kind
            );
            info!("   Degenerate Policy: {}", config.selection.degenerate_policy);
        }
        StrategyKind::DualThrust => {
            info!(
                "   Symbol: {} (k1 {}, k2 {}, {} days, weight {:.0}%)",
                config.dual_thrust.symbol,
                config.dual_thrust.k1,
                config.dual_thrust.k2,
                config.dual_thrust.lookback_days,
                config.dual_thrust.target_weight * dec!(100)
            );
        }
    }
    info!(
        "   Fee Buffer: ${} per order, lot {}",
        config.sizing.fee_buffer_per_order, config.sizing.lot_size
    );
    info!(
        "   Cancel Timeout: {}ms (poll {}ms)",
        config.execution.cancel_timeout_ms, config.execution.poll_interval_ms
    );
    info!(
        "   Schedule: {:?} / {:?} +{}m (session {}-{} UTC)",
        config.schedule.date_rule,
        config.schedule.time_anchor,
        config.schedule.offset_minutes,
        config.schedule.market_open,
        config.schedule.market_close
    );
}

fn parse_date(value: &str, what: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid {} date '{}'", what, value))
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

fn cash_or_default(cash: Option<f64>, config: &Config) -> Decimal {
    cash.and_then(Decimal::from_f64_retain)
        .unwrap_or(config.paper.initial_cash)
}

fn load_bars(data_path: &str) -> Result<CsvBarLoader> {
    info!("📊 Loading data from: {}", data_path);
    let loader = CsvBarLoader::new(data_path)?;

    if let Some((data_start, data_end)) = loader.available_range() {
        info!(
            "   Data range: {} to {}",
            data_start.format("%Y-%m-%d"),
            data_end.format("%Y-%m-%d")
        );
    }
    info!("   Symbols: {}", loader.available_symbols().len());
    info!("   Snapshots: {}", loader.len());

    Ok(loader)
}

/// Run a single backtest with the given parameters.
async fn run_backtest(
    config: Config,
    data_path: &str,
    start_str: &str,
    end_str: &str,
    initial_cash: Option<f64>,
    output_dir: Option<&str>,
) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║              BACKTEST MODE                                 ║");
    info!("╚════════════════════════════════════════════════════════════╝");

    let start = start_of_day(parse_date(start_str, "start")?);
    let end = start_of_day(parse_date(end_str, "end")?) + chrono::Duration::days(1)
        - chrono::Duration::seconds(1);

    let loader = load_bars(data_path)?;
    log_config(&config);

    let backtest_config = BacktestConfig {
        initial_cash: cash_or_default(initial_cash, &config),
        output_path: output_dir.map(String::from),
        ..BacktestConfig::from_paper(&config.paper)
    };

    info!("💰 Initial cash: ${:.2}", backtest_config.initial_cash);
    info!("📅 Period: {} to {}", start_str, end_str);

    let engine = BacktestEngine::new(loader, config, backtest_config);
    let result = engine.run(start, end).await?;

    println!("\n{}", result.summary());

    if let Some(dir) = output_dir {
        std::fs::create_dir_all(dir)?;

        let equity_path = format!("{}/equity_curve.csv", dir);
        result.equity_to_csv(&equity_path)?;
        info!("📁 Equity curve saved to: {}", equity_path);

        let cycles_path = format!("{}/cycles.json", dir);
        result.cycles_to_json(&cycles_path)?;
        info!("📁 Cycle reports saved to: {}", cycles_path);
    }

    Ok(())
}

/// Rank the universe from history and print the resulting selection.
async fn run_rank(config: Config, data_path: &str, as_of: Option<&str>) -> Result<()> {
    let loader = Arc::new(load_bars(data_path)?);

    let as_of = match as_of {
        Some(date) => start_of_day(parse_date(date, "as-of")?),
        None => loader
            .available_range()
            .map(|(_, last)| last + chrono::Duration::seconds(1))
            .context("No bars loaded")?,
    };

    let broker = Arc::new(PaperBroker::new(config.paper.initial_cash));
    let history: Arc<dyn HistoryProvider> = loader.clone();
    let engine = RotationEngine::new(config, broker).with_history(history);
    engine.warm_up(as_of).await?;

    let (mut candidates, outcome) = engine.preview(as_of).await;
    candidates.sort_by(|a, b| b.score.cmp(&a.score));

    println!("Ranking as of {}", as_of.format("%Y-%m-%d %H:%M"));
    println!("{:<4} {:<10} {:>14} {:>6}", "#", "SYMBOL", "SCORE", "FRESH");
    for (i, candidate) in candidates.iter().enumerate() {
        let marker = if outcome.selection.contains(&candidate.symbol) { "*" } else { " " };
        println!(
            "{:<4} {:<10} {:>14.6} {:>6}{}",
            i + 1,
            candidate.symbol,
            candidate.score,
            if candidate.stale { "no" } else { "yes" },
            marker
        );
    }
    println!();
    println!("Action: {:?}", outcome.action);
    println!("Selection: {}", outcome.selection.symbols().join(", "));
    for warning in &outcome.warnings {
        println!("Warning: {}", warning);
    }

    Ok(())
}

/// Paper trade on the configured schedule until Ctrl-C.
async fn run_paper(config: Config, data_path: &str, initial_cash: Option<f64>) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║       Momentum Rotator v{} - Paper Trading              ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    log_config(&config);

    let loader = Arc::new(load_bars(data_path)?);
    let (_, data_end) = loader.available_range().context("No bars loaded")?;
    let latest = loader
        .load_snapshots(data_end, data_end)?
        .into_iter()
        .next()
        .context("No bars at the end of the data range")?;

    let cash = cash_or_default(initial_cash, &config);
    let broker = Arc::new(PaperBroker::new(cash).with_fee_rate(config.paper.fee_rate));
    broker.set_prices(latest.prices()).await;
    info!("💰 Paper account: ${:.2}, {} marks", cash, latest.bars.len());

    let schedule = Schedule::from_config(&config.schedule);
    let history: Arc<dyn HistoryProvider> = loader.clone();
    let engine = Arc::new(RotationEngine::new(config, broker.clone()).with_history(history));

    let applied = engine.warm_up(Utc::now()).await?;
    if applied == 0 {
        warn!("⚠️  No warm-up bars applied - cycles will report warming up");
    }

    // Shutdown signal
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    if let Some(next) = schedule.next_after(Utc::now()) {
        info!("🚀 Next cycle at {}", next.format("%Y-%m-%d %H:%M UTC"));
    }

    let scheduler = tokio::spawn(run_scheduled(engine.clone(), schedule, shutdown.clone()));

    let mut last_status_log = Utc::now();
    while !shutdown.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_secs(1)).await;

        if Utc::now() - last_status_log >= chrono::Duration::minutes(15) {
            let state = broker.get_state().await;
            info!(
                equity = %broker.equity().await,
                cash = %state.cash,
                positions = state.positions.len(),
                fees = %state.total_fees,
                selected = ?engine.previous_selection().await.symbols(),
                alerts = engine.active_alerts().await.len(),
                "📊 Status"
            );
            last_status_log = Utc::now();
        }
    }

    scheduler.await.ok();

    let state = broker.get_state().await;
    info!(
        "👋 Momentum Rotator shutdown complete. Equity ${:.2}, fills {}",
        broker.equity().await,
        state.fill_count
    );
    Ok(())
}
