//! Backtesting simulation engine.
//!
//! Replays historical bars through a [`RotationEngine`] backed by a
//! [`PaperBroker`]. Schedule fires that fall strictly between two snapshots run
//! before the later snapshot's bars are applied, so a cycle only sees data that
//! existed at its fire time.

use crate::backtest::metrics::{ActivityStats, BacktestMetrics, EquityPoint};
use crate::backtest::{BacktestConfig, BarSnapshot, DataLoader};
use crate::config::Config;
use crate::exchange::{HistoryProvider, PaperBroker};
use crate::schedule::Schedule;
use crate::strategy::{CycleReport, CycleStatus, RotationEngine};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Complete result of a backtest run.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestResult {
    pub backtest_config: BacktestConfig,
    pub metrics: BacktestMetrics,
    pub equity_curve: Vec<EquityPoint>,
    /// Reports of every scheduled cycle, in fire order
    pub cycles: Vec<CycleReport>,
    pub final_holdings: HashMap<String, Decimal>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub snapshots_processed: usize,
}

impl BacktestResult {
    /// Export equity curve to CSV.
    pub fn equity_to_csv(&self, path: &str) -> Result<()> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path))?;
        writeln!(file, "timestamp,cash,holdings_value,total_equity,drawdown,positions")?;

        for point in &self.equity_curve {
            writeln!(
                file,
                "{},{},{},{},{},{}",
                point.timestamp.to_rfc3339(),
                point.cash,
                point.holdings_value,
                point.total_equity,
                point.drawdown,
                point.position_count,
            )?;
        }

        Ok(())
    }

    /// Write the cycle reports as pretty JSON.
    pub fn cycles_to_json(&self, path: &str) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.cycles)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path))?;
        Ok(())
    }

    /// Get a summary string.
    pub fn summary(&self) -> String {
        let mut holdings: Vec<_> = self.final_holdings.iter().collect();
        holdings.sort_by(|a, b| a.0.cmp(b.0));
        let holdings = holdings
            .iter()
            .map(|(s, q)| format!("{} {}", s, q))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "{}\n\nBacktest Period: {} to {}\nSnapshots: {}\nFinal Holdings: {}",
            self.metrics.summary(),
            self.start_time.format("%Y-%m-%d"),
            self.end_time.format("%Y-%m-%d"),
            self.snapshots_processed,
            if holdings.is_empty() { "none".to_string() } else { holdings },
        )
    }
}

/// The backtesting simulation engine.
pub struct BacktestEngine<D>
where
    D: DataLoader + HistoryProvider + 'static,
{
    data: Arc<D>,
    config: Config,
    backtest_config: BacktestConfig,
    schedule: Schedule,
}

impl<D> BacktestEngine<D>
where
    D: DataLoader + HistoryProvider + 'static,
{
    pub fn new(data: D, config: Config, backtest_config: BacktestConfig) -> Self {
        let schedule = Schedule::from_config(&config.schedule);
        Self {
            data: Arc::new(data),
            config,
            backtest_config,
            schedule,
        }
    }

    pub fn backtest_config(&self) -> &BacktestConfig {
        &self.backtest_config
    }

    /// Run the backtest from start to end time.
    pub async fn run(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<BacktestResult> {
        info!(
            "Starting backtest from {} to {}",
            start.format("%Y-%m-%d %H:%M"),
            end.format("%Y-%m-%d %H:%M")
        );

        let snapshots = self.data.load_snapshots(start, end)?;
        let Some(first) = snapshots.first() else {
            anyhow::bail!("No data available for the specified time range");
        };
        info!("Loaded {} snapshots", snapshots.len());

        let broker = Arc::new(
            PaperBroker::new(self.backtest_config.initial_cash)
                .with_fee_rate(self.backtest_config.fee_rate),
        );
        let history: Arc<dyn HistoryProvider> = self.data.clone();
        let engine = RotationEngine::new(self.config.clone(), broker.clone()).with_history(history);

        // Bars before the first snapshot prime the indicators
        engine.warm_up(first.timestamp).await?;

        let mut replay = Replay {
            engine: &engine,
            broker: broker.as_ref(),
            activity: ActivityStats::default(),
            cycles: Vec::new(),
            equity_curve: Vec::with_capacity(snapshots.len()),
            equity: self.backtest_config.initial_cash,
            peak_equity: self.backtest_config.initial_cash,
        };

        let mut cursor = first.timestamp;
        for (i, snapshot) in snapshots.iter().enumerate() {
            let fires = self.schedule.fires_between(cursor, snapshot.timestamp);
            let (due_before, due_at): (Vec<_>, Vec<_>) =
                fires.into_iter().partition(|f| *f < snapshot.timestamp);

            for fire in due_before {
                replay.cycle(fire).await;
            }
            replay.apply(snapshot).await;
            for fire in due_at {
                replay.cycle(fire).await;
            }
            replay.mark(snapshot.timestamp).await;
            cursor = snapshot.timestamp;

            if i % 100 == 0 {
                debug!(
                    "Progress: {}/{} ({:.1}%), Equity: ${:.2}",
                    i,
                    snapshots.len(),
                    (i as f64 / snapshots.len() as f64) * 100.0,
                    replay.equity
                );
            }
        }

        let final_state = broker.get_state().await;
        replay.activity.total_fees = final_state.total_fees;
        replay.activity.orders_submitted = final_state.orders.len() as u64;
        replay.activity.fills = final_state.fill_count;

        let metrics = BacktestMetrics::calculate(
            &replay.equity_curve,
            self.backtest_config.initial_cash,
            replay.activity,
        );

        let final_holdings = final_state
            .positions
            .values()
            .filter(|p| p.quantity != Decimal::ZERO)
            .map(|p| (p.symbol.clone(), p.quantity))
            .collect();

        info!("Backtest complete. Final equity: ${:.2}", broker.equity().await);

        Ok(BacktestResult {
            backtest_config: self.backtest_config.clone(),
            metrics,
            equity_curve: if self.backtest_config.record_equity_curve {
                replay.equity_curve
            } else {
                Vec::new()
            },
            cycles: replay.cycles,
            final_holdings,
            start_time: start,
            end_time: end,
            snapshots_processed: snapshots.len(),
        })
    }
}

/// Mutable bookkeeping of one run.
struct Replay<'a> {
    engine: &'a RotationEngine<PaperBroker>,
    broker: &'a PaperBroker,
    activity: ActivityStats,
    cycles: Vec<CycleReport>,
    equity_curve: Vec<EquityPoint>,
    /// Equity at the last mark
    equity: Decimal,
    peak_equity: Decimal,
}

impl Replay<'_> {
    async fn apply(&mut self, snapshot: &BarSnapshot) {
        self.broker.set_clock(snapshot.timestamp).await;
        self.broker.set_prices(snapshot.prices()).await;

        for bar in &snapshot.bars {
            if let Some(report) = self.engine.on_bar(bar).await {
                self.activity.alerts_raised += report.alerts.len() as u64;
            }
        }
    }

    async fn cycle(&mut self, at: DateTime<Utc>) {
        self.broker.set_clock(at).await;
        let report = self.engine.run_cycle(at).await;

        match report.status {
            CycleStatus::Completed => self.activity.cycles_completed += 1,
            CycleStatus::Retained => self.activity.cycles_retained += 1,
            CycleStatus::Skipped => self.activity.cycles_skipped += 1,
            CycleStatus::WarmingUp => self.activity.cycles_warming_up += 1,
        }
        self.activity.alerts_raised += report.alerts.len() as u64;

        debug!(
            cycle = report.cycle,
            %at,
            status = ?report.status,
            selected = ?report.selection.symbols(),
            "Backtest cycle"
        );
        self.cycles.push(report);
    }

    async fn mark(&mut self, at: DateTime<Utc>) {
        let state = self.broker.get_state().await;
        let equity = self.broker.equity().await;
        let positions = state
            .positions
            .values()
            .filter(|p| p.quantity != Decimal::ZERO)
            .count();

        self.equity = equity;
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        self.equity_curve.push(EquityPoint::new(
            at,
            state.cash,
            equity - state.cash,
            positions,
            self.peak_equity,
        ));
    }
}
