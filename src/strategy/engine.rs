//! The rotation engine: one configuration, one scheduled cycle.
//!
//! A momentum cycle ranks the score book, selects the top K, reconciles the
//! selection against holdings and executes the targets. A dual thrust cycle arms
//! the session's breakout triggers; trades then follow bars through
//! [`RotationEngine::on_bar`].
//!
//! Cycles never overlap: a cycle that starts while another is running returns a
//! [`CycleStatus::Skipped`] report without touching any state.

use super::executor::{ExecutionReport, OrderExecutor};
use super::reconciler::{HoldingsReconciler, Target};
use super::selector::{Candidate, Selection, SelectionAction, SelectionOutcome, Selector};
use super::tracker::OrderTracker;
use super::trend::DualThrustStrategy;
use crate::config::{Config, StrategyKind};
use crate::exchange::{Bar, Brokerage, HistoryProvider, Resolution};
use crate::risk::{AlertMonitor, CycleWarning, ExclusionStatus, RiskAlert};
use crate::signal::{ScoreBook, ScoreFeed};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CycleStatus {
    /// Targets computed and executed
    Completed,
    /// Previous selection kept, no orders placed
    Retained,
    /// Another cycle was in progress
    Skipped,
    /// Indicators not ready yet
    WarmingUp,
}

/// Everything one cycle decided and did.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    /// Sequence number of evaluated cycles (0 for skipped ones)
    pub cycle: u64,
    pub at: DateTime<Utc>,
    pub status: CycleStatus,
    pub action: Option<SelectionAction>,
    pub selection: Selection,
    pub targets: Vec<Target>,
    pub execution: ExecutionReport,
    pub warnings: Vec<CycleWarning>,
    pub alerts: Vec<RiskAlert>,
}

impl CycleReport {
    fn new(cycle: u64, at: DateTime<Utc>, status: CycleStatus) -> Self {
        Self {
            cycle,
            at,
            status,
            action: None,
            selection: Selection::empty(),
            targets: Vec::new(),
            execution: ExecutionReport::default(),
            warnings: Vec::new(),
            alerts: Vec::new(),
        }
    }
}

/// What readers outside the cycle see; refreshed when a cycle ends.
#[derive(Debug, Clone, Default)]
struct PublishedView {
    selection: Selection,
    live_orders: Vec<String>,
    alerts: Vec<RiskAlert>,
}

/// State touched only while the cycle guard is held.
struct CycleState {
    previous: Selection,
    tracker: OrderTracker,
    alerts: AlertMonitor,
    trend: Option<DualThrustStrategy>,
    cycles: u64,
}

/// Clears the running flag when dropped, including on unwind.
struct CycleGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> CycleGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct RotationEngine<B: Brokerage> {
    config: Config,
    broker: Arc<B>,
    history: Option<Arc<dyn HistoryProvider>>,
    selector: Selector,
    reconciler: HoldingsReconciler,
    executor: OrderExecutor,
    scores: RwLock<ScoreBook>,
    state: Mutex<CycleState>,
    view: RwLock<PublishedView>,
    running: AtomicBool,
}

impl<B: Brokerage> RotationEngine<B> {
    pub fn new(config: Config, broker: Arc<B>) -> Self {
        let scores = ScoreBook::with_universe(
            config.selection.momentum_kind,
            config.selection.lookback,
            &config.strategy.universe,
        );
        let trend = match config.strategy.kind {
            StrategyKind::DualThrust => Some(DualThrustStrategy::new(
                &config.dual_thrust,
                config.sizing.lot_size,
            )),
            StrategyKind::MomentumRotation => None,
        };

        Self {
            selector: Selector::from_config(&config.selection),
            reconciler: HoldingsReconciler::from_config(&config.sizing),
            executor: OrderExecutor::from_config(&config.execution),
            scores: RwLock::new(scores),
            state: Mutex::new(CycleState {
                previous: Selection::empty(),
                tracker: OrderTracker::new(),
                alerts: AlertMonitor::new(config.alerts.clone()),
                trend,
                cycles: 0,
            }),
            view: RwLock::new(PublishedView::default()),
            running: AtomicBool::new(false),
            history: None,
            broker,
            config,
        }
    }

    /// Attach the history source used for warm-up and dual thrust ranges.
    pub fn with_history(mut self, history: Arc<dyn HistoryProvider>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Fill the score book from history ending at `now`.
    pub async fn warm_up(&self, now: DateTime<Utc>) -> Result<usize> {
        let Some(history) = &self.history else {
            return Ok(0);
        };
        if self.config.strategy.kind != StrategyKind::MomentumRotation {
            return Ok(0);
        }

        let symbols = self.config.strategy.universe.clone();
        let bars = history
            .history(&symbols, self.config.selection.lookback + 1, Resolution::Daily, now)
            .context("Failed to load warm-up history")?;

        let applied = self.scores.write().await.warm_up(&bars);
        info!(symbols = symbols.len(), bars = applied, "Warm-up complete");
        Ok(applied)
    }

    /// Universe add/remove hooks. Removed symbols lose their indicator state and
    /// are flattened by the next cycle if held.
    pub async fn on_securities_changed(&self, added: &[String], removed: &[String]) {
        let mut scores = self.scores.write().await;
        for symbol in added {
            scores.add_symbol(symbol);
        }
        for symbol in removed {
            scores.remove_symbol(symbol);
        }
        info!(added = added.len(), removed = removed.len(), "Universe changed");
    }

    /// Feed a bar. For dual thrust, a bar on the traded symbol may trade.
    pub async fn on_bar(&self, bar: &Bar) -> Option<CycleReport> {
        self.scores.write().await.update(bar);

        if self.config.strategy.kind != StrategyKind::DualThrust
            || bar.symbol != self.config.dual_thrust.symbol
        {
            return None;
        }
        Some(self.follow_trend(bar).await)
    }

    /// Current ranking without side effects.
    pub async fn preview(&self, as_of: DateTime<Utc>) -> (Vec<Candidate>, SelectionOutcome) {
        let candidates = self.scores.read().await.candidates(as_of);
        let previous = self.view.read().await.selection.clone();
        let outcome = self.selector.select(&candidates, &previous);
        (candidates, outcome)
    }

    /// Selection held after the last finished cycle.
    pub async fn previous_selection(&self) -> Selection {
        self.view.read().await.selection.clone()
    }

    pub async fn live_orders(&self) -> Vec<String> {
        self.view.read().await.live_orders.clone()
    }

    pub async fn active_alerts(&self) -> Vec<RiskAlert> {
        self.view.read().await.alerts.clone()
    }

    async fn publish(&self, state: &CycleState) {
        *self.view.write().await = PublishedView {
            selection: state.previous.clone(),
            live_orders: state.tracker.live_symbols(),
            alerts: state.alerts.active_alerts().to_vec(),
        };
    }

    /// Run one scheduled cycle. Never fails: problems end up in the report.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let Some(_guard) = CycleGuard::try_acquire(&self.running) else {
            info!(%now, "Cycle already in progress - skipping");
            return CycleReport::new(0, now, CycleStatus::Skipped);
        };

        let mut state = self.state.lock().await;
        let report = match self.config.strategy.kind {
            StrategyKind::MomentumRotation => self.rotate(now, &mut state).await,
            StrategyKind::DualThrust => self.arm_trend(now, &mut state).await,
        };
        self.publish(&state).await;
        report
    }

    async fn rotate(&self, now: DateTime<Utc>, state: &mut CycleState) -> CycleReport {
        let universe = {
            let scores = self.scores.read().await;
            if scores.is_warming_up() {
                debug!(%now, "Score book warming up - no cycle");
                return CycleReport::new(state.cycles, now, CycleStatus::WarmingUp);
            }
            scores.symbols()
        };

        // Only symbols the brokerage can price are tradable this cycle
        let quoted = self.prices(&universe.iter().collect::<Vec<_>>()).await;
        let candidates = {
            let mut scores = self.scores.write().await;
            for symbol in &universe {
                let tradable = quoted.get(symbol).is_some_and(|p| *p > Decimal::ZERO);
                scores.set_tradable(symbol, tradable);
            }
            let candidates = scores.candidates(now);
            scores.mark_evaluated(now);
            candidates
        };

        state.cycles += 1;
        let mut report = CycleReport::new(state.cycles, now, CycleStatus::Completed);

        self.executor.refresh(self.broker.as_ref(), &mut state.tracker).await;

        let outcome = self.selector.select(&candidates, &state.previous);
        for warning in &outcome.warnings {
            warning.log();
        }
        report.warnings.extend(outcome.warnings);

        let (selection, action) = if outcome.all_excluded {
            match state.alerts.record_all_excluded(candidates.len(), now) {
                ExclusionStatus::Tolerated { streak } => {
                    info!(streak, "All candidates excluded - holding previous selection");
                    (outcome.selection, SelectionAction::Retain)
                }
                ExclusionStatus::Breached { streak, alert } => {
                    warn!(streak, "Exclusion streak over threshold - flattening");
                    report.warnings.push(CycleWarning::AllCandidatesExcluded {
                        candidates: candidates.len(),
                        cycles: streak,
                    });
                    report.alerts.extend(alert);
                    (Selection::empty(), SelectionAction::FlattenAll)
                }
            }
        } else {
            state.alerts.reset_exclusion();
            (outcome.selection, outcome.action)
        };

        report.action = Some(action);
        report.selection = selection.clone();

        if action == SelectionAction::Retain {
            report.status = CycleStatus::Retained;
            return report;
        }

        // Working orders on deselected symbols must not fill behind the new plan
        let selected = selection.symbols();
        let cancel_warnings = self
            .executor
            .cancel_outside(self.broker.as_ref(), &mut state.tracker, &selected)
            .await;
        for warning in cancel_warnings {
            if let Some(alert) = state.alerts.record_order_failure(&warning, now) {
                report.alerts.push(alert);
            }
            report.warnings.push(warning);
        }

        let (holdings, cash) = match self.portfolio_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let warning = CycleWarning::BrokerageUnavailable {
                    reason: format!("{:#}", e),
                };
                warning.log();
                report.warnings.push(warning);
                report.status = CycleStatus::Retained;
                report.selection = state.previous.clone();
                return report;
            }
        };

        let live = state.tracker.live_symbols();
        let mut symbols: Vec<&String> = holdings.keys().collect();
        symbols.extend(selected.iter());
        symbols.extend(live.iter());
        let prices = self.prices(&symbols).await;

        let committed = committed_cash(&state.tracker, &holdings, &prices, &selection);
        if committed > Decimal::ZERO {
            debug!(%committed, "Cash reserved for working buy orders");
        }
        let available = (cash - committed).max(Decimal::ZERO);

        let plan = self.reconciler.reconcile(&holdings, available, &prices, &selection);
        for warning in &plan.warnings {
            warning.log();
        }
        report.warnings.extend(plan.warnings.iter().cloned());

        let execution = self
            .executor
            .execute(self.broker.as_ref(), &mut state.tracker, &plan.targets)
            .await;
        self.record_execution(state, &execution, now, &mut report);

        info!(
            cycle = state.cycles,
            selected = ?selection.symbols(),
            flatten = plan.flatten_count(),
            acquire = plan.acquire_count(),
            submitted = execution.submitted(),
            failed = execution.failed(),
            "Rebalance cycle complete"
        );

        report.targets = plan.targets;
        report.execution = execution;
        state.previous = selection;
        report
    }

    async fn arm_trend(&self, now: DateTime<Utc>, state: &mut CycleState) -> CycleReport {
        state.cycles += 1;
        let mut report = CycleReport::new(state.cycles, now, CycleStatus::Completed);

        let Some(trend) = state.trend.as_mut() else {
            return report;
        };
        let symbol = trend.symbol().to_string();

        let daily = match &self.history {
            Some(history) => {
                match history.history(
                    std::slice::from_ref(&symbol),
                    trend.lookback_days(),
                    Resolution::Daily,
                    now,
                ) {
                    Ok(bars) => bars,
                    Err(e) => {
                        warn!(%symbol, error = %e, "Failed to load daily history");
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        let open = self.broker.last_price(&symbol).await.ok().flatten();
        match open {
            Some(open) if !daily.is_empty() => {
                trend.arm(&daily, open, now);
            }
            _ => {
                let warning = CycleWarning::DataStaleness {
                    symbol: symbol.clone(),
                };
                warning.log();
                report.warnings.push(warning);
                report.status = CycleStatus::WarmingUp;
            }
        }

        report
    }

    async fn follow_trend(&self, bar: &Bar) -> CycleReport {
        let Some(_guard) = CycleGuard::try_acquire(&self.running) else {
            return CycleReport::new(0, bar.timestamp, CycleStatus::Skipped);
        };
        let mut state = self.state.lock().await;
        let report = self.trade_trend(bar, &mut state).await;
        self.publish(&state).await;
        report
    }

    async fn trade_trend(&self, bar: &Bar, state: &mut CycleState) -> CycleReport {
        let now = bar.timestamp;
        let cycle = state.cycles;

        let target = {
            let Some(trend) = state.trend.as_ref() else {
                return CycleReport::new(cycle, now, CycleStatus::Retained);
            };
            if trend.triggers().is_none() {
                return CycleReport::new(cycle, now, CycleStatus::WarmingUp);
            }

            let (holdings, cash) = match self.portfolio_snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    let mut report = CycleReport::new(cycle, now, CycleStatus::Retained);
                    report.warnings.push(CycleWarning::BrokerageUnavailable {
                        reason: format!("{:#}", e),
                    });
                    return report;
                }
            };
            let symbols: Vec<&String> = holdings.keys().collect();
            let prices = self.prices(&symbols).await;
            let equity = cash
                + holdings
                    .iter()
                    .filter_map(|(s, q)| prices.get(s).map(|p| *q * *p))
                    .sum::<Decimal>();
            let current = holdings.get(trend.symbol()).copied().unwrap_or(Decimal::ZERO);

            trend.analyze(bar.close, equity, current)
        };

        let Some(target) = target else {
            return CycleReport::new(cycle, now, CycleStatus::Retained);
        };

        let mut report = CycleReport::new(cycle, now, CycleStatus::Completed);
        let execution = self
            .executor
            .execute(self.broker.as_ref(), &mut state.tracker, std::slice::from_ref(&target))
            .await;
        self.record_execution(state, &execution, now, &mut report);
        report.targets = vec![target];
        report.execution = execution;
        report
    }

    fn record_execution(
        &self,
        state: &mut CycleState,
        execution: &ExecutionReport,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        for result in execution.results.iter().filter(|r| r.success) {
            state.alerts.record_order_success(&result.symbol);
        }
        for warning in &execution.warnings {
            if let Some(alert) = state.alerts.record_order_failure(warning, now) {
                report.alerts.push(alert);
            }
        }
        report.warnings.extend(execution.warnings.iter().cloned());
    }

    async fn portfolio_snapshot(&self) -> Result<(HashMap<String, Decimal>, Decimal)> {
        let holdings = self
            .broker
            .holdings()
            .await
            .context("Failed to read holdings")?;
        let cash = self.broker.cash().await.context("Failed to read cash")?;
        Ok((holdings, cash))
    }

    async fn prices(&self, symbols: &[&String]) -> HashMap<String, Decimal> {
        let mut prices = HashMap::new();
        for symbol in symbols {
            if prices.contains_key(*symbol) {
                continue;
            }
            match self.broker.last_price(symbol).await {
                Ok(Some(price)) => {
                    prices.insert((*symbol).clone(), price);
                }
                Ok(None) => debug!(%symbol, "No last price"),
                Err(e) => warn!(%symbol, error = %e, "Failed to read last price"),
            }
        }
        prices
    }
}

/// Cash still owed to working buy orders that this cycle's plan keeps alive.
///
/// A selected symbol with no holding gets an acquire target whose submission
/// cancels the working order first, so that order is not counted.
fn committed_cash(
    tracker: &OrderTracker,
    holdings: &HashMap<String, Decimal>,
    prices: &HashMap<String, Decimal>,
    selection: &Selection,
) -> Decimal {
    tracker
        .live_symbols()
        .iter()
        .filter(|symbol| {
            let held = holdings.get(*symbol).is_some_and(|q| *q != Decimal::ZERO);
            held || !selection.contains(symbol)
        })
        .filter_map(|symbol| {
            let record = tracker.live_order(symbol)?;
            let remaining = record.submitted_quantity - record.filled_quantity;
            let price = prices.get(symbol)?;
            (remaining > Decimal::ZERO).then(|| remaining * *price)
        })
        .sum()
}
