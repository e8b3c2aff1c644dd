//! Configuration management for the momentum rotator.
//!
//! Loads settings from an optional `config` file and `MROT__*` environment
//! variables. One configuration describes one strategy; the thresholds, lookbacks,
//! universe and cadence that used to be hard-coded per strategy variant all live here.

use anyhow::{Context, Result};
use chrono::NaiveTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Which strategy to run and over which instruments
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Ranking and top-K selection
    #[serde(default)]
    pub selection: SelectionConfig,
    /// Position sizing for acquire targets
    #[serde(default)]
    pub sizing: SizingConfig,
    /// Order execution and cancel-replace timing
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// When rebalance cycles fire
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Alert thresholds
    #[serde(default)]
    pub alerts: AlertConfig,
    /// Dual thrust trend strategy parameters
    #[serde(default)]
    pub dual_thrust: DualThrustConfig,
    /// Paper brokerage parameters
    #[serde(default)]
    pub paper: PaperConfig,
}

/// Strategy family interpreted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Hold the top-K instruments by momentum, rotating on each cycle
    MomentumRotation,
    /// Long/short a single instrument on dual thrust range breakouts
    DualThrust,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::MomentumRotation => write!(f, "momentum_rotation"),
            StrategyKind::DualThrust => write!(f, "dual_thrust"),
        }
    }
}

/// What to do when fewer than K candidates qualify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegeneratePolicy {
    /// Select the qualifying candidates only
    Shrink,
    /// Keep the previous selection and place no orders
    Abort,
    /// Select nothing and flatten every holding
    Liquidate,
}

impl fmt::Display for DegeneratePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegeneratePolicy::Shrink => write!(f, "shrink"),
            DegeneratePolicy::Abort => write!(f, "abort"),
            DegeneratePolicy::Liquidate => write!(f, "liquidate"),
        }
    }
}

/// Momentum score formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MomentumKind {
    /// close / close[lookback] - 1
    Percent,
    /// close - close[lookback]
    Difference,
}

/// Calendar rule selecting the days a cycle may fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateRule {
    /// Every weekday
    EveryDay,
    /// First weekday of each ISO week
    WeekStart,
    /// First weekday of each month
    MonthStart,
}

/// Session boundary a time rule is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeAnchor {
    /// `offset_minutes` after the open
    AfterMarketOpen,
    /// `offset_minutes` before the close
    BeforeMarketClose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_strategy_kind")]
    pub kind: StrategyKind,
    /// Instruments eligible for selection
    #[serde(default = "default_universe")]
    pub universe: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Number of instruments to hold (K)
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Momentum lookback in bars
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    #[serde(default = "default_momentum_kind")]
    pub momentum_kind: MomentumKind,
    /// Behaviour when fewer than K candidates qualify
    #[serde(default = "default_degenerate_policy")]
    pub degenerate_policy: DegeneratePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Cash reserved for fees per order emitted in a cycle
    #[serde(default = "default_fee_buffer_per_order")]
    pub fee_buffer_per_order: Decimal,
    /// Quantity increment (1 = whole shares)
    #[serde(default = "default_lot_size")]
    pub lot_size: Decimal,
    /// Drop the lowest-ranked acquire slot and resize when a slot is unfunded
    #[serde(default)]
    pub shrink_on_unfunded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Upper bound on waiting for a cancel to reach a terminal state
    #[serde(default = "default_cancel_timeout_ms")]
    pub cancel_timeout_ms: u64,
    /// Sleep between order status polls while waiting
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consecutive failed status/cancel calls before an order is dropped from tracking
    #[serde(default = "default_max_status_failures")]
    pub max_status_failures: u32,
}

impl ExecutionConfig {
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_date_rule")]
    pub date_rule: DateRule,
    #[serde(default = "default_time_anchor")]
    pub time_anchor: TimeAnchor,
    #[serde(default)]
    pub offset_minutes: u32,
    /// Session open (UTC)
    #[serde(default = "default_market_open")]
    pub market_open: NaiveTime,
    /// Session close (UTC)
    #[serde(default = "default_market_close")]
    pub market_close: NaiveTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Consecutive cycles with every candidate excluded before flattening
    #[serde(default = "default_exclusion_threshold")]
    pub exclusion_threshold: u32,
    /// Consecutive order failures per symbol before an error alert
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualThrustConfig {
    #[serde(default = "default_dual_thrust_symbol")]
    pub symbol: String,
    /// Sell trigger multiplier
    #[serde(default = "default_k")]
    pub k1: Decimal,
    /// Buy trigger multiplier
    #[serde(default = "default_k")]
    pub k2: Decimal,
    /// Daily bars used for the range
    #[serde(default = "default_range_lookback")]
    pub lookback_days: usize,
    /// Fraction of equity held long or short
    #[serde(default = "default_target_weight")]
    pub target_weight: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_initial_cash")]
    pub initial_cash: Decimal,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
}

// Default value functions
fn default_strategy_kind() -> StrategyKind {
    StrategyKind::MomentumRotation
}

fn default_universe() -> Vec<String> {
    [
        "AMZN", "NFLX", "NVDA", "MSFT", "BA", "CSCO", "AAPL", "V", "HD", "UNH", "BAC", "JPM",
        "GOOGL", "INTC", "PFE", "WMT", "BRKB", "VZ", "DIS", "WFC", "JNJ", "XOM", "CVX", "C",
        "CMCSA", "META", "ORCL", "T", "BABA", "TSLA", "IVV",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_top_k() -> usize {
    9
}

fn default_lookback() -> usize {
    6 * 21 // six trading months
}

fn default_momentum_kind() -> MomentumKind {
    MomentumKind::Percent
}

fn default_degenerate_policy() -> DegeneratePolicy {
    DegeneratePolicy::Abort
}

fn default_fee_buffer_per_order() -> Decimal {
    Decimal::new(5, 0) // $5 per order
}

fn default_lot_size() -> Decimal {
    Decimal::ONE
}

fn default_cancel_timeout_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_max_status_failures() -> u32 {
    3
}

fn default_date_rule() -> DateRule {
    DateRule::EveryDay
}

fn default_time_anchor() -> TimeAnchor {
    TimeAnchor::AfterMarketOpen
}

fn default_market_open() -> NaiveTime {
    NaiveTime::from_hms_opt(14, 30, 0).unwrap_or(NaiveTime::MIN) // 09:30 New York
}

fn default_market_close() -> NaiveTime {
    NaiveTime::from_hms_opt(21, 0, 0).unwrap_or(NaiveTime::MIN) // 16:00 New York
}

fn default_exclusion_threshold() -> u32 {
    3
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_dual_thrust_symbol() -> String {
    "NFLX".to_string()
}

fn default_k() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_range_lookback() -> usize {
    4
}

fn default_target_weight() -> Decimal {
    Decimal::new(8, 1) // 0.8
}

fn default_initial_cash() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_fee_rate() -> Decimal {
    Decimal::new(1, 3) // 0.1%
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("MROT")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("strategy.universe")
                    .try_parsing(true),
            );

        Self::from_builder(builder)
    }

    /// Build, deserialize and validate a layered configuration.
    pub fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let config: Self = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.selection.top_k >= 1, "top_k must be at least 1");

        anyhow::ensure!(self.selection.lookback >= 1, "lookback must be at least 1");

        if self.strategy.kind == StrategyKind::MomentumRotation {
            anyhow::ensure!(
                !self.strategy.universe.is_empty(),
                "universe must not be empty for momentum rotation"
            );
        }

        anyhow::ensure!(
            self.sizing.fee_buffer_per_order >= Decimal::ZERO,
            "fee_buffer_per_order must not be negative"
        );

        anyhow::ensure!(
            self.sizing.lot_size > Decimal::ZERO,
            "lot_size must be positive"
        );

        anyhow::ensure!(
            self.execution.poll_interval_ms > 0
                && self.execution.poll_interval_ms <= self.execution.cancel_timeout_ms,
            "poll_interval_ms must be > 0 and <= cancel_timeout_ms"
        );

        anyhow::ensure!(
            self.execution.max_status_failures >= 1,
            "max_status_failures must be at least 1"
        );

        anyhow::ensure!(
            self.schedule.market_open < self.schedule.market_close,
            "market_open must be before market_close"
        );

        anyhow::ensure!(
            self.alerts.exclusion_threshold >= 1,
            "exclusion_threshold must be at least 1"
        );

        anyhow::ensure!(
            self.dual_thrust.k1 > Decimal::ZERO && self.dual_thrust.k2 > Decimal::ZERO,
            "dual thrust k1/k2 must be positive"
        );

        anyhow::ensure!(
            self.dual_thrust.target_weight > Decimal::ZERO
                && self.dual_thrust.target_weight <= Decimal::ONE,
            "target_weight must be between 0 and 1"
        );

        anyhow::ensure!(
            self.dual_thrust.lookback_days >= 1,
            "lookback_days must be at least 1"
        );

        anyhow::ensure!(
            self.paper.initial_cash > Decimal::ZERO,
            "initial_cash must be positive"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strategy: StrategyConfig::default(),
            selection: SelectionConfig::default(),
            sizing: SizingConfig::default(),
            execution: ExecutionConfig::default(),
            schedule: ScheduleConfig::default(),
            alerts: AlertConfig::default(),
            dual_thrust: DualThrustConfig::default(),
            paper: PaperConfig::default(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: default_strategy_kind(),
            universe: default_universe(),
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            lookback: default_lookback(),
            momentum_kind: default_momentum_kind(),
            degenerate_policy: default_degenerate_policy(),
        }
    }
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            fee_buffer_per_order: default_fee_buffer_per_order(),
            lot_size: default_lot_size(),
            shrink_on_unfunded: false,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            cancel_timeout_ms: default_cancel_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_status_failures: default_max_status_failures(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            date_rule: default_date_rule(),
            time_anchor: default_time_anchor(),
            offset_minutes: 0,
            market_open: default_market_open(),
            market_close: default_market_close(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            exclusion_threshold: default_exclusion_threshold(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl Default for DualThrustConfig {
    fn default() -> Self {
        Self {
            symbol: default_dual_thrust_symbol(),
            k1: default_k(),
            k2: default_k(),
            lookback_days: default_range_lookback(),
            target_weight: default_target_weight(),
        }
    }
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_cash: default_initial_cash(),
            fee_rate: default_fee_rate(),
        }
    }
}
