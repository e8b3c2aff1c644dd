//! Backtesting on historical bars.
//!
//! This module provides:
//! - CSV bar loading, which doubles as the warm-up history source
//! - A replay engine driving the rotation engine against a paper broker
//! - Performance metrics calculation
//!
//! # Example
//!
//! ```rust,ignore
//! use momentum_rotator::backtest::{BacktestConfig, BacktestEngine, CsvBarLoader};
//!
//! let loader = CsvBarLoader::new("data/daily_bars.csv")?;
//! let engine = BacktestEngine::new(loader, Config::load()?, BacktestConfig::default());
//!
//! let result = engine.run(start, end).await?;
//! println!("Return: {:.2}%", result.metrics.total_return_pct);
//! ```

mod data;
mod engine;
mod metrics;

pub use data::{BarSnapshot, CsvBarLoader, DataLoader};
pub use engine::{BacktestEngine, BacktestResult};
pub use metrics::{ActivityStats, BacktestMetrics, EquityPoint};

use crate::config::PaperConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Configuration for a backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// Initial capital for the backtest
    pub initial_cash: Decimal,

    /// Fee rate applied to fill notional
    pub fee_rate: Decimal,

    /// Whether to return every equity point (can use lots of memory)
    pub record_equity_curve: bool,

    /// Path to output results (optional)
    pub output_path: Option<String>,
}

impl BacktestConfig {
    pub fn from_paper(paper: &PaperConfig) -> Self {
        Self {
            initial_cash: paper.initial_cash,
            fee_rate: paper.fee_rate,
            ..Self::default()
        }
    }
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_cash: Decimal::new(10000, 0), // $10,000
            fee_rate: Decimal::new(1, 3),         // 0.1%
            record_equity_curve: true,
            output_path: None,
        }
    }
}
